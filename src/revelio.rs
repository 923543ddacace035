//! Access to the Revelio tables on WRDS.
//!
//! Everything the pipeline needs from the database goes through
//! [`ProfileSource`] and [`NameDirectory`]; [`RevelioClient`] implements both
//! over a PostgreSQL pool. All values are bound as parameters; only table
//! names (validated in `config`) are interpolated.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{ConnectOptions, Row};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{MatchingConfig, RevelioTables, WrdsConfig};

/// Lower-cased name forms to look up.
#[derive(Debug, Clone, PartialEq)]
pub struct NameQuery {
    pub fullnames: Vec<String>,
    pub first_name: String,
    pub surname: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileCandidate {
    pub user_id: String,
    pub fullname: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub predicted_gender: Option<String>,
    pub predicted_ethnicity: Option<String>,
    pub location: Option<String>,
    pub n_connection: Option<i64>,
    pub prestige_score: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionRecord {
    pub user_id: String,
    pub rcid: Option<String>,
    pub company_name: Option<String>,
    pub title: Option<String>,
    pub role: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub is_current: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EducationRecord {
    pub user_id: String,
    pub school: Option<String>,
    pub degree: Option<String>,
    pub field_of_study: Option<String>,
    pub end_year: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SkillRecord {
    pub user_id: String,
    pub skill: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompanyCandidate {
    pub rcid: String,
    pub company_name: Option<String>,
    pub company_name_clean: Option<String>,
    pub ultimate_parent_rcid: Option<String>,
    pub ultimate_parent_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NameRow {
    pub user_id: String,
    pub fullname: String,
}

#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn find_profiles(&self, query: &NameQuery) -> Result<Vec<ProfileCandidate>>;

    /// Executive positions of all given users, newest first.
    async fn executive_positions(&self, user_ids: &[String]) -> Result<Vec<PositionRecord>>;

    async fn education(&self, user_ids: &[String]) -> Result<Vec<EducationRecord>>;

    async fn skills(&self, user_ids: &[String]) -> Result<Vec<SkillRecord>>;

    /// `company` is already normalized (lower case, no legal suffixes).
    async fn company_candidates(&self, company: &str) -> Result<Vec<CompanyCandidate>>;
}

#[async_trait]
pub trait NameDirectory: Send + Sync {
    /// One page of distinct (user_id, fullname) pairs ordered by user id.
    async fn name_page(&self, limit: i64, offset: i64) -> Result<Vec<NameRow>>;
}

pub struct RevelioClient {
    pool: PgPool,
    tables: RevelioTables,
    matching: MatchingConfig,
}

impl RevelioClient {
    pub async fn connect(
        wrds: &WrdsConfig,
        tables: &RevelioTables,
        matching: &MatchingConfig,
    ) -> Result<Self> {
        info!(
            "Connecting to WRDS as {} ({}:{}/{})",
            wrds.username, wrds.host, wrds.port, wrds.database
        );

        // from_str picks up ~/.pgpass for the final host/user
        let url = format!(
            "postgres://{}@{}:{}/{}",
            wrds.username, wrds.host, wrds.port, wrds.database
        );
        let mut options = PgConnectOptions::from_str(&url)
            .context("Invalid WRDS connection settings")?
            .ssl_mode(PgSslMode::Require)
            .application_name("revelio_extractor")
            .log_statements(log::LevelFilter::Debug)
            .log_slow_statements(log::LevelFilter::Warn, Duration::from_secs(30));
        if let Ok(password) = std::env::var("PGPASSWORD") {
            options = options.password(&password);
        }

        let pool = PgPoolOptions::new()
            .max_connections(wrds.max_connections)
            .acquire_timeout(Duration::from_secs(wrds.connect_timeout_secs))
            .connect_with(options)
            .await
            .context("Failed to connect to WRDS (run wrds-pgpass-create or set PGPASSWORD)")?;

        Ok(Self {
            pool,
            tables: tables.clone(),
            matching: matching.clone(),
        })
    }

    /// Cheap probe that the Revelio schema is reachable.
    pub async fn ping(&self) -> Result<()> {
        let query = format!("SELECT 1 FROM {} LIMIT 1", self.tables.individual_user);
        sqlx::query(&query)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("Failed to query {}", self.tables.individual_user))?;
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    fn id_cast(&self) -> &str {
        &self.tables.user_id_type
    }
}

/// Candidates by name, best known profiles first so the cap keeps the same
/// rows on every run.
fn profile_match_sql(individual_user: &str) -> String {
    format!(
        r#"
        SELECT DISTINCT
            iu.user_id::text AS user_id,
            iu.fullname::text AS fullname,
            iu.first_name::text AS first_name,
            iu.last_name::text AS last_name,
            iu.predicted_gender::text AS predicted_gender,
            iu.predicted_ethnicity::text AS predicted_ethnicity,
            iu.location::text AS location,
            iu.n_connection::bigint AS n_connection,
            iu.prestige_score::float8 AS prestige_score
        FROM {individual_user} iu
        WHERE LOWER(iu.fullname) = ANY($1)
           OR (LOWER(iu.first_name) = $2 AND LOWER(iu.last_name) = $3)
        ORDER BY prestige_score DESC NULLS LAST, n_connection DESC NULLS LAST, user_id
        LIMIT $4
        "#
    )
}

/// Shortest clean names first: those are the closest to the roster company.
fn company_match_sql(company_mapping: &str, company: &str) -> String {
    format!(
        r#"
        SELECT
            cm.rcid::text AS rcid,
            cm.company_name::text AS company_name,
            cm.company_name_clean::text AS company_name_clean,
            c.ultimate_parent_rcid::text AS ultimate_parent_rcid,
            c.ultimate_parent_name::text AS ultimate_parent_name
        FROM {company_mapping} cm
        LEFT JOIN {company} c ON cm.rcid = c.rcid
        WHERE LOWER(cm.company_name_clean) LIKE $1
        ORDER BY LENGTH(cm.company_name_clean), cm.rcid::text
        LIMIT $2
        "#
    )
}

fn warn_if_capped(rows: usize, limit: i64, what: &(impl std::fmt::Debug + ?Sized)) {
    if rows as i64 >= limit {
        warn!("Lookup for {:?} hit the limit of {} rows; lower ranked rows were cut", what, limit);
    }
}

fn text(row: &PgRow, column: &str) -> Result<Option<String>> {
    row.try_get::<Option<String>, _>(column)
        .with_context(|| format!("Failed to decode column {}", column))
}

fn required_text(row: &PgRow, column: &str) -> Result<String> {
    Ok(text(row, column)?.unwrap_or_default())
}

fn parse_flag(value: Option<String>) -> Option<bool> {
    match value?.to_lowercase().as_str() {
        "true" | "t" | "1" | "yes" => Some(true),
        "false" | "f" | "0" | "no" => Some(false),
        _ => None,
    }
}

#[async_trait]
impl ProfileSource for RevelioClient {
    async fn find_profiles(&self, query: &NameQuery) -> Result<Vec<ProfileCandidate>> {
        let sql = profile_match_sql(&self.tables.individual_user);

        let rows = sqlx::query(&sql)
            .bind(&query.fullnames)
            .bind(&query.first_name)
            .bind(&query.surname)
            .bind(self.matching.max_candidates)
            .fetch_all(&self.pool)
            .await
            .context("Profile match query failed")?;
        debug!("{} candidates for {:?}", rows.len(), query.fullnames.first());
        warn_if_capped(rows.len(), self.matching.max_candidates, &query.fullnames[..]);

        rows.iter()
            .map(|row| {
                Ok(ProfileCandidate {
                    user_id: required_text(row, "user_id")?,
                    fullname: text(row, "fullname")?,
                    first_name: text(row, "first_name")?,
                    last_name: text(row, "last_name")?,
                    predicted_gender: text(row, "predicted_gender")?,
                    predicted_ethnicity: text(row, "predicted_ethnicity")?,
                    location: text(row, "location")?,
                    n_connection: row.try_get("n_connection")?,
                    prestige_score: row.try_get("prestige_score")?,
                })
            })
            .collect()
    }

    async fn executive_positions(&self, user_ids: &[String]) -> Result<Vec<PositionRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT
                ip.user_id::text AS user_id,
                ip.rcid::text AS rcid,
                ip.company_name::text AS company_name,
                ip.title::text AS title,
                ip.role::text AS role,
                ip.start_date::text AS start_date,
                ip.end_date::text AS end_date,
                ip.is_current::text AS is_current
            FROM {individual_positions} ip
            WHERE ip.user_id = ANY($1::{id_type}[])
              AND (LOWER(ip.title) LIKE ANY($2) OR LOWER(ip.role) LIKE ANY($3))
            ORDER BY ip.start_date DESC NULLS LAST
            "#,
            individual_positions = self.tables.individual_positions,
            id_type = self.id_cast()
        );

        let rows = sqlx::query(&sql)
            .bind(user_ids)
            .bind(&self.matching.executive_title_patterns)
            .bind(&self.matching.executive_role_patterns)
            .fetch_all(&self.pool)
            .await
            .context("Position query failed")?;

        rows.iter()
            .map(|row| {
                Ok(PositionRecord {
                    user_id: required_text(row, "user_id")?,
                    rcid: text(row, "rcid")?,
                    company_name: text(row, "company_name")?,
                    title: text(row, "title")?,
                    role: text(row, "role")?,
                    start_date: text(row, "start_date")?,
                    end_date: text(row, "end_date")?,
                    is_current: parse_flag(text(row, "is_current")?),
                })
            })
            .collect()
    }

    async fn education(&self, user_ids: &[String]) -> Result<Vec<EducationRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT
                iue.user_id::text AS user_id,
                iue.school::text AS school,
                iue.degree::text AS degree,
                iue.field_of_study::text AS field_of_study,
                iue.end_year::text AS end_year
            FROM {individual_user_education} iue
            WHERE iue.user_id = ANY($1::{id_type}[])
            ORDER BY iue.end_year DESC NULLS LAST
            "#,
            individual_user_education = self.tables.individual_user_education,
            id_type = self.id_cast()
        );

        let rows = sqlx::query(&sql)
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await
            .context("Education query failed")?;

        rows.iter()
            .map(|row| {
                Ok(EducationRecord {
                    user_id: required_text(row, "user_id")?,
                    school: text(row, "school")?,
                    degree: text(row, "degree")?,
                    field_of_study: text(row, "field_of_study")?,
                    end_year: text(row, "end_year")?,
                })
            })
            .collect()
    }

    async fn skills(&self, user_ids: &[String]) -> Result<Vec<SkillRecord>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            r#"
            SELECT
                ius.user_id::text AS user_id,
                ius.skill::text AS skill
            FROM {individual_user_skills} ius
            WHERE ius.user_id = ANY($1::{id_type}[])
            "#,
            individual_user_skills = self.tables.individual_user_skills,
            id_type = self.id_cast()
        );

        let rows = sqlx::query(&sql)
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await
            .context("Skills query failed")?;

        rows.iter()
            .map(|row| {
                Ok(SkillRecord {
                    user_id: required_text(row, "user_id")?,
                    skill: text(row, "skill")?,
                })
            })
            .collect()
    }

    async fn company_candidates(&self, company: &str) -> Result<Vec<CompanyCandidate>> {
        if company.is_empty() {
            return Ok(Vec::new());
        }
        let sql = company_match_sql(&self.tables.company_mapping, &self.tables.company);

        let rows = sqlx::query(&sql)
            .bind(format!("%{}%", escape_like(company)))
            .bind(self.matching.company_candidates_limit)
            .fetch_all(&self.pool)
            .await
            .context("Company validation query failed")?;
        warn_if_capped(rows.len(), self.matching.company_candidates_limit, company);

        rows.iter()
            .map(|row| {
                Ok(CompanyCandidate {
                    rcid: required_text(row, "rcid")?,
                    company_name: text(row, "company_name")?,
                    company_name_clean: text(row, "company_name_clean")?,
                    ultimate_parent_rcid: text(row, "ultimate_parent_rcid")?,
                    ultimate_parent_name: text(row, "ultimate_parent_name")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl NameDirectory for RevelioClient {
    async fn name_page(&self, limit: i64, offset: i64) -> Result<Vec<NameRow>> {
        // ORDER BY inside the subquery keeps numeric order for chunking
        let sql = format!(
            r#"
            SELECT page.user_id::text AS user_id, page.fullname::text AS fullname
            FROM (
                SELECT DISTINCT user_id, fullname
                FROM {individual_user}
                WHERE fullname IS NOT NULL
                ORDER BY user_id
                LIMIT $1
                OFFSET $2
            ) page
            "#,
            individual_user = self.tables.individual_user
        );

        let rows = sqlx::query(&sql)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Name page query failed")?;

        rows.iter()
            .map(|row| {
                Ok(NameRow {
                    user_id: required_text(row, "user_id")?,
                    fullname: required_text(row, "fullname")?,
                })
            })
            .collect()
    }
}

/// Escapes LIKE wildcards so company names match literally.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// In-memory stand-in for the Revelio tables.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub struct MemorySource {
        pub profiles: Vec<ProfileCandidate>,
        pub positions: Vec<PositionRecord>,
        pub education: Vec<EducationRecord>,
        pub skills: Vec<SkillRecord>,
        pub companies: Vec<CompanyCandidate>,
        pub names: Vec<NameRow>,
        pub company_lookups: AtomicUsize,
        pub fail_on: Option<String>,
    }

    impl MemorySource {
        pub fn profile(user_id: &str, first: &str, last: &str) -> ProfileCandidate {
            ProfileCandidate {
                user_id: user_id.to_string(),
                fullname: Some(format!("{} {}", first, last)),
                first_name: Some(first.to_string()),
                last_name: Some(last.to_string()),
                ..Default::default()
            }
        }

        pub fn position(user_id: &str, title: &str, company: &str, rcid: Option<&str>) -> PositionRecord {
            PositionRecord {
                user_id: user_id.to_string(),
                title: Some(title.to_string()),
                company_name: Some(company.to_string()),
                rcid: rcid.map(str::to_string),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ProfileSource for MemorySource {
        async fn find_profiles(&self, query: &NameQuery) -> Result<Vec<ProfileCandidate>> {
            if self.fail_on.as_deref() == Some(query.surname.as_str()) {
                anyhow::bail!("connection reset while matching {}", query.surname);
            }
            Ok(self
                .profiles
                .iter()
                .filter(|p| {
                    let full = p.fullname.as_deref().unwrap_or("").to_lowercase();
                    let first = p.first_name.as_deref().unwrap_or("").to_lowercase();
                    let last = p.last_name.as_deref().unwrap_or("").to_lowercase();
                    query.fullnames.contains(&full)
                        || (first == query.first_name && last == query.surname)
                })
                .cloned()
                .collect())
        }

        async fn executive_positions(&self, user_ids: &[String]) -> Result<Vec<PositionRecord>> {
            Ok(self
                .positions
                .iter()
                .filter(|p| user_ids.contains(&p.user_id))
                .cloned()
                .collect())
        }

        async fn education(&self, user_ids: &[String]) -> Result<Vec<EducationRecord>> {
            Ok(self
                .education
                .iter()
                .filter(|e| user_ids.contains(&e.user_id))
                .cloned()
                .collect())
        }

        async fn skills(&self, user_ids: &[String]) -> Result<Vec<SkillRecord>> {
            Ok(self
                .skills
                .iter()
                .filter(|s| user_ids.contains(&s.user_id))
                .cloned()
                .collect())
        }

        async fn company_candidates(&self, company: &str) -> Result<Vec<CompanyCandidate>> {
            self.company_lookups.fetch_add(1, Ordering::Relaxed);
            Ok(self
                .companies
                .iter()
                .filter(|c| {
                    c.company_name_clean
                        .as_deref()
                        .unwrap_or("")
                        .to_lowercase()
                        .contains(company)
                })
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl NameDirectory for MemorySource {
        async fn name_page(&self, limit: i64, offset: i64) -> Result<Vec<NameRow>> {
            Ok(self
                .names
                .iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_wildcards_are_escaped() {
        assert_eq!(escape_like("at&t"), "at&t");
        assert_eq!(escape_like("100%_pure"), "100\\%\\_pure");
    }

    #[test]
    fn capped_lookups_are_ordered_before_the_limit() {
        let profiles = profile_match_sql("revelio.individual_user");
        let order = profiles.find("ORDER BY prestige_score DESC NULLS LAST").unwrap();
        assert!(order < profiles.find("LIMIT $4").unwrap());
        assert!(profiles.contains("FROM revelio.individual_user iu"));

        let companies = company_match_sql("revelio.company_mapping", "revelio.company");
        let order = companies.find("ORDER BY LENGTH(cm.company_name_clean)").unwrap();
        assert!(order < companies.find("LIMIT $2").unwrap());
        assert!(companies.contains("LEFT JOIN revelio.company c"));
    }

    #[test]
    fn position_flags_accept_postgres_spellings() {
        assert_eq!(parse_flag(Some("t".into())), Some(true));
        assert_eq!(parse_flag(Some("0".into())), Some(false));
        assert_eq!(parse_flag(Some("maybe".into())), None);
        assert_eq!(parse_flag(None), None);
    }
}
