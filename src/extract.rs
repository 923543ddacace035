use anyhow::{Context, Result};
use chrono::Local;
use futures::stream::{self, StreamExt, TryStreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::create_dir_all;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{
    batch_filename, batch_stats_filename, extracted_filename, unmatched_filename, OutputFormat,
    PipelineConfig,
};
use crate::error::PipelineError;
use crate::logging::memory_usage;
use crate::output::{
    write_key_values, write_unmatched, EnrichedRecord, EnrichedWriter, MatchStatus,
    UnmatchedRecord,
};
use crate::partition::BatchManifest;
use crate::revelio::{
    CompanyCandidate, EducationRecord, NameQuery, PositionRecord, ProfileCandidate,
    ProfileSource, SkillRecord,
};
use crate::roster::{clean_name, load_roster, name_variations, RosterEntry};

const LEGAL_SUFFIXES: &[&str] = &[
    "inc", "incorporated", "corp", "corporation", "co", "company", "ltd", "limited", "llc",
    "plc", "holdings", "holding", "group", "the", "sa", "ag", "nv", "lp",
];

type CompanyCache = HashMap<String, Vec<CompanyCandidate>>;

/// Lower case, punctuation to spaces, legal-form words dropped.
pub fn normalize_company(name: &str) -> String {
    let spaced: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '&' { c } else { ' ' })
        .collect();
    let tokens: Vec<&str> = spaced
        .split_whitespace()
        .filter(|t| !LEGAL_SUFFIXES.contains(t))
        .collect();
    if tokens.is_empty() {
        spaced.split_whitespace().collect::<Vec<_>>().join(" ")
    } else {
        tokens.join(" ")
    }
}

/// Either normalized name contains the other on word boundaries.
pub fn company_names_match(normalized_roster: &str, other: &str) -> bool {
    let other = normalize_company(other);
    if normalized_roster.len() < 2 || other.len() < 2 {
        return false;
    }
    let a = format!(" {} ", normalized_roster);
    let b = format!(" {} ", other);
    a.contains(&b) || b.contains(&a)
}

pub fn name_query(entry: &RosterEntry) -> NameQuery {
    NameQuery {
        fullnames: name_variations(&entry.first_name, &entry.surname)
            .into_iter()
            .map(|v| v.to_lowercase())
            .collect(),
        first_name: clean_name(&entry.first_name).to_lowercase(),
        surname: clean_name(&entry.surname).to_lowercase(),
    }
}

struct CompanyContext<'a> {
    normalized: Option<String>,
    candidates: &'a [CompanyCandidate],
    rcids: HashSet<&'a str>,
}

impl<'a> CompanyContext<'a> {
    fn new(entry: &RosterEntry, cache: &'a CompanyCache) -> Self {
        let normalized = entry
            .company
            .as_deref()
            .map(normalize_company)
            .filter(|n| !n.is_empty());
        let candidates = normalized
            .as_ref()
            .and_then(|n| cache.get(n))
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let rcids = candidates.iter().map(|c| c.rcid.as_str()).collect();
        Self {
            normalized,
            candidates,
            rcids,
        }
    }

    fn matches(&self, position: &PositionRecord) -> bool {
        if position
            .rcid
            .as_deref()
            .is_some_and(|rcid| self.rcids.contains(rcid))
        {
            return true;
        }
        match (&self.normalized, &position.company_name) {
            (Some(roster), Some(name)) => company_names_match(roster, name),
            _ => false,
        }
    }

    /// The Revelio company the roster company resolved to, preferring the
    /// one the chosen executive position points at.
    fn resolved(&self, position: Option<&PositionRecord>) -> Option<&'a CompanyCandidate> {
        let rcid = position.and_then(|p| p.rcid.as_deref());
        self.candidates
            .iter()
            .find(|c| Some(c.rcid.as_str()) == rcid)
            .or_else(|| self.candidates.first())
    }
}

struct Candidate<'a> {
    profile: &'a ProfileCandidate,
    positions: Vec<&'a PositionRecord>,
    confirmed: bool,
}

/// More executive positions, then prestige, then connections, then the
/// smaller user id.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.positions
        .len()
        .cmp(&a.positions.len())
        .then_with(|| prestige(b).total_cmp(&prestige(a)))
        .then_with(|| b.profile.n_connection.cmp(&a.profile.n_connection))
        .then_with(|| compare_ids(&a.profile.user_id, &b.profile.user_id))
}

fn prestige(candidate: &Candidate) -> f64 {
    candidate.profile.prestige_score.unwrap_or(f64::MIN)
}

fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

fn summarize_education(education: &[EducationRecord]) -> Option<String> {
    let entries: Vec<String> = education
        .iter()
        .filter_map(|e| {
            let school = e.school.as_deref()?;
            let details: Vec<&str> = [&e.degree, &e.field_of_study, &e.end_year]
                .into_iter()
                .filter_map(|d| d.as_deref())
                .filter(|d| !d.is_empty())
                .collect();
            Some(if details.is_empty() {
                school.to_string()
            } else {
                format!("{} ({})", school, details.join(", "))
            })
        })
        .collect();
    (!entries.is_empty()).then(|| entries.join("; "))
}

fn summarize_skills(skills: &[SkillRecord]) -> BTreeSet<String> {
    skills
        .iter()
        .filter_map(|s| s.skill.as_deref())
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn unmatched_record(entry: &RosterEntry, batch: usize, company: &CompanyContext) -> EnrichedRecord {
    let resolved = company.resolved(None);
    EnrichedRecord {
        roster_id: entry.roster_id as i64,
        batch: batch as i64,
        first_name: entry.first_name.clone(),
        surname: entry.surname.clone(),
        company: entry.company.clone(),
        match_status: MatchStatus::Unmatched,
        n_candidates: 0,
        user_id: None,
        fullname: None,
        predicted_gender: None,
        predicted_ethnicity: None,
        location: None,
        n_connection: None,
        prestige_score: None,
        exec_title: None,
        exec_company: None,
        exec_rcid: None,
        exec_start_date: None,
        exec_end_date: None,
        exec_is_current: None,
        n_exec_positions: 0,
        company_rcid: resolved.map(|c| c.rcid.clone()),
        company_parent_rcid: resolved.and_then(|c| c.ultimate_parent_rcid.clone()),
        company_parent_name: resolved.and_then(|c| c.ultimate_parent_name.clone()),
        n_education: 0,
        education: None,
        n_skills: 0,
        skills: None,
    }
    .normalized()
}

/// Matches one roster entry and joins the chosen profile onto it.
pub async fn enrich_entry<S: ProfileSource + ?Sized>(
    source: &S,
    entry: &RosterEntry,
    batch: usize,
    companies: &CompanyCache,
) -> Result<EnrichedRecord> {
    let company = CompanyContext::new(entry, companies);
    let profiles = source
        .find_profiles(&name_query(entry))
        .await
        .with_context(|| format!("Matching {} failed", entry.display_name()))?;

    if profiles.is_empty() {
        debug!("No profile for {}", entry.display_name());
        return Ok(unmatched_record(entry, batch, &company));
    }

    let ids: Vec<String> = profiles.iter().map(|p| p.user_id.clone()).collect();
    let positions = source.executive_positions(&ids).await?;

    let mut candidates: Vec<Candidate> = profiles
        .iter()
        .map(|profile| {
            let own: Vec<&PositionRecord> = positions
                .iter()
                .filter(|p| p.user_id == profile.user_id)
                .collect();
            let confirmed = own.iter().any(|p| company.matches(p));
            Candidate {
                profile,
                positions: own,
                confirmed,
            }
        })
        .collect();
    candidates.sort_by(rank);

    let status = if candidates.iter().any(|c| c.confirmed) {
        MatchStatus::CompanyConfirmed
    } else if candidates.len() == 1 {
        MatchStatus::NameUnique
    } else {
        MatchStatus::NameAmbiguous
    };
    let chosen = candidates
        .iter()
        .find(|c| status != MatchStatus::CompanyConfirmed || c.confirmed)
        .ok_or_else(|| anyhow::anyhow!("no candidate left for {}", entry.display_name()))?;

    let best_position = chosen
        .positions
        .iter()
        .find(|p| company.matches(p))
        .or_else(|| chosen.positions.iter().find(|p| p.is_current == Some(true)))
        .or_else(|| chosen.positions.first())
        .copied();

    let chosen_id = [chosen.profile.user_id.clone()];
    let education = source.education(&chosen_id).await?;
    let skills = summarize_skills(&source.skills(&chosen_id).await?);
    let resolved = company.resolved(best_position);
    let profile = chosen.profile;

    Ok(EnrichedRecord {
        roster_id: entry.roster_id as i64,
        batch: batch as i64,
        first_name: entry.first_name.clone(),
        surname: entry.surname.clone(),
        company: entry.company.clone(),
        match_status: status,
        n_candidates: candidates.len() as i64,
        user_id: Some(profile.user_id.clone()),
        fullname: profile.fullname.clone(),
        predicted_gender: profile.predicted_gender.clone(),
        predicted_ethnicity: profile.predicted_ethnicity.clone(),
        location: profile.location.clone(),
        n_connection: profile.n_connection,
        prestige_score: profile.prestige_score,
        exec_title: best_position.and_then(|p| p.title.clone()),
        exec_company: best_position.and_then(|p| p.company_name.clone()),
        exec_rcid: best_position.and_then(|p| p.rcid.clone()),
        exec_start_date: best_position.and_then(|p| p.start_date.clone()),
        exec_end_date: best_position.and_then(|p| p.end_date.clone()),
        exec_is_current: best_position.and_then(|p| p.is_current),
        n_exec_positions: chosen.positions.len() as i64,
        company_rcid: resolved.map(|c| c.rcid.clone()),
        company_parent_rcid: resolved.and_then(|c| c.ultimate_parent_rcid.clone()),
        company_parent_name: resolved.and_then(|c| c.ultimate_parent_name.clone()),
        n_education: education.len() as i64,
        education: summarize_education(&education),
        n_skills: skills.len() as i64,
        skills: (!skills.is_empty()).then(|| skills.into_iter().collect::<Vec<_>>().join("; ")),
    }
    .normalized())
}

async fn resolve_companies<S: ProfileSource + ?Sized>(
    source: &S,
    entries: &[RosterEntry],
    cache: &mut CompanyCache,
) -> Result<()> {
    let pending: BTreeSet<String> = entries
        .iter()
        .filter_map(|e| e.company.as_deref())
        .map(normalize_company)
        .filter(|n| !n.is_empty() && !cache.contains_key(n))
        .collect();
    for company in pending {
        let candidates = source
            .company_candidates(&company)
            .await
            .with_context(|| format!("Resolving company {} failed", company))?;
        debug!("{} Revelio companies for '{}'", candidates.len(), company);
        cache.insert(company, candidates);
    }
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct BatchStats {
    pub batch: usize,
    pub entries: usize,
    pub by_status: BTreeMap<MatchStatus, usize>,
    pub elapsed_secs: f64,
}

impl BatchStats {
    pub fn matched(&self) -> usize {
        self.by_status
            .iter()
            .filter(|(status, _)| status.is_matched())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn count(&self, status: MatchStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }

    fn to_key_values(&self) -> Vec<(String, String)> {
        let rate = if self.entries > 0 {
            self.matched() as f64 / self.entries as f64 * 100.0
        } else {
            0.0
        };
        let mut pairs = vec![
            ("batch".to_string(), self.batch.to_string()),
            ("entries".to_string(), self.entries.to_string()),
            ("matched".to_string(), self.matched().to_string()),
        ];
        for status in MatchStatus::ALL {
            pairs.push((status.as_str().to_string(), self.count(status).to_string()));
        }
        pairs.push(("match_rate_pct".to_string(), format!("{:.1}", rate)));
        pairs.push(("elapsed_seconds".to_string(), format!("{:.2}", self.elapsed_secs)));
        pairs.push(("completed_at".to_string(), Local::now().to_rfc3339()));
        pairs
    }
}

/// Batches the split produced, from the manifest when it exists.
pub fn expected_batches(config: &PipelineConfig) -> Result<usize> {
    let manifest = config.paths.manifest_file();
    if manifest.exists() {
        Ok(BatchManifest::read(&manifest)?.num_batches)
    } else {
        Ok(config.batching.num_batches)
    }
}

/// Runs one batch job end to end. The stats file is written last and marks
/// the batch complete; a failed run leaves none behind.
pub async fn run_batch<S: ProfileSource + ?Sized>(
    source: &S,
    config: &PipelineConfig,
    batch: usize,
    format: OutputFormat,
) -> Result<BatchStats> {
    let max = expected_batches(config)?;
    if batch == 0 || batch > max {
        return Err(PipelineError::BatchOutOfRange { batch, max }.into());
    }

    let paths = &config.paths;
    let roster = load_roster(&paths.batch_dir().join(batch_filename(batch)))?;
    create_dir_all(paths.extracted_dir())?;
    create_dir_all(paths.unmatched_dir())?;

    let stats_path = paths.extracted_dir().join(batch_stats_filename(batch));
    if stats_path.exists() {
        warn!("Batch {} was already extracted; re-running", batch);
        std::fs::remove_file(&stats_path)?;
    }

    let output_path = paths.extracted_dir().join(extracted_filename(batch, format));
    let mut writer = EnrichedWriter::create(&output_path, format)?;

    info!(
        "Batch {}: extracting {} entries in chunks of {}",
        batch,
        roster.len(),
        config.batching.query_chunk_size
    );

    let progress = ProgressBar::new(roster.len() as u64);
    progress.set_style(ProgressStyle::with_template(
        "[{elapsed_precise}] {bar:50.cyan/blue} {pos:>5}/{len:5} CEOs | {msg}",
    )?);
    progress.set_message(format!("Batch {:02}", batch));

    let started = Instant::now();
    let mut stats = BatchStats {
        batch,
        entries: roster.len(),
        ..Default::default()
    };
    let mut companies = CompanyCache::new();
    let mut unmatched = Vec::new();

    for (chunk_no, chunk) in roster.entries.chunks(config.batching.query_chunk_size).enumerate() {
        resolve_companies(source, chunk, &mut companies).await?;

        let records: Vec<EnrichedRecord> = stream::iter(chunk)
            .map(|entry| enrich_entry(source, entry, batch, &companies))
            .buffered(config.matching.db_concurrency)
            .try_collect()
            .await?;

        for record in &records {
            *stats.by_status.entry(record.match_status).or_insert(0) += 1;
            if !record.match_status.is_matched() {
                unmatched.push(UnmatchedRecord::from(record));
            }
        }
        writer.write(&records)?;
        progress.inc(chunk.len() as u64);

        info!(
            "Batch {} chunk {}: {}/{} done, {} matched so far. Memory: {}",
            batch,
            chunk_no + 1,
            progress.position(),
            roster.len(),
            stats.matched(),
            memory_usage()
        );
    }

    writer.finish()?;
    write_unmatched(&paths.unmatched_dir().join(unmatched_filename(batch)), &unmatched)?;

    stats.elapsed_secs = started.elapsed().as_secs_f64();
    write_key_values(&stats_path, &stats.to_key_values())?;
    progress.finish_with_message(format!("Batch {:02} complete", batch));

    info!(
        "Batch {}: {} of {} matched ({} company-confirmed, {} unmatched) in {:.1}s -> {}",
        batch,
        stats.matched(),
        stats.entries,
        stats.count(MatchStatus::CompanyConfirmed),
        stats.count(MatchStatus::Unmatched),
        stats.elapsed_secs,
        output_path.display()
    );
    Ok(stats)
}

/// A batch is complete once its stats file exists.
pub fn is_batch_complete(extracted_dir: &Path, batch: usize) -> bool {
    extracted_dir.join(batch_stats_filename(batch)).exists()
}
