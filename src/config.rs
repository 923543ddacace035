use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::PipelineError;

// ====== DEFAULTS FOR THE CEO ROSTER ======
pub const EXPECTED_ROSTER_SIZE: usize = 1243;
// WRDS allows at most 5 concurrent jobs per user
pub const NUM_BATCHES: usize = 5;
pub const QUERY_CHUNK_SIZE: usize = 50;
pub const DEFAULT_SHUFFLE_SEED: u64 = 1243;
pub const WRDS_HOST_MARKER: &str = "wrds-cloud";
pub const MANIFEST_FILE: &str = "batch_manifest.json";

const USER_ID_TYPES: &[&str] = &["bigint", "integer", "numeric", "text", "varchar"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Csv,
    Parquet,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Csv => "csv",
            OutputFormat::Parquet => "parquet",
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()? {
            "csv" => Some(OutputFormat::Csv),
            "parquet" => Some(OutputFormat::Parquet),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub wrds: WrdsConfig,
    pub paths: PathsConfig,
    pub batching: BatchingConfig,
    pub resources: JobResources,
    pub tables: RevelioTables,
    pub matching: MatchingConfig,
    pub names: NamesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WrdsConfig {
    pub username: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub connect_timeout_secs: u64,
    pub max_connections: u32,
}

impl Default for WrdsConfig {
    fn default() -> Self {
        Self {
            username: std::env::var("USER").unwrap_or_default(),
            host: "wrds-pgdata.wharton.upenn.edu".to_string(),
            port: 9737,
            database: "wrds".to_string(),
            connect_timeout_secs: 30,
            max_connections: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub project_dir: PathBuf,
    pub scratch_dir: PathBuf,
    /// Overrides `<project>/data/ceo_names_companies.csv`
    pub roster_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            scratch_dir: PathBuf::from("scratch"),
            roster_file: None,
        }
    }
}

impl PathsConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.project_dir.join("data")
    }

    pub fn batch_dir(&self) -> PathBuf {
        self.data_dir().join("batches")
    }

    pub fn unmatched_dir(&self) -> PathBuf {
        self.data_dir().join("unmatched")
    }

    pub fn jobs_dir(&self) -> PathBuf {
        self.project_dir.join("jobs")
    }

    pub fn extracted_dir(&self) -> PathBuf {
        self.scratch_dir.join("extracted")
    }

    pub fn combined_dir(&self) -> PathBuf {
        self.scratch_dir.join("combined")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.scratch_dir.join("logs")
    }

    pub fn names_dir(&self) -> PathBuf {
        self.scratch_dir.join("name_batches")
    }

    pub fn roster_file(&self) -> PathBuf {
        self.roster_file
            .clone()
            .unwrap_or_else(|| self.data_dir().join("ceo_names_companies.csv"))
    }

    pub fn manifest_file(&self) -> PathBuf {
        self.batch_dir().join(MANIFEST_FILE)
    }

    pub fn all_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.scratch_dir.clone(),
            self.data_dir(),
            self.batch_dir(),
            self.jobs_dir(),
            self.extracted_dir(),
            self.combined_dir(),
            self.logs_dir(),
            self.unmatched_dir(),
            self.names_dir(),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub num_batches: usize,
    pub expected_roster_size: usize,
    /// `None` keeps roster order when slicing
    pub shuffle_seed: Option<u64>,
    pub query_chunk_size: usize,
    pub output_format: OutputFormat,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            num_batches: NUM_BATCHES,
            expected_roster_size: EXPECTED_ROSTER_SIZE,
            shuffle_seed: Some(DEFAULT_SHUFFLE_SEED),
            query_chunk_size: QUERY_CHUNK_SIZE,
            output_format: OutputFormat::Csv,
        }
    }
}

/// Grid Engine resource request for each batch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobResources {
    pub cores: u32,
    pub memory: String,
    pub runtime: String,
    pub parallel_env: String,
    pub queue: Option<String>,
    pub max_concurrent: usize,
}

impl Default for JobResources {
    fn default() -> Self {
        Self {
            cores: 2,
            memory: "16G".to_string(),
            runtime: "02:00:00".to_string(),
            parallel_env: "onenode".to_string(),
            queue: None,
            max_concurrent: NUM_BATCHES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevelioTables {
    pub individual_user: String,
    pub individual_positions: String,
    pub individual_user_education: String,
    pub individual_user_skills: String,
    pub company_mapping: String,
    pub company: String,
    /// SQL type of `user_id`; bound ids are cast to it so indexes stay usable
    pub user_id_type: String,
}

impl Default for RevelioTables {
    fn default() -> Self {
        Self {
            individual_user: "revelio.individual_user".to_string(),
            individual_positions: "revelio.individual_positions".to_string(),
            individual_user_education: "revelio.individual_user_education".to_string(),
            individual_user_skills: "revelio.individual_user_skills".to_string(),
            company_mapping: "revelio.company_mapping".to_string(),
            company: "revelio.company".to_string(),
            user_id_type: "bigint".to_string(),
        }
    }
}

impl RevelioTables {
    fn all(&self) -> [&str; 6] {
        [
            &self.individual_user,
            &self.individual_positions,
            &self.individual_user_education,
            &self.individual_user_skills,
            &self.company_mapping,
            &self.company,
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub max_candidates: i64,
    pub company_candidates_limit: i64,
    pub executive_title_patterns: Vec<String>,
    pub executive_role_patterns: Vec<String>,
    /// Concurrent lookups per chunk
    pub db_concurrency: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            max_candidates: 25,
            company_candidates_limit: 10,
            executive_title_patterns: vec![
                "%ceo%".to_string(),
                "%chief executive%".to_string(),
                "%president%".to_string(),
            ],
            executive_role_patterns: vec!["%executive%".to_string()],
            db_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamesConfig {
    pub rows_per_task: i64,
    pub expected_tasks: usize,
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            rows_per_task: 10_000_000,
            expected_tasks: 65,
        }
    }
}

impl PipelineConfig {
    /// Defaults, overlaid with the TOML file when one is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                let config: PipelineConfig = toml::from_str(&text)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?;
                config
            }
            None => PipelineConfig::default(),
        };
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), PipelineError> {
        for table in self.tables.all() {
            if !is_qualified_identifier(table) {
                return Err(PipelineError::Config(format!(
                    "table name `{}` is not a schema.table identifier",
                    table
                )));
            }
        }
        if !USER_ID_TYPES.contains(&self.tables.user_id_type.as_str()) {
            return Err(PipelineError::Config(format!(
                "user_id_type `{}` must be one of {:?}",
                self.tables.user_id_type, USER_ID_TYPES
            )));
        }
        if self.batching.num_batches == 0 {
            return Err(PipelineError::Config("num_batches must be positive".into()));
        }
        if self.batching.query_chunk_size == 0 {
            return Err(PipelineError::Config(
                "query_chunk_size must be positive".into(),
            ));
        }
        if self.matching.db_concurrency == 0 || self.matching.max_candidates <= 0 {
            return Err(PipelineError::Config(
                "db_concurrency and max_candidates must be positive".into(),
            ));
        }
        if self.names.rows_per_task <= 0 {
            return Err(PipelineError::Config("rows_per_task must be positive".into()));
        }
        Ok(())
    }

    pub fn create_directories(&self) -> Result<Vec<PathBuf>> {
        let dirs = self.paths.all_dirs();
        for dir in &dirs {
            create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        info!("Created {} directories", dirs.len());
        Ok(dirs)
    }
}

fn is_qualified_identifier(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 2
        && parts.iter().all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}

// ====== FILE NAMING ======
pub fn batch_filename(batch: usize) -> String {
    format!("batch_{:02}_ceos.csv", batch)
}

pub fn extracted_filename(batch: usize, format: OutputFormat) -> String {
    format!("batch_{:02}_extracted.{}", batch, format.extension())
}

pub fn unmatched_filename(batch: usize) -> String {
    format!("batch_{:02}_unmatched.csv", batch)
}

pub fn batch_stats_filename(batch: usize) -> String {
    format!("batch_{:02}_stats.txt", batch)
}

pub fn job_script_filename(batch: usize) -> String {
    format!("batch_{:02}.sh", batch)
}

pub fn combined_stem(timestamp: &DateTime<Local>) -> String {
    format!("ceo_linkedin_enriched_{}", timestamp.format("%Y%m%d_%H%M%S"))
}

pub fn names_dump_filename(task: usize) -> String {
    format!("batch_{:04}.parquet", task)
}

pub fn names_stats_filename(task: usize) -> String {
    format!("batch_{:04}_stats.txt", task)
}

// ====== ENVIRONMENT ======
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunEnvironment {
    Wrds,
    Local,
}

impl RunEnvironment {
    pub fn detect() -> (Self, String) {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "unknown".to_string());
        (Self::from_hostname(&hostname), hostname)
    }

    pub fn from_hostname(hostname: &str) -> Self {
        if hostname.contains(WRDS_HOST_MARKER) {
            RunEnvironment::Wrds
        } else {
            RunEnvironment::Local
        }
    }
}

/// Batch or task number, from an explicit flag, else the Grid Engine array
/// index, else 1. Resolved before logging starts, so it only logs on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskId {
    Explicit(usize),
    Scheduler(usize),
    /// SGE sets "undefined" outside array jobs.
    Default { ignored: Option<String> },
}

impl TaskId {
    pub fn from_env(explicit: Option<usize>) -> Self {
        Self::resolve(explicit, std::env::var("SGE_TASK_ID").ok())
    }

    fn resolve(explicit: Option<usize>, sge_task_id: Option<String>) -> Self {
        if let Some(id) = explicit {
            return TaskId::Explicit(id);
        }
        match sge_task_id {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(id) => TaskId::Scheduler(id),
                Err(_) => TaskId::Default {
                    ignored: Some(value),
                },
            },
            None => TaskId::Default { ignored: None },
        }
    }

    pub fn number(&self) -> usize {
        match self {
            TaskId::Explicit(id) | TaskId::Scheduler(id) => *id,
            TaskId::Default { .. } => 1,
        }
    }

    pub fn log(&self) {
        match self {
            TaskId::Explicit(id) => info!("Task {} given on the command line", id),
            TaskId::Scheduler(id) => info!("Task {} from SGE_TASK_ID", id),
            TaskId::Default { ignored: Some(value) } => {
                warn!("Ignoring SGE_TASK_ID={}, defaulting to 1", value)
            }
            TaskId::Default { ignored: None } => info!("No SGE_TASK_ID, defaulting to 1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_ceo_roster_setup() {
        let config = PipelineConfig::default();
        assert_eq!(config.batching.num_batches, 5);
        assert_eq!(config.batching.expected_roster_size, 1243);
        assert_eq!(config.batching.query_chunk_size, 50);
        assert_eq!(config.resources.cores, 2);
        assert_eq!(config.resources.memory, "16G");
        assert_eq!(config.resources.runtime, "02:00:00");
        assert_eq!(config.tables.individual_user, "revelio.individual_user");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn toml_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.toml");
        std::fs::write(
            &path,
            "[batching]\nnum_batches = 3\n\n[resources]\nmemory = \"32G\"\n\n[paths]\nscratch_dir = \"/scratch/x\"\n",
        )
        .unwrap();

        let config = PipelineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.batching.num_batches, 3);
        assert_eq!(config.batching.query_chunk_size, 50);
        assert_eq!(config.resources.memory, "32G");
        assert_eq!(config.resources.cores, 2);
        assert_eq!(
            config.paths.extracted_dir(),
            PathBuf::from("/scratch/x/extracted")
        );
    }

    #[test]
    fn shipped_wrds_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/wrds.toml");
        let config = PipelineConfig::load(Some(&path)).unwrap();
        config.validate().unwrap();
        assert_eq!(config.batching.shuffle_seed, Some(1243));
        assert_eq!(config.names.expected_tasks, 65);
        assert_eq!(
            config.paths.roster_file(),
            PathBuf::from("/home/uncc/nichiflu/managers_revelio/data/ceo_names_companies.csv")
        );
    }

    #[test]
    fn rejects_table_names_that_are_not_identifiers() {
        let mut config = PipelineConfig::default();
        config.tables.company = "revelio.company; drop table x".to_string();
        assert!(matches!(config.validate(), Err(PipelineError::Config(_))));

        let mut config = PipelineConfig::default();
        config.tables.user_id_type = "bigint); --".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_names_are_zero_padded() {
        assert_eq!(batch_filename(1), "batch_01_ceos.csv");
        assert_eq!(
            extracted_filename(5, OutputFormat::Parquet),
            "batch_05_extracted.parquet"
        );
        assert_eq!(names_dump_filename(7), "batch_0007.parquet");
        assert_eq!(names_stats_filename(65), "batch_0065_stats.txt");
    }

    #[test]
    fn wrds_is_detected_from_hostname() {
        assert_eq!(
            RunEnvironment::from_hostname("wrds-cloud-login1-w"),
            RunEnvironment::Wrds
        );
        assert_eq!(
            RunEnvironment::from_hostname("laptop.local"),
            RunEnvironment::Local
        );
    }

    #[test]
    fn explicit_task_id_wins() {
        assert_eq!(TaskId::resolve(Some(4), Some("2".into())).number(), 4);
    }

    #[test]
    fn task_id_falls_back_to_the_scheduler_then_one() {
        assert_eq!(TaskId::resolve(None, Some(" 3 ".into())), TaskId::Scheduler(3));
        let undefined = TaskId::resolve(None, Some("undefined".into()));
        assert_eq!(
            undefined,
            TaskId::Default {
                ignored: Some("undefined".into())
            }
        );
        assert_eq!(undefined.number(), 1);
        assert_eq!(TaskId::resolve(None, None).number(), 1);
    }
}
