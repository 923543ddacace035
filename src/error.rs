use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Roster file not found: {0}")]
    RosterNotFound(PathBuf),

    #[error("Roster is missing required column `{column}` (found: {found})")]
    MissingColumn { column: String, found: String },

    #[error("Roster contains no usable entries")]
    EmptyRoster,

    #[error("Invalid roster_id `{value}` on line {line}")]
    InvalidRosterId { value: String, line: usize },

    #[error("Cannot split {entries} entries into {batches} batches")]
    InvalidBatchCount { entries: usize, batches: usize },

    #[error("Batch {batch} is out of range 1..={max}")]
    BatchOutOfRange { batch: usize, max: usize },

    #[error("Task {0} is invalid; array task ids start at 1")]
    InvalidTask(usize),

    #[error("Batch verification failed: {0}")]
    Verification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing batch outputs: {0:?}")]
    MissingBatches(Vec<usize>),

    #[error("Outputs of batches {0:?} do not match the current batch files; re-run extract for them")]
    StaleOutputs(Vec<usize>),

    #[error("Unsupported output file: {0}")]
    UnsupportedFile(PathBuf),

    #[error("Column `{column}` missing or mistyped in {path}")]
    Column { column: String, path: PathBuf },
}
