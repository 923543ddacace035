//! Bulk dump of every (user_id, fullname) pair in `individual_user`, one
//! Grid Engine array task per LIMIT/OFFSET page, plus the check that all
//! pages arrived.

use anyhow::{Context, Result};
use chrono::Local;
use glob::glob;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Write as _;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::{names_dump_filename, names_stats_filename};
use crate::error::PipelineError;
use crate::jobs::NAMES_ARRAY_SCRIPT;
use crate::logging::memory_usage;
use crate::output::{create_parquet_writer, names_schema, names_to_record_batch, read_key_values, write_key_values};
use crate::revelio::{NameDirectory, NameRow};

pub const SUMMARY_FILE: &str = "extraction_summary.txt";

#[derive(Debug, Clone, PartialEq)]
pub struct DumpStats {
    pub task_id: usize,
    pub offset: i64,
    pub rows: usize,
    pub unique_users: usize,
    pub file_size_mb: f64,
    pub query_time_secs: f64,
}

pub fn task_offset(task_id: usize, rows_per_task: i64) -> Result<i64, PipelineError> {
    match task_id {
        0 => Err(PipelineError::InvalidTask(task_id)),
        _ => Ok((task_id as i64 - 1) * rows_per_task),
    }
}

/// Extracts one page. Returns `None` when the offset is past the end of the
/// table, in which case nothing is written.
pub async fn dump_names<D: NameDirectory + ?Sized>(
    directory: &D,
    output_dir: &Path,
    task_id: usize,
    rows_per_task: i64,
) -> Result<Option<DumpStats>> {
    let offset = task_offset(task_id, rows_per_task)?;
    info!(
        "Task {}: extracting rows {} to {}",
        task_id,
        offset,
        offset + rows_per_task
    );

    let started = Instant::now();
    let rows = directory
        .name_page(rows_per_task, offset)
        .await
        .with_context(|| format!("Name dump task {} failed", task_id))?;
    let query_time_secs = started.elapsed().as_secs_f64();
    info!(
        "Query returned {} rows in {:.2}s. Memory: {}",
        rows.len(),
        query_time_secs,
        memory_usage()
    );

    if rows.is_empty() {
        warn!("Task {}: no data at offset {} (past end of table)", task_id, offset);
        return Ok(None);
    }

    let before = rows.len();
    let mut seen = HashSet::with_capacity(before);
    let rows: Vec<NameRow> = rows
        .into_iter()
        .filter(|r| seen.insert((r.user_id.clone(), r.fullname.clone())))
        .collect();
    if rows.len() != before {
        info!("Removed {} duplicates within the page", before - rows.len());
    }
    let unique_users = rows.iter().map(|r| r.user_id.as_str()).collect::<HashSet<_>>().len();

    create_dir_all(output_dir)?;
    let output_path = output_dir.join(names_dump_filename(task_id));
    let mut writer = create_parquet_writer(&output_path, names_schema())?;
    writer.write(&names_to_record_batch(&rows)?)?;
    writer.close()?;

    let file_size_mb = std::fs::metadata(&output_path)?.len() as f64 / (1024.0 * 1024.0);
    let stats = DumpStats {
        task_id,
        offset,
        rows: rows.len(),
        unique_users,
        file_size_mb,
        query_time_secs,
    };
    write_key_values(
        &output_dir.join(names_stats_filename(task_id)),
        &[
            ("task_id".to_string(), task_id.to_string()),
            ("offset".to_string(), offset.to_string()),
            ("rows".to_string(), stats.rows.to_string()),
            ("unique_users".to_string(), unique_users.to_string()),
            ("file_size_mb".to_string(), format!("{:.2}", file_size_mb)),
            ("query_time_seconds".to_string(), format!("{:.2}", query_time_secs)),
            ("extraction_time".to_string(), Local::now().to_rfc3339()),
        ],
    )?;

    info!(
        "Task {}: saved {} rows ({:.2} MB) to {}",
        task_id,
        stats.rows,
        file_size_mb,
        output_path.display()
    );
    Ok(Some(stats))
}

#[derive(Debug, Clone, Default)]
pub struct DumpReport {
    pub expected: usize,
    pub found: BTreeSet<usize>,
    pub missing: Vec<usize>,
    pub stats_files: usize,
    /// Task id → parsed stats, in task order
    pub stats: BTreeMap<usize, BTreeMap<String, String>>,
    pub total_rows: u64,
    pub total_unique_users: u64,
    pub total_size_mb: f64,
    pub total_query_secs: f64,
}

impl DumpReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    pub fn rerun_command(&self) -> Option<String> {
        if self.missing.is_empty() {
            return None;
        }
        let ids: Vec<String> = self.missing.iter().map(|t| t.to_string()).collect();
        Some(format!("qsub -t {} {}", ids.join(","), NAMES_ARRAY_SCRIPT))
    }
}

fn task_id_of(path: &Path) -> Option<usize> {
    let stem = path.file_name()?.to_str()?.strip_prefix("batch_")?;
    let digits: String = stem.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

fn glob_paths(pattern: PathBuf) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in glob(&pattern.to_string_lossy())? {
        paths.push(entry?);
    }
    Ok(paths)
}

pub fn verify_name_dumps(dir: &Path, expected: usize) -> Result<DumpReport> {
    let dumps = glob_paths(dir.join("batch_*.parquet"))?;
    let stats_files = glob_paths(dir.join("batch_*_stats.txt"))?;

    let mut report = DumpReport {
        expected,
        found: dumps
            .iter()
            .filter_map(|p| task_id_of(p))
            .filter(|t| (1..=expected).contains(t))
            .collect(),
        stats_files: stats_files.len(),
        ..Default::default()
    };
    report.missing = (1..=expected).filter(|t| !report.found.contains(t)).collect();

    for path in &stats_files {
        let Some(task) = task_id_of(path) else {
            continue;
        };
        if !(1..=expected).contains(&task) {
            warn!("Ignoring {} (task outside 1..={})", path.display(), expected);
            continue;
        }
        let values = read_key_values(path)?;
        let number = |key: &str| values.get(key).and_then(|v| v.parse::<f64>().ok()).unwrap_or(0.0);
        report.total_rows += number("rows") as u64;
        report.total_unique_users += number("unique_users") as u64;
        report.total_size_mb += number("file_size_mb");
        report.total_query_secs += number("query_time_seconds");
        report.stats.insert(task, values);
    }

    std::fs::write(dir.join(SUMMARY_FILE), render_dump_summary(&report))
        .with_context(|| format!("Failed to write {}", dir.join(SUMMARY_FILE).display()))?;
    Ok(report)
}

fn batch_line(out: &mut String, task: usize, stats: &BTreeMap<String, String>) {
    let get = |key: &str| stats.get(key).map(String::as_str).unwrap_or("N/A");
    let _ = writeln!(out, "  Batch {}: {} rows, {} MB", task, get("rows"), get("file_size_mb"));
}

pub fn render_dump_summary(report: &DumpReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "REVELIO NAME EXTRACTION SUMMARY");
    let _ = writeln!(out, "{}\n", "=".repeat(60));
    let _ = writeln!(out, "Total batches expected: {}", report.expected);
    let _ = writeln!(out, "Total batches found: {}", report.found.len());
    let _ = writeln!(out, "Stats files found: {}", report.stats_files);
    if report.missing.is_empty() {
        let _ = writeln!(out, "Missing batches: None\n");
    } else {
        let _ = writeln!(out, "Missing batches: {:?}\n", report.missing);
    }

    let _ = writeln!(out, "Total rows: {}", report.total_rows);
    let _ = writeln!(out, "Total unique users: {}", report.total_unique_users);
    let _ = writeln!(
        out,
        "Total size: {:.2} MB ({:.2} GB)",
        report.total_size_mb,
        report.total_size_mb / 1024.0
    );

    let n = report.stats.len();
    if n > 0 {
        let _ = writeln!(out, "\nAverage per batch:");
        let _ = writeln!(out, "  Rows: {:.0}", report.total_rows as f64 / n as f64);
        let _ = writeln!(out, "  Size: {:.2} MB", report.total_size_mb / n as f64);
        let _ = writeln!(out, "  Query time: {:.2} seconds", report.total_query_secs / n as f64);

        let _ = writeln!(out, "\nFirst 3 batches:");
        for (task, stats) in report.stats.iter().take(3) {
            batch_line(&mut out, *task, stats);
        }
        if n > 6 {
            let _ = writeln!(out, "\nLast 3 batches:");
            for (task, stats) in report.stats.iter().skip(n - 3) {
                batch_line(&mut out, *task, stats);
            }
        }
    }

    if let Some(command) = report.rerun_command() {
        let _ = writeln!(out, "\nTO RERUN MISSING BATCHES:\n{}", command);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revelio::testing::MemorySource;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn names(n: usize) -> Vec<NameRow> {
        (1..=n)
            .map(|i| NameRow {
                user_id: i.to_string(),
                fullname: format!("person {}", i),
            })
            .collect()
    }

    #[test]
    fn offsets_follow_task_ids() {
        assert_eq!(task_offset(1, 10_000_000).unwrap(), 0);
        assert_eq!(task_offset(65, 10_000_000).unwrap(), 640_000_000);
    }

    #[tokio::test]
    async fn task_zero_is_rejected_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource {
            names: names(4),
            ..Default::default()
        };
        let err = dump_names(&source, dir.path(), 0, 2).await.unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::InvalidTask(0)
        ));
        assert!(!dir.path().join(names_dump_filename(0)).exists());
        assert!(!dir.path().join(names_stats_filename(0)).exists());
    }

    #[tokio::test]
    async fn pages_are_deduplicated_and_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut rows = names(5);
        rows.insert(3, rows[2].clone());
        rows.push(NameRow {
            user_id: "5".to_string(),
            fullname: "P. Five".to_string(),
        });
        let source = MemorySource {
            names: rows,
            ..Default::default()
        };

        let stats = dump_names(&source, dir.path(), 1, 100).await.unwrap().unwrap();
        assert_eq!(stats.rows, 6);
        assert_eq!(stats.unique_users, 5);
        assert_eq!(stats.offset, 0);

        let file = std::fs::File::open(dir.path().join("batch_0001.parquet")).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(file).unwrap().build().unwrap();
        let total: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(total, 6);

        let values = read_key_values(&dir.path().join("batch_0001_stats.txt")).unwrap();
        assert_eq!(values["rows"], "6");
        assert_eq!(values["task_id"], "1");
    }

    #[tokio::test]
    async fn page_past_the_end_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource {
            names: names(3),
            ..Default::default()
        };
        assert!(dump_names(&source, dir.path(), 3, 2).await.unwrap().is_none());
        assert!(!dir.path().join("batch_0003.parquet").exists());
        assert!(!dir.path().join("batch_0003_stats.txt").exists());
    }

    #[tokio::test]
    async fn verify_lists_missing_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource {
            names: names(10),
            ..Default::default()
        };
        for task in [1, 2, 4] {
            dump_names(&source, dir.path(), task, 3).await.unwrap();
        }

        let report = verify_name_dumps(dir.path(), 5).unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.missing, vec![3, 5]);
        assert_eq!(report.total_rows, 7);
        assert_eq!(
            report.rerun_command().unwrap(),
            "qsub -t 3,5 extract_all_names.sh"
        );

        let summary = std::fs::read_to_string(dir.path().join(SUMMARY_FILE)).unwrap();
        assert!(summary.contains("Missing batches: [3, 5]"));
        assert!(summary.contains("Total rows: 7"));
    }

    #[tokio::test]
    async fn verify_passes_when_all_tasks_present() {
        let dir = tempfile::tempdir().unwrap();
        let source = MemorySource {
            names: names(4),
            ..Default::default()
        };
        for task in [1, 2] {
            dump_names(&source, dir.path(), task, 2).await.unwrap();
        }
        // a stray page outside the array range is not counted
        std::fs::copy(dir.path().join("batch_0001.parquet"), dir.path().join("batch_0000.parquet")).unwrap();
        std::fs::copy(dir.path().join("batch_0001_stats.txt"), dir.path().join("batch_0000_stats.txt")).unwrap();

        let report = verify_name_dumps(dir.path(), 2).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.rerun_command(), None);
        assert_eq!(report.found.len(), 2);
        assert_eq!(report.total_rows, 4);
    }
}
