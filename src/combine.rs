use anyhow::{Context, Result};
use chrono::Local;
use glob::glob;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write as _;
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::config::{batch_filename, combined_stem, job_script_filename, OutputFormat, PipelineConfig};
use crate::error::PipelineError;
use crate::extract::{expected_batches, is_batch_complete};
use crate::output::{read_enriched, write_enriched, write_unmatched, EnrichedRecord, MatchStatus, UnmatchedRecord};
use crate::roster::load_roster;

pub const UNMATCHED_FILE: &str = "unmatched_ceos.csv";
pub const REPORT_FILE: &str = "extraction_report.txt";

#[derive(Debug, Clone, Default)]
pub struct CombineSummary {
    pub expected_batches: usize,
    pub combined_batches: Vec<usize>,
    pub incomplete_batches: Vec<usize>,
    pub total: usize,
    pub by_status: BTreeMap<MatchStatus, usize>,
    pub per_batch: BTreeMap<i64, usize>,
    pub with_education: usize,
    pub with_skills: usize,
    pub duplicates_dropped: usize,
    pub missing_roster_ids: Vec<usize>,
}

impl CombineSummary {
    pub fn matched(&self) -> usize {
        self.by_status
            .iter()
            .filter(|(status, _)| status.is_matched())
            .map(|(_, n)| n)
            .sum()
    }

    pub fn match_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.matched() as f64 / self.total as f64 * 100.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct CombineOutputs {
    pub csv: PathBuf,
    pub parquet: PathBuf,
    pub unmatched: PathBuf,
    pub report: PathBuf,
}

fn batch_number(path: &Path) -> Option<usize> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix("batch_")?.split('_').next()?.parse().ok()
}

fn modified(path: &Path) -> SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Per-batch output files keyed by batch number. When a batch was written in
/// both formats the newer file wins.
pub fn find_batch_outputs(extracted_dir: &Path) -> Result<BTreeMap<usize, PathBuf>> {
    let pattern = extracted_dir.join("batch_*_extracted.*");
    let mut outputs: BTreeMap<usize, PathBuf> = BTreeMap::new();

    for entry in glob(&pattern.to_string_lossy())? {
        let path = entry?;
        if OutputFormat::from_path(&path).is_none() {
            continue;
        }
        let Some(batch) = batch_number(&path) else {
            warn!("Ignoring unexpected file {}", path.display());
            continue;
        };
        if let Some(existing) = outputs.get(&batch) {
            let newer = if modified(existing) >= modified(&path) {
                existing.clone()
            } else {
                path
            };
            warn!("Batch {} has several outputs, using {}", batch, newer.display());
            outputs.insert(batch, newer);
        } else {
            outputs.insert(batch, path);
        }
    }
    Ok(outputs)
}

/// Shell lines that resubmit the given batches.
pub fn rerun_hint(config: &PipelineConfig, batches: &[usize]) -> String {
    batches
        .iter()
        .map(|&b| format!("qsub {}", config.paths.jobs_dir().join(job_script_filename(b)).display()))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Default)]
struct BatchFileCheck {
    missing: BTreeSet<usize>,
    stale: BTreeMap<usize, Vec<i64>>,
}

/// Compares every batch output with its batch file. Listed ids absent from
/// the output are missing; rows whose id is not in the file, or whose names
/// differ from it, were extracted under an earlier split.
fn check_against_batch_files(
    config: &PipelineConfig,
    outputs: &[(usize, &[EnrichedRecord])],
) -> Result<BatchFileCheck> {
    let mut check = BatchFileCheck::default();
    for &(batch, records) in outputs {
        let path = config.paths.batch_dir().join(batch_filename(batch));
        if !path.exists() {
            warn!("Batch file {} not found, skipping id check", path.display());
            continue;
        }
        let listed: HashMap<i64, (String, String)> = load_roster(&path)?
            .entries
            .into_iter()
            .map(|e| (e.roster_id as i64, (e.first_name, e.surname)))
            .collect();

        let stale: Vec<i64> = records
            .iter()
            .filter(|r| match listed.get(&r.roster_id) {
                Some((first, surname)) => first != &r.first_name || surname != &r.surname,
                None => true,
            })
            .map(|r| r.roster_id)
            .collect();
        if !stale.is_empty() {
            check.stale.insert(batch, stale);
        }

        let present: BTreeSet<i64> = records.iter().map(|r| r.roster_id).collect();
        check.missing.extend(
            listed
                .keys()
                .filter(|id| !present.contains(*id))
                .map(|&id| id as usize),
        );
    }
    Ok(check)
}

fn summarize(records: &[EnrichedRecord], summary: &mut CombineSummary) {
    summary.total = records.len();
    for record in records {
        *summary.by_status.entry(record.match_status).or_insert(0) += 1;
        *summary.per_batch.entry(record.batch).or_insert(0) += 1;
        if record.n_education > 0 {
            summary.with_education += 1;
        }
        if record.n_skills > 0 {
            summary.with_skills += 1;
        }
    }
}

pub fn render_report(summary: &CombineSummary, outputs: &CombineOutputs) -> String {
    let mut out = String::new();
    let pct = |n: usize| {
        if summary.total == 0 {
            0.0
        } else {
            n as f64 / summary.total as f64 * 100.0
        }
    };

    let _ = writeln!(out, "CEO LinkedIn Extraction Report");
    let _ = writeln!(out, "{}", "=".repeat(50));
    let _ = writeln!(out, "Generated: {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"));
    let _ = writeln!(
        out,
        "Batches combined: {} of {}",
        summary.combined_batches.len(),
        summary.expected_batches
    );
    if !summary.incomplete_batches.is_empty() {
        let _ = writeln!(out, "Incomplete batches: {:?}", summary.incomplete_batches);
    }
    let _ = writeln!(out, "Total CEOs: {}", summary.total);
    let _ = writeln!(
        out,
        "Matched: {} ({:.1}%)\n",
        summary.matched(),
        summary.match_rate()
    );

    let _ = writeln!(out, "Match status:");
    let _ = writeln!(out, "{}", "-".repeat(30));
    for status in MatchStatus::ALL {
        let n = summary.by_status.get(&status).copied().unwrap_or(0);
        let _ = writeln!(out, "  {:<20} {:>6} ({:.1}%)", status.as_str(), n, pct(n));
    }

    let _ = writeln!(out, "\nProfiles with education: {}", summary.with_education);
    let _ = writeln!(out, "Profiles with skills: {}", summary.with_skills);
    if summary.duplicates_dropped > 0 {
        let _ = writeln!(out, "Duplicate roster ids dropped: {}", summary.duplicates_dropped);
    }
    if !summary.missing_roster_ids.is_empty() {
        let _ = writeln!(
            out,
            "Roster ids missing from outputs: {:?}",
            summary.missing_roster_ids
        );
    }

    let _ = writeln!(out, "\nRows per batch:");
    for (batch, rows) in &summary.per_batch {
        let _ = writeln!(out, "  Batch {:02}: {}", batch, rows);
    }

    let _ = writeln!(out, "\nOutput files:");
    for path in [&outputs.csv, &outputs.parquet, &outputs.unmatched] {
        let _ = writeln!(out, "  {}", path.display());
    }
    out
}

/// Concatenates the completed batch outputs into the combined dataset.
pub fn combine(config: &PipelineConfig, allow_partial: bool) -> Result<(CombineSummary, CombineOutputs)> {
    let expected = expected_batches(config)?;
    let extracted_dir = config.paths.extracted_dir();
    let found = find_batch_outputs(&extracted_dir)?;

    let mut summary = CombineSummary {
        expected_batches: expected,
        ..Default::default()
    };
    let mut to_read = Vec::new();
    for batch in 1..=expected {
        match found.get(&batch) {
            Some(path) if is_batch_complete(&extracted_dir, batch) => {
                to_read.push((batch, path.clone()));
            }
            Some(path) => {
                warn!("Batch {} has no stats file, {} is incomplete", batch, path.display());
                summary.incomplete_batches.push(batch);
            }
            None => summary.incomplete_batches.push(batch),
        }
    }
    for batch in found.keys().filter(|&&b| b > expected) {
        warn!("Ignoring output for batch {} (expected {} batches)", batch, expected);
    }

    if !summary.incomplete_batches.is_empty() {
        let hint = rerun_hint(config, &summary.incomplete_batches);
        if !allow_partial {
            warn!("Resubmit the missing batches with:\n{}", hint);
            return Err(PipelineError::MissingBatches(summary.incomplete_batches).into());
        }
        warn!(
            "Combining without batches {:?}; rerun later with:\n{}",
            summary.incomplete_batches, hint
        );
    }

    info!("Reading {} batch outputs...", to_read.len());
    let per_batch: Vec<Vec<EnrichedRecord>> = to_read
        .par_iter()
        .map(|(batch, path)| -> Result<Vec<EnrichedRecord>> {
            let records = read_enriched(path)
                .with_context(|| format!("Failed to read batch {} output", batch))?;
            info!("Batch {}: {} rows from {}", batch, records.len(), path.display());
            Ok(records)
        })
        .collect::<Result<_>>()?;
    summary.combined_batches = to_read.iter().map(|(b, _)| *b).collect();

    let check = {
        let outputs: Vec<(usize, &[EnrichedRecord])> = summary
            .combined_batches
            .iter()
            .copied()
            .zip(per_batch.iter().map(Vec::as_slice))
            .collect();
        check_against_batch_files(config, &outputs)?
    };
    if !check.stale.is_empty() {
        for (batch, ids) in &check.stale {
            warn!("Batch {} output has rows not in its batch file: {:?}", batch, ids);
        }
        let batches: Vec<usize> = check.stale.keys().copied().collect();
        warn!("Resubmit them with:\n{}", rerun_hint(config, &batches));
        return Err(PipelineError::StaleOutputs(batches).into());
    }

    let mut records: Vec<EnrichedRecord> = per_batch.into_iter().flatten().collect();
    records.sort_by_key(|r| r.roster_id);
    let before = records.len();
    records.dedup_by_key(|r| r.roster_id);
    summary.duplicates_dropped = before - records.len();
    if summary.duplicates_dropped > 0 {
        warn!("Dropped {} duplicate roster ids", summary.duplicates_dropped);
    }

    summary.missing_roster_ids = check.missing.into_iter().collect();
    if !summary.missing_roster_ids.is_empty() {
        warn!(
            "{} roster ids missing from outputs: {:?}",
            summary.missing_roster_ids.len(),
            summary.missing_roster_ids
        );
    }
    summarize(&records, &mut summary);

    let combined_dir = config.paths.combined_dir();
    create_dir_all(&combined_dir)?;
    let stem = combined_stem(&Local::now());
    let outputs = CombineOutputs {
        csv: combined_dir.join(format!("{}.csv", stem)),
        parquet: combined_dir.join(format!("{}.parquet", stem)),
        unmatched: combined_dir.join(UNMATCHED_FILE),
        report: combined_dir.join(REPORT_FILE),
    };

    write_enriched(&outputs.csv, OutputFormat::Csv, &records)?;
    write_enriched(&outputs.parquet, OutputFormat::Parquet, &records)?;
    let unmatched: Vec<UnmatchedRecord> = records
        .iter()
        .filter(|r| !r.match_status.is_matched())
        .map(UnmatchedRecord::from)
        .collect();
    write_unmatched(&outputs.unmatched, &unmatched)?;

    let report = render_report(&summary, &outputs);
    std::fs::write(&outputs.report, &report)
        .with_context(|| format!("Failed to write {}", outputs.report.display()))?;

    info!(
        "Combined {} CEOs from {} batches: {} matched ({:.1}%) -> {}",
        summary.total,
        summary.combined_batches.len(),
        summary.matched(),
        summary.match_rate(),
        outputs.csv.display()
    );
    Ok((summary, outputs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{batch_stats_filename, extracted_filename};
    use crate::output::{sample_record, write_key_values};
    use crate::partition::split_roster;

    fn config(dir: &Path, batches: usize) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.paths.project_dir = dir.join("project");
        config.paths.scratch_dir = dir.join("scratch");
        config.batching.num_batches = batches;
        create_dir_all(config.paths.extracted_dir()).unwrap();
        config
    }

    fn finished_batch(config: &PipelineConfig, batch: usize, format: OutputFormat, records: &[EnrichedRecord]) {
        let dir = config.paths.extracted_dir();
        write_enriched(&dir.join(extracted_filename(batch, format)), format, records).unwrap();
        write_key_values(
            &dir.join(batch_stats_filename(batch)),
            &[("entries".to_string(), records.len().to_string())],
        )
        .unwrap();
    }

    #[test]
    fn combines_completed_batches_in_roster_order() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        finished_batch(
            &config,
            1,
            OutputFormat::Csv,
            &[
                sample_record(4, 1, MatchStatus::CompanyConfirmed),
                sample_record(1, 1, MatchStatus::Unmatched),
            ],
        );
        finished_batch(
            &config,
            2,
            OutputFormat::Parquet,
            &[
                sample_record(3, 2, MatchStatus::NameUnique),
                sample_record(2, 2, MatchStatus::NameAmbiguous),
            ],
        );

        let (summary, outputs) = combine(&config, false).unwrap();
        assert_eq!(summary.total, 4);
        assert_eq!(summary.matched(), 3);
        assert_eq!(summary.combined_batches, vec![1, 2]);
        assert_eq!(summary.per_batch[&2], 2);
        assert_eq!(summary.with_skills, 4);

        let combined = read_enriched(&outputs.csv).unwrap();
        let ids: Vec<i64> = combined.iter().map(|r| r.roster_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(read_enriched(&outputs.parquet).unwrap(), combined);

        let unmatched = std::fs::read_to_string(&outputs.unmatched).unwrap();
        assert_eq!(unmatched.lines().count(), 2);
        let report = std::fs::read_to_string(&outputs.report).unwrap();
        assert!(report.contains("Total CEOs: 4"));
        assert!(report.contains("Matched: 3 (75.0%)"));
    }

    #[test]
    fn batch_without_stats_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        finished_batch(&config, 1, OutputFormat::Csv, &[sample_record(1, 1, MatchStatus::NameUnique)]);
        // output present but the job never finished
        write_enriched(
            &config.paths.extracted_dir().join(extracted_filename(2, OutputFormat::Csv)),
            OutputFormat::Csv,
            &[],
        )
        .unwrap();

        let err = combine(&config, false).unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::MissingBatches(ref b) if b == &vec![2]
        ));

        let (summary, _) = combine(&config, true).unwrap();
        assert_eq!(summary.incomplete_batches, vec![2]);
        assert_eq!(summary.total, 1);
    }

    #[test]
    fn duplicate_roster_ids_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        finished_batch(&config, 1, OutputFormat::Csv, &[sample_record(7, 1, MatchStatus::NameUnique)]);
        finished_batch(&config, 2, OutputFormat::Csv, &[sample_record(7, 2, MatchStatus::NameUnique)]);

        let (summary, _) = combine(&config, false).unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.duplicates_dropped, 1);
    }

    #[test]
    fn rows_missing_from_outputs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1);
        create_dir_all(config.paths.batch_dir()).unwrap();
        std::fs::write(
            config.paths.batch_dir().join(batch_filename(1)),
            "roster_id,first_name,surname\n1,First1,Last1\n2,First2,Last2\n",
        )
        .unwrap();
        finished_batch(&config, 1, OutputFormat::Csv, &[sample_record(1, 1, MatchStatus::NameUnique)]);

        let (summary, _) = combine(&config, false).unwrap();
        assert_eq!(summary.missing_roster_ids, vec![2]);
    }

    fn write_roster(path: &Path, people: &[usize]) {
        let mut text = String::from("first_name,surname\n");
        for i in people {
            text.push_str(&format!("First{},Last{}\n", i, i));
        }
        std::fs::write(path, text).unwrap();
    }

    /// Finishes every batch of the current split with rows for its entries.
    fn extract_all(config: &PipelineConfig) {
        for batch in 1..=expected_batches(config).unwrap() {
            let entries = load_roster(&config.paths.batch_dir().join(batch_filename(batch)))
                .unwrap()
                .entries;
            let records: Vec<EnrichedRecord> = entries
                .iter()
                .map(|e| {
                    let mut record = sample_record(e.roster_id as i64, batch as i64, MatchStatus::NameUnique);
                    record.first_name = e.first_name.clone();
                    record.surname = e.surname.clone();
                    record
                })
                .collect();
            finished_batch(config, batch, OutputFormat::Csv, &records);
        }
    }

    #[test]
    fn resplit_invalidates_earlier_extractions() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 2);
        let roster_path = dir.path().join("roster.csv");
        let split = |entries: usize| {
            split_roster(
                &roster_path,
                &config.paths.batch_dir(),
                &config.paths.extracted_dir(),
                2,
                Some(1),
                entries,
            )
            .unwrap()
        };

        write_roster(&roster_path, &[1, 2, 3, 4]);
        split(4);
        extract_all(&config);
        assert_eq!(combine(&config, false).unwrap().0.total, 4);

        // row 1 leaves the roster, so every roster id shifts
        write_roster(&roster_path, &[2, 3, 4]);
        split(3);
        let err = combine(&config, false).unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::MissingBatches(ref b) if b == &vec![1, 2]
        ));

        extract_all(&config);
        let (summary, outputs) = combine(&config, false).unwrap();
        assert_eq!(summary.total, 3);
        let combined = read_enriched(&outputs.csv).unwrap();
        assert_eq!(combined[0].first_name, "First2");
    }

    #[test]
    fn outputs_from_another_split_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), 1);
        create_dir_all(config.paths.batch_dir()).unwrap();
        std::fs::write(
            config.paths.batch_dir().join(batch_filename(1)),
            "roster_id,first_name,surname\n1,First2,Last2\n2,First3,Last3\n",
        )
        .unwrap();
        // a job from the previous split finished after the re-split
        finished_batch(
            &config,
            1,
            OutputFormat::Csv,
            &[
                sample_record(1, 1, MatchStatus::NameUnique),
                sample_record(2, 1, MatchStatus::NameUnique),
                sample_record(3, 1, MatchStatus::NameUnique),
            ],
        );

        let err = combine(&config, true).unwrap_err();
        assert!(matches!(
            err.downcast::<PipelineError>().unwrap(),
            PipelineError::StaleOutputs(ref b) if b == &vec![1]
        ));
    }

    #[test]
    fn batch_numbers_come_from_file_names() {
        assert_eq!(batch_number(Path::new("/x/batch_03_extracted.csv")), Some(3));
        assert_eq!(batch_number(Path::new("/x/notes.csv")), None);
    }

    #[test]
    fn rerun_hint_lists_job_scripts() {
        let mut config = PipelineConfig::default();
        config.paths.project_dir = PathBuf::from("/home/me/proj");
        assert_eq!(
            rerun_hint(&config, &[2, 5]),
            "qsub /home/me/proj/jobs/batch_02.sh\nqsub /home/me/proj/jobs/batch_05.sh"
        );
    }
}
