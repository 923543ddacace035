use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use glob::glob;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{batch_filename, MANIFEST_FILE};
use crate::error::PipelineError;
use crate::roster::{load_roster, write_entries, Roster, RosterEntry};

#[derive(Debug, Clone)]
pub struct Batch {
    pub number: usize,
    pub entries: Vec<RosterEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestBatch {
    pub number: usize,
    pub file: String,
    pub entries: usize,
    pub first_roster_id: usize,
    pub last_roster_id: usize,
}

/// Written next to the batch files; `combine` reads it to know what to expect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchManifest {
    pub created_at: DateTime<Local>,
    pub roster_file: PathBuf,
    pub roster_entries: usize,
    pub num_batches: usize,
    pub shuffle_seed: Option<u64>,
    pub batches: Vec<ManifestBatch>,
}

impl BatchManifest {
    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open manifest {}", path.display()))?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create manifest {}", path.display()))?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }
}

/// Sizes differ by at most one; the first `total % n` batches get the extra entry.
pub fn batch_sizes(total: usize, num_batches: usize) -> Result<Vec<usize>, PipelineError> {
    if num_batches == 0 || num_batches > total {
        return Err(PipelineError::InvalidBatchCount {
            entries: total,
            batches: num_batches,
        });
    }
    let base = total / num_batches;
    let remainder = total % num_batches;
    Ok((0..num_batches)
        .map(|i| base + usize::from(i < remainder))
        .collect())
}

/// Shuffle-and-slice. The same seed always yields the same batches, on any
/// rand release.
pub fn partition(
    mut entries: Vec<RosterEntry>,
    num_batches: usize,
    seed: Option<u64>,
) -> Result<Vec<Batch>, PipelineError> {
    let sizes = batch_sizes(entries.len(), num_batches)?;

    if let Some(seed) = seed {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        entries.shuffle(&mut rng);
    }

    let mut batches = Vec::with_capacity(num_batches);
    let mut remaining = entries.into_iter();
    for (i, size) in sizes.into_iter().enumerate() {
        let mut batch_entries: Vec<RosterEntry> = remaining.by_ref().take(size).collect();
        batch_entries.sort_by_key(|e| e.roster_id);
        batches.push(Batch {
            number: i + 1,
            entries: batch_entries,
        });
    }
    Ok(batches)
}

pub fn write_batches(headers: &[String], batches: &[Batch], batch_dir: &Path) -> Result<Vec<PathBuf>> {
    create_dir_all(batch_dir)?;
    let mut saved = Vec::with_capacity(batches.len());
    for batch in batches {
        let path = batch_dir.join(batch_filename(batch.number));
        write_entries(&path, headers, &batch.entries)?;
        info!(
            "Saved batch {}: {} ({} entries)",
            batch.number,
            path.display(),
            batch.entries.len()
        );
        saved.push(path);
    }
    Ok(saved)
}

pub fn render_batch_summary(roster: &Roster, batches: &[Batch], batch_dir: &Path) -> String {
    let mut out = String::new();
    let total: usize = batches.iter().map(|b| b.entries.len()).sum();
    let _ = writeln!(out, "CEO Batch Split Summary");
    let _ = writeln!(out, "{}\n", "=".repeat(50));
    let _ = writeln!(out, "Total CEOs: {}", total);
    let _ = writeln!(
        out,
        "Skipped rows: {} blank, {} duplicate",
        roster.skipped_blank, roster.skipped_duplicates
    );
    let _ = writeln!(out, "Number of batches: {}", batches.len());
    let _ = writeln!(out, "Batch directory: {}\n", batch_dir.display());
    let _ = writeln!(out, "Batch Details:");
    let _ = writeln!(out, "{}", "-".repeat(30));
    for batch in batches {
        let _ = writeln!(out, "\nBatch {:02}:", batch.number);
        let _ = writeln!(out, "  File: {}", batch_filename(batch.number));
        let _ = writeln!(out, "  CEOs: {}", batch.entries.len());
        if let (Some(first), Some(last)) = (batch.entries.first(), batch.entries.last()) {
            let _ = writeln!(out, "  First CEO: {}", first.display_name());
            let _ = writeln!(out, "  Last CEO: {}", last.display_name());
        }
    }
    out
}

pub fn build_manifest(
    roster_file: &Path,
    roster_entries: usize,
    seed: Option<u64>,
    batches: &[Batch],
) -> BatchManifest {
    BatchManifest {
        created_at: Local::now(),
        roster_file: roster_file.to_path_buf(),
        roster_entries,
        num_batches: batches.len(),
        shuffle_seed: seed,
        batches: batches
            .iter()
            .map(|b| ManifestBatch {
                number: b.number,
                file: batch_filename(b.number),
                entries: b.entries.len(),
                first_roster_id: b.entries.first().map_or(0, |e| e.roster_id),
                last_roster_id: b.entries.last().map_or(0, |e| e.roster_id),
            })
            .collect(),
    }
}

/// Re-reads the written batches: every roster entry exactly once.
pub fn verify_batches(roster: &Roster, files: &[PathBuf]) -> Result<()> {
    info!("Verifying batch integrity...");
    let mut ids = HashSet::new();
    let mut rows = HashSet::new();
    let mut total = 0;

    for path in files {
        let batch = load_roster(path)?;
        for entry in batch.entries {
            total += 1;
            if !ids.insert(entry.roster_id) {
                return Err(PipelineError::Verification(format!(
                    "roster_id {} appears in more than one batch",
                    entry.roster_id
                ))
                .into());
            }
            if !rows.insert(entry.fields) {
                return Err(PipelineError::Verification(format!(
                    "duplicate record for roster_id {}",
                    entry.roster_id
                ))
                .into());
            }
        }
    }

    if total != roster.len() {
        return Err(PipelineError::Verification(format!(
            "count mismatch: roster {}, batches {}",
            roster.len(),
            total
        ))
        .into());
    }
    let missing = roster
        .entries
        .iter()
        .filter(|e| !ids.contains(&e.roster_id))
        .count();
    if missing > 0 {
        return Err(PipelineError::Verification(format!(
            "{} roster entries are not in any batch",
            missing
        ))
        .into());
    }

    info!("Count verification passed: {} entries, no duplicates", total);
    Ok(())
}

pub const SUMMARY_FILE: &str = "batch_summary.txt";

#[derive(Debug, Clone)]
pub struct SplitOutcome {
    pub roster_entries: usize,
    pub skipped_blank: usize,
    pub skipped_duplicates: usize,
    pub batches: Vec<Batch>,
    pub files: Vec<PathBuf>,
    pub manifest: PathBuf,
}

/// Batch files left over from an earlier split into more batches.
fn remove_stale_batches(batch_dir: &Path, num_batches: usize) -> Result<()> {
    let pattern = batch_dir.join("batch_*_ceos.csv");
    for entry in glob(&pattern.to_string_lossy())? {
        let path = entry?;
        let number = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("batch_"))
            .and_then(|n| n.split('_').next())
            .and_then(|n| n.parse::<usize>().ok());
        if number.is_some_and(|n| n > num_batches) {
            warn!("Removing stale batch file {}", path.display());
            std::fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Completion markers of batches extracted under an earlier split. Their
/// roster ids point at other rows once the roster is split again.
fn invalidate_extractions(extracted_dir: &Path) -> Result<usize> {
    let pattern = extracted_dir.join("batch_*_stats.txt");
    let mut removed = 0;
    for entry in glob(&pattern.to_string_lossy())? {
        let path = entry?;
        std::fs::remove_file(&path)
            .with_context(|| format!("Failed to remove {}", path.display()))?;
        removed += 1;
    }
    if removed > 0 {
        warn!(
            "Invalidated {} finished batches in {}; re-run extract for every batch",
            removed,
            extracted_dir.display()
        );
    }
    Ok(removed)
}

/// Loads the roster, writes the batch files, summary and manifest, then
/// re-reads everything to verify the split. Extractions finished under a
/// previous split stop counting as complete.
pub fn split_roster(
    roster_path: &Path,
    batch_dir: &Path,
    extracted_dir: &Path,
    num_batches: usize,
    seed: Option<u64>,
    expected_entries: usize,
) -> Result<SplitOutcome> {
    let roster = load_roster(roster_path)?;
    if roster.len() != expected_entries {
        warn!(
            "Roster has {} entries, expected {}",
            roster.len(),
            expected_entries
        );
    }

    let batches = partition(roster.entries.clone(), num_batches, seed)?;
    match seed {
        Some(seed) => info!("Shuffled with seed {} into {} batches", seed, num_batches),
        None => info!("Sliced in roster order into {} batches", num_batches),
    }

    create_dir_all(batch_dir)?;
    remove_stale_batches(batch_dir, num_batches)?;
    invalidate_extractions(extracted_dir)?;
    let files = write_batches(&roster.headers, &batches, batch_dir)?;

    let summary_path = batch_dir.join(SUMMARY_FILE);
    std::fs::write(&summary_path, render_batch_summary(&roster, &batches, batch_dir))
        .with_context(|| format!("Failed to write {}", summary_path.display()))?;

    let manifest = batch_dir.join(MANIFEST_FILE);
    build_manifest(roster_path, roster.len(), seed, &batches).write(&manifest)?;
    info!("Wrote {} and {}", summary_path.display(), manifest.display());

    verify_batches(&roster, &files)?;

    Ok(SplitOutcome {
        roster_entries: roster.len(),
        skipped_blank: roster.skipped_blank,
        skipped_duplicates: roster.skipped_duplicates,
        batches,
        files,
        manifest,
    })
}
