use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

mod combine;
mod config;
mod error;
mod extract;
mod jobs;
mod logging;
mod names;
mod output;
mod partition;
mod revelio;
mod roster;
mod setup;

use config::{OutputFormat, PipelineConfig, TaskId};
use jobs::{write_job_scripts, JobCommand};
use revelio::RevelioClient;

#[derive(Parser)]
#[command(name = "revelio_extractor")]
#[command(about = "CEO roster to Revelio LinkedIn profile extraction on WRDS")]
struct Cli {
    /// TOML file overriding the built-in defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Project directory (roster, batch files, job scripts)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Scratch directory (extracted outputs, logs, name dumps)
    #[arg(long, global = true)]
    scratch_dir: Option<PathBuf>,

    /// Number of parallel workers (default: all cores)
    #[arg(short, long, global = true)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the directory layout and check the roster
    Init,

    /// Check environment, directories, inputs and disk space
    Check {
        /// Also connect to WRDS and query the Revelio tables
        #[arg(long)]
        db: bool,
    },

    /// Split the roster into batches and write the Grid Engine job scripts
    Split {
        /// Roster CSV (default: <project>/data/ceo_names_companies.csv)
        #[arg(short, long)]
        roster: Option<PathBuf>,

        /// Number of batches
        #[arg(short = 'n', long)]
        batches: Option<usize>,

        /// Shuffle seed
        #[arg(long)]
        seed: Option<u64>,

        /// Slice in roster order instead of shuffling
        #[arg(long, conflicts_with = "seed")]
        no_shuffle: bool,

        /// Binary the job scripts run (default: this executable)
        #[arg(long)]
        executable: Option<PathBuf>,
    },

    /// Match and extract one batch (defaults to SGE_TASK_ID)
    Extract {
        #[arg(short, long)]
        batch: Option<usize>,

        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Combine all completed batches into the enriched dataset
    Combine {
        /// Combine even when some batches are missing
        #[arg(long)]
        allow_partial: bool,
    },

    /// Dump one page of Revelio names (defaults to SGE_TASK_ID)
    Names {
        #[arg(short, long)]
        task: Option<usize>,

        #[arg(long)]
        rows_per_task: Option<i64>,
    },

    /// Verify the name dump is complete
    Verify {
        /// Directory holding the name dumps (default: <scratch>/name_batches)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Number of expected tasks
        #[arg(short, long)]
        expected: Option<usize>,
    },
}

impl Command {
    fn log_name(&self) -> &'static str {
        match self {
            Command::Init => "init",
            Command::Check { .. } => "check",
            Command::Split { .. } => "split",
            Command::Extract { .. } => "extract",
            Command::Combine { .. } => "combine",
            Command::Names { .. } => "names",
            Command::Verify { .. } => "verify",
        }
    }

    fn task_id(&self) -> Option<TaskId> {
        match self {
            Command::Extract { batch, .. } => Some(TaskId::from_env(*batch)),
            Command::Names { task, .. } => Some(TaskId::from_env(*task)),
            _ => None,
        }
    }
}

fn load_config(cli: &Cli) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.project_dir {
        config.paths.project_dir = dir.clone();
    }
    if let Some(dir) = &cli.scratch_dir {
        config.paths.scratch_dir = dir.clone();
    }
    if let Command::Split {
        roster,
        batches,
        seed,
        no_shuffle,
        ..
    } = &cli.command
    {
        if let Some(roster) = roster {
            config.paths.roster_file = Some(roster.clone());
        }
        if let Some(batches) = batches {
            config.batching.num_batches = *batches;
        }
        if *no_shuffle {
            config.batching.shuffle_seed = None;
        } else if seed.is_some() {
            config.batching.shuffle_seed = *seed;
        }
    }
    if let Command::Names {
        rows_per_task: Some(rows),
        ..
    } = &cli.command
    {
        config.names.rows_per_task = *rows;
    }
    config.validate()?;
    Ok(config)
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("Cannot resolve {}", path.display()))
}

fn split(config: &PipelineConfig, cli: &Cli, executable: Option<&Path>) -> Result<()> {
    // job scripts run from the scheduler's cwd, so every path they carry is absolute
    let mut config = config.clone();
    config.paths.project_dir = absolute(&config.paths.project_dir)?;
    config.paths.scratch_dir = absolute(&config.paths.scratch_dir)?;
    let roster_path = absolute(&config.paths.roster_file())?;

    let outcome = partition::split_roster(
        &roster_path,
        &config.paths.batch_dir(),
        &config.paths.extracted_dir(),
        config.batching.num_batches,
        config.batching.shuffle_seed,
        config.batching.expected_roster_size,
    )?;

    let command = JobCommand {
        executable: match executable {
            Some(path) => absolute(path)?,
            None => std::env::current_exe().context("Cannot locate the running executable")?,
        },
        config: cli.config.as_deref().map(absolute).transpose()?,
        project_dir: config.paths.project_dir.clone(),
        scratch_dir: config.paths.scratch_dir.clone(),
    };
    let scripts = write_job_scripts(&config, outcome.batches.len(), &command)?;

    println!(
        "Split {} CEOs into {} batches in {}",
        outcome.roster_entries,
        outcome.batches.len(),
        config.paths.batch_dir().display()
    );
    if outcome.skipped_blank + outcome.skipped_duplicates > 0 {
        println!(
            "Skipped {} blank and {} duplicate roster rows",
            outcome.skipped_blank, outcome.skipped_duplicates
        );
    }
    for (batch, file) in outcome.batches.iter().zip(&outcome.files) {
        println!(
            "  Batch {:02}: {} CEOs -> {}",
            batch.number,
            batch.entries.len(),
            file.display()
        );
    }
    println!("Manifest: {}", outcome.manifest.display());
    println!(
        "Submit with: bash {}",
        config.paths.jobs_dir().join(jobs::SUBMIT_SCRIPT).display()
    );
    info!("{} job scripts ready", scripts.len());
    Ok(())
}

async fn extract_batch(config: &PipelineConfig, batch: usize, format: Option<OutputFormat>) -> Result<()> {
    let format = format.unwrap_or(config.batching.output_format);
    let max = extract::expected_batches(config)?;
    if batch == 0 || batch > max {
        return Err(error::PipelineError::BatchOutOfRange { batch, max }.into());
    }
    let client = RevelioClient::connect(&config.wrds, &config.tables, &config.matching).await?;
    let result = extract::run_batch(&client, config, batch, format).await;
    client.close().await;

    match result {
        Ok(stats) => {
            println!(
                "Batch {:02}: {}/{} matched",
                batch,
                stats.matched(),
                stats.entries
            );
            Ok(())
        }
        Err(err) => {
            error!("Batch {} failed: {:#}", batch, err);
            Err(err)
        }
    }
}

async fn dump_name_page(config: &PipelineConfig, task: usize) -> Result<()> {
    names::task_offset(task, config.names.rows_per_task)?;
    let client = RevelioClient::connect(&config.wrds, &config.tables, &config.matching).await?;
    let result = names::dump_names(&client, &config.paths.names_dir(), task, config.names.rows_per_task).await;
    client.close().await;

    if let Some(stats) = result? {
        println!("Task {}: {} rows ({:.2} MB)", task, stats.rows, stats.file_size_mb);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    let task = cli.command.task_id();

    let log_path = logging::init_logging(
        &config.paths.logs_dir(),
        cli.command.log_name(),
        task.as_ref().map(TaskId::number),
    )?;
    info!("Logging to {}", log_path.display());
    match &cli.config {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("Using built-in configuration"),
    }
    if let Some(task) = &task {
        task.log();
    }
    let task_number = task.as_ref().map_or(1, TaskId::number);

    let max_workers = num_cpus::get();
    let num_workers = cli.workers.unwrap_or(max_workers);
    info!("Using {} workers (max available: {})", num_workers, max_workers);

    rayon::ThreadPoolBuilder::new()
        .num_threads(num_workers)
        .thread_name(|i| format!("revelio-worker-{}", i))
        .build_global()?;

    match &cli.command {
        Command::Init => {
            let report = setup::init(&config)?;
            println!(
                "Initialized {} directories ({:?} environment on {})",
                report.directories.len(),
                report.environment,
                report.hostname
            );
            match report.roster_entries {
                Some(n) => println!("Roster: {} entries", n),
                None => println!(
                    "Roster missing: copy it to {}",
                    config.paths.roster_file().display()
                ),
            }
        }
        Command::Check { db } => {
            let report = setup::check(&config, *db).await;
            for item in &report.items {
                println!("[{:>4}] {}: {}", item.status, item.name, item.detail);
            }
            if report.failures() > 0 {
                bail!("{} checks failed", report.failures());
            }
        }
        Command::Split { executable, .. } => split(&config, &cli, executable.as_deref())?,
        Command::Extract { format, .. } => {
            extract_batch(&config, task_number, *format).await?;
        }
        Command::Combine { allow_partial } => {
            let (_, outputs) = combine::combine(&config, *allow_partial)?;
            let report = std::fs::read_to_string(&outputs.report)?;
            print!("{}", report);
        }
        Command::Names { .. } => dump_name_page(&config, task_number).await?,
        Command::Verify { dir, expected } => {
            let dir = dir.clone().unwrap_or_else(|| config.paths.names_dir());
            let expected = expected.unwrap_or(config.names.expected_tasks);
            let report = names::verify_name_dumps(&dir, expected)?;
            print!("{}", names::render_dump_summary(&report));
            if !report.is_complete() {
                warn!("Name extraction incomplete");
                bail!("{} of {} tasks missing", report.missing.len(), expected);
            }
            info!("All {} name dumps present", expected);
        }
    }

    Ok(())
}
