use anyhow::Result;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{error, info, warn};

use crate::config::{batch_filename, PipelineConfig, RunEnvironment};
use crate::revelio::RevelioClient;
use crate::roster::load_roster;

const LOW_DISK_GB: f64 = 10.0;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "FAIL",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone)]
pub struct CheckItem {
    pub name: String,
    pub status: CheckStatus,
    pub detail: String,
}

#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub items: Vec<CheckItem>,
}

impl CheckReport {
    fn push(&mut self, name: &str, status: CheckStatus, detail: impl Into<String>) {
        let detail = detail.into();
        match status {
            CheckStatus::Pass => info!("[{}] {}: {}", status, name, detail),
            CheckStatus::Warn => warn!("[{}] {}: {}", status, name, detail),
            CheckStatus::Fail => error!("[{}] {}: {}", status, name, detail),
        }
        self.items.push(CheckItem {
            name: name.to_string(),
            status,
            detail,
        });
    }

    pub fn failures(&self) -> usize {
        self.items.iter().filter(|i| i.status == CheckStatus::Fail).count()
    }
}

#[derive(Debug, Clone)]
pub struct InitReport {
    pub environment: RunEnvironment,
    pub hostname: String,
    pub directories: Vec<PathBuf>,
    pub roster_entries: Option<usize>,
}

fn roster_check(config: &PipelineConfig, report: &mut CheckReport) -> Option<usize> {
    let path = config.paths.roster_file();
    if !path.exists() {
        report.push(
            "roster",
            CheckStatus::Fail,
            format!("{} not found; copy the CEO roster there", path.display()),
        );
        return None;
    }
    match load_roster(&path) {
        Ok(roster) => {
            let expected = config.batching.expected_roster_size;
            let status = if roster.len() == expected {
                CheckStatus::Pass
            } else {
                CheckStatus::Warn
            };
            report.push(
                "roster",
                status,
                format!(
                    "{} entries (expected {}), columns: {}",
                    roster.len(),
                    expected,
                    roster.headers.join(", ")
                ),
            );
            Some(roster.len())
        }
        Err(err) => {
            report.push("roster", CheckStatus::Fail, format!("{:#}", err));
            None
        }
    }
}

/// Prepares the directory layout and reports on the roster.
pub fn init(config: &PipelineConfig) -> Result<InitReport> {
    let (environment, hostname) = RunEnvironment::detect();
    match environment {
        RunEnvironment::Wrds => info!("Running on WRDS ({})", hostname),
        RunEnvironment::Local => warn!("Not on WRDS ({}): local development mode", hostname),
    }

    let directories = config.create_directories()?;
    for dir in &directories {
        info!("Created/verified: {}", dir.display());
    }

    let mut report = CheckReport::default();
    let roster_entries = roster_check(config, &mut report);

    Ok(InitReport {
        environment,
        hostname,
        directories,
        roster_entries,
    })
}

fn probe_writable(dir: &Path) -> std::io::Result<()> {
    let probe = dir.join(".write_probe");
    let mut file = File::create(&probe)?;
    file.write_all(b"ok")?;
    drop(file);
    std::fs::remove_file(&probe)
}

/// Free bytes on the filesystem holding `path` (longest matching mount).
pub fn free_space(path: &Path) -> Option<u64> {
    let path = path.canonicalize().ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

pub fn disk_status(free_bytes: u64) -> CheckStatus {
    if (free_bytes as f64 / GB) < LOW_DISK_GB {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    }
}

/// Everything except the database probe.
pub fn check_local(config: &PipelineConfig) -> CheckReport {
    let mut report = CheckReport::default();

    let (environment, hostname) = RunEnvironment::detect();
    match environment {
        RunEnvironment::Wrds => report.push("environment", CheckStatus::Pass, format!("WRDS ({})", hostname)),
        RunEnvironment::Local => report.push(
            "environment",
            CheckStatus::Warn,
            format!("{} is not a WRDS host", hostname),
        ),
    }

    for dir in config.paths.all_dirs() {
        let name = format!("directory {}", dir.display());
        if !dir.is_dir() {
            report.push(&name, CheckStatus::Fail, "missing (run init)");
            continue;
        }
        match probe_writable(&dir) {
            Ok(()) => report.push(&name, CheckStatus::Pass, "writable"),
            Err(err) => report.push(&name, CheckStatus::Fail, format!("not writable: {}", err)),
        }
    }

    roster_check(config, &mut report);

    let batch_dir = config.paths.batch_dir();
    let present = (1..=config.batching.num_batches)
        .filter(|&b| batch_dir.join(batch_filename(b)).exists())
        .count();
    let status = if present == config.batching.num_batches {
        CheckStatus::Pass
    } else {
        CheckStatus::Warn
    };
    report.push(
        "batch files",
        status,
        format!(
            "{} of {} in {} (run split to create them)",
            present,
            config.batching.num_batches,
            batch_dir.display()
        ),
    );

    match free_space(&config.paths.scratch_dir) {
        Some(free) => report.push(
            "disk space",
            disk_status(free),
            format!("{:.1} GB free under {}", free as f64 / GB, config.paths.scratch_dir.display()),
        ),
        None => report.push("disk space", CheckStatus::Warn, "could not determine free space"),
    }

    report
}

pub async fn check(config: &PipelineConfig, probe_db: bool) -> CheckReport {
    let mut report = check_local(config);
    if !probe_db {
        return report;
    }

    let connected = RevelioClient::connect(&config.wrds, &config.tables, &config.matching).await;
    match connected {
        Ok(client) => {
            match client.ping().await {
                Ok(()) => report.push(
                    "database",
                    CheckStatus::Pass,
                    format!("{} reachable as {}", config.tables.individual_user, config.wrds.username),
                ),
                Err(err) => report.push("database", CheckStatus::Fail, format!("{:#}", err)),
            }
            client.close().await;
        }
        Err(err) => report.push("database", CheckStatus::Fail, format!("{:#}", err)),
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.paths.project_dir = dir.join("project");
        config.paths.scratch_dir = dir.join("scratch");
        config.batching.num_batches = 2;
        config.batching.expected_roster_size = 3;
        config
    }

    fn status_of(report: &CheckReport, name: &str) -> Option<CheckStatus> {
        report.items.iter().find(|i| i.name == name).map(|i| i.status)
    }

    #[test]
    fn init_creates_layout_and_reads_roster() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        std::fs::create_dir_all(config.paths.data_dir()).unwrap();
        std::fs::write(
            config.paths.roster_file(),
            "first_name,surname,company\nA,One,X\nB,Two,Y\nC,Three,Z\n",
        )
        .unwrap();

        let report = init(&config).unwrap();
        assert_eq!(report.roster_entries, Some(3));
        assert!(config.paths.names_dir().is_dir());
        assert!(config.paths.jobs_dir().is_dir());
    }

    #[test]
    fn init_without_roster_still_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let report = init(&config).unwrap();
        assert_eq!(report.roster_entries, None);
        assert!(config.paths.extracted_dir().is_dir());
    }

    #[test]
    fn check_reports_missing_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let report = check_local(&config);
        assert_eq!(status_of(&report, "roster"), Some(CheckStatus::Fail));
        assert_eq!(status_of(&report, "batch files"), Some(CheckStatus::Warn));
        assert!(report.failures() > 0);

        config.create_directories().unwrap();
        let report = check_local(&config);
        let dir_failures = report
            .items
            .iter()
            .filter(|i| i.name.starts_with("directory") && i.status == CheckStatus::Fail)
            .count();
        assert_eq!(dir_failures, 0);
    }

    #[test]
    fn low_disk_space_is_a_warning() {
        assert_eq!(disk_status(5 * 1024 * 1024 * 1024), CheckStatus::Warn);
        assert_eq!(disk_status(50 * 1024 * 1024 * 1024), CheckStatus::Pass);
    }
}
