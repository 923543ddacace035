use anyhow::{Context as _, Result};
use serde::Serialize;
use std::fs::{create_dir_all, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tera::{Context, Tera};
use tracing::info;

use crate::config::{job_script_filename, PipelineConfig};

pub const SUBMIT_SCRIPT: &str = "submit_all_batches.sh";
pub const NAMES_ARRAY_SCRIPT: &str = "extract_all_names.sh";

const BATCH_JOB_TEMPLATE: &str = r#"#!/bin/bash
#$ -N {{ job_name }}
#$ -cwd
#$ -pe {{ parallel_env }} {{ cores }}
#$ -l m_mem_free={{ memory }}
#$ -l h_rt={{ runtime }}
{% if queue %}#$ -q {{ queue }}
{% endif %}#$ -o {{ log_dir }}/{{ log_stem }}.out
#$ -e {{ log_dir }}/{{ log_stem }}.err

echo "Starting {{ job_name }} on $(hostname) at $(date)"
cd {{ project_dir }}

{{ command }}
status=$?

echo "{{ job_name }} finished at $(date) with exit code ${status}"
exit ${status}
"#;

const SUBMIT_TEMPLATE: &str = r#"#!/bin/bash
# Submits {{ scripts | length }} batch jobs; Grid Engine runs at most {{ max_concurrent }} per user.
set -e
{% for script in scripts %}qsub {{ script }}
{% endfor %}
echo "Submitted {{ scripts | length }} jobs. Monitor with: qstat -u $USER"
"#;

/// How a job re-invokes this binary: same config file and directories as
/// the `split` that wrote it.
#[derive(Debug, Clone)]
pub struct JobCommand {
    pub executable: PathBuf,
    pub config: Option<PathBuf>,
    pub project_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl JobCommand {
    fn render(&self, subcommand: &[&str]) -> String {
        let mut parts = vec![quote_path(&self.executable)];
        if let Some(config) = &self.config {
            parts.push("--config".to_string());
            parts.push(quote_path(config));
        }
        parts.push("--project-dir".to_string());
        parts.push(quote_path(&self.project_dir));
        parts.push("--scratch-dir".to_string());
        parts.push(quote_path(&self.scratch_dir));
        parts.extend(subcommand.iter().map(|s| s.to_string()));
        parts.join(" ")
    }
}

#[derive(Serialize)]
struct JobHeader<'a> {
    job_name: String,
    log_stem: String,
    parallel_env: &'a str,
    cores: u32,
    memory: &'a str,
    runtime: &'a str,
    queue: Option<&'a str>,
    log_dir: String,
    project_dir: String,
    command: String,
}

fn quote_path(path: &Path) -> String {
    shell_words::quote(&path.to_string_lossy()).into_owned()
}

fn header<'a>(config: &'a PipelineConfig, job_name: String, log_stem: String, command: String) -> JobHeader<'a> {
    let resources = &config.resources;
    JobHeader {
        job_name,
        log_stem,
        parallel_env: &resources.parallel_env,
        cores: resources.cores,
        memory: &resources.memory,
        runtime: &resources.runtime,
        queue: resources.queue.as_deref(),
        log_dir: quote_path(&config.paths.logs_dir()),
        project_dir: quote_path(&config.paths.project_dir),
        command,
    }
}

fn render(template: &str, context: &Context) -> Result<String> {
    Tera::one_off(template, context, false).context("Failed to render job template")
}

pub fn render_batch_script(config: &PipelineConfig, batch: usize, command: &JobCommand) -> Result<String> {
    let batch_arg = batch.to_string();
    let job_name = format!("ceo_batch_{:02}", batch);
    let header = header(
        config,
        job_name.clone(),
        job_name,
        command.render(&["extract", "--batch", &batch_arg]),
    );
    render(BATCH_JOB_TEMPLATE, &Context::from_serialize(&header)?)
}

pub fn render_submit_script(config: &PipelineConfig, scripts: &[PathBuf]) -> Result<String> {
    let mut context = Context::new();
    let scripts: Vec<String> = scripts.iter().map(|p| quote_path(p)).collect();
    context.insert("scripts", &scripts);
    context.insert("max_concurrent", &config.resources.max_concurrent);
    render(SUBMIT_TEMPLATE, &context)
}

/// Array job over the name dump; the task index comes from `SGE_TASK_ID`.
/// Grid Engine expands `$TASK_ID` in the log paths, one pair per task.
pub fn render_names_array_script(config: &PipelineConfig, command: &JobCommand) -> Result<String> {
    let header = header(
        config,
        "revelio_names".to_string(),
        "revelio_names.$TASK_ID".to_string(),
        command.render(&["names"]),
    );
    let script = render(BATCH_JOB_TEMPLATE, &Context::from_serialize(&header)?)?;
    // the array directives go right after the shebang
    let array = format!(
        "#$ -t 1-{}\n#$ -tc {}\n",
        config.names.expected_tasks, config.resources.max_concurrent
    );
    Ok(match script.split_once('\n') {
        Some((shebang, rest)) => format!("{}\n{}{}", shebang, array, rest),
        None => script,
    })
}

fn write_script(path: &Path, contents: &str) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create job script {}", path.display()))?;
    file.write_all(contents.as_bytes())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Writes one script per batch, the submit-all script and the name-dump array
/// script. Returns the per-batch script paths.
pub fn write_job_scripts(
    config: &PipelineConfig,
    num_batches: usize,
    command: &JobCommand,
) -> Result<Vec<PathBuf>> {
    let jobs_dir = config.paths.jobs_dir();
    create_dir_all(&jobs_dir)?;

    let mut scripts = Vec::with_capacity(num_batches);
    for batch in 1..=num_batches {
        let path = jobs_dir.join(job_script_filename(batch));
        write_script(&path, &render_batch_script(config, batch, command)?)?;
        scripts.push(path);
    }

    let submit = jobs_dir.join(SUBMIT_SCRIPT);
    write_script(&submit, &render_submit_script(config, &scripts)?)?;

    let names = jobs_dir.join(NAMES_ARRAY_SCRIPT);
    write_script(&names, &render_names_array_script(config, command)?)?;

    info!(
        "Wrote {} job scripts to {} (submit with {})",
        scripts.len(),
        jobs_dir.display(),
        submit.display()
    );
    Ok(scripts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command() -> JobCommand {
        JobCommand {
            executable: PathBuf::from("/opt/bin/revelio_extractor"),
            config: Some(PathBuf::from("/home/me/my config.toml")),
            project_dir: PathBuf::from("/home/me/managers_revelio"),
            scratch_dir: PathBuf::from("/scratch/me"),
        }
    }

    #[test]
    fn batch_script_carries_resources_and_command() {
        let mut config = PipelineConfig::default();
        config.paths.project_dir = PathBuf::from("/home/me/managers_revelio");
        config.paths.scratch_dir = PathBuf::from("/scratch/me");

        let script = render_batch_script(&config, 3, &command()).unwrap();
        assert!(script.starts_with("#!/bin/bash\n#$ -N ceo_batch_03\n"));
        assert!(script.contains("#$ -pe onenode 2\n"));
        assert!(script.contains("#$ -l m_mem_free=16G\n"));
        assert!(script.contains("#$ -l h_rt=02:00:00\n"));
        assert!(!script.contains("#$ -q"));
        assert!(script.contains("#$ -o /scratch/me/logs/ceo_batch_03.out"));
        assert!(script.contains("cd /home/me/managers_revelio\n"));
        assert!(script.contains(
            "/opt/bin/revelio_extractor --config '/home/me/my config.toml' \
             --project-dir /home/me/managers_revelio --scratch-dir /scratch/me extract --batch 3\n"
        ));
        assert!(script.contains("exit ${status}"));
    }

    #[test]
    fn queue_directive_is_optional() {
        let mut config = PipelineConfig::default();
        config.resources.queue = Some("all.q".to_string());
        let script = render_batch_script(&config, 1, &command()).unwrap();
        assert!(script.contains("#$ -q all.q\n#$ -o "));
    }

    #[test]
    fn submit_script_queues_every_batch() {
        let config = PipelineConfig::default();
        let scripts: Vec<PathBuf> = (1..=5)
            .map(|i| PathBuf::from(format!("jobs/{}", job_script_filename(i))))
            .collect();
        let script = render_submit_script(&config, &scripts).unwrap();
        assert_eq!(script.matches("qsub ").count(), 5);
        assert!(script.contains("qsub jobs/batch_05.sh\n"));
        assert!(script.contains("Submits 5 batch jobs"));
    }

    #[test]
    fn names_script_is_an_array_job() {
        let mut config = PipelineConfig::default();
        config.paths.scratch_dir = PathBuf::from("/tmp/managers_revelio");
        let script = render_names_array_script(&config, &command()).unwrap();
        assert!(script.starts_with("#!/bin/bash\n#$ -t 1-65\n#$ -tc 5\n#$ -N revelio_names\n"));
        assert!(script.contains("names\n"));
        assert!(script.contains("#$ -o /tmp/managers_revelio/logs/revelio_names.$TASK_ID.out\n"));
        assert!(script.contains("#$ -e /tmp/managers_revelio/logs/revelio_names.$TASK_ID.err\n"));
    }

    #[test]
    fn scripts_are_written_to_the_jobs_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.paths.project_dir = dir.path().to_path_buf();

        let scripts = write_job_scripts(&config, 2, &command()).unwrap();
        assert_eq!(scripts.len(), 2);
        assert!(dir.path().join("jobs/batch_02.sh").exists());
        assert!(dir.path().join("jobs").join(SUBMIT_SCRIPT).exists());
        assert!(dir.path().join("jobs").join(NAMES_ARRAY_SCRIPT).exists());
    }
}
