// ABOUTME: Handlers for writing, submitting, and monitoring Horovod training jobs
// ABOUTME: Backs the `job` subcommands; job settings come from the project env file

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::azure::command;
use crate::azure::{AzureCli, JobRef};
use crate::config::{EnvFile, ProjectSettings};
use crate::error::BatchError;
use crate::job::{
    builder, write_json_to_file, ExecutionState, Framework, HorovodJob, JobStatus, WriteMode,
};

pub const SCRIPTS_DIR: &str = "scripts";

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub framework: Framework,
    pub use_fake: bool,
    pub docker_repository: String,
    pub output: PathBuf,
}

/// Which job a monitoring command targets; the name defaults to the one `submit` uses.
#[derive(Debug, Clone)]
pub struct JobTarget {
    pub framework: Framework,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn file_name(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout.txt",
            LogStream::Stderr => "stderr.txt",
        }
    }
}

fn load_settings(env_path: &Path) -> Result<ProjectSettings> {
    let store = EnvFile::open(env_path)?;
    ProjectSettings::from_env_file(&store)
}

fn job_ref(settings: &ProjectSettings, target: &JobTarget) -> JobRef {
    let name = target
        .name
        .clone()
        .unwrap_or_else(|| builder::job_name(target.framework, settings));
    JobRef::new(settings, builder::experiment_name(target.framework, settings), name)
}

/// Build the job descriptor from the project settings and write it to `options.output`.
pub fn write(env_path: &Path, options: &JobOptions) -> Result<JobRef> {
    let settings = load_settings(env_path)?;
    let job = HorovodJob::new(options.framework, &settings, options.docker_repository.clone())
        .with_fake_data(options.use_fake);

    write_json_to_file(&job.descriptor(), &options.output, WriteMode::Truncate)?;
    println!(
        "Wrote {} job descriptor ({} nodes x {} processes) to {}",
        options.framework,
        settings.num_nodes,
        settings.processes_per_node,
        options.output.display()
    );

    Ok(JobRef::new(&settings, job.experiment_name(), job.job_name()))
}

pub async fn submit(
    env_path: &Path,
    options: &JobOptions,
    uploads: &[PathBuf],
    dry_run: bool,
    wait_interval: Option<Duration>,
) -> Result<()> {
    let settings = load_settings(env_path)?;
    let job = write(env_path, options)?;
    let cli = AzureCli::new(dry_run)?;

    if !uploads.is_empty() {
        let key = cli.storage_account_key(&settings).await?;
        for source in uploads {
            if !dry_run && !source.is_file() {
                return Err(BatchError::Config(format!(
                    "training script {} does not exist",
                    source.display()
                ))
                .into());
            }
            cli.run(&command::share_upload(&settings, &key, source, SCRIPTS_DIR))
                .await?;
        }
    }

    cli.run(&command::experiment_create(&settings, &job.experiment))
        .await?;
    cli.run(&command::job_create(&job, &settings.cluster_name, &options.output))
        .await?;
    info!(job = %job.name, experiment = %job.experiment, "Submitted job");

    match wait_interval {
        Some(_) if dry_run => warn!("Skipping wait in dry-run mode"),
        Some(interval) => {
            wait_for(&cli, &job, interval).await?;
        }
        None => println!("Submitted {}. Follow it with `job wait` or `job logs`", job.name),
    }
    Ok(())
}

pub async fn status(env_path: &Path, target: &JobTarget) -> Result<JobStatus> {
    let settings = load_settings(env_path)?;
    let job = job_ref(&settings, target);
    let cli = AzureCli::new(false)?;

    let status = cli.get_job_status(&job).await?;
    let state = status.execution_state.as_str();
    match status.exit_code() {
        Some(code) => println!("{}: {} (exit code {})", status.name, state, code),
        None => println!("{}: {}", status.name, state),
    }
    Ok(status)
}

pub async fn list(env_path: &Path, framework: Framework) -> Result<()> {
    let settings = load_settings(env_path)?;
    let cli = AzureCli::new(false)?;
    cli.run(&command::job_list(&settings, &builder::experiment_name(framework, &settings)))
        .await
}

pub async fn wait(env_path: &Path, target: &JobTarget, interval: Duration) -> Result<JobStatus> {
    let settings = load_settings(env_path)?;
    let job = job_ref(&settings, target);
    let cli = AzureCli::new(false)?;
    wait_for(&cli, &job, interval).await
}

pub async fn logs(env_path: &Path, target: &JobTarget, stream: LogStream) -> Result<()> {
    let settings = load_settings(env_path)?;
    let job = job_ref(&settings, target);
    let cli = AzureCli::new(false)?;
    cli.run(&command::job_file_stream(&job, stream.file_name()))
        .await
}

pub async fn delete(env_path: &Path, target: &JobTarget, dry_run: bool) -> Result<()> {
    let settings = load_settings(env_path)?;
    let job = job_ref(&settings, target);
    let cli = AzureCli::new(dry_run)?;
    cli.run(&command::job_delete(&job)).await
}

async fn wait_for(cli: &AzureCli, job: &JobRef, interval: Duration) -> Result<JobStatus> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}")?);
    spinner.set_message(format!("Waiting for {}", job.name));
    spinner.enable_steady_tick(Duration::from_millis(120));

    let result = cli
        .poll_until_complete(job, interval, |status| {
            spinner.set_message(format!(
                "{} is {}",
                status.name,
                status.execution_state.as_str()
            ))
        })
        .await;
    spinner.finish_and_clear();

    let status = result?;
    if status.execution_state == ExecutionState::Succeeded {
        println!("Job {} succeeded", status.name);
        return Ok(status);
    }

    let exit_code = status
        .exit_code()
        .map_or_else(|| "unknown".to_string(), |code| code.to_string());
    Err(BatchError::Command(format!(
        "Job {} failed with exit code {}. Inspect it with `job logs --stderr`",
        status.name, exit_code
    ))
    .into())
}
