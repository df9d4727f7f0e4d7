// ABOUTME: Runs Azure CLI commands for provisioning and job management
// ABOUTME: Streams or captures output, parses JSON responses, and polls job status

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

use super::command::{self, AzCommand, JobRef};
use crate::config::ProjectSettings;
use crate::error::BatchError;
use crate::job::JobStatus;

const DRY_RUN_STORAGE_KEY: &str = "<storage-account-key>";
const DRY_RUN_FILE_SERVER_IP: &str = "<file-server-ip>";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageKey {
    key_name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileServer {
    mount_settings: MountSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MountSettings {
    file_server_public_ip: String,
}

pub struct AzureCli {
    program: PathBuf,
    dry_run: bool,
    /// Commands printed instead of run, in order.
    transcript: Mutex<Vec<String>>,
}

impl AzureCli {
    pub fn new(dry_run: bool) -> Result<Self> {
        if dry_run {
            return Ok(Self::with_program("az", true));
        }

        let program = which::which("az").context(
            "Failed to locate the Azure CLI (az) on PATH. Install it from \
             https://aka.ms/azure-cli, or rerun with --dry-run to print the commands instead",
        )?;
        debug!(program = %program.display(), "Found Azure CLI");
        Ok(Self::with_program(program, false))
    }

    pub fn with_program(program: impl Into<PathBuf>, dry_run: bool) -> Self {
        Self {
            program: program.into(),
            dry_run,
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// The masked command lines a dry run has printed so far.
    pub fn transcript(&self) -> Vec<String> {
        self.transcript
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Run a command with inherited stdio so its output streams to the terminal.
    pub async fn run(&self, command: &AzCommand) -> Result<()> {
        if self.dry_run {
            let line = command.to_string();
            println!("{}", line);
            match self.transcript.lock() {
                Ok(mut lines) => lines.push(line),
                Err(poisoned) => poisoned.into_inner().push(line),
            }
            return Ok(());
        }

        info!(%command, "Running Azure CLI command");
        let status = Command::new(&self.program)
            .args(command.args())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .with_context(|| format!("Failed to start `{}`", command))?;

        if !status.success() {
            return Err(BatchError::Command(format!("`{}` exited with {}", command, status)).into());
        }
        Ok(())
    }

    /// Run a command and parse its stdout as JSON.
    pub async fn capture_json<T: DeserializeOwned>(&self, command: &AzCommand) -> Result<T> {
        if self.dry_run {
            return Err(BatchError::Command(format!(
                "`{}` needs a live Azure CLI and cannot run in dry-run mode",
                command
            ))
            .into());
        }

        debug!(%command, "Capturing Azure CLI output");
        let output = Command::new(&self.program)
            .args(command.args())
            .stdin(Stdio::null())
            .output()
            .await
            .with_context(|| format!("Failed to start `{}`", command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BatchError::Command(format!(
                "`{}` exited with {}: {}",
                command,
                output.status,
                stderr.trim()
            ))
            .into());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        parse_cli_json(&stdout)
            .with_context(|| format!("Failed to parse JSON output of `{}`", command))
    }

    pub async fn storage_account_key(&self, settings: &ProjectSettings) -> Result<String> {
        if self.dry_run {
            return Ok(DRY_RUN_STORAGE_KEY.to_string());
        }

        let keys: Vec<StorageKey> = self
            .capture_json(&command::storage_account_keys(settings))
            .await?;
        let key = keys.into_iter().next().ok_or_else(|| {
            BatchError::Command(format!(
                "No access keys returned for storage account {}",
                settings.storage_account_name
            ))
        })?;
        debug!(key_name = %key.key_name, "Using storage account key");
        Ok(key.value)
    }

    pub async fn file_server_ip(&self, settings: &ProjectSettings) -> Result<String> {
        if self.dry_run {
            return Ok(DRY_RUN_FILE_SERVER_IP.to_string());
        }

        let servers: Vec<FileServer> = self
            .capture_json(&command::file_server_list(settings))
            .await?;
        servers
            .into_iter()
            .next()
            .map(|server| server.mount_settings.file_server_public_ip)
            .ok_or_else(|| {
                BatchError::Command(format!(
                    "No file server found in workspace {}",
                    settings.workspace
                ))
                .into()
            })
    }

    pub async fn get_job_status(&self, job: &JobRef) -> Result<JobStatus> {
        self.capture_json(&command::job_show(job))
            .await
            .with_context(|| format!("Failed to get status of job {}", job.name))
    }

    pub async fn poll_until_complete(
        &self,
        job: &JobRef,
        interval: Duration,
        callback: impl Fn(&JobStatus),
    ) -> Result<JobStatus> {
        loop {
            let status = self.get_job_status(job).await?;
            callback(&status);

            if status.execution_state.is_terminal() {
                return Ok(status);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Parse CLI JSON output, skipping the warning lines `az` prints for preview commands.
pub fn parse_cli_json<T: DeserializeOwned>(stdout: &str) -> Result<T> {
    let filtered = stdout
        .lines()
        .filter(|line| !line.contains("WARNING"))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(serde_json::from_str(&filtered)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExperimentParams;
    use crate::job::ExecutionState;

    #[test]
    fn test_parse_cli_json_skips_warnings() {
        let stdout = "WARNING: This command is in preview.\n\
                      [{\"keyName\": \"key1\", \"value\": \"abc==\"}]\n";
        let keys: Vec<StorageKey> = parse_cli_json(stdout).unwrap();
        assert_eq!(keys[0].value, "abc==");
    }

    #[test]
    fn test_parse_cli_json_reports_garbage() {
        assert!(parse_cli_json::<Vec<StorageKey>>("not json").is_err());
    }

    #[tokio::test]
    async fn test_dry_run_prints_instead_of_running() {
        let cli = AzureCli::new(true).unwrap();
        let settings = ExperimentParams::default().settings();

        assert!(cli.is_dry_run());
        cli.run(&command::group_create(&settings)).await.unwrap();
        assert_eq!(
            cli.transcript(),
            vec!["az group create -n batchdtdemorg -l eastus -o table".to_string()]
        );
        assert_eq!(cli.storage_account_key(&settings).await.unwrap(), DRY_RUN_STORAGE_KEY);
        assert_eq!(cli.file_server_ip(&settings).await.unwrap(), DRY_RUN_FILE_SERVER_IP);

        let job = JobRef::new(&settings, "exp", "job");
        assert!(cli.get_job_status(&job).await.is_err());
    }

    #[cfg(unix)]
    mod fake_cli {
        use super::*;
        use std::cell::Cell;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::Path;
        use tempfile::TempDir;

        // Writing then executing scripts from parallel tests can hit ETXTBSY
        static SCRIPT_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

        fn fake_az(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("az");
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        fn job() -> JobRef {
            let settings = ExperimentParams::default().settings();
            JobRef::new(&settings, "distributed_keras_V100", "keras-horovod-8")
        }

        #[tokio::test]
        async fn test_poll_until_complete_stops_on_terminal_state() {
            let _guard = SCRIPT_LOCK.lock().await;
            let dir = TempDir::new().unwrap();
            let counter = dir.path().join("count");
            let script = format!(
                r#"n=$(cat "{counter}" 2>/dev/null || echo 0)
n=$((n + 1))
echo $n > "{counter}"
if [ "$n" -lt 3 ]; then state=running; else state=succeeded; fi
echo "WARNING: This command is in preview."
printf '{{"name": "keras-horovod-8", "executionState": "%s"}}\n' "$state""#,
                counter = counter.display()
            );
            let cli = AzureCli::with_program(fake_az(dir.path(), &script), false);

            let calls = Cell::new(0);
            let status = cli
                .poll_until_complete(&job(), Duration::from_millis(10), |_| {
                    calls.set(calls.get() + 1)
                })
                .await
                .unwrap();

            assert_eq!(status.execution_state, ExecutionState::Succeeded);
            assert_eq!(calls.get(), 3);
        }

        #[tokio::test]
        async fn test_failed_command_carries_stderr() {
            let _guard = SCRIPT_LOCK.lock().await;
            let dir = TempDir::new().unwrap();
            let cli = AzureCli::with_program(
                fake_az(dir.path(), "echo 'ERROR: job not found' >&2\nexit 3"),
                false,
            );

            let err = cli.get_job_status(&job()).await.unwrap_err();
            match err.downcast_ref::<BatchError>() {
                Some(BatchError::Command(msg)) => assert!(msg.contains("ERROR: job not found")),
                other => panic!("unexpected error: {:?}", other),
            }

            let err = cli.run(&command::job_delete(&job())).await.unwrap_err();
            assert!(matches!(
                err.downcast_ref::<BatchError>(),
                Some(BatchError::Command(_))
            ));
        }
    }
}
