// ABOUTME: Handlers that create and tear down the Azure resources for a training run
// ABOUTME: Backs `provision`, `teardown`, and `nodeprep`; each step is one `az` call

use anyhow::{Context, Result};
use clap::ValueEnum;
use dialoguer::Confirm;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use super::config::secret_source;
use super::job::SCRIPTS_DIR;
use crate::azure::{command, AzureCli};
use crate::config::{ensure_password, EnvFile, ExperimentParams, ProjectSettings};
use crate::error::BatchError;
use crate::job::{builder, Framework};
use crate::staging::{self, DATASET_ARCHIVES, NODEPREP_SCRIPT_NAME};

// Masked in printed commands, so it never shows up in dry-run output
const DRY_RUN_PASSWORD: &str = "<cluster-password>";

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub params: ExperimentParams,
    pub generate_password: bool,
    /// Where the NFS staging script is written when real data is used.
    pub nodeprep_output: PathBuf,
}

impl ProvisionOptions {
    pub fn new(params: ExperimentParams) -> Self {
        Self {
            params,
            generate_password: false,
            nodeprep_output: PathBuf::from(NODEPREP_SCRIPT_NAME),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TeardownOptions {
    /// Also delete the workspace and the resource group.
    pub all: bool,
    pub yes: bool,
    /// Experiments to delete; every framework's when empty.
    pub frameworks: Vec<Framework>,
}

fn step(title: &str) {
    println!("==> {}", title);
}

fn require_file(path: &Path, hint: &str) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(BatchError::Config(format!("{} not found. {}", path.display(), hint)).into())
    }
}

/// Check every local input before the first `az` call.
fn check_local_inputs(params: &ExperimentParams) -> Result<()> {
    if !params.use_fake {
        for archive in DATASET_ARCHIVES {
            require_file(
                &params.data_dir.join(archive),
                "Prepare the ImageNet archives first or set use_fake = true",
            )?;
        }
    }
    if let Some(config) = &params.cluster_config {
        require_file(config, "Fix cluster_config in the parameters file")?;
    }
    for file in &params.cluster_setup_files {
        require_file(file, "Fix cluster_setup_files in the parameters file")?;
    }
    Ok(())
}

/// Create every resource for the run. A dry run prints the commands and leaves
/// the env file and the staging script untouched.
pub async fn provision(env_path: &Path, options: &ProvisionOptions, cli: &AzureCli) -> Result<()> {
    let params = &options.params;
    params.validate()?;
    let settings = params.settings();
    let dry_run = cli.is_dry_run();

    let password = if dry_run {
        println!("Dry run: {} is left unchanged", env_path.display());
        DRY_RUN_PASSWORD.to_string()
    } else {
        check_local_inputs(params)?;
        let mut store = EnvFile::open_or_create(env_path)?;
        settings.persist(&mut store)?;
        ensure_password(&mut store, secret_source(options.generate_password).as_mut())?
    };

    step("Resource group and storage");
    if let Some(subscription) = &params.subscription {
        cli.run(&command::account_set(subscription)).await?;
    }
    cli.run(&command::group_create(&settings)).await?;
    cli.run(&command::storage_account_create(&settings)).await?;
    let key = cli.storage_account_key(&settings).await?;
    cli.run(&command::share_create(&settings, &key)).await?;
    cli.run(&command::share_directory_create(&settings, &key, SCRIPTS_DIR))
        .await?;
    cli.run(&command::configure_defaults(&settings.location, &settings.group_name))
        .await?;

    step("Batch AI workspace");
    cli.run(&command::workspace_create(&settings)).await?;

    if params.use_fake {
        info!("Using fake data, skipping dataset upload");
    } else {
        step("Dataset upload");
        cli.run(&command::blob_container_create(&settings, &key)).await?;
        for archive in DATASET_ARCHIVES {
            let path = params.data_dir.join(archive);
            cli.run(&command::blob_upload(&settings, &key, &path, archive))
                .await?;
        }
    }

    step("NFS file server");
    cli.run(&command::file_server_create(&settings, &password)).await?;
    if !params.use_fake {
        if dry_run {
            println!("Dry run: {} is not written", options.nodeprep_output.display());
        } else {
            write_nodeprep(&settings, &key, &options.nodeprep_output)?;
        }
        let ip = cli.file_server_ip(&settings).await?;
        println!("Stage the dataset on the file server with:");
        println!("{}", staging::remote_run_hint(&settings, env_path, &ip));
    }

    step("Cluster");
    for file in &params.cluster_setup_files {
        cli.run(&command::share_upload(&settings, &key, file, SCRIPTS_DIR))
            .await?;
    }
    cli.run(&command::cluster_create(
        &settings,
        &password,
        &key,
        params.cluster_config.as_deref(),
    ))
    .await?;
    cli.run(&command::cluster_node_list(&settings)).await?;

    info!(cluster = %settings.cluster_name, dry_run, "Provisioning finished");
    Ok(())
}

pub async fn teardown(env_path: &Path, options: &TeardownOptions, cli: &AzureCli) -> Result<()> {
    let store = EnvFile::open(env_path)?;
    let settings = ProjectSettings::from_env_file(&store)?;

    if !options.yes && !cli.is_dry_run() {
        let prompt = if options.all {
            format!(
                "Delete cluster {} and resource group {}?",
                settings.cluster_name, settings.group_name
            )
        } else {
            format!("Delete cluster {}?", settings.cluster_name)
        };
        let confirmed = Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")?;
        if !confirmed {
            println!("Aborted");
            return Ok(());
        }
    }

    let frameworks: &[Framework] = if options.frameworks.is_empty() {
        Framework::value_variants()
    } else {
        &options.frameworks
    };

    cli.run(&command::configure_defaults("", "")).await?;
    for framework in frameworks {
        let experiment = builder::experiment_name(*framework, &settings);
        // Only experiments that had a job submitted exist
        if let Err(err) = cli.run(&command::experiment_delete(&settings, &experiment)).await {
            warn!(%experiment, error = %err, "Could not delete experiment, continuing");
        }
    }
    cli.run(&command::cluster_delete(&settings)).await?;

    if options.all {
        cli.run(&command::workspace_delete(&settings)).await?;
        cli.run(&command::group_delete(&settings)).await?;
    }
    info!(all = options.all, "Teardown finished");
    Ok(())
}

/// Render the staging script using the live storage key. A dry run prints it
/// instead of writing it.
pub async fn nodeprep(env_path: &Path, output: &Path, cli: &AzureCli) -> Result<()> {
    let store = EnvFile::open(env_path)?;
    let settings = ProjectSettings::from_env_file(&store)?;

    let key = cli.storage_account_key(&settings).await?;
    if cli.is_dry_run() {
        print!("{}", staging::nodeprep_script(&settings, &key));
        return Ok(());
    }
    write_nodeprep(&settings, &key, output)
}

fn write_nodeprep(settings: &ProjectSettings, key: &str, output: &Path) -> Result<()> {
    fs::write(output, staging::nodeprep_script(settings, key))
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn dry_run_cli() -> AzureCli {
        AzureCli::new(true).unwrap()
    }

    fn position(transcript: &[String], needle: &str) -> usize {
        transcript
            .iter()
            .position(|line| line.contains(needle))
            .unwrap_or_else(|| panic!("no command containing {:?} in {:#?}", needle, transcript))
    }

    #[tokio::test]
    async fn test_provision_dry_run_leaves_local_files_alone() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        let script_path = dir.path().join("nodeprep.sh");
        fs::write(&env_path, "CLUSTER_NAME=prodcluster\n").unwrap();
        fs::write(&script_path, "REAL SCRIPT").unwrap();

        // Real data and no --generate-password: a prompt here would hang the test
        let options = ProvisionOptions {
            nodeprep_output: script_path.clone(),
            ..ProvisionOptions::new(ExperimentParams::default())
        };
        let cli = dry_run_cli();
        provision(&env_path, &options, &cli).await.unwrap();

        assert_eq!(
            fs::read_to_string(&env_path).unwrap(),
            "CLUSTER_NAME=prodcluster\n"
        );
        assert_eq!(fs::read_to_string(&script_path).unwrap(), "REAL SCRIPT");

        let transcript = cli.transcript();
        let server = &transcript[position(&transcript, "file-server create")];
        assert!(server.contains(" -p **** "));
        assert!(!server.contains(DRY_RUN_PASSWORD));
        let upload = position(&transcript, "storage blob upload");
        assert!(upload < position(&transcript, "cluster create"));
    }

    #[tokio::test]
    async fn test_provision_uploads_setup_files_before_cluster_create() {
        let dir = tempdir().unwrap();
        let params = ExperimentParams {
            use_fake: true,
            cluster_config: Some(PathBuf::from("cluster/config.json")),
            cluster_setup_files: vec![
                PathBuf::from("cluster/docker.service"),
                PathBuf::from("cluster/nodeprep.sh"),
            ],
            ..ExperimentParams::default()
        };
        let cli = dry_run_cli();
        provision(&dir.path().join(".env"), &ProvisionOptions::new(params), &cli)
            .await
            .unwrap();

        let transcript = cli.transcript();
        let docker = position(&transcript, "--source cluster/docker.service --path scripts");
        let nodeprep = position(&transcript, "--source cluster/nodeprep.sh --path scripts");
        let cluster = position(&transcript, "batchai cluster create");
        assert!(transcript[docker].starts_with("az storage file upload "));
        assert!(docker < nodeprep && nodeprep < cluster);
        assert!(transcript[cluster].ends_with("--config-file cluster/config.json"));
        assert!(!dir.path().join(".env").exists());
    }

    #[tokio::test]
    async fn test_provision_reports_missing_setup_file() {
        let dir = tempdir().unwrap();
        let params = ExperimentParams {
            use_fake: true,
            cluster_setup_files: vec![dir.path().join("docker.service")],
            ..ExperimentParams::default()
        };
        let cli = AzureCli::with_program("az-not-called", false);

        let err = provision(&dir.path().join(".env"), &ProvisionOptions::new(params), &cli)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::Config(msg)) if msg.contains("docker.service")
        ));
        assert!(!dir.path().join(".env").exists());
    }

    fn persisted_env(dir: &Path) -> PathBuf {
        let env_path = dir.join(".env");
        let mut store = EnvFile::open_or_create(&env_path).unwrap();
        ExperimentParams::default().settings().persist(&mut store).unwrap();
        env_path
    }

    #[tokio::test]
    async fn test_teardown_deletes_experiments_before_cluster() {
        let dir = tempdir().unwrap();
        let env_path = persisted_env(dir.path());
        let cli = dry_run_cli();
        let options = TeardownOptions {
            all: true,
            ..TeardownOptions::default()
        };
        teardown(&env_path, &options, &cli).await.unwrap();

        let transcript = cli.transcript();
        assert_eq!(
            transcript[1],
            "az batchai experiment delete -w workspace --name distributed_keras_V100 \
             -g batchdtdemorg -y"
        );
        let experiments: Vec<&String> = transcript
            .iter()
            .filter(|line| line.contains("experiment delete"))
            .collect();
        assert_eq!(experiments.len(), 3);
        assert!(experiments[2].contains("--name distributed_tensorflow_V100"));
        assert!(position(&transcript, "tensorflow") < position(&transcript, "cluster delete"));
        assert!(transcript.last().unwrap().starts_with("az group delete"));
    }

    #[tokio::test]
    async fn test_teardown_limits_experiments_to_requested_frameworks() {
        let dir = tempdir().unwrap();
        let env_path = persisted_env(dir.path());
        let cli = dry_run_cli();
        let options = TeardownOptions {
            frameworks: vec![Framework::Pytorch],
            ..TeardownOptions::default()
        };
        teardown(&env_path, &options, &cli).await.unwrap();

        let transcript = cli.transcript();
        assert_eq!(transcript.len(), 3);
        assert!(transcript[1].contains("--name distributed_pytorch_V100"));
        assert!(transcript[2].starts_with("az batchai cluster delete"));
    }

    #[tokio::test]
    async fn test_teardown_requires_settings() {
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "PASSWORD=x\n").unwrap();

        let options = TeardownOptions {
            all: true,
            yes: true,
            ..TeardownOptions::default()
        };
        let err = teardown(&env_path, &options, &dry_run_cli()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::MissingKey(_))
        ));
    }

    #[tokio::test]
    async fn test_nodeprep_writes_script_and_dry_run_does_not() {
        let dir = tempdir().unwrap();
        let env_path = persisted_env(dir.path());
        let output = dir.path().join("nodeprep.sh");

        nodeprep(&env_path, &output, &dry_run_cli()).await.unwrap();
        assert!(!output.exists());

        write_nodeprep(
            &ExperimentParams::default().settings(),
            "<storage-account-key>",
            &output,
        )
        .unwrap();
        let script = fs::read_to_string(&output).unwrap();
        assert!(script.contains("--source-key <storage-account-key>"));
    }
}
