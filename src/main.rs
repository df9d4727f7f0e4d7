// ABOUTME: Command-line entry point for the Batch AI Horovod orchestrator
// ABOUTME: Parses arguments, configures logging, and dispatches to the command handlers

use anyhow::{Context, Result};
use batchai_horovod::azure::AzureCli;
use batchai_horovod::commands::job::{JobOptions, JobTarget, LogStream};
use batchai_horovod::commands::provision::{ProvisionOptions, TeardownOptions};
use batchai_horovod::commands;
use batchai_horovod::config::settings::default_docker_repository;
use batchai_horovod::config::{EnvFile, ExperimentParams};
use batchai_horovod::job::Framework;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "batchai-horovod")]
#[command(version)]
#[command(
    about = "Provision Azure Batch AI resources and run distributed Horovod ResNet50 training",
    long_about = None
)]
struct Cli {
    /// Project env file; defaults to the nearest .env in this directory or its parents
    #[arg(long, global = true, env = "BATCHAI_HOROVOD_ENV_FILE")]
    env_file: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write the project settings derived from the experiment parameters into the env file
    Init {
        /// TOML file with experiment parameters
        #[arg(long)]
        params: Option<PathBuf>,
    },

    /// Read and write env-file entries
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Create the resource group, storage, workspace, NFS server, and cluster
    Provision {
        #[arg(long)]
        params: Option<PathBuf>,

        /// Skip the dataset upload and NFS staging
        #[arg(long)]
        fake: bool,

        /// Generate the cluster password instead of prompting for it
        #[arg(long)]
        generate_password: bool,

        /// Node setup file to upload to the share's scripts directory (repeatable)
        #[arg(long = "setup-file")]
        setup_files: Vec<PathBuf>,

        /// Print the az commands without running them or touching local files
        #[arg(long)]
        dry_run: bool,
    },

    /// Write, submit, and monitor training jobs
    #[command(subcommand)]
    Job(JobCommand),

    /// Delete the experiments and the cluster and, with --all, the workspace and resource group
    Teardown {
        #[arg(long)]
        all: bool,

        /// Only delete this framework's experiment (repeatable); defaults to all of them
        #[arg(short, long = "framework", value_enum)]
        frameworks: Vec<Framework>,

        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,

        #[arg(long)]
        dry_run: bool,
    },

    /// Write the script that stages ImageNet onto the NFS server
    Nodeprep {
        #[arg(short, long, default_value = "nodeprep.sh")]
        output: PathBuf,

        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: String,
    },
    List {
        /// Print secret values instead of masking them
        #[arg(long)]
        show_secrets: bool,
    },
    /// Make sure PASSWORD is set, prompting only if it is missing
    Password {
        #[arg(long)]
        generate: bool,
    },
    /// Make sure an arbitrary secret is set, prompting only if it is missing
    Secret {
        key: String,
    },
}

#[derive(Args, Debug)]
struct DescriptorArgs {
    #[arg(short, long, value_enum, default_value_t = Framework::Keras)]
    framework: Framework,

    /// Train on synthetic data instead of ImageNet
    #[arg(long)]
    fake: bool,

    /// Registry namespace holding the caia-horovod-* images
    #[arg(long, env = "DOCKER_REPOSITORY")]
    docker_repository: Option<String>,

    #[arg(short, long, default_value = "job.json")]
    output: PathBuf,
}

impl DescriptorArgs {
    fn into_options(self) -> JobOptions {
        JobOptions {
            framework: self.framework,
            use_fake: self.fake,
            docker_repository: self
                .docker_repository
                .unwrap_or_else(default_docker_repository),
            output: self.output,
        }
    }
}

#[derive(Args, Debug)]
struct TargetArgs {
    #[arg(short, long, value_enum, default_value_t = Framework::Keras)]
    framework: Framework,

    /// Job name; defaults to <framework>-horovod-<total processes>
    #[arg(short, long)]
    name: Option<String>,
}

impl From<TargetArgs> for JobTarget {
    fn from(args: TargetArgs) -> Self {
        JobTarget {
            framework: args.framework,
            name: args.name,
        }
    }
}

#[derive(Subcommand, Debug)]
enum JobCommand {
    /// Write the job descriptor JSON
    Write(DescriptorArgs),

    /// Write the descriptor, create the experiment, and submit the job
    Submit {
        #[command(flatten)]
        descriptor: DescriptorArgs,

        /// Training scripts to upload to the share before submitting
        #[arg(long = "upload")]
        uploads: Vec<PathBuf>,

        /// Block until the job finishes
        #[arg(long)]
        wait: bool,

        /// Seconds between status checks while waiting
        #[arg(long, default_value_t = 30)]
        interval: u64,

        #[arg(long)]
        dry_run: bool,
    },

    Status(TargetArgs),

    /// List jobs in the framework's experiment
    List {
        #[arg(short, long, value_enum, default_value_t = Framework::Keras)]
        framework: Framework,
    },

    Wait {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long, default_value_t = 30)]
        interval: u64,
    },

    /// Stream the job's stdout (or stderr)
    Logs {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        stderr: bool,
    },

    Delete {
        #[command(flatten)]
        target: TargetArgs,

        #[arg(long)]
        dry_run: bool,
    },
}

fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn resolve_env_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path),
        None => {
            let cwd = std::env::current_dir().context("Failed to read the current directory")?;
            EnvFile::discover(cwd)
        }
    }
}

fn load_params(path: Option<&Path>, fake: bool) -> Result<ExperimentParams> {
    let mut params = ExperimentParams::load_or_default(path)?;
    params.use_fake |= fake;
    Ok(params)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let env_path = resolve_env_path(cli.env_file)?;

    match cli.command {
        Commands::Init { params } => {
            commands::config::init(&env_path, params.as_deref())?;
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommand::Get { key } => {
                commands::config::get(&env_path, &key)?;
            }
            ConfigCommand::Set { key, value } => commands::config::set(&env_path, &key, &value)?,
            ConfigCommand::List { show_secrets } => {
                commands::config::list(&env_path, show_secrets)?;
            }
            ConfigCommand::Password { generate } => {
                commands::config::password(&env_path, generate)?;
            }
            ConfigCommand::Secret { key } => commands::config::secret(&env_path, &key)?,
        },
        Commands::Provision {
            params,
            fake,
            generate_password,
            setup_files,
            dry_run,
        } => {
            let mut params = load_params(params.as_deref(), fake)?;
            params.cluster_setup_files.extend(setup_files);
            let options = ProvisionOptions {
                generate_password,
                ..ProvisionOptions::new(params)
            };
            let cli = AzureCli::new(dry_run)?;
            commands::provision::provision(&env_path, &options, &cli).await?;
        }
        Commands::Job(cmd) => match cmd {
            JobCommand::Write(args) => {
                commands::job::write(&env_path, &args.into_options())?;
            }
            JobCommand::Submit {
                descriptor,
                uploads,
                wait,
                interval,
                dry_run,
            } => {
                let wait_interval = wait.then(|| Duration::from_secs(interval));
                commands::job::submit(
                    &env_path,
                    &descriptor.into_options(),
                    &uploads,
                    dry_run,
                    wait_interval,
                )
                .await?;
            }
            JobCommand::Status(target) => {
                commands::job::status(&env_path, &target.into()).await?;
            }
            JobCommand::List { framework } => commands::job::list(&env_path, framework).await?,
            JobCommand::Wait { target, interval } => {
                let interval = Duration::from_secs(interval);
                commands::job::wait(&env_path, &target.into(), interval).await?;
            }
            JobCommand::Logs { target, stderr } => {
                let stream = if stderr { LogStream::Stderr } else { LogStream::Stdout };
                commands::job::logs(&env_path, &target.into(), stream).await?;
            }
            JobCommand::Delete { target, dry_run } => {
                commands::job::delete(&env_path, &target.into(), dry_run).await?;
            }
        },
        Commands::Teardown {
            all,
            frameworks,
            yes,
            dry_run,
        } => {
            let options = TeardownOptions {
                all,
                yes,
                frameworks,
            };
            let cli = AzureCli::new(dry_run)?;
            commands::provision::teardown(&env_path, &options, &cli).await?;
        }
        Commands::Nodeprep { output, dry_run } => {
            let cli = AzureCli::new(dry_run)?;
            commands::provision::nodeprep(&env_path, &output, &cli).await?;
        }
    }

    Ok(())
}
