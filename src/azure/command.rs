// ABOUTME: Argument-vector builders for the `az` invocations used by provisioning and jobs
// ABOUTME: Display renders a shell-quoted command line with secret values masked

use std::borrow::Cow;
use std::fmt;
use std::path::Path;

use crate::config::ProjectSettings;

const MASK: &str = "****";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzCommand {
    args: Vec<String>,
    // Indices into `args` that must never be printed
    secrets: Vec<usize>,
}

impl AzCommand {
    pub fn new(subcommand: &[&str]) -> Self {
        Self {
            args: subcommand.iter().map(|s| s.to_string()).collect(),
            secrets: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn opt(mut self, name: &str, value: impl Into<String>) -> Self {
        self.args.push(name.to_string());
        self.args.push(value.into());
        self
    }

    pub fn secret(mut self, name: &str, value: impl Into<String>) -> Self {
        self.args.push(name.to_string());
        self.secrets.push(self.args.len());
        self.args.push(value.into());
        self
    }

    pub fn output(self, format: &str) -> Self {
        self.opt("-o", format)
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for AzCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("az")?;
        for (idx, arg) in self.args.iter().enumerate() {
            if self.secrets.contains(&idx) {
                write!(f, " {}", MASK)?;
            } else {
                write!(f, " {}", shell_quote(arg))?;
            }
        }
        Ok(())
    }
}

fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+%".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', "'\\''")))
    }
}

/// Identifies one job inside a workspace experiment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRef {
    pub group: String,
    pub workspace: String,
    pub experiment: String,
    pub name: String,
}

impl JobRef {
    pub fn new(
        settings: &ProjectSettings,
        experiment: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            group: settings.group_name.clone(),
            workspace: settings.workspace.clone(),
            experiment: experiment.into(),
            name: name.into(),
        }
    }
}

// Subscription, group, defaults

pub fn account_set(subscription: &str) -> AzCommand {
    AzCommand::new(&["account", "set"]).opt("--subscription", subscription)
}

pub fn group_create(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["group", "create"])
        .opt("-n", &settings.group_name)
        .opt("-l", &settings.location)
        .output("table")
}

pub fn group_delete(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["group", "delete"])
        .opt("--name", &settings.group_name)
        .arg("-y")
}

pub fn configure_defaults(location: &str, group: &str) -> AzCommand {
    AzCommand::new(&["configure", "--defaults"])
        .arg(format!("location={}", location))
        .arg(format!("group={}", group))
}

// Storage

pub fn storage_account_create(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["storage", "account", "create"])
        .opt("-l", &settings.location)
        .opt("-n", &settings.storage_account_name)
        .opt("-g", &settings.group_name)
        .opt("--sku", "Standard_LRS")
        .output("table")
}

pub fn storage_account_keys(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["storage", "account", "keys", "list"])
        .opt("-n", &settings.storage_account_name)
        .opt("-g", &settings.group_name)
        .output("json")
}

fn storage(subcommand: &[&str], settings: &ProjectSettings, key: &str) -> AzCommand {
    AzCommand::new(subcommand)
        .opt("--account-name", &settings.storage_account_name)
        .secret("--account-key", key)
}

pub fn share_create(settings: &ProjectSettings, key: &str) -> AzCommand {
    storage(&["storage", "share", "create"], settings, key)
        .opt("--name", &settings.file_share_name)
}

pub fn share_directory_create(settings: &ProjectSettings, key: &str, directory: &str) -> AzCommand {
    storage(&["storage", "directory", "create"], settings, key)
        .opt("--share-name", &settings.file_share_name)
        .opt("--name", directory)
}

pub fn share_upload(
    settings: &ProjectSettings,
    key: &str,
    source: &Path,
    directory: &str,
) -> AzCommand {
    storage(&["storage", "file", "upload"], settings, key)
        .opt("--share-name", &settings.file_share_name)
        .opt("--source", source.display().to_string())
        .opt("--path", directory)
}

pub fn blob_container_create(settings: &ProjectSettings, key: &str) -> AzCommand {
    storage(&["storage", "container", "create"], settings, key)
        .opt("--name", &settings.container_name)
}

pub fn blob_upload(
    settings: &ProjectSettings,
    key: &str,
    file: &Path,
    blob_name: &str,
) -> AzCommand {
    storage(&["storage", "blob", "upload"], settings, key)
        .opt("--container-name", &settings.container_name)
        .opt("--file", file.display().to_string())
        .opt("--name", blob_name)
}

// Batch AI workspace, file server, cluster

pub fn workspace_create(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["batchai", "workspace", "create"])
        .opt("-n", &settings.workspace)
        .opt("-g", &settings.group_name)
        .opt("-l", &settings.location)
}

pub fn workspace_delete(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["batchai", "workspace", "delete"])
        .opt("-n", &settings.workspace)
        .opt("-g", &settings.group_name)
        .arg("-y")
}

pub fn file_server_create(settings: &ProjectSettings, password: &str) -> AzCommand {
    AzCommand::new(&["batchai", "file-server", "create"])
        .opt("-n", &settings.nfs_name)
        .opt("--disk-count", "4")
        .opt("--disk-size", "250")
        .opt("-w", &settings.workspace)
        .opt("-s", "Standard_DS4_v2")
        .opt("-u", &settings.username)
        .secret("-p", password)
        .opt("-g", &settings.group_name)
        .opt("--storage-sku", "Premium_LRS")
}

pub fn file_server_list(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["batchai", "file-server", "list"])
        .opt("-w", &settings.workspace)
        .opt("-g", &settings.group_name)
        .output("json")
}

pub fn cluster_create(
    settings: &ProjectSettings,
    password: &str,
    storage_key: &str,
    config_file: Option<&Path>,
) -> AzCommand {
    let nodes = settings.num_nodes.to_string();
    let cmd = AzCommand::new(&["batchai", "cluster", "create"])
        .opt("-w", &settings.workspace)
        .opt("-g", &settings.group_name)
        .opt("--name", &settings.cluster_name)
        .opt("--image", "UbuntuLTS")
        .opt("--vm-size", &settings.vm_size)
        .opt("--min", nodes.clone())
        .opt("--max", nodes)
        .opt("--afs-name", &settings.file_share_name)
        .opt("--afs-mount-path", "extfs")
        .opt("--user-name", &settings.username)
        .secret("--password", password)
        .opt("--storage-account-name", &settings.storage_account_name)
        .secret("--storage-account-key", storage_key)
        .opt("--nfs", &settings.nfs_name)
        .opt("--nfs-mount-path", "nfs");

    match config_file {
        Some(path) => cmd.opt("--config-file", path.display().to_string()),
        None => cmd,
    }
}

pub fn cluster_node_list(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["batchai", "cluster", "node", "list"])
        .opt("-c", &settings.cluster_name)
        .opt("-w", &settings.workspace)
        .opt("-g", &settings.group_name)
        .output("table")
}

pub fn cluster_delete(settings: &ProjectSettings) -> AzCommand {
    AzCommand::new(&["batchai", "cluster", "delete"])
        .opt("-w", &settings.workspace)
        .opt("--name", &settings.cluster_name)
        .opt("-g", &settings.group_name)
        .arg("-y")
}

// Experiments and jobs

pub fn experiment_create(settings: &ProjectSettings, experiment: &str) -> AzCommand {
    AzCommand::new(&["batchai", "experiment", "create"])
        .opt("-n", experiment)
        .opt("-g", &settings.group_name)
        .opt("-w", &settings.workspace)
}

pub fn experiment_delete(settings: &ProjectSettings, experiment: &str) -> AzCommand {
    AzCommand::new(&["batchai", "experiment", "delete"])
        .opt("-w", &settings.workspace)
        .opt("--name", experiment)
        .opt("-g", &settings.group_name)
        .arg("-y")
}

pub fn job_create(job: &JobRef, cluster: &str, config_file: &Path) -> AzCommand {
    AzCommand::new(&["batchai", "job", "create"])
        .opt("-n", &job.name)
        .opt("--cluster", cluster)
        .opt("-w", &job.workspace)
        .opt("-e", &job.experiment)
        .opt("-g", &job.group)
        .opt("-f", config_file.display().to_string())
}

pub fn job_show(job: &JobRef) -> AzCommand {
    AzCommand::new(&["batchai", "job", "show"])
        .opt("-n", &job.name)
        .opt("-w", &job.workspace)
        .opt("-e", &job.experiment)
        .opt("-g", &job.group)
        .output("json")
}

pub fn job_list(settings: &ProjectSettings, experiment: &str) -> AzCommand {
    AzCommand::new(&["batchai", "job", "list"])
        .opt("-w", &settings.workspace)
        .opt("-e", experiment)
        .opt("-g", &settings.group_name)
        .output("table")
}

pub fn job_file_stream(job: &JobRef, file: &str) -> AzCommand {
    AzCommand::new(&["batchai", "job", "file", "stream"])
        .opt("-w", &job.workspace)
        .opt("-e", &job.experiment)
        .opt("-j", &job.name)
        .opt("-g", &job.group)
        .opt("--output-directory-id", "stdouterr")
        .opt("-f", file)
}

pub fn job_delete(job: &JobRef) -> AzCommand {
    AzCommand::new(&["batchai", "job", "delete"])
        .opt("-w", &job.workspace)
        .opt("-e", &job.experiment)
        .opt("--name", &job.name)
        .opt("-g", &job.group)
        .arg("-y")
}
