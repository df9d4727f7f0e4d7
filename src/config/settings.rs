// ABOUTME: Experiment parameters and the project settings persisted in the env file
// ABOUTME: Parameters load from an optional TOML file; settings round-trip through .env

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::env_file::EnvFile;
use crate::error::BatchError;

pub const GROUP_NAME: &str = "GROUP_NAME";
pub const STORAGE_ACCOUNT_NAME: &str = "STORAGE_ACCOUNT_NAME";
pub const FILE_SHARE_NAME: &str = "FILE_SHARE_NAME";
pub const NFS_NAME: &str = "NFS_NAME";
pub const CONTAINER_NAME: &str = "CONTAINER_NAME";
pub const WORKSPACE: &str = "WORKSPACE";
pub const NUM_NODES: &str = "NUM_NODES";
pub const CLUSTER_NAME: &str = "CLUSTER_NAME";
pub const VM_SIZE: &str = "VM_SIZE";
pub const GPU_TYPE: &str = "GPU_TYPE";
pub const PROCESSES_PER_NODE: &str = "PROCESSES_PER_NODE";
pub const LOCATION: &str = "LOCATION";
pub const USERNAME: &str = "USERNAME";

pub const DEFAULT_DOCKER_REPOSITORY: &str = "masalvar";

// Storage account names are 3-24 lowercase alphanumerics; "batch" + id + "st"
const MAX_ID_LEN: usize = 17;

/// Experiment parameters, as an operator would edit them before provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentParams {
    pub id: String,
    pub subscription: Option<String>,
    pub workspace: String,
    pub num_nodes: u32,
    pub cluster_name: String,
    pub vm_size: String,
    pub gpu_type: String,
    pub processes_per_node: u32,
    pub location: String,
    pub username: String,
    pub use_fake: bool,
    pub docker_repository: String,
    // Local directory holding train.tar.gz and validation.tar.gz
    pub data_dir: PathBuf,
    // Node setup configuration passed to `az batchai cluster create --config-file`
    pub cluster_config: Option<PathBuf>,
    // Files the node setup task reads from the share's scripts directory
    pub cluster_setup_files: Vec<PathBuf>,
}

impl Default for ExperimentParams {
    fn default() -> Self {
        Self {
            id: "dtdemo".to_string(),
            subscription: None,
            workspace: "workspace".to_string(),
            num_nodes: 2,
            cluster_name: "msv100".to_string(),
            vm_size: "Standard_NC24rs_v3".to_string(),
            gpu_type: "V100".to_string(),
            processes_per_node: 4,
            location: "eastus".to_string(),
            username: "batchai_user".to_string(),
            use_fake: false,
            docker_repository: default_docker_repository(),
            data_dir: PathBuf::from("/data"),
            cluster_config: None,
            cluster_setup_files: Vec::new(),
        }
    }
}

pub fn default_docker_repository() -> String {
    std::env::var("DOCKER_REPOSITORY").unwrap_or_else(|_| DEFAULT_DOCKER_REPOSITORY.to_string())
}

impl ExperimentParams {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read parameters file {}", path.display()))?;
        let params: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse parameters file {}", path.display()))?;
        params.validate()?;
        debug!(path = %path.display(), id = %params.id, "Loaded experiment parameters");
        Ok(params)
    }

    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty()
            || self.id.len() > MAX_ID_LEN
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(BatchError::Validation(format!(
                "id {:?} must be 1-{} lowercase letters or digits \
                 so that derived storage names are valid",
                self.id, MAX_ID_LEN
            ))
            .into());
        }
        if self.num_nodes == 0 {
            return Err(BatchError::Validation("num_nodes must be at least 1".to_string()).into());
        }
        if self.processes_per_node == 0 {
            return Err(BatchError::Validation(
                "processes_per_node must be at least 1".to_string(),
            )
            .into());
        }
        checked_total(self.num_nodes, self.processes_per_node)?;
        Ok(())
    }

    /// Resource names derived from the id, plus the cluster shape.
    pub fn settings(&self) -> ProjectSettings {
        let id = &self.id;
        ProjectSettings {
            group_name: format!("batch{}rg", id),
            storage_account_name: format!("batch{}st", id),
            file_share_name: format!("batch{}share", id),
            nfs_name: format!("batch{}nfs", id),
            container_name: format!("batch{}container", id),
            workspace: self.workspace.clone(),
            num_nodes: self.num_nodes,
            cluster_name: self.cluster_name.clone(),
            vm_size: self.vm_size.clone(),
            gpu_type: self.gpu_type.clone(),
            processes_per_node: self.processes_per_node,
            location: self.location.clone(),
            username: self.username.clone(),
        }
    }
}

/// The settings shared between provisioning and job submission through the env file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSettings {
    pub group_name: String,
    pub storage_account_name: String,
    pub file_share_name: String,
    pub nfs_name: String,
    pub container_name: String,
    pub workspace: String,
    pub num_nodes: u32,
    pub cluster_name: String,
    pub vm_size: String,
    pub gpu_type: String,
    pub processes_per_node: u32,
    pub location: String,
    pub username: String,
}

impl ProjectSettings {
    /// Widened so that hand-built settings cannot overflow; loaded settings are
    /// already checked to fit in a `u32`.
    pub fn total_processes(&self) -> u64 {
        u64::from(self.num_nodes) * u64::from(self.processes_per_node)
    }

    pub fn to_entries(&self) -> Vec<(&'static str, String)> {
        vec![
            (GROUP_NAME, self.group_name.clone()),
            (STORAGE_ACCOUNT_NAME, self.storage_account_name.clone()),
            (FILE_SHARE_NAME, self.file_share_name.clone()),
            (NFS_NAME, self.nfs_name.clone()),
            (CONTAINER_NAME, self.container_name.clone()),
            (WORKSPACE, self.workspace.clone()),
            (NUM_NODES, self.num_nodes.to_string()),
            (CLUSTER_NAME, self.cluster_name.clone()),
            (VM_SIZE, self.vm_size.clone()),
            (GPU_TYPE, self.gpu_type.clone()),
            (PROCESSES_PER_NODE, self.processes_per_node.to_string()),
            (LOCATION, self.location.clone()),
            (USERNAME, self.username.clone()),
        ]
    }

    pub fn persist(&self, store: &mut EnvFile) -> Result<()> {
        store.set_all(self.to_entries())
    }

    pub fn from_env_file(store: &EnvFile) -> Result<Self> {
        let text = |key: &str| store.get_required(key).map(str::to_string);

        let num_nodes = parse_count(store, NUM_NODES)?;
        let processes_per_node = parse_count(store, PROCESSES_PER_NODE)?;
        checked_total(num_nodes, processes_per_node)?;

        Ok(Self {
            group_name: text(GROUP_NAME)?,
            storage_account_name: text(STORAGE_ACCOUNT_NAME)?,
            file_share_name: text(FILE_SHARE_NAME)?,
            nfs_name: text(NFS_NAME)?,
            container_name: text(CONTAINER_NAME)?,
            workspace: text(WORKSPACE)?,
            num_nodes,
            cluster_name: text(CLUSTER_NAME)?,
            vm_size: text(VM_SIZE)?,
            gpu_type: text(GPU_TYPE)?,
            processes_per_node,
            location: text(LOCATION)?,
            username: text(USERNAME)?,
        })
    }
}

fn parse_count(store: &EnvFile, key: &str) -> Result<u32> {
    let raw = store.get_required(key)?;
    match raw.trim().parse::<u32>() {
        Ok(value) if value > 0 => Ok(value),
        _ => Err(BatchError::Validation(format!(
            "{} must be a positive integer, found {:?}",
            key, raw
        ))
        .into()),
    }
}

fn checked_total(num_nodes: u32, processes_per_node: u32) -> Result<u32> {
    num_nodes.checked_mul(processes_per_node).ok_or_else(|| {
        BatchError::Validation(format!(
            "{} nodes x {} processes per node is more processes than mpirun can address",
            num_nodes, processes_per_node
        ))
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_settings_match_notebook_names() {
        let settings = ExperimentParams::default().settings();
        assert_eq!(settings.group_name, "batchdtdemorg");
        assert_eq!(settings.storage_account_name, "batchdtdemost");
        assert_eq!(settings.file_share_name, "batchdtdemoshare");
        assert_eq!(settings.nfs_name, "batchdtdemonfs");
        assert_eq!(settings.container_name, "batchdtdemocontainer");
        assert_eq!(settings.total_processes(), 8);
    }

    #[test]
    fn test_load_partial_toml_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.toml");
        fs::write(&path, "id = \"ddpytorch\"\nnum_nodes = 4\nuse_fake = true\n").unwrap();

        let params = ExperimentParams::load(&path).unwrap();
        assert_eq!(params.id, "ddpytorch");
        assert_eq!(params.num_nodes, 4);
        assert!(params.use_fake);
        assert_eq!(params.vm_size, "Standard_NC24rs_v3");
        assert_eq!(params.settings().group_name, "batchddpytorchrg");
        assert!(params.cluster_setup_files.is_empty());
    }

    #[test]
    fn test_load_cluster_config_and_setup_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.toml");
        fs::write(
            &path,
            "cluster_config = \"cluster/config.json\"\n\
             cluster_setup_files = [\"cluster/docker.service\", \"cluster/nodeprep.sh\"]\n",
        )
        .unwrap();

        let params = ExperimentParams::load(&path).unwrap();
        assert_eq!(
            params.cluster_config,
            Some(PathBuf::from("cluster/config.json"))
        );
        assert_eq!(
            params.cluster_setup_files,
            vec![
                PathBuf::from("cluster/docker.service"),
                PathBuf::from("cluster/nodeprep.sh")
            ]
        );
    }

    #[test]
    fn test_load_rejects_unknown_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.toml");
        fs::write(&path, "nodes = 4\n").unwrap();
        assert!(ExperimentParams::load(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_id_and_counts() {
        let mut params = ExperimentParams {
            id: "Has-Dash".to_string(),
            ..ExperimentParams::default()
        };
        assert!(params.validate().is_err());

        params.id = "waytoolongforastorageaccount".to_string();
        assert!(params.validate().is_err());

        params.id = "ok1".to_string();
        params.num_nodes = 0;
        assert!(params.validate().is_err());

        params.num_nodes = 1;
        assert!(params.validate().is_ok());

        params.num_nodes = 65536;
        params.processes_per_node = 65536;
        let err = params.validate().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::Validation(_))
        ));
    }

    #[test]
    fn test_from_env_file_rejects_overflowing_process_count() {
        let dir = tempdir().unwrap();
        let mut store = EnvFile::open_or_create(dir.path().join(".env")).unwrap();
        ExperimentParams::default()
            .settings()
            .persist(&mut store)
            .unwrap();
        store.set(NUM_NODES, "65536").unwrap();
        store.set(PROCESSES_PER_NODE, "65536").unwrap();

        let err = ProjectSettings::from_env_file(&store).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::Validation(msg)) if msg.contains("65536 nodes")
        ));

        let settings = ProjectSettings {
            num_nodes: u32::MAX,
            processes_per_node: u32::MAX,
            ..ExperimentParams::default().settings()
        };
        assert_eq!(
            settings.total_processes(),
            u64::from(u32::MAX) * u64::from(u32::MAX)
        );
    }

    #[test]
    fn test_settings_round_trip_through_env_file() {
        let dir = tempdir().unwrap();
        let mut store = EnvFile::open_or_create(dir.path().join(".env")).unwrap();
        let settings = ExperimentParams::default().settings();
        settings.persist(&mut store).unwrap();

        let reopened = EnvFile::open(dir.path().join(".env")).unwrap();
        assert_eq!(ProjectSettings::from_env_file(&reopened).unwrap(), settings);
    }

    #[test]
    fn test_from_env_file_reports_missing_and_invalid_keys() {
        let dir = tempdir().unwrap();
        let mut store = EnvFile::open_or_create(dir.path().join(".env")).unwrap();
        let err = ProjectSettings::from_env_file(&store).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::MissingKey(key)) if key == GROUP_NAME
        ));

        ExperimentParams::default()
            .settings()
            .persist(&mut store)
            .unwrap();
        store.set(NUM_NODES, "two").unwrap();
        let err = ProjectSettings::from_env_file(&store).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BatchError>(),
            Some(BatchError::Validation(_))
        ));
    }
}
