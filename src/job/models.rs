// ABOUTME: Data structures for Batch AI job descriptors and job status responses
// ABOUTME: Descriptors are serialized to JSON for `az batchai job create`

use serde::{Deserialize, Serialize};

pub const JOB_SCHEMA_URL: &str =
    "https://raw.githubusercontent.com/Azure/BatchAI/master/schemas/2017-09-01-preview/job.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDescriptor {
    #[serde(rename = "$schema")]
    pub schema: String,
    pub properties: JobProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProperties {
    pub node_count: u32,
    pub custom_toolkit_settings: CustomToolkitSettings,
    pub std_out_err_path_prefix: String,
    pub input_directories: Vec<InputDirectory>,
    pub output_directories: Vec<OutputDirectory>,
    pub container_settings: ContainerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomToolkitSettings {
    pub command_line: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDirectory {
    pub id: String, // exposed to the job as $AZ_BATCHAI_INPUT_<id>
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputDirectory {
    pub id: String,
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_suffix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSettings {
    pub image_source_registry: ImageSourceRegistry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSourceRegistry {
    pub image: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub name: String,
    pub execution_state: ExecutionState,
    #[serde(default)]
    pub execution_info: Option<ExecutionInfo>,
}

impl JobStatus {
    pub fn exit_code(&self) -> Option<i32> {
        self.execution_info.as_ref().and_then(|info| info.exit_code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionState {
    Queued,
    Running,
    Terminating,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionState::Succeeded | ExecutionState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Queued => "queued",
            ExecutionState::Running => "running",
            ExecutionState::Terminating => "terminating",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInfo {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub exit_code: Option<i32>,
}
