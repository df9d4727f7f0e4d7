// ABOUTME: Builds the distributed ResNet50 Horovod job for a training framework
// ABOUTME: Derives the mpirun command line, directory bindings, and container image

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::models::{
    ContainerSettings, CustomToolkitSettings, ImageSourceRegistry, InputDirectory, JobDescriptor,
    JobProperties, OutputDirectory, JOB_SCHEMA_URL,
};
use crate::config::ProjectSettings;

const MOUNT_ROOT: &str = "$AZ_BATCHAI_MOUNT_ROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Keras,
    Pytorch,
    Tensorflow,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Keras => "keras",
            Framework::Pytorch => "pytorch",
            Framework::Tensorflow => "tensorflow",
        }
    }

    /// Training script expected in the share's `scripts` directory.
    pub fn script(&self) -> String {
        format!("imagenet_{}_horovod.py", self.as_str())
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn experiment_name(framework: Framework, settings: &ProjectSettings) -> String {
    format!("distributed_{}_{}", framework, settings.gpu_type)
}

pub fn job_name(framework: Framework, settings: &ProjectSettings) -> String {
    format!("{}-horovod-{}", framework, settings.total_processes())
}

#[derive(Debug, Clone)]
pub struct HorovodJob<'a> {
    pub framework: Framework,
    pub settings: &'a ProjectSettings,
    pub docker_repository: String,
    pub use_fake: bool,
}

impl<'a> HorovodJob<'a> {
    pub fn new(
        framework: Framework,
        settings: &'a ProjectSettings,
        docker_repository: impl Into<String>,
    ) -> Self {
        Self {
            framework,
            settings,
            docker_repository: docker_repository.into(),
            use_fake: false,
        }
    }

    pub fn with_fake_data(mut self, use_fake: bool) -> Self {
        self.use_fake = use_fake;
        self
    }

    pub fn experiment_name(&self) -> String {
        experiment_name(self.framework, self.settings)
    }

    pub fn job_name(&self) -> String {
        job_name(self.framework, self.settings)
    }

    pub fn image(&self) -> String {
        format!("{}/caia-horovod-{}", self.docker_repository, self.framework)
    }

    pub fn command_line(&self) -> String {
        let total = self.settings.total_processes().to_string();
        let script = format!("$AZ_BATCHAI_INPUT_SCRIPTS/{}", self.framework.script());

        let mut parts: Vec<&str> = vec![
            "echo $AZ_BATCH_HOST_LIST;",
            "cat $AZ_BATCHAI_MPI_HOST_FILE;",
            "mpirun",
            "-np",
            total.as_str(),
            "--hostfile",
            "$AZ_BATCHAI_MPI_HOST_FILE",
            "-bind-to",
            "none",
            "-map-by",
            "slot",
            "-x",
            "NCCL_DEBUG=INFO",
            "-x",
            "LD_LIBRARY_PATH",
            "-mca",
            "btl_tcp_if_include",
            "eth0",
            "-x",
            "NCCL_SOCKET_IFNAME=eth0",
            "-mca",
            "btl",
            "^openib",
            "-x",
            "NCCL_IB_DISABLE=1",
            "-x",
            "DISTRIBUTED=True",
            "-x",
            "AZ_BATCHAI_INPUT_TRAIN",
            "-x",
            "AZ_BATCHAI_INPUT_TEST",
            "--allow-run-as-root",
        ];
        if self.use_fake {
            parts.extend(["-x", "FAKE=True"]);
        }
        parts.extend(["python", "-u", script.as_str()]);

        parts.join(" ")
    }

    pub fn descriptor(&self) -> JobDescriptor {
        let imagenet = format!("{}/nfs/imagenet", MOUNT_ROOT);
        let extfs = format!("{}/extfs", MOUNT_ROOT);

        JobDescriptor {
            schema: JOB_SCHEMA_URL.to_string(),
            properties: JobProperties {
                node_count: self.settings.num_nodes,
                custom_toolkit_settings: CustomToolkitSettings {
                    command_line: self.command_line(),
                },
                std_out_err_path_prefix: extfs.clone(),
                input_directories: vec![
                    InputDirectory {
                        id: "SCRIPTS".to_string(),
                        path: format!("{}/scripts", extfs),
                    },
                    InputDirectory {
                        id: "TRAIN".to_string(),
                        path: imagenet.clone(),
                    },
                    InputDirectory {
                        id: "TEST".to_string(),
                        path: imagenet,
                    },
                ],
                output_directories: vec![OutputDirectory {
                    id: "MODEL".to_string(),
                    path_prefix: extfs,
                    path_suffix: Some("Models".to_string()),
                }],
                container_settings: ContainerSettings {
                    image_source_registry: ImageSourceRegistry { image: self.image() },
                },
            },
        }
    }
}
