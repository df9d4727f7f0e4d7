// ABOUTME: Batch job descriptor module
// ABOUTME: Descriptor models, the Horovod job builder, and the sorted JSON writer

pub mod builder;
pub mod models;
pub mod writer;

pub use builder::{Framework, HorovodJob};
pub use models::{ExecutionState, JobDescriptor, JobStatus};
pub use writer::{to_sorted_json, write_json_to_file, WriteMode};
