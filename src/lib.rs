// ABOUTME: Library root for the Batch AI Horovod orchestrator
// ABOUTME: Exposes the env-file config store, job descriptors, and Azure CLI wrappers

pub mod azure;
pub mod commands;
pub mod config;
pub mod error;
pub mod job;
pub mod staging;

pub use error::BatchError;
