// ABOUTME: Azure CLI integration module
// ABOUTME: Builds `az` command lines and runs them against the Batch AI service

pub mod client;
pub mod command;

pub use client::AzureCli;
pub use command::{AzCommand, JobRef};
