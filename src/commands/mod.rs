// ABOUTME: Subcommand handlers shared by the CLI binary
// ABOUTME: Each handler resolves project settings from the env file and performs one step

pub mod config;
pub mod job;
pub mod provision;
