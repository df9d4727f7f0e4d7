// ABOUTME: Custom error types for the Batch AI orchestrator
// ABOUTME: Provides context-specific error variants with actionable messages

use std::fmt;

#[derive(Debug)]
pub enum BatchError {
    Config(String),
    MissingKey(String),
    Validation(String),
    Command(String),
}

impl fmt::Display for BatchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BatchError::Config(msg) => write!(f, "Config error: {}", msg),
            BatchError::MissingKey(key) => write!(
                f,
                "Missing key: {} is not set in the env file. \
                 Run `init` or `config set {} <value>` first",
                key, key
            ),
            BatchError::Validation(msg) => write!(f, "Validation error: {}", msg),
            BatchError::Command(msg) => write!(f, "Command error: {}", msg),
        }
    }
}

impl std::error::Error for BatchError {}
