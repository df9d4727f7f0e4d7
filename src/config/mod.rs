// ABOUTME: Project configuration module
// ABOUTME: Env-file store, prompt-once secrets, and typed experiment settings

pub mod env_file;
pub mod secrets;
pub mod settings;

pub use env_file::EnvFile;
pub use secrets::{ensure_password, ensure_secret, GeneratedPassword, SecretSource, TerminalPrompt};
pub use settings::{ExperimentParams, ProjectSettings};
