// ABOUTME: Handlers for project initialization and env-file key management
// ABOUTME: Backs the `init` and `config` subcommands

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::config::secrets::PASSWORD_KEY;
use crate::config::{
    ensure_password, ensure_secret, EnvFile, ExperimentParams, GeneratedPassword, ProjectSettings,
    SecretSource, TerminalPrompt,
};

const MASK: &str = "****";

/// Persist the settings derived from the experiment parameters.
pub fn init(env_path: &Path, params_path: Option<&Path>) -> Result<ProjectSettings> {
    let params = ExperimentParams::load_or_default(params_path)?;
    let settings = params.settings();

    let mut store = EnvFile::open_or_create(env_path)?;
    settings.persist(&mut store)?;
    info!(path = %env_path.display(), id = %params.id, "Initialized project settings");

    println!("Wrote project settings to {}", env_path.display());
    for (key, value) in settings.to_entries() {
        println!("  {}={}", key, value);
    }
    Ok(settings)
}

pub fn get(env_path: &Path, key: &str) -> Result<String> {
    let store = EnvFile::open(env_path)?;
    let value = store.get_required(key)?.to_string();
    println!("{}", value);
    Ok(value)
}

pub fn set(env_path: &Path, key: &str, value: &str) -> Result<()> {
    let mut store = EnvFile::open_or_create(env_path)?;
    store.set(key, value)
}

pub fn list(env_path: &Path, show_secrets: bool) -> Result<Vec<(String, String)>> {
    let store = EnvFile::open(env_path)?;
    let entries: Vec<(String, String)> = store
        .entries()
        .into_iter()
        .map(|(key, value)| {
            let shown = if is_secret_key(key) && !show_secrets {
                MASK
            } else {
                value
            };
            (key.to_string(), shown.to_string())
        })
        .collect();

    for (key, value) in &entries {
        println!("{}={}", key, value);
    }
    Ok(entries)
}

/// Make sure the cluster password exists, prompting or generating it once.
pub fn password(env_path: &Path, generate: bool) -> Result<()> {
    let mut store = EnvFile::open_or_create(env_path)?;
    let existed = store.contains(PASSWORD_KEY);
    ensure_password(&mut store, secret_source(generate).as_mut())?;

    if existed {
        println!("{} is already set in {}", PASSWORD_KEY, env_path.display());
    } else {
        println!("Stored {} in {}", PASSWORD_KEY, env_path.display());
    }
    Ok(())
}

pub fn secret(env_path: &Path, key: &str) -> Result<()> {
    let mut store = EnvFile::open_or_create(env_path)?;
    ensure_secret(&mut store, key, &mut TerminalPrompt)?;
    println!("{} is set in {}", key, env_path.display());
    Ok(())
}

pub(crate) fn secret_source(generate: bool) -> Box<dyn SecretSource> {
    if generate {
        Box::new(GeneratedPassword::default())
    } else {
        Box::new(TerminalPrompt)
    }
}

fn is_secret_key(key: &str) -> bool {
    key == PASSWORD_KEY || key.ends_with("_PWD") || key.ends_with("_KEY")
}
