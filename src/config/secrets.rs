// ABOUTME: Lazily acquired secrets persisted in the project env file
// ABOUTME: Prompts (or generates) at most once per key, then reuses the stored value

use anyhow::{Context, Result};
use dialoguer::Password;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use super::env_file::EnvFile;
use crate::error::BatchError;

pub const PASSWORD_KEY: &str = "PASSWORD";

const MIN_GENERATED_LENGTH: usize = 12;

// Every class must appear at least once to pass Azure's VM password rules.
// The symbol set stays within characters the env file writes unquoted.
const LOWER: &[u8] = b"abcdefghijkmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const DIGITS: &[u8] = b"23456789";
const SYMBOLS: &[u8] = b"-_+=@%";

/// Where a missing secret comes from.
pub trait SecretSource {
    fn acquire(&mut self, key: &str) -> Result<String>;
}

/// Interactive, non-echoing terminal prompt.
#[derive(Debug, Default)]
pub struct TerminalPrompt;

impl SecretSource for TerminalPrompt {
    fn acquire(&mut self, key: &str) -> Result<String> {
        let prompt = match key {
            PASSWORD_KEY => "Please enter password to use for the cluster".to_string(),
            other => format!("Please enter a value for {}", other),
        };
        Password::new()
            .with_prompt(prompt)
            .interact()
            .with_context(|| format!("Failed to read {} from the terminal", key))
    }
}

/// Random password generator for unattended runs.
#[derive(Debug)]
pub struct GeneratedPassword {
    length: usize,
}

impl GeneratedPassword {
    pub fn new(length: usize) -> Self {
        Self {
            length: length.max(MIN_GENERATED_LENGTH),
        }
    }
}

impl Default for GeneratedPassword {
    fn default() -> Self {
        Self::new(16)
    }
}

impl SecretSource for GeneratedPassword {
    fn acquire(&mut self, key: &str) -> Result<String> {
        debug!(key, length = self.length, "Generating secret");
        Ok(generate_password(self.length))
    }
}

pub fn generate_password(length: usize) -> String {
    let length = length.max(MIN_GENERATED_LENGTH);
    let mut rng = rand::thread_rng();
    let classes = [LOWER, UPPER, DIGITS, SYMBOLS];

    let mut chars: Vec<u8> = classes
        .iter()
        .map(|set| set[rng.gen_range(0..set.len())])
        .collect();
    let all = classes.concat();
    while chars.len() < length {
        chars.push(all[rng.gen_range(0..all.len())]);
    }
    chars.shuffle(&mut rng);

    chars.into_iter().map(char::from).collect()
}

/// Return the stored value for `key`, acquiring and persisting it first if absent.
pub fn ensure_secret<S>(store: &mut EnvFile, key: &str, source: &mut S) -> Result<String>
where
    S: SecretSource + ?Sized,
{
    if let Some(existing) = store.get(key) {
        debug!(key, "Secret already stored");
        return Ok(existing.to_string());
    }

    let value = source.acquire(key)?;
    if value.is_empty() {
        return Err(BatchError::Validation(format!("{} must not be empty", key)).into());
    }
    store.set(key, &value)?;
    info!(key, path = %store.path().display(), "Stored secret");
    Ok(value)
}

/// Cluster admin password shared by the file server and the cluster nodes.
pub fn ensure_password<S>(store: &mut EnvFile, source: &mut S) -> Result<String>
where
    S: SecretSource + ?Sized,
{
    ensure_secret(store, PASSWORD_KEY, source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct CountingSource {
        value: String,
        calls: usize,
    }

    impl SecretSource for CountingSource {
        fn acquire(&mut self, _key: &str) -> Result<String> {
            self.calls += 1;
            Ok(self.value.clone())
        }
    }

    fn empty_store() -> (tempfile::TempDir, EnvFile) {
        let dir = tempdir().unwrap();
        let store = EnvFile::open_or_create(dir.path().join(".env")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_password_prompted_at_most_once() {
        let (dir, mut store) = empty_store();
        let mut source = CountingSource {
            value: "S3cret-pass".to_string(),
            calls: 0,
        };

        let first = ensure_password(&mut store, &mut source).unwrap();
        let mut reopened = EnvFile::open(dir.path().join(".env")).unwrap();
        let second = ensure_password(&mut reopened, &mut source).unwrap();

        assert_eq!(source.calls, 1);
        assert_eq!(first, "S3cret-pass");
        assert_eq!(second, first);
    }

    #[test]
    fn test_existing_secret_is_not_replaced() {
        let (_dir, mut store) = empty_store();
        store.set(PASSWORD_KEY, "already-there").unwrap();
        let mut source = CountingSource {
            value: "new".to_string(),
            calls: 0,
        };

        let value = ensure_password(&mut store, &mut source).unwrap();
        assert_eq!(value, "already-there");
        assert_eq!(source.calls, 0);
    }

    #[test]
    fn test_empty_secret_rejected() {
        let (_dir, mut store) = empty_store();
        let mut source = CountingSource {
            value: String::new(),
            calls: 0,
        };

        assert!(ensure_secret(&mut store, "DOCKER_PWD", &mut source).is_err());
        assert!(!store.contains("DOCKER_PWD"));
    }

    #[test]
    fn test_generated_password_covers_every_class() {
        for _ in 0..20 {
            let password = generate_password(16);
            assert_eq!(password.len(), 16);
            assert!(password.bytes().any(|b| LOWER.contains(&b)));
            assert!(password.bytes().any(|b| UPPER.contains(&b)));
            assert!(password.bytes().any(|b| DIGITS.contains(&b)));
            assert!(password.bytes().any(|b| SYMBOLS.contains(&b)));
        }
    }

    #[test]
    fn test_generated_password_has_minimum_length() {
        assert_eq!(generate_password(4).len(), MIN_GENERATED_LENGTH);
    }

    #[test]
    fn test_generated_password_is_persisted() {
        let (dir, mut store) = empty_store();
        let value = ensure_password(&mut store, &mut GeneratedPassword::default()).unwrap();

        let reopened = EnvFile::open(dir.path().join(".env")).unwrap();
        assert_eq!(reopened.get(PASSWORD_KEY), Some(value.as_str()));
    }
}
