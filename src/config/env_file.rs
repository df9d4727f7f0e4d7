// ABOUTME: Dotenv-backed key/value store for per-project settings and secrets
// ABOUTME: Preserves comments and unknown lines, and replaces the file atomically on write

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::BatchError;

pub const ENV_FILE_NAME: &str = ".env";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry {
        key: String,
        value: String,
        // Original text, dropped once the entry is modified
        raw: Option<String>,
    },
    Verbatim(String),
}

/// A flat `KEY=value` file, one entry per line.
///
/// Keys are unique from the caller's point of view: reads return the last
/// occurrence, writes collapse duplicates into the first one. There is no
/// locking, so two processes writing the same file race and the last writer
/// wins.
#[derive(Debug, Clone)]
pub struct EnvFile {
    path: PathBuf,
    lines: Vec<Line>,
}

impl EnvFile {
    /// Open an existing env file. Fails if the file does not exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read env file {}", path.display()))?;

        let lines = parse(&content, path);
        debug!(path = %path.display(), lines = lines.len(), "Loaded env file");

        Ok(Self {
            path: path.to_path_buf(),
            lines,
        })
    }

    /// Open the env file, creating an empty one (and its parent directory) first if needed.
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            if let Some(parent) = non_empty_parent(path) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {}", parent.display()))?;
            }
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to create env file {}", path.display()))?;
            info!(path = %path.display(), "Created env file");
        }
        Self::open(path)
    }

    /// Find the project env file by walking up from `start`.
    ///
    /// Returns the first `.env` found in `start` or one of its ancestors. If
    /// there is none, an empty `.env` is created in `start`.
    pub fn discover(start: impl AsRef<Path>) -> Result<PathBuf> {
        let start = start.as_ref();
        for dir in start.ancestors() {
            let candidate = dir.join(ENV_FILE_NAME);
            if candidate.is_file() {
                debug!(path = %candidate.display(), "Discovered env file");
                return Ok(candidate);
            }
        }

        let path = start.join(ENV_FILE_NAME);
        Self::open_or_create(&path)?;
        Ok(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines.iter().rev().find_map(|line| match line {
            Line::Entry { key: k, value, .. } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    pub fn get_required(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| BatchError::MissingKey(key.to_string()).into())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// All entries in file order, one per distinct key, carrying the effective value.
    pub fn entries(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = Vec::new();
        for line in &self.lines {
            if let Line::Entry { key, value, .. } = line {
                match out.iter_mut().find(|(k, _)| *k == key.as_str()) {
                    Some(slot) => slot.1 = value.as_str(),
                    None => out.push((key.as_str(), value.as_str())),
                }
            }
        }
        out
    }

    /// Write a single entry and persist the file.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.apply(key, value)?;
        self.save()?;
        info!(key, path = %self.path.display(), "Set env key");
        Ok(())
    }

    /// Write several entries with a single file replacement. Nothing is applied
    /// unless every key is valid.
    pub fn set_all<I, K, V>(&mut self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let entries: Vec<(K, V)> = entries.into_iter().collect();
        for (key, _) in &entries {
            validate_key(key.as_ref())?;
        }
        for (key, value) in &entries {
            self.apply(key.as_ref(), value.as_ref())?;
        }
        let count = entries.len();
        self.save()?;
        info!(count, path = %self.path.display(), "Set env keys");
        Ok(())
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;

        let mut replaced = false;
        self.lines.retain_mut(|line| match line {
            Line::Entry {
                key: k,
                value: v,
                raw,
            } if k.as_str() == key => {
                if replaced {
                    return false;
                }
                *v = value.to_string();
                *raw = None;
                replaced = true;
                true
            }
            _ => true,
        });

        if !replaced {
            self.lines.push(Line::Entry {
                key: key.to_string(),
                value: value.to_string(),
                raw: None,
            });
        }
        Ok(())
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                Line::Entry { raw: Some(raw), .. } | Line::Verbatim(raw) => out.push_str(raw),
                Line::Entry { key, value, .. } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(&quote_value(value));
                }
            }
            out.push('\n');
        }
        out
    }

    fn save(&self) -> Result<()> {
        let dir = non_empty_parent(&self.path).unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temporary file in {}", dir.display()))?;
        tmp.write_all(self.render().as_bytes())
            .context("Failed to write env file contents")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to flush env file contents")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace env file {}", self.path.display()))?;
        Ok(())
    }
}

fn non_empty_parent(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        }
        _ => false,
    }
}

fn validate_key(key: &str) -> Result<()> {
    if is_valid_key(key) {
        Ok(())
    } else {
        Err(BatchError::Validation(format!(
            "invalid env key {:?}: keys must start with a letter or underscore \
             and contain only letters, digits, '_' or '.'",
            key
        ))
        .into())
    }
}

fn is_bare_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_./:@+,=%".contains(c)
}

fn quote_value(value: &str) -> String {
    if value.chars().all(is_bare_char) {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

fn parse(content: &str, path: &Path) -> Vec<Line> {
    content
        .lines()
        .enumerate()
        .map(|(idx, raw)| match parse_line(raw) {
            Ok(Some((key, value))) => Line::Entry {
                key,
                value,
                raw: Some(raw.to_string()),
            },
            Ok(None) => Line::Verbatim(raw.to_string()),
            Err(reason) => {
                warn!(
                    path = %path.display(),
                    line = idx + 1,
                    reason,
                    "Keeping unparseable env line as-is"
                );
                Line::Verbatim(raw.to_string())
            }
        })
        .collect()
}

fn parse_line(raw: &str) -> std::result::Result<Option<(String, String)>, &'static str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }

    let body = trimmed
        .strip_prefix("export ")
        .map(str::trim_start)
        .unwrap_or(trimmed);
    let (key, rest) = match body.split_once('=') {
        Some((key, rest)) => (key.trim(), rest),
        None => (body, ""),
    };
    if !is_valid_key(key) {
        return Err("invalid key");
    }

    let value = parse_value(rest.trim_start())?;
    Ok(Some((key.to_string(), value)))
}

fn parse_value(rest: &str) -> std::result::Result<String, &'static str> {
    let mut chars = rest.chars();
    match chars.next() {
        None => Ok(String::new()),
        Some('\'') => {
            let inner = chars.as_str();
            inner
                .find('\'')
                .map(|end| inner[..end].to_string())
                .ok_or("unterminated single quote")
        }
        Some('"') => {
            let mut out = String::new();
            while let Some(c) = chars.next() {
                match c {
                    '"' => return Ok(out),
                    '\\' => match chars.next() {
                        Some('n') => out.push('\n'),
                        Some('r') => out.push('\r'),
                        Some('t') => out.push('\t'),
                        Some(c @ ('"' | '\\')) => out.push(c),
                        Some(other) => {
                            out.push('\\');
                            out.push(other);
                        }
                        None => break,
                    },
                    other => out.push(other),
                }
            }
            Err("unterminated double quote")
        }
        Some(_) => {
            let value = match rest.find(" #") {
                Some(pos) => &rest[..pos],
                None => rest,
            };
            Ok(value.trim_end().to_string())
        }
    }
}
