//! Sources for the root private key passphrase.

use std::fs;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PasswordError {
    #[error("failed to read password file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("environment variable {0} is not set")]
    MissingEnv(String),
    #[error("root key password is empty")]
    Empty,
}

/// Provides the passphrase that protects the root private key.
///
/// The plain text file next to the key is the default for compatibility with
/// existing storage directories. Embedders that keep the secret in a secret
/// manager pass a [`StaticPassword`] or their own implementation instead.
pub trait PasswordSource: Send + Sync {
    fn root_key_password(&self) -> Result<String, PasswordError>;
}

/// Reads the first line of a file.
#[derive(Debug, Clone)]
pub struct PasswordFile {
    path: PathBuf,
}

impl PasswordFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl PasswordSource for PasswordFile {
    fn root_key_password(&self) -> Result<String, PasswordError> {
        let content = fs::read_to_string(&self.path).map_err(|source| PasswordError::Io {
            path: self.path.clone(),
            source,
        })?;
        let line = content.lines().next().unwrap_or_default();
        non_empty(line.trim_end_matches('\r').to_string())
    }
}

/// Reads the passphrase from an environment variable.
#[derive(Debug, Clone)]
pub struct EnvPassword {
    var: String,
}

impl EnvPassword {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl PasswordSource for EnvPassword {
    fn root_key_password(&self) -> Result<String, PasswordError> {
        let value =
            std::env::var(&self.var).map_err(|_| PasswordError::MissingEnv(self.var.clone()))?;
        non_empty(value)
    }
}

/// A passphrase already held in memory.
#[derive(Clone)]
pub struct StaticPassword(String);

impl StaticPassword {
    pub fn new(password: impl Into<String>) -> Self {
        Self(password.into())
    }
}

impl std::fmt::Debug for StaticPassword {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticPassword(..)")
    }
}

impl PasswordSource for StaticPassword {
    fn root_key_password(&self) -> Result<String, PasswordError> {
        non_empty(self.0.clone())
    }
}

fn non_empty(password: String) -> Result<String, PasswordError> {
    if password.is_empty() {
        Err(PasswordError::Empty)
    } else {
        Ok(password)
    }
}
