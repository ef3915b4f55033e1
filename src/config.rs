use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ca::{EnvPassword, PasswordFile, PasswordSource};
use crate::coordinator::CachePolicy;
use crate::layout::StorageLayout;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where the root key passphrase comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum PasswordConfig {
    /// A plain text file. Defaults to `<root_dir>/keys/ca.private.password`.
    File {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// An environment variable.
    Env { var: String },
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self::File { path: None }
    }
}

impl PasswordConfig {
    pub fn source(&self, layout: &StorageLayout) -> Box<dyn PasswordSource> {
        match self {
            Self::File { path } => Box::new(PasswordFile::new(
                path.clone().unwrap_or_else(|| layout.ca_password()),
            )),
            Self::Env { var } => Box::new(EnvPassword::new(var.clone())),
        }
    }
}

/// Certificate authority configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaConfig {
    /// Config version for future compatibility.
    #[serde(default = "default_version")]
    pub version: u32,

    /// Directory holding `certs/` and `keys/`.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Root key passphrase source.
    #[serde(default)]
    pub password: PasswordConfig,

    /// Handling of expired stored certificates.
    #[serde(default)]
    pub cache_policy: CachePolicy,
}

fn default_version() -> u32 {
    1
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".mitm-ca")
}

impl CaConfig {
    /// Loads config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parses config from a YAML string.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.root_dir)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}",
                self.version
            )));
        }
        if self.root_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("root_dir must not be empty".to_string()));
        }
        match &self.password {
            PasswordConfig::Env { var } if var.trim().is_empty() => Err(ConfigError::Invalid(
                "password environment variable name must not be empty".to_string(),
            )),
            PasswordConfig::File { path: Some(path) } if path.as_os_str().is_empty() => Err(
                ConfigError::Invalid("password file path must not be empty".to_string()),
            ),
            _ => Ok(()),
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            root_dir: default_root_dir(),
            password: PasswordConfig::default(),
            cache_policy: CachePolicy::default(),
        }
    }
}
