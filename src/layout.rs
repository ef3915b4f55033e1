//! On-disk layout of the authority's storage directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::hostname::Hostname;

const CERTS_DIR: &str = "certs";
const KEYS_DIR: &str = "keys";

/// Computes artifact paths below a root directory.
///
/// ```text
/// <root>/certs/ca.pem
/// <root>/keys/ca.private.key
/// <root>/keys/ca.public.key
/// <root>/keys/ca.private.password
/// <root>/certs/<hostname>.pem
/// <root>/keys/<hostname>.key
/// <root>/keys/<hostname>.public.key
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
    certs: PathBuf,
    keys: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            certs: root.join(CERTS_DIR),
            keys: root.join(KEYS_DIR),
            root,
        }
    }

    /// Creates the root, `certs/` and `keys/` directories if absent.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        fs::create_dir_all(&self.certs)?;
        fs::create_dir_all(&self.keys)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn certs_dir(&self) -> &Path {
        &self.certs
    }

    pub fn keys_dir(&self) -> &Path {
        &self.keys
    }

    pub fn ca_certificate(&self) -> PathBuf {
        self.certs.join("ca.pem")
    }

    pub fn ca_private_key(&self) -> PathBuf {
        self.keys.join("ca.private.key")
    }

    pub fn ca_public_key(&self) -> PathBuf {
        self.keys.join("ca.public.key")
    }

    pub fn ca_password(&self) -> PathBuf {
        self.keys.join("ca.private.password")
    }

    pub fn leaf_certificate(&self, hostname: &Hostname) -> PathBuf {
        self.certs.join(format!("{hostname}.pem"))
    }

    pub fn leaf_private_key(&self, hostname: &Hostname) -> PathBuf {
        self.keys.join(format!("{hostname}.key"))
    }

    pub fn leaf_public_key(&self, hostname: &Hostname) -> PathBuf {
        self.keys.join(format!("{hostname}.public.key"))
    }
}
