//! Persistent leaf certificate storage.
//!
//! The store is the only cache: an entry is authoritative until it is
//! removed out-of-band. There is no in-memory eviction and no expiry here.

mod fs;
mod memory;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::ca::{IssuedCertificate, LeafBundle};
use crate::hostname::Hostname;

pub use fs::FsCertificateStore;
pub use memory::MemoryCertificateStore;

/// The result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Cache miss. Never reported to callers of the coordinator.
    #[error("no stored certificate for {0}")]
    NotFound(Hostname),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Maps a hostname to its certificate, private key and public key.
///
/// Implementations are called from blocking threads and may block.
/// Concurrent writes for the same hostname never happen: the coordinator
/// allows a single generation per hostname at a time.
pub trait CertificateStore: Send + Sync {
    /// Reports whether a complete entry exists.
    fn exists(&self, hostname: &Hostname) -> bool;

    /// Reads the certificate and private key for `hostname`.
    fn read(&self, hostname: &Hostname) -> StoreResult<IssuedCertificate>;

    /// Persists all three artifacts, replacing any previous entry.
    fn write(&self, hostname: &Hostname, leaf: &LeafBundle) -> StoreResult<()>;
}
