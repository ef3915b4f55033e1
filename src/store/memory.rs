//! In-process certificate store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::{CertificateStore, StoreError, StoreResult};
use crate::ca::{IssuedCertificate, LeafBundle};
use crate::hostname::Hostname;

/// Keeps entries in a map for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    entries: RwLock<HashMap<Hostname, LeafBundle>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes an entry, as an operator deleting files would.
    pub fn remove(&self, hostname: &Hostname) -> Option<LeafBundle> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hostname)
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn exists(&self, hostname: &Hostname) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(hostname)
    }

    fn read(&self, hostname: &Hostname) -> StoreResult<IssuedCertificate> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(hostname)
            .map(LeafBundle::to_issued)
            .ok_or_else(|| StoreError::NotFound(hostname.clone()))
    }

    fn write(&self, hostname: &Hostname, leaf: &LeafBundle) -> StoreResult<()> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hostname.clone(), leaf.clone());
        Ok(())
    }
}
