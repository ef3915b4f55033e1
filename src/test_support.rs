//! Fixtures shared by unit tests.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tempfile::TempDir;
use time::OffsetDateTime;
use x509_parser::certificate::X509Certificate;

use crate::ca::{
    IssuedCertificate, LeafBundle, LeafTemplate, RootAuthority, SerialNumberGenerator,
    StaticPassword,
};
use crate::hostname::Hostname;
use crate::layout::StorageLayout;
use crate::store::{CertificateStore, MemoryCertificateStore, StoreError, StoreResult};

pub(crate) const TEST_PASSWORD: &str = "correct horse battery staple";

/// A temporary directory with a freshly bootstrapped root.
pub(crate) fn bootstrapped_layout() -> (TempDir, StorageLayout) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let layout = StorageLayout::new(dir.path());
    RootAuthority::bootstrap(&layout, TEST_PASSWORD).expect("bootstrap root");
    (dir, layout)
}

/// One root per test binary; key derivation makes loading slow.
pub(crate) fn shared_root() -> Arc<RootAuthority> {
    static ROOT: OnceLock<(TempDir, Arc<RootAuthority>)> = OnceLock::new();
    let (_, root) = ROOT.get_or_init(|| {
        let (dir, layout) = bootstrapped_layout();
        let root = RootAuthority::load(&layout, &StaticPassword::new(TEST_PASSWORD))
            .expect("load shared root");
        (dir, Arc::new(root))
    });
    Arc::clone(root)
}

pub(crate) fn sample_leaf(hostname: &str) -> LeafBundle {
    let template = LeafTemplate::new(
        Hostname::parse(hostname).expect("valid hostname"),
        SerialNumberGenerator::new().next(),
        OffsetDateTime::now_utc(),
    );
    shared_root().sign(&template).expect("sign leaf")
}

pub(crate) fn parse_certificate<R>(
    pem: &str,
    inspect: impl FnOnce(&X509Certificate<'_>) -> R,
) -> R {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes()).expect("PEM block");
    let cert = pem.parse_x509().expect("X.509 certificate");
    inspect(&cert)
}

pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 10s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// An in-memory store that can hold writes back and inject failures.
#[derive(Default)]
pub(crate) struct ProbeStore {
    inner: MemoryCertificateStore,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
    gates: Mutex<HashMap<String, mpsc::Receiver<()>>>,
    hidden_reads: Mutex<HashMap<String, usize>>,
}

impl ProbeStore {
    /// Blocks the next write for `hostname` until the returned sender sends
    /// or is dropped.
    pub(crate) fn gate(&self, hostname: &str) -> mpsc::Sender<()> {
        let (tx, rx) = mpsc::channel();
        self.gates
            .lock()
            .unwrap()
            .insert(hostname.to_string(), rx);
        tx
    }

    /// Makes the next `count` reads of `hostname` miss even when an entry
    /// exists, as if it had been written just after the read.
    pub(crate) fn hide_next_reads(&self, hostname: &str, count: usize) {
        self.hidden_reads
            .lock()
            .unwrap()
            .insert(hostname.to_string(), count);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl CertificateStore for ProbeStore {
    fn exists(&self, hostname: &Hostname) -> bool {
        self.inner.exists(hostname)
    }

    fn read(&self, hostname: &Hostname) -> StoreResult<IssuedCertificate> {
        if let Some(remaining) = self.hidden_reads.lock().unwrap().get_mut(hostname.as_str()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StoreError::NotFound(hostname.clone()));
            }
        }
        self.inner.read(hostname)
    }

    fn write(&self, hostname: &Hostname, leaf: &LeafBundle) -> StoreResult<()> {
        let gate = self.gates.lock().unwrap().remove(hostname.as_str());
        if let Some(gate) = gate {
            let _ = gate.recv_timeout(Duration::from_secs(10));
        }

        self.writes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Io {
                path: PathBuf::from(hostname.as_str()),
                source: io::Error::other("injected write failure"),
            });
        }
        self.inner.write(hostname, leaf)
    }
}
