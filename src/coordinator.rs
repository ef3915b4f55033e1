//! Coalesced on-demand leaf issuance.
//!
//! Every hostname is in one of three states:
//!
//! - **Cached**: the store holds a usable entry. Requests read it directly.
//! - **Generating**: a pending issuance exists. Requests subscribe to it.
//! - **Absent**: neither. The first request claims the hostname by inserting
//!   a pending issuance and spawning its generation task.
//!
//! The pending map is guarded by a single lock that is never held across
//! signing or store I/O. Checking for a pending issuance and creating one
//! happen in the same critical section, so a hostname has at most one
//! generation in flight, and only that generation writes its store slot.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::ca::{
    CaError, IssuedCertificate, LeafTemplate, RootAuthority, SerialNumberGenerator, StartupError,
};
use crate::config::CaConfig;
use crate::hostname::{Hostname, HostnameError};
use crate::layout::StorageLayout;
use crate::store::{CertificateStore, FsCertificateStore, StoreError};

type IssueOutcome = Result<Arc<IssuedCertificate>, IssueError>;
type PendingReceiver = watch::Receiver<Option<IssueOutcome>>;

/// Why a certificate request failed.
///
/// One failure is delivered to every waiter of the same issuance, so the
/// error is cheap to clone.
#[derive(Debug, Clone, Error)]
pub enum IssueError {
    #[error(transparent)]
    InvalidHostname(#[from] HostnameError),
    #[error("certificate store failure: {0}")]
    Store(Arc<StoreError>),
    #[error("certificate generation failed: {0}")]
    Generation(Arc<CaError>),
    #[error("certificate issuance was abandoned before completing")]
    Abandoned,
}

/// What to do with a stored certificate whose validity has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
    /// Serve stored certificates forever.
    #[default]
    TrustStored,
    /// Issue a replacement once the stored certificate has expired.
    ReissueExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IssuanceMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_issued: u64,
    pub coalesced_requests: u64,
    pub issuance_failures: u64,
}

#[derive(Default)]
struct Metrics {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_issued: AtomicU64,
    coalesced_requests: AtomicU64,
    issuance_failures: AtomicU64,
}

/// Hands out leaf certificates, generating each hostname's at most once at
/// a time.
///
/// Cloning is cheap; clones share state.
#[derive(Clone)]
pub struct IssuanceCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    root: Arc<RootAuthority>,
    store: Arc<dyn CertificateStore>,
    serials: SerialNumberGenerator,
    policy: CachePolicy,
    pending: Mutex<HashMap<Hostname, PendingReceiver>>,
    metrics: Metrics,
}

impl IssuanceCoordinator {
    pub fn new(root: Arc<RootAuthority>, store: Arc<dyn CertificateStore>) -> Self {
        Self::with_cache_policy(root, store, CachePolicy::default())
    }

    pub fn with_cache_policy(
        root: Arc<RootAuthority>,
        store: Arc<dyn CertificateStore>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                store,
                serials: SerialNumberGenerator::new(),
                policy,
                pending: Mutex::new(HashMap::new()),
                metrics: Metrics::default(),
            }),
        }
    }

    /// Loads the root authority and opens the filesystem store described by
    /// `config`.
    pub fn from_config(config: &CaConfig) -> Result<Self, StartupError> {
        let layout = StorageLayout::new(&config.root_dir);
        let password = config.password.source(&layout);
        let root = RootAuthority::load(&layout, password.as_ref())?;
        let store = FsCertificateStore::new(layout);
        Ok(Self::with_cache_policy(
            Arc::new(root),
            Arc::new(store),
            config.cache_policy,
        ))
    }

    /// Returns the certificate and private key for `hostname`, generating
    /// and persisting them on first use.
    ///
    /// Concurrent callers for the same hostname share one generation and
    /// receive the same result. Dropping the returned future only stops this
    /// caller from waiting.
    pub async fn request_certificate(
        &self,
        hostname: &str,
    ) -> Result<Arc<IssuedCertificate>, IssueError> {
        let hostname = Hostname::parse(hostname)?;

        if let Some(receiver) = self.inner.subscribe(&hostname) {
            debug!("joining in-flight issuance for {}", hostname);
            return wait_for_outcome(receiver).await;
        }

        let inner = Arc::clone(&self.inner);
        let host = hostname.clone();
        let cached = tokio::task::spawn_blocking(move || inner.read_cached(&host))
            .await
            .map_err(|_| IssueError::Abandoned)??;
        if let Some(issued) = cached {
            self.inner.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("certificate cache hit for {}", hostname);
            return Ok(issued);
        }

        let receiver = self.inner.claim(&hostname);
        wait_for_outcome(receiver).await
    }

    pub fn root_certificate_path(&self) -> &Path {
        self.inner.root.certificate_path()
    }

    pub fn root_certificate_pem(&self) -> &str {
        self.inner.root.certificate_pem()
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.inner.policy
    }

    /// Number of hostnames currently being generated.
    pub fn in_flight(&self) -> usize {
        self.inner.lock_pending().len()
    }

    pub fn metrics(&self) -> IssuanceMetricsSnapshot {
        let metrics = &self.inner.metrics;
        IssuanceMetricsSnapshot {
            cache_hits: metrics.cache_hits.load(Ordering::Relaxed),
            cache_misses: metrics.cache_misses.load(Ordering::Relaxed),
            leaves_issued: metrics.leaves_issued.load(Ordering::Relaxed),
            coalesced_requests: metrics.coalesced_requests.load(Ordering::Relaxed),
            issuance_failures: metrics.issuance_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for IssuanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuanceCoordinator")
            .field("root", &self.inner.root)
            .field("policy", &self.inner.policy)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<Hostname, PendingReceiver>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscribe(&self, hostname: &Hostname) -> Option<PendingReceiver> {
        let receiver = self.lock_pending().get(hostname).cloned()?;
        self.metrics
            .coalesced_requests
            .fetch_add(1, Ordering::Relaxed);
        Some(receiver)
    }

    /// Subscribes to the pending issuance for `hostname`, starting one if
    /// there is none.
    fn claim(self: &Arc<Self>, hostname: &Hostname) -> PendingReceiver {
        let mut pending = self.lock_pending();
        if let Some(receiver) = pending.get(hostname) {
            self.metrics
                .coalesced_requests
                .fetch_add(1, Ordering::Relaxed);
            return receiver.clone();
        }

        let (sender, receiver) = watch::channel(None);
        pending.insert(hostname.clone(), receiver.clone());
        self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);

        let issuance = PendingIssuance {
            inner: Arc::clone(self),
            hostname: hostname.clone(),
            sender: Some(sender),
        };
        tokio::spawn(issuance.run());
        receiver
    }

    /// Reads a usable stored entry. A miss, or an expired entry under
    /// [`CachePolicy::ReissueExpired`], is `Ok(None)`.
    fn read_cached(&self, hostname: &Hostname) -> Result<Option<Arc<IssuedCertificate>>, IssueError> {
        match self.store.read(hostname) {
            Ok(issued) if self.is_usable(&issued) => Ok(Some(Arc::new(issued))),
            Ok(_) => {
                info!("stored certificate for {} has expired, reissuing", hostname);
                Ok(None)
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(IssueError::Store(Arc::new(e))),
        }
    }

    fn is_usable(&self, issued: &IssuedCertificate) -> bool {
        match self.policy {
            CachePolicy::TrustStored => true,
            CachePolicy::ReissueExpired => issued
                .not_after()
                .is_some_and(|not_after| not_after > OffsetDateTime::now_utc()),
        }
    }

    /// Runs on a blocking thread.
    fn generate(&self, hostname: &Hostname) -> IssueOutcome {
        // Another issuance may have finished between the caller's miss and
        // its claim.
        if let Some(issued) = self.read_cached(hostname)? {
            return Ok(issued);
        }

        let template = LeafTemplate::new(
            hostname.clone(),
            self.serials.next(),
            OffsetDateTime::now_utc(),
        );
        let leaf = self
            .root
            .sign(&template)
            .map_err(|e| IssueError::Generation(Arc::new(e)))?;
        self.metrics.leaves_issued.fetch_add(1, Ordering::Relaxed);

        self.store
            .write(hostname, &leaf)
            .map_err(|e| IssueError::Store(Arc::new(e)))?;

        info!("issued certificate for {} (serial {})", hostname, leaf.serial);
        Ok(Arc::new(leaf.to_issued()))
    }
}

/// The in-flight generation for one hostname.
///
/// Owns the sending half of the result channel. Publishing the result and
/// removing the pending entry happen under the map lock; if the task is
/// dropped without a result the entry is still removed and waiters see
/// [`IssueError::Abandoned`].
struct PendingIssuance {
    inner: Arc<Inner>,
    hostname: Hostname,
    sender: Option<watch::Sender<Option<IssueOutcome>>>,
}

impl PendingIssuance {
    async fn run(mut self) {
        let inner = Arc::clone(&self.inner);
        let hostname = self.hostname.clone();
        let outcome = match tokio::task::spawn_blocking(move || inner.generate(&hostname)).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("certificate generation task for {} failed: {}", self.hostname, e);
                Err(IssueError::Abandoned)
            }
        };

        if let Err(ref e) = outcome {
            self.inner
                .metrics
                .issuance_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!("failed to issue certificate for {}: {}", self.hostname, e);
        }
        self.complete(outcome);
    }

    fn complete(&mut self, outcome: IssueOutcome) {
        let mut pending = self.inner.lock_pending();
        pending.remove(&self.hostname);
        if let Some(sender) = self.sender.take() {
            sender.send_replace(Some(outcome));
        }
    }
}

impl Drop for PendingIssuance {
    fn drop(&mut self) {
        if self.sender.is_some() {
            self.inner.lock_pending().remove(&self.hostname);
        }
    }
}

async fn wait_for_outcome(mut receiver: PendingReceiver) -> IssueOutcome {
    let outcome = receiver
        .wait_for(Option::is_some)
        .await
        .map_err(|_| IssueError::Abandoned)?;
    (*outcome).clone().unwrap_or(Err(IssueError::Abandoned))
}
