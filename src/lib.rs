//! Embedded certificate authority for TLS interception.
//!
//! An intercepting proxy needs a certificate for every hostname it
//! terminates. This crate mints them on demand, signed by a persistent
//! root authority that clients are configured to trust.
//!
//! # Architecture
//!
//! 1. [`RootAuthority`] loads the root certificate and decrypts its private
//!    key at startup. A missing or unreadable root aborts startup.
//! 2. [`IssuanceCoordinator::request_certificate`] looks the hostname up in a
//!    [`CertificateStore`]. Stored entries are served as-is.
//! 3. On a miss the coordinator signs a two-year leaf, persists it, and hands
//!    the same result to every caller that asked for that hostname in the
//!    meantime. Different hostnames are generated in parallel.
//!
//! # Storage
//!
//! [`FsCertificateStore`] keeps one file per artifact:
//!
//! - `certs/ca.pem`, `keys/ca.private.key`, `keys/ca.public.key` for the root
//! - `certs/<hostname>.pem`, `keys/<hostname>.key`,
//!   `keys/<hostname>.public.key` for each leaf
//!
//! # Example
//!
//! ```no_run
//! use mitm_ca::{CaConfig, IssuanceCoordinator};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = CaConfig::load("mitm-ca.yaml")?;
//! let coordinator = IssuanceCoordinator::from_config(&config)?;
//! let issued = coordinator.request_certificate("example.com").await?;
//! println!("{}", issued.certificate_pem());
//! # Ok(())
//! # }
//! ```

pub mod ca;
mod config;
mod coordinator;
mod hostname;
mod layout;
pub mod store;
pub mod tls;

#[cfg(test)]
mod test_support;

pub use ca::{
    CaError, IssuedCertificate, LeafBundle, PasswordSource, RootAuthority, StartupError,
    StaticPassword,
};
pub use config::{CaConfig, ConfigError, PasswordConfig};
pub use coordinator::{CachePolicy, IssuanceCoordinator, IssuanceMetricsSnapshot, IssueError};
pub use hostname::{Hostname, HostnameError};
pub use layout::StorageLayout;
pub use store::{CertificateStore, FsCertificateStore, MemoryCertificateStore, StoreError};
pub use tls::{TlsAcceptor, TlsError};
