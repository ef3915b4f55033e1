//! Root authority and leaf certificate generation.
//!
//! This module loads the persistent root, draws serial numbers and signs
//! per-hostname leaf certificates.

mod leaf;
mod password;
mod root;
mod serial;

pub use leaf::{IssuedCertificate, LEAF_VALIDITY_YEARS, LeafBundle, LeafTemplate};
pub use password::{EnvPassword, PasswordError, PasswordFile, PasswordSource, StaticPassword};
pub use root::{CaError, CaResult, RootAuthority, StartupError};
pub use serial::{SERIAL_LEN, Serial, SerialNumberGenerator};
