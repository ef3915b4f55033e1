//! Hostname validation and normalization.
//!
//! Hostnames double as storage keys, so anything that could escape the
//! storage directories or land on another artifact's file name is rejected.

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use thiserror::Error;

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Names whose files would overwrite the root artifacts.
const RESERVED_NAMES: &[&str] = &["ca", "ca.private"];

/// `<host>.public.key` is the public key of `<host>`.
const RESERVED_SUFFIX: &str = ".public";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostnameError {
    #[error("hostname is empty")]
    Empty,
    #[error("hostname is longer than {MAX_HOSTNAME_LEN} bytes")]
    TooLong,
    #[error("hostname {0:?} contains invalid characters")]
    InvalidCharacters(String),
    #[error("hostname {0:?} is malformed")]
    Malformed(String),
    #[error("hostname {0:?} is reserved")]
    Reserved(String),
}

/// A normalized hostname or IP literal that is safe to use as a store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hostname(String);

impl Hostname {
    /// Parses and normalizes a hostname.
    ///
    /// Surrounding whitespace, one trailing dot and IPv6 brackets are
    /// stripped, and the result is lowercased.
    pub fn parse(raw: &str) -> Result<Self, HostnameError> {
        let trimmed = raw.trim();
        let trimmed = trimmed.strip_suffix('.').unwrap_or(trimmed);
        let trimmed = trimmed
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .unwrap_or(trimmed);
        let name = trimmed.to_ascii_lowercase();

        if name.is_empty() {
            return Err(HostnameError::Empty);
        }
        if name.len() > MAX_HOSTNAME_LEN {
            return Err(HostnameError::TooLong);
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '*' | ':'))
        {
            return Err(HostnameError::InvalidCharacters(name));
        }
        if !is_well_formed(&name) {
            return Err(HostnameError::Malformed(name));
        }
        if RESERVED_NAMES.contains(&name.as_str()) || name.ends_with(RESERVED_SUFFIX) {
            return Err(HostnameError::Reserved(name));
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the address when the hostname is an IP literal.
    pub fn ip_addr(&self) -> Option<IpAddr> {
        self.0.parse().ok()
    }
}

/// IPv6 literals are the only names with colons. Everything else must be
/// dot-separated labels, with `*` allowed only as the whole leftmost label.
fn is_well_formed(name: &str) -> bool {
    if name.contains(':') {
        return name.parse::<Ipv6Addr>().is_ok();
    }
    if name == "*" {
        return false;
    }
    name.split('.').enumerate().all(|(index, label)| {
        if label == "*" {
            return index == 0;
        }
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.contains('*')
            && !label.starts_with('-')
            && !label.ends_with('-')
    })
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Hostname {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
