//! Filesystem-backed certificate store.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use super::{CertificateStore, StoreError, StoreResult};
use crate::ca::{IssuedCertificate, LeafBundle};
use crate::hostname::Hostname;
use crate::layout::StorageLayout;

/// Stores each artifact as its own file under a [`StorageLayout`].
///
/// Files are written to a temporary name and renamed into place, private
/// key first and certificate last, so a visible certificate always has its
/// key next to it and no reader ever sees a partial file.
#[derive(Debug, Clone)]
pub struct FsCertificateStore {
    layout: StorageLayout,
}

impl FsCertificateStore {
    pub fn new(layout: StorageLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn ensure_dirs(&self) -> StoreResult<()> {
        self.layout.ensure_dirs().map_err(|source| StoreError::Io {
            path: self.layout.root().to_path_buf(),
            source,
        })
    }
}

impl CertificateStore for FsCertificateStore {
    fn exists(&self, hostname: &Hostname) -> bool {
        self.layout.leaf_certificate(hostname).is_file()
            && self.layout.leaf_private_key(hostname).is_file()
    }

    fn read(&self, hostname: &Hostname) -> StoreResult<IssuedCertificate> {
        let certificate_pem = read_slot(&self.layout.leaf_certificate(hostname), hostname)?;
        let private_key_pem = read_slot(&self.layout.leaf_private_key(hostname), hostname)?;
        Ok(IssuedCertificate::new(
            hostname.clone(),
            certificate_pem,
            private_key_pem,
        ))
    }

    fn write(&self, hostname: &Hostname, leaf: &LeafBundle) -> StoreResult<()> {
        self.ensure_dirs()?;
        write_atomic(
            &self.layout.leaf_private_key(hostname),
            &leaf.private_key_pem,
            false,
        )?;
        write_atomic(
            &self.layout.leaf_public_key(hostname),
            &leaf.public_key_pem,
            true,
        )?;
        write_atomic(
            &self.layout.leaf_certificate(hostname),
            &leaf.certificate_pem,
            true,
        )?;
        debug!("stored certificate for {}", hostname);
        Ok(())
    }
}

/// A missing file in a slot is a miss, whichever file it is.
fn read_slot(path: &Path, hostname: &Hostname) -> StoreResult<String> {
    fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            StoreError::NotFound(hostname.clone())
        } else {
            StoreError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn write_atomic(path: &Path, contents: &str, world_readable: bool) -> StoreResult<()> {
    let io_err = |source: io::Error| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let dir = path.parent().unwrap_or(Path::new("."));

    // Temporary files are created owner-only.
    let mut file = NamedTempFile::new_in(dir).map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)?;
    file.as_file().sync_all().map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if world_readable {
            fs::set_permissions(file.path(), fs::Permissions::from_mode(0o644))
                .map_err(io_err)?;
        }
    }
    #[cfg(not(unix))]
    let _ = world_readable;

    file.persist(path).map_err(|e| io_err(e.error))?;
    Ok(())
}
