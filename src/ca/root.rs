//! Root authority: bootstrap, load and leaf signing.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use pkcs8::pkcs5::pbes2;
use pkcs8::{EncryptedPrivateKeyInfo, LineEnding, PrivateKeyInfo, SecretDocument};
use rand::RngCore;
use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType, SignatureAlgorithm,
};
use rustls::pki_types::SubjectPublicKeyInfoDer;
use rustls::pki_types::pem::PemObject;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use x509_parser::x509::X509Name;

use super::leaf::{LeafBundle, LeafTemplate, add_years};
use super::password::{PasswordError, PasswordSource};
use super::serial::SerialNumberGenerator;
use crate::layout::StorageLayout;

pub(crate) const ORGANIZATION: &str = "mitm-ca";
pub(crate) const LOCALITY: &str = "Internet";
const COMMON_NAME: &str = "mitm-ca Root CA";
const ROOT_UNIT: &str = "CA";
const ROOT_VALIDITY_YEARS: i32 = 10;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";
const KEY_KDF_ROUNDS: u32 = 100_000;

/// Root keys must sign with SHA-256.
static SUPPORTED_ALGORITHMS: &[&SignatureAlgorithm] =
    &[&rcgen::PKCS_ECDSA_P256_SHA256, &rcgen::PKCS_RSA_SHA256];

/// The result type for leaf signing.
pub type CaResult<T> = Result<T, CaError>;

#[derive(Debug, Error)]
pub enum CaError {
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(#[source] rcgen::Error),
    #[error("failed to sign certificate: {0}")]
    Signing(#[source] rcgen::Error),
    #[error("invalid DNS name: {0}")]
    InvalidDnsName(String),
}

/// Fatal problems with the root artifacts. The process cannot issue
/// consistent leaves without a root, so none of these are retried.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to create storage directories under {path}: {source}")]
    CreateDirs {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("root artifact {0} is missing")]
    MissingArtifact(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("root artifact {0} already exists, refusing to overwrite")]
    AlreadyExists(PathBuf),
    #[error(transparent)]
    Password(#[from] PasswordError),
    #[error("root private key is not an encrypted PKCS#8 key (found {0:?})")]
    KeyFormat(String),
    #[error("failed to decrypt root private key: {0}")]
    KeyDecryption(#[source] pkcs8::Error),
    #[error("failed to encrypt root private key: {0}")]
    KeyEncryption(#[source] pkcs8::Error),
    #[error("invalid root private key: {0}")]
    InvalidKey(#[source] rcgen::Error),
    #[error("root key algorithm does not sign with SHA-256")]
    UnsupportedAlgorithm,
    #[error("invalid root artifact {path}: {reason}")]
    InvalidArtifact { path: PathBuf, reason: String },
    #[error("root certificate is not a certificate authority")]
    NotCertificateAuthority,
    #[error("{0} does not match the root private key")]
    KeyMismatch(PathBuf),
    #[error("failed to generate root certificate: {0}")]
    Generation(#[source] rcgen::Error),
}

/// The root certificate authority.
///
/// Loaded once at startup and shared read-only for the lifetime of the
/// process.
pub struct RootAuthority {
    issuer: Issuer<'static, KeyPair>,
    subject: DistinguishedName,
    certificate_pem: String,
    certificate_path: PathBuf,
}

impl RootAuthority {
    /// Loads the root certificate and decrypts its private key.
    ///
    /// The storage directories are created when absent, but a missing
    /// artifact is always an error: roots are only ever created by
    /// [`RootAuthority::bootstrap`].
    pub fn load(
        layout: &StorageLayout,
        password: &dyn PasswordSource,
    ) -> Result<Self, StartupError> {
        layout
            .ensure_dirs()
            .map_err(|source| StartupError::CreateDirs {
                path: layout.root().to_path_buf(),
                source,
            })?;

        let certificate_path = layout.ca_certificate();
        let public_key_path = layout.ca_public_key();
        let certificate_pem = read_artifact(&certificate_path)?;
        let private_key_pem = read_artifact(&layout.ca_private_key())?;
        let public_key_pem = read_artifact(&public_key_path)?;
        let password = password.root_key_password()?;

        let key_pair = decrypt_private_key(&private_key_pem, &password)?;
        if !SUPPORTED_ALGORITHMS
            .iter()
            .any(|alg| *alg == key_pair.algorithm())
        {
            return Err(StartupError::UnsupportedAlgorithm);
        }
        let spki = key_pair.subject_public_key_info();

        let (_, pem) = x509_parser::pem::parse_x509_pem(certificate_pem.as_bytes())
            .map_err(|e| invalid_artifact(&certificate_path, e))?;
        let cert = pem
            .parse_x509()
            .map_err(|e| invalid_artifact(&certificate_path, e))?;
        if !cert.is_ca() {
            return Err(StartupError::NotCertificateAuthority);
        }
        if cert.public_key().raw != spki.as_slice() {
            return Err(StartupError::KeyMismatch(certificate_path));
        }
        let subject = distinguished_name(cert.subject());

        let public_key = SubjectPublicKeyInfoDer::from_pem_slice(public_key_pem.as_bytes())
            .map_err(|e| invalid_artifact(&public_key_path, e))?;
        if public_key.as_ref() != spki.as_slice() {
            return Err(StartupError::KeyMismatch(public_key_path));
        }

        let issuer = Issuer::from_ca_cert_pem(&certificate_pem, key_pair)
            .map_err(|e| invalid_artifact(&certificate_path, e))?;

        info!("loaded root authority from {}", certificate_path.display());

        Ok(Self {
            issuer,
            subject,
            certificate_pem,
            certificate_path,
        })
    }

    /// Generates a new root and writes its certificate, encrypted private key
    /// and public key. Nothing is written if any of them already exists.
    pub fn bootstrap(layout: &StorageLayout, password: &str) -> Result<(), StartupError> {
        if password.is_empty() {
            return Err(PasswordError::Empty.into());
        }
        layout
            .ensure_dirs()
            .map_err(|source| StartupError::CreateDirs {
                path: layout.root().to_path_buf(),
                source,
            })?;

        let certificate_path = layout.ca_certificate();
        let private_key_path = layout.ca_private_key();
        let public_key_path = layout.ca_public_key();
        for path in [&certificate_path, &private_key_path, &public_key_path] {
            if path.exists() {
                return Err(StartupError::AlreadyExists(path.clone()));
            }
        }

        let key_pair = KeyPair::generate().map_err(StartupError::Generation)?;
        let certificate = root_params()
            .self_signed(&key_pair)
            .map_err(StartupError::Generation)?;
        let encrypted_key = encrypt_private_key(&key_pair, password)?;

        let public_key_pem = key_pair.public_key_pem();
        let certificate_pem = certificate.pem();
        write_all_new(&[
            (&private_key_path, encrypted_key.as_str(), 0o600),
            (&public_key_path, public_key_pem.as_str(), 0o644),
            (&certificate_path, certificate_pem.as_str(), 0o644),
        ])?;

        info!("bootstrapped root authority in {}", layout.root().display());
        Ok(())
    }

    /// Signs a leaf for the template with a freshly generated key pair.
    pub fn sign(&self, template: &LeafTemplate) -> CaResult<LeafBundle> {
        let params = template.params()?;
        let key_pair = KeyPair::generate().map_err(CaError::KeyGeneration)?;
        let certificate = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(CaError::Signing)?;

        debug!(
            "signed leaf certificate for {} (serial {})",
            template.hostname(),
            template.serial()
        );

        Ok(LeafBundle {
            hostname: template.hostname().clone(),
            serial: template.serial(),
            certificate_pem: certificate.pem(),
            private_key_pem: key_pair.serialize_pem(),
            public_key_pem: key_pair.public_key_pem(),
        })
    }

    /// Subject attributes of the root, used as the issuer of every leaf.
    pub fn issuer_attributes(&self) -> &DistinguishedName {
        &self.subject
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn certificate_path(&self) -> &Path {
        &self.certificate_path
    }
}

impl std::fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootAuthority")
            .field("certificate_path", &self.certificate_path)
            .finish_non_exhaustive()
    }
}

fn root_params() -> CertificateParams {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, COMMON_NAME);
    dn.push(DnType::StateOrProvinceName, LOCALITY);
    dn.push(DnType::LocalityName, LOCALITY);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn.push(DnType::OrganizationalUnitName, ROOT_UNIT);

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumberGenerator::new().next().into());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::ContentCommitment,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::CodeSigning,
        ExtendedKeyUsagePurpose::EmailProtection,
        ExtendedKeyUsagePurpose::TimeStamping,
    ];
    params.subject_alt_names = vec![SanType::IpAddress([127, 0, 0, 1].into())];

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5); // Small buffer for clock skew
    params.not_after = add_years(now, ROOT_VALIDITY_YEARS);
    params
}

/// Converts the parsed subject into rcgen form, keeping attribute order.
fn distinguished_name(name: &X509Name<'_>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    for attr in name.iter_attributes() {
        let (Some(arcs), Ok(value)) = (attr.attr_type().iter(), attr.as_str()) else {
            continue;
        };
        let arcs: Vec<u64> = arcs.collect();
        dn.push(DnType::from_oid(&arcs), value);
    }
    dn
}

fn read_artifact(path: &Path) -> Result<String, StartupError> {
    fs::read_to_string(path).map_err(|source| {
        if source.kind() == io::ErrorKind::NotFound {
            StartupError::MissingArtifact(path.to_path_buf())
        } else {
            StartupError::Read {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}

fn write_new(path: &Path, contents: &str, mode: u32) -> Result<(), StartupError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let write_err = |source: io::Error| {
        if source.kind() == io::ErrorKind::AlreadyExists {
            StartupError::AlreadyExists(path.to_path_buf())
        } else {
            StartupError::Write {
                path: path.to_path_buf(),
                source,
            }
        }
    };
    let mut file = options.open(path).map_err(write_err)?;
    file.write_all(contents.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)
}

/// Writes each artifact in order. When one fails, the files this call
/// already created are removed so the root is never left half written.
fn write_all_new(artifacts: &[(&PathBuf, &str, u32)]) -> Result<(), StartupError> {
    for (index, &(path, contents, mode)) in artifacts.iter().enumerate() {
        let Err(err) = write_new(path, contents, mode) else {
            continue;
        };
        let mut created: Vec<&PathBuf> = artifacts[..index].iter().map(|(p, _, _)| *p).collect();
        if !matches!(err, StartupError::AlreadyExists(_)) {
            created.push(path);
        }
        for path in created {
            if let Err(e) = fs::remove_file(path) {
                warn!("failed to remove partial root artifact {}: {}", path.display(), e);
            }
        }
        return Err(err);
    }
    Ok(())
}

fn decrypt_private_key(pem: &str, password: &str) -> Result<KeyPair, StartupError> {
    let (label, document) =
        SecretDocument::from_pem(pem).map_err(|e| StartupError::KeyDecryption(e.into()))?;
    if label != ENCRYPTED_KEY_LABEL {
        return Err(StartupError::KeyFormat(label.to_string()));
    }
    let encrypted = EncryptedPrivateKeyInfo::try_from(document.as_bytes())
        .map_err(|e| StartupError::KeyDecryption(e.into()))?;
    let decrypted = encrypted
        .decrypt(password)
        .map_err(StartupError::KeyDecryption)?;
    KeyPair::try_from(decrypted.as_bytes()).map_err(StartupError::InvalidKey)
}

fn encrypt_private_key(key_pair: &KeyPair, password: &str) -> Result<String, StartupError> {
    let der = key_pair.serialize_der();
    let info = PrivateKeyInfo::try_from(der.as_slice())
        .map_err(|e| StartupError::KeyEncryption(e.into()))?;

    let mut salt = [0u8; 16];
    let mut iv = [0u8; 16];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut iv);
    let params = pbes2::Parameters::pbkdf2_sha256_aes256cbc(KEY_KDF_ROUNDS, &salt, &iv)
        .map_err(|e| StartupError::KeyEncryption(e.into()))?;

    let document = info
        .encrypt_with_params(params, password)
        .map_err(StartupError::KeyEncryption)?;
    let pem = document
        .to_pem(ENCRYPTED_KEY_LABEL, LineEnding::LF)
        .map_err(|e| StartupError::KeyEncryption(e.into()))?;
    Ok(pem.as_str().to_owned())
}

fn invalid_artifact(path: &Path, reason: impl std::fmt::Display) -> StartupError {
    StartupError::InvalidArtifact {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use time::OffsetDateTime;
    use rcgen::DnValue;
    use x509_parser::extensions::GeneralName;

    use super::*;
    use crate::ca::password::StaticPassword;
    use crate::hostname::Hostname;
    use crate::test_support::{
        TEST_PASSWORD, bootstrapped_layout, parse_certificate, shared_root,
    };

    fn template(host: &str) -> LeafTemplate {
        LeafTemplate::new(
            Hostname::parse(host).unwrap(),
            SerialNumberGenerator::new().next(),
            OffsetDateTime::now_utc(),
        )
    }

    #[test]
    fn bootstrap_then_load() {
        let (_dir, layout) = bootstrapped_layout();
        let root = RootAuthority::load(&layout, &StaticPassword::new(TEST_PASSWORD)).unwrap();

        assert_eq!(root.certificate_path(), layout.ca_certificate());
        assert!(root.certificate_pem().contains("BEGIN CERTIFICATE"));
        assert_eq!(root.issuer_attributes().iter().count(), 5);
        assert!(root.issuer_attributes().get(&DnType::CommonName).is_some());

        parse_certificate(root.certificate_pem(), |cert| {
            assert!(cert.is_ca());
            let cn = cert.subject().iter_common_name().next().unwrap();
            assert_eq!(cn.as_str().unwrap(), COMMON_NAME);

            let san = cert.subject_alternative_name().unwrap().unwrap();
            assert_eq!(
                san.value.general_names,
                vec![GeneralName::IPAddress(&[127, 0, 0, 1])]
            );
        });
    }

    #[test]
    fn issuer_attributes_follow_root_subject() {
        let root = shared_root();
        let attributes: Vec<_> = root
            .issuer_attributes()
            .iter()
            .map(|(ty, value)| (ty.clone(), value.clone()))
            .collect();
        assert_eq!(
            attributes,
            vec![
                (DnType::CommonName, DnValue::Utf8String(COMMON_NAME.to_string())),
                (DnType::StateOrProvinceName, DnValue::Utf8String(LOCALITY.to_string())),
                (DnType::LocalityName, DnValue::Utf8String(LOCALITY.to_string())),
                (DnType::OrganizationName, DnValue::Utf8String(ORGANIZATION.to_string())),
                (DnType::OrganizationalUnitName, DnValue::Utf8String(ROOT_UNIT.to_string())),
            ]
        );
    }

    /// A failed write removes what bootstrap already wrote, so a retry works.
    #[cfg(unix)]
    #[test]
    fn failed_bootstrap_leaves_no_partial_root() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        // A dangling link passes the existence check but fails create_new.
        std::os::unix::fs::symlink(dir.path().join("nowhere"), layout.ca_public_key()).unwrap();

        let err = RootAuthority::bootstrap(&layout, TEST_PASSWORD).unwrap_err();
        assert!(matches!(err, StartupError::AlreadyExists(ref path) if *path == layout.ca_public_key()));
        assert!(!layout.ca_private_key().exists());
        assert!(!layout.ca_certificate().exists());
        assert!(fs::symlink_metadata(layout.ca_public_key()).is_ok());

        fs::remove_file(layout.ca_public_key()).unwrap();
        RootAuthority::bootstrap(&layout, TEST_PASSWORD).unwrap();
        RootAuthority::load(&layout, &StaticPassword::new(TEST_PASSWORD)).unwrap();
    }

    /// A fresh directory has no root; loading must fail rather than invent one.
    #[test]
    fn load_from_empty_directory_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path().join("ca"));
        let err = RootAuthority::load(&layout, &StaticPassword::new(TEST_PASSWORD)).unwrap_err();

        assert!(matches!(err, StartupError::MissingArtifact(ref path) if *path == layout.ca_certificate()));
        assert!(layout.certs_dir().is_dir());
        assert!(layout.keys_dir().is_dir());
    }

    #[test]
    fn wrong_password_is_rejected() {
        let (_dir, layout) = bootstrapped_layout();
        let err = RootAuthority::load(&layout, &StaticPassword::new("not the password"))
            .unwrap_err();
        assert!(
            matches!(err, StartupError::KeyDecryption(_) | StartupError::InvalidKey(_)),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn bootstrap_never_overwrites() {
        let (_dir, layout) = bootstrapped_layout();
        let before = fs::read_to_string(layout.ca_certificate()).unwrap();

        let err = RootAuthority::bootstrap(&layout, TEST_PASSWORD).unwrap_err();
        assert!(matches!(err, StartupError::AlreadyExists(_)));
        assert_eq!(fs::read_to_string(layout.ca_certificate()).unwrap(), before);
    }

    /// A partially present root is not completed by bootstrap either.
    #[test]
    fn bootstrap_refuses_partial_root() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StorageLayout::new(dir.path());
        layout.ensure_dirs().unwrap();
        fs::write(layout.ca_public_key(), "placeholder").unwrap();

        let err = RootAuthority::bootstrap(&layout, TEST_PASSWORD).unwrap_err();
        assert!(matches!(err, StartupError::AlreadyExists(ref path) if *path == layout.ca_public_key()));
        assert!(!layout.ca_certificate().exists());
        assert!(!layout.ca_private_key().exists());
    }

    #[test]
    fn mismatched_public_key_is_rejected() {
        let (_dir, layout) = bootstrapped_layout();
        let other = KeyPair::generate().unwrap();
        fs::write(layout.ca_public_key(), other.public_key_pem()).unwrap();

        let err = RootAuthority::load(&layout, &StaticPassword::new(TEST_PASSWORD)).unwrap_err();
        assert!(matches!(err, StartupError::KeyMismatch(ref path) if *path == layout.ca_public_key()));
    }

    #[test]
    fn unencrypted_private_key_is_rejected() {
        let (_dir, layout) = bootstrapped_layout();
        let plain = KeyPair::generate().unwrap();
        fs::write(layout.ca_private_key(), plain.serialize_pem()).unwrap();

        let err = RootAuthority::load(&layout, &StaticPassword::new(TEST_PASSWORD)).unwrap_err();
        assert!(matches!(err, StartupError::KeyFormat(ref label) if label == "PRIVATE KEY"));
    }

    #[test]
    fn leaf_is_signed_by_root_with_expected_attributes() {
        let root = shared_root();
        let template = template("api.example.com");
        let leaf = root.sign(&template).unwrap();

        assert!(leaf.private_key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(leaf.public_key_pem.contains("BEGIN PUBLIC KEY"));

        parse_certificate(root.certificate_pem(), |root_cert| {
            parse_certificate(&leaf.certificate_pem, |cert| {
                assert_eq!(cert.issuer().to_string(), root_cert.subject().to_string());
                cert.verify_signature(Some(root_cert.public_key()))
                    .expect("leaf signature verifies against the root key");

                let cn = cert.subject().iter_common_name().next().unwrap();
                assert_eq!(cn.as_str().unwrap(), "api.example.com");

                let san = cert.subject_alternative_name().unwrap().unwrap();
                assert!(
                    san.value
                        .general_names
                        .contains(&GeneralName::DNSName("api.example.com"))
                );

                let constraints = cert.basic_constraints().unwrap().unwrap();
                assert!(!constraints.value.ca);
                assert_eq!(cert.raw_serial(), template.serial().as_bytes());
            });
        });
    }

    #[test]
    fn leaf_validity_is_exactly_two_years() {
        let root = shared_root();
        let leaf = root.sign(&template("validity.example.com")).unwrap();

        parse_certificate(&leaf.certificate_pem, |cert| {
            let not_before =
                OffsetDateTime::from_unix_timestamp(cert.validity().not_before.timestamp()).unwrap();
            let not_after =
                OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp()).unwrap();
            assert_eq!(not_after, add_years(not_before, 2));
            assert_eq!(not_after.year(), not_before.year() + 2);
            assert!((OffsetDateTime::now_utc() - not_before).whole_minutes() < 5);
        });
    }

    #[test]
    fn issued_serials_are_distinct() {
        let root = shared_root();
        let serials: HashSet<Vec<u8>> = (0..16)
            .map(|_| {
                let leaf = root.sign(&template("serial.example.com")).unwrap();
                parse_certificate(&leaf.certificate_pem, |cert| cert.raw_serial().to_vec())
            })
            .collect();
        assert_eq!(serials.len(), 16);
    }
}
