//! Leaf certificate templates and issued material.

use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType,
};
use time::{Duration, OffsetDateTime};

use super::root::{CaError, CaResult, LOCALITY, ORGANIZATION};
use super::serial::Serial;
use crate::hostname::Hostname;

/// Leaf certificates are valid for two calendar years from issuance.
pub const LEAF_VALIDITY_YEARS: i32 = 2;

const LEAF_UNIT: &str = "mitm-ca Server Certificate";

/// Everything that distinguishes one leaf from another before signing.
#[derive(Debug, Clone)]
pub struct LeafTemplate {
    hostname: Hostname,
    serial: Serial,
    not_before: OffsetDateTime,
}

impl LeafTemplate {
    /// Creates a template issued at `issued_at`, truncated to whole seconds
    /// since X.509 times carry no fractions.
    pub fn new(hostname: Hostname, serial: Serial, issued_at: OffsetDateTime) -> Self {
        let not_before = issued_at - Duration::nanoseconds(i64::from(issued_at.nanosecond()));
        Self {
            hostname,
            serial,
            not_before,
        }
    }

    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        add_years(self.not_before, LEAF_VALIDITY_YEARS)
    }

    pub(crate) fn params(&self) -> CaResult<CertificateParams> {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, self.hostname.as_str());
        dn.push(DnType::StateOrProvinceName, LOCALITY);
        dn.push(DnType::LocalityName, LOCALITY);
        dn.push(DnType::OrganizationName, ORGANIZATION);
        dn.push(DnType::OrganizationalUnitName, LEAF_UNIT);

        let san = match self.hostname.ip_addr() {
            Some(ip) => SanType::IpAddress(ip),
            None => SanType::DnsName(
                self.hostname
                    .as_str()
                    .try_into()
                    .map_err(|_| CaError::InvalidDnsName(self.hostname.to_string()))?,
            ),
        };

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.subject_alt_names = vec![san];
        params.serial_number = Some(self.serial.into());
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::DataEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.use_authority_key_identifier_extension = true;
        params.not_before = self.not_before;
        params.not_after = self.not_after();
        Ok(params)
    }
}

/// A freshly signed leaf with all three artifacts.
#[derive(Debug, Clone)]
pub struct LeafBundle {
    pub hostname: Hostname,
    pub serial: Serial,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub public_key_pem: String,
}

impl LeafBundle {
    pub fn to_issued(&self) -> IssuedCertificate {
        IssuedCertificate::new(
            self.hostname.clone(),
            self.certificate_pem.clone(),
            self.private_key_pem.clone(),
        )
    }
}

/// The certificate and private key handed to the TLS layer.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    hostname: Hostname,
    certificate_pem: String,
    private_key_pem: String,
}

impl IssuedCertificate {
    pub fn new(hostname: Hostname, certificate_pem: String, private_key_pem: String) -> Self {
        Self {
            hostname,
            certificate_pem,
            private_key_pem,
        }
    }

    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// Parses the certificate's not-after time.
    /// Returns `None` when the stored PEM is not a readable certificate.
    pub fn not_after(&self) -> Option<OffsetDateTime> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(self.certificate_pem.as_bytes()).ok()?;
        let cert = pem.parse_x509().ok()?;
        OffsetDateTime::from_unix_timestamp(cert.validity().not_after.timestamp()).ok()
    }
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("hostname", &self.hostname)
            .finish_non_exhaustive()
    }
}

/// Adds calendar years, moving February 29th to the 28th when the target
/// year has no leap day.
pub(crate) fn add_years(at: OffsetDateTime, years: i32) -> OffsetDateTime {
    let target = at.year() + years;
    at.replace_year(target)
        .or_else(|_| at.replace_day(28).and_then(|day| day.replace_year(target)))
        .unwrap_or(at + Duration::days(365 * i64::from(years)))
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::ca::SerialNumberGenerator;

    #[test]
    fn add_years_keeps_calendar_date() {
        assert_eq!(
            add_years(datetime!(2024-03-10 12:30:45 UTC), 2),
            datetime!(2026-03-10 12:30:45 UTC)
        );
        assert_eq!(
            add_years(datetime!(2024-02-29 08:00:00 UTC), 2),
            datetime!(2026-02-28 08:00:00 UTC)
        );
    }

    #[test]
    fn template_truncates_to_seconds_and_spans_two_years() {
        let host = Hostname::parse("example.com").unwrap();
        let issued_at = datetime!(2025-06-01 10:00:00.750 UTC);
        let template = LeafTemplate::new(host, SerialNumberGenerator::new().next(), issued_at);
        assert_eq!(template.not_before(), datetime!(2025-06-01 10:00:00 UTC));
        assert_eq!(template.not_after(), datetime!(2027-06-01 10:00:00 UTC));
    }

    #[test]
    fn ip_hostnames_get_ip_san() {
        let host = Hostname::parse("10.1.2.3").unwrap();
        let template =
            LeafTemplate::new(host, SerialNumberGenerator::new().next(), OffsetDateTime::now_utc());
        let params = template.params().unwrap();
        assert_eq!(
            params.subject_alt_names,
            vec![SanType::IpAddress("10.1.2.3".parse().unwrap())]
        );
        assert_eq!(params.is_ca, IsCa::ExplicitNoCa);
    }

    #[test]
    fn unreadable_certificate_has_no_expiry() {
        let issued = IssuedCertificate::new(
            Hostname::parse("example.com").unwrap(),
            "not a certificate".to_string(),
            String::new(),
        );
        assert_eq!(issued.not_after(), None);
    }
}
