//! Certificate authority for the cluster's control plane
//!
//! A cluster owns one self-signed CA for its lifetime. Every control-plane
//! instance gets a fresh API server key pair signed by that CA, delivered
//! only inside the instance's metadata.
//!
//! All operations are pure: they generate a fresh key on every call and
//! touch no shared state. Loading a CA from disk is the only I/O.

use std::net::IpAddr;
use std::path::Path;

use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyUsagePurpose, SanType,
};
use thiserror::Error;
use tracing::debug;
use x509_parser::prelude::*;

/// Validity period for CA certificates (10 years)
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for server certificates (1 year)
pub const SERVER_VALIDITY_YEARS: i64 = 1;

/// File name of the CA certificate inside a CA directory
pub const CA_CERT_FILE: &str = "ca.crt";

/// File name of the CA private key inside a CA directory
pub const CA_KEY_FILE: &str = "ca.key";

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate creation or signing failed
    #[error("certificate signing failed: {0}")]
    CertificateSigningFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + ::time::Duration::days(years * 365);
    (now, not_after)
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

/// A PEM private key and the PEM certificate for it
#[derive(Clone)]
pub struct KeyPair {
    key_pem: String,
    cert_pem: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_pem", &"[REDACTED]")
            .field("cert_pem", &self.cert_pem)
            .finish()
    }
}

impl KeyPair {
    /// Build a key pair from PEM strings, checking that both parse
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        rcgen::KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))?;
        let der = parse_pem(cert_pem)?;
        X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        Ok(Self {
            key_pem: key_pem.to_string(),
            cert_pem: cert_pem.to_string(),
        })
    }

    /// Load a CA from `ca.crt` and `ca.key` inside `dir`
    pub fn load_ca(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let cert_pem = std::fs::read_to_string(dir.join(CA_CERT_FILE))?;
        let key_pem = std::fs::read_to_string(dir.join(CA_KEY_FILE))?;
        let pair = Self::from_pem(&cert_pem, &key_pem)?;

        if !CertificateInfo::from_pem(&cert_pem)?.is_ca {
            return Err(PkiError::ParseError(format!(
                "{} is not a CA certificate",
                dir.join(CA_CERT_FILE).display()
            )));
        }
        debug!(dir = %dir.display(), "loaded cluster CA");
        Ok(pair)
    }

    /// PEM-encoded certificate
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM-encoded private key
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    fn signing_key(&self) -> Result<rcgen::KeyPair> {
        rcgen::KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }
}

/// Addresses a server certificate is valid for
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AltNames {
    /// IP subject alternative names
    pub ips: Vec<IpAddr>,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
}

impl AltNames {
    /// Alt names for an in-cluster service plus caller-supplied addresses
    ///
    /// Strings in `ips` that do not parse as IP addresses are dropped.
    /// The service is reachable as `svc`, `svc.ns`, `svc.ns.svc` and
    /// `svc.ns.svc.<domain>`, appended after `hostnames`.
    pub fn for_service(
        service_name: &str,
        service_namespace: &str,
        dns_domain: &str,
        ips: &[String],
        hostnames: &[String],
    ) -> Self {
        let ips = ips
            .iter()
            .filter_map(|ip| ip.parse::<IpAddr>().ok())
            .collect();

        let namespaced = format!("{service_name}.{service_namespace}");
        let mut dns_names = hostnames.to_vec();
        dns_names.extend([
            service_name.to_string(),
            namespaced.clone(),
            format!("{namespaced}.svc"),
            format!("{namespaced}.svc.{dns_domain}"),
        ]);

        Self { ips, dns_names }
    }

    fn to_san_types(&self) -> Result<Vec<SanType>> {
        let mut sans: Vec<SanType> = self.ips.iter().copied().map(SanType::IpAddress).collect();
        for name in &self.dns_names {
            let dns = Ia5String::try_from(name.clone()).map_err(|e| {
                PkiError::CertificateSigningFailed(format!("invalid DNS name '{}': {}", name, e))
            })?;
            sans.push(SanType::DnsName(dns));
        }
        Ok(sans)
    }
}

/// Create a self-signed CA with a fresh private key
pub fn new_ca(common_name: &str) -> Result<KeyPair> {
    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;

    let key = rcgen::KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("unable to create a private key for a new CA: {}", e))
    })?;

    let cert = params.self_signed(&key).map_err(|e| {
        PkiError::CertificateSigningFailed(format!(
            "unable to create a self-signed certificate for a new CA: {}",
            e
        ))
    })?;

    Ok(KeyPair {
        key_pem: key.serialize_pem(),
        cert_pem: cert.pem(),
    })
}

/// Create a server key pair signed by `ca`
///
/// The certificate is usable for TLS server authentication only and covers
/// the names produced by [`AltNames::for_service`].
pub fn new_server_key_pair(
    ca: &KeyPair,
    common_name: &str,
    service_name: &str,
    service_namespace: &str,
    dns_domain: &str,
    ips: &[String],
    hostnames: &[String],
) -> Result<KeyPair> {
    let alt_names =
        AltNames::for_service(service_name, service_namespace, dns_domain, ips, hostnames);

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(common_name);
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.subject_alt_names = alt_names.to_san_types()?;

    let (not_before, not_after) = compute_validity(SERVER_VALIDITY_YEARS);
    params.not_before = not_before;
    params.not_after = not_after;

    let server_key = rcgen::KeyPair::generate().map_err(|e| {
        PkiError::KeyGenerationFailed(format!("unable to create a server private key: {}", e))
    })?;

    let ca_key = ca.signing_key()?;
    let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
        .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

    let cert = params.signed_by(&server_key, &issuer).map_err(|e| {
        PkiError::CertificateSigningFailed(format!("unable to sign the server certificate: {}", e))
    })?;

    debug!(
        common_name,
        dns_names = alt_names.dns_names.len(),
        ips = alt_names.ips.len(),
        "signed server certificate"
    );

    Ok(KeyPair {
        key_pem: server_key.serialize_pem(),
        cert_pem: cert.pem(),
    })
}

/// Returns Ok(true) when `cert_pem` carries a valid signature from `ca`
pub fn verify_signed_by(cert_pem: &str, ca: &KeyPair) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_der = parse_pem(&ca.cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

/// Fields of interest parsed out of a certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names in certificate order
    pub dns_names: Vec<String>,
    /// IP subject alternative names in certificate order
    pub ip_addresses: Vec<IpAddr>,
    /// CA basic constraint
    pub is_ca: bool,
    /// Extended key usage includes serverAuth
    pub server_auth: bool,
    /// Extended key usage includes clientAuth
    pub client_auth: bool,
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        let (server_auth, client_auth) = match cert.extended_key_usage() {
            Ok(Some(eku)) => (eku.value.server_auth, eku.value.client_auth),
            _ => (false, false),
        };

        Ok(Self {
            common_name,
            dns_names,
            ip_addresses,
            is_ca: cert.is_ca(),
            server_auth,
            client_auth,
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn apiserver_pair(ca: &KeyPair, ips: &[&str], hostnames: &[&str]) -> KeyPair {
        new_server_key_pair(
            ca,
            "kube-apiserver",
            "kubernetes",
            "default",
            "cluster.local",
            &strings(ips),
            &strings(hostnames),
        )
        .expect("server key pair should be signed")
    }

    #[test]
    fn ca_is_self_signed_ca_certificate() {
        let ca = new_ca("cluster-ca").expect("CA creation should succeed");
        assert!(ca.cert_pem().contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem().contains("PRIVATE KEY"));

        let info = CertificateInfo::from_pem(ca.cert_pem()).unwrap();
        assert_eq!(info.common_name, "cluster-ca");
        assert!(info.is_ca);
        assert!(verify_signed_by(ca.cert_pem(), &ca).unwrap());
    }

    #[test]
    fn every_ca_gets_a_fresh_key() {
        let a = new_ca("ca").unwrap();
        let b = new_ca("ca").unwrap();
        assert_ne!(a.key_pem(), b.key_pem());
    }

    /// Story: the API server certificate is trusted by the cluster CA only
    #[test]
    fn story_server_cert_verifies_against_its_ca_only() {
        let ca = new_ca("cluster-ca").unwrap();
        let other = new_ca("other-ca").unwrap();
        let server = apiserver_pair(&ca, &["10.0.0.1"], &["master-0"]);

        assert!(verify_signed_by(server.cert_pem(), &ca).unwrap());
        assert!(!verify_signed_by(server.cert_pem(), &other).unwrap());

        let info = CertificateInfo::from_pem(server.cert_pem()).unwrap();
        assert_eq!(info.common_name, "kube-apiserver");
        assert!(!info.is_ca);
        assert!(info.server_auth);
        assert!(!info.client_auth);
    }

    /// Story: the server cert answers to every in-cluster name of the service
    #[test]
    fn story_server_cert_covers_service_names() {
        let ca = new_ca("cluster-ca").unwrap();
        let server = apiserver_pair(&ca, &["10.0.0.1"], &["master-0.example.com"]);
        let info = CertificateInfo::from_pem(server.cert_pem()).unwrap();

        assert_eq!(
            info.dns_names,
            strings(&[
                "master-0.example.com",
                "kubernetes",
                "kubernetes.default",
                "kubernetes.default.svc",
                "kubernetes.default.svc.cluster.local",
            ])
        );
        assert_eq!(info.ip_addresses, vec!["10.0.0.1".parse::<IpAddr>().unwrap()]);
    }

    /// Story: malformed IPs vanish instead of becoming DNS names
    #[test]
    fn story_invalid_ips_are_dropped() {
        let ca = new_ca("cluster-ca").unwrap();
        let server = apiserver_pair(&ca, &["10.0.0.1", "not-an-ip", "300.1.1.1", "::1"], &[]);
        let info = CertificateInfo::from_pem(server.cert_pem()).unwrap();

        assert_eq!(info.ip_addresses.len(), 2);
        assert!(!info.dns_names.iter().any(|n| n == "not-an-ip" || n == "300.1.1.1"));
        assert_eq!(info.dns_names.len(), 4);
    }

    #[test]
    fn alt_names_order_is_stable() {
        let names = AltNames::for_service("svc", "ns", "example.org", &[], &strings(&["h"]));
        assert_eq!(
            names.dns_names,
            strings(&["h", "svc", "svc.ns", "svc.ns.svc", "svc.ns.svc.example.org"])
        );
        assert!(names.ips.is_empty());
    }

    #[test]
    fn validity_periods_match_role() {
        let ca = new_ca("cluster-ca").unwrap();
        let server = apiserver_pair(&ca, &[], &[]);
        let day = 24 * 60 * 60;

        let ca_days = CertificateInfo::from_pem(ca.cert_pem()).unwrap().lifetime_secs() / day;
        let server_days =
            CertificateInfo::from_pem(server.cert_pem()).unwrap().lifetime_secs() / day;
        assert!((ca_days - CA_VALIDITY_YEARS * 365).abs() <= 1);
        assert!((server_days - SERVER_VALIDITY_YEARS * 365).abs() <= 1);
    }

    #[test]
    fn non_ascii_hostname_fails_signing() {
        let ca = new_ca("cluster-ca").unwrap();
        let err = new_server_key_pair(
            &ca,
            "kube-apiserver",
            "kubernetes",
            "default",
            "cluster.local",
            &[],
            &strings(&["mäster"]),
        )
        .unwrap_err();
        assert!(matches!(err, PkiError::CertificateSigningFailed(_)));
    }

    #[test]
    fn ca_loads_from_directory() {
        let ca = new_ca("persisted-ca").unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CA_CERT_FILE), ca.cert_pem()).unwrap();
        std::fs::write(dir.path().join(CA_KEY_FILE), ca.key_pem()).unwrap();

        let loaded = KeyPair::load_ca(dir.path()).unwrap();
        assert_eq!(loaded.cert_pem(), ca.cert_pem());

        let server = apiserver_pair(&loaded, &[], &[]);
        assert!(verify_signed_by(server.cert_pem(), &ca).unwrap());
    }

    #[test]
    fn loading_a_leaf_as_ca_is_rejected() {
        let ca = new_ca("cluster-ca").unwrap();
        let leaf = apiserver_pair(&ca, &[], &[]);
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CA_CERT_FILE), leaf.cert_pem()).unwrap();
        std::fs::write(dir.path().join(CA_KEY_FILE), leaf.key_pem()).unwrap();

        assert!(matches!(
            KeyPair::load_ca(dir.path()),
            Err(PkiError::ParseError(_))
        ));
    }

    #[test]
    fn missing_ca_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = KeyPair::load_ca(dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, PkiError::Io(_)));
    }

    #[test]
    fn debug_output_redacts_private_key() {
        let ca = new_ca("cluster-ca").unwrap();
        let debug = format!("{:?}", ca);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("PRIVATE KEY"));
    }
}
