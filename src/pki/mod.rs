//! PKI seam for client certificate issuance
//!
//! The certificate authority is an external collaborator. This module defines
//! the interface `trellis` needs from it ([`CertificateIssuer`]) and ships two
//! adapters:
//!
//! - [`LocalCa`] signs in-process with a CA certificate and key loaded from disk
//! - [`RemoteCa`] submits CSRs to a signing endpoint, authenticated with the
//!   bootstrap token
//!
//! # Security Model
//!
//! - Key pairs are generated locally for every request ([`CertRequest`])
//! - Only the CSR crosses the adapter boundary; private keys never do
//! - The issuer controls subject, validity and extensions of every certificate

mod remote;

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use chrono::{Datelike, Days, Utc};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, CertificateSigningRequestParams,
    DistinguishedName, DnType, DnValue, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use x509_parser::prelude::*;

#[cfg(test)]
use mockall::automock;

pub use remote::RemoteCa;

/// Default validity of issued client certificates
pub const DEFAULT_VALIDITY_DAYS: u32 = 365;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// The CA could not be reached
    #[error("CA unreachable: {0}")]
    Unreachable(String),

    /// The CA refused to sign
    #[error("CA rejected request: {0}")]
    Rejected(String),

    /// Invalid CSR
    #[error("invalid CSR: {0}")]
    InvalidCsr(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Extract the subject CN of a PEM certificate
pub fn certificate_common_name(cert_pem: &str) -> Result<String> {
    let pem_obj = ::pem::parse(cert_pem.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    if pem_obj.tag() != "CERTIFICATE" {
        return Err(PkiError::ParseError(format!(
            "expected CERTIFICATE block, found {}",
            pem_obj.tag()
        )));
    }
    let (_, cert) = X509Certificate::from_der(pem_obj.contents())
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| PkiError::ParseError("certificate has no common name".to_string()));
    common_name
}

/// Canonical form of a subject alt name: IPs re-rendered, DNS names lowercased
pub fn normalize_san(name: &str) -> String {
    match name.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => name.to_ascii_lowercase(),
    }
}

/// DNS and IP subject alt names of a PEM certificate, normalized
pub fn certificate_subject_alt_names(cert_pem: &str) -> Result<BTreeSet<String>> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let names = match cert.subject_alternative_name() {
        Ok(Some(ext)) => ext
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(normalize_san(dns)),
                GeneralName::IPAddress(bytes) => ip_from_bytes(bytes).map(|ip| ip.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => BTreeSet::new(),
        Err(e) => {
            return Err(PkiError::ParseError(format!(
                "invalid subjectAltName extension: {}",
                e
            )))
        }
    };
    Ok(names)
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    if let Ok(v4) = <[u8; 4]>::try_from(bytes) {
        return Some(IpAddr::from(v4));
    }
    <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from)
}

/// What the CA is asked to certify
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueRequest {
    /// Subject CN
    pub common_name: String,
    /// Additional subject attributes (`O`, `OU`, `C`, `ST`, `L`)
    pub organization_fields: BTreeMap<String, String>,
    /// Local account that will own the private key (informational for the CA)
    pub private_key_owner: String,
    /// DNS names / IP addresses for serving certificates; empty for pure clients
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_alt_names: Vec<String>,
}

impl IssueRequest {
    fn distinguished_name(&self) -> Result<DistinguishedName> {
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(self.common_name.clone()),
        );
        for (key, value) in &self.organization_fields {
            let dn_type = match key.as_str() {
                "O" => DnType::OrganizationName,
                "OU" => DnType::OrganizationalUnitName,
                "C" => DnType::CountryName,
                "ST" => DnType::StateOrProvinceName,
                "L" => DnType::LocalityName,
                other => {
                    return Err(PkiError::CertificateGenerationFailed(format!(
                        "unsupported subject field: {}",
                        other
                    )))
                }
            };
            dn.push(dn_type, DnValue::Utf8String(value.clone()));
        }
        Ok(dn)
    }

    fn san_entries(&self) -> Result<Vec<SanType>> {
        self.subject_alt_names
            .iter()
            .map(|name| match name.parse::<IpAddr>() {
                Ok(ip) => Ok(SanType::IpAddress(ip)),
                Err(_) => Ia5String::try_from(name.clone())
                    .map(SanType::DnsName)
                    .map_err(|e| {
                        PkiError::CertificateGenerationFailed(format!(
                            "invalid DNS name {}: {}",
                            name, e
                        ))
                    }),
            })
            .collect()
    }
}

/// A signed certificate and its private key, both PEM
#[derive(Clone)]
pub struct IssuedCertificate {
    /// Client certificate
    pub cert_pem: String,
    /// Private key
    pub key_pem: String,
}

impl std::fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// Interface to the certificate authority collaborator
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Issue a certificate and key for the request
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCertificate>;

    /// PEM of the CA that signs issued certificates (embedded in bundles)
    fn ca_cert_pem(&self) -> String;
}

/// Locally generated key pair and CSR for one request
pub struct CertRequest {
    /// The generated key pair PEM (kept private)
    key_pem: String,
    /// CSR in PEM format (sent to the CA)
    csr_pem: String,
}

impl CertRequest {
    /// Generate a new key pair and CSR for the request's subject
    pub fn new(request: &IssueRequest) -> Result<Self> {
        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!(
                "failed to generate key for {}: {}",
                request.common_name, e
            ))
        })?;
        let key_pem = key_pair.serialize_pem();

        let mut params = CertificateParams::default();
        params.distinguished_name = request.distinguished_name()?;

        let csr = params.serialize_request(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CSR: {}", e))
        })?;
        let csr_pem = csr.pem().map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to serialize CSR: {}", e))
        })?;

        Ok(Self { key_pem, csr_pem })
    }

    /// Get the CSR in PEM format
    pub fn csr_pem(&self) -> &str {
        &self.csr_pem
    }

    /// Get the private key in PEM format
    pub fn private_key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Consume the request, returning the private key PEM
    pub fn into_private_key_pem(self) -> String {
        self.key_pem
    }
}

fn set_validity(params: &mut CertificateParams, days: u32) -> Result<()> {
    let today = Utc::now().date_naive();
    let expiry = today
        .checked_add_days(Days::new(u64::from(days)))
        .ok_or_else(|| PkiError::CertificateGenerationFailed("validity out of range".to_string()))?;
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(expiry.year(), expiry.month() as u8, expiry.day() as u8);
    Ok(())
}

/// Certificate authority that signs in-process
pub struct LocalCa {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
    /// Validity of issued certificates
    validity_days: u32,
}

impl LocalCa {
    /// Create a new self-signed CA (development clusters and tests)
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        set_validity(&mut params, 10 * 365)?;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        })
    }

    /// Load CA from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
            validity_days: DEFAULT_VALIDITY_DAYS,
        })
    }

    /// Load CA from PEM files
    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Set the validity of issued certificates
    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    /// Get the CA private key in PEM format (for backup/storage)
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Sign a CSR for the request's subject and return the certificate PEM
    ///
    /// Only the public key is taken from the CSR. Subject, validity and
    /// extensions come from the request.
    pub fn sign_csr(&self, csr_pem: &str, request: &IssueRequest) -> Result<String> {
        let mut csr_params = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|e| PkiError::InvalidCsr(format!("failed to parse CSR: {}", e)))?;

        csr_params.params.distinguished_name = request.distinguished_name()?;
        csr_params.params.is_ca = IsCa::NoCa;
        csr_params.params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];

        let sans = request.san_entries()?;
        csr_params.params.extended_key_usages = if sans.is_empty() {
            vec![ExtendedKeyUsagePurpose::ClientAuth]
        } else {
            vec![
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::ServerAuth,
            ]
        };
        csr_params.params.subject_alt_names = sans;

        set_validity(&mut csr_params.params, self.validity_days)?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let signed_cert = csr_params.signed_by(&issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign certificate: {}", e))
        })?;

        Ok(signed_cert.pem())
    }
}

#[async_trait]
impl CertificateIssuer for LocalCa {
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCertificate> {
        let cert_request = CertRequest::new(request)?;
        let cert_pem = self.sign_csr(cert_request.csr_pem(), request)?;
        Ok(IssuedCertificate {
            cert_pem,
            key_pem: cert_request.into_private_key_pem(),
        })
    }

    fn ca_cert_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }
}

/// Verify a certificate was signed by the given CA
pub fn verify_signed_by(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_cert_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cn: &str) -> IssueRequest {
        IssueRequest {
            common_name: cn.to_string(),
            organization_fields: [("O".to_string(), "system:masters".to_string())].into(),
            private_key_owner: cn.to_string(),
            subject_alt_names: vec![],
        }
    }

    #[tokio::test]
    async fn local_ca_issues_client_certificate_for_subject() {
        let ca = LocalCa::generate("trellis test CA").unwrap();
        let issued = ca.issue(&request("alice")).await.unwrap();

        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));
        assert_eq!(certificate_common_name(&issued.cert_pem).unwrap(), "alice");
        assert!(verify_signed_by(&issued.cert_pem, &ca.ca_cert_pem()).unwrap());
    }

    #[tokio::test]
    async fn each_issue_generates_a_fresh_key() {
        let ca = LocalCa::generate("trellis test CA").unwrap();
        let first = ca.issue(&request("alice")).await.unwrap();
        let second = ca.issue(&request("alice")).await.unwrap();
        assert_ne!(first.key_pem, second.key_pem);
    }

    #[test]
    fn csr_never_contains_the_private_key() {
        let req = CertRequest::new(&request("bob")).unwrap();
        assert!(req.csr_pem().contains("CERTIFICATE REQUEST"));
        assert!(!req.csr_pem().contains("PRIVATE KEY"));
        assert!(req.private_key_pem().contains("PRIVATE KEY"));
    }

    #[test]
    fn serving_requests_accept_dns_names_and_ip_addresses() {
        let ca = LocalCa::generate("trellis test CA").unwrap();
        let mut req = request("kube-apiserver");
        req.subject_alt_names = vec!["api.example.com".to_string(), "10.0.0.1".to_string()];

        let csr = CertRequest::new(&req).unwrap();
        let cert = ca.sign_csr(csr.csr_pem(), &req).unwrap();

        let der = parse_pem(&cert).unwrap();
        let (_, parsed) = X509Certificate::from_der(&der).unwrap();
        let san = parsed.subject_alternative_name().unwrap().unwrap();
        assert_eq!(san.value.general_names.len(), 2);
    }

    #[test]
    fn subject_alt_names_are_read_back_normalized() {
        let ca = LocalCa::generate("trellis test CA").unwrap();
        let mut req = request("kube-apiserver");
        req.subject_alt_names = vec![
            "API.Example.com".to_string(),
            "10.0.0.1".to_string(),
            "fd00::10".to_string(),
        ];
        let csr = CertRequest::new(&req).unwrap();
        let cert = ca.sign_csr(csr.csr_pem(), &req).unwrap();

        let names = certificate_subject_alt_names(&cert).unwrap();
        let expected: BTreeSet<String> = ["api.example.com", "10.0.0.1", "fd00::10"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, expected);

        let client = CertRequest::new(&request("alice")).unwrap();
        let client_cert = ca.sign_csr(client.csr_pem(), &request("alice")).unwrap();
        assert!(certificate_subject_alt_names(&client_cert).unwrap().is_empty());
    }

    #[test]
    fn normalization_canonicalizes_ip_literals() {
        assert_eq!(normalize_san("FD00:0:0:0:0:0:0:10"), "fd00::10");
        assert_eq!(normalize_san("Api.Example.COM"), "api.example.com");
    }

    #[test]
    fn certificates_from_another_ca_do_not_verify() {
        let ca1 = LocalCa::generate("CA One").unwrap();
        let ca2 = LocalCa::generate("CA Two").unwrap();
        let req = request("carol");
        let csr = CertRequest::new(&req).unwrap();
        let cert = ca1.sign_csr(csr.csr_pem(), &req).unwrap();

        assert!(!verify_signed_by(&cert, &ca2.ca_cert_pem()).unwrap());
    }

    #[test]
    fn unsupported_subject_field_fails_generation() {
        let mut req = request("dave");
        req.organization_fields
            .insert("emailAddress".to_string(), "d@example.com".to_string());
        assert!(matches!(
            CertRequest::new(&req),
            Err(PkiError::CertificateGenerationFailed(_))
        ));
    }

    #[test]
    fn malformed_csr_is_rejected() {
        let ca = LocalCa::generate("Strict CA").unwrap();
        for invalid in [
            "not a csr at all",
            "-----BEGIN CERTIFICATE REQUEST-----\ncorrupted\n-----END CERTIFICATE REQUEST-----",
        ] {
            assert!(matches!(
                ca.sign_csr(invalid, &request("x")),
                Err(PkiError::InvalidCsr(_))
            ));
        }
    }

    #[test]
    fn ca_can_be_saved_and_loaded() {
        let ca1 = LocalCa::generate("Persistent CA").unwrap();
        let ca2 = LocalCa::from_pem(&ca1.ca_cert_pem(), ca1.ca_key_pem()).unwrap();

        let req = request("erin");
        let csr = CertRequest::new(&req).unwrap();
        let cert = ca2.sign_csr(csr.csr_pem(), &req).unwrap();
        assert!(verify_signed_by(&cert, &ca1.ca_cert_pem()).unwrap());
    }

    #[test]
    fn corrupted_ca_material_is_detected() {
        let good = LocalCa::generate("Good CA").unwrap();
        assert!(LocalCa::from_pem(&good.ca_cert_pem(), "invalid key pem").is_err());
        assert!(LocalCa::from_pem("invalid cert pem", good.ca_key_pem()).is_err());
    }

    #[test]
    fn common_name_requires_a_certificate_block() {
        let req = CertRequest::new(&request("frank")).unwrap();
        let err = certificate_common_name(req.private_key_pem()).unwrap_err();
        assert!(err.to_string().contains("expected CERTIFICATE"));
    }

    #[test]
    fn debug_output_redacts_private_key() {
        let issued = IssuedCertificate {
            cert_pem: "cert".to_string(),
            key_pem: "super-secret".to_string(),
        };
        let debug = format!("{:?}", issued);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("redacted"));
    }
}
