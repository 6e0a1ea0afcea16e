//! HTTP client for a remote CSR-signing endpoint
//!
//! Used when the cluster CA lives on another host. Trust is bootstrapped with
//! the derived bootstrap token sent as a bearer credential; the key pair is
//! generated here and only the CSR is submitted.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    parse_pem, verify_signed_by, CertRequest, CertificateIssuer, IssueRequest, IssuedCertificate,
    PkiError, Result,
};
use crate::token::BootstrapToken;

/// Timeout for a single signing request
const SIGN_TIMEOUT: Duration = Duration::from_secs(30);

/// Signing request body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignRequest {
    /// CSR in PEM format
    pub csr_pem: String,
    /// Requested subject CN
    pub common_name: String,
    /// Requested subject attributes
    pub organization_fields: BTreeMap<String, String>,
    /// Requested SANs (serving certificates only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subject_alt_names: Vec<String>,
}

/// Signing response body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignResponse {
    /// Signed certificate in PEM format
    pub certificate_pem: String,
    /// CA certificate in PEM format; must be the pinned CA
    pub ca_certificate_pem: String,
}

/// Remote certificate authority reached over HTTP(S)
pub struct RemoteCa {
    http: reqwest::Client,
    sign_url: String,
    token: BootstrapToken,
    ca_cert_pem: String,
}

impl RemoteCa {
    /// Create a client for `base_url`
    ///
    /// `ca_cert_pem` is the CA that signs client certificates; it is also
    /// pinned as the only trust root for HTTPS endpoints.
    pub fn new(base_url: &str, ca_cert_pem: String, token: BootstrapToken) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(SIGN_TIMEOUT);
        if base_url.starts_with("https://") {
            let root = reqwest::Certificate::from_pem(ca_cert_pem.as_bytes())
                .map_err(|e| PkiError::ParseError(format!("invalid CA certificate: {}", e)))?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(root);
        }
        let http = builder
            .build()
            .map_err(|e| PkiError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            sign_url: format!("{}/api/v1/sign", base_url.trim_end_matches('/')),
            token,
            ca_cert_pem,
        })
    }
}

impl RemoteCa {
    /// Refuse certificates that do not chain to the pinned CA
    fn check_signer(&self, signed: &SignResponse) -> Result<()> {
        let pinned = parse_pem(&self.ca_cert_pem)?;
        let advertised = parse_pem(&signed.ca_certificate_pem)?;
        if advertised != pinned {
            return Err(PkiError::Rejected(
                "signer answered with a CA certificate other than the pinned one".to_string(),
            ));
        }
        if !verify_signed_by(&signed.certificate_pem, &self.ca_cert_pem)? {
            return Err(PkiError::Rejected(
                "signed certificate does not verify against the pinned CA".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for RemoteCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCa")
            .field("sign_url", &self.sign_url)
            .field("token", &self.token)
            .finish()
    }
}

#[async_trait]
impl CertificateIssuer for RemoteCa {
    async fn issue(&self, request: &IssueRequest) -> Result<IssuedCertificate> {
        let cert_request = CertRequest::new(request)?;

        let body = SignRequest {
            csr_pem: cert_request.csr_pem().to_string(),
            common_name: request.common_name.clone(),
            organization_fields: request.organization_fields.clone(),
            subject_alt_names: request.subject_alt_names.clone(),
        };

        debug!(url = %self.sign_url, common_name = %request.common_name, "Submitting CSR");
        let response = self
            .http
            .post(&self.sign_url)
            .bearer_auth(self.token.as_str())
            .json(&body)
            .send()
            .await
            .map_err(|e| PkiError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PkiError::Rejected(format!("{} - {}", status, body)));
        }

        let signed: SignResponse = response
            .json()
            .await
            .map_err(|e| PkiError::ParseError(format!("invalid signing response: {}", e)))?;

        self.check_signer(&signed)?;
        info!(common_name = %request.common_name, "Certificate received from CA");

        Ok(IssuedCertificate {
            cert_pem: signed.certificate_pem,
            key_pem: cert_request.into_private_key_pem(),
        })
    }

    fn ca_cert_pem(&self) -> String {
        self.ca_cert_pem.clone()
    }
}
