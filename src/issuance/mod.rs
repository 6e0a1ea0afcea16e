//! Certificate issuance adapter
//!
//! Turns an [`Identity`] into [`CertificateMaterial`] on disk. The
//! cryptographic work belongs to the CA collaborator; this module builds the
//! request, decides where the files live and makes issuance idempotent:
//! material that already exists, passes the structural checks, verifies
//! against the current CA and carries the currently requested SANs is
//! reused and the CA is not contacted again.
//!
//! # Write ordering
//!
//! When (re)issuing, any stale certificate is removed first, then the key is
//! written, then the certificate. An interrupted run therefore always leaves
//! the pair without a certificate, which the next run detects and re-issues.

mod material;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fsutil::{write_atomic, AccountResolver, OwnerError, PUBLIC_MODE, SECRET_MODE};
use crate::identity::Identity;
use crate::pki::{CertificateIssuer, IssueRequest, PkiError};

pub use material::{CertLayout, CertificateMaterial, MaterialDefect};

/// Issuance errors; any of them is fatal to a provisioning run
#[derive(Debug, Error)]
pub enum IssuanceError {
    /// The CA was unreachable or rejected the request
    #[error("issuing {identity}: {source}")]
    Ca {
        /// Identity being issued
        identity: String,
        /// CA failure
        source: PkiError,
    },

    /// The key owner account does not resolve
    #[error("issuing {identity}: {source}")]
    Owner {
        /// Identity being issued
        identity: String,
        /// Resolution failure
        source: OwnerError,
    },

    /// Writing material failed
    #[error("issuing {identity}: writing {path}: {source}")]
    Io {
        /// Identity being issued
        identity: String,
        /// File being written
        path: std::path::PathBuf,
        /// IO failure
        source: std::io::Error,
    },

    /// The run was cancelled while the request was in flight
    #[error("issuing {identity}: cancelled")]
    Cancelled {
        /// Identity being issued
        identity: String,
    },
}

impl IssuanceError {
    /// Identity the failure is attributed to
    pub fn identity(&self) -> &str {
        match self {
            Self::Ca { identity, .. }
            | Self::Owner { identity, .. }
            | Self::Io { identity, .. }
            | Self::Cancelled { identity } => identity,
        }
    }
}

/// Issues certificate material through a [`CertificateIssuer`]
pub struct IssuanceAdapter<I: CertificateIssuer> {
    issuer: Arc<I>,
    accounts: Arc<dyn AccountResolver>,
    layout: CertLayout,
    serving_sans: BTreeMap<String, Vec<String>>,
}

impl<I: CertificateIssuer> IssuanceAdapter<I> {
    /// Create an adapter writing under `layout`
    pub fn new(issuer: Arc<I>, accounts: Arc<dyn AccountResolver>, layout: CertLayout) -> Self {
        Self {
            issuer,
            accounts,
            layout,
            serving_sans: BTreeMap::new(),
        }
    }

    /// Request serving SANs for one identity (the API server's certificate)
    pub fn with_serving_sans(mut self, identity: &str, sans: Vec<String>) -> Self {
        self.serving_sans.insert(identity.to_string(), sans);
        self
    }

    /// File layout used by this adapter
    pub fn layout(&self) -> &CertLayout {
        &self.layout
    }

    /// The CA collaborator
    pub fn issuer(&self) -> &I {
        &self.issuer
    }

    /// Build the CA request for an identity
    pub fn request_for(&self, identity: &Identity) -> IssueRequest {
        IssueRequest {
            common_name: identity.common_name.clone(),
            organization_fields: identity.organization_fields.clone(),
            private_key_owner: identity.private_key_owner.clone(),
            subject_alt_names: self
                .serving_sans
                .get(&identity.name)
                .cloned()
                .unwrap_or_default(),
        }
    }

    /// Ensure material exists for `identity`, issuing only when needed
    pub async fn issue(&self, identity: &Identity) -> Result<CertificateMaterial, IssuanceError> {
        let owner = self
            .accounts
            .resolve(&identity.private_key_owner)
            .map_err(|source| IssuanceError::Owner {
                identity: identity.name.clone(),
                source,
            })?;

        let material = self.layout.material(identity);
        let request = self.request_for(identity);
        let usable = material.inspect(&owner).and_then(|()| {
            material.check_issuance(&self.issuer.ca_cert_pem(), &request.subject_alt_names)
        });
        match usable {
            Ok(()) => {
                debug!(identity = %identity.name, "Reusing existing certificate material");
                return Ok(material);
            }
            Err(defect) if defect.is_missing() => {}
            Err(defect) => {
                warn!(identity = %identity.name, defect = %defect, "Existing material unusable, re-issuing");
            }
        }

        let issued = self
            .issuer
            .issue(&request)
            .await
            .map_err(|source| IssuanceError::Ca {
                identity: identity.name.clone(),
                source,
            })?;

        let io_err = |path: &std::path::Path| {
            let identity = identity.name.clone();
            let path = path.to_path_buf();
            move |source| IssuanceError::Io {
                identity,
                path,
                source,
            }
        };

        match std::fs::remove_file(&material.cert_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&material.cert_path)(e)),
        }
        write_atomic(
            &material.key_path,
            issued.key_pem.as_bytes(),
            SECRET_MODE,
            &owner,
        )
        .map_err(io_err(&material.key_path))?;
        write_atomic(
            &material.cert_path,
            issued.cert_pem.as_bytes(),
            PUBLIC_MODE,
            &owner,
        )
        .map_err(io_err(&material.cert_path))?;

        info!(
            identity = %identity.name,
            common_name = %identity.common_name,
            owner = %identity.private_key_owner,
            "Certificate issued"
        );
        Ok(material)
    }

    /// Issue every identity in order, stopping at the first failure
    ///
    /// Cancellation abandons the in-flight request; material already written
    /// stays on disk so a restarted run resumes from it.
    pub async fn issue_all(
        &self,
        identities: &[Identity],
        cancel: &CancellationToken,
    ) -> Result<Vec<CertificateMaterial>, IssuanceError> {
        let mut materials = Vec::with_capacity(identities.len());
        for identity in identities {
            let material = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(identity = %identity.name, "Issuance cancelled");
                    return Err(IssuanceError::Cancelled { identity: identity.name.clone() });
                }
                result = self.issue(identity) => result?,
            };
            materials.push(material);
        }
        Ok(materials)
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use crate::fsutil::{file_facts, Owner};
    use crate::identity::Identity;
    use crate::pki::{IssuedCertificate, LocalCa, MockCertificateIssuer};
    use tempfile::TempDir;

    struct CurrentUser;

    impl AccountResolver for CurrentUser {
        fn resolve(&self, _account: &str) -> Result<Owner, OwnerError> {
            Owner::current()
        }
    }

    struct NoAccounts;

    impl AccountResolver for NoAccounts {
        fn resolve(&self, account: &str) -> Result<Owner, OwnerError> {
            Err(OwnerError::UnknownAccount(account.to_string()))
        }
    }

    /// Material issued by a throwaway CA, plus that CA's certificate
    async fn issued_for(cn: &str) -> (IssuedCertificate, String) {
        let ca = LocalCa::generate("issuance test CA").unwrap();
        let request = IssueRequest {
            common_name: cn.to_string(),
            organization_fields: BTreeMap::new(),
            private_key_owner: cn.to_string(),
            subject_alt_names: vec![],
        };
        (ca.issue(&request).await.unwrap(), ca.ca_cert_pem())
    }

    fn adapter(mock: MockCertificateIssuer, dir: &TempDir) -> IssuanceAdapter<MockCertificateIssuer> {
        IssuanceAdapter::new(
            Arc::new(mock),
            Arc::new(CurrentUser),
            CertLayout::new(dir.path().join("certs")),
        )
    }

    fn local_adapter(ca: Arc<LocalCa>, dir: &TempDir) -> IssuanceAdapter<LocalCa> {
        IssuanceAdapter::new(ca, Arc::new(CurrentUser), CertLayout::new(dir.path().join("certs")))
    }

    #[tokio::test]
    async fn issue_writes_owner_only_key_and_certificate() {
        let dir = TempDir::new().unwrap();
        let (issued, _) = issued_for("alice").await;
        let mut mock = MockCertificateIssuer::new();
        mock.expect_issue()
            .times(1)
            .returning(move |_| Ok(issued.clone()));

        let adapter = adapter(mock, &dir);
        let material = adapter.issue(&Identity::admin("alice")).await.unwrap();

        let key = file_facts(&material.key_path).unwrap().unwrap();
        assert_eq!(key.mode, SECRET_MODE);
        assert_eq!(key.uid, Owner::current().unwrap().uid);
        let cert = file_facts(&material.cert_path).unwrap().unwrap();
        assert_eq!(cert.mode, PUBLIC_MODE);
    }

    #[tokio::test]
    async fn second_issue_reuses_material_without_contacting_ca() {
        let dir = TempDir::new().unwrap();
        let (issued, ca_pem) = issued_for("alice").await;
        let mut mock = MockCertificateIssuer::new();
        mock.expect_issue()
            .times(1)
            .returning(move |_| Ok(issued.clone()));
        mock.expect_ca_cert_pem().return_const(ca_pem);

        let adapter = adapter(mock, &dir);
        let alice = Identity::admin("alice");
        let first = adapter.issue(&alice).await.unwrap();
        let cert_before = std::fs::read(&first.cert_path).unwrap();
        let key_before = std::fs::read(&first.key_path).unwrap();

        let second = adapter.issue(&alice).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(std::fs::read(&second.cert_path).unwrap(), cert_before);
        assert_eq!(std::fs::read(&second.key_path).unwrap(), key_before);
    }

    #[tokio::test]
    async fn partial_material_is_reissued() {
        let dir = TempDir::new().unwrap();
        let (issued, _) = issued_for("alice").await;
        let mut mock = MockCertificateIssuer::new();
        mock.expect_issue()
            .times(2)
            .returning(move |_| Ok(issued.clone()));

        let adapter = adapter(mock, &dir);
        let alice = Identity::admin("alice");
        let material = adapter.issue(&alice).await.unwrap();
        std::fs::remove_file(&material.cert_path).unwrap();

        adapter.issue(&alice).await.unwrap();
        assert!(material.cert_path.exists());
    }

    #[tokio::test]
    async fn world_readable_key_is_reissued() {
        let dir = TempDir::new().unwrap();
        let (issued, _) = issued_for("alice").await;
        let mut mock = MockCertificateIssuer::new();
        mock.expect_issue()
            .times(2)
            .returning(move |_| Ok(issued.clone()));

        let adapter = adapter(mock, &dir);
        let alice = Identity::admin("alice");
        let material = adapter.issue(&alice).await.unwrap();
        std::fs::set_permissions(&material.key_path, std::fs::Permissions::from_mode(0o644))
            .unwrap();

        adapter.issue(&alice).await.unwrap();
        let key = file_facts(&material.key_path).unwrap().unwrap();
        assert_eq!(key.mode, SECRET_MODE);
    }

    #[tokio::test]
    async fn ca_rejection_is_attributed_and_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockCertificateIssuer::new();
        mock.expect_issue()
            .returning(|_| Err(PkiError::Rejected("403 Forbidden".to_string())));

        let adapter = adapter(mock, &dir);
        let err = adapter.issue(&Identity::admin("alice")).await.unwrap_err();

        assert_eq!(err.identity(), "alice");
        assert!(matches!(err, IssuanceError::Ca { .. }));
        assert!(!adapter.layout().key_path("alice").exists());
    }

    #[tokio::test]
    async fn unknown_owner_fails_before_contacting_ca() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockCertificateIssuer::new();
        mock.expect_issue().times(0);

        let adapter = IssuanceAdapter::new(
            Arc::new(mock),
            Arc::new(NoAccounts),
            CertLayout::new(dir.path()),
        );
        let err = adapter.issue(&Identity::admin("ghost")).await.unwrap_err();
        assert!(matches!(err, IssuanceError::Owner { .. }));
    }

    #[tokio::test]
    async fn issue_all_stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        let (issued, _) = issued_for("a").await;
        let mut mock = MockCertificateIssuer::new();
        mock.expect_issue()
            .withf(|req| req.common_name == "a")
            .times(1)
            .returning(move |_| Ok(issued.clone()));
        mock.expect_issue()
            .withf(|req| req.common_name == "b")
            .times(1)
            .returning(|_| Err(PkiError::Unreachable("connection refused".to_string())));
        mock.expect_issue()
            .withf(|req| req.common_name == "c")
            .times(0);

        let adapter = adapter(mock, &dir);
        let identities: Vec<_> = ["a", "b", "c"].iter().map(|n| Identity::admin(n)).collect();
        let err = adapter
            .issue_all(&identities, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.identity(), "b");
        assert!(adapter.layout().key_path("a").exists(), "earlier material is kept");
    }

    #[tokio::test]
    async fn cancelled_run_keeps_written_material() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let (issued, _) = issued_for("a").await;
        let trigger = cancel.clone();
        let mut mock = MockCertificateIssuer::new();
        mock.expect_issue()
            .withf(|req| req.common_name == "a")
            .returning(move |_| {
                // operator aborts right after the first identity completes
                trigger.cancel();
                Ok(issued.clone())
            });

        let adapter = adapter(mock, &dir);
        let identities: Vec<_> = ["a", "b"].iter().map(|n| Identity::admin(n)).collect();
        let err = adapter.issue_all(&identities, &cancel).await.unwrap_err();

        assert!(matches!(err, IssuanceError::Cancelled { identity } if identity == "b"));
        assert!(adapter.layout().cert_path("a").exists());
    }

    /// Story: the operator adds an address to the cluster and the API
    /// server's certificate is re-issued to cover it
    #[tokio::test]
    async fn changed_serving_addresses_trigger_reissue() {
        let dir = TempDir::new().unwrap();
        let ca = Arc::new(LocalCa::generate("issuance test CA").unwrap());
        let apiserver = Identity::admin("kube-apiserver");

        let before = local_adapter(ca.clone(), &dir)
            .with_serving_sans("kube-apiserver", vec!["10.0.0.1".to_string()]);
        let material = before.issue(&apiserver).await.unwrap();
        let first = std::fs::read_to_string(&material.cert_path).unwrap();

        let after = local_adapter(ca.clone(), &dir).with_serving_sans(
            "kube-apiserver",
            vec!["10.0.0.1".to_string(), "api.example.com".to_string()],
        );
        let material = after.issue(&apiserver).await.unwrap();
        let second = std::fs::read_to_string(&material.cert_path).unwrap();

        assert_ne!(first, second);
        let names = crate::pki::certificate_subject_alt_names(&second).unwrap();
        assert!(names.contains("api.example.com"));
        assert!(names.contains("10.0.0.1"));

        // same addresses in a different order and case are not a change
        let reordered = local_adapter(ca, &dir).with_serving_sans(
            "kube-apiserver",
            vec!["API.example.com".to_string(), "10.0.0.1".to_string()],
        );
        reordered.issue(&apiserver).await.unwrap();
        assert_eq!(std::fs::read_to_string(&material.cert_path).unwrap(), second);
    }

    /// Story: the cluster CA was replaced; material signed by the old CA is
    /// re-issued instead of being handed to services that no longer trust it
    #[tokio::test]
    async fn material_from_a_replaced_ca_is_reissued() {
        let dir = TempDir::new().unwrap();
        let alice = Identity::admin("alice");
        let old_ca = Arc::new(LocalCa::generate("old CA").unwrap());
        local_adapter(old_ca.clone(), &dir).issue(&alice).await.unwrap();

        let new_ca = Arc::new(LocalCa::generate("new CA").unwrap());
        let material = local_adapter(new_ca.clone(), &dir).issue(&alice).await.unwrap();

        let cert = std::fs::read_to_string(&material.cert_path).unwrap();
        assert!(crate::pki::verify_signed_by(&cert, &new_ca.ca_cert_pem()).unwrap());
        assert!(!crate::pki::verify_signed_by(&cert, &old_ca.ca_cert_pem()).unwrap());
    }

    /// Story: an admin named `alice-key` sits next to `alice`; issuing one
    /// never clobbers the other's files
    #[tokio::test]
    async fn similarly_named_identities_keep_separate_material() {
        let dir = TempDir::new().unwrap();
        let ca = Arc::new(LocalCa::generate("issuance test CA").unwrap());
        let adapter = local_adapter(ca, &dir);
        let owner = Owner::current().unwrap();

        let alice = adapter.issue(&Identity::admin("alice")).await.unwrap();
        let alice_key = adapter.issue(&Identity::admin("alice-key")).await.unwrap();

        assert_ne!(alice.key_path, alice_key.cert_path);
        assert_ne!(alice.cert_path, alice_key.key_path);
        alice.inspect(&owner).unwrap();
        alice_key.inspect(&owner).unwrap();
        assert_eq!(
            crate::pki::certificate_common_name(&std::fs::read_to_string(&alice.cert_path).unwrap())
                .unwrap(),
            "alice"
        );
    }

    #[test]
    fn serving_sans_are_requested_only_for_their_identity() {
        let dir = TempDir::new().unwrap();
        let adapter = adapter(MockCertificateIssuer::new(), &dir)
            .with_serving_sans("kube-apiserver", vec!["api.example.com".to_string()]);

        let apiserver = Identity::admin("kube-apiserver");
        assert_eq!(
            adapter.request_for(&apiserver).subject_alt_names,
            vec!["api.example.com".to_string()]
        );
        assert!(adapter
            .request_for(&Identity::admin("alice"))
            .subject_alt_names
            .is_empty());
    }
}
