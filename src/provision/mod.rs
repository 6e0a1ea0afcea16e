//! Provisioning run
//!
//! Ties the registry, the issuance adapter and the bundle store together:
//! every identity is issued first, in registry order, and bundles are only
//! written once the whole set exists. Any identity, token or issuance error
//! stops the run before a single bundle is written.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::bundle::{select_endpoint, BundleStore, BundleSynthesizer, PersistOutcome};
use crate::config::{CaConfig, Config};
use crate::fsutil::AccountResolver;
use crate::identity::{Identity, IdentityRegistry};
use crate::issuance::{CertificateMaterial, IssuanceAdapter};
use crate::pki::{self, CertificateIssuer, IssueRequest, IssuedCertificate, LocalCa, RemoteCa};
use crate::token::BootstrapToken;
use crate::Result;

/// The CA collaborator selected by configuration
pub enum ConfiguredIssuer {
    /// In-process signer
    Local(LocalCa),
    /// Remote signing endpoint
    Remote(RemoteCa),
}

impl ConfiguredIssuer {
    /// Build the issuer described by `ca`
    ///
    /// The remote signer authenticates with the bootstrap token, which must
    /// already have been written to `token_file`.
    pub fn from_config(ca: &CaConfig, token_file: &Path) -> Result<Self> {
        match ca {
            CaConfig::Local {
                cert_file,
                key_file,
                validity_days,
            } => Ok(Self::Local(
                LocalCa::from_files(cert_file, key_file)?.with_validity_days(*validity_days),
            )),
            CaConfig::Remote { url, cert_file } => {
                let ca_pem = std::fs::read_to_string(cert_file).map_err(pki::PkiError::from)?;
                let token = BootstrapToken::load(token_file)?;
                Ok(Self::Remote(RemoteCa::new(url, ca_pem, token)?))
            }
        }
    }
}

#[async_trait]
impl CertificateIssuer for ConfiguredIssuer {
    async fn issue(&self, request: &IssueRequest) -> pki::Result<IssuedCertificate> {
        match self {
            Self::Local(ca) => ca.issue(request).await,
            Self::Remote(ca) => ca.issue(request).await,
        }
    }

    fn ca_cert_pem(&self) -> String {
        match self {
            Self::Local(ca) => ca.ca_cert_pem(),
            Self::Remote(ca) => ca.ca_cert_pem(),
        }
    }
}

/// Outcome of a provisioning run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    /// Material for every identity, in registry order
    pub materials: Vec<CertificateMaterial>,
    /// Bundles rewritten by this run
    pub bundles_written: Vec<String>,
    /// Bundles already up to date
    pub bundles_unchanged: Vec<String>,
}

/// Issues material and writes bundles for a registry
pub struct Provisioner<I: CertificateIssuer> {
    registry: IdentityRegistry,
    adapter: IssuanceAdapter<I>,
    synthesizer: BundleSynthesizer,
    bundles: BundleStore,
}

impl<I: CertificateIssuer> Provisioner<I> {
    /// Assemble a provisioner from parts
    pub fn new(
        registry: IdentityRegistry,
        adapter: IssuanceAdapter<I>,
        synthesizer: BundleSynthesizer,
        bundles: BundleStore,
    ) -> Self {
        Self {
            registry,
            adapter,
            synthesizer,
            bundles,
        }
    }

    /// Wire a provisioner from configuration
    pub fn from_config(
        config: &Config,
        issuer: Arc<I>,
        accounts: Arc<dyn AccountResolver>,
    ) -> Result<Self> {
        let registry = config.registry()?;
        let endpoint = select_endpoint(&config.addresses, config.api_port)?;
        let synthesizer = BundleSynthesizer::new(&config.cluster_name, endpoint, issuer.ca_cert_pem());
        let adapter = IssuanceAdapter::new(issuer, accounts.clone(), config.paths.cert_layout())
            .with_serving_sans(&config.serving_identity, config.addresses.clone());
        let bundles = BundleStore::new(&config.paths.bundle_dir, &config.default_admin, accounts);
        Ok(Self::new(registry, adapter, synthesizer, bundles))
    }

    /// The identities this provisioner works on
    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    /// The bundle store
    pub fn bundles(&self) -> &BundleStore {
        &self.bundles
    }

    /// Issue one identity by name
    pub async fn issue_one(&self, name: &str) -> Result<CertificateMaterial> {
        let identity = self.registry.require(name)?;
        Ok(self.adapter.issue(identity).await?)
    }

    /// Issue every identity, stopping at the first failure
    pub async fn issue_all(&self, cancel: &CancellationToken) -> Result<Vec<CertificateMaterial>> {
        Ok(self
            .adapter
            .issue_all(self.registry.list_identities(), cancel)
            .await?)
    }

    /// Synthesize and persist a bundle for each identity
    pub fn write_bundles(&self, report: &mut ProvisionReport) -> Result<()> {
        for identity in self.registry.list_identities() {
            match self.write_bundle(identity)? {
                PersistOutcome::Written => report.bundles_written.push(identity.name.clone()),
                PersistOutcome::Unchanged => report.bundles_unchanged.push(identity.name.clone()),
            }
        }
        Ok(())
    }

    fn write_bundle(&self, identity: &Identity) -> Result<PersistOutcome> {
        let material = self.adapter.layout().material(identity);
        let bundle = self.synthesizer.synthesize_from(&material)?;
        Ok(self.bundles.persist(&bundle)?)
    }

    /// Full run: all certificates, then all bundles
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ProvisionReport> {
        info!(
            identities = self.registry.len(),
            endpoint = %self.synthesizer.endpoint(),
            "Provisioning started"
        );

        let mut report = ProvisionReport {
            materials: self.issue_all(cancel).await?,
            ..Default::default()
        };
        self.write_bundles(&mut report)?;

        info!(
            identities = report.materials.len(),
            bundles_written = report.bundles_written.len(),
            bundles_unchanged = report.bundles_unchanged.len(),
            "Provisioning complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::{Owner, OwnerError};
    use crate::identity::builtin_identities;
    use crate::issuance::CertLayout;
    use crate::pki::{MockCertificateIssuer, PkiError};
    use crate::Error;
    use tempfile::TempDir;

    struct CurrentUser;

    impl AccountResolver for CurrentUser {
        fn resolve(&self, _account: &str) -> std::result::Result<Owner, OwnerError> {
            Owner::current()
        }
    }

    fn provisioner<I: CertificateIssuer>(issuer: I, dir: &TempDir) -> Provisioner<I> {
        let issuer = Arc::new(issuer);
        let accounts: Arc<dyn AccountResolver> = Arc::new(CurrentUser);
        let registry =
            IdentityRegistry::new(&["alice".to_string()], builtin_identities(&Default::default()))
                .unwrap();
        let endpoint = select_endpoint(&["x.example".to_string()], 6443).unwrap();
        Provisioner::new(
            registry,
            IssuanceAdapter::new(issuer.clone(), accounts.clone(), CertLayout::new(dir.path().join("certs"))),
            BundleSynthesizer::new("test", endpoint, issuer.ca_cert_pem()),
            BundleStore::new(dir.path().join("bundles"), "cluster-admin", accounts),
        )
    }

    #[tokio::test]
    async fn run_issues_everything_then_writes_bundles() {
        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(LocalCa::generate("run CA").unwrap(), &dir);

        let report = provisioner.run(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.materials.len(), 7);
        assert_eq!(report.bundles_written.len(), 7);
        assert!(provisioner.bundles().path_for("alice").exists());
    }

    #[tokio::test]
    async fn second_run_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(LocalCa::generate("run CA").unwrap(), &dir);

        provisioner.run(&CancellationToken::new()).await.unwrap();
        let report = provisioner.run(&CancellationToken::new()).await.unwrap();

        assert!(report.bundles_written.is_empty());
        assert_eq!(report.bundles_unchanged.len(), 7);
    }

    /// Story: a CA failure halfway through stops the run before any bundle
    /// is written
    #[tokio::test]
    async fn issuance_failure_writes_no_bundles() {
        let dir = TempDir::new().unwrap();
        let mut mock = MockCertificateIssuer::new();
        mock.expect_ca_cert_pem().returning(String::new);
        mock.expect_issue()
            .returning(|_| Err(PkiError::Rejected("403 Forbidden".to_string())));
        let provisioner = provisioner(mock, &dir);

        let err = provisioner.run(&CancellationToken::new()).await.unwrap_err();

        assert!(matches!(err, Error::Issuance(_)));
        assert!(!dir.path().join("bundles").exists());
    }

    #[tokio::test]
    async fn issuing_unknown_identity_is_an_identity_error() {
        let dir = TempDir::new().unwrap();
        let provisioner = provisioner(LocalCa::generate("run CA").unwrap(), &dir);
        assert!(matches!(
            provisioner.issue_one("nobody").await,
            Err(Error::Identity(_))
        ));
    }
}
