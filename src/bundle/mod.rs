//! Connection bundle synthesis
//!
//! A connection bundle is a self-contained kubeconfig: the identity's client
//! certificate and key, the CA and the chosen API endpoint are all embedded,
//! so the file keeps working no matter what happens to the address list later.
//!
//! The endpoint is picked once per run with a static rule: the first address
//! in the configured list wins. Operators who want a different address
//! reorder the list.

use std::net::Ipv6Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::fsutil::{file_facts, write_atomic, AccountResolver, Owner, OwnerError, SECRET_MODE};
use crate::identity::Identity;
use crate::issuance::CertificateMaterial;

/// Bundle errors
#[derive(Debug, Error)]
pub enum BundleError {
    /// The address list is empty
    #[error("no API addresses configured")]
    NoAddresses,

    /// An address cannot be used in a URL
    #[error("invalid API address '{0}'")]
    InvalidAddress(String),

    /// No bundle exists for the acting account
    #[error("no connection bundle for principal {principal}")]
    NoBundleForPrincipal {
        /// Account name of the caller
        principal: String,
    },

    /// Certificate material could not be read for synthesis
    #[error("reading material for {identity}: {path}: {source}")]
    Material {
        /// Identity whose material was read
        identity: String,
        /// Offending file
        path: PathBuf,
        /// IO failure
        source: std::io::Error,
    },

    /// The bundle owner could not be resolved
    #[error("bundle owner for {identity}: {source}")]
    Owner {
        /// Identity the bundle belongs to
        identity: String,
        /// Resolution failure
        source: OwnerError,
    },

    /// Writing the bundle failed
    #[error("writing bundle {path}: {source}")]
    Io {
        /// Bundle path
        path: PathBuf,
        /// IO failure
        source: std::io::Error,
    },

    /// Rendering or parsing the kubeconfig failed
    #[error("kubeconfig serialization: {0}")]
    Serialization(String),
}

/// The API server URL embedded in bundles
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    /// The URL as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Pick the endpoint for this run: first address wins
pub fn select_endpoint(addresses: &[String], port: u16) -> Result<Endpoint, BundleError> {
    let first = addresses.first().ok_or(BundleError::NoAddresses)?;
    let host = first.trim();
    if host.is_empty() || host.contains(['/', ' ', '@', '?', '#']) {
        return Err(BundleError::InvalidAddress(first.clone()));
    }

    let host = match host.parse::<Ipv6Addr>() {
        Ok(v6) => format!("[{}]", v6),
        Err(_) => host.to_string(),
    };
    Ok(Endpoint(format!("https://{}:{}", host, port)))
}

/// Kubeconfig document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<KubeconfigCluster>,
    /// Users
    pub users: Vec<KubeconfigUser>,
    /// Contexts
    pub contexts: Vec<KubeconfigContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry in kubeconfig
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeconfigCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    pub certificate_authority_data: String,
}

/// User entry in kubeconfig
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeconfigUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// User configuration (client certificate authentication)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate (base64 encoded PEM)
    pub client_certificate_data: String,
    /// Client key (base64 encoded PEM)
    pub client_key_data: String,
}

impl std::fmt::Debug for UserConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfig")
            .field("client_certificate_data", &self.client_certificate_data)
            .field("client_key_data", &"<redacted>")
            .finish()
    }
}

/// Context entry in kubeconfig
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KubeconfigContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

/// Credentials and endpoint for one principal
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionBundle {
    /// Identity name the bundle is keyed by
    pub principal: String,
    /// Certificate subject (kubeconfig user name)
    pub common_name: String,
    /// Account that owns the bundle file
    pub owner: String,
    /// Cluster name used for the kubeconfig entries
    pub cluster_name: String,
    /// API endpoint
    pub endpoint: Endpoint,
    /// Client certificate PEM
    pub cert_pem: String,
    /// Client key PEM
    pub key_pem: String,
    /// CA certificate PEM
    pub ca_pem: String,
}

impl std::fmt::Debug for ConnectionBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionBundle")
            .field("principal", &self.principal)
            .field("endpoint", &self.endpoint)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

impl ConnectionBundle {
    /// The bundle as a kubeconfig document
    pub fn to_kubeconfig(&self) -> Kubeconfig {
        let context = format!("{}@{}", self.common_name, self.cluster_name);
        Kubeconfig {
            api_version: "v1".to_string(),
            kind: "Config".to_string(),
            clusters: vec![KubeconfigCluster {
                name: self.cluster_name.clone(),
                cluster: ClusterConfig {
                    server: self.endpoint.to_string(),
                    certificate_authority_data: STANDARD.encode(&self.ca_pem),
                },
            }],
            users: vec![KubeconfigUser {
                name: self.common_name.clone(),
                user: UserConfig {
                    client_certificate_data: STANDARD.encode(&self.cert_pem),
                    client_key_data: STANDARD.encode(&self.key_pem),
                },
            }],
            contexts: vec![KubeconfigContext {
                name: context.clone(),
                context: ContextConfig {
                    cluster: self.cluster_name.clone(),
                    user: self.common_name.clone(),
                },
            }],
            current_context: context,
        }
    }

    /// Render the kubeconfig as YAML
    pub fn render(&self) -> Result<String, BundleError> {
        serde_yaml::to_string(&self.to_kubeconfig())
            .map_err(|e| BundleError::Serialization(e.to_string()))
    }
}

/// Combines certificate material with the run's endpoint
#[derive(Clone, Debug)]
pub struct BundleSynthesizer {
    cluster_name: String,
    endpoint: Endpoint,
    ca_pem: String,
}

impl BundleSynthesizer {
    /// Create a synthesizer for one run
    pub fn new(cluster_name: impl Into<String>, endpoint: Endpoint, ca_pem: String) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            endpoint,
            ca_pem,
        }
    }

    /// Endpoint embedded in every bundle of this run
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Build a bundle from PEM material; no IO
    pub fn synthesize(&self, identity: &Identity, cert_pem: &str, key_pem: &str) -> ConnectionBundle {
        ConnectionBundle {
            principal: identity.name.clone(),
            common_name: identity.common_name.clone(),
            owner: identity.private_key_owner.clone(),
            cluster_name: self.cluster_name.clone(),
            endpoint: self.endpoint.clone(),
            cert_pem: cert_pem.to_string(),
            key_pem: key_pem.to_string(),
            ca_pem: self.ca_pem.clone(),
        }
    }

    /// Read issued material from disk and synthesize its bundle
    pub fn synthesize_from(
        &self,
        material: &CertificateMaterial,
    ) -> Result<ConnectionBundle, BundleError> {
        let read = |path: &Path| {
            std::fs::read_to_string(path).map_err(|source| BundleError::Material {
                identity: material.identity.name.clone(),
                path: path.to_path_buf(),
                source,
            })
        };
        let cert_pem = read(&material.cert_path)?;
        let key_pem = read(&material.key_path)?;
        Ok(self.synthesize(&material.identity, &cert_pem, &key_pem))
    }
}

/// Whether [`BundleStore::persist`] touched the file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistOutcome {
    /// Content or protection changed and the file was rewritten
    Written,
    /// The file already had this exact content and protection
    Unchanged,
}

/// Bundle files on disk, one per identity
pub struct BundleStore {
    bundle_dir: PathBuf,
    default_admin: String,
    accounts: Arc<dyn AccountResolver>,
}

impl BundleStore {
    /// Store rooted at `bundle_dir`; superusers resolve to `default_admin`
    pub fn new(
        bundle_dir: impl Into<PathBuf>,
        default_admin: impl Into<String>,
        accounts: Arc<dyn AccountResolver>,
    ) -> Self {
        Self {
            bundle_dir: bundle_dir.into(),
            default_admin: default_admin.into(),
            accounts,
        }
    }

    /// Bundle path for an identity name
    pub fn path_for(&self, name: &str) -> PathBuf {
        self.bundle_dir.join(format!("{}.kubeconfig", name))
    }

    /// Write the bundle unless the file already matches
    pub fn persist(&self, bundle: &ConnectionBundle) -> Result<PersistOutcome, BundleError> {
        let owner = self
            .accounts
            .resolve(&bundle.owner)
            .map_err(|source| BundleError::Owner {
                identity: bundle.principal.clone(),
                source,
            })?;
        let path = self.path_for(&bundle.principal);
        let rendered = bundle.render()?;

        if Self::is_current(&path, rendered.as_bytes(), &owner) {
            debug!(principal = %bundle.principal, "Bundle unchanged");
            return Ok(PersistOutcome::Unchanged);
        }

        write_atomic(&path, rendered.as_bytes(), SECRET_MODE, &owner).map_err(|source| {
            BundleError::Io {
                path: path.clone(),
                source,
            }
        })?;
        info!(
            principal = %bundle.principal,
            endpoint = %bundle.endpoint,
            path = %path.display(),
            "Connection bundle written"
        );
        Ok(PersistOutcome::Written)
    }

    fn is_current(path: &Path, contents: &[u8], owner: &Owner) -> bool {
        let facts = match file_facts(path) {
            Ok(Some(facts)) => facts,
            _ => return false,
        };
        facts.mode == SECRET_MODE
            && facts.uid == owner.uid
            && std::fs::read(path).is_ok_and(|existing| existing == contents)
    }

    /// Bundle path for the acting account
    ///
    /// The superuser gets the default administrative bundle; everyone else
    /// gets the bundle named after their account.
    pub fn resolve(&self, principal: &Owner) -> Result<PathBuf, BundleError> {
        let name = if principal.is_superuser() {
            self.default_admin.as_str()
        } else {
            principal.name.as_str()
        };
        let path = self.path_for(name);
        if path.is_file() {
            Ok(path)
        } else {
            Err(BundleError::NoBundleForPrincipal {
                principal: principal.name.clone(),
            })
        }
    }

    /// Parse a persisted bundle
    pub fn load(&self, name: &str) -> Result<Kubeconfig, BundleError> {
        let path = self.path_for(name);
        let raw = std::fs::read_to_string(&path).map_err(|source| BundleError::Io {
            path: path.clone(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|e| BundleError::Serialization(e.to_string()))
    }
}
