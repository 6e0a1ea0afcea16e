//! Configuration file
//!
//! A single YAML document (camelCase keys) describes the cluster: addresses,
//! administrators, file locations, the CA, readiness requirements and the
//! authorization objects to reconcile. Every field except `addresses` has a
//! default.
//!
//! ```yaml
//! clusterName: prod
//! addresses: [api.prod.example.com, 10.0.0.10]
//! admins: [alice, bob]
//! ca:
//!   mode: local
//!   certFile: /etc/trellis/ca.pem
//!   keyFile: /etc/trellis/ca-key.pem
//! token:
//!   password:
//!     file: /etc/trellis/directory-password
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{builtin_identities, IdentityError, IdentityRegistry, DEFAULT_ADMIN_IDENTITY};
use crate::issuance::CertLayout;
use crate::pki::DEFAULT_VALIDITY_DAYS;
use crate::rbac::{RoleBinding, ServiceAccountSpec};
use crate::readiness::{GateTiming, ReadinessRequirement};
use crate::retry::RetryConfig;
use crate::token::PasswordSource;

/// Default API server port
pub const DEFAULT_API_PORT: u16 = 6443;

/// Longest readiness deadline accepted (one day)
pub const MAX_GATE_DEADLINE_SECS: u64 = 24 * 60 * 60;

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/trellis/config.yaml";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("reading config {path}: {source}")]
    Read {
        /// Config path
        path: PathBuf,
        /// IO failure
        source: std::io::Error,
    },

    /// The file is not valid YAML for this schema
    #[error("parsing config {path}: {reason}")]
    Parse {
        /// Config path
        path: PathBuf,
        /// Parser message
        reason: String,
    },

    /// Values are inconsistent
    #[error("invalid config: {0}")]
    Invalid(String),

    /// The identity set is invalid
    #[error("invalid config: {0}")]
    Identity(#[from] IdentityError),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Top-level configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Cluster name used in bundles
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    /// API server port
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Externally reachable API addresses; the first one is used in bundles
    pub addresses: Vec<String>,
    /// Members of the administrative group
    #[serde(default)]
    pub admins: Vec<String>,
    /// Owner overrides for built-in identities, by identity name
    #[serde(default)]
    pub builtin_owners: BTreeMap<String, String>,
    /// Identity whose bundle the superuser gets
    #[serde(default = "default_admin")]
    pub default_admin: String,
    /// Filesystem layout
    #[serde(default)]
    pub paths: PathsConfig,
    /// Certificate authority
    #[serde(default)]
    pub ca: CaConfig,
    /// Bootstrap token
    #[serde(default)]
    pub token: TokenConfig,
    /// Readiness gates
    #[serde(default)]
    pub readiness: ReadinessConfig,
    /// Service whose gate precedes the reconciler
    #[serde(default = "default_api_service")]
    pub api_service: String,
    /// Identity whose certificate also serves the API (gets SANs)
    #[serde(default = "default_api_service")]
    pub serving_identity: String,
    /// Cluster role bindings to ensure
    #[serde(default = "default_bindings")]
    pub bindings: Vec<RoleBinding>,
    /// Service accounts to ensure
    #[serde(default)]
    pub service_accounts: Vec<ServiceAccountSpec>,
    /// Reconciler settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

fn default_cluster_name() -> String {
    "kubernetes".to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

fn default_admin() -> String {
    DEFAULT_ADMIN_IDENTITY.to_string()
}

fn default_api_service() -> String {
    "kube-apiserver".to_string()
}

fn default_bindings() -> Vec<RoleBinding> {
    vec![RoleBinding::monitoring_view()]
}

/// Filesystem layout
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PathsConfig {
    /// Certificates and keys
    pub cert_dir: PathBuf,
    /// Connection bundles
    pub bundle_dir: PathBuf,
    /// Reconciler done-marker and other state
    pub state_dir: PathBuf,
    /// Bootstrap token file
    pub token_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            cert_dir: PathBuf::from("/var/lib/trellis/certs"),
            bundle_dir: PathBuf::from("/var/lib/trellis/bundles"),
            state_dir: PathBuf::from("/var/lib/trellis/state"),
            token_file: PathBuf::from("/var/lib/trellis/secrets/apitoken.secret"),
        }
    }
}

impl PathsConfig {
    /// Certificate layout under `cert_dir`
    pub fn cert_layout(&self) -> CertLayout {
        CertLayout::new(&self.cert_dir)
    }

    /// Reconciler done-marker
    pub fn reconcile_marker(&self) -> PathBuf {
        self.state_dir.join("reconcile.done")
    }
}

/// Certificate authority
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum CaConfig {
    /// Sign in-process with a CA loaded from disk
    #[serde(rename_all = "camelCase")]
    Local {
        /// CA certificate PEM
        cert_file: PathBuf,
        /// CA private key PEM
        key_file: PathBuf,
        /// Validity of issued certificates
        #[serde(default = "default_validity_days")]
        validity_days: u32,
    },
    /// Submit CSRs to a signing endpoint
    #[serde(rename_all = "camelCase")]
    Remote {
        /// Signer base URL
        url: String,
        /// CA certificate PEM (pinned for HTTPS, embedded in bundles)
        cert_file: PathBuf,
    },
}

fn default_validity_days() -> u32 {
    DEFAULT_VALIDITY_DAYS
}

impl Default for CaConfig {
    fn default() -> Self {
        Self::Local {
            cert_file: PathBuf::from("/etc/trellis/ca.pem"),
            key_file: PathBuf::from("/etc/trellis/ca-key.pem"),
            validity_days: DEFAULT_VALIDITY_DAYS,
        }
    }
}

impl CaConfig {
    /// CA certificate location
    pub fn cert_file(&self) -> &Path {
        match self {
            Self::Local { cert_file, .. } | Self::Remote { cert_file, .. } => cert_file,
        }
    }
}

/// Bootstrap token settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TokenConfig {
    /// Where the directory password comes from (`file: <path>` or `env: <var>`)
    #[serde(with = "serde_yaml::with::singleton_map")]
    pub password: PasswordSource,
    /// Account owning the token file
    pub owner: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            password: PasswordSource::File(PathBuf::from("/etc/trellis/directory-password")),
            owner: "certmgr".to_string(),
        }
    }
}

/// Readiness gate settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadinessConfig {
    /// First poll interval in milliseconds
    pub initial_delay_ms: u64,
    /// Poll interval cap in milliseconds
    pub max_delay_ms: u64,
    /// Deadline in seconds
    pub deadline_secs: u64,
    /// Per-service requirements
    pub requirements: Vec<ReadinessRequirement>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            deadline_secs: 300,
            requirements: vec![
                ReadinessRequirement::new("kube-apiserver", &["kube-apiserver"]),
                ReadinessRequirement::new("kube-controller-manager", &["kube-controller-manager"]),
                ReadinessRequirement::new("kube-scheduler", &["kube-scheduler"]),
                ReadinessRequirement::new("kube-proxy", &["kube-proxy"]),
                ReadinessRequirement::new("sensu-client", &["sensu"]),
            ],
        }
    }
}

impl ReadinessConfig {
    /// Gate timing
    pub fn timing(&self) -> GateTiming {
        GateTiming {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            deadline: Duration::from_secs(self.deadline_secs),
        }
    }

    /// Requirement for a service
    pub fn requirement(&self, service: &str) -> Option<&ReadinessRequirement> {
        self.requirements.iter().find(|r| r.service == service)
    }
}

/// Reconciler settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcileConfig {
    /// API reachability attempts before giving up
    pub reachability_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            reachability_attempts: 30,
        }
    }
}

impl ReconcileConfig {
    /// Retry schedule for the reachability check
    pub fn reachability(&self) -> RetryConfig {
        RetryConfig::with_max_attempts(self.reachability_attempts.max(1))
    }
}

impl Config {
    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&raw).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;
        Ok(config)
    }

    /// Parse and validate YAML
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Build the identity registry for this run
    pub fn registry(&self) -> Result<IdentityRegistry, IdentityError> {
        IdentityRegistry::new(&self.admins, builtin_identities(&self.builtin_owners))
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.addresses.is_empty() {
            return Err(invalid("addresses must list at least one API address"));
        }
        if self.api_port == 0 {
            return Err(invalid("apiPort must be non-zero"));
        }

        let registry = self.registry()?;
        for name in self.builtin_owners.keys() {
            if !builtin_identities(&BTreeMap::new()).iter().any(|i| &i.name == name) {
                return Err(invalid(format!("builtinOwners names unknown built-in '{}'", name)));
            }
        }
        registry.require(&self.default_admin)?;
        registry.require(&self.serving_identity)?;

        let readiness = &self.readiness;
        if readiness.initial_delay_ms == 0 || readiness.max_delay_ms < readiness.initial_delay_ms {
            return Err(invalid(
                "readiness delays must satisfy 0 < initialDelayMs <= maxDelayMs",
            ));
        }
        if readiness.deadline_secs == 0 || readiness.deadline_secs > MAX_GATE_DEADLINE_SECS {
            return Err(invalid(format!(
                "readiness deadlineSecs must be between 1 and {}",
                MAX_GATE_DEADLINE_SECS
            )));
        }
        let mut services = BTreeSet::new();
        for requirement in &readiness.requirements {
            if requirement.service.is_empty() {
                return Err(invalid("readiness requirement with empty service name"));
            }
            if !services.insert(requirement.service.as_str()) {
                return Err(invalid(format!(
                    "duplicate readiness requirement for service '{}'",
                    requirement.service
                )));
            }
            if let Some(dup) = requirement.duplicate_identity() {
                return Err(invalid(format!(
                    "service '{}' lists identity '{}' twice",
                    requirement.service, dup
                )));
            }
            for identity in &requirement.required_identities {
                registry.require(identity)?;
            }
        }
        if readiness.requirement(&self.api_service).is_none() {
            return Err(invalid(format!(
                "apiService '{}' has no readiness requirement",
                self.api_service
            )));
        }

        for binding in &self.bindings {
            for subject in &binding.subjects {
                registry.require(subject)?;
            }
        }
        Ok(())
    }
}
