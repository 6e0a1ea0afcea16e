//! Authorization reconciler
//!
//! A one-shot job run after the API server's readiness gate. It makes a small
//! set of remote objects exist (service accounts, then cluster role
//! bindings) with create-if-absent semantics: an object that already exists
//! is never compared, patched or replaced, whoever created it.
//!
//! Completion is recorded in a done-marker holding a fingerprint of the
//! desired objects. A later run with the same desired state exits without
//! touching the API; a changed desired state runs again.

mod api;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleRef as K8sRoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::EXIT_INTERRUPTED;
use crate::fsutil::{write_atomic, Owner, PUBLIC_MODE};
use crate::identity::{IdentityRegistry, MONITORING_IDENTITY};
use crate::retry::{retry_if, RetryConfig};

pub use api::{ApiFailure, AuthorizationApi, KubeAuthorizationApi};
#[cfg(test)]
pub use api::MockAuthorizationApi;

/// Exit code asking the supervisor to restart the job later
pub const EXIT_TEMPFAIL: i32 = 75;

/// Label marking objects created by the reconciler
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Reconciliation errors
#[derive(Debug, Error)]
pub enum ReconciliationError {
    /// The API was unreachable or failed transiently; a restart may succeed
    #[error("{object}: {message}")]
    Transient {
        /// Object (or operation) being worked on
        object: String,
        /// Failure description
        message: String,
    },

    /// The API refused to create an object
    #[error("{object} rejected ({code}): {message}")]
    Rejected {
        /// Object being created
        object: String,
        /// HTTP status
        code: u16,
        /// Server message
        message: String,
    },

    /// A binding names an identity that is not in the registry
    #[error("binding {binding} names unknown identity {identity}")]
    UnknownSubject {
        /// Binding name
        binding: String,
        /// Missing identity
        identity: String,
    },

    /// The API client could not be built
    #[error("API client: {0}")]
    Client(String),

    /// The done-marker could not be read or written
    #[error("done marker {path}: {reason}")]
    Marker {
        /// Marker path
        path: PathBuf,
        /// Failure description
        reason: String,
    },

    /// The run was cancelled
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl ReconciliationError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Transient { .. } => EXIT_TEMPFAIL,
            Self::Cancelled => EXIT_INTERRUPTED,
            _ => 1,
        }
    }

    fn from_api(object: &str, failure: ApiFailure) -> Self {
        match failure {
            ApiFailure::Rejected { code, message } => Self::Rejected {
                object: object.to_string(),
                code,
                message,
            },
            other => Self::Transient {
                object: object.to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Role a binding grants
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRef {
    /// `ClusterRole` or `Role`
    pub kind: String,
    /// Role name
    pub name: String,
}

/// Desired cluster role binding; subjects are identity names
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleBinding {
    /// Binding name
    pub name: String,
    /// Granted role
    pub role_ref: RoleRef,
    /// Identity names bound as users
    pub subjects: Vec<String>,
}

impl RoleBinding {
    /// Monitoring client gets read-only visibility
    pub fn monitoring_view() -> Self {
        Self {
            name: MONITORING_IDENTITY.to_string(),
            role_ref: RoleRef {
                kind: "ClusterRole".to_string(),
                name: "view".to_string(),
            },
            subjects: vec![MONITORING_IDENTITY.to_string()],
        }
    }
}

/// Desired service account
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceAccountSpec {
    /// Account name
    pub name: String,
    /// Namespace
    pub namespace: String,
}

fn managed_labels() -> BTreeMap<String, String> {
    [(MANAGED_BY_LABEL.to_string(), "trellis".to_string())].into()
}

/// The remote objects to ensure, resolved against the registry
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredState {
    /// Service accounts, ensured first
    pub service_accounts: Vec<ServiceAccount>,
    /// Cluster role bindings
    pub bindings: Vec<ClusterRoleBinding>,
}

impl DesiredState {
    /// Resolve descriptors into API objects
    ///
    /// Binding subjects become `User` subjects named by each identity's
    /// certificate CN, which is the user name the API server authenticates.
    pub fn resolve(
        registry: &IdentityRegistry,
        service_accounts: &[ServiceAccountSpec],
        bindings: &[RoleBinding],
    ) -> Result<Self, ReconciliationError> {
        let service_accounts = service_accounts
            .iter()
            .map(|spec| ServiceAccount {
                metadata: ObjectMeta {
                    name: Some(spec.name.clone()),
                    namespace: Some(spec.namespace.clone()),
                    labels: Some(managed_labels()),
                    ..Default::default()
                },
                ..Default::default()
            })
            .collect();

        let bindings = bindings
            .iter()
            .map(|binding| {
                let subjects = binding
                    .subjects
                    .iter()
                    .map(|name| {
                        let identity = registry.get(name).ok_or_else(|| {
                            ReconciliationError::UnknownSubject {
                                binding: binding.name.clone(),
                                identity: name.clone(),
                            }
                        })?;
                        Ok(Subject {
                            api_group: Some(RBAC_API_GROUP.to_string()),
                            kind: "User".to_string(),
                            name: identity.common_name.clone(),
                            namespace: None,
                        })
                    })
                    .collect::<Result<Vec<_>, ReconciliationError>>()?;

                Ok(ClusterRoleBinding {
                    metadata: ObjectMeta {
                        name: Some(binding.name.clone()),
                        labels: Some(managed_labels()),
                        ..Default::default()
                    },
                    role_ref: K8sRoleRef {
                        api_group: RBAC_API_GROUP.to_string(),
                        kind: binding.role_ref.kind.clone(),
                        name: binding.role_ref.name.clone(),
                    },
                    subjects: Some(subjects),
                })
            })
            .collect::<Result<Vec<_>, ReconciliationError>>()?;

        Ok(Self {
            service_accounts,
            bindings,
        })
    }

    /// Digest over the serialized objects
    pub fn fingerprint(&self) -> String {
        let mut hasher_input = Vec::new();
        for account in &self.service_accounts {
            hasher_input.extend(serde_json::to_vec(account).unwrap_or_default());
            hasher_input.push(b'\n');
        }
        for binding in &self.bindings {
            hasher_input.extend(serde_json::to_vec(binding).unwrap_or_default());
            hasher_input.push(b'\n');
        }
        URL_SAFE_NO_PAD.encode(digest(&SHA256, &hasher_input).as_ref())
    }
}

/// What [`ensure_exists`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ensured {
    /// The object was already there and was left alone
    Existed,
    /// The object was created
    Created,
    /// Someone else created it between our lookup and create
    CreatedConcurrently,
}

/// Create `key` unless `lookup` finds it
///
/// An existing object is never compared or modified. A conflict on create
/// means another writer got there first and counts as success.
pub async fn ensure_exists<T, L, LF, C, CF>(
    key: &str,
    lookup: L,
    create: C,
) -> Result<Ensured, ReconciliationError>
where
    L: FnOnce() -> LF,
    LF: Future<Output = Result<Option<T>, ApiFailure>>,
    C: FnOnce() -> CF,
    CF: Future<Output = Result<(), ApiFailure>>,
{
    if lookup()
        .await
        .map_err(|f| ReconciliationError::from_api(key, f))?
        .is_some()
    {
        debug!(object = %key, "Already exists, leaving untouched");
        return Ok(Ensured::Existed);
    }

    match create().await {
        Ok(()) => {
            info!(object = %key, "Created");
            Ok(Ensured::Created)
        }
        Err(ApiFailure::Conflict) => {
            info!(object = %key, "Created concurrently by another writer");
            Ok(Ensured::CreatedConcurrently)
        }
        Err(failure) => Err(ReconciliationError::from_api(key, failure)),
    }
}

/// Contents of the done-marker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneMarker {
    /// Fingerprint of the desired state that was reconciled
    pub fingerprint: String,
    /// Objects created by the run
    pub created: Vec<String>,
    /// Completion time
    pub completed_at: DateTime<Utc>,
}

/// Outcome of a reconciler run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// True when the done-marker matched and the API was not contacted
    pub skipped: bool,
    /// Objects created by this run
    pub created: Vec<String>,
    /// Objects found already present
    pub existing: Vec<String>,
}

/// One-shot authorization reconciler
pub struct Reconciler<A: AuthorizationApi> {
    api: A,
    desired: DesiredState,
    marker_path: PathBuf,
    reachability: RetryConfig,
}

impl<A: AuthorizationApi> Reconciler<A> {
    /// Create a reconciler recording completion at `marker_path`
    pub fn new(api: A, desired: DesiredState, marker_path: impl Into<PathBuf>) -> Self {
        Self {
            api,
            desired,
            marker_path: marker_path.into(),
            reachability: RetryConfig::with_max_attempts(30),
        }
    }

    /// Override the reachability retry schedule
    pub fn with_reachability(mut self, config: RetryConfig) -> Self {
        self.reachability = config;
        self
    }

    /// Run once; nothing is rolled back on failure
    pub async fn run(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ReconcileReport, ReconciliationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Reconciliation cancelled");
                Err(ReconciliationError::Cancelled)
            }
            result = self.reconcile() => result,
        }
    }

    async fn reconcile(&self) -> Result<ReconcileReport, ReconciliationError> {
        let fingerprint = self.desired.fingerprint();
        if let Some(marker) = self.read_marker()? {
            if marker.fingerprint == fingerprint {
                info!(
                    completed_at = %marker.completed_at,
                    "Authorization already reconciled"
                );
                return Ok(ReconcileReport {
                    skipped: true,
                    ..Default::default()
                });
            }
            info!("Desired authorization state changed since last run");
        }

        let version = retry_if(
            &self.reachability,
            "ping_api",
            || self.api.ping(),
            ApiFailure::is_transient,
        )
        .await
        .map_err(|f| ReconciliationError::from_api("API server", f))?;
        info!(version = %version, "API server reachable");

        let mut report = ReconcileReport::default();

        for account in &self.desired.service_accounts {
            let namespace = account.metadata.namespace.clone().unwrap_or_default();
            let name = account.metadata.name.clone().unwrap_or_default();
            let key = format!("ServiceAccount/{}/{}", namespace, name);
            let ensured = ensure_exists(
                &key,
                || self.api.get_service_account(&namespace, &name),
                || self.api.create_service_account(account),
            )
            .await?;
            report.record(key, ensured);
        }

        for binding in &self.desired.bindings {
            let name = binding.metadata.name.clone().unwrap_or_default();
            let key = format!("ClusterRoleBinding/{}", name);
            let ensured = ensure_exists(
                &key,
                || self.api.get_cluster_role_binding(&name),
                || self.api.create_cluster_role_binding(binding),
            )
            .await?;
            report.record(key, ensured);
        }

        self.write_marker(&DoneMarker {
            fingerprint,
            created: report.created.clone(),
            completed_at: Utc::now(),
        })?;

        info!(
            created = report.created.len(),
            existing = report.existing.len(),
            "Authorization reconciled"
        );
        Ok(report)
    }

    fn read_marker(&self) -> Result<Option<DoneMarker>, ReconciliationError> {
        let raw = match std::fs::read(&self.marker_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.marker_error(e)),
        };
        match serde_json::from_slice(&raw) {
            Ok(marker) => Ok(Some(marker)),
            Err(e) => {
                warn!(path = %self.marker_path.display(), error = %e, "Ignoring unreadable done marker");
                Ok(None)
            }
        }
    }

    fn write_marker(&self, marker: &DoneMarker) -> Result<(), ReconciliationError> {
        let json = serde_json::to_vec_pretty(marker).map_err(|e| self.marker_error(e))?;
        let owner = Owner::current().map_err(|e| self.marker_error(e))?;
        write_atomic(&self.marker_path, &json, PUBLIC_MODE, &owner).map_err(|e| self.marker_error(e))
    }

    fn marker_error(&self, e: impl std::fmt::Display) -> ReconciliationError {
        ReconciliationError::Marker {
            path: self.marker_path.clone(),
            reason: e.to_string(),
        }
    }
}

impl ReconcileReport {
    fn record(&mut self, key: String, ensured: Ensured) {
        match ensured {
            Ensured::Existed => self.existing.push(key),
            Ensured::Created | Ensured::CreatedConcurrently => self.created.push(key),
        }
    }
}
