//! Readiness gate
//!
//! One gate per dependent service. The supervisor runs `trellis gate
//! --service <name>` as a synthetic unit between certificate issuance and
//! the service itself; the gate blocks until every identity the service
//! needs has usable material on disk, or fails once the deadline passes.
//!
//! # States
//!
//! ```text
//! Pending --all material present--> Satisfied
//! Pending --deadline passed-------> Failed
//! ```
//!
//! Both terminal states are sticky. A cancelled wait leaves the gate
//! `Pending`; restarting the unit starts a fresh gate.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fsutil::AccountResolver;
use crate::identity::{IdentityError, IdentityRegistry};
use crate::issuance::{CertLayout, CertificateMaterial};
use crate::retry::Backoff;

/// Prefix of gate unit names
pub const GATE_UNIT_PREFIX: &str = "trellis-ready@";

/// Gate unit name for a service
pub fn unit_name(service: &str) -> String {
    format!("{}{}", GATE_UNIT_PREFIX, service)
}

/// Identities a service needs before it may start
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessRequirement {
    /// Dependent service name
    pub service: String,
    /// Required identity names, checked in this order
    pub required_identities: Vec<String>,
}

impl ReadinessRequirement {
    /// Create a requirement
    pub fn new(service: impl Into<String>, identities: &[&str]) -> Self {
        Self {
            service: service.into(),
            required_identities: identities.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// First identity listed twice, if any
    pub fn duplicate_identity(&self) -> Option<&str> {
        self.required_identities
            .iter()
            .enumerate()
            .find(|(i, name)| self.required_identities[..*i].contains(name))
            .map(|(_, name)| name.as_str())
    }
}

/// Gate timing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GateTiming {
    /// First poll interval
    pub initial_delay: Duration,
    /// Poll interval cap
    pub max_delay: Duration,
    /// Total time allowed before the gate fails
    pub deadline: Duration,
}

impl Default for GateTiming {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            deadline: Duration::from_secs(300),
        }
    }
}

/// Gate state
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateState {
    /// Still waiting for material
    Pending,
    /// Every required identity has usable material
    Satisfied,
    /// The deadline passed with `identity` still unusable
    Failed {
        /// First blocking identity in requirement order
        identity: String,
        /// Why it was unusable at the final check
        reason: String,
    },
}

impl GateState {
    /// Whether the state can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Result of one evaluation pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Evaluation {
    /// All material present and valid
    Ready,
    /// `identity` is the first one not yet usable
    Blocked {
        /// Blocking identity
        identity: String,
        /// Defect found
        reason: String,
    },
}

/// Gate errors
#[derive(Debug, Error)]
pub enum GateError {
    /// Required material did not appear in time
    #[error("service {service} not ready: identity {identity} unavailable: {reason}")]
    Timeout {
        /// Gated service
        service: String,
        /// First missing identity
        identity: String,
        /// Defect at the final check
        reason: String,
    },

    /// The wait was cancelled
    #[error("readiness gate for {service} cancelled")]
    Cancelled {
        /// Gated service
        service: String,
    },

    /// The requirement names an identity outside the registry
    #[error("readiness requirement for {service}: {source}")]
    UnknownIdentity {
        /// Gated service
        service: String,
        /// Lookup failure
        source: IdentityError,
    },
}

/// Blocking readiness gate for one service
pub struct ReadinessGate {
    service: String,
    materials: Vec<CertificateMaterial>,
    accounts: Arc<dyn AccountResolver>,
    timing: GateTiming,
    state: GateState,
}

impl ReadinessGate {
    /// Build the gate for `requirement`, resolving identities in the registry
    pub fn new(
        requirement: &ReadinessRequirement,
        registry: &IdentityRegistry,
        layout: &CertLayout,
        accounts: Arc<dyn AccountResolver>,
        timing: GateTiming,
    ) -> Result<Self, GateError> {
        let materials = requirement
            .required_identities
            .iter()
            .map(|name| registry.require(name).map(|identity| layout.material(identity)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| GateError::UnknownIdentity {
                service: requirement.service.clone(),
                source,
            })?;

        Ok(Self {
            service: requirement.service.clone(),
            materials,
            accounts,
            timing,
            state: GateState::Pending,
        })
    }

    /// Gated service name
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state
    pub fn state(&self) -> &GateState {
        &self.state
    }

    /// Check all required material once, in requirement order
    pub fn evaluate(&self) -> Evaluation {
        for material in &self.materials {
            let identity = &material.identity;
            let verdict = self
                .accounts
                .resolve(&identity.private_key_owner)
                .map_err(|e| e.to_string())
                .and_then(|owner| material.inspect(&owner).map_err(|d| d.to_string()));
            if let Err(reason) = verdict {
                return Evaluation::Blocked {
                    identity: identity.name.clone(),
                    reason,
                };
            }
        }
        Evaluation::Ready
    }

    /// Poll until satisfied, failed or cancelled
    ///
    /// The check made when the deadline is reached still counts: material
    /// that lands right before the deadline satisfies the gate.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), GateError> {
        if let Some(result) = self.terminal_result() {
            return result;
        }

        // A deadline past the clock's range means no deadline at all
        let deadline = Instant::now().checked_add(self.timing.deadline);
        let mut backoff = Backoff::new(self.timing.initial_delay, self.timing.max_delay, 2.0);

        loop {
            let (identity, reason) = match self.evaluate() {
                Evaluation::Ready => {
                    info!(service = %self.service, "Readiness gate satisfied");
                    self.state = GateState::Satisfied;
                    return Ok(());
                }
                Evaluation::Blocked { identity, reason } => (identity, reason),
            };

            let now = Instant::now();
            if deadline.is_some_and(|d| now >= d) {
                warn!(
                    service = %self.service,
                    identity = %identity,
                    reason = %reason,
                    "Readiness gate timed out"
                );
                self.state = GateState::Failed {
                    identity: identity.clone(),
                    reason: reason.clone(),
                };
                return Err(GateError::Timeout {
                    service: self.service.clone(),
                    identity,
                    reason,
                });
            }

            let delay = match deadline {
                Some(d) => backoff.next_delay().min(d - now),
                None => backoff.next_delay(),
            };
            debug!(
                service = %self.service,
                identity = %identity,
                reason = %reason,
                delay_ms = delay.as_millis(),
                "Waiting for certificate material"
            );
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(service = %self.service, "Readiness gate cancelled");
                    return Err(GateError::Cancelled { service: self.service.clone() });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn terminal_result(&self) -> Option<Result<(), GateError>> {
        match &self.state {
            GateState::Pending => None,
            GateState::Satisfied => Some(Ok(())),
            GateState::Failed { identity, reason } => Some(Err(GateError::Timeout {
                service: self.service.clone(),
                identity: identity.clone(),
                reason: reason.clone(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::{Owner, OwnerError};
    use crate::identity::Identity;
    use crate::issuance::IssuanceAdapter;
    use crate::pki::LocalCa;
    use tempfile::TempDir;

    struct CurrentUser;

    impl AccountResolver for CurrentUser {
        fn resolve(&self, _account: &str) -> Result<Owner, OwnerError> {
            Owner::current()
        }
    }

    struct Fixture {
        _dir: TempDir,
        registry: IdentityRegistry,
        layout: CertLayout,
        adapter: IssuanceAdapter<LocalCa>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let layout = CertLayout::new(dir.path().join("certs"));
            let registry = IdentityRegistry::new(&["a".to_string(), "b".to_string()], vec![]).unwrap();
            let adapter = IssuanceAdapter::new(
                Arc::new(LocalCa::generate("gate test CA").unwrap()),
                Arc::new(CurrentUser),
                layout.clone(),
            );
            Self {
                _dir: dir,
                registry,
                layout,
                adapter,
            }
        }

        fn gate(&self, timing: GateTiming) -> ReadinessGate {
            ReadinessGate::new(
                &ReadinessRequirement::new("svc", &["a", "b"]),
                &self.registry,
                &self.layout,
                Arc::new(CurrentUser),
                timing,
            )
            .unwrap()
        }

        async fn issue(&self, name: &str) {
            let identity = self.registry.get(name).unwrap().clone();
            self.adapter.issue(&identity).await.unwrap();
        }
    }

    fn quick(deadline_ms: u64) -> GateTiming {
        GateTiming {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            deadline: Duration::from_millis(deadline_ms),
        }
    }

    #[test]
    fn gate_units_are_named_after_the_service() {
        assert_eq!(unit_name("kube-apiserver"), "trellis-ready@kube-apiserver");
    }

    #[test]
    fn duplicate_required_identities_are_detected() {
        let req = ReadinessRequirement::new("svc", &["a", "b", "a"]);
        assert_eq!(req.duplicate_identity(), Some("a"));
        assert_eq!(ReadinessRequirement::new("svc", &["a", "b"]).duplicate_identity(), None);
    }

    #[test]
    fn unknown_identity_is_a_construction_error() {
        let fixture = Fixture::new();
        let result = ReadinessGate::new(
            &ReadinessRequirement::new("svc", &["a", "zed"]),
            &fixture.registry,
            &fixture.layout,
            Arc::new(CurrentUser),
            GateTiming::default(),
        );
        assert!(matches!(result, Err(GateError::UnknownIdentity { .. })));
    }

    /// Story: the gate fails after the deadline and names the identity that
    /// never appeared
    #[tokio::test]
    async fn missing_identity_fails_the_gate_by_name() {
        let fixture = Fixture::new();
        fixture.issue("a").await;

        let mut gate = fixture.gate(quick(200));
        let err = gate.wait(&CancellationToken::new()).await.unwrap_err();

        match err {
            GateError::Timeout {
                service, identity, ..
            } => {
                assert_eq!(service, "svc");
                assert_eq!(identity, "b");
            }
            other => panic!("expected timeout, got {other}"),
        }
        assert!(matches!(gate.state(), GateState::Failed { identity, .. } if identity == "b"));
    }

    #[tokio::test]
    async fn unrepresentable_deadline_waits_without_panicking() {
        let fixture = Fixture::new();
        let mut gate = fixture.gate(GateTiming {
            deadline: Duration::MAX,
            ..quick(0)
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = gate.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, GateError::Cancelled { .. }));
        assert_eq!(gate.state(), &GateState::Pending);
    }

    /// Story: material that arrives while the gate is polling satisfies it
    #[tokio::test]
    async fn late_material_satisfies_the_gate() {
        let fixture = Arc::new(Fixture::new());
        fixture.issue("a").await;

        let writer = fixture.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer.issue("b").await;
        });

        let mut gate = fixture.gate(quick(5_000));
        gate.wait(&CancellationToken::new()).await.unwrap();
        assert_eq!(gate.state(), &GateState::Satisfied);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn present_material_satisfies_immediately() {
        let fixture = Fixture::new();
        fixture.issue("a").await;
        fixture.issue("b").await;

        let gate = fixture.gate(GateTiming::default());
        assert_eq!(gate.evaluate(), Evaluation::Ready);
    }

    #[tokio::test]
    async fn corrupted_certificate_blocks_the_gate() {
        let fixture = Fixture::new();
        fixture.issue("a").await;
        fixture.issue("b").await;

        let cert = fixture.layout.cert_path("b");
        std::fs::remove_file(&cert).unwrap();
        std::fs::write(&cert, "-----BEGIN CERTIFICATE-----\ngarbage\n-----END CERTIFICATE-----\n")
            .unwrap();

        let gate = fixture.gate(GateTiming::default());
        assert!(matches!(gate.evaluate(), Evaluation::Blocked { identity, .. } if identity == "b"));
    }

    #[tokio::test]
    async fn certificate_for_the_wrong_subject_blocks_the_gate() {
        let fixture = Fixture::new();
        fixture.issue("a").await;
        fixture.issue("b").await;
        std::fs::copy(fixture.layout.cert_path("a"), fixture.layout.cert_path("b")).unwrap();

        let gate = fixture.gate(GateTiming::default());
        match gate.evaluate() {
            Evaluation::Blocked { identity, reason } => {
                assert_eq!(identity, "b");
                assert!(reason.contains("expected b"), "{reason}");
            }
            Evaluation::Ready => panic!("wrong subject must block"),
        }
    }

    #[tokio::test]
    async fn cancelled_gate_stays_pending() {
        let fixture = Fixture::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut gate = fixture.gate(quick(5_000));
        let err = gate.wait(&cancel).await.unwrap_err();
        assert!(matches!(err, GateError::Cancelled { .. }));
        assert_eq!(gate.state(), &GateState::Pending);
    }

    #[tokio::test]
    async fn terminal_state_is_sticky() {
        let fixture = Fixture::new();
        let mut gate = fixture.gate(quick(0));
        assert!(gate.wait(&CancellationToken::new()).await.is_err());

        // material appearing afterwards does not revive a failed gate
        fixture.issue("a").await;
        fixture.issue("b").await;
        assert!(matches!(
            gate.wait(&CancellationToken::new()).await,
            Err(GateError::Timeout { .. })
        ));
        assert!(gate.state().is_terminal());
    }
}
