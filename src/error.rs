//! Error types for trellis

use thiserror::Error;

use crate::bundle::BundleError;
use crate::config::ConfigError;
use crate::fsutil::OwnerError;
use crate::identity::IdentityError;
use crate::issuance::IssuanceError;
use crate::pki::PkiError;
use crate::rbac::ReconciliationError;
use crate::readiness::GateError;
use crate::token::TokenError;
use crate::units::GraphError;

/// Exit code for configuration problems (EX_CONFIG)
pub const EXIT_CONFIG: i32 = 78;

/// Exit code after an operator interrupt
pub const EXIT_INTERRUPTED: i32 = 130;

/// Main error type for trellis operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration could not be loaded or is inconsistent
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Duplicate, malformed or unknown identity
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A local account could not be resolved
    #[error(transparent)]
    Owner(#[from] OwnerError),

    /// CA collaborator failure outside of issuance (loading the CA)
    #[error(transparent)]
    Pki(#[from] PkiError),

    /// Certificate issuance failed for an identity
    #[error(transparent)]
    Issuance(#[from] IssuanceError),

    /// Bundle synthesis or resolution failed
    #[error(transparent)]
    Bundle(#[from] BundleError),

    /// A readiness gate failed or was cancelled
    #[error(transparent)]
    Gate(#[from] GateError),

    /// Bootstrap token derivation failed
    #[error(transparent)]
    Token(#[from] TokenError),

    /// Authorization reconciliation failed
    #[error(transparent)]
    Reconcile(#[from] ReconciliationError),

    /// The unit graph is inconsistent
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether the failure came from an operator interrupt
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            Self::Issuance(IssuanceError::Cancelled { .. })
                | Self::Gate(GateError::Cancelled { .. })
                | Self::Reconcile(ReconciliationError::Cancelled)
        )
    }

    /// Process exit code for this failure
    ///
    /// Transient reconciliation failures use 75 so the supervisor's restart
    /// policy retries the job.
    pub fn exit_code(&self) -> i32 {
        match self {
            _ if self.is_cancelled() => EXIT_INTERRUPTED,
            Self::Config(_) | Self::Identity(_) | Self::Graph(_) => EXIT_CONFIG,
            Self::Reconcile(e) => e.exit_code(),
            _ => 1,
        }
    }
}
