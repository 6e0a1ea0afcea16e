//! Trellis - control-plane bootstrap for a single Kubernetes cluster
//!
//! Trellis issues the client certificates every control-plane component
//! needs, wraps them into per-principal connection bundles, holds each
//! service back until its credentials exist, and seeds the cluster with
//! the service accounts and role bindings the rest of the system expects.
//!
//! # Bootstrap order
//!
//! - The CA bootstrap token is derived from the configured password
//! - One certificate is issued per identity in the registry
//! - Connection bundles are written once every certificate exists
//! - Each gated service waits for its own identities
//! - Once the API server answers, authorization objects are created
//!
//! The order is expressed as a unit graph so the service supervisor
//! enforces it; see [`units`].
//!
//! # Modules
//!
//! - [`identity`] - Identity registry (built-ins plus configured admins)
//! - [`pki`] - CA collaborators (in-process signer and remote endpoint)
//! - [`issuance`] - Per-identity certificate issuance and on-disk layout
//! - [`bundle`] - Connection bundle synthesis and per-user resolution
//! - [`readiness`] - Gates that block a service until its identities exist
//! - [`token`] - Bootstrap token derivation
//! - [`rbac`] - One-shot authorization reconciliation
//! - [`units`] - Dependency graph between bootstrap steps
//! - [`provision`] - A full issuance and bundle run
//! - [`config`] - Configuration file
//! - [`retry`] - Backoff helpers
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod bundle;
pub mod config;
pub mod error;
pub mod fsutil;
pub mod identity;
pub mod issuance;
pub mod pki;
pub mod provision;
pub mod rbac;
pub mod readiness;
pub mod retry;
pub mod token;
pub mod units;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
