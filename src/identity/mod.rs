//! Identity registry
//!
//! Enumerates every principal that needs a client certificate: the members
//! of the administrative group plus a fixed table of built-in system
//! identities (control-plane components and the monitoring client).
//! The registry is built once per run and never mutated afterwards.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Organization granted full administrative trust by the API server
pub const MASTERS_GROUP: &str = "system:masters";

/// Name of the built-in administrative identity used by the superuser
pub const DEFAULT_ADMIN_IDENTITY: &str = "cluster-admin";

/// Name of the built-in monitoring client identity
pub const MONITORING_IDENTITY: &str = "sensu";

/// Distinguished-name attributes an identity may carry
pub const ALLOWED_DN_FIELDS: &[&str] = &["O", "OU", "C", "ST", "L"];

/// Identity construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    /// Two identities share a name
    #[error("duplicate identity: {name}")]
    Duplicate {
        /// The colliding name
        name: String,
    },

    /// Identity name or fields are not acceptable
    #[error("malformed identity {name}: {reason}")]
    Malformed {
        /// Offending identity name
        name: String,
        /// What is wrong with it
        reason: String,
    },

    /// A reference to an identity that is not in the registry
    #[error("unknown identity: {name}")]
    Unknown {
        /// The unresolved name
        name: String,
    },
}

/// A principal that receives a client certificate
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Unique registry key, also used to derive file paths
    pub name: String,
    /// Certificate subject CN (the Kubernetes user name)
    pub common_name: String,
    /// Additional subject attributes keyed by short name (`O`, `OU`, ...)
    pub organization_fields: BTreeMap<String, String>,
    /// Local account allowed to read the private key
    pub private_key_owner: String,
}

impl Identity {
    /// Identity for a member of the administrative group
    pub fn admin(member: &str) -> Self {
        Self {
            name: member.to_string(),
            common_name: member.to_string(),
            organization_fields: [("O".to_string(), MASTERS_GROUP.to_string())].into(),
            private_key_owner: member.to_string(),
        }
    }

    fn builtin(name: &str, common_name: &str, org: Option<&str>, owner: &str) -> Self {
        Self {
            name: name.to_string(),
            common_name: common_name.to_string(),
            organization_fields: org
                .map(|o| [("O".to_string(), o.to_string())].into())
                .unwrap_or_default(),
            private_key_owner: owner.to_string(),
        }
    }

    /// Check name syntax and subject fields
    pub fn validate(&self) -> Result<(), IdentityError> {
        validate_name(&self.name)?;

        if self.common_name.is_empty() {
            return Err(self.malformed("common name must not be empty"));
        }
        if self.private_key_owner.is_empty() {
            return Err(self.malformed("private key owner must not be empty"));
        }
        for (key, value) in &self.organization_fields {
            if !ALLOWED_DN_FIELDS.contains(&key.as_str()) {
                return Err(self.malformed(format!(
                    "unsupported subject field '{}', expected one of {:?}",
                    key, ALLOWED_DN_FIELDS
                )));
            }
            if value.is_empty() {
                return Err(self.malformed(format!("subject field '{}' is empty", key)));
            }
        }
        Ok(())
    }

    /// Whether the identity carries full administrative trust
    pub fn is_admin(&self) -> bool {
        self.organization_fields
            .get("O")
            .is_some_and(|o| o == MASTERS_GROUP)
    }

    fn malformed(&self, reason: impl Into<String>) -> IdentityError {
        IdentityError::Malformed {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }
}

/// Registry names end up in file names and unit names
fn validate_name(name: &str) -> Result<(), IdentityError> {
    let malformed = |reason: &str| IdentityError::Malformed {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    let first = name.chars().next().ok_or_else(|| malformed("name must not be empty"))?;
    if !first.is_ascii_alphanumeric() {
        return Err(malformed("name must start with a letter or digit"));
    }
    if name.len() > 63 {
        return Err(malformed("name must be at most 63 characters"));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')))
    {
        return Err(malformed(&format!("invalid character '{}'", bad)));
    }
    Ok(())
}

/// The fixed table of system identities
///
/// `owner_overrides` may reassign the local account owning a built-in key;
/// subject fields are never overridable.
pub fn builtin_identities(owner_overrides: &BTreeMap<String, String>) -> Vec<Identity> {
    let mut table = vec![
        Identity::builtin(DEFAULT_ADMIN_IDENTITY, DEFAULT_ADMIN_IDENTITY, Some(MASTERS_GROUP), "root"),
        Identity::builtin("kube-apiserver", "kube-apiserver", None, "kubernetes"),
        Identity::builtin(
            "kube-controller-manager",
            "system:kube-controller-manager",
            None,
            "kubernetes",
        ),
        Identity::builtin("kube-scheduler", "system:kube-scheduler", None, "kubernetes"),
        Identity::builtin(
            "kube-proxy",
            "system:kube-proxy",
            Some("system:node-proxier"),
            "kubernetes",
        ),
        Identity::builtin(MONITORING_IDENTITY, MONITORING_IDENTITY, None, MONITORING_IDENTITY),
    ];

    for identity in &mut table {
        if let Some(owner) = owner_overrides.get(&identity.name) {
            identity.private_key_owner = owner.clone();
        }
    }
    table
}

/// The set of identities for one provisioning run
#[derive(Clone, Debug)]
pub struct IdentityRegistry {
    identities: Vec<Identity>,
}

impl IdentityRegistry {
    /// Build the registry from administrative members and the built-in table
    ///
    /// Fails with [`IdentityError::Duplicate`] when any name appears twice,
    /// whether among the admins themselves or across admins and built-ins.
    pub fn new(admins: &[String], builtins: Vec<Identity>) -> Result<Self, IdentityError> {
        let mut seen = BTreeSet::new();
        let mut identities = Vec::with_capacity(admins.len() + builtins.len());

        for identity in builtins
            .into_iter()
            .chain(admins.iter().map(|m| Identity::admin(m)))
        {
            identity.validate()?;
            if !seen.insert(identity.name.clone()) {
                return Err(IdentityError::Duplicate {
                    name: identity.name,
                });
            }
            identities.push(identity);
        }

        identities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { identities })
    }

    /// Every identity, sorted by name
    pub fn list_identities(&self) -> &[Identity] {
        &self.identities
    }

    /// Look up an identity by name
    pub fn get(&self, name: &str) -> Option<&Identity> {
        self.identities
            .binary_search_by(|i| i.name.as_str().cmp(name))
            .ok()
            .map(|idx| &self.identities[idx])
    }

    /// Look up an identity by name, failing for unknown names
    pub fn require(&self, name: &str) -> Result<&Identity, IdentityError> {
        self.get(name).ok_or_else(|| IdentityError::Unknown {
            name: name.to_string(),
        })
    }

    /// Number of identities
    pub fn len(&self) -> usize {
        self.identities.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }
}
