//! On-disk certificate material and its structural checks

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::fsutil::{file_facts, Owner};
use crate::identity::Identity;
use crate::pki::{certificate_common_name, certificate_subject_alt_names, normalize_san, verify_signed_by};

/// Why material on disk is not usable
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MaterialDefect {
    /// File does not exist
    #[error("{0} is missing")]
    Missing(PathBuf),

    /// File exists but is empty
    #[error("{0} is empty")]
    Empty(PathBuf),

    /// File content is not what it should be
    #[error("{path} is invalid: {reason}")]
    Invalid {
        /// Offending file
        path: PathBuf,
        /// Parse or content failure
        reason: String,
    },

    /// Certificate subject does not match the identity
    #[error("{path} has CN {found}, expected {expected}")]
    WrongSubject {
        /// Certificate path
        path: PathBuf,
        /// Expected CN
        expected: String,
        /// CN found in the certificate
        found: String,
    },

    /// Key is accessible to group or others
    #[error("{path} has mode {mode:o}, expected owner-only access")]
    Permissive {
        /// Key path
        path: PathBuf,
        /// Mode found
        mode: u32,
    },

    /// Key owned by the wrong account
    #[error("{path} is owned by uid {found}, expected {expected}")]
    WrongOwner {
        /// Key path
        path: PathBuf,
        /// Expected uid
        expected: u32,
        /// Found uid
        found: u32,
    },

    /// Certificate was not signed by the current CA
    #[error("{path} was not issued by the configured CA: {reason}")]
    ForeignIssuer {
        /// Certificate path
        path: PathBuf,
        /// Verification outcome
        reason: String,
    },

    /// Certificate names differ from the ones that would be requested now
    #[error("{path} lists subject alt names {found:?}, expected {expected:?}")]
    StaleSubjectAltNames {
        /// Certificate path
        path: PathBuf,
        /// Names the request carries
        expected: BTreeSet<String>,
        /// Names in the certificate
        found: BTreeSet<String>,
    },

    /// File could not be inspected
    #[error("{path}: {reason}")]
    Unreadable {
        /// Offending file
        path: PathBuf,
        /// IO failure
        reason: String,
    },
}

impl MaterialDefect {
    /// Whether the material simply has not been written yet
    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing(_))
    }
}

/// Deterministic file locations for certificate material
///
/// Each identity gets its own directory, `<cert_dir>/<name>/{cert,key}.pem`,
/// so no identity name can address another identity's files.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertLayout {
    cert_dir: PathBuf,
}

impl CertLayout {
    /// Layout rooted at `cert_dir`
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
        }
    }

    /// Certificate path for an identity name
    pub fn cert_path(&self, name: &str) -> PathBuf {
        self.cert_dir.join(name).join("cert.pem")
    }

    /// Private key path for an identity name
    pub fn key_path(&self, name: &str) -> PathBuf {
        self.cert_dir.join(name).join("key.pem")
    }

    /// Material descriptor for an identity
    pub fn material(&self, identity: &Identity) -> CertificateMaterial {
        CertificateMaterial {
            identity: identity.clone(),
            cert_path: self.cert_path(&identity.name),
            key_path: self.key_path(&identity.name),
        }
    }
}

/// An issued certificate/key pair bound to one identity
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateMaterial {
    /// The identity the material certifies
    pub identity: Identity,
    /// Certificate location
    pub cert_path: PathBuf,
    /// Private key location
    pub key_path: PathBuf,
}

impl CertificateMaterial {
    /// Check the material is present and structurally valid for `owner`
    ///
    /// Both files must be non-empty PEM; the certificate CN must equal the
    /// identity's common name; the key must be owner-only and owned by `owner`.
    pub fn inspect(&self, owner: &Owner) -> Result<(), MaterialDefect> {
        let key_facts = facts(&self.key_path)?;
        if !key_facts.is_owner_only() {
            return Err(MaterialDefect::Permissive {
                path: self.key_path.clone(),
                mode: key_facts.mode,
            });
        }
        if key_facts.uid != owner.uid {
            return Err(MaterialDefect::WrongOwner {
                path: self.key_path.clone(),
                expected: owner.uid,
                found: key_facts.uid,
            });
        }
        facts(&self.cert_path)?;

        let key_pem = read(&self.key_path)?;
        match ::pem::parse(key_pem.as_bytes()) {
            Ok(block) if block.tag().ends_with("PRIVATE KEY") => {}
            Ok(block) => {
                return Err(MaterialDefect::Invalid {
                    path: self.key_path.clone(),
                    reason: format!("unexpected PEM block {}", block.tag()),
                })
            }
            Err(e) => {
                return Err(MaterialDefect::Invalid {
                    path: self.key_path.clone(),
                    reason: e.to_string(),
                })
            }
        }

        let cert_pem = read(&self.cert_path)?;
        let cn = certificate_common_name(&cert_pem).map_err(|e| MaterialDefect::Invalid {
            path: self.cert_path.clone(),
            reason: e.to_string(),
        })?;
        if cn != self.identity.common_name {
            return Err(MaterialDefect::WrongSubject {
                path: self.cert_path.clone(),
                expected: self.identity.common_name.clone(),
                found: cn,
            });
        }
        Ok(())
    }

    /// Check the certificate matches what the CA would issue now
    ///
    /// The certificate must verify against `ca_cert_pem` and carry exactly
    /// `subject_alt_names` (compared after normalization, order ignored).
    pub fn check_issuance(
        &self,
        ca_cert_pem: &str,
        subject_alt_names: &[String],
    ) -> Result<(), MaterialDefect> {
        let cert_pem = read(&self.cert_path)?;
        match verify_signed_by(&cert_pem, ca_cert_pem) {
            Ok(true) => {}
            Ok(false) => {
                return Err(MaterialDefect::ForeignIssuer {
                    path: self.cert_path.clone(),
                    reason: "signature does not verify".to_string(),
                })
            }
            Err(e) => {
                return Err(MaterialDefect::ForeignIssuer {
                    path: self.cert_path.clone(),
                    reason: e.to_string(),
                })
            }
        }

        let found =
            certificate_subject_alt_names(&cert_pem).map_err(|e| MaterialDefect::Invalid {
                path: self.cert_path.clone(),
                reason: e.to_string(),
            })?;
        let expected: BTreeSet<String> =
            subject_alt_names.iter().map(|n| normalize_san(n)).collect();
        if found != expected {
            return Err(MaterialDefect::StaleSubjectAltNames {
                path: self.cert_path.clone(),
                expected,
                found,
            });
        }
        Ok(())
    }
}

fn facts(path: &Path) -> Result<crate::fsutil::FileFacts, MaterialDefect> {
    match file_facts(path) {
        Ok(Some(f)) if f.len == 0 => Err(MaterialDefect::Empty(path.to_path_buf())),
        Ok(Some(f)) => Ok(f),
        Ok(None) => Err(MaterialDefect::Missing(path.to_path_buf())),
        Err(e) => Err(MaterialDefect::Unreadable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }),
    }
}

fn read(path: &Path) -> Result<String, MaterialDefect> {
    std::fs::read_to_string(path).map_err(|e| MaterialDefect::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
