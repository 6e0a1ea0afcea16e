//! Bootstrap token derivation
//!
//! The bootstrap token authenticates this host to the CA signer on first run.
//! It is derived deterministically from the directory password, so re-running
//! provisioning always produces the same token without depending on state
//! left by a previous run. The token is as sensitive as the password and is
//! stored with the same protection: mode `0400`, owned by the service account.

use std::path::{Path, PathBuf};

use aws_lc_rs::digest::{digest, SHA256};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::fsutil::{write_atomic, AccountResolver, OwnerError, SECRET_MODE};

/// Length of the derived token in characters
pub const TOKEN_LENGTH: usize = 32;

/// Token derivation errors
#[derive(Debug, Error)]
pub enum TokenError {
    /// The password source could not be read
    #[error("password source {source_desc} unavailable: {reason}")]
    PasswordUnavailable {
        /// Description of the source
        source_desc: String,
        /// Why it could not be read
        reason: String,
    },

    /// The password source exists but is empty
    #[error("password source {0} is empty")]
    EmptyPassword(String),

    /// The token file owner could not be resolved
    #[error("token owner: {0}")]
    Owner(#[from] OwnerError),

    /// Reading or writing the token file failed
    #[error("token file {path}: {source}")]
    Io {
        /// Token file path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// A stored token does not have the expected shape
    #[error("token file {0} is malformed")]
    Malformed(PathBuf),
}

/// A derived bootstrap token
#[derive(Clone, PartialEq, Eq)]
pub struct BootstrapToken {
    value: String,
}

impl BootstrapToken {
    /// Derive the token for a password
    ///
    /// SHA-256 of the password, URL-safe base64 without padding, truncated to
    /// [`TOKEN_LENGTH`] characters.
    pub fn derive(password: &str) -> Self {
        let hash = digest(&SHA256, password.as_bytes());
        let mut value = URL_SAFE_NO_PAD.encode(hash.as_ref());
        value.truncate(TOKEN_LENGTH);
        Self { value }
    }

    /// Read a token previously written by [`TokenDeriver::write`]
    pub fn load(path: &Path) -> Result<Self, TokenError> {
        let raw = std::fs::read_to_string(path).map_err(|source| TokenError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let value = raw.trim_end().to_string();
        let well_formed = value.len() == TOKEN_LENGTH
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !well_formed {
            return Err(TokenError::Malformed(path.to_path_buf()));
        }
        Ok(Self { value })
    }

    /// Get the token as a string
    pub fn as_str(&self) -> &str {
        &self.value
    }

    /// Short digest of the token, safe to log
    pub fn fingerprint(&self) -> String {
        let hash = digest(&SHA256, self.value.as_bytes());
        URL_SAFE_NO_PAD.encode(&hash.as_ref()[..6])
    }
}

impl std::fmt::Debug for BootstrapToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BootstrapToken")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// Where the directory password comes from
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PasswordSource {
    /// A file containing the password (trailing newline ignored)
    File(PathBuf),
    /// An environment variable
    Env(String),
}

impl PasswordSource {
    fn describe(&self) -> String {
        match self {
            Self::File(path) => format!("file {}", path.display()),
            Self::Env(var) => format!("env {}", var),
        }
    }

    /// Read the password; never returns an empty string
    pub fn read(&self) -> Result<String, TokenError> {
        let raw = match self {
            Self::File(path) => std::fs::read_to_string(path).map_err(|e| {
                TokenError::PasswordUnavailable {
                    source_desc: self.describe(),
                    reason: e.to_string(),
                }
            })?,
            Self::Env(var) => std::env::var(var).map_err(|e| TokenError::PasswordUnavailable {
                source_desc: self.describe(),
                reason: e.to_string(),
            })?,
        };

        let password = raw.trim_end_matches(['\n', '\r']).to_string();
        if password.is_empty() {
            return Err(TokenError::EmptyPassword(self.describe()));
        }
        Ok(password)
    }
}

/// The token as written to disk
#[derive(Debug, Clone)]
pub struct TokenFile {
    /// The token
    pub token: BootstrapToken,
    /// File location
    pub path: PathBuf,
    /// File mode
    pub mode: u32,
    /// Owning account
    pub owner: String,
}

/// Derives the token and writes it for the CA adapter
pub struct TokenDeriver {
    source: PasswordSource,
    path: PathBuf,
    owner: String,
}

impl TokenDeriver {
    /// Create a deriver writing to `path`, owned by `owner`
    pub fn new(source: PasswordSource, path: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            source,
            path: path.into(),
            owner: owner.into(),
        }
    }

    /// Read the password, derive the token and overwrite the token file
    ///
    /// Nothing is written unless the password was read successfully.
    pub fn provision(&self, accounts: &dyn AccountResolver) -> Result<TokenFile, TokenError> {
        let password = self.source.read()?;
        let token = BootstrapToken::derive(&password);
        self.write(token, accounts)
    }

    /// Write an already derived token
    pub fn write(
        &self,
        token: BootstrapToken,
        accounts: &dyn AccountResolver,
    ) -> Result<TokenFile, TokenError> {
        let owner = accounts.resolve(&self.owner)?;
        write_atomic(&self.path, token.as_str().as_bytes(), SECRET_MODE, &owner).map_err(
            |source| TokenError::Io {
                path: self.path.clone(),
                source,
            },
        )?;

        info!(
            path = %self.path.display(),
            owner = %self.owner,
            fingerprint = %token.fingerprint(),
            "Bootstrap token written"
        );

        Ok(TokenFile {
            token,
            path: self.path.clone(),
            mode: SECRET_MODE,
            owner: self.owner.clone(),
        })
    }
}
