//! Filesystem helpers for key material
//!
//! Every secret `trellis` writes (private keys, connection bundles, the
//! bootstrap token) goes through [`write_atomic`]: the content lands in a temp
//! file in the target directory that is created with its final mode and owner,
//! and is then renamed into place. Readers therefore only ever observe either
//! the previous file or the complete new one, and a key is never readable by
//! anyone but its owner.

use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use nix::unistd::{Gid, Uid, User};
use thiserror::Error;

/// Mode for private keys, bundles and the bootstrap token
pub const SECRET_MODE: u32 = 0o400;

/// Mode for certificates
pub const PUBLIC_MODE: u32 = 0o444;

/// Account resolution errors
#[derive(Debug, Error)]
pub enum OwnerError {
    /// No such account in the system account database
    #[error("unknown account: {0}")]
    UnknownAccount(String),

    /// The account database could not be queried
    #[error("account lookup failed for {account}: {reason}")]
    Lookup {
        /// Account that was being resolved
        account: String,
        /// Underlying failure
        reason: String,
    },
}

/// A resolved local account that owns files on disk
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    /// Account name
    pub name: String,
    /// Numeric user id
    pub uid: u32,
    /// Primary group id
    pub gid: u32,
}

impl Owner {
    /// The account the current process runs as (effective uid)
    pub fn current() -> Result<Self, OwnerError> {
        let uid = nix::unistd::geteuid();
        match User::from_uid(uid) {
            Ok(Some(user)) => Ok(Self::from(user)),
            Ok(None) => Err(OwnerError::UnknownAccount(format!("uid {}", uid))),
            Err(e) => Err(OwnerError::Lookup {
                account: format!("uid {}", uid),
                reason: e.to_string(),
            }),
        }
    }

    /// Whether this account is the superuser
    pub fn is_superuser(&self) -> bool {
        self.uid == 0
    }
}

impl From<User> for Owner {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        }
    }
}

/// Resolves account names to owners
///
/// Production code uses [`SystemAccounts`]; tests substitute a resolver that
/// maps every account to the user running the test.
pub trait AccountResolver: Send + Sync {
    /// Resolve an account name
    fn resolve(&self, account: &str) -> Result<Owner, OwnerError>;
}

/// Account resolution against the system passwd database
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemAccounts;

impl AccountResolver for SystemAccounts {
    fn resolve(&self, account: &str) -> Result<Owner, OwnerError> {
        match User::from_name(account) {
            Ok(Some(user)) => Ok(Owner::from(user)),
            Ok(None) => Err(OwnerError::UnknownAccount(account.to_string())),
            Err(e) => Err(OwnerError::Lookup {
                account: account.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Ownership and mode of a file on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileFacts {
    /// Size in bytes
    pub len: u64,
    /// Permission bits (without file type)
    pub mode: u32,
    /// Owning uid
    pub uid: u32,
}

impl FileFacts {
    /// True when neither group nor others have any access
    pub fn is_owner_only(&self) -> bool {
        self.mode & 0o077 == 0
    }
}

/// Stat a file; `Ok(None)` when it does not exist
pub fn file_facts(path: &Path) -> io::Result<Option<FileFacts>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(FileFacts {
            len: meta.len(),
            mode: meta.mode() & 0o7777,
            uid: meta.uid(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Atomically replace `path` with `contents`, created with `mode` and owned by `owner`
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32, owner: &Owner) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    fs::create_dir_all(dir)?;

    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
    match fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(&tmp)?;
    // umask may have stripped bits from PUBLIC_MODE
    file.set_permissions(Permissions::from_mode(mode))?;
    chown_if_needed(&tmp, owner)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)
}

fn chown_if_needed(path: &Path, owner: &Owner) -> io::Result<()> {
    let euid = nix::unistd::geteuid().as_raw();
    let egid = nix::unistd::getegid().as_raw();
    if owner.uid == euid && owner.gid == egid {
        return Ok(());
    }
    nix::unistd::chown(
        path,
        Some(Uid::from_raw(owner.uid)),
        Some(Gid::from_raw(owner.gid)),
    )
    .map_err(io::Error::from)
}
