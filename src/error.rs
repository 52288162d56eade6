// src/error.rs

//! Error types for strata
//!
//! The buildcache errors form a family: `BuildcacheEntry` is the generic
//! remote-entry problem and `NoSuchBlob`, `NoVerify` and
//! `UnknownBuildcacheLayout` are its specializations. Callers that only care
//! whether a remote entry was usable should match on
//! [`Error::is_buildcache_entry_error`] instead of individual variants.

use thiserror::Error;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in strata operations
#[derive(Error, Debug)]
pub enum Error {
    /// A remote buildcache entry is unreadable, malformed or of the wrong version
    #[error("buildcache entry error: {0}")]
    BuildcacheEntry(String),

    /// A manifest has no blob of the requested type, or the blob is missing remotely
    #[error("no such blob: {0}")]
    NoSuchBlob(String),

    /// Signature verification failed or a required signature is absent
    #[error("signature verification failed: {0}")]
    NoVerify(String),

    /// No entry implementation exists for the requested layout version
    #[error("unknown buildcache layout version: {0}")]
    UnknownBuildcacheLayout(u32),

    /// Batch-level migration failure (no index, no signing key, ...)
    #[error("migration failed: {0}")]
    Migration(String),

    /// Batch-level pruning failure
    #[error("pruning failed: {0}")]
    BuildcachePruning(String),

    /// The keep-list given to direct pruning is malformed or empty
    #[error("malformed keeplist: {0}")]
    MalformedKeepList(String),

    /// A spec that was asked to be pushed is not installed (fail-fast mode)
    #[error("package is not installed: {0}")]
    PackageNotInstalled(String),

    /// Specs that were asked to be pushed but are not installed (best-effort mode)
    #[error("the following packages are not installed: {}", .0.join(", "))]
    PackagesAreNotInstalled(Vec<String>),

    /// Jobserver setup or protocol failure
    #[error("jobserver error: {0}")]
    Jobserver(String),

    /// One or more builds failed
    #[error("{0}")]
    InstallFailed(String),

    /// The installer was interrupted
    #[error("interrupted")]
    Interrupted,

    /// Key management or signing failure
    #[error("signing error: {0}")]
    Signing(String),

    /// Transport failure talking to a mirror
    #[error("web error: {0}")]
    Web(String),

    /// Object not found on a mirror
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid or inconsistent spec metadata
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Configuration problem
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// TOML parse error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// System call failure
    #[error("system error: {0}")]
    Nix(#[from] nix::Error),
}

impl Error {
    /// Whether this error belongs to the buildcache entry family
    pub fn is_buildcache_entry_error(&self) -> bool {
        matches!(
            self,
            Self::BuildcacheEntry(_)
                | Self::NoSuchBlob(_)
                | Self::NoVerify(_)
                | Self::UnknownBuildcacheLayout(_)
        )
    }

    /// Whether this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_error_family() {
        assert!(Error::BuildcacheEntry("x".into()).is_buildcache_entry_error());
        assert!(Error::NoSuchBlob("x".into()).is_buildcache_entry_error());
        assert!(Error::NoVerify("x".into()).is_buildcache_entry_error());
        assert!(Error::UnknownBuildcacheLayout(7).is_buildcache_entry_error());
        assert!(!Error::Migration("x".into()).is_buildcache_entry_error());
    }

    #[test]
    fn test_not_installed_message_lists_all() {
        let err = Error::PackagesAreNotInstalled(vec!["zlib".into(), "bzip2".into()]);
        assert_eq!(
            err.to_string(),
            "the following packages are not installed: zlib, bzip2"
        );
    }

    #[test]
    fn test_io_not_found() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_not_found());
        assert!(!Error::Web("timeout".into()).is_not_found());
    }
}
