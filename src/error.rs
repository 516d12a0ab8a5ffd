//! Error types shared by the agent's components.

use std::path::PathBuf;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The metadata service holds no principal under this id.
    #[error("principal not found: {0}")]
    PrincipalNotFound(String),

    /// A metadata service call failed. The message is opaque; callers only
    /// branch on success or failure.
    #[error("metadata request failed: {0}")]
    Metadata(String),

    /// Installing or removing packet-filtering rules failed.
    #[error("sandbox command failed: {0}")]
    Sandbox(String),

    /// Every static port slot is taken.
    #[error("no static port slot available ({slots} slots)")]
    NoSlotAvailable { slots: usize },

    /// No attached network owns the address.
    #[error("no attached network owns ip {0}")]
    NamespaceNotFound(String),

    #[error("port alias already exists: {0}")]
    PortAliasExists(String),

    #[error("port alias not found: {0}")]
    PortAliasNotFound(String),

    /// A runtime state file the caller needs is absent.
    #[error("missing runtime file {0}")]
    ConfigMissing(PathBuf),

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Image content does not hash to its id.
    #[error("image {id} has content digest {actual}")]
    DigestMismatch { id: String, actual: String },

    /// The container runtime could not be queried.
    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Watch(#[from] notify::Error),
}

impl Error {
    /// True when the error is the service's "no such principal" answer.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::PrincipalNotFound(_))
    }
}
