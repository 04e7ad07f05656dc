//! Error types shared across the crate.

use thiserror::Error;

/// Result type for all fallible operations in the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the coordination core.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown opcode, malformed payload, or a ray that violates the
    /// routing invariants. Fatal for the process that observes it.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A `ConnectionRequest` arrived from a worker id the coordinator has
    /// no record of.
    #[error("unexpected worker id: {0}")]
    UnexpectedWorker(u64),

    /// Static assignment could not place every treelet.
    #[error("unassigned treelets after static assignment")]
    UnassignedTreelets,

    /// Tile partitioning tried to halve an axis of length 1.
    #[error("tried to split a rectangle across an axis of length 1")]
    TileSplit,

    /// A scene object was requested that the dump does not contain.
    #[error("unknown scene object: {0}")]
    UnknownObject(String),

    /// The storage URI scheme is not one of `file`, `http`, `https`.
    #[error("unsupported storage backend: {0}")]
    StorageBackend(String),

    #[error("storage fetch failed: {0}")]
    StorageFetch(String),

    #[error("worker {0} disconnected")]
    WorkerDied(u64),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid address: {0}")]
    Address(String),
}
