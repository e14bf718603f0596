//! Storage error types.

use crate::revision::RevisionId;
use keel_pack::PackError;
use thiserror::Error;

/// Errors surfaced by storage collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The lock is held by another client.
    #[error("could not acquire lock {lock}: held by another client")]
    LockContention {
        /// Description of the contended lock.
        lock: String,
    },

    /// A supplied lock token did not match the live lock.
    #[error("token {given:?} does not match lock token {lock:?}")]
    TokenMismatch {
        /// The token supplied by the caller.
        given: String,
        /// The token of the live lock, empty if unlocked.
        lock: String,
    },

    /// The lock could not be taken at the I/O level.
    #[error("cannot lock {lock}: {why}")]
    LockFailed {
        /// Description of the lock.
        lock: String,
        /// Diagnostic text from the transport.
        why: String,
    },

    /// The transport does not support locking at all.
    #[error("transport does not support locking")]
    UnlockableTransport,

    /// An unlock or lock-requiring operation found no lock held.
    #[error("lock not held")]
    NotLocked,

    /// A write group could not be resumed from the given token set.
    #[error("write group cannot be resumed from {tokens:?}: {reason}")]
    UnresumableWriteGroup {
        /// The tokens the caller presented.
        tokens: Vec<String>,
        /// Why the resume failed.
        reason: String,
    },

    /// The active write group cannot be suspended.
    #[error("write group cannot be suspended")]
    UnsuspendableWriteGroup,

    /// A write group is already active.
    #[error("a write group is already active")]
    WriteGroupActive,

    /// No write group is active.
    #[error("no write group is active")]
    NoWriteGroup,

    /// The revision is not present in the repository.
    #[error("no such revision: {0}")]
    NoSuchRevision(RevisionId),

    /// A ghost revision was reached while counting revision numbers.
    #[error("ghost revision {ghost} in the history of {revision} has no revision number")]
    GhostRevisionsHaveNoRevno {
        /// The revision whose history was being counted.
        revision: RevisionId,
        /// The ghost that interrupted the count.
        ghost: RevisionId,
    },

    /// A path was not found.
    #[error("no such file: {path}")]
    NoSuchFile {
        /// The missing path.
        path: String,
    },

    /// A path unexpectedly exists.
    #[error("file exists: {path}")]
    FileExists {
        /// The offending path.
        path: String,
    },

    /// A directory could not be removed because it has contents.
    #[error("directory not empty: {path}")]
    DirectoryNotEmpty {
        /// The offending path.
        path: String,
    },

    /// Access to a path was denied.
    #[error("permission denied: {path}: {reason}")]
    PermissionDenied {
        /// The offending path.
        path: String,
        /// Why access was denied.
        reason: String,
    },

    /// The transport is read-only.
    #[error("transport is read-only")]
    ReadOnly,

    /// A path is not a descendant of the base it was resolved against.
    #[error("path {path:?} is not a child of {base:?}")]
    PathNotChild {
        /// The resolved path.
        path: String,
        /// The base it escaped.
        base: String,
    },

    /// No branch lives at the path.
    #[error("not a branch: {path}")]
    NotBranch {
        /// The path that was probed.
        path: String,
    },

    /// The record stream being inserted was corrupt.
    #[error("corrupt record stream: {0}")]
    Pack(#[from] PackError),

    /// A record body could not be understood.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
