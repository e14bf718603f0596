//! Collaborator interfaces consumed by the smart server.
//!
//! The server core never touches storage directly: it talks to these
//! traits. The in-memory backend in [`crate::memory`] is the reference
//! implementation; a real disk-backed engine would plug in the same way.

use crate::graph::Graph;
use crate::revision::RevisionId;
use crate::search::SearchResult;
use crate::Result;
use bytes::Bytes;
use keel_pack::StreamRecord;
use std::sync::Arc;

/// A byte transport rooted at some base location.
pub trait Transport: Send + Sync {
    /// The absolute base of this transport, e.g. `memory:///branch`.
    fn base(&self) -> String;

    /// Returns a transport rooted at `relpath` below this one.
    fn clone_path(&self, relpath: &str) -> Result<Arc<dyn Transport>>;

    /// True if writes through this transport are refused.
    fn is_readonly(&self) -> bool;

    /// True if this transport can hold physical locks.
    fn supports_locking(&self) -> bool {
        true
    }
}

/// One logical record arriving in (or leaving by) a record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkRecord {
    /// The substream kind, e.g. `revisions`.
    pub kind: Bytes,
    /// Key parts identifying the record.
    pub key: Vec<Bytes>,
    /// The serialized record body.
    pub body: Bytes,
}

/// The result of inserting a record stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Everything was applied.
    Complete,
    /// The insert could only partially complete: base data was absent.
    /// The write group was suspended for a later resume.
    MissingBasis {
        /// Tokens for the suspended write group.
        tokens: Vec<String>,
        /// The absent `(kind, revision)` keys, sorted.
        missing: Vec<(Bytes, RevisionId)>,
    },
}

/// A repository of revisions with token locking and write groups.
pub trait Repository: Send + Sync {
    /// Acquires the write lock; see [`crate::lock::TokenLock::lock_write`].
    fn lock_write(&self, token: Option<&str>) -> Result<String>;

    /// Releases one lock acquisition.
    fn unlock(&self) -> Result<()>;

    /// Keeps the physical lock across the final unlock.
    fn leave_lock_in_place(&self);

    /// Releases the physical lock on the final unlock.
    fn dont_leave_lock_in_place(&self);

    /// Forcibly breaks any physical lock.
    fn break_lock(&self) -> Result<()>;

    /// True while a physical lock is held.
    fn get_physical_lock_status(&self) -> bool;

    /// The network name of this repository's format, sent as the leading
    /// record of every outgoing record stream.
    fn network_format_name(&self) -> Bytes;

    /// Returns a snapshot of the revision graph.
    fn get_graph(&self) -> Graph;

    /// All revision ids present, unsorted.
    fn all_revision_ids(&self) -> Vec<RevisionId>;

    /// True if the revision is present.
    fn has_revision(&self, revision: &RevisionId) -> bool;

    /// Starts a write group. The write lock must be held.
    fn start_write_group(&self) -> Result<()>;

    /// Suspends the active write group, returning its resume tokens.
    fn suspend_write_group(&self) -> Result<Vec<String>>;

    /// Resumes suspended write groups from `tokens`, atomically: either
    /// the exact state is restored or nothing changes.
    fn resume_write_group(&self, tokens: &[String]) -> Result<()>;

    /// Commits the active write group.
    fn commit_write_group(&self) -> Result<()>;

    /// Discards the active write group.
    fn abort_write_group(&self) -> Result<()>;

    /// Inserts a record stream, resuming from `resume_tokens` if any.
    ///
    /// On success either everything committed, or the group was suspended
    /// because basis data is missing (see [`InsertOutcome`]).
    fn insert_stream(
        &self,
        records: &mut dyn Iterator<Item = Result<NetworkRecord>>,
        resume_tokens: &[String],
    ) -> Result<InsertOutcome>;

    /// Builds the substreams covering a resolved search.
    fn get_stream(&self, search: &SearchResult) -> Result<Vec<(Bytes, Vec<StreamRecord>)>>;

    /// Builds the substreams for specific `(kind, revision)` keys.
    fn get_stream_for_missing_keys(
        &self,
        keys: &[(Bytes, RevisionId)],
    ) -> Result<Vec<(Bytes, Vec<StreamRecord>)>>;
}

/// A named line of development: a pointer into a repository's graph.
///
/// Branch locks pair with the repository lock: acquiring the branch write
/// lock also acquires the repository lock, and unlocking releases both.
pub trait Branch: Send + Sync {
    /// The repository this branch points into.
    fn repository(&self) -> Arc<dyn Repository>;

    /// Locks the branch (and its repository) for write; returns the
    /// branch token.
    fn lock_write(&self, token: Option<&str>) -> Result<String>;

    /// Releases one branch lock acquisition and its repository pair.
    fn unlock(&self) -> Result<()>;

    /// Keeps the physical branch lock across the final unlock.
    fn leave_lock_in_place(&self);

    /// Releases the physical branch lock on the final unlock.
    fn dont_leave_lock_in_place(&self);

    /// Forcibly breaks any physical lock.
    fn break_lock(&self) -> Result<()>;

    /// True while a physical lock is held.
    fn get_physical_lock_status(&self) -> bool;

    /// The current `(revno, revision)` tip.
    fn last_revision_info(&self) -> (u64, RevisionId);

    /// Moves the tip. The branch must be write-locked.
    fn set_last_revision_info(&self, revno: u64, revision: RevisionId) -> Result<()>;
}

/// Opens repositories and branches from transports.
pub trait Backend: Send + Sync {
    /// Opens the repository at the transport's location.
    fn open_repository(&self, transport: &dyn Transport) -> Result<Arc<dyn Repository>>;

    /// Opens the branch at the transport's location.
    fn open_branch(&self, transport: &dyn Transport) -> Result<Arc<dyn Branch>>;
}
