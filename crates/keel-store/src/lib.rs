//! Storage collaborators for the Keel smart server.
//!
//! Defines the transport, repository and branch interfaces the protocol
//! core dispatches into, the token lock and write-group state machines,
//! revision graph queries, and an in-memory reference backend.

mod error;
mod graph;
mod lock;
pub mod memory;
mod revision;
mod search;
mod traits;

pub use error::StoreError;
pub use graph::{BreadthFirstSearcher, Graph};
pub use lock::TokenLock;
pub use memory::{MemoryBackend, MemoryBranch, MemoryRepository};
pub use revision::{RevisionId, NULL_REVISION};
pub use search::SearchResult;
pub use traits::{Backend, Branch, InsertOutcome, NetworkRecord, Repository, Transport};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
