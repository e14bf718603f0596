//! Smart protocol request handlers for Keel.
//!
//! The server side of the smart protocol: a request dispatcher with a
//! per-request jail, token-based locking and resumable write groups,
//! ancestry-search negotiation, bounded parent-map expansion, and
//! record streaming over the pack container format, including the
//! threaded pipeline that feeds streamed inserts into storage.
//!
//! This crate speaks in decoded args and body chunks; the outer RPC
//! envelope (argument framing, transports, connections) lives elsewhere.

mod branch;
mod error;
mod estimate;
mod insert;
mod registry;
mod repository;
mod request;
mod response;
mod search;

pub use error::{translate_error, ServerError};
pub use estimate::ZlibEstimator;
pub use insert::StreamInserter;
pub use registry::{
    default_registry, set_vfs_enabled, vfs_enabled, Registry, ReplaySafety, VerbEntry,
};
pub use request::{Jail, RequestContext, RequestHandler, Verb};
pub use response::{BodyStream, Response};
pub use search::{parse_recipe, recreate_search, recreate_search_from_recipe, SearchRecipe};

/// Result type for smart server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
