//! Pack container format for Keel record streams.
//!
//! This crate implements the self-delimited container used to move record
//! streams over the smart protocol: a serializer, an incremental push
//! parser that accepts arbitrarily-chunked input, and a stream layer that
//! groups container records back into typed substreams.

mod container;
mod error;
mod stream;

pub use container::{ContainerSerializer, NameTuple, PushParser, Record, FORMAT_MARKER};
pub use error::PackError;
pub use stream::{encode_stream, EncodeStream, StreamDecoder, StreamRecord, Substream};

/// Result type for pack container operations.
pub type Result<T> = std::result::Result<T, PackError>;
