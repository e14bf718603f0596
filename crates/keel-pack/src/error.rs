//! Pack container error types.

use thiserror::Error;

/// Errors that can occur while reading or writing pack containers.
#[derive(Debug, Error)]
pub enum PackError {
    /// The stream did not start with the expected format marker line.
    #[error("unrecognised container format: {0:?}")]
    UnknownFormat(Vec<u8>),

    /// The stream ended before the container was complete.
    #[error("unexpected end of container stream")]
    UnexpectedEnd,

    /// A record kind byte other than `B` or `E` was seen.
    #[error("unknown record kind: {0:#04x}")]
    UnknownRecordKind(u8),

    /// A record header, length or name was malformed.
    #[error("invalid record: {0}")]
    InvalidRecord(String),
}
