//! Server error taxonomy and the wire error translator.
//!
//! Every failure inside a request handler is recovered at the dispatch
//! boundary and turned into a `Failed` response whose args are the wire
//! error tuple produced here. Nothing in this crate is fatal to the
//! server process.

use bytes::Bytes;
use keel_pack::PackError;
use keel_store::StoreError;
use thiserror::Error;
use tracing::error;

/// Errors raised by the smart server core.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The request named a verb nobody registered.
    #[error("unknown smart protocol verb {0:?}")]
    UnknownVerb(String),

    /// The verb exists but has been disabled.
    #[error("the smart server verb {0:?} is disabled")]
    DisabledVerb(String),

    /// The request was malformed at the protocol level.
    #[error("smart protocol error: {0}")]
    Protocol(String),

    /// A search recipe used an unknown keyword.
    #[error("bad search recipe")]
    BadSearch,

    /// A search produced a different number of revisions than the client
    /// declared. Reported as `NoSuchRevision`: fewer revisions means
    /// missing data, and more cannot happen when the exclude list is
    /// honest.
    #[error("search produced {actual} revisions, expected {expected}")]
    SearchCountMismatch {
        /// The count the client declared.
        expected: usize,
        /// The count the search produced.
        actual: usize,
    },

    /// A request tried to resolve a path outside its jail.
    #[error("jail break: {path}")]
    JailBreak {
        /// The escaping path.
        path: String,
    },

    /// A tip change would diverge from the current branch history.
    #[error("branches have diverged")]
    Diverged,

    /// A storage collaborator failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The pack codec failed.
    #[error(transparent)]
    Pack(#[from] PackError),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn tuple(parts: &[&[u8]]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
}

/// The qualified name used for errors with no dedicated wire tuple.
fn error_kind(err: &ServerError) -> &'static str {
    match err {
        ServerError::UnknownVerb(_) => "UnknownMethod",
        ServerError::DisabledVerb(_) => "DisabledMethod",
        ServerError::Protocol(_) => "SmartProtocolError",
        ServerError::BadSearch => "BadSearch",
        ServerError::SearchCountMismatch { .. } => "NoSuchRevision",
        ServerError::JailBreak { .. } => "JailBreak",
        ServerError::Diverged => "Diverged",
        ServerError::Pack(_) => "ContainerError",
        ServerError::Io(_) => "IoError",
        ServerError::Store(err) => match err {
            StoreError::LockContention { .. } => "LockContention",
            StoreError::TokenMismatch { .. } => "TokenMismatch",
            StoreError::LockFailed { .. } => "LockFailed",
            StoreError::UnlockableTransport => "UnlockableTransport",
            StoreError::NotLocked => "NotLocked",
            StoreError::UnresumableWriteGroup { .. } => "UnresumableWriteGroup",
            StoreError::UnsuspendableWriteGroup => "UnsuspendableWriteGroup",
            StoreError::WriteGroupActive => "WriteGroupActive",
            StoreError::NoWriteGroup => "NoWriteGroup",
            StoreError::NoSuchRevision(_) => "NoSuchRevision",
            StoreError::GhostRevisionsHaveNoRevno { .. } => "GhostRevisionsHaveNoRevno",
            StoreError::NoSuchFile { .. } => "NoSuchFile",
            StoreError::FileExists { .. } => "FileExists",
            StoreError::DirectoryNotEmpty { .. } => "DirectoryNotEmpty",
            StoreError::PermissionDenied { .. } => "PermissionDenied",
            StoreError::ReadOnly => "ReadOnlyError",
            StoreError::PathNotChild { .. } => "PathNotChild",
            StoreError::NotBranch { .. } => "NotBranchError",
            StoreError::Pack(_) => "ContainerError",
            StoreError::InvalidRecord(_) => "InvalidRecord",
        },
    }
}

/// Maps an error onto its wire tuple: the error tag followed by its
/// diagnostic args, all byte strings.
pub fn translate_error(err: &ServerError) -> Vec<Bytes> {
    match err {
        ServerError::UnknownVerb(verb) => tuple(&[b"UnknownMethod", verb.as_bytes()]),
        ServerError::DisabledVerb(verb) => tuple(&[b"DisabledMethod", verb.as_bytes()]),
        ServerError::BadSearch => tuple(&[b"BadSearch"]),
        ServerError::SearchCountMismatch { .. } => tuple(&[b"NoSuchRevision"]),
        ServerError::JailBreak { path } => tuple(&[b"JailBreak", path.as_bytes()]),
        ServerError::Diverged => tuple(&[b"Diverged"]),
        ServerError::Store(store_err) => match store_err {
            StoreError::LockContention { .. } => tuple(&[b"LockContention"]),
            StoreError::TokenMismatch { given, lock } => {
                tuple(&[b"TokenMismatch", given.as_bytes(), lock.as_bytes()])
            }
            StoreError::LockFailed { lock, why } => {
                tuple(&[b"LockFailed", lock.as_bytes(), why.as_bytes()])
            }
            StoreError::UnlockableTransport => tuple(&[b"UnlockableTransport"]),
            StoreError::UnresumableWriteGroup { tokens, reason } => tuple(&[
                b"UnresumableWriteGroup",
                tokens.join(" ").as_bytes(),
                reason.as_bytes(),
            ]),
            StoreError::UnsuspendableWriteGroup => tuple(&[b"UnsuspendableWriteGroup"]),
            StoreError::NoSuchRevision(revision) => {
                tuple(&[b"NoSuchRevision", revision.as_bytes()])
            }
            StoreError::GhostRevisionsHaveNoRevno { revision, ghost } => tuple(&[
                b"GhostRevisionsHaveNoRevno",
                revision.as_bytes(),
                ghost.as_bytes(),
            ]),
            StoreError::NoSuchFile { path } => tuple(&[b"NoSuchFile", path.as_bytes()]),
            StoreError::FileExists { path } => tuple(&[b"FileExists", path.as_bytes()]),
            StoreError::DirectoryNotEmpty { path } => {
                tuple(&[b"DirectoryNotEmpty", path.as_bytes()])
            }
            StoreError::PermissionDenied { path, reason } => {
                tuple(&[b"PermissionDenied", path.as_bytes(), reason.as_bytes()])
            }
            StoreError::ReadOnly => tuple(&[b"ReadOnlyError"]),
            StoreError::PathNotChild { path, base } => {
                tuple(&[b"PathNotChild", path.as_bytes(), base.as_bytes()])
            }
            other => generic_tuple(err, other.to_string()),
        },
        other => generic_tuple(other, other.to_string()),
    }
}

/// The catch-all `error` tuple: kind name plus message, logged
/// server-side because the client only sees the summary.
fn generic_tuple(err: &ServerError, message: String) -> Vec<Bytes> {
    error!(kind = error_kind(err), %message, "unclassified smart server error");
    vec![
        Bytes::from_static(b"error"),
        Bytes::copy_from_slice(error_kind(err).as_bytes()),
        Bytes::from(message.into_bytes()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_store::RevisionId;

    #[test]
    fn unknown_verb_tuple() {
        let err = ServerError::UnknownVerb("Bogus.Verb".to_string());
        let tuple = translate_error(&err);
        assert_eq!(tuple[0].as_ref(), b"UnknownMethod");
        assert_eq!(tuple[1].as_ref(), b"Bogus.Verb");
    }

    #[test]
    fn lock_errors_translate_to_bare_and_detailed_tuples() {
        let contention = ServerError::Store(StoreError::LockContention {
            lock: "branch".into(),
        });
        assert_eq!(translate_error(&contention), vec![Bytes::from_static(b"LockContention")]);

        let mismatch = ServerError::Store(StoreError::TokenMismatch {
            given: "abc".into(),
            lock: "def".into(),
        });
        let tuple = translate_error(&mismatch);
        assert_eq!(tuple[0].as_ref(), b"TokenMismatch");
        assert_eq!(tuple[1].as_ref(), b"abc");
        assert_eq!(tuple[2].as_ref(), b"def");
    }

    #[test]
    fn unresumable_write_group_carries_tokens_and_reason() {
        let err = ServerError::Store(StoreError::UnresumableWriteGroup {
            tokens: vec!["t1".into(), "t2".into()],
            reason: "unknown token".into(),
        });
        let tuple = translate_error(&err);
        assert_eq!(tuple[0].as_ref(), b"UnresumableWriteGroup");
        assert_eq!(tuple[1].as_ref(), b"t1 t2");
        assert_eq!(tuple[2].as_ref(), b"unknown token");
    }

    #[test]
    fn count_mismatch_is_no_such_revision() {
        let err = ServerError::SearchCountMismatch {
            expected: 3,
            actual: 2,
        };
        assert_eq!(translate_error(&err), vec![Bytes::from_static(b"NoSuchRevision")]);
    }

    #[test]
    fn no_such_revision_carries_the_id() {
        let err = ServerError::Store(StoreError::NoSuchRevision(RevisionId::from("rev-1")));
        let tuple = translate_error(&err);
        assert_eq!(tuple[0].as_ref(), b"NoSuchRevision");
        assert_eq!(tuple[1].as_ref(), b"rev-1");
    }

    #[test]
    fn unclassified_errors_keep_kind_and_message() {
        let err = ServerError::Store(StoreError::NotBranch {
            path: "memory:///x".into(),
        });
        let tuple = translate_error(&err);
        assert_eq!(tuple[0].as_ref(), b"error");
        assert_eq!(tuple[1].as_ref(), b"NotBranchError");
        assert!(std::str::from_utf8(&tuple[2]).unwrap().contains("memory:///x"));
    }
}
