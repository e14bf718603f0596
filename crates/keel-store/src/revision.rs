//! Revision identifiers.

use bytes::Bytes;
use std::fmt;

/// The sentinel id naming the empty revision at the root of every history.
pub const NULL_REVISION: &[u8] = b"null:";

/// An opaque revision identifier.
///
/// Revision ids are byte strings chosen by clients; the only id with
/// reserved meaning is [`NULL_REVISION`].
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionId(Bytes);

impl RevisionId {
    /// Creates a revision id from bytes.
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    /// The null revision sentinel.
    pub fn null() -> Self {
        Self(Bytes::from_static(NULL_REVISION))
    }

    /// Returns the raw id bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the id as shared bytes.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// True for the null revision sentinel.
    pub fn is_null(&self) -> bool {
        self.0 == NULL_REVISION
    }
}

impl From<&[u8]> for RevisionId {
    fn from(id: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(id))
    }
}

impl From<&str> for RevisionId {
    fn from(id: &str) -> Self {
        Self(Bytes::copy_from_slice(id.as_bytes()))
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionId({})", String::from_utf8_lossy(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_is_null() {
        assert!(RevisionId::null().is_null());
        assert!(!RevisionId::from("rev-1").is_null());
    }

    #[test]
    fn ordering_is_lexicographic() {
        let a = RevisionId::from("aaa");
        let b = RevisionId::from("bbb");
        assert!(a < b);
    }
}
