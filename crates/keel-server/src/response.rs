//! Responses returned by request handlers.

use crate::Result;
use bytes::Bytes;
use std::fmt;

/// A lazily-produced response body: an iterator of byte chunks.
pub type BodyStream = Box<dyn Iterator<Item = Result<Bytes>> + Send>;

enum Body {
    None,
    Inline(Bytes),
    Stream(BodyStream),
}

/// A response to one smart protocol request.
///
/// Carries a status, an args tuple, and at most one of an inline body or
/// a lazily-produced body stream; the constructors make holding both
/// unrepresentable.
pub struct Response {
    successful: bool,
    args: Vec<Bytes>,
    body: Body,
}

impl Response {
    /// A successful response with no body.
    pub fn success(args: Vec<Bytes>) -> Self {
        Self {
            successful: true,
            args,
            body: Body::None,
        }
    }

    /// A successful response with an inline body.
    pub fn success_with_body(args: Vec<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            successful: true,
            args,
            body: Body::Inline(body.into()),
        }
    }

    /// A successful response whose body is produced lazily.
    pub fn success_with_stream(args: Vec<Bytes>, stream: BodyStream) -> Self {
        Self {
            successful: true,
            args,
            body: Body::Stream(stream),
        }
    }

    /// A failed response; `args` is the wire error tuple.
    pub fn failed(args: Vec<Bytes>) -> Self {
        Self {
            successful: false,
            args,
            body: Body::None,
        }
    }

    /// A failed response that still carries a body, for verbs whose
    /// clients always read one.
    pub fn failed_with_body(args: Vec<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            successful: false,
            args,
            body: Body::Inline(body.into()),
        }
    }

    /// True for `Successful` responses.
    pub fn is_successful(&self) -> bool {
        self.successful
    }

    /// The response args tuple.
    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// The inline body, if any.
    pub fn body(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Inline(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// True if this response carries a lazy body stream.
    pub fn has_body_stream(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Takes the body stream for draining to the transport.
    pub fn take_body_stream(&mut self) -> Option<BodyStream> {
        match std::mem::replace(&mut self.body, Body::None) {
            Body::Stream(stream) => Some(stream),
            other => {
                self.body = other;
                None
            }
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.successful { "Successful" } else { "Failed" };
        let args: Vec<String> = self
            .args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();
        let body = match &self.body {
            Body::None => "none".to_string(),
            Body::Inline(bytes) => format!("{} bytes", bytes.len()),
            Body::Stream(_) => "stream".to_string(),
        };
        write!(f, "<{status}Response args={args:?} body={body}>")
    }
}

impl PartialEq for Response {
    /// Streams never compare equal; everything else compares by value.
    fn eq(&self, other: &Self) -> bool {
        let bodies_equal = match (&self.body, &other.body) {
            (Body::None, Body::None) => true,
            (Body::Inline(a), Body::Inline(b)) => a == b,
            _ => false,
        };
        self.successful == other.successful && self.args == other.args && bodies_equal
    }
}
