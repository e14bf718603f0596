//! The self-delimited container format for record streams.
//!
//! A container is a format marker line, a sequence of framed byte records,
//! and a one-byte end marker. Each record carries a length, a list of name
//! tuples and an opaque body, so a reader can walk the stream without
//! understanding record contents.
//!
//! Wire grammar:
//!
//! ```text
//! container := format-line record* end-marker
//! format-line := "keel pack format 1" LF
//! record := "B" length LF (name-tuple LF)* LF body
//! name-tuple := name ("\x00" name)*
//! end-marker := "E"
//! ```

use crate::{PackError, Result};
use bytes::{BufMut, Bytes, BytesMut};

/// Marker line identifying the container format (without the newline).
pub const FORMAT_MARKER: &[u8] = b"keel pack format 1";

/// Bytes that may not appear in a record name.
fn invalid_name_byte(b: u8) -> bool {
    matches!(b, b'\t' | b'\n' | b'\x0b' | b'\x0c' | b'\r' | b' ')
}

fn check_name(name: &[u8]) -> Result<()> {
    if name.iter().copied().any(invalid_name_byte) {
        return Err(PackError::InvalidRecord(format!(
            "{:?} is not a valid name",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

/// One name tuple attached to a record.
pub type NameTuple = Vec<Bytes>;

/// A parsed container record: its name tuples and body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// The name tuples from the record header.
    pub names: Vec<NameTuple>,
    /// The record body.
    pub body: Bytes,
}

/// Serialises containers as plain byte strings.
///
/// Returns bytes from calls to [`begin`](Self::begin), [`end`](Self::end)
/// and [`bytes_record`](Self::bytes_record); the caller decides where they
/// go. For large bodies, build the header with
/// [`bytes_header`](Self::bytes_header) and stream the body separately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerSerializer;

impl ContainerSerializer {
    /// Creates a new serializer.
    pub fn new() -> Self {
        Self
    }

    /// Returns the bytes that begin a container.
    pub fn begin(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FORMAT_MARKER.len() + 1);
        buf.put_slice(FORMAT_MARKER);
        buf.put_u8(b'\n');
        buf.freeze()
    }

    /// Returns the bytes that finish a container.
    pub fn end(&self) -> Bytes {
        Bytes::from_static(b"E")
    }

    /// Returns the header for a record of `length` body bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PackError::InvalidRecord`] if a name contains whitespace.
    pub fn bytes_header(&self, length: usize, names: &[NameTuple]) -> Result<Bytes> {
        for name_tuple in names {
            for name in name_tuple {
                check_name(name)?;
            }
        }
        let mut buf = BytesMut::new();
        buf.put_u8(b'B');
        buf.put_slice(length.to_string().as_bytes());
        buf.put_u8(b'\n');
        for name_tuple in names {
            for (i, name) in name_tuple.iter().enumerate() {
                if i > 0 {
                    buf.put_u8(0);
                }
                buf.put_slice(name);
            }
            buf.put_u8(b'\n');
        }
        buf.put_u8(b'\n');
        Ok(buf.freeze())
    }

    /// Returns a complete record with the given body and names.
    pub fn bytes_record(&self, body: &[u8], names: &[NameTuple]) -> Result<Bytes> {
        let header = self.bytes_header(body.len(), names)?;
        let mut buf = BytesMut::with_capacity(header.len() + body.len());
        buf.put_slice(&header);
        buf.put_slice(body);
        Ok(buf.freeze())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    FormatLine,
    RecordKind,
    Length,
    Names,
    Body,
    Finished,
}

/// An incremental push parser for the container format.
///
/// Accepts arbitrarily-sized byte chunks via
/// [`accept_bytes`](Self::accept_bytes) and yields complete records from
/// [`read_pending_records`](Self::read_pending_records) as they become
/// available. Suitable for unbounded network input: only the bytes of the
/// record currently being assembled are buffered.
#[derive(Debug)]
pub struct PushParser {
    buffer: BytesMut,
    state: ParseState,
    pending: Vec<Record>,
    current_length: usize,
    current_names: Vec<NameTuple>,
}

impl PushParser {
    /// Creates a parser expecting the format marker line.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
            state: ParseState::FormatLine,
            pending: Vec::new(),
            current_length: 0,
            current_names: Vec::new(),
        }
    }

    /// Feeds more bytes to the parser.
    ///
    /// # Errors
    ///
    /// Returns a [`PackError`] if the stream is malformed. The parser is
    /// not usable after an error.
    pub fn accept_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        // Run the state machine until it stops consuming.
        while self.step()? {}
        Ok(())
    }

    /// Takes all records parsed so far.
    pub fn read_pending_records(&mut self) -> Vec<Record> {
        std::mem::take(&mut self.pending)
    }

    /// Returns true once the end marker has been consumed.
    pub fn is_finished(&self) -> bool {
        self.state == ParseState::Finished
    }

    /// Suggests how many bytes to read next: the remainder of the current
    /// record body when one is in flight, otherwise 16 KiB.
    pub fn read_size_hint(&self) -> usize {
        const HINT: usize = 16 * 1024;
        if self.state == ParseState::Body {
            let remaining = self.current_length.saturating_sub(self.buffer.len());
            return HINT.max(remaining);
        }
        HINT
    }

    /// Takes one newline-terminated line out of the buffer, or None if no
    /// complete line is buffered yet.
    fn consume_line(&mut self) -> Option<Bytes> {
        let pos = self.buffer.iter().position(|&b| b == b'\n')?;
        let line = self.buffer.split_to(pos).freeze();
        let _ = self.buffer.split_to(1);
        Some(line)
    }

    /// Advances the state machine one step; returns whether progress was
    /// made.
    fn step(&mut self) -> Result<bool> {
        match self.state {
            ParseState::FormatLine => {
                let Some(line) = self.consume_line() else {
                    return Ok(false);
                };
                if line != FORMAT_MARKER {
                    return Err(PackError::UnknownFormat(line.to_vec()));
                }
                self.state = ParseState::RecordKind;
                Ok(true)
            }
            ParseState::RecordKind => {
                if self.buffer.is_empty() {
                    return Ok(false);
                }
                let kind = self.buffer.split_to(1)[0];
                match kind {
                    b'B' => self.state = ParseState::Length,
                    b'E' => self.state = ParseState::Finished,
                    other => return Err(PackError::UnknownRecordKind(other)),
                }
                Ok(true)
            }
            ParseState::Length => {
                let Some(line) = self.consume_line() else {
                    return Ok(false);
                };
                let text = std::str::from_utf8(&line)
                    .map_err(|_| PackError::InvalidRecord(format!("{line:?} is not a valid length")))?;
                self.current_length = text
                    .parse()
                    .map_err(|_| PackError::InvalidRecord(format!("{text:?} is not a valid length")))?;
                self.state = ParseState::Names;
                Ok(true)
            }
            ParseState::Names => {
                let Some(line) = self.consume_line() else {
                    return Ok(false);
                };
                if line.is_empty() {
                    self.state = ParseState::Body;
                } else {
                    let mut parts = Vec::new();
                    for part in line.split(|&b| b == 0) {
                        check_name(part)?;
                        parts.push(Bytes::copy_from_slice(part));
                    }
                    self.current_names.push(parts);
                }
                Ok(true)
            }
            ParseState::Body => {
                if self.buffer.len() < self.current_length {
                    return Ok(false);
                }
                let body = self.buffer.split_to(self.current_length).freeze();
                self.pending.push(Record {
                    names: std::mem::take(&mut self.current_names),
                    body,
                });
                self.current_length = 0;
                self.state = ParseState::RecordKind;
                Ok(true)
            }
            ParseState::Finished => Ok(false),
        }
    }
}

impl Default for PushParser {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn record_body() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..512)
    }

    fn record_name() -> impl Strategy<Value = Vec<u8>> {
        // Printable, no whitespace.
        prop::collection::vec(0x21u8..0x7f, 1..16)
    }

    proptest! {
        /// Any sequence of records survives a round trip under arbitrary
        /// chunk boundaries.
        #[test]
        fn prop_roundtrip_chunked(
            bodies in prop::collection::vec((record_name(), record_body()), 0..8),
            chunk in 1usize..64,
        ) {
            let ser = ContainerSerializer::new();
            let mut data = Vec::new();
            data.extend_from_slice(&ser.begin());
            for (name, body) in &bodies {
                let names = vec![vec![Bytes::copy_from_slice(name)]];
                data.extend_from_slice(&ser.bytes_record(body, &names).unwrap());
            }
            data.extend_from_slice(&ser.end());

            let mut parser = PushParser::new();
            let mut records = Vec::new();
            for piece in data.chunks(chunk) {
                parser.accept_bytes(piece).unwrap();
                records.extend(parser.read_pending_records());
            }
            prop_assert!(parser.is_finished());
            prop_assert_eq!(records.len(), bodies.len());
            for (record, (name, body)) in records.iter().zip(&bodies) {
                prop_assert_eq!(record.body.as_ref(), body.as_slice());
                prop_assert_eq!(record.names[0][0].as_ref(), name.as_slice());
            }
        }

        /// Arbitrary input never panics the parser.
        #[test]
        fn prop_garbage_no_panic(data in prop::collection::vec(any::<u8>(), 0..1024)) {
            let mut parser = PushParser::new();
            let _ = parser.accept_bytes(&data);
        }
    }
}
