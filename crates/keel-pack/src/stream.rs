//! Encoding and decoding of typed record streams as container byte
//! streams.
//!
//! A record stream is a sequence of substreams, each a run of records of
//! one logical kind. On the wire the whole stream is one container: a
//! leading record naming the source format, then one record per item
//! tagged with its substream kind, then the end marker. The decoder works
//! incrementally over arbitrarily-chunked input and hands back one
//! substream at a time, buffering a single record of lookahead to detect
//! the kind change.

use crate::container::{ContainerSerializer, PushParser, Record};
use crate::{PackError, Result};
use bytes::Bytes;
use std::collections::VecDeque;

/// One logical record in a typed substream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Key parts identifying the record within its substream.
    pub key: Vec<Bytes>,
    /// The serialized record body.
    pub body: Bytes,
}

impl StreamRecord {
    /// Creates a record from a single key part and body.
    pub fn new(key: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            key: vec![key.into()],
            body: body.into(),
        }
    }
}

/// A lazily-encoded container byte stream for a record stream.
///
/// Yields the begin marker, a record naming the source format, one record
/// per stream item, and the end marker. Records with an empty serialized
/// body are skipped: some record kinds embed an entire multi-record
/// stream in the wire form of their first element, leaving the rest with
/// no wire form of their own.
pub struct EncodeStream<I>
where
    I: Iterator<Item = (Bytes, Vec<StreamRecord>)>,
{
    serializer: ContainerSerializer,
    format_name: Option<Bytes>,
    substreams: I,
    current: Option<(Bytes, std::vec::IntoIter<StreamRecord>)>,
    begun: bool,
    done: bool,
}

/// Encodes `substreams` into a container byte stream.
pub fn encode_stream<I>(format_name: Bytes, substreams: I) -> EncodeStream<I::IntoIter>
where
    I: IntoIterator<Item = (Bytes, Vec<StreamRecord>)>,
{
    EncodeStream {
        serializer: ContainerSerializer::new(),
        format_name: Some(format_name),
        substreams: substreams.into_iter(),
        current: None,
        begun: false,
        done: false,
    }
}

impl<I> Iterator for EncodeStream<I>
where
    I: Iterator<Item = (Bytes, Vec<StreamRecord>)>,
{
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.begun {
            self.begun = true;
            return Some(Ok(self.serializer.begin()));
        }
        if let Some(name) = self.format_name.take() {
            return Some(self.serializer.bytes_record(&name, &[]));
        }
        loop {
            if let Some((kind, records)) = &mut self.current {
                for record in records.by_ref() {
                    if record.body.is_empty() {
                        continue;
                    }
                    let mut name = Vec::with_capacity(1 + record.key.len());
                    name.push(kind.clone());
                    name.extend(record.key);
                    return Some(self.serializer.bytes_record(&record.body, &[name]));
                }
                self.current = None;
            }
            match self.substreams.next() {
                Some((kind, records)) => {
                    self.current = Some((kind, records.into_iter()));
                }
                None => {
                    self.done = true;
                    return Some(Ok(self.serializer.end()));
                }
            }
        }
    }
}

/// Decodes a container byte stream back into typed substreams.
///
/// Input arrives as an iterator of byte chunks with arbitrary boundaries;
/// only one record of lookahead is ever buffered beyond what the push
/// parser holds, so unbounded streams decode in constant memory.
pub struct StreamDecoder<I>
where
    I: Iterator<Item = Bytes>,
{
    parser: PushParser,
    chunks: I,
    pending: VecDeque<Record>,
    lookahead: Option<(Bytes, StreamRecord)>,
}

impl<I> StreamDecoder<I>
where
    I: Iterator<Item = Bytes>,
{
    /// Creates a decoder over a chunked byte stream.
    pub fn new(chunks: I) -> Self {
        Self {
            parser: PushParser::new(),
            chunks,
            pending: VecDeque::new(),
            lookahead: None,
        }
    }

    /// Reads the leading record naming the source format.
    ///
    /// Must be called once, before any substream is read.
    pub fn read_format_name(&mut self) -> Result<Bytes> {
        match self.next_container_record()? {
            Some(record) => Ok(record.body),
            None => Err(PackError::UnexpectedEnd),
        }
    }

    /// Pulls the next raw container record, feeding chunks as needed.
    fn next_container_record(&mut self) -> Result<Option<Record>> {
        loop {
            if let Some(record) = self.pending.pop_front() {
                return Ok(Some(record));
            }
            if self.parser.is_finished() {
                return Ok(None);
            }
            match self.chunks.next() {
                Some(chunk) => {
                    self.parser.accept_bytes(&chunk)?;
                    self.pending.extend(self.parser.read_pending_records());
                }
                None => {
                    // Input dried up before the end marker: the container
                    // is incomplete.
                    return Err(PackError::UnexpectedEnd);
                }
            }
        }
    }

    /// Pulls the next `(kind, record)` pair, honoring the lookahead slot.
    fn pull(&mut self) -> Result<Option<(Bytes, StreamRecord)>> {
        if let Some(item) = self.lookahead.take() {
            return Ok(Some(item));
        }
        match self.next_container_record()? {
            None => Ok(None),
            Some(record) => {
                let name = record
                    .names
                    .first()
                    .and_then(|tuple| (!tuple.is_empty()).then(|| tuple.clone()))
                    .ok_or_else(|| {
                        PackError::InvalidRecord("stream record without a kind tag".to_string())
                    })?;
                let kind = name[0].clone();
                let key = name[1..].to_vec();
                Ok(Some((
                    kind,
                    StreamRecord {
                        key,
                        body: record.body,
                    },
                )))
            }
        }
    }

    /// Returns the next substream, or None at the end of the container.
    ///
    /// The previous substream must be drained before calling this again;
    /// an undrained substream resumes where it left off.
    pub fn next_substream(&mut self) -> Result<Option<Substream<'_, I>>> {
        match self.pull()? {
            None => Ok(None),
            Some((kind, record)) => {
                let current = kind.clone();
                self.lookahead = Some((kind, record));
                Ok(Some(Substream {
                    decoder: self,
                    kind: current,
                }))
            }
        }
    }

    /// Returns the next record with its substream kind, ignoring grouping.
    ///
    /// This is the flattened view used by the streaming-insert pipeline;
    /// record order is identical to [`next_substream`](Self::next_substream)
    /// traversal.
    pub fn next_keyed_record(&mut self) -> Result<Option<(Bytes, StreamRecord)>> {
        self.pull()
    }
}

/// A borrowed iterator over the records of one substream.
pub struct Substream<'a, I>
where
    I: Iterator<Item = Bytes>,
{
    decoder: &'a mut StreamDecoder<I>,
    kind: Bytes,
}

impl<I> Substream<'_, I>
where
    I: Iterator<Item = Bytes>,
{
    /// The kind shared by every record of this substream.
    pub fn kind(&self) -> &Bytes {
        &self.kind
    }

    /// Returns the next record, or None when the substream ends (either
    /// the container is exhausted or a record of a different kind was
    /// seen and pushed back).
    pub fn next_record(&mut self) -> Result<Option<StreamRecord>> {
        match self.decoder.pull()? {
            None => Ok(None),
            Some((kind, record)) => {
                if kind == self.kind {
                    Ok(Some(record))
                } else {
                    self.decoder.lookahead = Some((kind, record));
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_to_bytes(substreams: Vec<(Bytes, Vec<StreamRecord>)>) -> Vec<Bytes> {
        encode_stream(Bytes::from_static(b"fmt-1"), substreams)
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    fn decode_groups(chunks: Vec<Bytes>) -> (Bytes, Vec<(Bytes, Vec<StreamRecord>)>) {
        let mut decoder = StreamDecoder::new(chunks.into_iter());
        let format = decoder.read_format_name().unwrap();
        let mut groups = Vec::new();
        while let Some(mut substream) = decoder.next_substream().unwrap() {
            let kind = substream.kind().clone();
            let mut records = Vec::new();
            while let Some(record) = substream.next_record().unwrap() {
                records.push(record);
            }
            groups.push((kind, records));
        }
        (format, groups)
    }

    fn rebyte(chunks: Vec<Bytes>) -> Vec<Bytes> {
        // Re-chunk at single-byte boundaries to exercise incremental decode.
        chunks
            .iter()
            .flat_map(|c| c.iter().copied())
            .map(|b| Bytes::copy_from_slice(&[b]))
            .collect()
    }

    #[test]
    fn test_roundtrip_empty_stream() {
        let chunks = encode_to_bytes(vec![]);
        let (format, groups) = decode_groups(chunks);
        assert_eq!(format.as_ref(), b"fmt-1");
        assert!(groups.is_empty());
    }

    #[test]
    fn test_roundtrip_multiple_substreams() {
        let r1 = StreamRecord::new(&b"k1"[..], &b"body one"[..]);
        let r2 = StreamRecord::new(&b"k2"[..], &b"body two"[..]);
        let r3 = StreamRecord::new(&b"k3"[..], &b"delta"[..]);
        let substreams = vec![
            (Bytes::from_static(b"text"), vec![]),
            (Bytes::from_static(b"text"), vec![r1.clone(), r2.clone()]),
            (Bytes::from_static(b"inventory-deltas"), vec![r3.clone()]),
        ];
        let chunks = encode_to_bytes(substreams);
        let (_, groups) = decode_groups(chunks);
        // The empty substream has no wire form, and adjacent records of
        // one kind always group together.
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0.as_ref(), b"text");
        assert_eq!(groups[0].1, vec![r1, r2]);
        assert_eq!(groups[1].0.as_ref(), b"inventory-deltas");
        assert_eq!(groups[1].1, vec![r3]);
    }

    #[test]
    fn test_roundtrip_single_record() {
        let r = StreamRecord::new(&b"key"[..], &b"payload"[..]);
        let chunks = encode_to_bytes(vec![(Bytes::from_static(b"revisions"), vec![r.clone()])]);
        let (_, groups) = decode_groups(chunks);
        assert_eq!(groups, vec![(Bytes::from_static(b"revisions"), vec![r])]);
    }

    #[test]
    fn test_decode_one_byte_chunks() {
        let r1 = StreamRecord::new(&b"a"[..], &b"first"[..]);
        let r2 = StreamRecord::new(&b"b"[..], &b"second"[..]);
        let chunks = encode_to_bytes(vec![
            (Bytes::from_static(b"texts"), vec![r1.clone()]),
            (Bytes::from_static(b"signatures"), vec![r2.clone()]),
        ]);
        let (format, groups) = decode_groups(rebyte(chunks));
        assert_eq!(format.as_ref(), b"fmt-1");
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].1, vec![r1]);
        assert_eq!(groups[1].1, vec![r2]);
    }

    #[test]
    fn test_empty_body_records_are_skipped() {
        let full = StreamRecord::new(&b"k"[..], &b"data"[..]);
        let empty = StreamRecord::new(&b"k2"[..], &b""[..]);
        let chunks = encode_to_bytes(vec![(
            Bytes::from_static(b"texts"),
            vec![empty, full.clone()],
        )]);
        let (_, groups) = decode_groups(chunks);
        assert_eq!(groups, vec![(Bytes::from_static(b"texts"), vec![full])]);
    }

    #[test]
    fn test_flattened_record_view() {
        let r1 = StreamRecord::new(&b"a"[..], &b"one"[..]);
        let r2 = StreamRecord::new(&b"b"[..], &b"two"[..]);
        let chunks = encode_to_bytes(vec![
            (Bytes::from_static(b"texts"), vec![r1.clone()]),
            (Bytes::from_static(b"revisions"), vec![r2.clone()]),
        ]);
        let mut decoder = StreamDecoder::new(chunks.into_iter());
        decoder.read_format_name().unwrap();
        let mut seen = Vec::new();
        while let Some((kind, record)) = decoder.next_keyed_record().unwrap() {
            seen.push((kind, record));
        }
        assert_eq!(
            seen,
            vec![
                (Bytes::from_static(b"texts"), r1),
                (Bytes::from_static(b"revisions"), r2),
            ]
        );
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let r = StreamRecord::new(&b"k"[..], &b"payload"[..]);
        let mut data = Vec::new();
        for chunk in encode_to_bytes(vec![(Bytes::from_static(b"texts"), vec![r])]) {
            data.extend_from_slice(&chunk);
        }
        // Drop the end marker and half the last record.
        data.truncate(data.len() - 5);
        let mut decoder = StreamDecoder::new(std::iter::once(Bytes::from(data)));
        decoder.read_format_name().unwrap();
        let err = loop {
            match decoder.next_keyed_record() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("truncated stream decoded cleanly"),
                Err(err) => break err,
            }
        };
        assert!(matches!(err, PackError::UnexpectedEnd));
    }
}
