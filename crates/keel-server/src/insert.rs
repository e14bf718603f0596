//! The threaded streaming-insert pipeline.
//!
//! Insert verbs receive their pack stream as unbounded body chunks. One
//! worker thread is spawned when the verb starts; the request side feeds
//! every arriving chunk into a FIFO channel and, at end-of-body, sends a
//! distinguished end sentinel and joins the worker. The worker blocks on
//! the channel, decodes the pack stream incrementally, and hands the
//! logical record stream to the repository's insert call.
//!
//! A worker failure is never dropped: errors come back through the join
//! and are re-raised on the request side, and a worker panic is resumed
//! there with its original payload.

use crate::error::ServerError;
use crate::Result;
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use keel_pack::StreamDecoder;
use keel_store::{InsertOutcome, NetworkRecord, Repository, StoreError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

enum ChunkMessage {
    Chunk(Bytes),
    End,
}

/// Blocking chunk source for the worker side of the pipeline.
///
/// Yields chunks in arrival order until the end sentinel. If the request
/// side disappears without sending the sentinel (client disconnect), the
/// stream simply ends early and the decoder reports the truncation.
struct ChunkIter {
    receiver: Receiver<ChunkMessage>,
}

impl Iterator for ChunkIter {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        match self.receiver.recv() {
            Ok(ChunkMessage::Chunk(bytes)) => Some(bytes),
            Ok(ChunkMessage::End) | Err(_) => None,
        }
    }
}

/// Handle to a running insert worker.
pub struct StreamInserter {
    sender: Sender<ChunkMessage>,
    worker: Option<JoinHandle<keel_store::Result<InsertOutcome>>>,
}

impl StreamInserter {
    /// Spawns the worker for one insert request.
    pub fn spawn(repository: Arc<dyn Repository>, resume_tokens: Vec<String>) -> Result<Self> {
        let (sender, receiver) = unbounded();
        let worker = std::thread::Builder::new()
            .name("stream-insert".to_string())
            .spawn(move || {
                debug!(resume_tokens = resume_tokens.len(), "insert worker started");
                let mut decoder = StreamDecoder::new(ChunkIter { receiver });
                decoder.read_format_name().map_err(StoreError::from)?;
                let mut records = std::iter::from_fn(|| match decoder.next_keyed_record() {
                    Ok(Some((kind, record))) => Some(Ok(NetworkRecord {
                        kind,
                        key: record.key,
                        body: record.body,
                    })),
                    Ok(None) => None,
                    Err(err) => Some(Err(StoreError::from(err))),
                });
                let outcome = repository.insert_stream(&mut records, &resume_tokens);
                debug!(ok = outcome.is_ok(), "insert worker finished");
                outcome
            })?;
        Ok(Self {
            sender,
            worker: Some(worker),
        })
    }

    /// Enqueues one body chunk, in arrival order.
    ///
    /// A send failure means the worker already died; the error it died
    /// with surfaces from [`finish`](Self::finish).
    pub fn push_chunk(&self, bytes: Bytes) {
        let _ = self.sender.send(ChunkMessage::Chunk(bytes));
    }

    /// Signals end-of-stream and waits for the worker's outcome.
    ///
    /// A worker error is returned with its original identity; a worker
    /// panic is resumed on this thread.
    pub fn finish(mut self) -> Result<InsertOutcome> {
        let _ = self.sender.send(ChunkMessage::End);
        let Some(worker) = self.worker.take() else {
            return Err(ServerError::Protocol(
                "insert worker already joined".to_string(),
            ));
        };
        match worker.join() {
            Ok(outcome) => Ok(outcome?),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for StreamInserter {
    /// An abandoned insert (client disconnected before end-of-body)
    /// closes the channel so the worker sees a truncated stream, fails
    /// its insert, and exits rather than blocking forever.
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.sender.send(ChunkMessage::End);
            let _ = worker.join();
        }
    }
}
