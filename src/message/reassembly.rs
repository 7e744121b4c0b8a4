//! Chunk reassembly
//!
//! ChunkedPart frames accumulate in a [`PendingMessage`] keyed by message
//! id until every index up to `total_chunks` is present, then the payload
//! is stitched together in index order and emitted once.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

use crate::bluetooth::protocol::{Frame, FrameKind, MessageId, PeerId};

/// Chunks received so far for one message
#[derive(Debug)]
pub struct PendingMessage {
    pub sender: PeerId,
    pub recipient: PeerId,
    pub total_chunks: u8,
    parts: BTreeMap<u8, Vec<u8>>,
    started: Instant,
}

impl PendingMessage {
    fn new(frame: &Frame) -> Self {
        Self {
            sender: frame.header.sender,
            recipient: frame.header.recipient,
            total_chunks: frame.header.total_chunks,
            parts: BTreeMap::new(),
            started: Instant::now(),
        }
    }

    pub fn received(&self) -> usize {
        self.parts.len()
    }

    fn is_complete(&self) -> bool {
        self.parts.len() == self.total_chunks as usize
    }

    fn into_payload(self) -> Vec<u8> {
        // BTreeMap iterates in index order
        self.parts.into_values().flatten().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledMessage {
    pub message_id: MessageId,
    pub sender: PeerId,
    pub recipient: PeerId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Last missing part arrived; the message is complete
    Complete(ReassembledMessage),
    InProgress,
    /// Index already held for this message
    DuplicateChunk,
    /// Part disagrees with the pending entry or is not a chunk
    Rejected,
}

#[derive(Default)]
pub struct Reassembler {
    pending: Mutex<HashMap<MessageId, PendingMessage>>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&self, frame: &Frame) -> ChunkOutcome {
        if frame.kind() != FrameKind::ChunkedPart {
            return ChunkOutcome::Rejected;
        }
        let h = &frame.header;
        let mut pending = self.pending.lock();
        let entry = pending
            .entry(h.message_id)
            .or_insert_with(|| PendingMessage::new(frame));

        if entry.total_chunks != h.total_chunks || entry.sender != h.sender {
            warn!(
                "Dropping part {} of {}: expected {} chunks from {}, got {} from {}",
                h.chunk_index, h.message_id, entry.total_chunks, entry.sender, h.total_chunks, h.sender
            );
            return ChunkOutcome::Rejected;
        }
        if entry.parts.contains_key(&h.chunk_index) {
            debug!("Duplicate part {} of {}", h.chunk_index, h.message_id);
            return ChunkOutcome::DuplicateChunk;
        }
        entry.parts.insert(h.chunk_index, frame.payload.clone());

        if !entry.is_complete() {
            return ChunkOutcome::InProgress;
        }
        match pending.remove(&h.message_id) {
            Some(done) => {
                let (sender, recipient) = (done.sender, done.recipient);
                ChunkOutcome::Complete(ReassembledMessage {
                    message_id: h.message_id,
                    sender,
                    recipient,
                    payload: done.into_payload(),
                })
            }
            None => ChunkOutcome::InProgress,
        }
    }

    /// Drop entries that have waited longer than `timeout`
    pub fn prune_older_than(&self, timeout: Duration) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|id, message| {
            let keep = message.started.elapsed() < timeout;
            if !keep {
                debug!(
                    "Abandoning {} after {}/{} parts",
                    id,
                    message.received(),
                    message.total_chunks
                );
            }
            keep
        });
        before - pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn clear(&self) {
        self.pending.lock().clear();
    }
}
