//! Receiver-side reassembly: buffer out-of-order chunks, track the
//! contiguous prefix, and hand back the complete byte stream.
//!
//! Every stored chunk produces a cumulative ACK value — including
//! duplicates and out-of-order arrivals. The repeated, non-advancing ACKs
//! are what lets the sender detect a lost chunk without waiting for its
//! timeout.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, error, info};
use uuid::Uuid;

/// One in-progress inbound transfer.
///
/// The meta frame may arrive after the first chunks (or never, if the
/// relay dropped it); the chunk count is then adopted from any chunk's
/// `total_chunks` field and only the filename stays unknown.
#[derive(Default)]
pub struct InboundTransfer {
    fname: Option<String>,
    size: Option<u64>,
    /// Resolved chunk count, from the meta frame or any chunk.
    total: Option<u32>,
    /// Received payloads by index. Re-delivery overwrites in place — the
    /// payload for an index never changes, so last-write-wins is sound.
    chunks: BTreeMap<u32, Vec<u8>>,
    /// Smallest index not yet received contiguously from zero.
    next_expected: u32,
}

impl InboundTransfer {
    pub fn next_expected(&self) -> u32 {
        self.next_expected
    }

    pub fn received(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn total(&self) -> Option<u32> {
        self.total
    }
}

/// Result of storing one inbound chunk. Every variant carries the
/// cumulative ACK value to send back.
#[derive(Debug)]
pub enum ChunkOutcome {
    /// Chunk buffered; transfer still incomplete.
    Stored {
        ack: u32,
        received: u32,
        total: Option<u32>,
    },
    /// All chunks present: the transfer was retired and its bytes
    /// assembled in index order.
    Completed {
        ack: u32,
        fname: Option<String>,
        bytes: Bytes,
    },
    /// The chunk count said we were done but an index is missing — a
    /// bookkeeping fault, not transient loss. The transfer stays pending.
    Faulted { ack: u32, missing: u32 },
}

/// All in-progress inbound transfers, keyed by transfer ID.
#[derive(Default)]
pub struct Reassembler {
    transfers: HashMap<Uuid, InboundTransfer>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&InboundTransfer> {
        self.transfers.get(id)
    }

    /// Attach descriptor data to a transfer, creating it if this is the
    /// first frame seen for the ID. Chunks buffered before the meta frame
    /// are kept.
    pub fn on_meta(&mut self, id: Uuid, fname: String, size: u64, total_chunks: u32) {
        let t = self.transfers.entry(id).or_default();
        t.fname = Some(fname);
        t.size = Some(size);
        if t.total.is_none() && total_chunks > 0 {
            t.total = Some(total_chunks);
        }
        debug!(
            event = "transfer_meta",
            transfer_id = %id,
            size = t.size,
            total_chunks = t.total,
        );
    }

    /// Store one chunk and advance the contiguous prefix.
    pub fn on_chunk(
        &mut self,
        id: Uuid,
        chunk_index: u32,
        total_chunks: u32,
        payload: Vec<u8>,
    ) -> ChunkOutcome {
        let t = self.transfers.entry(id).or_insert_with(|| {
            debug!(event = "transfer_discovered", transfer_id = %id, "chunk before meta");
            InboundTransfer::default()
        });
        t.chunks.insert(chunk_index, payload);
        if t.total.is_none() && total_chunks > 0 {
            t.total = Some(total_chunks);
        }
        // the cumulative position never passes a resolved chunk count, even
        // if a stray out-of-range index lands in the buffer
        while t.chunks.contains_key(&t.next_expected)
            && t.total.is_none_or(|total| t.next_expected < total)
        {
            t.next_expected += 1;
        }
        let ack = t.next_expected;
        let received = t.chunks.len() as u32;

        let Some(total) = t.total.filter(|&total| received >= total) else {
            return ChunkOutcome::Stored {
                ack,
                received,
                total: t.total,
            };
        };
        if let Some(missing) = (0..total).find(|index| !t.chunks.contains_key(index)) {
            error!(
                event = "reassembly_gap",
                transfer_id = %id,
                missing,
                received,
                total,
            );
            return ChunkOutcome::Faulted { ack, missing };
        }

        let t = self
            .transfers
            .remove(&id)
            .expect("transfer present in completion path");
        let mut bytes = Vec::with_capacity(t.size.unwrap_or(0) as usize);
        for (_, part) in t.chunks.range(0..total) {
            bytes.extend_from_slice(part);
        }
        info!(
            event = "file_assembled",
            transfer_id = %id,
            fname = t.fname.as_deref().unwrap_or("<unnamed>"),
            bytes = bytes.len(),
            total,
        );
        ChunkOutcome::Completed {
            ack,
            fname: t.fname,
            bytes: Bytes::from(bytes),
        }
    }
}
