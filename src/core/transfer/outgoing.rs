//! Outbound transfer store: chunk staging, window-gated sending, loss
//! recovery, and cumulative-ACK processing.
//!
//! One [`OutboundTransfer`] per active send, keyed by transfer ID. All
//! mutation happens on the owning engine's task — ticks and inbound ACKs
//! are serialized by the caller, so there is no interior locking.

use crate::core::config::STALE_RESEND_AFTER;
use crate::core::congestion::CongestionState;
use crate::core::protocol::{Destination, WireMessage, WireSink};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Number of chunks needed to cover `size` bytes; a zero-byte file still
/// occupies one (empty) chunk so the transfer has something to acknowledge.
pub fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    (size.div_ceil(chunk_size as u64) as u32).max(1)
}

/// One active outbound file transfer.
pub struct OutboundTransfer {
    fname: String,
    size: u64,
    total_chunks: u32,
    chunk_size: usize,
    destination: Destination,
    /// Staged chunk payloads awaiting acknowledgment. Entries are dropped
    /// as the cumulative ACK passes them, bounding memory to the window
    /// plus whatever has been staged ahead.
    payloads: HashMap<u32, Vec<u8>>,
    /// Last send time per chunk, for RTO and staleness checks.
    sent_at: HashMap<u32, Instant>,
    /// Exclusive upper bound of the cumulatively acknowledged prefix.
    acked_up_to: u32,
    /// Next chunk index the scheduler has not yet transmitted.
    next_to_send: u32,
    congestion: CongestionState,
}

impl OutboundTransfer {
    fn new(
        fname: String,
        size: u64,
        total_chunks: u32,
        chunk_size: usize,
        destination: Destination,
    ) -> Self {
        Self {
            fname,
            size,
            total_chunks,
            chunk_size,
            destination,
            payloads: HashMap::new(),
            sent_at: HashMap::new(),
            acked_up_to: 0,
            next_to_send: 0,
            congestion: CongestionState::new(),
        }
    }

    pub fn fname(&self) -> &str {
        &self.fname
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn acked_up_to(&self) -> u32 {
        self.acked_up_to
    }

    /// Build the wire frame for one chunk, if its payload is staged.
    /// Retransmissions reuse the same frame shape and payload.
    fn chunk_frame(&self, id: Uuid, index: u32) -> Option<WireMessage> {
        let payload = self.payloads.get(&index)?;
        Some(WireMessage::FileChunk {
            transfer_id: id,
            chunk_index: index,
            total_chunks: self.total_chunks,
            payload: payload.clone(),
            from: None,
            to: self.destination.to.clone(),
            room: self.destination.room.clone(),
        })
    }

    /// Resend a single chunk, refreshing its send timestamp on success.
    fn resend(&mut self, id: Uuid, index: u32, now: Instant, sink: &mut impl WireSink) {
        let Some(frame) = self.chunk_frame(id, index) else {
            return;
        };
        match sink.send(&frame) {
            Ok(()) => {
                self.sent_at.insert(index, now);
            }
            Err(e) => {
                warn!(event = "resend_rejected", transfer_id = %id, index, %e);
            }
        }
    }

    /// Transmit new chunks while the congestion window has room and
    /// payloads are staged. A rejected send aborts the drain for this tick
    /// without recording anything, so the chunk is retried untouched later.
    fn drain_window(&mut self, id: Uuid, now: Instant, sink: &mut impl WireSink) {
        let window = self.congestion.window();
        while self.congestion.in_flight_len() < window && self.next_to_send < self.total_chunks {
            let index = self.next_to_send;
            let Some(frame) = self.chunk_frame(id, index) else {
                // payload not staged yet
                break;
            };
            if let Err(e) = sink.send(&frame) {
                warn!(event = "chunk_send_rejected", transfer_id = %id, index, %e);
                break;
            }
            self.sent_at.insert(index, now);
            self.congestion.mark_in_flight(index);
            self.next_to_send += 1;
            debug!(
                event = "chunk_sent",
                transfer_id = %id,
                index,
                in_flight = self.congestion.in_flight_len(),
                window,
            );
        }
    }

    /// RTO check: on the first in-flight chunk older than the timeout,
    /// collapse the window and retransmit the lowest unacknowledged chunk.
    /// One recovery action per tick per transfer keeps a burst of expirations
    /// from stacking retransmissions.
    fn check_timeout(&mut self, id: Uuid, now: Instant, sink: &mut impl WireSink) {
        let rto = self.congestion.rto();
        let expired = self
            .congestion
            .in_flight()
            .find(|index| match self.sent_at.get(index) {
                Some(sent) => now.duration_since(*sent) > rto,
                None => false,
            });
        let Some(index) = expired else {
            return;
        };
        warn!(
            event = "rto_expired",
            transfer_id = %id,
            index,
            rto_ms = rto.as_millis() as u64,
            "collapsing window and retransmitting ack floor"
        );
        self.congestion.on_timeout(self.acked_up_to);
        self.resend(id, self.acked_up_to, now, sink);
    }

    /// Coarse staleness sweep: resend every unacknowledged chunk that was
    /// never sent, or whose last send is older than the staleness threshold.
    /// Catches sends lost before they ever reached in-flight bookkeeping;
    /// does not touch congestion state.
    fn sweep(&mut self, id: Uuid, now: Instant, sink: &mut impl WireSink) {
        for index in self.acked_up_to..self.total_chunks {
            if !self.payloads.contains_key(&index) {
                continue;
            }
            let stale = match self.sent_at.get(&index) {
                None => true,
                Some(sent) => now.duration_since(*sent) > STALE_RESEND_AFTER,
            };
            if !stale {
                continue;
            }
            let Some(frame) = self.chunk_frame(id, index) else {
                continue;
            };
            if let Err(e) = sink.send(&frame) {
                warn!(event = "sweep_send_rejected", transfer_id = %id, index, %e);
                break;
            }
            self.sent_at.insert(index, now);
            info!(event = "stale_chunk_resent", transfer_id = %id, index);
        }
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// What an inbound cumulative ACK did to its transfer.
#[derive(Debug)]
pub enum AckOutcome {
    /// No such transfer — already retired, cancelled, or never ours.
    Unknown,
    /// The acknowledged prefix grew. `complete` means the transfer finished
    /// and was removed from the store.
    Advanced {
        fname: String,
        acked: u32,
        total: u32,
        complete: bool,
    },
    /// Non-advancing (duplicate or stale) ACK.
    Duplicate,
}

/// All active outbound transfers, keyed by transfer ID.
#[derive(Default)]
pub struct OutboundStore {
    transfers: HashMap<Uuid, OutboundTransfer>,
}

impl OutboundStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn get(&self, id: &Uuid) -> Option<&OutboundTransfer> {
        self.transfers.get(id)
    }

    /// Register a new transfer. Payloads are staged separately, so a send
    /// can be announced before its data has been read.
    pub fn register(
        &mut self,
        id: Uuid,
        fname: String,
        size: u64,
        total_chunks: u32,
        chunk_size: usize,
        destination: Destination,
    ) {
        self.transfers.insert(
            id,
            OutboundTransfer::new(fname, size, total_chunks, chunk_size, destination),
        );
    }

    /// Stage one chunk's payload. Returns `false` if the transfer is gone
    /// (completed or cancelled while the data was being prepared).
    pub fn stage_payload(&mut self, id: Uuid, index: u32, payload: Vec<u8>) -> bool {
        match self.transfers.get_mut(&id) {
            Some(t) if index < t.total_chunks => {
                t.payloads.insert(index, payload);
                true
            }
            Some(t) => {
                warn!(
                    event = "payload_out_of_range",
                    transfer_id = %id,
                    index,
                    total_chunks = t.total_chunks,
                );
                false
            }
            None => false,
        }
    }

    /// Remove a transfer. The only cancellation primitive: once the entry is
    /// gone, later ticks and ACKs for its ID are inert.
    pub fn remove(&mut self, id: &Uuid) -> bool {
        self.transfers.remove(id).is_some()
    }

    /// Send-scheduler tick: drain each transfer's window, then check RTOs.
    pub fn tick_send(&mut self, now: Instant, sink: &mut impl WireSink) {
        for (id, t) in self.transfers.iter_mut() {
            t.drain_window(*id, now, sink);
            t.check_timeout(*id, now, sink);
        }
    }

    /// Sweeper tick: resend anything stale, independent of RTO recovery.
    pub fn tick_sweep(&mut self, now: Instant, sink: &mut impl WireSink) {
        for (id, t) in self.transfers.iter_mut() {
            t.sweep(*id, now, sink);
        }
    }

    /// Process one inbound cumulative ACK.
    ///
    /// The ACK value is floored at the current acknowledged prefix (never
    /// regresses) and capped at the chunk count. An advancing ACK samples
    /// RTT from the newest acknowledged chunk's send timestamp — read before
    /// the acknowledged entries are dropped — and frees everything below the
    /// new floor. A non-advancing ACK feeds duplicate detection and may
    /// trigger one fast retransmit of the floor chunk.
    pub fn handle_ack(
        &mut self,
        id: Uuid,
        ack: u32,
        now: Instant,
        sink: &mut impl WireSink,
    ) -> AckOutcome {
        let Some(t) = self.transfers.get_mut(&id) else {
            debug!(event = "ack_unknown_transfer", transfer_id = %id, ack);
            return AckOutcome::Unknown;
        };
        let prev = t.acked_up_to;
        let new_ack = ack.clamp(prev, t.total_chunks);
        if new_ack > prev {
            if let Some(sent) = t.sent_at.get(&(new_ack - 1)) {
                let sample_ms = now.duration_since(*sent).as_secs_f64() * 1_000.0;
                t.congestion.on_rtt_sample(sample_ms);
            }
            t.congestion.on_advancing_ack(prev, new_ack);
            t.acked_up_to = new_ack;
            t.payloads.retain(|&index, _| index >= new_ack);
            t.sent_at.retain(|&index, _| index >= new_ack);
            debug!(
                event = "ack_advanced",
                transfer_id = %id,
                acked = new_ack,
                total = t.total_chunks,
                rto_ms = t.congestion.rto().as_millis() as u64,
            );
            let fname = t.fname.clone();
            let total = t.total_chunks;
            let complete = new_ack == total;
            if complete {
                self.transfers.remove(&id);
                info!(event = "send_complete", transfer_id = %id, total);
            }
            AckOutcome::Advanced {
                fname,
                acked: new_ack,
                total,
                complete,
            }
        } else {
            if t.congestion.on_duplicate_ack() {
                info!(event = "fast_retransmit", transfer_id = %id, index = prev);
                t.resend(id, prev, now, sink);
            }
            AckOutcome::Duplicate
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const CHUNK: usize = 8;

    /// Register a transfer and stage `total` one-byte-pattern chunks.
    fn staged(store: &mut OutboundStore, total: u32) -> Uuid {
        let id = Uuid::new_v4();
        let size = u64::from(total) * CHUNK as u64;
        store.register(id, "test.bin".into(), size, total, CHUNK, Destination::peer("bob"));
        for index in 0..total {
            store.stage_payload(id, index, vec![index as u8; CHUNK]);
        }
        id
    }

    fn chunk_indices(frames: &[WireMessage]) -> Vec<u32> {
        frames
            .iter()
            .filter_map(|m| match m {
                WireMessage::FileChunk { chunk_index, .. } => Some(*chunk_index),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn drain_respects_initial_window() {
        let mut store = OutboundStore::new();
        let id = staged(&mut store, 5);
        let mut out = Vec::new();
        let now = Instant::now();

        // cwnd starts at 1: exactly one chunk goes out, repeatedly
        store.tick_send(now, &mut out);
        store.tick_send(now, &mut out);
        assert_eq!(chunk_indices(&out), vec![0]);

        // one advancing ack opens the window to 2
        store.handle_ack(id, 1, now, &mut out);
        out.clear();
        store.tick_send(now, &mut out);
        assert_eq!(chunk_indices(&out), vec![1, 2]);
    }

    #[test]
    fn drain_stops_at_unstaged_payload() {
        let mut store = OutboundStore::new();
        let id = Uuid::new_v4();
        store.register(id, "slow.bin".into(), 40, 5, CHUNK, Destination::peer("bob"));
        store.stage_payload(id, 0, vec![0; CHUNK]);
        // chunk 1 not staged yet

        let mut out = Vec::new();
        let now = Instant::now();
        store.tick_send(now, &mut out);
        assert_eq!(chunk_indices(&out), vec![0]);
        out.clear();

        // window has room after the ack, but chunk 1 has no payload yet
        store.handle_ack(id, 1, now, &mut out);
        store.tick_send(now, &mut out);
        assert!(chunk_indices(&out).is_empty());

        // staging it lets the next tick proceed
        store.stage_payload(id, 1, vec![1; CHUNK]);
        store.tick_send(now, &mut out);
        assert_eq!(chunk_indices(&out), vec![1]);
    }

    #[test]
    fn ack_is_monotonic_and_frees_state() {
        let mut store = OutboundStore::new();
        let id = staged(&mut store, 4);
        let mut out = Vec::new();
        let now = Instant::now();
        store.tick_send(now, &mut out);

        match store.handle_ack(id, 2, now, &mut out) {
            AckOutcome::Advanced { acked, complete, .. } => {
                assert_eq!(acked, 2);
                assert!(!complete);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        let t = store.get(&id).unwrap();
        assert_eq!(t.acked_up_to(), 2);
        assert!(!t.payloads.contains_key(&0));
        assert!(!t.payloads.contains_key(&1));
        assert!(t.payloads.contains_key(&2));

        // a stale ack never regresses the floor
        assert!(matches!(
            store.handle_ack(id, 1, now, &mut out),
            AckOutcome::Duplicate
        ));
        assert_eq!(store.get(&id).unwrap().acked_up_to(), 2);
    }

    #[test]
    fn three_duplicate_acks_retransmit_floor_once() {
        let mut store = OutboundStore::new();
        let id = staged(&mut store, 6);
        let mut out = Vec::new();
        let now = Instant::now();

        // grow the window and get chunks 1.. in flight
        store.tick_send(now, &mut out);
        store.handle_ack(id, 1, now, &mut out);
        store.tick_send(now, &mut out);
        out.clear();

        store.handle_ack(id, 1, now, &mut out);
        store.handle_ack(id, 1, now, &mut out);
        assert!(chunk_indices(&out).is_empty());
        store.handle_ack(id, 1, now, &mut out);
        assert_eq!(chunk_indices(&out), vec![1]);

        // the fourth duplicate does not resend again
        store.handle_ack(id, 1, now, &mut out);
        assert_eq!(chunk_indices(&out), vec![1]);
    }

    #[test]
    fn rto_expiry_retransmits_lowest_unacked() {
        let mut store = OutboundStore::new();
        let _id = staged(&mut store, 3);
        let mut out = Vec::new();
        let start = Instant::now();
        store.tick_send(start, &mut out);
        assert_eq!(chunk_indices(&out), vec![0]);
        out.clear();

        // initial RTO is 1000 ms; step past it
        let later = start + Duration::from_millis(1_500);
        store.tick_send(later, &mut out);
        assert_eq!(chunk_indices(&out), vec![0]);
        // window collapsed to 1 with chunk 0 still outstanding: no new sends
        out.clear();
        store.tick_send(later, &mut out);
        assert!(chunk_indices(&out).is_empty());
    }

    #[test]
    fn sweeper_resends_stale_and_never_sent_chunks() {
        let mut store = OutboundStore::new();
        let _id = staged(&mut store, 3);
        let mut out = Vec::new();
        let start = Instant::now();
        store.tick_send(start, &mut out);
        assert_eq!(chunk_indices(&out), vec![0]);
        out.clear();

        // within the staleness threshold only never-sent chunks go out
        let soon = start + Duration::from_millis(100);
        store.tick_sweep(soon, &mut out);
        assert_eq!(chunk_indices(&out), vec![1, 2]);
        out.clear();

        // past the threshold everything unacknowledged goes out again
        let later = soon + Duration::from_millis(3_500);
        store.tick_sweep(later, &mut out);
        assert_eq!(chunk_indices(&out), vec![0, 1, 2]);
    }

    #[test]
    fn completion_retires_the_transfer() {
        let mut store = OutboundStore::new();
        let id = staged(&mut store, 2);
        let mut out = Vec::new();
        let now = Instant::now();
        store.tick_send(now, &mut out);
        store.handle_ack(id, 1, now, &mut out);
        store.tick_send(now, &mut out);

        match store.handle_ack(id, 2, now, &mut out) {
            AckOutcome::Advanced { acked, complete, .. } => {
                assert_eq!(acked, 2);
                assert!(complete);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(store.is_empty());
        // straggling ack after retirement is inert
        assert!(matches!(
            store.handle_ack(id, 2, now, &mut out),
            AckOutcome::Unknown
        ));
    }

    #[test]
    fn rejected_send_leaves_bookkeeping_untouched() {
        struct ClosedSink;
        impl WireSink for ClosedSink {
            fn send(&mut self, _msg: &WireMessage) -> anyhow::Result<()> {
                Err(anyhow::anyhow!("channel not open"))
            }
        }

        let mut store = OutboundStore::new();
        let id = staged(&mut store, 2);
        let now = Instant::now();
        store.tick_send(now, &mut ClosedSink);

        let t = store.get(&id).unwrap();
        assert_eq!(t.next_to_send, 0);
        assert!(t.sent_at.is_empty());
        assert_eq!(t.congestion.in_flight_len(), 0);

        // once the channel opens the same chunk goes out normally
        let mut out = Vec::new();
        store.tick_send(now, &mut out);
        assert_eq!(chunk_indices(&out), vec![0]);
    }
}
