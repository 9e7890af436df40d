//! TransferEngine: sole coordinator of the reliable-delivery protocol.
//!
//! Owns both transfer stores and glues the pieces together: segmentation
//! on `begin_send`, frame dispatch on `on_inbound`, and the two periodic
//! entry points (`tick_send`, `tick_sweep`). The engine performs no I/O of
//! its own — outbound frames go through the caller's [`WireSink`] and
//! progress/completion surface on an event channel.
//!
//! **Architecture rule**: all protocol state lives here. The transport
//! layer moves frames; the application reacts to events.

use crate::core::protocol::{self, Destination, WireMessage, WireSink};
use crate::core::transfer::incoming::{ChunkOutcome, Reassembler};
use crate::core::transfer::outgoing::{chunk_count, AckOutcome, OutboundStore};
use anyhow::{ensure, Context, Result};
use bytes::Bytes;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

// ── App-facing events ─────────────────────────────────────────────────────────

/// Events delivered from the engine to the application.
///
/// The application consumes these from an `mpsc::UnboundedReceiver` and
/// uses them to drive progress bars, completion handling, and diagnostics.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The acknowledged prefix of an outgoing transfer grew.
    SendProgress {
        transfer_id: Uuid,
        fname: String,
        acked_chunks: u32,
        total_chunks: u32,
    },
    /// Every chunk of an outgoing transfer has been acknowledged; the
    /// transfer has been retired from the store.
    SendComplete { transfer_id: Uuid, fname: String },
    /// An incoming transfer stored a new chunk. `total_chunks` is `None`
    /// until a meta frame or any chunk resolves the count.
    ReceiveProgress {
        transfer_id: Uuid,
        received_chunks: u32,
        total_chunks: Option<u32>,
    },
    /// An incoming transfer completed: `bytes` is the full file in chunk
    /// order. `fname` is `None` when the meta frame never arrived.
    FileAssembled {
        transfer_id: Uuid,
        fname: Option<String>,
        bytes: Bytes,
    },
    /// A non-fatal protocol diagnostic (malformed frame, reassembly fault).
    Error(String),
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// The protocol engine. Single-owner, single-task: every method runs to
/// completion before the next event or tick, so there is no locking.
#[derive(Default)]
pub struct TransferEngine {
    outgoing: OutboundStore,
    incoming: Reassembler,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl TransferEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the application event channel.
    pub fn with_events(mut self, events: mpsc::UnboundedSender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    // ── Outbound API ──────────────────────────────────────────────────────

    /// Announce a transfer without staging any data: the meta frame goes
    /// out and an empty entry is registered. Payloads follow through
    /// [`stage_payload`] as the caller reads them.
    ///
    /// Fails if the transport rejects the announcement — nothing is
    /// registered in that case.
    ///
    /// [`stage_payload`]: TransferEngine::stage_payload
    pub fn register_send(
        &mut self,
        fname: impl Into<String>,
        size: u64,
        chunk_size: usize,
        destination: Destination,
        sink: &mut impl WireSink,
    ) -> Result<Uuid> {
        ensure!(chunk_size > 0, "chunk size must be non-zero");
        let fname = fname.into();
        let id = Uuid::new_v4();
        let total_chunks = chunk_count(size, chunk_size);
        let meta = WireMessage::FileMeta {
            transfer_id: id,
            fname: fname.clone(),
            size,
            total_chunks,
            from: None,
            to: destination.to.clone(),
            room: destination.room.clone(),
        };
        sink.send(&meta)
            .context("transfer announcement rejected by transport")?;
        self.outgoing
            .register(id, fname, size, total_chunks, chunk_size, destination);
        info!(
            event = "send_registered",
            transfer_id = %id,
            size,
            total_chunks,
        );
        Ok(id)
    }

    /// Stage one chunk's payload for an announced transfer. Inert if the
    /// transfer has already completed or been cancelled.
    pub fn stage_payload(&mut self, id: Uuid, index: u32, payload: Vec<u8>) {
        self.outgoing.stage_payload(id, index, payload);
    }

    /// Segment `bytes` into `chunk_size` chunks and start sending them to
    /// `destination`. Returns the transfer ID used on every related frame
    /// and event.
    pub fn begin_send(
        &mut self,
        fname: impl Into<String>,
        bytes: &[u8],
        chunk_size: usize,
        destination: Destination,
        sink: &mut impl WireSink,
    ) -> Result<Uuid> {
        let id = self.register_send(fname, bytes.len() as u64, chunk_size, destination, sink)?;
        if bytes.is_empty() {
            self.outgoing.stage_payload(id, 0, Vec::new());
        } else {
            for (index, chunk) in bytes.chunks(chunk_size).enumerate() {
                self.outgoing.stage_payload(id, index as u32, chunk.to_vec());
            }
        }
        Ok(id)
    }

    /// Abandon an outgoing transfer. Later ticks and ACKs for its ID are
    /// inert; the receiver is not told.
    pub fn cancel_send(&mut self, id: Uuid) -> bool {
        let removed = self.outgoing.remove(&id);
        if removed {
            info!(event = "send_cancelled", transfer_id = %id);
        }
        removed
    }

    /// Number of active outbound transfers.
    pub fn active_sends(&self) -> usize {
        self.outgoing.len()
    }

    /// Number of in-progress inbound transfers.
    pub fn active_receives(&self) -> usize {
        self.incoming.len()
    }

    // ── Ticks ─────────────────────────────────────────────────────────────

    /// Send-scheduler tick (design cadence [`config::SEND_TICK`]): drain
    /// congestion windows and run RTO recovery.
    ///
    /// [`config::SEND_TICK`]: crate::core::config::SEND_TICK
    pub fn tick_send(&mut self, now: Instant, sink: &mut impl WireSink) {
        self.outgoing.tick_send(now, sink);
    }

    /// Sweeper tick (design cadence [`config::SWEEP_TICK`]): resend stale
    /// and never-sent chunks.
    ///
    /// [`config::SWEEP_TICK`]: crate::core::config::SWEEP_TICK
    pub fn tick_sweep(&mut self, now: Instant, sink: &mut impl WireSink) {
        self.outgoing.tick_sweep(now, sink);
    }

    // ── Inbound dispatch ──────────────────────────────────────────────────

    /// Decode and dispatch one raw text frame from the relay socket.
    /// Anything that is not a transfer frame is discarded with a
    /// diagnostic; the engine never fails on inbound data.
    pub fn on_inbound_json(&mut self, text: &str, now: Instant, sink: &mut impl WireSink) {
        match protocol::decode(text) {
            Ok(msg) => self.on_inbound(msg, now, sink),
            Err(e) => {
                warn!(event = "inbound_frame_discarded", error = %e);
                self.emit(TransferEvent::Error(format!(
                    "discarded inbound frame: {e:#}"
                )));
            }
        }
    }

    /// Dispatch one decoded transfer frame.
    pub fn on_inbound(&mut self, msg: WireMessage, now: Instant, sink: &mut impl WireSink) {
        match msg {
            WireMessage::FileMeta {
                transfer_id,
                fname,
                size,
                total_chunks,
                ..
            } => {
                self.incoming.on_meta(transfer_id, fname, size, total_chunks);
                let t = self.incoming.get(&transfer_id);
                self.emit(TransferEvent::ReceiveProgress {
                    transfer_id,
                    received_chunks: t.map_or(0, |t| t.received()),
                    total_chunks: t.and_then(|t| t.total()),
                });
            }
            WireMessage::FileChunk {
                transfer_id,
                chunk_index,
                total_chunks,
                payload,
                from,
                ..
            } => {
                let outcome = self
                    .incoming
                    .on_chunk(transfer_id, chunk_index, total_chunks, payload);
                let ack = match &outcome {
                    ChunkOutcome::Stored { ack, .. }
                    | ChunkOutcome::Completed { ack, .. }
                    | ChunkOutcome::Faulted { ack, .. } => *ack,
                };
                // cumulative ACK on every arrival, routed back to the sender
                let frame = WireMessage::Ack {
                    transfer_id,
                    ack,
                    from: None,
                    to: from,
                };
                if let Err(e) = sink.send(&frame) {
                    warn!(event = "ack_send_rejected", transfer_id = %transfer_id, %e);
                }
                match outcome {
                    ChunkOutcome::Stored {
                        received, total, ..
                    } => {
                        self.emit(TransferEvent::ReceiveProgress {
                            transfer_id,
                            received_chunks: received,
                            total_chunks: total,
                        });
                    }
                    ChunkOutcome::Completed { fname, bytes, .. } => {
                        self.emit(TransferEvent::FileAssembled {
                            transfer_id,
                            fname,
                            bytes,
                        });
                    }
                    ChunkOutcome::Faulted { missing, .. } => {
                        self.emit(TransferEvent::Error(format!(
                            "transfer {transfer_id}: chunk count reached but index {missing} is missing"
                        )));
                    }
                }
            }
            WireMessage::Ack { transfer_id, ack, .. } => {
                match self.outgoing.handle_ack(transfer_id, ack, now, sink) {
                    AckOutcome::Advanced {
                        fname,
                        acked,
                        total,
                        complete,
                    } => {
                        self.emit(TransferEvent::SendProgress {
                            transfer_id,
                            fname: fname.clone(),
                            acked_chunks: acked,
                            total_chunks: total,
                        });
                        if complete {
                            self.emit(TransferEvent::SendComplete { transfer_id, fname });
                        }
                    }
                    AckOutcome::Duplicate | AckOutcome::Unknown => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CHUNK_SIZE;
    use std::time::Duration;

    /// Deliver every frame in `frames` to `engine`, collecting its replies.
    fn deliver(
        engine: &mut TransferEngine,
        frames: Vec<WireMessage>,
        now: Instant,
    ) -> Vec<WireMessage> {
        let mut replies = Vec::new();
        for frame in frames {
            engine.on_inbound(frame, now, &mut replies);
        }
        replies
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    #[test]
    fn lossless_transfer_end_to_end() {
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let mut sender = TransferEngine::new().with_events(tx_a);
        let mut receiver = TransferEngine::new().with_events(tx_b);

        // 200 KiB at the default 64 KiB chunk size: 4 chunks
        let source: Vec<u8> = (0..200 * 1024).map(|v| (v % 239) as u8).collect();
        let mut wire = Vec::new();
        let mut now = Instant::now();
        let id = sender
            .begin_send("big.bin", &source, CHUNK_SIZE, Destination::peer("bob"), &mut wire)
            .unwrap();

        // alternate scheduler ticks with full round trips until idle
        for _ in 0..16 {
            sender.tick_send(now, &mut wire);
            let outbound = std::mem::take(&mut wire);
            if outbound.is_empty() && sender.active_sends() == 0 {
                break;
            }
            let acks = deliver(&mut receiver, outbound, now);
            // ack processing may itself emit frames (fast retransmit)
            wire = deliver(&mut sender, acks, now);
            now += Duration::from_millis(200);
        }

        assert_eq!(sender.active_sends(), 0);
        assert_eq!(receiver.active_receives(), 0);

        let sender_events = drain_events(&mut rx_a);
        let completions: Vec<_> = sender_events
            .iter()
            .filter(|ev| matches!(ev, TransferEvent::SendComplete { .. }))
            .collect();
        assert_eq!(completions.len(), 1);
        // progress is monotonic up to the full chunk count
        let acked: Vec<u32> = sender_events
            .iter()
            .filter_map(|ev| match ev {
                TransferEvent::SendProgress { acked_chunks, .. } => Some(*acked_chunks),
                _ => None,
            })
            .collect();
        assert!(acked.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(acked.last(), Some(&4));

        let receiver_events = drain_events(&mut rx_b);
        let assembled: Vec<_> = receiver_events
            .iter()
            .filter_map(|ev| match ev {
                TransferEvent::FileAssembled {
                    transfer_id,
                    fname,
                    bytes,
                } => Some((*transfer_id, fname.clone(), bytes.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(assembled.len(), 1);
        assert_eq!(assembled[0].0, id);
        assert_eq!(assembled[0].1.as_deref(), Some("big.bin"));
        assert_eq!(assembled[0].2.as_ref(), source.as_slice());
    }

    #[test]
    fn lost_chunk_recovers_via_fast_retransmit() {
        let mut sender = TransferEngine::new();
        let mut receiver = TransferEngine::new();
        let source = vec![0x5a_u8; 10 * 16];
        let mut wire = Vec::new();
        let mut now = Instant::now();
        sender
            .begin_send("lossy.bin", &source, 16, Destination::peer("bob"), &mut wire)
            .unwrap();

        // let slow start open the window, then drop the first frame of a
        // four-chunk burst: the three chunks behind it produce the three
        // duplicate ACKs that trigger fast retransmit
        let mut dropped_one = false;
        for _ in 0..24 {
            sender.tick_send(now, &mut wire);
            let mut outbound = std::mem::take(&mut wire);
            if !dropped_one && outbound.len() >= 4 {
                outbound.remove(0);
                dropped_one = true;
            }
            let acks = deliver(&mut receiver, outbound, now);
            // the fast-retransmitted chunk comes out of ack processing
            wire = deliver(&mut sender, acks, now);
            if sender.active_sends() == 0 {
                break;
            }
            now += Duration::from_millis(50);
        }

        assert!(dropped_one);
        assert_eq!(sender.active_sends(), 0);
        assert_eq!(receiver.active_receives(), 0);
    }

    #[test]
    fn malformed_inbound_surfaces_a_diagnostic() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut engine = TransferEngine::new().with_events(tx);
        let mut wire = Vec::new();
        engine.on_inbound_json("{\"type\":\"bogus\"}", Instant::now(), &mut wire);
        assert!(wire.is_empty());
        let events = drain_events(&mut rx);
        assert!(matches!(events.as_slice(), [TransferEvent::Error(_)]));
    }

    #[test]
    fn ack_for_unknown_transfer_is_inert() {
        let mut engine = TransferEngine::new();
        let mut wire = Vec::new();
        let frame = WireMessage::Ack {
            transfer_id: Uuid::new_v4(),
            ack: 3,
            from: None,
            to: None,
        };
        engine.on_inbound(frame, Instant::now(), &mut wire);
        assert!(wire.is_empty());
        assert_eq!(engine.active_sends(), 0);
    }

    #[test]
    fn cancelled_transfer_ignores_ticks_and_acks() {
        let mut engine = TransferEngine::new();
        let mut wire = Vec::new();
        let now = Instant::now();
        let id = engine
            .begin_send("gone.bin", &[1, 2, 3], 2, Destination::broadcast(), &mut wire)
            .unwrap();
        wire.clear();

        assert!(engine.cancel_send(id));
        assert!(!engine.cancel_send(id));
        engine.tick_send(now, &mut wire);
        engine.tick_sweep(now, &mut wire);
        assert!(wire.is_empty());

        let frame = WireMessage::Ack {
            transfer_id: id,
            ack: 1,
            from: None,
            to: None,
        };
        engine.on_inbound(frame, now, &mut wire);
        assert!(wire.is_empty());
    }

    #[test]
    fn acks_route_back_to_the_chunk_sender() {
        let mut engine = TransferEngine::new();
        let mut wire = Vec::new();
        let frame = WireMessage::FileChunk {
            transfer_id: Uuid::new_v4(),
            chunk_index: 0,
            total_chunks: 2,
            payload: vec![7; 8],
            from: Some("alice".into()),
            to: Some("bob".into()),
            room: None,
        };
        engine.on_inbound(frame, Instant::now(), &mut wire);
        match wire.as_slice() {
            [WireMessage::Ack { ack, to, .. }] => {
                assert_eq!(*ack, 1);
                assert_eq!(to.as_deref(), Some("alice"));
            }
            other => panic!("unexpected frames: {other:?}"),
        }
    }
}
