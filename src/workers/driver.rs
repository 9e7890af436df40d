//! Tokio driver for the transfer engine.
//!
//! The engine is a synchronous state machine; this worker gives it time
//! and wiring. One task owns the engine and multiplexes three inputs —
//! application commands, the send tick, and the sweeper tick — so every
//! state transition runs to completion before the next one starts.
//!
//! Frames travel as JSON text over unbounded channels: inbound text
//! arrives through [`DriverCommand::Inbound`] (the transport's read loop
//! forwards relay messages it does not handle itself) and outbound text is
//! pushed to the channel handed to [`run`], whose other end feeds the
//! socket writer.

use crate::core::config::{SEND_TICK, SWEEP_TICK};
use crate::core::engine::TransferEngine;
use crate::core::protocol::{self, Destination, WireMessage, WireSink};
use anyhow::{anyhow, Result};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

// ── Commands ──────────────────────────────────────────────────────────────────

/// Application-side commands for the driver task.
#[derive(Debug)]
pub enum DriverCommand {
    /// A raw text frame read from the relay socket.
    Inbound(String),
    /// Segment and send a file; the assigned transfer ID comes back on the
    /// reply channel once the announcement has been accepted.
    BeginSend {
        fname: String,
        bytes: Vec<u8>,
        chunk_size: usize,
        destination: Destination,
        reply: oneshot::Sender<Result<Uuid>>,
    },
    /// Abandon an outgoing transfer.
    Cancel(Uuid),
}

// ── Outbound sink ─────────────────────────────────────────────────────────────

/// [`WireSink`] over an unbounded channel of encoded frames. The send
/// fails once the consuming side (the socket writer) is gone, which the
/// engine treats like any closed channel: skip and retry next tick.
struct ChannelSink {
    outbound: mpsc::UnboundedSender<String>,
}

impl WireSink for ChannelSink {
    fn send(&mut self, msg: &WireMessage) -> Result<()> {
        let text = protocol::encode(msg)?;
        self.outbound
            .send(text)
            .map_err(|_| anyhow!("outbound channel closed"))
    }
}

// ── Driver loop ───────────────────────────────────────────────────────────────

/// Run the engine until the command channel closes.
pub async fn run(
    mut engine: TransferEngine,
    mut commands: mpsc::UnboundedReceiver<DriverCommand>,
    outbound: mpsc::UnboundedSender<String>,
) {
    let mut sink = ChannelSink { outbound };
    // first tick one full period out, not immediately
    let start = tokio::time::Instant::now();
    let mut send_tick = tokio::time::interval_at(start + SEND_TICK, SEND_TICK);
    let mut sweep_tick = tokio::time::interval_at(start + SWEEP_TICK, SWEEP_TICK);
    info!(event = "transfer_driver_started");

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else {
                    break;
                };
                handle_command(&mut engine, cmd, &mut sink);
            }
            _ = send_tick.tick() => {
                engine.tick_send(Instant::now(), &mut sink);
            }
            _ = sweep_tick.tick() => {
                engine.tick_sweep(Instant::now(), &mut sink);
            }
        }
    }

    info!(event = "transfer_driver_stopped");
}

fn handle_command(engine: &mut TransferEngine, cmd: DriverCommand, sink: &mut ChannelSink) {
    match cmd {
        DriverCommand::Inbound(text) => {
            engine.on_inbound_json(&text, Instant::now(), sink);
        }
        DriverCommand::BeginSend {
            fname,
            bytes,
            chunk_size,
            destination,
            reply,
        } => {
            let result = engine.begin_send(fname, &bytes, chunk_size, destination, sink);
            if reply.send(result).is_err() {
                debug!(event = "begin_send_reply_dropped");
            }
        }
        DriverCommand::Cancel(id) => {
            engine.cancel_send(id);
        }
    }
}
