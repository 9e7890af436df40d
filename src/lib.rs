//! Reliable chunked file delivery over an ordered, lossy message relay.
//!
//! The engine turns a persistent bidirectional socket (shared with a chat
//! signaling layer) into a TCP-like transfer service: files are segmented
//! into fixed-size chunks, delivered under a sliding congestion window
//! (slow start, congestion avoidance, fast retransmit, RTO recovery), and
//! reassembled on the receiving side from cumulative acknowledgments.
//!
//! The crate never owns the socket. It consumes inbound frames through
//! [`TransferEngine::on_inbound`], pushes outbound frames through a
//! [`WireSink`], and reports progress/completion through an event channel.
//! Periodic work (send drain, staleness sweep) is tick-driven; the
//! [`workers::driver`] module provides a tokio task that supplies the ticks.

pub mod core;
pub mod workers;

pub use crate::core::config;
pub use crate::core::engine::{TransferEngine, TransferEvent};
pub use crate::core::protocol::{Destination, WireMessage, WireSink};
