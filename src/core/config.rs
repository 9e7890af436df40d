//! Centralized configuration constants for the transfer engine.
//!
//! All tunable parameters live here so they can be reviewed and adjusted
//! in a single place. Wire-format details (JSON tag strings, base64
//! payload encoding) stay in the protocol module.

use std::time::Duration;

// ── Transfer / Chunking ──────────────────────────────────────────────────────

/// Default chunk size in bytes (64 KB).
///
/// Chunks travel base64-encoded inside JSON frames, so the on-wire frame is
/// roughly 4/3 of this plus envelope overhead. 64 KB keeps individual relay
/// messages well under typical websocket frame limits while amortizing the
/// per-frame JSON cost.
pub const CHUNK_SIZE: usize = 64 * 1024;

// ── Congestion control ───────────────────────────────────────────────────────

/// Initial congestion window, in chunks.
pub const INITIAL_CWND: f64 = 1.0;

/// Initial slow-start threshold, in chunks.
pub const INITIAL_SSTHRESH: f64 = 64.0;

/// Consecutive duplicate ACKs that trigger a fast retransmit.
pub const DUP_ACK_THRESHOLD: u32 = 3;

// ── RTT estimation ───────────────────────────────────────────────────────────

/// Smoothing factor for the SRTT exponential average.
pub const RTT_ALPHA: f64 = 0.125;

/// Smoothing factor for the RTT variance estimate.
pub const RTT_BETA: f64 = 0.25;

/// Seed for the smoothed RTT estimate, in milliseconds.
pub const INITIAL_SRTT_MS: f64 = 500.0;

/// Seed for the RTT variance estimate, in milliseconds.
pub const INITIAL_RTTVAR_MS: f64 = 250.0;

/// Retransmission timeout before the first RTT sample arrives.
pub const INITIAL_RTO_MS: u64 = 1_000;

/// Lower bound for the retransmission timeout. Keeps a few fast ACKs from
/// collapsing the RTO to the point where every tick declares a loss.
pub const MIN_RTO_MS: u64 = 200;

// ── Tick cadence ─────────────────────────────────────────────────────────────

/// Send-scheduler tick: drains each transfer up to its congestion window and
/// checks in-flight chunks against the RTO.
pub const SEND_TICK: Duration = Duration::from_millis(200);

/// Retransmission-sweeper tick: coarse safety net independent of the RTO.
pub const SWEEP_TICK: Duration = Duration::from_millis(1_000);

/// Staleness threshold for the sweeper: any unacknowledged chunk whose last
/// send is older than this (or that was never sent at all) is resent.
pub const STALE_RESEND_AFTER: Duration = Duration::from_millis(3_000);
