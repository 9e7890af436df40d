//! Per-transfer congestion state: sliding window, duplicate-ACK tracking,
//! and RTT estimation.
//!
//! Pure state transitions only — no clocks, no I/O. The send scheduler and
//! ACK processor feed events in and act on the signals coming back out
//! (window size, fast-retransmit trigger, RTO duration).

use crate::core::config::{
    DUP_ACK_THRESHOLD, INITIAL_CWND, INITIAL_RTO_MS, INITIAL_RTTVAR_MS, INITIAL_SRTT_MS,
    INITIAL_SSTHRESH, MIN_RTO_MS, RTT_ALPHA, RTT_BETA,
};
use std::collections::BTreeSet;
use std::time::Duration;

/// Congestion-control state for one outbound transfer.
///
/// The window is kept as a real value so congestion avoidance can grow it
/// fractionally per ACK; scheduling reads it through [`window`], which
/// floors it and clamps to at least one chunk.
///
/// [`window`]: CongestionState::window
#[derive(Debug, Clone)]
pub struct CongestionState {
    /// Congestion window, in chunks.
    cwnd: f64,
    /// Slow-start threshold, in chunks.
    ssthresh: f64,
    /// Chunk indices sent but not yet cumulatively acknowledged.
    in_flight: BTreeSet<u32>,
    /// Consecutive non-advancing ACKs seen at the current ack floor.
    dup_acks: u32,
    /// Smoothed RTT estimate (ms).
    srtt_ms: f64,
    /// RTT variance estimate (ms).
    rttvar_ms: f64,
    /// Current retransmission timeout (ms).
    rto_ms: u64,
}

impl Default for CongestionState {
    fn default() -> Self {
        Self::new()
    }
}

impl CongestionState {
    pub fn new() -> Self {
        Self {
            cwnd: INITIAL_CWND,
            ssthresh: INITIAL_SSTHRESH,
            in_flight: BTreeSet::new(),
            dup_acks: 0,
            srtt_ms: INITIAL_SRTT_MS,
            rttvar_ms: INITIAL_RTTVAR_MS,
            rto_ms: INITIAL_RTO_MS,
        }
    }

    /// Effective send window in whole chunks: `floor(cwnd)`, never below 1.
    pub fn window(&self) -> usize {
        self.cwnd.floor().max(1.0) as usize
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        Duration::from_millis(self.rto_ms)
    }

    /// Record a chunk as sent and awaiting acknowledgment.
    pub fn mark_in_flight(&mut self, index: u32) {
        self.in_flight.insert(index);
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    /// In-flight indices in ascending order.
    pub fn in_flight(&self) -> impl Iterator<Item = u32> + '_ {
        self.in_flight.iter().copied()
    }

    /// A cumulative ACK advanced the floor from `prev_ack` to `new_ack`.
    ///
    /// Newly acknowledged indices leave the in-flight set; the window grows
    /// by one chunk per acknowledged chunk in slow start, or by roughly one
    /// chunk per round trip in congestion avoidance.
    pub fn on_advancing_ack(&mut self, prev_ack: u32, new_ack: u32) {
        debug_assert!(new_ack > prev_ack);
        for index in prev_ack..new_ack {
            self.in_flight.remove(&index);
        }
        let acked = f64::from(new_ack - prev_ack);
        if self.cwnd < self.ssthresh {
            self.cwnd += acked;
        } else {
            self.cwnd += acked * (1.0 / self.cwnd.max(1.0));
        }
        self.dup_acks = 0;
    }

    /// A non-advancing ACK arrived at the current floor.
    ///
    /// Returns `true` exactly when the duplicate count reaches the fast
    /// retransmit threshold: the caller must resend the first unacknowledged
    /// chunk once. Further duplicates in the same window do not re-trigger.
    pub fn on_duplicate_ack(&mut self) -> bool {
        self.dup_acks += 1;
        if self.dup_acks == DUP_ACK_THRESHOLD {
            self.ssthresh = (self.cwnd / 2.0).floor().max(1.0);
            self.cwnd = self.ssthresh + f64::from(DUP_ACK_THRESHOLD);
            true
        } else {
            false
        }
    }

    /// Fold one RTT measurement into the SRTT / variance estimates and
    /// rederive the RTO.
    pub fn on_rtt_sample(&mut self, sample_ms: f64) {
        self.srtt_ms = (1.0 - RTT_ALPHA) * self.srtt_ms + RTT_ALPHA * sample_ms;
        self.rttvar_ms =
            (1.0 - RTT_BETA) * self.rttvar_ms + RTT_BETA * (self.srtt_ms - sample_ms).abs();
        self.rto_ms = ((self.srtt_ms + 4.0 * self.rttvar_ms).floor() as u64).max(MIN_RTO_MS);
    }

    /// An in-flight chunk exceeded the RTO: multiplicative decrease.
    ///
    /// The window collapses to one chunk and the in-flight set retains only
    /// indices at or above the acknowledged floor. The caller retransmits
    /// the floor chunk itself.
    pub fn on_timeout(&mut self, acked_floor: u32) {
        self.ssthresh = (self.cwnd / 2.0).floor().max(1.0);
        self.cwnd = 1.0;
        self.in_flight.retain(|&index| index >= acked_floor);
    }
}
