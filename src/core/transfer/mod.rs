//! Per-direction transfer state: the outbound store with its send
//! scheduler, and the inbound reassembler.

pub mod incoming;
pub mod outgoing;
