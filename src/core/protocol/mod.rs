//! Wire protocol for the relay socket: JSON frames tagged by `type`.
//!
//! The transfer engine shares its socket with the chat/signaling layer, so
//! every frame is a self-describing JSON object. Chunk payloads are base64
//! strings — the relay only ever sees text frames.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Serde helper: serialize `Vec<u8>` as a base64 string instead of a JSON
/// array of numbers. Keeps 64 KB chunks at ~87 KB on the wire rather than
/// the several-hundred-KB array form.
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let b64 = base64::engine::general_purpose::STANDARD.encode(bytes);
        serializer.serialize_str(&b64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}

// ── Addressing ────────────────────────────────────────────────────────────────

/// Where a transfer's frames are routed: a single peer, a room, or the
/// relay's default broadcast scope. Opaque to the engine — the relay does
/// the actual routing.
///
/// Absent fields are omitted from the JSON entirely; the relay treats an
/// explicit `null` differently from a missing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Destination {
    pub to: Option<String>,
    pub room: Option<String>,
}

impl Destination {
    /// Route to a single peer.
    pub fn peer(name: impl Into<String>) -> Self {
        Self {
            to: Some(name.into()),
            room: None,
        }
    }

    /// Route to every member of a room.
    pub fn room(name: impl Into<String>) -> Self {
        Self {
            to: None,
            room: Some(name.into()),
        }
    }

    /// Relay-default broadcast.
    pub fn broadcast() -> Self {
        Self::default()
    }
}

// ── Frames ────────────────────────────────────────────────────────────────────

/// Transfer-engine frames exchanged over the shared relay socket.
///
/// `from` is stamped by the session layer on inbound frames (the engine
/// echoes it back as the `to` of a cumulative ACK) and left unset on
/// outbound ones.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// Transfer announcement sent before any chunk.
    #[serde(rename = "FILE_META")]
    FileMeta {
        transfer_id: Uuid,
        fname: String,
        size: u64,
        total_chunks: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
    /// One chunk of payload. `total_chunks` rides along so a receiver that
    /// missed the meta frame can still size the transfer.
    #[serde(rename = "FILE_CHUNK")]
    FileChunk {
        transfer_id: Uuid,
        chunk_index: u32,
        total_chunks: u32,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room: Option<String>,
    },
    /// Cumulative acknowledgment: `ack` is the receiver's next expected
    /// chunk index, implying everything below it has arrived.
    #[serde(rename = "ACK")]
    Ack {
        transfer_id: Uuid,
        ack: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
}

/// Encode a frame as a JSON text message for the relay socket.
pub fn encode(msg: &WireMessage) -> Result<String> {
    serde_json::to_string(msg).context("failed to encode wire frame")
}

/// Decode a relay text message into a transfer frame.
///
/// Fails for chat/signaling frames and for malformed input alike; the
/// caller decides whether that is worth a diagnostic.
pub fn decode(text: &str) -> Result<WireMessage> {
    serde_json::from_str(text).context("failed to decode wire frame")
}

// ── Transport seam ────────────────────────────────────────────────────────────

/// Single-writer sink for outbound frames, implemented by the transport
/// collaborator that owns the relay socket.
///
/// An `Err` means the channel is not currently open; the engine treats the
/// attempted send as a no-op and leaves its bookkeeping untouched, so the
/// chunk is picked up again on a later tick.
pub trait WireSink {
    fn send(&mut self, msg: &WireMessage) -> Result<()>;
}

/// Frame batching: collect outbound frames instead of writing to a socket.
/// Used by tests and by callers that flush in their own loop.
impl WireSink for Vec<WireMessage> {
    fn send(&mut self, msg: &WireMessage) -> Result<()> {
        self.push(msg.clone());
        Ok(())
    }
}
