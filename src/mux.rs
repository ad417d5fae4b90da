//! Stream multiplexing over a single WebSocket.
//!
//! The WebSocket already frames payloads, so a mux frame is just a 4-byte
//! big-endian stream id followed by the data. Like HTTP/2, client-initiated
//! streams take odd ids and server-initiated streams take even ids. A frame
//! with an empty payload is the EOF marker for its stream.

use std::collections::HashSet;

use crate::error::TunnelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Per-session mux state: the next id to hand out and the set of live ids.
///
/// Ids are never recycled; session lifetimes are short relative to the
/// 2^31 ids available per role. Id 0 is reserved and never allocated.
#[derive(Debug)]
pub struct Multiplexing {
    next_id: u32,
    alive: HashSet<u32>,
}

impl Multiplexing {
    pub fn new(role: Role) -> Self {
        let next_id = match role {
            Role::Client => 1,
            Role::Server => 2,
        };
        Self {
            next_id,
            alive: HashSet::new(),
        }
    }

    /// Allocate the next stream id and mark it live.
    pub fn new_stream(&mut self) -> u32 {
        let id = self.next_id;
        self.alive.insert(id);
        self.next_id = self.next_id.wrapping_add(2);
        id
    }

    /// Remove an id from the live set. Idempotent.
    pub fn del_stream(&mut self, stream_id: u32) {
        self.alive.remove(&stream_id);
    }

    pub fn is_alive(&self, stream_id: u32) -> bool {
        self.alive.contains(&stream_id)
    }

    /// Prefix `payload` with the big-endian stream id.
    pub fn encode(stream_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&stream_id.to_be_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    /// Split a frame into `(stream_id, payload)`. The payload may be empty.
    pub fn decode(frame: &[u8]) -> Result<(u32, &[u8]), TunnelError> {
        if frame.len() < 4 {
            return Err(TunnelError::Parse(format!(
                "mux frame too short: {} bytes",
                frame.len()
            )));
        }
        let stream_id = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        Ok((stream_id, &frame[4..]))
    }
}
