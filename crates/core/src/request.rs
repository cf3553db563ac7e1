#![forbid(unsafe_code)]

use crate::packet::{ParsedPacket, SourceKey, VerdictStatus};
use serde::{Deserialize, Serialize};

/// Flow membership window in sequence-number units: one transaction is
/// assumed to span at most 64 MTU-sized segments.
pub const FLOW_WINDOW: u32 = 1500 * 64;

/// Retention horizon in seconds for packets no detection rule matched.
pub const DEFAULT_MAX_TIME: u64 = 120;

/// A reconstructed TCP exchange: the packets of one logical request,
/// grouped by a sequence window anchored at the SYN. `previous_id` is a
/// non-owning link to the most recent earlier decisive request from the
/// same source; it is resolved through the history store, never traversed
/// for cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub previous_id: Option<u64>,
    pub packets: Vec<ParsedPacket>,
}

impl Request {
    pub fn new(id: u64, previous_id: Option<u64>) -> Request {
        Request {
            id,
            previous_id,
            packets: Vec::new(),
        }
    }

    pub fn push(&mut self, packet: ParsedPacket) {
        self.packets.push(packet);
    }

    fn anchor_seq(&self) -> Option<u32> {
        self.packets
            .iter()
            .find(|p| p.is_syn())
            .or_else(|| self.packets.first())
            .and_then(|p| p.seq)
    }

    /// Whether a packet with this sequence number belongs to the flow:
    /// inside `[s0, s0 + FLOW_WINDOW)` with 32-bit wraparound, where `s0`
    /// is the anchoring SYN's sequence number.
    pub fn is_part_of(&self, seq: u32) -> bool {
        match self.anchor_seq() {
            Some(s0) => seq.wrapping_sub(s0) < FLOW_WINDOW,
            None => false,
        }
    }

    /// Start-of-flow timestamp: the SYN packet's capture time, falling
    /// back to the first packet when the SYN was never seen.
    pub fn current_time(&self) -> f64 {
        self.packets
            .iter()
            .find(|p| p.is_syn())
            .or_else(|| self.packets.first())
            .map(|p| p.capture_time)
            .unwrap_or(0.0)
    }

    /// Retention horizon: the largest horizon any packet's verdict carried.
    pub fn max_time(&self) -> u64 {
        self.packets
            .iter()
            .filter_map(|p| p.max_time())
            .max()
            .unwrap_or(DEFAULT_MAX_TIME)
    }

    pub fn group_id(&self) -> Option<SourceKey> {
        self.packets.first().and_then(|p| p.source_key())
    }

    /// An accepted SYN alone is not enough: the engine must also have
    /// cleared actual data (a PSH or FIN packet).
    pub fn is_allowed(&self) -> bool {
        let syn_allowed = self
            .packets
            .iter()
            .any(|p| p.is_syn() && p.status() == VerdictStatus::Allow);
        let data_allowed = self
            .packets
            .iter()
            .any(|p| (p.is_data() || p.is_fin()) && p.status() == VerdictStatus::Allow);
        syn_allowed && data_allowed
    }

    pub fn is_denied(&self) -> bool {
        self.packets
            .iter()
            .rev()
            .any(|p| p.status() == VerdictStatus::Deny)
    }

    pub fn is_decisive(&self) -> bool {
        self.is_allowed() || self.is_denied()
    }

    /// The reason carried by the most recent denied packet, if any.
    pub fn deny_reason(&self) -> Option<&str> {
        self.packets
            .iter()
            .rev()
            .find(|p| p.status() == VerdictStatus::Deny)
            .and_then(|p| p.reason())
    }
}
