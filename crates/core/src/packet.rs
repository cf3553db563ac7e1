#![forbid(unsafe_code)]

use crate::headers::ApplicationHeaders;
use crate::rules::RuleKind;
use packet_parser::{
    parse_ipv4_packet, parse_tcp_segment, parse_udp_datagram, IpProtocol, TcpFlags,
};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerdictStatus {
    Pending,
    Allow,
    Deny,
}

/// Grouping key for rate limiting and history: who is talking to which
/// local service, over which protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub ip: Ipv4Addr,
    pub port: u16,
    pub protocol: IpProtocol,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Verdict {
    status: VerdictStatus,
    rule_kind: Option<RuleKind>,
    reason: Option<String>,
    max_time: Option<u64>,
}

impl Default for Verdict {
    fn default() -> Self {
        Verdict {
            status: VerdictStatus::Pending,
            rule_kind: None,
            reason: None,
            max_time: None,
        }
    }
}

/// A single captured packet with its decoded fields and decision state.
///
/// Decoding never fails: fields a malformed buffer does not reach stay
/// `None` and the decision logic treats the packet as unmatchable, which
/// lands it in default-deny.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedPacket {
    pub capture_time: f64,
    pub queue_num: u16,
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub protocol: Option<IpProtocol>,
    pub flags: Option<TcpFlags>,
    pub seq: Option<u32>,
    pub ack: Option<u32>,
    #[serde(default)]
    pub payload: Vec<u8>,
    #[serde(default)]
    pub headers: ApplicationHeaders,
    verdict: Verdict,
}

impl ParsedPacket {
    pub fn parse(raw: &[u8], capture_time: f64, queue_num: u16) -> ParsedPacket {
        let mut packet = ParsedPacket {
            capture_time,
            queue_num,
            src_ip: None,
            dst_ip: None,
            src_port: None,
            dst_port: None,
            protocol: None,
            flags: None,
            seq: None,
            ack: None,
            payload: Vec::new(),
            headers: ApplicationHeaders::default(),
            verdict: Verdict::default(),
        };

        let Ok(ip) = parse_ipv4_packet(raw) else {
            return packet;
        };
        packet.src_ip = Some(Ipv4Addr::from(ip.source));
        packet.dst_ip = Some(Ipv4Addr::from(ip.destination));
        packet.protocol = Some(ip.protocol);

        match ip.protocol {
            IpProtocol::Tcp => {
                if let Ok(tcp) = parse_tcp_segment(ip.payload) {
                    packet.src_port = Some(tcp.source_port);
                    packet.dst_port = Some(tcp.destination_port);
                    packet.flags = Some(tcp.flags);
                    packet.seq = Some(tcp.sequence_number);
                    packet.ack = Some(tcp.acknowledgment_number);
                    packet.payload = tcp.payload.to_vec();
                    if tcp.flags.is_push() && !tcp.payload.is_empty() {
                        packet.headers = ApplicationHeaders::from_payload(tcp.payload);
                    }
                }
            }
            IpProtocol::Udp => {
                if let Ok(udp) = parse_udp_datagram(ip.payload) {
                    packet.src_port = Some(udp.source_port);
                    packet.dst_port = Some(udp.destination_port);
                }
            }
            _ => {}
        }
        packet
    }

    pub fn source_key(&self) -> Option<SourceKey> {
        Some(SourceKey {
            ip: self.src_ip?,
            port: self.dst_port.unwrap_or(0),
            protocol: self.protocol?,
        })
    }

    pub fn is_syn(&self) -> bool {
        self.flags.map(TcpFlags::is_syn).unwrap_or(false)
    }

    pub fn is_data(&self) -> bool {
        self.flags.map(TcpFlags::is_push).unwrap_or(false)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.map(TcpFlags::is_fin).unwrap_or(false)
    }

    pub fn status(&self) -> VerdictStatus {
        self.verdict.status
    }

    pub fn rule_kind(&self) -> Option<RuleKind> {
        self.verdict.rule_kind
    }

    pub fn reason(&self) -> Option<&str> {
        self.verdict.reason.as_deref()
    }

    /// Retention horizon in seconds, copied from the rule that matched.
    pub fn max_time(&self) -> Option<u64> {
        self.verdict.max_time
    }

    /// Commits an allow verdict. A decided packet never changes.
    pub fn set_allow(&mut self, rule_kind: Option<RuleKind>, max_time: u64) {
        if self.verdict.status != VerdictStatus::Pending {
            return;
        }
        self.verdict = Verdict {
            status: VerdictStatus::Allow,
            rule_kind,
            reason: None,
            max_time: Some(max_time),
        };
    }

    /// Commits a deny verdict. A decided packet never changes.
    pub fn set_deny(&mut self, rule_kind: Option<RuleKind>, reason: String, max_time: u64) {
        if self.verdict.status != VerdictStatus::Pending {
            return;
        }
        self.verdict = Verdict {
            status: VerdictStatus::Deny,
            rule_kind,
            reason: Some(reason),
            max_time: Some(max_time),
        };
    }
}
