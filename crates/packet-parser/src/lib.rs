#![forbid(unsafe_code)]

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Errors that can occur during parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Truncated(&'static str),
    Invalid(&'static str),
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Truncated(what) => write!(f, "truncated: {what}"),
            ParseError::Invalid(what) => write!(f, "invalid: {what}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Identifies the payload protocol for IP packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub fn from_raw(value: u8) -> Self {
        match value {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

impl std::fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpProtocol::Icmp => write!(f, "icmp"),
            IpProtocol::Tcp => write!(f, "tcp"),
            IpProtocol::Udp => write!(f, "udp"),
            IpProtocol::Other(v) => write!(f, "proto-{v}"),
        }
    }
}

/// TCP control flags as a flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Deserialize, Serialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct TcpFlags(pub u8);

impl TcpFlags {
    pub const FIN: TcpFlags = TcpFlags(0x01);
    pub const SYN: TcpFlags = TcpFlags(0x02);
    pub const RST: TcpFlags = TcpFlags(0x04);
    pub const PSH: TcpFlags = TcpFlags(0x08);
    pub const ACK: TcpFlags = TcpFlags(0x10);
    pub const URG: TcpFlags = TcpFlags(0x20);
    pub const ECE: TcpFlags = TcpFlags(0x40);
    pub const CWR: TcpFlags = TcpFlags(0x80);

    pub fn contains(self, other: TcpFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// A pure SYN, with no ACK: the opening packet of a flow.
    pub fn is_syn(self) -> bool {
        self.contains(TcpFlags::SYN) && !self.contains(TcpFlags::ACK)
    }

    /// Carries pushed application data.
    pub fn is_push(self) -> bool {
        self.contains(TcpFlags::PSH)
    }

    pub fn is_fin(self) -> bool {
        self.contains(TcpFlags::FIN)
    }
}

impl std::ops::BitOr for TcpFlags {
    type Output = TcpFlags;

    fn bitor(self, rhs: TcpFlags) -> TcpFlags {
        TcpFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        const NAMES: [(TcpFlags, &str); 8] = [
            (TcpFlags::SYN, "SYN"),
            (TcpFlags::ACK, "ACK"),
            (TcpFlags::PSH, "PSH"),
            (TcpFlags::FIN, "FIN"),
            (TcpFlags::RST, "RST"),
            (TcpFlags::URG, "URG"),
            (TcpFlags::ECE, "ECE"),
            (TcpFlags::CWR, "CWR"),
        ];
        let mut first = true;
        for (flag, name) in NAMES {
            if self.contains(flag) {
                if !first {
                    write!(f, "-")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        if first {
            write!(f, "NONE")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Header<'a> {
    pub total_length: u16,
    pub identification: u16,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub header_checksum: u16,
    pub source: [u8; 4],
    pub destination: [u8; 4],
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub sequence_number: u32,
    pub acknowledgment_number: u32,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram<'a> {
    pub source_port: u16,
    pub destination_port: u16,
    pub length: u16,
    pub payload: &'a [u8],
}

/// Parse an IPv4 packet, extracting header fields and payload slice.
pub fn parse_ipv4_packet(data: &[u8]) -> Result<Ipv4Header<'_>, ParseError> {
    if data.len() < 20 {
        return Err(ParseError::Truncated("ipv4 base header"));
    }
    let version = data[0] >> 4;
    if version != 4 {
        return Err(ParseError::Invalid("ipv4 version"));
    }
    let ihl = data[0] & 0x0F;
    let header_length = (ihl as usize) * 4;
    if header_length < 20 {
        return Err(ParseError::Invalid("ipv4 ihl too small"));
    }
    if data.len() < header_length {
        return Err(ParseError::Truncated("ipv4 header with options"));
    }
    let total_length = read_u16(&data[2..4]);
    if (total_length as usize) < header_length {
        return Err(ParseError::Invalid("ipv4 total length smaller than header"));
    }
    // Tolerate captures that trim trailing padding: clamp to what we have.
    let end = (total_length as usize).min(data.len());

    Ok(Ipv4Header {
        total_length,
        identification: read_u16(&data[4..6]),
        ttl: data[8],
        protocol: IpProtocol::from_raw(data[9]),
        header_checksum: read_u16(&data[10..12]),
        source: copy_array(&data[12..16]),
        destination: copy_array(&data[16..20]),
        payload: &data[header_length..end],
    })
}

/// Parse a TCP segment. Header length comes from the data-offset nibble.
pub fn parse_tcp_segment(data: &[u8]) -> Result<TcpSegment<'_>, ParseError> {
    if data.len() < 20 {
        return Err(ParseError::Truncated("tcp base header"));
    }
    let data_offset = data[12] >> 4;
    let header_length = (data_offset as usize) * 4;
    if header_length < 20 {
        return Err(ParseError::Invalid("tcp data offset too small"));
    }
    if data.len() < header_length {
        return Err(ParseError::Truncated("tcp header with options"));
    }

    Ok(TcpSegment {
        source_port: read_u16(&data[0..2]),
        destination_port: read_u16(&data[2..4]),
        sequence_number: read_u32(&data[4..8]),
        acknowledgment_number: read_u32(&data[8..12]),
        flags: TcpFlags(data[13]),
        window_size: read_u16(&data[14..16]),
        payload: &data[header_length..],
    })
}

/// Parse a UDP datagram.
pub fn parse_udp_datagram(data: &[u8]) -> Result<UdpDatagram<'_>, ParseError> {
    if data.len() < 8 {
        return Err(ParseError::Truncated("udp header"));
    }
    let length = read_u16(&data[4..6]);
    if length < 8 {
        return Err(ParseError::Invalid("udp length too small"));
    }
    let end = (length as usize).min(data.len());

    Ok(UdpDatagram {
        source_port: read_u16(&data[0..2]),
        destination_port: read_u16(&data[2..4]),
        length,
        payload: &data[8..end],
    })
}

fn read_u16(bytes: &[u8]) -> u16 {
    let mut array = [0u8; 2];
    array.copy_from_slice(bytes);
    u16::from_be_bytes(array)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut array = [0u8; 4];
    array.copy_from_slice(bytes);
    u32::from_be_bytes(array)
}

fn copy_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_ipv4_tcp(flags: u8, payload: &[u8]) -> Vec<u8> {
        let total = 40 + payload.len() as u16;
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x45, 0x00]); // version/ihl, dscp/ecn
        buf.extend_from_slice(&total.to_be_bytes());
        buf.extend_from_slice(&[
            0x12, 0x34, 0x40, 0x00, // identification, flags/fragment offset
            0x40, 0x06, 0x00, 0x00, // ttl, protocol TCP, checksum placeholder
            192, 168, 1, 10, // src
            192, 168, 1, 1, // dst
        ]);
        // TCP header (20 bytes)
        buf.extend_from_slice(&[
            0xc3, 0x50, 0x1f, 0x9b, // src port 50000, dst port 8091
            0x00, 0x00, 0x00, 0x64, // seq 100
            0x00, 0x00, 0x00, 0x00, // ack
        ]);
        buf.push(0x50); // data offset 5
        buf.push(flags);
        buf.extend_from_slice(&[0x72, 0x10, 0x00, 0x00, 0x00, 0x00]); // window, checksum, urgent
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn parse_ipv4_tcp_syn() {
        let raw = build_ipv4_tcp(0x02, b"");
        let ip = parse_ipv4_packet(&raw).expect("parse ipv4");
        assert_eq!(ip.protocol, IpProtocol::Tcp);
        assert_eq!(ip.source, [192, 168, 1, 10]);
        let tcp = parse_tcp_segment(ip.payload).expect("parse tcp");
        assert_eq!(tcp.source_port, 50000);
        assert_eq!(tcp.destination_port, 8091);
        assert_eq!(tcp.sequence_number, 100);
        assert!(tcp.flags.is_syn());
        assert!(tcp.payload.is_empty());
    }

    #[test]
    fn parse_tcp_with_payload_and_options() {
        let payload = b"hello";
        let total = 44 + payload.len() as u16;
        let mut raw = Vec::new();
        raw.extend_from_slice(&[0x45, 0x00]);
        raw.extend_from_slice(&total.to_be_bytes());
        raw.extend_from_slice(&[
            0x12, 0x34, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 192, 168, 1, 10, 192, 168, 1, 1,
        ]);
        raw.extend_from_slice(&[
            0xc3, 0x50, 0x1f, 0x9b, 0x00, 0x00, 0x00, 0x64, 0x00, 0x00, 0x00, 0x00,
        ]);
        raw.push(0x60); // data offset 6 (4 option bytes)
        raw.push(0x18); // PSH-ACK
        raw.extend_from_slice(&[0x72, 0x10, 0x00, 0x00, 0x00, 0x00]);
        raw.extend_from_slice(&[0x01, 0x01, 0x01, 0x00]); // options
        raw.extend_from_slice(payload);

        let ip = parse_ipv4_packet(&raw).expect("parse ipv4");
        let tcp = parse_tcp_segment(ip.payload).expect("parse tcp");
        assert!(tcp.flags.is_push());
        assert!(tcp.flags.contains(TcpFlags::ACK));
        assert_eq!(tcp.payload, b"hello");
    }

    #[test]
    fn parse_udp() {
        let mut raw = Vec::new();
        raw.extend_from_slice(&[
            0x45, 0x00, 0x00, 0x1d, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00,
        ]);
        raw.extend_from_slice(&[10, 0, 0, 1]);
        raw.extend_from_slice(&[10, 0, 0, 2]);
        raw.extend_from_slice(&[0x13, 0x89, 0x00, 0x35, 0x00, 0x09, 0x00, 0x00, 0xff]);
        let ip = parse_ipv4_packet(&raw).expect("parse ipv4");
        assert_eq!(ip.protocol, IpProtocol::Udp);
        let udp = parse_udp_datagram(ip.payload).expect("parse udp");
        assert_eq!(udp.destination_port, 53);
        assert_eq!(udp.payload, &[0xff]);
    }

    #[test]
    fn detects_truncated_headers() {
        let ipv4 = [0x45u8; 10];
        assert!(matches!(
            parse_ipv4_packet(&ipv4),
            Err(ParseError::Truncated(_))
        ));

        let tcp = [0u8; 12];
        assert!(matches!(
            parse_tcp_segment(&tcp),
            Err(ParseError::Truncated(_))
        ));

        let udp = [0u8; 6];
        assert!(matches!(
            parse_udp_datagram(&udp),
            Err(ParseError::Truncated(_))
        ));
    }

    #[test]
    fn rejects_invalid_ipv4_headers() {
        let mut ipv4 = [0u8; 20];
        ipv4[0] = 0x41; // version 4, ihl=1 (invalid < 5)
        assert!(matches!(
            parse_ipv4_packet(&ipv4),
            Err(ParseError::Invalid(_))
        ));

        let mut wrong_version = [0u8; 20];
        wrong_version[0] = 0x65;
        assert!(matches!(
            parse_ipv4_packet(&wrong_version),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_bad_tcp_data_offset() {
        let mut tcp = [0u8; 20];
        tcp[12] = 0x10; // data offset 1
        assert!(matches!(
            parse_tcp_segment(&tcp),
            Err(ParseError::Invalid(_))
        ));
    }

    #[test]
    fn flag_set_helpers() {
        let syn_ack = TcpFlags::SYN | TcpFlags::ACK;
        assert!(!syn_ack.is_syn());
        assert!(syn_ack.contains(TcpFlags::SYN));
        assert!(TcpFlags(0x02).is_syn());
        assert_eq!(format!("{}", TcpFlags::PSH | TcpFlags::ACK), "ACK-PSH");
        assert_eq!(format!("{}", TcpFlags::default()), "NONE");
    }

    #[test]
    fn protocol_names() {
        assert_eq!(IpProtocol::from_raw(6), IpProtocol::Tcp);
        assert_eq!(IpProtocol::from_raw(17), IpProtocol::Udp);
        assert_eq!(IpProtocol::from_raw(1), IpProtocol::Icmp);
        assert_eq!(format!("{}", IpProtocol::from_raw(47)), "proto-47");
    }
}
