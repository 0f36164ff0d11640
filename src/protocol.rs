//! Wire protocol
//!
//! Three fixed binary layouts, all big-endian:
//!
//! ```text
//! Offer    [cookie: u32][type: u8 = 0x2][udp_port: u16][tcp_port: u16]            9 bytes
//! Request  [cookie: u32][type: u8 = 0x3][file_size: u64]                         13 bytes
//! Payload  [cookie: u32][type: u8 = 0x4][total_segments: u64][segment_index: u64][data...]
//! ```
//!
//! Decoding never panics. Anything that is not a well-formed message of the
//! expected type comes back as a [`WireError`] and the caller drops it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0xABCD_DCBA;

pub const TYPE_OFFER: u8 = 0x2;
pub const TYPE_REQUEST: u8 = 0x3;
pub const TYPE_PAYLOAD: u8 = 0x4;

pub const OFFER_LEN: usize = 9;
pub const REQUEST_LEN: usize = 13;
pub const PAYLOAD_HEADER_LEN: usize = 21;

/// Data bytes carried by one payload segment, excluding the 21-byte header.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

pub const DEFAULT_DISCOVERY_PORT: u16 = 30001;
pub const DEFAULT_UDP_PORT: u16 = 30002;
pub const DEFAULT_TCP_PORT: u16 = 30003;

/// Why a datagram was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("truncated packet: need {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },
    #[error("bad magic cookie {0:#010x}")]
    BadCookie(u32),
    #[error("unknown message type {0:#04x}")]
    UnknownType(u8),
    #[error("unexpected message type {got:#04x} (expected {expected:#04x})")]
    UnexpectedType { expected: u8, got: u8 },
}

/// Server announcement, broadcast once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfferMessage {
    pub udp_port: u16,
    pub tcp_port: u16,
}

/// Client request for a UDP transfer of `file_size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMessage {
    pub file_size: u64,
}

/// One segment of a UDP transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadMessage {
    pub total_segments: u64,
    pub segment_index: u64,
    pub data: Vec<u8>,
}

/// Header-only view of a payload segment; avoids copying the data out of the
/// receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub total_segments: u64,
    pub segment_index: u64,
    pub data_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Offer(OfferMessage),
    Request(RequestMessage),
    Payload(PayloadMessage),
}

fn check_header(buf: &[u8], expected: u8, needed: usize) -> Result<(), WireError> {
    let msg_type = peek_type(buf)?;
    if msg_type != expected {
        return Err(WireError::UnexpectedType {
            expected,
            got: msg_type,
        });
    }
    if buf.len() < needed {
        return Err(WireError::Truncated {
            needed,
            got: buf.len(),
        });
    }
    Ok(())
}

/// Validate the cookie and return the type byte.
fn peek_type(buf: &[u8]) -> Result<u8, WireError> {
    if buf.len() < 5 {
        return Err(WireError::Truncated {
            needed: 5,
            got: buf.len(),
        });
    }
    let cookie = read_u32(buf, 0);
    if cookie != MAGIC_COOKIE {
        return Err(WireError::BadCookie(cookie));
    }
    Ok(buf[4])
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(raw)
}

impl OfferMessage {
    pub fn encode(&self) -> [u8; OFFER_LEN] {
        let mut buf = [0u8; OFFER_LEN];
        buf[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf[4] = TYPE_OFFER;
        buf[5..7].copy_from_slice(&self.udp_port.to_be_bytes());
        buf[7..9].copy_from_slice(&self.tcp_port.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        check_header(buf, TYPE_OFFER, OFFER_LEN)?;
        Ok(Self {
            udp_port: read_u16(buf, 5),
            tcp_port: read_u16(buf, 7),
        })
    }
}

impl RequestMessage {
    pub fn encode(&self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf[4] = TYPE_REQUEST;
        buf[5..13].copy_from_slice(&self.file_size.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        check_header(buf, TYPE_REQUEST, REQUEST_LEN)?;
        Ok(Self {
            file_size: read_u64(buf, 5),
        })
    }
}

impl PayloadHeader {
    /// Write the header into the first [`PAYLOAD_HEADER_LEN`] bytes of `buf`.
    ///
    /// `buf` must be at least that long; the sender owns the buffer so this
    /// is a caller bug, not a wire condition.
    pub fn encode_into(total_segments: u64, segment_index: u64, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf[4] = TYPE_PAYLOAD;
        buf[5..13].copy_from_slice(&total_segments.to_be_bytes());
        buf[13..21].copy_from_slice(&segment_index.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        check_header(buf, TYPE_PAYLOAD, PAYLOAD_HEADER_LEN)?;
        Ok(Self {
            total_segments: read_u64(buf, 5),
            segment_index: read_u64(buf, 13),
            data_len: buf.len() - PAYLOAD_HEADER_LEN,
        })
    }
}

impl PayloadMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; PAYLOAD_HEADER_LEN + self.data.len()];
        PayloadHeader::encode_into(self.total_segments, self.segment_index, &mut buf);
        buf[PAYLOAD_HEADER_LEN..].copy_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let header = PayloadHeader::decode(buf)?;
        Ok(Self {
            total_segments: header.total_segments,
            segment_index: header.segment_index,
            data: buf[PAYLOAD_HEADER_LEN..].to_vec(),
        })
    }
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::Offer(offer) => offer.encode().to_vec(),
            Message::Request(request) => request.encode().to_vec(),
            Message::Payload(payload) => payload.encode(),
        }
    }

    /// Decode any message, dispatching on the type byte.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        match peek_type(buf)? {
            TYPE_OFFER => OfferMessage::decode(buf).map(Message::Offer),
            TYPE_REQUEST => RequestMessage::decode(buf).map(Message::Request),
            TYPE_PAYLOAD => PayloadMessage::decode(buf).map(Message::Payload),
            other => Err(WireError::UnknownType(other)),
        }
    }
}

/// Number of segments needed to carry `file_size` bytes in `chunk_size`
/// pieces. Zero bytes need zero segments.
pub fn total_segments(file_size: u64, chunk_size: usize) -> u64 {
    let chunk = chunk_size.max(1) as u64;
    file_size.div_ceil(chunk)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

/// Statistics of one finished transfer worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransferReport {
    pub protocol: Protocol,
    pub connection_id: u32,
    pub requested_bytes: u64,
    pub bytes_received: u64,
    pub elapsed_secs: f64,
    pub bits_per_second: f64,
    /// False when the peer stopped before `requested_bytes` arrived (TCP) or
    /// when segments were lost (UDP).
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<UdpStats>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UdpStats {
    pub segments_received: u64,
    pub total_segments: u64,
    pub lost_percent: f64,
    pub out_of_order: u64,
    pub duplicates: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    Finished(TransferReport),
    Failed {
        protocol: Protocol,
        connection_id: u32,
        error: String,
    },
}

impl WorkerOutcome {
    pub fn protocol(&self) -> Protocol {
        match self {
            WorkerOutcome::Finished(report) => report.protocol,
            WorkerOutcome::Failed { protocol, .. } => *protocol,
        }
    }

    pub fn connection_id(&self) -> u32 {
        match self {
            WorkerOutcome::Finished(report) => report.connection_id,
            WorkerOutcome::Failed { connection_id, .. } => *connection_id,
        }
    }
}

/// Everything one discovery-triggered run produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub server: String,
    pub file_size: u64,
    pub duration_ms: u64,
    pub transfers: Vec<WorkerOutcome>,
}

impl RunReport {
    pub fn failures(&self) -> usize {
        self.transfers
            .iter()
            .filter(|t| matches!(t, WorkerOutcome::Failed { .. }))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_layout() {
        let offer = OfferMessage {
            udp_port: 30002,
            tcp_port: 30003,
        };
        let bytes = offer.encode();
        assert_eq!(
            bytes,
            [0xAB, 0xCD, 0xDC, 0xBA, 0x02, 0x75, 0x32, 0x75, 0x33]
        );
        assert_eq!(OfferMessage::decode(&bytes).unwrap(), offer);
    }

    #[test]
    fn test_request_layout() {
        let bytes = RequestMessage { file_size: 2048 }.encode();
        assert_eq!(bytes.len(), REQUEST_LEN);
        assert_eq!(bytes[4], TYPE_REQUEST);
        assert_eq!(&bytes[5..], &2048u64.to_be_bytes());
    }

    #[test]
    fn test_payload_header_len() {
        let msg = PayloadMessage {
            total_segments: 2,
            segment_index: 1,
            data: vec![7u8; 10],
        };
        let bytes = msg.encode();
        assert_eq!(bytes.len(), PAYLOAD_HEADER_LEN + 10);

        let header = PayloadHeader::decode(&bytes).unwrap();
        assert_eq!(header.total_segments, 2);
        assert_eq!(header.segment_index, 1);
        assert_eq!(header.data_len, 10);
    }

    #[test]
    fn test_truncated() {
        let bytes = OfferMessage {
            udp_port: 1,
            tcp_port: 2,
        }
        .encode();
        assert_eq!(
            OfferMessage::decode(&bytes[..8]),
            Err(WireError::Truncated { needed: 9, got: 8 })
        );
        assert!(matches!(
            Message::decode(&[0xAB, 0xCD]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bad_cookie_and_type() {
        let mut bytes = RequestMessage { file_size: 1 }.encode();
        assert!(matches!(
            OfferMessage::decode(&bytes),
            Err(WireError::UnexpectedType {
                expected: TYPE_OFFER,
                got: TYPE_REQUEST
            })
        ));

        bytes[0] = 0;
        assert!(matches!(
            RequestMessage::decode(&bytes),
            Err(WireError::BadCookie(_))
        ));

        let mut unknown = RequestMessage { file_size: 1 }.encode();
        unknown[4] = 0x9;
        assert_eq!(Message::decode(&unknown), Err(WireError::UnknownType(0x9)));
    }

    #[test]
    fn test_total_segments() {
        assert_eq!(total_segments(0, 1024), 0);
        assert_eq!(total_segments(1, 1024), 1);
        assert_eq!(total_segments(1000, 1024), 1);
        assert_eq!(total_segments(1024, 1024), 1);
        assert_eq!(total_segments(1025, 1024), 2);
        assert_eq!(total_segments(2048, 1024), 2);
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(Protocol::Tcp.to_string(), "TCP");
        assert_eq!(Protocol::Udp.to_string(), "UDP");
    }
}
