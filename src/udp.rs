//! UDP segmented transfer
//!
//! The server answers one [`RequestMessage`] with `ceil(file_size / chunk)`
//! payload segments sent back-to-back from a fresh socket. The client counts
//! distinct segments until nothing arrives for `idle_timeout`; that silence is
//! the end-of-transfer signal. Nothing is retransmitted, so loss shows up in
//! the report as-is.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TransferError;
use crate::net;
use crate::protocol::{
    PAYLOAD_HEADER_LEN, PayloadHeader, Protocol, RequestMessage, TransferReport, WireError,
    total_segments,
};
use crate::stats::TransferSession;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_BUFFER_SIZE: usize = 4 * 1024 * 1024; // 4 MB
/// Largest UDP payload; a peer with a bigger chunk size is not truncated
const MAX_DATAGRAM: usize = 65_535;

#[derive(Debug, Clone)]
pub struct UdpConfig {
    /// Data bytes per segment; both ends must agree on it
    pub chunk_size: usize,
    /// Silence that ends a transfer
    pub idle_timeout: Duration,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::protocol::DEFAULT_CHUNK_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Receiver-side segment bookkeeping.
///
/// Only distinct indices below the advertised total count as received, so
/// `received() <= total()` holds no matter what the network delivers. The
/// total is taken from the first valid segment and must not exceed `limit`,
/// the segment count the client's own request implies; seen indices live in
/// a bitmap sized from it.
#[derive(Debug)]
pub struct SegmentTracker {
    limit: u64,
    total: Option<u64>,
    seen: Vec<u64>,
    received: u64,
    highest: Option<u64>,
    out_of_order: u64,
    duplicates: u64,
    rejected: u64,
}

impl SegmentTracker {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            total: None,
            seen: Vec::new(),
            received: 0,
            highest: None,
            out_of_order: 0,
            duplicates: 0,
            rejected: 0,
        }
    }

    /// Record one segment. Returns true when it was new and consistent with
    /// the transfer seen so far. Rejected segments never change the total.
    pub fn record(&mut self, total_segments: u64, segment_index: u64) -> bool {
        let consistent = match self.total {
            Some(total) => total_segments == total,
            None => total_segments <= self.limit,
        };
        if !consistent || segment_index >= total_segments {
            self.rejected += 1;
            return false;
        }

        if self.total.is_none() {
            self.total = Some(total_segments);
            self.seen = vec![0u64; total_segments.div_ceil(64) as usize];
        }

        let word = &mut self.seen[(segment_index / 64) as usize];
        let bit = 1u64 << (segment_index % 64);
        if *word & bit != 0 {
            self.duplicates += 1;
            return false;
        }
        *word |= bit;
        self.received += 1;

        match self.highest {
            Some(highest) if segment_index < highest => self.out_of_order += 1,
            _ => self.highest = Some(segment_index),
        }
        true
    }

    pub fn total(&self) -> Option<u64> {
        self.total
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn out_of_order(&self) -> u64 {
        self.out_of_order
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn apply_to(&self, session: &mut TransferSession) {
        session.total_segments = self.total;
        session.segments_received = self.received();
        session.out_of_order = self.out_of_order;
        session.duplicates = self.duplicates;
    }
}

/// Outcome of one bounded wait on the data socket
#[derive(Debug)]
pub enum RecvEvent {
    Segment(PayloadHeader),
    Invalid(WireError),
    /// Nothing arrived within the idle timeout
    Idle,
}

pub async fn recv_segment(
    socket: &UdpSocket,
    buffer: &mut [u8],
    idle_timeout: Duration,
) -> std::io::Result<RecvEvent> {
    match tokio::time::timeout(idle_timeout, socket.recv_from(buffer)).await {
        Err(_) => Ok(RecvEvent::Idle),
        Ok(Err(e)) => Err(e),
        Ok(Ok((n, _from))) => Ok(match PayloadHeader::decode(&buffer[..n]) {
            Ok(header) => RecvEvent::Segment(header),
            Err(e) => RecvEvent::Invalid(e),
        }),
    }
}

/// Client side: request `file_size` bytes from `server` and collect segments
/// until the stream goes quiet.
pub async fn download(
    server: SocketAddr,
    file_size: u64,
    connection_id: u32,
    config: &UdpConfig,
    cancel: &CancellationToken,
) -> Result<TransferReport, TransferError> {
    let bind = SocketAddr::new(net::unspecified_for(&server), 0);
    let socket = net::create_udp_socket(bind, false).await?;
    net::set_recv_buffer(&socket, RECV_BUFFER_SIZE);

    let mut session = TransferSession::new(Protocol::Udp, connection_id, file_size)
        .with_chunk_size(config.chunk_size);
    let mut tracker = SegmentTracker::new(total_segments(file_size, config.chunk_size));
    let mut buffer = vec![0u8; MAX_DATAGRAM.max(PAYLOAD_HEADER_LEN + config.chunk_size)];

    socket
        .send_to(&RequestMessage { file_size }.encode(), server)
        .await?;
    session.start();
    debug!(
        "UDP #{} requested {} bytes from {}",
        connection_id, file_size, server
    );

    let mut last_arrival = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("UDP #{} cancelled", connection_id);
                break;
            }
            event = recv_segment(&socket, &mut buffer, config.idle_timeout) => event?,
        };

        match event {
            RecvEvent::Segment(header) => {
                if tracker.record(header.total_segments, header.segment_index) {
                    session.add_bytes(header.data_len as u64);
                    last_arrival = Some(Instant::now());
                }
            }
            RecvEvent::Invalid(e) => {
                trace!("UDP #{} dropped datagram: {}", connection_id, e);
            }
            RecvEvent::Idle => {
                debug!(
                    "UDP #{} idle for {:?}, {} of {:?} segments",
                    connection_id,
                    config.idle_timeout,
                    tracker.received(),
                    tracker.total()
                );
                break;
            }
        }
    }

    session.finish_at(last_arrival.unwrap_or_else(Instant::now));
    tracker.apply_to(&mut session);

    Ok(session.into_report())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpSendStats {
    pub segments_sent: u64,
    pub bytes_sent: u64,
}

/// Server side: send every segment of a `file_size` transfer to `peer`, in
/// increasing index order, with no pacing.
pub async fn send_segments(
    socket: &UdpSocket,
    peer: SocketAddr,
    file_size: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> std::io::Result<UdpSendStats> {
    let total = total_segments(file_size, chunk_size);
    let mut packet = vec![0u8; PAYLOAD_HEADER_LEN + chunk_size];
    let mut remaining = file_size;
    let mut stats = UdpSendStats {
        segments_sent: 0,
        bytes_sent: 0,
    };

    for index in 0..total {
        if cancel.is_cancelled() {
            debug!("UDP send to {} cancelled at segment {}", peer, index);
            break;
        }

        let len = remaining.min(chunk_size as u64) as usize;
        PayloadHeader::encode_into(total, index, &mut packet);
        socket
            .send_to(&packet[..PAYLOAD_HEADER_LEN + len], peer)
            .await?;

        remaining -= len as u64;
        stats.segments_sent += 1;
        stats.bytes_sent += len as u64;
    }

    Ok(stats)
}

/// Worker spawned by the dispatcher for one valid request
pub async fn serve_request(
    peer: SocketAddr,
    request: RequestMessage,
    chunk_size: usize,
    cancel: CancellationToken,
) -> Result<UdpSendStats, TransferError> {
    let bind = SocketAddr::new(net::unspecified_for(&peer), 0);
    let socket = net::create_udp_socket(bind, false).await?;

    let stats = send_segments(&socket, peer, request.file_size, chunk_size, &cancel)
        .await
        .inspect_err(|e| warn!("UDP send to {} failed: {}", peer, e))?;

    debug!(
        "Sent {} segments ({} bytes) to {}",
        stats.segments_sent, stats.bytes_sent, peer
    );
    Ok(stats)
}
