//! Per-worker transfer accounting

use std::time::{Duration, Instant};

use crate::protocol::{Protocol, TransferReport, UdpStats};

/// Client-side state of one transfer worker.
///
/// Owned by the worker task for its whole life; turned into a
/// [`TransferReport`] when the worker finishes.
#[derive(Debug)]
pub struct TransferSession {
    pub protocol: Protocol,
    pub connection_id: u32,
    pub requested_bytes: u64,
    pub bytes_received: u64,
    pub segments_received: u64,
    pub total_segments: Option<u64>,
    pub out_of_order: u64,
    pub duplicates: u64,
    /// Data bytes per UDP segment, used for the UDP rate
    pub chunk_size: usize,
    pub start_time: Option<Instant>,
    pub end_time: Option<Instant>,
}

impl TransferSession {
    pub fn new(protocol: Protocol, connection_id: u32, requested_bytes: u64) -> Self {
        Self {
            protocol,
            connection_id,
            requested_bytes,
            bytes_received: 0,
            segments_received: 0,
            total_segments: None,
            out_of_order: 0,
            duplicates: 0,
            chunk_size: 0,
            start_time: None,
            end_time: None,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
        self.end_time = None;
    }

    pub fn finish(&mut self) {
        self.finish_at(Instant::now());
    }

    pub fn finish_at(&mut self, at: Instant) {
        self.end_time = Some(at);
    }

    pub fn add_bytes(&mut self, bytes: u64) {
        self.bytes_received += bytes;
    }

    pub fn elapsed(&self) -> Duration {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Percentage of advertised segments that never arrived. Zero when no
    /// segment arrived at all, since the total is then unknown.
    pub fn loss_percent(&self) -> f64 {
        match self.total_segments {
            Some(total) if total > 0 => {
                let received = self.segments_received.min(total);
                100.0 * (1.0 - received as f64 / total as f64)
            }
            _ => 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self.protocol {
            Protocol::Tcp => self.bytes_received == self.requested_bytes,
            Protocol::Udp => match self.total_segments {
                Some(total) => self.segments_received == total,
                None => self.requested_bytes == 0,
            },
        }
    }

    /// TCP rate counts bytes read; UDP rate counts whole segments of
    /// `chunk_size` bytes.
    pub fn bits_per_second(&self) -> f64 {
        let bits = match self.protocol {
            Protocol::Tcp => self.bytes_received as f64 * 8.0,
            Protocol::Udp => self.segments_received as f64 * self.chunk_size as f64 * 8.0,
        };
        bits_per_second(bits, self.elapsed())
    }

    pub fn into_report(self) -> TransferReport {
        let udp = match self.protocol {
            Protocol::Tcp => None,
            Protocol::Udp => Some(UdpStats {
                segments_received: self.segments_received,
                total_segments: self.total_segments.unwrap_or(0),
                lost_percent: self.loss_percent(),
                out_of_order: self.out_of_order,
                duplicates: self.duplicates,
            }),
        };

        TransferReport {
            protocol: self.protocol,
            connection_id: self.connection_id,
            requested_bytes: self.requested_bytes,
            bytes_received: self.bytes_received,
            elapsed_secs: self.elapsed().as_secs_f64(),
            bits_per_second: self.bits_per_second(),
            complete: self.is_complete(),
            udp,
        }
    }
}

fn bits_per_second(bits: f64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 { bits / secs } else { 0.0 }
}

pub fn bps_to_human(bps: f64) -> String {
    if bps >= 1_000_000_000.0 {
        format!("{:.2} Gbps", bps / 1_000_000_000.0)
    } else if bps >= 1_000_000.0 {
        format!("{:.2} Mbps", bps / 1_000_000.0)
    } else if bps >= 1_000.0 {
        format!("{:.2} Kbps", bps / 1_000.0)
    } else {
        format!("{:.2} bps", bps)
    }
}
