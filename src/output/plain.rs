//! Plain text output

use crate::protocol::{RunReport, TransferReport, WorkerOutcome};
use crate::stats::bps_to_human;

pub fn output_plain(report: &RunReport) -> String {
    let mut output = String::new();

    for outcome in &report.transfers {
        match outcome {
            WorkerOutcome::Finished(transfer) => output.push_str(&transfer_line(transfer)),
            WorkerOutcome::Failed {
                protocol,
                connection_id,
                error,
            } => {
                output.push_str(&format!("[{} #{}] Error: {}", protocol, connection_id, error));
            }
        }
        output.push('\n');
    }

    output.push_str("All transfers complete, listening for offers\n");
    output
}

fn transfer_line(transfer: &TransferReport) -> String {
    let mut line = format!(
        "[{} #{}] Finished, total time: {:.3} seconds, total speed: {}",
        transfer.protocol,
        transfer.connection_id,
        transfer.elapsed_secs,
        bps_to_human(transfer.bits_per_second)
    );

    if let Some(udp) = transfer.udp {
        line.push_str(&format!(
            ", percentage received: {:.2}%",
            100.0 - udp.lost_percent
        ));
    } else if !transfer.complete {
        line.push_str(&format!(
            ", short transfer: {} of {} bytes",
            transfer.bytes_received, transfer.requested_bytes
        ));
    }

    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Protocol, UdpStats};

    fn tcp(connection_id: u32, bytes_received: u64) -> WorkerOutcome {
        WorkerOutcome::Finished(TransferReport {
            protocol: Protocol::Tcp,
            connection_id,
            requested_bytes: 1000,
            bytes_received,
            elapsed_secs: 0.5,
            bits_per_second: 16_000.0,
            complete: bytes_received == 1000,
            udp: None,
        })
    }

    fn report(transfers: Vec<WorkerOutcome>) -> RunReport {
        RunReport {
            run_id: "r".to_string(),
            server: "127.0.0.1".to_string(),
            file_size: 1000,
            duration_ms: 500,
            transfers,
        }
    }

    #[test]
    fn test_empty_run() {
        let output = output_plain(&report(Vec::new()));
        assert_eq!(output, "All transfers complete, listening for offers\n");
    }

    #[test]
    fn test_tcp_line() {
        let output = output_plain(&report(vec![tcp(1, 1000)]));
        let first = output.lines().next().unwrap();
        assert_eq!(
            first,
            "[TCP #1] Finished, total time: 0.500 seconds, total speed: 16.00 Kbps"
        );
    }

    #[test]
    fn test_short_tcp_flagged() {
        let output = output_plain(&report(vec![tcp(2, 400)]));
        assert!(output.contains("short transfer: 400 of 1000 bytes"));
    }

    #[test]
    fn test_udp_and_failure_lines() {
        let udp = WorkerOutcome::Finished(TransferReport {
            protocol: Protocol::Udp,
            connection_id: 1,
            requested_bytes: 2048,
            bytes_received: 1024,
            elapsed_secs: 0.25,
            bits_per_second: 32_768.0,
            complete: false,
            udp: Some(UdpStats {
                segments_received: 1,
                total_segments: 2,
                lost_percent: 50.0,
                out_of_order: 0,
                duplicates: 0,
            }),
        });
        let failed = WorkerOutcome::Failed {
            protocol: Protocol::Udp,
            connection_id: 2,
            error: "boom".to_string(),
        };

        let output = output_plain(&report(vec![udp, failed]));
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[UDP #1] Finished"));
        assert!(lines[0].ends_with("percentage received: 50.00%"));
        assert_eq!(lines[1], "[UDP #2] Error: boom");
    }
}
