//! JSON output

use std::fs;
use std::path::Path;

use crate::protocol::RunReport;

pub fn output_json(report: &RunReport) -> String {
    serde_json::to_string_pretty(report).unwrap_or_else(|_| "{}".to_string())
}

pub fn save_json(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    let json = output_json(report);
    fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Protocol, TransferReport, WorkerOutcome};

    fn report() -> RunReport {
        RunReport {
            run_id: "run-1".to_string(),
            server: "10.0.0.2 (tcp 30003, udp 30002)".to_string(),
            file_size: 500,
            duration_ms: 12,
            transfers: vec![
                WorkerOutcome::Finished(TransferReport {
                    protocol: Protocol::Tcp,
                    connection_id: 1,
                    requested_bytes: 500,
                    bytes_received: 500,
                    elapsed_secs: 0.01,
                    bits_per_second: 400_000.0,
                    complete: true,
                    udp: None,
                }),
                WorkerOutcome::Failed {
                    protocol: Protocol::Udp,
                    connection_id: 1,
                    error: "connection refused".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_output_json_tags_outcomes() {
        let json = output_json(&report());
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["run_id"], "run-1");
        assert_eq!(value["transfers"][0]["status"], "finished");
        assert_eq!(value["transfers"][0]["protocol"], "tcp");
        assert!(value["transfers"][0].get("udp").is_none());
        assert_eq!(value["transfers"][1]["status"], "failed");
        assert_eq!(value["transfers"][1]["error"], "connection refused");
    }

    #[test]
    fn test_save_json() {
        let path = std::env::temp_dir().join(format!("netspeed-{}.json", uuid::Uuid::new_v4()));
        save_json(&report(), &path).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let parsed: RunReport = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed.transfers, report().transfers);
        let _ = fs::remove_file(&path);
    }
}
