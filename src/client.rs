//! Client mode implementation
//!
//! Listens for server offers and, for each one accepted, runs the configured
//! number of parallel TCP and UDP downloads against that server.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::discover::{DiscoveredServer, DiscoveryListener};
use crate::error::TransferError;
use crate::net;
use crate::protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DISCOVERY_PORT, Protocol, RunReport, TransferReport, WorkerOutcome,
};
use crate::tcp;
use crate::udp::{self, UdpConfig};

pub const DEFAULT_FILE_SIZE: u64 = 1024 * 1024; // 1 MB

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bytes requested by every transfer
    pub file_size: u64,
    pub tcp_connections: u32,
    pub udp_connections: u32,
    /// Address the discovery listener binds
    pub discovery_addr: SocketAddr,
    pub chunk_size: usize,
    pub udp_idle_timeout: Duration,
    pub connect_timeout: Duration,
    /// Stop after this many runs; `None` keeps listening forever
    pub runs: Option<u32>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            file_size: DEFAULT_FILE_SIZE,
            tcp_connections: 1,
            udp_connections: 1,
            discovery_addr: SocketAddr::new(net::UNSPECIFIED_V4, DEFAULT_DISCOVERY_PORT),
            chunk_size: DEFAULT_CHUNK_SIZE,
            udp_idle_timeout: udp::DEFAULT_IDLE_TIMEOUT,
            connect_timeout: tcp::DEFAULT_CONNECT_TIMEOUT,
            runs: None,
        }
    }
}

impl ClientConfig {
    fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            chunk_size: self.chunk_size,
            idle_timeout: self.udp_idle_timeout,
        }
    }
}

type WorkerHandle = (Protocol, u32, JoinHandle<Result<TransferReport, TransferError>>);

pub struct Client {
    config: ClientConfig,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that stops discovery and every running transfer when cancelled
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Discover, transfer, report, repeat.
    ///
    /// Each finished run is sent on `report_tx`. Returns the number of runs
    /// completed once `config.runs` is reached or the client is cancelled.
    /// Failing to bind the discovery port is the only error.
    pub async fn run(&self, report_tx: Option<mpsc::Sender<RunReport>>) -> anyhow::Result<u32> {
        let mut listener = DiscoveryListener::bind(self.config.discovery_addr).await?;
        let mut completed = 0u32;

        while self.config.runs.is_none_or(|limit| completed < limit) {
            let Some(server) = listener.next_offer(&self.cancel).await else {
                debug!("Discovery cancelled");
                break;
            };

            let report = self.run_transfers(server).await;
            completed += 1;

            if let Some(ref tx) = report_tx {
                let _ = tx.send(report).await;
            }

            let dropped = listener.finish_run();
            if dropped > 0 {
                debug!("Dropped {} offers received during the run", dropped);
            }

            if self.cancel.is_cancelled() {
                break;
            }
            info!("Listening for offers");
        }

        Ok(completed)
    }

    /// Run every configured transfer against `server` concurrently and wait
    /// for all of them.
    pub async fn run_transfers(&self, server: DiscoveredServer) -> RunReport {
        let run_id = Uuid::new_v4().to_string();
        let started = Instant::now();
        let cancel = self.cancel.child_token();

        info!(
            "Starting run {} against {}: {} TCP, {} UDP, {} bytes each",
            run_id,
            server,
            self.config.tcp_connections,
            self.config.udp_connections,
            self.config.file_size
        );

        let mut handles: Vec<WorkerHandle> = Vec::new();
        handles.extend(self.spawn_tcp_workers(server.tcp_addr(), &cancel));
        handles.extend(self.spawn_udp_workers(server.udp_addr(), &cancel));

        let transfers = join_workers(handles).await;

        RunReport {
            run_id,
            server: server.to_string(),
            file_size: self.config.file_size,
            duration_ms: started.elapsed().as_millis() as u64,
            transfers,
        }
    }

    fn spawn_tcp_workers(&self, addr: SocketAddr, cancel: &CancellationToken) -> Vec<WorkerHandle> {
        (1..=self.config.tcp_connections)
            .map(|id| {
                let cancel = cancel.clone();
                let file_size = self.config.file_size;
                let connect_timeout = self.config.connect_timeout;

                let handle = tokio::spawn(async move {
                    tcp::download(addr, file_size, id, connect_timeout, &cancel).await
                });
                (Protocol::Tcp, id, handle)
            })
            .collect()
    }

    fn spawn_udp_workers(&self, addr: SocketAddr, cancel: &CancellationToken) -> Vec<WorkerHandle> {
        (1..=self.config.udp_connections)
            .map(|id| {
                let cancel = cancel.clone();
                let file_size = self.config.file_size;
                let config = self.config.udp_config();

                let handle = tokio::spawn(async move {
                    udp::download(addr, file_size, id, &config, &cancel).await
                });
                (Protocol::Udp, id, handle)
            })
            .collect()
    }
}

/// Wait for every worker; failures and panics are recorded, not propagated
async fn join_workers(handles: Vec<WorkerHandle>) -> Vec<WorkerOutcome> {
    let mut outcomes = Vec::with_capacity(handles.len());

    for (protocol, connection_id, handle) in handles {
        let outcome = match handle.await {
            Ok(Ok(report)) => {
                debug!(
                    "[{} #{}] finished: {} bytes in {:.3}s",
                    protocol, connection_id, report.bytes_received, report.elapsed_secs
                );
                WorkerOutcome::Finished(report)
            }
            Ok(Err(e)) => {
                error!("[{} #{}] {}", protocol, connection_id, e);
                WorkerOutcome::Failed {
                    protocol,
                    connection_id,
                    error: e.to_string(),
                }
            }
            Err(e) => {
                error!("[{} #{}] worker panicked: {}", protocol, connection_id, e);
                WorkerOutcome::Failed {
                    protocol,
                    connection_id,
                    error: format!("worker panicked: {}", e),
                }
            }
        };
        outcomes.push(outcome);
    }

    outcomes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[tokio::test]
    async fn test_zero_connections_complete_immediately() {
        let client = Client::new(ClientConfig {
            tcp_connections: 0,
            udp_connections: 0,
            ..Default::default()
        });

        let server = DiscoveredServer {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 1,
            tcp_port: 1,
        };

        let report = client.run_transfers(server).await;
        assert!(report.transfers.is_empty());
        assert_eq!(report.failures(), 0);
    }

    #[tokio::test]
    async fn test_failed_worker_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = Client::new(ClientConfig {
            tcp_connections: 2,
            udp_connections: 0,
            ..Default::default()
        });

        let server = DiscoveredServer {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: port,
            tcp_port: port,
        };

        let report = client.run_transfers(server).await;
        assert_eq!(report.transfers.len(), 2);
        assert_eq!(report.failures(), 2);
        let ids: Vec<u32> = report.transfers.iter().map(|t| t.connection_id()).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let client = Client::new(ClientConfig {
            discovery_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        });
        client.cancel();

        let runs = client.run(None).await.unwrap();
        assert_eq!(runs, 0);
    }
}
