//! netspeed - LAN throughput measurement over TCP and UDP
//!
//! A server broadcasts offers on the local network; clients that hear one
//! download a fixed amount of data from it over several parallel TCP and UDP
//! connections and report time, rate and UDP loss per connection.
//!
//! # Library Usage
//!
//! ```ignore
//! use netspeed::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ClientConfig {
//!         file_size: 10 * 1024 * 1024,
//!         tcp_connections: 2,
//!         udp_connections: 2,
//!         runs: Some(1),
//!         ..Default::default()
//!     };
//!
//!     let client = Client::new(config);
//!     let (tx, mut rx) = tokio::sync::mpsc::channel(1);
//!     client.run(Some(tx)).await?;
//!
//!     if let Some(report) = rx.recv().await {
//!         println!("{}", netspeed::output::output_plain(&report));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`client`] - Discovery loop and parallel transfer orchestration
//! - [`serve`] - Offer broadcasting and request dispatch
//! - [`protocol`] - Wire messages and reports
//! - [`discover`] - Offer listener and discovery state machine
//! - [`tcp`], [`udp`] - Transport implementations
//! - [`stats`] - Per-transfer measurements

pub mod client;
pub mod config;
pub mod discover;
pub mod error;
pub mod net;
pub mod output;
pub mod protocol;
pub mod serve;
pub mod stats;
pub mod tcp;
pub mod udp;

pub use client::{Client, ClientConfig};
pub use error::TransferError;
pub use protocol::{Protocol, RunReport, TransferReport, WorkerOutcome};
pub use serve::{Server, ServerConfig};
