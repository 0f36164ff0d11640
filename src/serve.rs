//! Server mode implementation
//!
//! Broadcasts offers and answers transfer requests: one task per accepted TCP
//! connection, one task per valid UDP request.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::discover;
use crate::net;
use crate::protocol::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DISCOVERY_PORT, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT, OfferMessage,
    REQUEST_LEN, RequestMessage,
};
use crate::tcp;
use crate::udp;

pub const DEFAULT_BROADCAST_INTERVAL: Duration = Duration::from_secs(1);
/// Pause after a failed accept so a persistent error cannot spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Local address for the listeners and the broadcast socket
    pub bind_ip: IpAddr,
    /// TCP listening port; 0 picks one and advertises it
    pub tcp_port: u16,
    /// UDP request port; 0 picks one and advertises it
    pub udp_port: u16,
    pub discovery_port: u16,
    pub broadcast_address: IpAddr,
    pub broadcast_interval: Duration,
    pub chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: net::UNSPECIFIED_V4,
            tcp_port: DEFAULT_TCP_PORT,
            udp_port: DEFAULT_UDP_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            broadcast_address: IpAddr::V4(Ipv4Addr::BROADCAST),
            broadcast_interval: DEFAULT_BROADCAST_INTERVAL,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("chunk size must be positive");
        }
        if self.broadcast_interval.is_zero() {
            anyhow::bail!("broadcast interval must be positive");
        }
        Ok(())
    }
}

pub struct Server {
    config: ServerConfig,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Bind every socket, then serve until cancelled.
    ///
    /// Only bind failures are returned; per-connection errors are logged.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.config.validate()?;

        let bind_ip = self.config.bind_ip;
        let tcp_addr = SocketAddr::new(bind_ip, self.config.tcp_port);
        let udp_addr = SocketAddr::new(bind_ip, self.config.udp_port);

        let listener = net::create_tcp_listener(tcp_addr).await?;
        let udp_socket = net::create_udp_socket(udp_addr, false).await?;
        let broadcast_socket = net::create_broadcast_socket(bind_ip).await?;

        let offer = OfferMessage {
            udp_port: udp_socket.local_addr()?.port(),
            tcp_port: listener.local_addr()?.port(),
        };
        let target = SocketAddr::new(self.config.broadcast_address, self.config.discovery_port);

        info!(
            "Server started: TCP {}, UDP {}",
            listener.local_addr()?,
            udp_socket.local_addr()?
        );

        let broadcaster = tokio::spawn(discover::broadcast_offers(
            broadcast_socket,
            target,
            offer,
            self.config.broadcast_interval,
            self.cancel.child_token(),
        ));
        let tcp_loop = tokio::spawn(accept_loop(listener, self.cancel.child_token()));
        let udp_loop = tokio::spawn(request_loop(
            udp_socket,
            self.config.chunk_size,
            self.cancel.child_token(),
        ));

        let (broadcaster, tcp_loop, udp_loop) = tokio::join!(broadcaster, tcp_loop, udp_loop);
        for (name, result) in [("broadcaster", broadcaster), ("tcp", tcp_loop), ("udp", udp_loop)] {
            if let Err(e) = result {
                error!("{} loop ended abnormally: {}", name, e);
            }
        }

        info!("Server stopped");
        Ok(())
    }
}

/// Accept TCP connections and spawn a responder for each
pub async fn accept_loop(listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer_addr) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("TCP accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        info!("Accepted connection from {}", peer_addr);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            match tcp::serve_request(stream, cancel).await {
                Ok(bytes) => info!("Sent {} bytes to {}", bytes, peer_addr),
                Err(e) => error!("TCP client {} error: {}", peer_addr, e),
            }
        });
    }

    debug!("TCP accept loop stopped");
}

/// Receive UDP requests and spawn a segment sender for each valid one
pub async fn request_loop(socket: UdpSocket, chunk_size: usize, cancel: CancellationToken) {
    let mut buffer = vec![0u8; REQUEST_LEN.max(512)];

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => received,
        };

        let (n, peer_addr) = match received {
            Ok(received) => received,
            Err(e) => {
                warn!("UDP receive error: {}", e);
                continue;
            }
        };

        let request = match RequestMessage::decode(&buffer[..n]) {
            Ok(request) => request,
            Err(e) => {
                trace!("Dropped datagram from {}: {}", peer_addr, e);
                continue;
            }
        };

        info!("UDP request from {}: {} bytes", peer_addr, request.file_size);
        let cancel = cancel.clone();

        tokio::spawn(async move {
            if let Err(e) = udp::serve_request(peer_addr, request, chunk_size, cancel).await {
                error!("UDP client {} error: {}", peer_addr, e);
            }
        });
    }

    debug!("UDP request loop stopped");
}
