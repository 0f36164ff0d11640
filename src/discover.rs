//! LAN discovery via UDP broadcast offers
//!
//! Servers broadcast a fixed [`OfferMessage`] once per interval. Clients bind
//! the discovery port and take the first valid offer as the target of one
//! test run; offers that arrive while a run is in progress are ignored.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::net;
use crate::protocol::{OFFER_LEN, OfferMessage};

/// Largest datagram read from the discovery port; offers are 9 bytes
const DISCOVERY_BUFFER: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiscoveredServer {
    pub ip: IpAddr,
    pub udp_port: u16,
    pub tcp_port: u16,
}

impl DiscoveredServer {
    pub fn from_offer(from: SocketAddr, offer: OfferMessage) -> Self {
        Self {
            ip: from.ip(),
            udp_port: offer.udp_port,
            tcp_port: offer.tcp_port,
        }
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.udp_port)
    }
}

impl fmt::Display for DiscoveredServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (tcp {}, udp {})", self.ip, self.tcp_port, self.udp_port)
    }
}

/// Client life cycle:
/// `Idle -> Discovering -> Transferring -> Reporting -> Discovering`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Idle,
    Discovering,
    Transferring,
    Reporting,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientState::Idle => write!(f, "idle"),
            ClientState::Discovering => write!(f, "discovering"),
            ClientState::Transferring => write!(f, "transferring"),
            ClientState::Reporting => write!(f, "reporting"),
        }
    }
}

/// Offer handling without any I/O.
///
/// Only the first valid offer seen while `Discovering` starts a run; every
/// other datagram leaves the state untouched.
#[derive(Debug, Default)]
pub struct DiscoveryState {
    state: ClientState,
    ignored: u64,
}

impl DiscoveryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Datagrams dropped so far: malformed, or valid but not wanted
    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    pub fn start(&mut self) {
        if self.state == ClientState::Idle {
            self.state = ClientState::Discovering;
        }
    }

    pub fn on_datagram(&mut self, buf: &[u8], from: SocketAddr) -> Option<DiscoveredServer> {
        let offer = match OfferMessage::decode(buf) {
            Ok(offer) => offer,
            Err(e) => {
                trace!("Dropped datagram from {}: {}", from, e);
                self.ignored += 1;
                return None;
            }
        };

        if self.state != ClientState::Discovering {
            debug!("Ignoring offer from {} while {}", from, self.state);
            self.ignored += 1;
            return None;
        }

        self.state = ClientState::Transferring;
        Some(DiscoveredServer::from_offer(from, offer))
    }

    pub fn finish_run(&mut self) {
        if self.state == ClientState::Transferring {
            self.state = ClientState::Reporting;
        }
    }

    pub fn resume(&mut self) {
        if self.state == ClientState::Reporting {
            self.state = ClientState::Discovering;
        }
    }
}

/// Client-side listener on the discovery port
pub struct DiscoveryListener {
    socket: UdpSocket,
    state: DiscoveryState,
    buffer: Vec<u8>,
}

impl DiscoveryListener {
    pub async fn bind(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = net::create_udp_socket(addr, true).await?;
        info!("Listening for offers on UDP {}", socket.local_addr()?);
        Ok(Self {
            socket,
            state: DiscoveryState::new(),
            buffer: vec![0u8; DISCOVERY_BUFFER],
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn state(&self) -> ClientState {
        self.state.state()
    }

    /// Wait for the next offer that starts a run. `None` once cancelled.
    pub async fn next_offer(&mut self, cancel: &CancellationToken) -> Option<DiscoveredServer> {
        self.state.start();

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => return None,
                received = self.socket.recv_from(&mut self.buffer) => received,
            };

            match received {
                Ok((n, from)) => {
                    if let Some(server) = self.state.on_datagram(&self.buffer[..n], from) {
                        info!("Received offer from {}", server);
                        return Some(server);
                    }
                }
                Err(e) => {
                    warn!("Discovery receive error: {}", e);
                }
            }
        }
    }

    /// Leave `Transferring`, throw away offers queued during the run, and go
    /// back to `Discovering`. Returns how many queued datagrams were dropped.
    pub fn finish_run(&mut self) -> u64 {
        self.state.finish_run();

        let before = self.state.ignored();
        loop {
            match self.socket.try_recv_from(&mut self.buffer) {
                Ok((n, from)) => {
                    let _ = self.state.on_datagram(&self.buffer[..n], from);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("Discovery drain error: {}", e);
                    break;
                }
            }
        }
        let drained = self.state.ignored() - before;

        self.state.resume();
        drained
    }
}

/// Server side: send `offer` to `target` every `interval` until cancelled.
///
/// Send failures are logged and the loop carries on.
pub async fn broadcast_offers(
    socket: UdpSocket,
    target: SocketAddr,
    offer: OfferMessage,
    interval: Duration,
    cancel: CancellationToken,
) {
    let packet: [u8; OFFER_LEN] = offer.encode();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        "Broadcasting offers to {} every {:?} (tcp {}, udp {})",
        target, interval, offer.tcp_port, offer.udp_port
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match socket.send_to(&packet, target).await {
            Ok(_) => debug!("Offer sent to {}", target),
            Err(e) => warn!("Offer broadcast to {} failed: {}", target, e),
        }
    }

    debug!("Offer broadcaster stopped");
}

/// Listen passively for `timeout` and return every distinct server heard
pub async fn discover(
    addr: SocketAddr,
    timeout: Duration,
) -> anyhow::Result<Vec<DiscoveredServer>> {
    let socket = net::create_udp_socket(addr, true).await?;
    let mut buffer = vec![0u8; DISCOVERY_BUFFER];
    let mut servers: Vec<DiscoveredServer> = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;

    info!("Searching for servers on UDP {}...", socket.local_addr()?);

    loop {
        let received =
            match tokio::time::timeout_at(deadline, socket.recv_from(&mut buffer)).await {
                Ok(received) => received,
                Err(_) => break,
            };

        match received {
            Ok((n, from)) => match OfferMessage::decode(&buffer[..n]) {
                Ok(offer) => {
                    let server = DiscoveredServer::from_offer(from, offer);
                    if !servers.contains(&server) {
                        info!("Found server: {}", server);
                        servers.push(server);
                    }
                }
                Err(e) => trace!("Dropped datagram from {}: {}", from, e),
            },
            Err(e) => warn!("Discovery receive error: {}", e),
        }
    }

    Ok(servers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestMessage;

    fn from() -> SocketAddr {
        "192.168.1.20:40000".parse().unwrap()
    }

    fn offer_bytes() -> [u8; OFFER_LEN] {
        OfferMessage {
            udp_port: 30002,
            tcp_port: 30003,
        }
        .encode()
    }

    #[test]
    fn test_first_offer_starts_run() {
        let mut state = DiscoveryState::new();
        state.start();
        assert_eq!(state.state(), ClientState::Discovering);

        let server = state.on_datagram(&offer_bytes(), from()).unwrap();
        assert_eq!(server.ip, from().ip());
        assert_eq!(server.tcp_addr().port(), 30003);
        assert_eq!(server.udp_addr().port(), 30002);
        assert_eq!(state.state(), ClientState::Transferring);
    }

    #[test]
    fn test_duplicate_offer_ignored_while_transferring() {
        let mut state = DiscoveryState::new();
        state.start();
        assert!(state.on_datagram(&offer_bytes(), from()).is_some());

        assert!(state.on_datagram(&offer_bytes(), from()).is_none());
        assert_eq!(state.state(), ClientState::Transferring);
        assert_eq!(state.ignored(), 1);

        state.finish_run();
        assert_eq!(state.state(), ClientState::Reporting);
        assert!(state.on_datagram(&offer_bytes(), from()).is_none());

        state.resume();
        assert_eq!(state.state(), ClientState::Discovering);
        assert!(state.on_datagram(&offer_bytes(), from()).is_some());
    }

    #[test]
    fn test_invalid_datagrams_leave_state_unchanged() {
        let mut state = DiscoveryState::new();
        state.start();

        let mut bad_cookie = offer_bytes();
        bad_cookie[0] ^= 0xFF;
        let wrong_type = RequestMessage { file_size: 10 }.encode();

        for datagram in [&bad_cookie[..], &wrong_type[..], &offer_bytes()[..5], &[][..]] {
            assert!(state.on_datagram(datagram, from()).is_none());
            assert_eq!(state.state(), ClientState::Discovering);
        }
        assert_eq!(state.ignored(), 4);
    }

    #[test]
    fn test_offer_before_start_ignored() {
        let mut state = DiscoveryState::new();
        assert!(state.on_datagram(&offer_bytes(), from()).is_none());
        assert_eq!(state.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn test_listener_drains_queued_offers() {
        let mut listener = DiscoveryListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let target = listener.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender.send_to(&offer_bytes(), target).await.unwrap();
        let cancel = CancellationToken::new();
        let server = listener.next_offer(&cancel).await.unwrap();
        assert_eq!(server.ip, sender.local_addr().unwrap().ip());
        assert_eq!(listener.state(), ClientState::Transferring);

        // Offers keep arriving during the run
        sender.send_to(&offer_bytes(), target).await.unwrap();
        sender.send_to(&offer_bytes(), target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(listener.finish_run(), 2);
        assert_eq!(listener.state(), ClientState::Discovering);
    }

    #[tokio::test]
    async fn test_next_offer_cancelled() {
        let mut listener = DiscoveryListener::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(listener.next_offer(&cancel).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcaster_repeats_offer() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = receiver.local_addr().unwrap();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cancel = CancellationToken::new();
        let offer = OfferMessage {
            udp_port: 1,
            tcp_port: 2,
        };

        let handle = tokio::spawn(broadcast_offers(
            socket,
            target,
            offer,
            Duration::from_millis(20),
            cancel.clone(),
        ));

        let mut buffer = [0u8; 64];
        for _ in 0..3 {
            let (n, _) = receiver.recv_from(&mut buffer).await.unwrap();
            assert_eq!(OfferMessage::decode(&buffer[..n]).unwrap(), offer);
        }

        cancel.cancel();
        handle.await.unwrap();
    }
}
