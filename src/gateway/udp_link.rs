use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::{
    net::UdpSocket,
    sync::{Mutex, broadcast},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::{
    common::types::{AnyResult, map_boxed_err},
    gateway::constants::{
        DISCOVERY_ADDRESS_LEN, DISCOVERY_PACKET_SIZE, UDP_BROADCAST_CAPACITY, UDP_RECV_BUF_SIZE,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpConnectionConfig {
    pub server: SocketAddr,
    pub ssrc: u32,
}

/// Our address as the voice server sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ip: String,
    pub port: u16,
}

struct Link {
    socket: Arc<UdpSocket>,
    config: UdpConnectionConfig,
    cancel: CancellationToken,
    reader: JoinHandle<()>,
}

/// The UDP half of a voice session.
///
/// Owns at most one connected socket. Every datagram that socket receives is
/// republished on [`incoming`](Self::incoming); subscribers that fall behind
/// lose the oldest datagrams instead of stalling the reader.
pub struct VoiceUdpConnection {
    link: RwLock<Option<Link>>,
    restart_lock: Mutex<()>,
    incoming: broadcast::Sender<Bytes>,
}

impl Default for VoiceUdpConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl VoiceUdpConnection {
    pub fn new() -> Self {
        let (incoming, _) = broadcast::channel(UDP_BROADCAST_CAPACITY);
        Self {
            link: RwLock::new(None),
            restart_lock: Mutex::new(()),
            incoming,
        }
    }

    /// Connects to `config.server`, replacing any previous socket.
    ///
    /// The old reader is cancelled and joined before the new socket is bound,
    /// so nothing received after this returns is attributed to the old one.
    pub async fn start(&self, config: UdpConnectionConfig) -> AnyResult<()> {
        let _guard = self.restart_lock.lock().await;
        self.shutdown_link().await;

        let bind_addr: SocketAddr = if config.server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(map_boxed_err)?;
        socket.connect(config.server).await.map_err(map_boxed_err)?;
        let socket = Arc::new(socket);

        debug!(
            "UDP connected to {} from {:?} (ssrc {})",
            config.server,
            socket.local_addr().ok(),
            config.ssrc
        );

        let cancel = CancellationToken::new();
        let reader = tokio::spawn(read_loop(
            socket.clone(),
            self.incoming.clone(),
            cancel.clone(),
        ));

        *self.link.write() = Some(Link {
            socket,
            config,
            cancel,
            reader,
        });
        Ok(())
    }

    /// Closes the socket and stops the reader. Safe to call when not started.
    pub async fn stop(&self) {
        let _guard = self.restart_lock.lock().await;
        self.shutdown_link().await;
    }

    async fn shutdown_link(&self) {
        let Some(link) = self.link.write().take() else {
            return;
        };
        link.cancel.cancel();
        let _ = link.reader.await;
        debug!("UDP connection to {} closed", link.config.server);
    }

    pub fn is_started(&self) -> bool {
        self.link.read().is_some()
    }

    pub fn config(&self) -> Option<UdpConnectionConfig> {
        self.link.read().as_ref().map(|l| l.config)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link
            .read()
            .as_ref()
            .and_then(|l| l.socket.local_addr().ok())
    }

    pub fn incoming(&self) -> broadcast::Receiver<Bytes> {
        self.incoming.subscribe()
    }

    /// Sends one datagram to the connected server.
    pub async fn send(&self, data: &[u8]) -> AnyResult<()> {
        let socket = self
            .link
            .read()
            .as_ref()
            .map(|l| l.socket.clone())
            .ok_or_else(|| map_boxed_err("UDP connection not started"))?;
        socket.send(data).await.map_err(map_boxed_err)?;
        Ok(())
    }

    /// Asks the server which address and port our datagrams arrive from.
    ///
    /// Waits for the first datagram after the request; callers wrap this in a
    /// timeout.
    pub async fn discover_ip(&self) -> AnyResult<DiscoveredAddress> {
        let config = self
            .config()
            .ok_or_else(|| map_boxed_err("UDP connection not started"))?;

        trace!("Discovering external address for ssrc {}", config.ssrc);

        // Subscribe before sending so the reply cannot slip past us.
        let mut rx = self.incoming();

        let mut packet = [0u8; DISCOVERY_PACKET_SIZE];
        BigEndian::write_u32(&mut packet[0..4], config.ssrc);
        self.send(&packet).await?;

        let reply = loop {
            match rx.recv().await {
                Ok(datagram) => break datagram,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("IP discovery receiver lagged by {} datagrams", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(map_boxed_err("UDP connection closed during IP discovery"));
                }
            }
        };

        parse_discovery_response(&reply)
    }
}

impl Drop for VoiceUdpConnection {
    fn drop(&mut self) {
        if let Some(link) = self.link.get_mut().take() {
            link.cancel.cancel();
        }
    }
}

/// Reply layout: 4 ignored bytes, a 64-byte NUL-padded address, a BE port.
pub fn parse_discovery_response(data: &[u8]) -> AnyResult<DiscoveredAddress> {
    const PORT_OFFSET: usize = 4 + DISCOVERY_ADDRESS_LEN;

    if data.len() < PORT_OFFSET + 2 {
        return Err(map_boxed_err(format!(
            "Malformed IP discovery response: {} bytes",
            data.len()
        )));
    }

    let ip = std::str::from_utf8(&data[4..PORT_OFFSET])
        .map_err(map_boxed_err)?
        .trim_end_matches('\0')
        .to_string();
    if ip.is_empty() {
        return Err(map_boxed_err("IP discovery response carried no address"));
    }

    let port = BigEndian::read_u16(&data[PORT_OFFSET..PORT_OFFSET + 2]);
    Ok(DiscoveredAddress { ip, port })
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    incoming: broadcast::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_RECV_BUF_SIZE];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            res = socket.recv(&mut buf) => match res {
                Ok(n) => {
                    // No subscribers is fine; the datagram is simply dropped.
                    let _ = incoming.send(Bytes::copy_from_slice(&buf[..n]));
                }
                Err(e) => {
                    // ICMP port-unreachable surfaces here on some platforms.
                    trace!("UDP recv error: {}", e);
                }
            }
        }
    }
    trace!("UDP read loop stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn discovery_reply(ip: &str, port: u16) -> Vec<u8> {
        let mut reply = vec![0u8; 4];
        let mut address = ip.as_bytes().to_vec();
        address.resize(64, 0);
        reply.extend_from_slice(&address);
        reply.extend_from_slice(&port.to_be_bytes());
        reply
    }

    async fn fake_server() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    #[test]
    fn test_parse_discovery_response() {
        let parsed = parse_discovery_response(&discovery_reply("203.0.113.5", 12345)).unwrap();
        assert_eq!(
            parsed,
            DiscoveredAddress {
                ip: "203.0.113.5".into(),
                port: 12345
            }
        );
    }

    #[test]
    fn test_parse_discovery_rejects_truncated() {
        let reply = discovery_reply("203.0.113.5", 12345);
        assert!(parse_discovery_response(&reply[..69]).is_err());
        assert!(parse_discovery_response(&discovery_reply("", 1)).is_err());
    }

    #[tokio::test]
    async fn test_discover_ip_against_scripted_server() {
        let (server, server_addr) = fake_server().await;
        let udp = VoiceUdpConnection::new();
        udp.start(UdpConnectionConfig {
            server: server_addr,
            ssrc: 42,
        })
        .await
        .unwrap();

        let responder = tokio::spawn(async move {
            let mut buf = [0u8; 128];
            let (n, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(n, 70);
            assert_eq!(&buf[..4], &42u32.to_be_bytes());
            assert!(buf[4..70].iter().all(|&b| b == 0));
            server
                .send_to(&discovery_reply("203.0.113.5", 12345), from)
                .await
                .unwrap();
        });

        let discovered = tokio::time::timeout(Duration::from_secs(5), udp.discover_ip())
            .await
            .unwrap()
            .unwrap();
        responder.await.unwrap();

        assert_eq!(discovered.ip, "203.0.113.5");
        assert_eq!(discovered.port, 12345);
        udp.stop().await;
    }

    #[tokio::test]
    async fn test_incoming_fans_out_to_every_subscriber() {
        let (server, server_addr) = fake_server().await;
        let udp = VoiceUdpConnection::new();
        udp.start(UdpConnectionConfig {
            server: server_addr,
            ssrc: 1,
        })
        .await
        .unwrap();

        let mut a = udp.incoming();
        let mut b = udp.incoming();
        server
            .send_to(b"hello", udp.local_addr().unwrap())
            .await
            .unwrap();

        assert_eq!(a.recv().await.unwrap().as_ref(), b"hello");
        assert_eq!(b.recv().await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn test_restart_replaces_socket() {
        let (server, server_addr) = fake_server().await;
        let udp = VoiceUdpConnection::new();

        udp.start(UdpConnectionConfig {
            server: server_addr,
            ssrc: 1,
        })
        .await
        .unwrap();
        let first = udp.local_addr().unwrap();

        udp.start(UdpConnectionConfig {
            server: server_addr,
            ssrc: 2,
        })
        .await
        .unwrap();
        let second = udp.local_addr().unwrap();
        assert_ne!(first, second);
        assert_eq!(udp.config().unwrap().ssrc, 2);

        let mut rx = udp.incoming();

        // The first socket is gone: datagrams aimed at it never surface.
        server.send_to(b"stale", first).await.unwrap();
        server.send_to(b"fresh", second).await.unwrap();
        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), b"fresh");

        // Outbound traffic leaves from the second socket.
        udp.send(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, second);
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let udp = VoiceUdpConnection::new();
        assert!(udp.send(b"x").await.is_err());
        assert!(udp.discover_ip().await.is_err());
        udp.stop().await;
        assert!(!udp.is_started());
    }
}
