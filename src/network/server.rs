//! Listening side: accept, admit, and hand sockets to connections.

use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::ConnectionError;
use crate::network::admission::IpMarshall;
use crate::network::connection::{Connection, ConnectionContext};
use crate::network::connection_manager::ConnectionManager;
use crate::network::connector::{canonical, os_supports_ipv6};
use crate::network::endpoint::IpMode;

/// Cooldown applied to an IP whose socket could not be set up.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(30);
pub const MAX_CONSECUTIVE_ACCEPT_FAILURES: u32 = 10;
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const LISTEN_BACKLOG: i32 = 1024;
/// Handshake faults tolerated per peer within the observation window.
const HANDSHAKE_GRACE_STRIKES: u32 = 3;
const HANDSHAKE_GRACE_WINDOW: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// `None` listens on every interface of the enabled families.
    pub listen_address: Option<IpAddr>,
    pub port: u16,
    pub ip_mode: IpMode,
    pub ipv6_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            listen_address: None,
            port: 24100,
            ip_mode: IpMode::Both,
            ipv6_enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerStatus {
    Listening,
    /// The accept loop could not re-arm and gave up.
    Faulted(String),
    Stopped,
}

pub struct TcpServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    context: Arc<ConnectionContext>,
    marshall: Arc<IpMarshall>,
    registry: Arc<ConnectionManager>,
    new_connections: broadcast::Sender<Arc<Connection>>,
    status: watch::Sender<ServerStatus>,
}

impl TcpServer {
    pub fn bind(
        settings: &ServerSettings,
        context: Arc<ConnectionContext>,
        marshall: Arc<IpMarshall>,
        registry: Arc<ConnectionManager>,
    ) -> Result<Self, std::io::Error> {
        let listener = bind_listener(settings)?;
        let local_addr = listener.local_addr()?;
        let (new_connections, _) = broadcast::channel(256);
        let (status, _) = watch::channel(ServerStatus::Listening);

        info!(
            "👂 Listening on {} ({}, {:?} transport)",
            local_addr, settings.ip_mode, context.strategy
        );
        Ok(Self {
            listener,
            local_addr,
            context,
            marshall,
            registry,
            new_connections,
            status,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connections whose handshake completed, each published once.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Connection>> {
        self.new_connections.subscribe()
    }

    pub fn status(&self) -> ServerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.status.subscribe()
    }

    pub fn registry(&self) -> &Arc<ConnectionManager> {
        &self.registry
    }

    /// Accept until `shutdown` fires or the listener can no longer re-arm.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> ServerStatus {
        let mut failures = 0u32;
        let status = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break ServerStatus::Stopped,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        failures = 0;
                        self.handle_accepted(stream, addr);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(
                            "⚠️  Accept failed ({}/{}): {}",
                            failures, MAX_CONSECUTIVE_ACCEPT_FAILURES, e
                        );
                        if failures >= MAX_CONSECUTIVE_ACCEPT_FAILURES {
                            error!(
                                "💀 Listener on {} cannot re-arm after {} failures: {}",
                                self.local_addr, failures, e
                            );
                            break ServerStatus::Faulted(e.to_string());
                        }
                        tokio::select! {
                            _ = shutdown.cancelled() => break ServerStatus::Stopped,
                            _ = tokio::time::sleep(ACCEPT_BACKOFF * failures) => {}
                        }
                    }
                }
            }
        };
        info!("🛑 Server on {} stopped: {:?}", self.local_addr, status);
        self.status.send_replace(status.clone());
        status
    }

    fn handle_accepted(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let ip = canonical(addr.ip());
        if !self.marshall.request_clearance(ip) {
            debug!("🚫 Refused connection from {}", addr);
            let _ = SockRef::from(&stream).shutdown(Shutdown::Both);
            return;
        }

        let connection = match Connection::inbound(stream, self.context.clone(), Some(&self.registry)) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("❌ Failed to set up connection from {}: {}", addr, e);
                self.marshall.cooldown(
                    ip,
                    "connection broken",
                    FAILURE_COOLDOWN,
                    Some(&e.to_string()),
                );
                return;
            }
        };
        debug!("🔗 [INBOUND] Accepted connection from {}", addr);

        let server = self.clone();
        tokio::spawn(async move {
            let timeout = server.context.handshake_timeout;
            match connection.wait_for_handshake(timeout).await {
                Ok(()) => {
                    // No subscribers is fine
                    let _ = server.new_connections.send(connection);
                }
                Err(e) => server.handshake_failed(ip, &connection, e).await,
            }
        });
    }

    async fn handshake_failed(&self, ip: IpAddr, connection: &Connection, e: ConnectionError) {
        if matches!(e, ConnectionError::HandshakeTimeout(_)) {
            debug!("⏱️  Handshake with {} timed out", connection.info());
            connection.close(Some(e)).await;
        } else if e.is_peer_fault() {
            self.marshall.quarantine(
                ip,
                "handshake violation",
                None,
                Some(&e.to_string()),
                HANDSHAKE_GRACE_STRIKES,
                HANDSHAKE_GRACE_WINDOW,
            );
        } else {
            debug!("Handshake with {} ended: {}", connection.info(), e);
        }
    }
}

fn bind_listener(settings: &ServerSettings) -> Result<TcpListener, std::io::Error> {
    let ipv6 = settings.ipv6_enabled && os_supports_ipv6();
    let (ip, only_v6) = match (settings.listen_address, settings.ip_mode) {
        (Some(ip @ IpAddr::V6(_)), IpMode::Both) if ipv6 => (ip, false),
        (Some(ip @ IpAddr::V6(_)), _) if ipv6 => (ip, true),
        (Some(IpAddr::V6(_)), _) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "IPv6 listen address but IPv6 is unavailable",
            ))
        }
        (Some(ip), _) => (ip, false),
        (None, IpMode::V4) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), false),
        (None, IpMode::Both) if ipv6 => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), false),
        (None, IpMode::Both) => (IpAddr::V4(Ipv4Addr::UNSPECIFIED), false),
        (None, IpMode::V6) if ipv6 => (IpAddr::V6(Ipv6Addr::UNSPECIFIED), true),
        (None, IpMode::V6) => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "IPv6-only server but IPv6 is unavailable",
            ))
        }
    };

    let addr = SocketAddr::new(ip, settings.port);
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(only_v6)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ipv4_loopback() {
        let settings = ServerSettings {
            listen_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            port: 0,
            ip_mode: IpMode::V4,
            ipv6_enabled: true,
        };
        let listener = bind_listener(&settings).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_dual_stack_accepts_ipv4_clients() {
        if !os_supports_ipv6() {
            return;
        }
        let settings = ServerSettings {
            listen_address: None,
            port: 0,
            ip_mode: IpMode::Both,
            ipv6_enabled: true,
        };
        let Ok(listener) = bind_listener(&settings) else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        let client = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let (_, remote) = listener.accept().await.unwrap();
        assert_eq!(canonical(remote.ip()), IpAddr::V4(Ipv4Addr::LOCALHOST));
        drop(client);
    }

    #[tokio::test]
    async fn test_ipv6_listener_rejected_when_disabled() {
        let settings = ServerSettings {
            listen_address: None,
            port: 0,
            ip_mode: IpMode::V6,
            ipv6_enabled: false,
        };
        assert!(bind_listener(&settings).is_err());
    }
}
