//! Outbound socket establishment with IPv4/IPv6 racing.
//!
//! When a target resolves to both families the IPv4 attempt gets a short
//! head start. If it has not connected by then the IPv6 attempt is launched
//! alongside it and whichever connects first wins; the loser is shut down and
//! closed in the background.

use async_trait::async_trait;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::error::ConnectError;
use crate::network::endpoint::{Endpoint, IpMode};
use crate::network::handshake::PROBE_MARKER;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const PRIMARY_GRACE: Duration = Duration::from_secs(1);
const UNBOUNDED_WAIT: Duration = Duration::from_secs(86400 * 365);

/// Caller hook applied to every socket before it connects.
pub type ConfigureSocket = Arc<dyn Fn(&Socket) -> std::io::Result<()> + Send + Sync>;

/// Default tuning for persistent peer links.
pub fn default_socket_config() -> ConfigureSocket {
    Arc::new(|socket: &Socket| {
        // Disable Nagle's algorithm to prevent batching of small messages
        socket.set_tcp_nodelay(true)?;
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(30))
            .with_interval(Duration::from_secs(10));
        socket.set_tcp_keepalive(&keepalive)?;
        Ok(())
    })
}

/// Whether this host can open IPv6 sockets at all (probed once).
pub fn os_supports_ipv6() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)).is_ok())
}

/// The primitive that turns an address into a connected socket.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Stream: Send + 'static;

    async fn dial(
        &self,
        addr: SocketAddr,
        configure: ConfigureSocket,
    ) -> std::io::Result<Self::Stream>;

    /// Shut down and close a socket that lost a race.
    async fn dispose(&self, stream: Self::Stream);

    async fn send(&self, stream: &mut Self::Stream, bytes: &[u8]) -> std::io::Result<()>;
}

/// Real TCP dialing through `socket2` + tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    type Stream = TcpStream;

    async fn dial(
        &self,
        addr: SocketAddr,
        configure: ConfigureSocket,
    ) -> std::io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        configure(&socket)?;
        socket.set_nonblocking(true)?;
        let socket = TcpSocket::from_std_stream(socket.into());
        socket.connect(addr).await
    }

    async fn dispose(&self, stream: TcpStream) {
        let _ = SockRef::from(&stream).shutdown(std::net::Shutdown::Both);
        drop(stream);
    }

    async fn send(&self, stream: &mut TcpStream, bytes: &[u8]) -> std::io::Result<()> {
        stream.write_all(bytes).await?;
        stream.flush().await
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub enable_dual_socket: bool,
    pub force_ipv4: bool,
    pub ipv6_enabled: bool,
    pub grace: Duration,
}

impl Default for ConnectorSettings {
    fn default() -> Self {
        Self {
            enable_dual_socket: true,
            force_ipv4: false,
            ipv6_enabled: true,
            grace: PRIMARY_GRACE,
        }
    }
}

pub struct DualStackConnector<D: Dialer = TcpDialer> {
    dialer: Arc<D>,
    settings: ConnectorSettings,
    ipv6_supported: bool,
}

impl DualStackConnector<TcpDialer> {
    pub fn new(settings: ConnectorSettings) -> Self {
        Self::with_dialer(TcpDialer, settings, os_supports_ipv6())
    }
}

impl<D: Dialer> DualStackConnector<D> {
    pub fn with_dialer(dialer: D, settings: ConnectorSettings, ipv6_supported: bool) -> Self {
        Self {
            dialer: Arc::new(dialer),
            settings,
            ipv6_supported,
        }
    }

    pub fn settings(&self) -> &ConnectorSettings {
        &self.settings
    }

    fn ipv6_usable(&self) -> bool {
        self.ipv6_supported && self.settings.ipv6_enabled && !self.settings.force_ipv4
    }

    /// Resolve the endpoint into at most one IPv4 and one IPv6 candidate.
    async fn candidates(
        &self,
        endpoint: &Endpoint,
    ) -> Result<(Option<SocketAddr>, Option<SocketAddr>), ConnectError> {
        let mode = endpoint.ip_mode();
        let addrs: Vec<SocketAddr> = match endpoint.literal_ip() {
            Some(ip) => vec![SocketAddr::new(canonical(ip), endpoint.port())],
            None => tokio::net::lookup_host((endpoint.host(), endpoint.port()))
                .await
                .map_err(|source| ConnectError::Resolve {
                    target: endpoint.to_string(),
                    source,
                })?
                .collect(),
        };

        let v4 = addrs
            .iter()
            .copied()
            .find(|a| a.is_ipv4() && mode.allows_v4());
        let v6 = addrs
            .iter()
            .copied()
            .find(|a| a.is_ipv6() && mode.allows_v6() && self.ipv6_usable());
        Ok((v4, v6))
    }

    /// Open a connected socket to `endpoint`.
    ///
    /// `send_on_connect` is written by the winning socket only.
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        configure: ConfigureSocket,
        connect_timeout: Duration,
        send_on_connect: Option<&[u8]>,
    ) -> Result<D::Stream, ConnectError> {
        if endpoint.is_ipv6_only() && !self.ipv6_usable() {
            return Err(ConnectError::Ipv6Unavailable(endpoint.to_string()));
        }
        let (v4, v6) = self.candidates(endpoint).await?;

        let mut stream = match (v4, v6) {
            (Some(primary), Some(secondary)) if self.settings.enable_dual_socket => {
                self.race(endpoint, primary, secondary, configure, connect_timeout)
                    .await?
            }
            (Some(addr), _) | (None, Some(addr)) => {
                debug!("🔗 Single-stack connect to {} via {}", endpoint, addr);
                self.single(endpoint, addr, configure, connect_timeout).await?
            }
            (None, None) => {
                let mode = if self.settings.force_ipv4 {
                    IpMode::V4
                } else {
                    endpoint.ip_mode()
                };
                return Err(ConnectError::NoAddress {
                    target: endpoint.to_string(),
                    mode: mode.to_string(),
                });
            }
        };

        if let Some(bytes) = send_on_connect {
            if let Err(e) = self.dialer.send(&mut stream, bytes).await {
                self.dialer.dispose(stream).await;
                return Err(e.into());
            }
        }
        Ok(stream)
    }

    async fn single(
        &self,
        endpoint: &Endpoint,
        addr: SocketAddr,
        configure: ConfigureSocket,
        connect_timeout: Duration,
    ) -> Result<D::Stream, ConnectError> {
        match timeout(connect_timeout, self.dialer.dial(addr, configure)).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ConnectError::TimedOut {
                target: endpoint.to_string(),
                timeout: connect_timeout,
            }),
        }
    }

    fn spawn_attempt(
        &self,
        addr: SocketAddr,
        configure: ConfigureSocket,
    ) -> JoinHandle<std::io::Result<D::Stream>> {
        let dialer = self.dialer.clone();
        tokio::spawn(async move { dialer.dial(addr, configure).await })
    }

    /// Abort a pending attempt and close whatever it may still produce.
    fn discard(&self, attempt: JoinHandle<std::io::Result<D::Stream>>) {
        let dialer = self.dialer.clone();
        attempt.abort();
        tokio::spawn(async move {
            if let Ok(Ok(stream)) = attempt.await {
                dialer.dispose(stream).await;
            }
        });
    }

    async fn race(
        &self,
        endpoint: &Endpoint,
        primary_addr: SocketAddr,
        secondary_addr: SocketAddr,
        configure: ConfigureSocket,
        connect_timeout: Duration,
    ) -> Result<D::Stream, ConnectError> {
        let now = Instant::now();
        // A timeout past the end of the clock means no deadline
        let deadline = now
            .checked_add(connect_timeout)
            .unwrap_or_else(|| now + UNBOUNDED_WAIT);
        let grace = self.settings.grace.min(connect_timeout);
        let mut primary = self.spawn_attempt(primary_addr, configure.clone());

        let mut primary_live = match timeout(grace, &mut primary).await {
            Ok(Ok(Ok(stream))) => {
                debug!("🔗 {} connected over IPv4 within grace", endpoint);
                return Ok(stream);
            }
            Ok(Ok(Err(e))) => {
                debug!("IPv4 attempt to {} failed: {}", endpoint, e);
                false
            }
            Ok(Err(join)) => {
                warn!("IPv4 attempt to {} aborted: {}", endpoint, join);
                false
            }
            Err(_) => true,
        };

        debug!(
            "🔀 Racing IPv6 {} against {} IPv4 {}",
            secondary_addr,
            if primary_live { "pending" } else { "failed" },
            primary_addr
        );
        let mut secondary = self.spawn_attempt(secondary_addr, configure);
        let mut secondary_live = true;
        let mut last_error: Option<std::io::Error> = None;

        let winner = loop {
            if !primary_live && !secondary_live {
                break None;
            }
            tokio::select! {
                result = &mut primary, if primary_live => {
                    primary_live = false;
                    match result {
                        Ok(Ok(stream)) => break Some((stream, "IPv4")),
                        Ok(Err(e)) => last_error = Some(e),
                        Err(join) => debug!("IPv4 attempt task ended: {}", join),
                    }
                }
                result = &mut secondary, if secondary_live => {
                    secondary_live = false;
                    match result {
                        Ok(Ok(stream)) => break Some((stream, "IPv6")),
                        Ok(Err(e)) => last_error = Some(e),
                        Err(join) => debug!("IPv6 attempt task ended: {}", join),
                    }
                }
                _ = sleep_until(deadline) => break None,
            }
        };

        if primary_live || !primary.is_finished() {
            self.discard(primary);
        }
        if secondary_live || !secondary.is_finished() {
            self.discard(secondary);
        }

        match winner {
            Some((stream, family)) => {
                info!("🔗 {} won the dual-stack race to {}", family, endpoint);
                Ok(stream)
            }
            None if Instant::now() >= deadline => Err(ConnectError::TimedOut {
                target: endpoint.to_string(),
                timeout: connect_timeout,
            }),
            None => Err(last_error
                .map(ConnectError::Io)
                .unwrap_or_else(|| ConnectError::TimedOut {
                    target: endpoint.to_string(),
                    timeout: connect_timeout,
                })),
        }
    }

    /// Counter-connect: prove `endpoint` accepts connections, then hang up.
    pub async fn counter_connect(&self, endpoint: &Endpoint, connect_timeout: Duration) -> bool {
        match self
            .connect(
                endpoint,
                default_socket_config(),
                connect_timeout,
                Some(&PROBE_MARKER),
            )
            .await
        {
            Ok(stream) => {
                self.dialer.dispose(stream).await;
                debug!("📡 Counter-connect to {} succeeded", endpoint);
                true
            }
            Err(e) => {
                debug!("📡 Counter-connect to {} failed: {}", endpoint, e);
                false
            }
        }
    }
}

/// Collapse IPv4-mapped IPv6 addresses to plain IPv4.
pub fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map(IpAddr::V4)
            .unwrap_or(IpAddr::V6(v6)),
        v4 => v4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Socket double that counts how many are open.
    struct FakeSocket {
        addr: SocketAddr,
        open: Arc<AtomicUsize>,
    }

    impl Drop for FakeSocket {
        fn drop(&mut self) {
            self.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct FakeDialer {
        v4_delay: Option<Duration>,
        v6_delay: Option<Duration>,
        open: Arc<AtomicUsize>,
        disposed: Arc<AtomicUsize>,
        dials: Arc<AtomicUsize>,
    }

    impl FakeDialer {
        fn new(v4_delay: Option<Duration>, v6_delay: Option<Duration>) -> Self {
            Self {
                v4_delay,
                v6_delay,
                open: Arc::new(AtomicUsize::new(0)),
                disposed: Arc::new(AtomicUsize::new(0)),
                dials: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        type Stream = FakeSocket;

        async fn dial(
            &self,
            addr: SocketAddr,
            _configure: ConfigureSocket,
        ) -> std::io::Result<FakeSocket> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let delay = if addr.is_ipv4() {
                self.v4_delay
            } else {
                self.v6_delay
            };
            match delay {
                Some(d) => {
                    tokio::time::sleep(d).await;
                    self.open.fetch_add(1, Ordering::SeqCst);
                    Ok(FakeSocket {
                        addr,
                        open: self.open.clone(),
                    })
                }
                None => Err(std::io::ErrorKind::ConnectionRefused.into()),
            }
        }

        async fn dispose(&self, stream: FakeSocket) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
            drop(stream);
        }

        async fn send(&self, _stream: &mut FakeSocket, _bytes: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn dual_connector(dialer: FakeDialer) -> DualStackConnector<FakeDialer> {
        DualStackConnector::with_dialer(dialer, ConnectorSettings::default(), true)
    }

    async fn connect_pair(
        connector: &DualStackConnector<FakeDialer>,
    ) -> Result<FakeSocket, ConnectError> {
        let v4: SocketAddr = "192.0.2.10:9000".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::10]:9000".parse().unwrap();
        connector
            .race(
                &Endpoint::new("dual.example", 9000, IpMode::Both),
                v4,
                v6,
                default_socket_config(),
                DEFAULT_CONNECT_TIMEOUT,
            )
            .await
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_within_grace_skips_secondary() {
        let dialer = FakeDialer::new(Some(Duration::from_millis(200)), Some(Duration::from_millis(50)));
        let dials = dialer.dials.clone();
        let connector = dual_connector(dialer);

        let socket = connect_pair(&connector).await.unwrap();
        assert!(socket.addr.is_ipv4());
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_faster_secondary_wins_and_loser_is_closed() {
        let dialer = FakeDialer::new(Some(Duration::from_millis(3000)), Some(Duration::from_millis(100)));
        let open = dialer.open.clone();
        let connector = dual_connector(dialer);

        let socket = connect_pair(&connector).await.unwrap();
        assert!(socket.addr.is_ipv6());
        assert_eq!(open.load(Ordering::SeqCst), 1);

        // The aborted IPv4 attempt never produces a socket
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(open.load(Ordering::SeqCst), 1);
        drop(socket);
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_still_races() {
        let dialer = FakeDialer::new(Some(Duration::from_millis(1500)), Some(Duration::from_millis(4000)));
        let connector = dual_connector(dialer);

        let socket = connector
            .race(
                &Endpoint::new("dual.example", 9000, IpMode::Both),
                "192.0.2.10:9000".parse().unwrap(),
                "[2001:db8::10]:9000".parse().unwrap(),
                default_socket_config(),
                Duration::MAX,
            )
            .await
            .unwrap();
        assert!(socket.addr.is_ipv4());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_after_grace_beats_slower_secondary() {
        let dialer = FakeDialer::new(Some(Duration::from_millis(1500)), Some(Duration::from_millis(4000)));
        let open = dialer.open.clone();
        let connector = dual_connector(dialer);

        let socket = connect_pair(&connector).await.unwrap();
        assert!(socket.addr.is_ipv4());
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(open.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_primary_falls_through_to_secondary() {
        let dialer = FakeDialer::new(None, Some(Duration::from_millis(2500)));
        let connector = dual_connector(dialer);
        let socket = connect_pair(&connector).await.unwrap();
        assert!(socket.addr.is_ipv6());
    }

    #[tokio::test(start_paused = true)]
    async fn test_both_families_failing_reports_error() {
        let connector = dual_connector(FakeDialer::new(None, None));
        assert!(matches!(
            connect_pair(&connector).await,
            Err(ConnectError::Io(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_race_times_out_without_leaks() {
        let dialer = FakeDialer::new(Some(Duration::from_secs(30)), Some(Duration::from_secs(30)));
        let open = dialer.open.clone();
        let connector = dual_connector(dialer);
        assert!(matches!(
            connect_pair(&connector).await,
            Err(ConnectError::TimedOut { .. })
        ));
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(open.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ipv6_only_target_fails_fast_when_unsupported() {
        let dialer = FakeDialer::new(Some(Duration::ZERO), Some(Duration::ZERO));
        let dials = dialer.dials.clone();
        let connector = DualStackConnector::with_dialer(dialer, ConnectorSettings::default(), false);
        let result = connector
            .connect(
                &"[2001:db8::1]:9000".parse().unwrap(),
                default_socket_config(),
                DEFAULT_CONNECT_TIMEOUT,
                None,
            )
            .await;
        assert!(matches!(result, Err(ConnectError::Ipv6Unavailable(_))));
        assert_eq!(dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_ipv4_rejects_v6_literal() {
        let settings = ConnectorSettings {
            force_ipv4: true,
            ..Default::default()
        };
        let connector = DualStackConnector::with_dialer(
            FakeDialer::new(Some(Duration::ZERO), Some(Duration::ZERO)),
            settings,
            true,
        );
        let result = connector
            .connect(
                &"[2001:db8::1]:9000".parse().unwrap(),
                default_socket_config(),
                DEFAULT_CONNECT_TIMEOUT,
                None,
            )
            .await;
        assert!(matches!(result, Err(ConnectError::Ipv6Unavailable(_))));
    }

    #[tokio::test]
    async fn test_literal_v4_single_attempt() {
        let dialer = FakeDialer::new(Some(Duration::ZERO), Some(Duration::ZERO));
        let dials = dialer.dials.clone();
        let connector = dual_connector(dialer);
        let socket = connector
            .connect(
                &"192.0.2.1:9000".parse().unwrap(),
                default_socket_config(),
                DEFAULT_CONNECT_TIMEOUT,
                Some(b"hello"),
            )
            .await
            .unwrap();
        assert!(socket.addr.is_ipv4());
        assert_eq!(dials.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_canonical_unmaps_ipv4() {
        let mapped: IpAddr = "::ffff:203.0.113.5".parse().unwrap();
        assert_eq!(canonical(mapped), "203.0.113.5".parse::<IpAddr>().unwrap());
        let v6: IpAddr = "2001:db8::1".parse().unwrap();
        assert_eq!(canonical(v6), v6);
    }
}
