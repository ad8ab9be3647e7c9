//! One TCP link to a peer: handshake, framed I/O, latency and keep-alive.
//!
//! A connection owns a read-loop task that feeds arriving bytes through the
//! handshake first and the frame reader afterwards. Sends take the writer
//! mutex for the whole frame so concurrent senders never interleave.
//! Teardown goes through [`Connection::close`], which is idempotent and
//! cancels the read loop before the socket is shut down.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use socket2::{SockRef, Socket};
use std::mem::MaybeUninit;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConnectionError, ProtocolFault};
use crate::network::codec::{content_hash, ProtocolCodec, SendCache};
use crate::network::connection_manager::ConnectionManager;
use crate::network::connection_state::{ConnectionState, ConnectionStateMachine};
use crate::network::connector::{default_socket_config, ConfigureSocket, DualStackConnector};
use crate::network::endpoint::Endpoint;
use crate::network::events::{
    ConnectionDirection, ConnectionInfo, ConnectionObserver, PeerVerdict,
};
use crate::network::handshake::{
    CompressionMode, Handshake, HandshakeOutcome, HandshakeStatus, HeaderReader, VersionHeader,
};
use crate::network::latency::{LatencyReport, LatencyTracker, CHANNEL_CONNECTION};
use crate::network::transport::{FragmentWriter, FrameSource, ReadState, TransportStrategy};
use crate::network::wire::{self, FrameReader, MAX_FRAME_SIZE, MAX_PREFIX_LEN};

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);
pub const KEEPALIVE_RETRY_DELAY: Duration = Duration::from_millis(250);
pub const DEFAULT_READ_CYCLE: Duration = Duration::from_secs(2);
/// Empty read cycles tolerated while a frame is half received
pub const MAX_IDLE_CYCLES: u32 = 5;
pub const DEFAULT_INLINE_LIMIT: usize = 256 * 1024;
const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Everything a connection needs from the node, shared by all connections.
pub struct ConnectionContext {
    pub local_uuid: Uuid,
    pub compression: CompressionMode,
    pub codec: Arc<dyn ProtocolCodec>,
    pub send_cache: Arc<dyn SendCache>,
    pub observer: Arc<dyn ConnectionObserver>,
    pub strategy: TransportStrategy,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_cycle: Duration,
    /// Payloads above this size are sent by cache reference.
    pub inline_limit: usize,
    pub configure_socket: ConfigureSocket,
}

impl ConnectionContext {
    pub fn new(
        local_uuid: Uuid,
        codec: Arc<dyn ProtocolCodec>,
        send_cache: Arc<dyn SendCache>,
        observer: Arc<dyn ConnectionObserver>,
    ) -> Self {
        Self {
            local_uuid,
            compression: CompressionMode::None,
            codec,
            send_cache,
            observer,
            strategy: TransportStrategy::default(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            connect_timeout: crate::network::connector::DEFAULT_CONNECT_TIMEOUT,
            read_cycle: DEFAULT_READ_CYCLE,
            inline_limit: DEFAULT_INLINE_LIMIT,
            configure_socket: default_socket_config(),
        }
    }

    fn local_header(&self) -> VersionHeader {
        VersionHeader::new(self.local_uuid, self.compression)
    }
}

#[derive(Debug, Default)]
struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
}

/// Why the connection went away, kept for handshake waiters.
#[derive(Debug, Clone)]
struct CloseReason {
    description: String,
    peer_fault: bool,
}

enum Flow {
    Continue,
    /// Orderly stop without an error (counter-connect probe).
    Stop,
}

pub struct Connection {
    info: ConnectionInfo,
    context: Arc<ConnectionContext>,
    state: Mutex<ConnectionStateMachine>,
    handshake: Mutex<Handshake>,
    handshake_status: watch::Sender<HandshakeStatus>,
    writer: tokio::sync::Mutex<Box<dyn FragmentWriter>>,
    /// Duplicate of the socket handle used for keep-alive polling and shutdown.
    probe: Mutex<Option<Socket>>,
    cancel: CancellationToken,
    dispose_lock: tokio::sync::Mutex<()>,
    disposing: AtomicBool,
    disconnected_fired: AtomicBool,
    alerts_silenced: AtomicBool,
    close_reason: OnceLock<CloseReason>,
    latency: Mutex<LatencyTracker>,
    last_keepalive: Mutex<Option<Instant>>,
    traffic: TrafficCounters,
    peer_uuid: OnceLock<Uuid>,
    registry: Mutex<Weak<ConnectionManager>>,
}

impl Connection {
    /// Open an outbound connection and wait for its handshake.
    pub async fn outbound(
        endpoint: &Endpoint,
        connector: &DualStackConnector,
        context: Arc<ConnectionContext>,
        registry: Option<&Arc<ConnectionManager>>,
    ) -> Result<Arc<Self>, ConnectionError> {
        if context.codec.create_handshake_payload().is_empty() {
            return Err(ConnectionError::EmptyHandshakePayload);
        }

        let mut state = ConnectionStateMachine::new(endpoint.to_string());
        state.mark_connecting();
        let mut handshake = Handshake::new(context.local_header());
        let hello = handshake.start()?;

        info!("🔗 [OUTBOUND] Connecting to {}", endpoint);
        let started = Instant::now();
        let stream = connector
            .connect(
                endpoint,
                context.configure_socket.clone(),
                context.connect_timeout,
                Some(&hello),
            )
            .await?;
        state.mark_connected();

        let connection = Self::establish(
            stream,
            ConnectionDirection::Outbound,
            handshake,
            state,
            context,
            registry,
        )?;

        let timeout = connection.context.handshake_timeout;
        if let Err(e) = connection.wait_for_handshake(timeout).await {
            let reported = match &e {
                ConnectionError::HandshakeTimeout(t) => ConnectionError::HandshakeTimeout(*t),
                _ => ConnectionError::Cancelled,
            };
            connection.close(Some(reported)).await;
            return Err(e);
        }

        let report = connection.record_latency(CHANNEL_CONNECTION, started);
        info!(
            "🤝 Handshake with {} completed in {:.1}ms",
            connection.info, report.latency_ms
        );
        Ok(connection)
    }

    /// Wrap an accepted socket. The handshake is driven by the read loop.
    pub fn inbound(
        stream: TcpStream,
        context: Arc<ConnectionContext>,
        registry: Option<&Arc<ConnectionManager>>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let label = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let mut state = ConnectionStateMachine::new(label);
        state.mark_connected();
        let handshake = Handshake::new(context.local_header());
        Self::establish(
            stream,
            ConnectionDirection::Inbound,
            handshake,
            state,
            context,
            registry,
        )
    }

    fn establish(
        stream: TcpStream,
        direction: ConnectionDirection,
        handshake: Handshake,
        state: ConnectionStateMachine,
        context: Arc<ConnectionContext>,
        registry: Option<&Arc<ConnectionManager>>,
    ) -> Result<Arc<Self>, ConnectionError> {
        let remote = stream.peer_addr()?;
        let probe = SockRef::from(&stream).try_clone()?;
        let (read_half, write_half) = stream.into_split();
        let (source, writer) = context
            .strategy
            .split(read_half, write_half, context.read_cycle);

        let info = ConnectionInfo {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            direction,
        };
        let (handshake_status, _) = watch::channel(handshake.status());

        let connection = Arc::new(Self {
            info,
            context,
            state: Mutex::new(state),
            handshake: Mutex::new(handshake),
            handshake_status,
            writer: tokio::sync::Mutex::new(writer),
            probe: Mutex::new(Some(probe)),
            cancel: CancellationToken::new(),
            dispose_lock: tokio::sync::Mutex::new(()),
            disposing: AtomicBool::new(false),
            disconnected_fired: AtomicBool::new(false),
            alerts_silenced: AtomicBool::new(false),
            close_reason: OnceLock::new(),
            latency: Mutex::new(LatencyTracker::new()),
            last_keepalive: Mutex::new(None),
            traffic: TrafficCounters::default(),
            peer_uuid: OnceLock::new(),
            registry: Mutex::new(Weak::new()),
        });

        if let Some(manager) = registry {
            manager.register(connection.clone());
        }
        connection.context.observer.on_connected(&connection.info);
        debug!("🔌 Connection {} established", connection.info);

        tokio::spawn(connection.clone().read_loop(source));
        Ok(connection)
    }

    pub fn id(&self) -> u64 {
        self.info.id
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.info.remote
    }

    pub fn direction(&self) -> ConnectionDirection {
        self.info.direction
    }

    pub fn peer_uuid(&self) -> Option<Uuid> {
        self.peer_uuid.get().copied()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().state()
    }

    pub fn handshake_status(&self) -> HandshakeStatus {
        self.handshake.lock().status()
    }

    pub fn is_ready(&self) -> bool {
        self.handshake_status().is_completed() && !self.is_disposing()
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::SeqCst)
    }

    pub fn traffic(&self) -> TrafficStats {
        TrafficStats {
            bytes_sent: self.traffic.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.traffic.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.traffic.messages_sent.load(Ordering::Relaxed),
            messages_received: self.traffic.messages_received.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn attach_registry(&self, manager: Weak<ConnectionManager>) {
        *self.registry.lock() = manager;
    }

    /// Record a round trip measured from `start` on the named channel.
    pub fn record_latency(&self, channel: &str, start: Instant) -> LatencyReport {
        self.latency.lock().record(channel, start)
    }

    pub fn latency_report(&self, channel: &str) -> Option<(f64, f64)> {
        self.latency
            .lock()
            .channel(channel)
            .map(|c| (c.mean(), c.std_dev()))
    }

    /// Wait until the handshake completes, fails, or `timeout` elapses.
    pub async fn wait_for_handshake(&self, timeout: Duration) -> Result<(), ConnectionError> {
        let mut status = self.handshake_status.subscribe();
        let wait = async {
            loop {
                let current = *status.borrow_and_update();
                if current.is_completed() {
                    return Ok(());
                }
                if current == HandshakeStatus::Unusable || self.is_disposing() {
                    return Err(self.handshake_failure());
                }
                if status.changed().await.is_err() {
                    return Err(self.handshake_failure());
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::HandshakeTimeout(timeout)),
        }
    }

    fn handshake_failure(&self) -> ConnectionError {
        match self.close_reason.get() {
            Some(reason) => ConnectionError::HandshakeFailed {
                reason: reason.description.clone(),
                peer_fault: reason.peer_fault,
            },
            None => ConnectionError::HandshakeFailed {
                reason: "connection closed before the handshake completed".to_string(),
                peer_fault: false,
            },
        }
    }

    fn publish_status(&self) {
        let status = self.handshake_status();
        self.handshake_status.send_replace(status);
    }

    /// Send an application message once the handshake is complete.
    ///
    /// Payloads larger than the inline limit are parked in the send cache and
    /// announced by hash.
    pub async fn send_message(
        &self,
        message_type: u16,
        payload: &[u8],
    ) -> Result<(), ConnectionError> {
        let status = self.handshake_status();
        if !status.is_completed() {
            return Err(ConnectionError::NotReady(status));
        }
        if self.is_disposing() {
            return Err(ConnectionError::Closed);
        }

        let codec = &self.context.codec;
        let body = if payload.len() > self.context.inline_limit {
            let hash = content_hash(payload);
            let reference = codec.reference_message(message_type, &hash, payload.len())?;
            if !self.context.send_cache.exists(&hash) {
                self.context
                    .send_cache
                    .store(hash, Bytes::copy_from_slice(payload));
            }
            debug!(
                "📦 Sending {} byte payload to {} by reference {}",
                payload.len(),
                self.info,
                hex::encode(&hash[..8])
            );
            reference
        } else {
            codec.wrap_outbound_message(message_type, payload)
        };

        self.send_frame(body).await?;
        self.traffic.messages_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write one frame body with its length prefix.
    async fn send_frame(&self, body: Bytes) -> Result<(), ConnectionError> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProtocolFault::from(crate::error::WireError::FrameTooLarge {
                len: body.len(),
                max: MAX_FRAME_SIZE,
            })
            .into());
        }
        let mut prefix = BytesMut::with_capacity(MAX_PREFIX_LEN);
        wire::encode_prefix(body.len(), &mut prefix).map_err(ProtocolFault::from)?;
        self.write_fragments([prefix.freeze(), body]).await
    }

    async fn write_fragments<const N: usize>(
        &self,
        fragments: [Bytes; N],
    ) -> Result<(), ConnectionError> {
        let total: usize = fragments.iter().map(Bytes::len).sum();
        let flushed = {
            let mut writer = self.writer.lock().await;
            let mut queued = Ok(());
            for fragment in fragments {
                if let Err(e) = writer.write_fragment(fragment).await {
                    queued = Err(e);
                    break;
                }
            }
            match queued {
                Ok(()) => writer.complete_write().await,
                Err(e) => {
                    debug!("Write to {} failed: {}", self.info, e);
                    false
                }
            }
        };

        if !flushed {
            self.close(Some(ConnectionError::Transport(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "write failed",
            ))))
            .await;
            return Err(ConnectionError::Closed);
        }

        self.traffic
            .bytes_sent
            .fetch_add(total as u64, Ordering::Relaxed);
        self.context.observer.on_data_sent(&self.info, total);
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut source: Box<dyn FrameSource>) {
        let mut state = ReadState::new();
        let mut headers = HeaderReader::new();
        let mut frames = FrameReader::with_max_frame(MAX_FRAME_SIZE);
        let mut idle_cycles = 0u32;

        let outcome: Result<(), ConnectionError> = loop {
            state = match source.read_frame(state, &self.cancel).await {
                Ok(next) => next,
                Err(e) => break Err(e),
            };

            if state.fresh == 0 {
                if state.eof {
                    break Err(ConnectionError::Closed);
                }
                if headers.is_incomplete() || frames.is_incomplete() {
                    idle_cycles += 1;
                    if idle_cycles >= MAX_IDLE_CYCLES {
                        break Err(ProtocolFault::StalledReassembly(idle_cycles).into());
                    }
                }
                continue;
            }

            idle_cycles = 0;
            self.traffic
                .bytes_received
                .fetch_add(state.fresh as u64, Ordering::Relaxed);
            self.context
                .observer
                .on_data_received(&self.info, state.fresh);

            match self
                .process_input(&mut state.buffer, &mut headers, &mut frames)
                .await
            {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(e) => break Err(e),
            }
            if state.eof {
                break Err(ConnectionError::Closed);
            }
        };

        self.close(outcome.err()).await;
    }

    /// Consume as much buffered input as possible.
    async fn process_input(
        &self,
        buffer: &mut BytesMut,
        headers: &mut HeaderReader,
        frames: &mut FrameReader,
    ) -> Result<Flow, ConnectionError> {
        while !buffer.is_empty() {
            if self.cancel.is_cancelled() {
                return Err(ConnectionError::Cancelled);
            }

            let expects_header = self.handshake.lock().expects_header();
            if expects_header {
                let Some(raw) = headers.push(buffer) else {
                    return Ok(Flow::Continue);
                };
                let outcome = self.handshake.lock().on_header(&raw);
                match self.apply_handshake(outcome).await? {
                    Flow::Continue => continue,
                    Flow::Stop => return Ok(Flow::Stop),
                }
            }

            let frame = match frames.push(buffer).map_err(ProtocolFault::from)? {
                Some(frame) => frame,
                None => return Ok(Flow::Continue),
            };
            match self.handshake_status() {
                HandshakeStatus::Completed => self.dispatch_frame(frame)?,
                HandshakeStatus::VersionReceived => {
                    let outcome = self.handshake.lock().on_payload(frame);
                    self.apply_handshake(outcome).await?;
                }
                status => return Err(ProtocolFault::OutOfOrderHandshake(status).into()),
            }
        }
        Ok(Flow::Continue)
    }

    async fn apply_handshake(&self, outcome: HandshakeOutcome) -> Result<Flow, ConnectionError> {
        match outcome {
            HandshakeOutcome::ReplyHeader(peer) => {
                self.verify_peer(&peer)?;
                let reply = self.handshake.lock().local_header().encode();
                self.publish_status();
                self.write_fragments([Bytes::copy_from_slice(&reply)]).await?;
                Ok(Flow::Continue)
            }
            HandshakeOutcome::SendPayload(peer) => {
                self.verify_peer(&peer)?;
                let payload = self.context.codec.create_handshake_payload();
                if payload.is_empty() {
                    self.handshake.lock().mark_unusable();
                    return Err(ConnectionError::EmptyHandshakePayload);
                }
                self.send_frame(payload).await?;
                self.publish_status();
                self.context
                    .observer
                    .on_handshake_completed(&self.info, None);
                Ok(Flow::Continue)
            }
            HandshakeOutcome::Completed(payload) => {
                self.publish_status();
                info!("🤝 Handshake with {} completed", self.info);
                self.context
                    .observer
                    .on_handshake_completed(&self.info, Some(&payload));
                Ok(Flow::Continue)
            }
            HandshakeOutcome::ProbeDetected => {
                debug!("📡 Counter-connect probe from {}", self.info.remote);
                Ok(Flow::Stop)
            }
            HandshakeOutcome::Reject(fault) => Err(fault.into()),
        }
    }

    fn verify_peer(&self, peer: &VersionHeader) -> Result<(), ConnectionError> {
        let _ = self.peer_uuid.set(peer.peer_uuid);
        if peer.peer_uuid == self.context.local_uuid {
            self.handshake.lock().mark_unusable();
            return Err(ConnectionError::PeerRejected(
                "connected to ourselves".to_string(),
            ));
        }
        match self
            .context
            .observer
            .on_peer_uuid(&self.info, peer.peer_uuid)
        {
            PeerVerdict::Accept => Ok(()),
            PeerVerdict::Reject(reason) => {
                self.handshake.lock().mark_unusable();
                Err(ConnectionError::PeerRejected(reason))
            }
        }
    }

    fn dispatch_frame(&self, frame: Bytes) -> Result<(), ConnectionError> {
        let header = self.context.codec.parse_frame_header(&frame)?;
        self.traffic
            .messages_received
            .fetch_add(1, Ordering::Relaxed);
        self.context.codec.dispatch(self.info.id, header, frame);
        Ok(())
    }

    /// Verify the socket is still alive.
    ///
    /// Throttled to once per [`KEEPALIVE_INTERVAL`] unless `force` is set. A
    /// failed check is retried once before the connection is closed.
    pub async fn check_connected(&self, force: bool) -> bool {
        if self.is_disposing() {
            return false;
        }
        {
            let mut last = self.last_keepalive.lock();
            if let Some(at) = *last {
                if !force && at.elapsed() < KEEPALIVE_INTERVAL {
                    return self.state().is_connected();
                }
            }
            *last = Some(Instant::now());
        }

        if self.probe_alive() {
            return true;
        }
        tokio::time::sleep(KEEPALIVE_RETRY_DELAY).await;
        if self.probe_alive() {
            return true;
        }

        debug!("💔 Keep-alive check failed for {}", self.info);
        self.close(Some(ConnectionError::Transport(std::io::Error::new(
            std::io::ErrorKind::ConnectionAborted,
            "keep-alive check failed",
        ))))
        .await;
        false
    }

    fn probe_alive(&self) -> bool {
        match self.probe.lock().as_ref() {
            Some(socket) => socket_alive(socket),
            None => false,
        }
    }

    /// Tear the connection down. Safe to call any number of times.
    pub async fn close(&self, error: Option<ConnectionError>) {
        let _guard = self.dispose_lock.lock().await;
        if self.disposing.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.close_reason.set(match &error {
            Some(e) => CloseReason {
                description: e.to_string(),
                peer_fault: e.is_peer_fault(),
            },
            None => CloseReason {
                description: "connection closed".to_string(),
                peer_fault: false,
            },
        });

        // Cancel first so the read loop sees cancellation, not a reset
        self.cancel.cancel();
        let probe = self.probe.lock().take();
        if let Some(socket) = probe {
            let _ = socket.shutdown(Shutdown::Both);
        }
        if let Ok(mut writer) =
            tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, self.writer.lock()).await
        {
            writer.shutdown().await;
        }

        self.state.lock().mark_disconnected();
        {
            let mut handshake = self.handshake.lock();
            if !handshake.status().is_completed() {
                handshake.mark_unusable();
            }
        }
        self.publish_status();

        self.report(error.as_ref());
        if !self.disconnected_fired.swap(true, Ordering::SeqCst) {
            self.context
                .observer
                .on_disconnected(&self.info, error.as_ref());
        }

        let registry = self.registry.lock().upgrade();
        if let Some(manager) = registry {
            manager.deregister(self.info.id);
        }
    }

    fn report(&self, error: Option<&ConnectionError>) {
        let Some(error) = error else {
            debug!("🔌 Connection {} closed", self.info);
            return;
        };
        if error.is_cancellation() || matches!(error, ConnectionError::Closed) {
            debug!("🔌 Connection {} closed: {}", self.info, error);
            return;
        }
        // One alert per connection
        if self.alerts_silenced.swap(true, Ordering::SeqCst) {
            return;
        }
        if error.is_peer_fault() {
            warn!("⚠️  Peer {} violated protocol: {}", self.info, error);
        } else {
            warn!("❌ Connection {} failed: {}", self.info, error);
            self.context
                .observer
                .on_unexpected_error(&self.info, error);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.disposing.load(Ordering::SeqCst) {
            debug!("🧹 Connection {} dropped without close()", self.info);
        }
    }
}

/// Zero-length send plus a non-blocking peek: EOF or an error means the peer is gone.
fn socket_alive(socket: &Socket) -> bool {
    use std::io::ErrorKind;

    match socket.send(&[]) {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(_) => return false,
    }
    let mut buf = [MaybeUninit::<u8>::uninit(); 1];
    match socket.peek(&mut buf) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) => matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted),
    }
}
