//! Registry of live connections.
//! Uses DashMap for lock-free concurrent access, plus an owned keep-alive sweep.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::ConnectionError;
use crate::network::connection::{Connection, ConnectionContext};
use crate::network::connector::DualStackConnector;
use crate::network::endpoint::Endpoint;
use crate::network::events::ConnectionDirection;

pub const KEEPALIVE_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total: usize,
    pub inbound: usize,
    pub outbound: usize,
    pub ready: usize,
}

struct SweepTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns every live connection; connections deregister themselves on close.
pub struct ConnectionManager {
    connections: DashMap<u64, Arc<Connection>>,
    inbound_count: AtomicUsize,
    outbound_count: AtomicUsize,
    sweep: Mutex<Option<SweepTask>>,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            inbound_count: AtomicUsize::new(0),
            outbound_count: AtomicUsize::new(0),
            sweep: Mutex::new(None),
        })
    }

    pub fn register(self: &Arc<Self>, connection: Arc<Connection>) {
        connection.attach_registry(Arc::downgrade(self));
        let direction = connection.direction();
        if self
            .connections
            .insert(connection.id(), connection)
            .is_none()
        {
            match direction {
                ConnectionDirection::Inbound => self.inbound_count.fetch_add(1, Ordering::Relaxed),
                ConnectionDirection::Outbound => {
                    self.outbound_count.fetch_add(1, Ordering::Relaxed)
                }
            };
        }
    }

    pub fn deregister(&self, id: u64) -> Option<Arc<Connection>> {
        let (_, connection) = self.connections.remove(&id)?;
        match connection.direction() {
            ConnectionDirection::Inbound => self.inbound_count.fetch_sub(1, Ordering::Relaxed),
            ConnectionDirection::Outbound => self.outbound_count.fetch_sub(1, Ordering::Relaxed),
        };
        debug!("📤 Deregistered connection #{}", id);
        Some(connection)
    }

    /// Open an outbound connection and track it.
    pub async fn connect(
        self: &Arc<Self>,
        endpoint: &Endpoint,
        connector: &DualStackConnector,
        context: Arc<ConnectionContext>,
    ) -> Result<Arc<Connection>, ConnectionError> {
        Connection::outbound(endpoint, connector, context, Some(self)).await
    }

    pub fn get(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total: self.connections.len(),
            inbound: self.inbound_count.load(Ordering::Relaxed),
            outbound: self.outbound_count.load(Ordering::Relaxed),
            ready: self
                .connections
                .iter()
                .filter(|entry| entry.value().is_ready())
                .count(),
        }
    }

    /// Run one keep-alive pass over every connection. Returns how many were dropped.
    pub async fn sweep_once(&self, force: bool) -> usize {
        let mut dropped = 0;
        for connection in self.connections() {
            if !connection.check_connected(force).await {
                dropped += 1;
            }
        }
        if dropped > 0 {
            info!("🧹 Keep-alive sweep dropped {} dead connection(s)", dropped);
        }
        dropped
    }

    /// Start the periodic keep-alive sweep; a second call is a no-op.
    pub fn start_sweep(self: &Arc<Self>, parent: &CancellationToken, interval: Duration) {
        let mut sweep = self.sweep.lock();
        if sweep.is_some() {
            return;
        }
        let cancel = parent.child_token();
        let manager = Arc::downgrade(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.sweep_once(false).await;
                    }
                }
            }
            debug!("Keep-alive sweep stopped");
        });
        *sweep = Some(SweepTask { cancel, handle });
    }

    pub async fn stop_sweep(&self) {
        let task = self.sweep.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            let _ = task.handle.await;
        }
    }

    /// Close every connection, e.g. on shutdown.
    pub async fn close_all(&self) {
        let connections = self.connections();
        if !connections.is_empty() {
            info!("🔌 Closing {} connection(s)", connections.len());
        }
        for connection in connections {
            connection.close(Some(ConnectionError::Cancelled)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::codec::{BasicCodec, MemorySendCache};
    use crate::network::events::NoopObserver;
    use bytes::Bytes;
    use tokio::net::{TcpListener, TcpStream};
    use uuid::Uuid;

    fn context() -> Arc<ConnectionContext> {
        let (codec, _rx) = BasicCodec::new(Bytes::from_static(b"hello"));
        Arc::new(ConnectionContext::new(
            Uuid::new_v4(),
            Arc::new(codec),
            Arc::new(MemorySendCache::default()),
            Arc::new(NoopObserver),
        ))
    }

    async fn accepted(
        manager: &Arc<ConnectionManager>,
    ) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (socket, _) = listener.accept().await.unwrap();
        let connection = Connection::inbound(socket, context(), Some(manager)).unwrap();
        (connection, client)
    }

    #[tokio::test]
    async fn test_register_and_deregister_on_close() {
        let manager = ConnectionManager::new();
        let (connection, _client) = accepted(&manager).await;
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.stats().inbound, 1);
        assert!(manager.get(connection.id()).is_some());

        connection.close(None).await;
        assert!(manager.is_empty());
        assert_eq!(manager.stats(), RegistryStats::default());
    }

    #[tokio::test]
    async fn test_sweep_drops_dead_connections() {
        let manager = ConnectionManager::new();
        let (_alive, _client) = accepted(&manager).await;
        let (dead, client) = accepted(&manager).await;
        drop(client);

        // The read loop may already have noticed the EOF
        for _ in 0..20 {
            if dead.is_disposing() {
                break;
            }
            manager.sweep_once(true).await;
        }
        assert!(dead.is_disposing());
        assert_eq!(manager.len(), 1);
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let manager = ConnectionManager::new();
        let token = CancellationToken::new();
        manager.start_sweep(&token, Duration::from_millis(20));
        let (_a, _ca) = accepted(&manager).await;
        let (_b, _cb) = accepted(&manager).await;
        assert_eq!(manager.len(), 2);

        manager.close_all().await;
        manager.stop_sweep().await;
        assert!(manager.is_empty());
    }
}
