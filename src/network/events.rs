//! Connection lifecycle notifications.
//!
//! Observers are fixed when a connection context is built; there is no
//! runtime subscribe/unsubscribe.

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ConnectionError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionDirection {
    Inbound,
    Outbound,
}

impl fmt::Display for ConnectionDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionDirection::Inbound => write!(f, "INBOUND"),
            ConnectionDirection::Outbound => write!(f, "OUTBOUND"),
        }
    }
}

/// Identity of a connection as seen by observers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub remote: SocketAddr,
    pub direction: ConnectionDirection,
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {} [{}]", self.id, self.remote, self.direction)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerVerdict {
    Accept,
    Reject(String),
}

pub trait ConnectionObserver: Send + Sync {
    fn on_connected(&self, _info: &ConnectionInfo) {}

    /// Fires exactly once per connection.
    fn on_disconnected(&self, _info: &ConnectionInfo, _error: Option<&ConnectionError>) {}

    fn on_data_received(&self, _info: &ConnectionInfo, _bytes: usize) {}

    fn on_data_sent(&self, _info: &ConnectionInfo, _bytes: usize) {}

    /// Called when the peer's identity arrives; a rejection tears the connection down.
    fn on_peer_uuid(&self, _info: &ConnectionInfo, _peer_uuid: Uuid) -> PeerVerdict {
        PeerVerdict::Accept
    }

    /// `payload` is the peer's handshake payload on the receiving side.
    fn on_handshake_completed(&self, _info: &ConnectionInfo, _payload: Option<&Bytes>) {}

    fn on_unexpected_error(&self, _info: &ConnectionInfo, _error: &ConnectionError) {}
}

/// Observer that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

/// Fans every notification out to a fixed list of observers.
#[derive(Default, Clone)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl ConnectionObserver for ObserverSet {
    fn on_connected(&self, info: &ConnectionInfo) {
        self.observers.iter().for_each(|o| o.on_connected(info));
    }

    fn on_disconnected(&self, info: &ConnectionInfo, error: Option<&ConnectionError>) {
        self.observers
            .iter()
            .for_each(|o| o.on_disconnected(info, error));
    }

    fn on_data_received(&self, info: &ConnectionInfo, bytes: usize) {
        self.observers
            .iter()
            .for_each(|o| o.on_data_received(info, bytes));
    }

    fn on_data_sent(&self, info: &ConnectionInfo, bytes: usize) {
        self.observers.iter().for_each(|o| o.on_data_sent(info, bytes));
    }

    /// Every observer is consulted; the first rejection wins.
    fn on_peer_uuid(&self, info: &ConnectionInfo, peer_uuid: Uuid) -> PeerVerdict {
        self.observers
            .iter()
            .map(|o| o.on_peer_uuid(info, peer_uuid))
            .fold(PeerVerdict::Accept, |verdict, next| match verdict {
                PeerVerdict::Accept => next,
                rejected => rejected,
            })
    }

    fn on_handshake_completed(&self, info: &ConnectionInfo, payload: Option<&Bytes>) {
        self.observers
            .iter()
            .for_each(|o| o.on_handshake_completed(info, payload));
    }

    fn on_unexpected_error(&self, info: &ConnectionInfo, error: &ConnectionError) {
        self.observers
            .iter()
            .for_each(|o| o.on_unexpected_error(info, error));
    }
}
