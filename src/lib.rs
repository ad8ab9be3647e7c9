//! peerlink: peer-to-peer TCP transport.
//!
//! Dual-stack connection racing, a versioned handshake, adaptive length
//! framing with latency tracking, and an accept loop guarded by a
//! rate-limiting admission engine.

pub mod config;
pub mod error;
pub mod network;
pub mod shutdown;

pub use config::Config;
pub use error::{AppError, ConnectError, ConnectionError};
pub use network::admission::{AdmissionSettings, IpMarshall};
pub use network::connection::{Connection, ConnectionContext};
pub use network::connection_manager::ConnectionManager;
pub use network::connector::{ConnectorSettings, DualStackConnector};
pub use network::endpoint::{Endpoint, IpMode};
pub use network::server::{ServerSettings, TcpServer};
