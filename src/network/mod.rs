pub mod admission;
pub mod codec;
pub mod connection;
pub mod connection_manager;
pub mod connection_state;
pub mod connector;
pub mod endpoint;
pub mod events;
pub mod handshake;
pub mod latency;
pub mod server;
pub mod transport;
pub mod wire;
