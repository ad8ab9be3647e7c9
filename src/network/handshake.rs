//! Version/identity handshake that precedes any framed traffic.
//!
//! Outbound side                      Inbound side
//!   header ───────────────────────────▶  (NotStarted → VersionReceived)
//!   (VersionSent)  ◀─────────────────── header
//!   payload frame ─────────────────────▶ (Completed, callback fires)
//!   (Completed)
//!
//! A probe marker in place of a header means the peer only wanted to know
//! whether we are reachable: the connection is dropped without progress.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolFault;

pub const PROTOCOL_VERSION: u32 = 3;
pub const MIN_PROTOCOL_VERSION: u32 = 2;

/// protocol_version (4) + compression (1) + uuid (16)
pub const VERSION_HEADER_LEN: usize = 21;

/// Counter-connect liveness marker. Version `u32::MAX` is reserved so a real
/// header can never collide with it.
pub const PROBE_MARKER: [u8; VERSION_HEADER_LEN] = [0xFF; VERSION_HEADER_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    None,
    Zstd,
}

impl CompressionMode {
    fn to_byte(self) -> u8 {
        match self {
            CompressionMode::None => 0,
            CompressionMode::Zstd => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(CompressionMode::None),
            1 => Some(CompressionMode::Zstd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionHeader {
    pub protocol_version: u32,
    pub compression: CompressionMode,
    pub peer_uuid: Uuid,
}

impl VersionHeader {
    pub fn new(peer_uuid: Uuid, compression: CompressionMode) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            compression,
            peer_uuid,
        }
    }

    pub fn encode(&self) -> [u8; VERSION_HEADER_LEN] {
        let mut out = [0u8; VERSION_HEADER_LEN];
        out[..4].copy_from_slice(&self.protocol_version.to_be_bytes());
        out[4] = self.compression.to_byte();
        out[5..].copy_from_slice(self.peer_uuid.as_bytes());
        out
    }

    pub fn decode(raw: &[u8; VERSION_HEADER_LEN]) -> Result<Self, ProtocolFault> {
        let mut version = [0u8; 4];
        version.copy_from_slice(&raw[..4]);
        let protocol_version = u32::from_be_bytes(version);
        if protocol_version == u32::MAX {
            return Err(ProtocolFault::MalformedHeader(
                "reserved protocol version".to_string(),
            ));
        }
        let compression = CompressionMode::from_byte(raw[4]).ok_or_else(|| {
            ProtocolFault::MalformedHeader(format!("unknown compression mode {}", raw[4]))
        })?;
        let peer_uuid = Uuid::from_slice(&raw[5..])
            .map_err(|e| ProtocolFault::MalformedHeader(e.to_string()))?;
        Ok(Self {
            protocol_version,
            compression,
            peer_uuid,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandshakeStatus {
    NotStarted,
    VersionSent,
    VersionReceived,
    Completed,
    Unusable,
}

impl HandshakeStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, HandshakeStatus::Completed)
    }

    /// No further handshake progress is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, HandshakeStatus::Completed | HandshakeStatus::Unusable)
    }
}

/// What the connection has to do after feeding input to the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeOutcome {
    /// Peer header accepted; reply with our own header and keep reading.
    ReplyHeader(VersionHeader),
    /// Peer header accepted; send our handshake payload. We are done.
    SendPayload(VersionHeader),
    /// Peer payload received; the handshake is complete.
    Completed(Bytes),
    /// Counter-connect probe; close quietly.
    ProbeDetected,
    /// Fatal: close the connection.
    Reject(ProtocolFault),
}

/// Pure handshake state machine; the connection performs the I/O it asks for.
#[derive(Debug)]
pub struct Handshake {
    status: HandshakeStatus,
    local: VersionHeader,
    peer: Option<VersionHeader>,
}

impl Handshake {
    pub fn new(local: VersionHeader) -> Self {
        Self {
            status: HandshakeStatus::NotStarted,
            local,
            peer: None,
        }
    }

    pub fn status(&self) -> HandshakeStatus {
        self.status
    }

    pub fn local_header(&self) -> &VersionHeader {
        &self.local
    }

    pub fn peer_header(&self) -> Option<&VersionHeader> {
        self.peer.as_ref()
    }

    /// True while the next inbound bytes are a fixed-size header rather than a frame.
    pub fn expects_header(&self) -> bool {
        matches!(
            self.status,
            HandshakeStatus::NotStarted | HandshakeStatus::VersionSent
        )
    }

    /// Outbound side opens the exchange.
    pub fn start(&mut self) -> Result<[u8; VERSION_HEADER_LEN], ProtocolFault> {
        if self.status != HandshakeStatus::NotStarted {
            return Err(self.fail());
        }
        self.status = HandshakeStatus::VersionSent;
        Ok(self.local.encode())
    }

    pub fn on_header(&mut self, raw: &[u8; VERSION_HEADER_LEN]) -> HandshakeOutcome {
        if *raw == PROBE_MARKER {
            if self.status == HandshakeStatus::NotStarted {
                return HandshakeOutcome::ProbeDetected;
            }
            return HandshakeOutcome::Reject(self.fail());
        }

        let next = match self.status {
            HandshakeStatus::NotStarted => HandshakeStatus::VersionReceived,
            HandshakeStatus::VersionSent => HandshakeStatus::Completed,
            _ => return HandshakeOutcome::Reject(self.fail()),
        };

        let header = match VersionHeader::decode(raw) {
            Ok(h) => h,
            Err(fault) => {
                self.status = HandshakeStatus::Unusable;
                return HandshakeOutcome::Reject(fault);
            }
        };
        if header.protocol_version < MIN_PROTOCOL_VERSION {
            self.status = HandshakeStatus::Unusable;
            return HandshakeOutcome::Reject(ProtocolFault::UnsupportedVersion {
                got: header.protocol_version,
                min: MIN_PROTOCOL_VERSION,
            });
        }

        self.peer = Some(header);
        self.status = next;
        if next == HandshakeStatus::Completed {
            HandshakeOutcome::SendPayload(header)
        } else {
            HandshakeOutcome::ReplyHeader(header)
        }
    }

    pub fn on_payload(&mut self, payload: Bytes) -> HandshakeOutcome {
        if self.status != HandshakeStatus::VersionReceived {
            return HandshakeOutcome::Reject(self.fail());
        }
        if payload.is_empty() {
            self.status = HandshakeStatus::Unusable;
            return HandshakeOutcome::Reject(ProtocolFault::EmptyPeerPayload);
        }
        self.status = HandshakeStatus::Completed;
        HandshakeOutcome::Completed(payload)
    }

    /// Peer-policy rejection after the header was seen.
    pub fn mark_unusable(&mut self) {
        self.status = HandshakeStatus::Unusable;
    }

    fn fail(&mut self) -> ProtocolFault {
        let seen = self.status;
        self.status = HandshakeStatus::Unusable;
        ProtocolFault::OutOfOrderHandshake(seen)
    }
}

/// Accumulates a fixed-size header across partial reads.
#[derive(Debug, Default)]
pub struct HeaderReader {
    buf: [u8; VERSION_HEADER_LEN],
    filled: usize,
}

impl HeaderReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_incomplete(&self) -> bool {
        self.filled > 0
    }

    pub fn push(&mut self, input: &mut BytesMut) -> Option<[u8; VERSION_HEADER_LEN]> {
        let take = (VERSION_HEADER_LEN - self.filled).min(input.len());
        self.buf[self.filled..self.filled + take].copy_from_slice(&input[..take]);
        input.advance(take);
        self.filled += take;
        if self.filled == VERSION_HEADER_LEN {
            self.filled = 0;
            Some(self.buf)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (Handshake, Handshake) {
        (
            Handshake::new(VersionHeader::new(Uuid::new_v4(), CompressionMode::None)),
            Handshake::new(VersionHeader::new(Uuid::new_v4(), CompressionMode::Zstd)),
        )
    }

    #[test]
    fn test_full_exchange() {
        let (mut client, mut server) = pair();

        let hello = client.start().unwrap();
        assert_eq!(client.status(), HandshakeStatus::VersionSent);

        let reply = match server.on_header(&hello) {
            HandshakeOutcome::ReplyHeader(peer) => {
                assert_eq!(peer.peer_uuid, client.local_header().peer_uuid);
                server.local_header().encode()
            }
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(server.status(), HandshakeStatus::VersionReceived);

        match client.on_header(&reply) {
            HandshakeOutcome::SendPayload(peer) => {
                assert_eq!(peer.compression, CompressionMode::Zstd)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(client.status(), HandshakeStatus::Completed);

        let outcome = server.on_payload(Bytes::from_static(b"node-info"));
        assert_eq!(
            outcome,
            HandshakeOutcome::Completed(Bytes::from_static(b"node-info"))
        );
        assert_eq!(server.status(), HandshakeStatus::Completed);
    }

    #[test]
    fn test_probe_marker_never_progresses() {
        let (_, mut server) = pair();
        assert_eq!(server.on_header(&PROBE_MARKER), HandshakeOutcome::ProbeDetected);
        assert_eq!(server.status(), HandshakeStatus::NotStarted);
        assert!(server.peer_header().is_none());
    }

    #[test]
    fn test_out_of_order_is_fatal() {
        let (mut client, mut server) = pair();

        // Payload before any header
        assert!(matches!(
            server.on_payload(Bytes::from_static(b"x")),
            HandshakeOutcome::Reject(ProtocolFault::OutOfOrderHandshake(
                HandshakeStatus::NotStarted
            ))
        ));
        assert_eq!(server.status(), HandshakeStatus::Unusable);

        // Second header after completion
        let (_, mut other) = pair();
        let hello = client.start().unwrap();
        other.on_header(&hello);
        client.on_header(&other.local_header().encode());
        assert!(matches!(
            client.on_header(&other.local_header().encode()),
            HandshakeOutcome::Reject(_)
        ));
        assert_eq!(client.status(), HandshakeStatus::Unusable);
    }

    #[test]
    fn test_old_and_malformed_versions_rejected() {
        let (_, mut server) = pair();
        let mut old = VersionHeader::new(Uuid::new_v4(), CompressionMode::None);
        old.protocol_version = MIN_PROTOCOL_VERSION - 1;
        assert!(matches!(
            server.on_header(&old.encode()),
            HandshakeOutcome::Reject(ProtocolFault::UnsupportedVersion { .. })
        ));

        let (_, mut server) = pair();
        let mut raw = VersionHeader::new(Uuid::new_v4(), CompressionMode::None).encode();
        raw[4] = 9;
        assert!(matches!(
            server.on_header(&raw),
            HandshakeOutcome::Reject(ProtocolFault::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_empty_peer_payload_rejected() {
        let (mut client, mut server) = pair();
        server.on_header(&client.start().unwrap());
        assert_eq!(
            server.on_payload(Bytes::new()),
            HandshakeOutcome::Reject(ProtocolFault::EmptyPeerPayload)
        );
    }

    #[test]
    fn test_header_reader_resumes() {
        let header = VersionHeader::new(Uuid::new_v4(), CompressionMode::None).encode();
        let mut reader = HeaderReader::new();
        let mut first = BytesMut::from(&header[..7]);
        assert!(reader.push(&mut first).is_none());
        assert!(reader.is_incomplete());

        let mut rest = BytesMut::from(&header[7..]);
        rest.extend_from_slice(b"tail");
        assert_eq!(reader.push(&mut rest), Some(header));
        assert_eq!(&rest[..], b"tail");
    }
}
