//! Collaborators above the framing boundary.
//!
//! The transport only guarantees exact-length, in-order delivery of frame
//! bodies. What a body means is decided by a `ProtocolCodec`; large bodies
//! are parked in a `SendCache` and announced by hash.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ProtocolFault;

pub type ContentHash = [u8; 32];

pub fn content_hash(payload: &[u8]) -> ContentHash {
    *blake3::hash(payload).as_bytes()
}

/// Codec-owned header at the front of every frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: u16,
    /// The body is only a reference; the content lives in the sender's cache.
    pub split: bool,
    pub content_hash: Option<ContentHash>,
    pub total_len: usize,
    /// Offset of the application payload within the frame body.
    pub body_offset: usize,
}

pub trait ProtocolCodec: Send + Sync {
    fn create_handshake_payload(&self) -> Bytes;

    /// Frame body carrying `payload` inline.
    fn wrap_outbound_message(&self, message_type: u16, payload: &[u8]) -> Bytes;

    /// Frame body announcing a cached payload by hash.
    fn reference_message(
        &self,
        message_type: u16,
        hash: &ContentHash,
        total_len: usize,
    ) -> Result<Bytes, ProtocolFault>;

    fn parse_frame_header(&self, body: &[u8]) -> Result<FrameHeader, ProtocolFault>;

    /// Hand a completed frame to the layer above.
    fn dispatch(&self, connection_id: u64, header: FrameHeader, body: Bytes);
}

/// Send-side store for payloads too large to send inline.
pub trait SendCache: Send + Sync {
    fn exists(&self, hash: &ContentHash) -> bool;
    fn store(&self, hash: ContentHash, payload: Bytes);
    fn get(&self, hash: &ContentHash) -> Option<Bytes>;
    /// The peer fetched the payload; it may be evicted.
    fn acknowledge(&self, hash: &ContentHash);
}

/// Message delivered by `BasicCodec`.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub connection_id: u64,
    pub header: FrameHeader,
    pub payload: Bytes,
}

const FLAG_SPLIT: u8 = 0x01;
const BASE_HEADER_LEN: usize = 3;
const REFERENCE_LEN: usize = 32 + 4;

/// Minimal codec: `type u16 BE ‖ flags u8 ‖ [hash ‖ total_len u32 BE] ‖ payload`.
pub struct BasicCodec {
    handshake_payload: Bytes,
    inbound: mpsc::Sender<InboundMessage>,
}

impl BasicCodec {
    pub fn new(handshake_payload: Bytes) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(1024);
        (
            Self {
                handshake_payload,
                inbound: tx,
            },
            rx,
        )
    }
}

impl ProtocolCodec for BasicCodec {
    fn create_handshake_payload(&self) -> Bytes {
        self.handshake_payload.clone()
    }

    fn wrap_outbound_message(&self, message_type: u16, payload: &[u8]) -> Bytes {
        let mut body = BytesMut::with_capacity(BASE_HEADER_LEN + payload.len());
        body.put_u16(message_type);
        body.put_u8(0);
        body.extend_from_slice(payload);
        body.freeze()
    }

    fn reference_message(
        &self,
        message_type: u16,
        hash: &ContentHash,
        total_len: usize,
    ) -> Result<Bytes, ProtocolFault> {
        let announced = u32::try_from(total_len).map_err(|_| {
            ProtocolFault::Codec(format!("referenced payload too large: {} bytes", total_len))
        })?;
        let mut body = BytesMut::with_capacity(BASE_HEADER_LEN + REFERENCE_LEN);
        body.put_u16(message_type);
        body.put_u8(FLAG_SPLIT);
        body.extend_from_slice(hash);
        body.put_u32(announced);
        Ok(body.freeze())
    }

    fn parse_frame_header(&self, body: &[u8]) -> Result<FrameHeader, ProtocolFault> {
        if body.len() < BASE_HEADER_LEN {
            return Err(ProtocolFault::Codec(format!(
                "frame body too short: {} bytes",
                body.len()
            )));
        }
        let mut cursor = body;
        let message_type = cursor.get_u16();
        let flags = cursor.get_u8();
        if flags & FLAG_SPLIT == 0 {
            return Ok(FrameHeader {
                message_type,
                split: false,
                content_hash: None,
                total_len: body.len() - BASE_HEADER_LEN,
                body_offset: BASE_HEADER_LEN,
            });
        }
        if cursor.len() < REFERENCE_LEN {
            return Err(ProtocolFault::Codec("truncated reference header".to_string()));
        }
        let mut hash = [0u8; 32];
        cursor.copy_to_slice(&mut hash);
        let total_len = cursor.get_u32() as usize;
        Ok(FrameHeader {
            message_type,
            split: true,
            content_hash: Some(hash),
            total_len,
            body_offset: BASE_HEADER_LEN + REFERENCE_LEN,
        })
    }

    fn dispatch(&self, connection_id: u64, header: FrameHeader, body: Bytes) {
        let payload = body.slice(header.body_offset.min(body.len())..);
        let message = InboundMessage {
            connection_id,
            header,
            payload,
        };
        if let Err(e) = self.inbound.try_send(message) {
            warn!("📥 Inbound queue full, dropping message from #{}: {}", connection_id, e);
        }
    }
}

/// In-memory send cache, LRU-bounded with a TTL per entry.
pub struct MemorySendCache {
    entries: Mutex<LruCache<ContentHash, (Bytes, Instant)>>,
    ttl: Duration,
}

impl MemorySendCache {
    pub const DEFAULT_CAPACITY: usize = 256;
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn expired(&self, stored: Instant) -> bool {
        stored.elapsed() >= self.ttl
    }
}

impl Default for MemorySendCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY, Self::DEFAULT_TTL)
    }
}

impl SendCache for MemorySendCache {
    fn exists(&self, hash: &ContentHash) -> bool {
        let mut entries = self.entries.lock();
        match entries.peek(hash).map(|(_, stored)| self.expired(*stored)) {
            Some(true) => {
                entries.pop(hash);
                false
            }
            Some(false) => true,
            None => false,
        }
    }

    fn store(&self, hash: ContentHash, payload: Bytes) {
        debug!("🗄️  Caching {} byte payload {}", payload.len(), hex::encode(&hash[..8]));
        self.entries.lock().put(hash, (payload, Instant::now()));
    }

    fn get(&self, hash: &ContentHash) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        match entries.peek(hash).map(|(_, stored)| self.expired(*stored)) {
            Some(true) => {
                entries.pop(hash);
                None
            }
            Some(false) => entries.get(hash).map(|(payload, _)| payload.clone()),
            None => None,
        }
    }

    fn acknowledge(&self, hash: &ContentHash) {
        self.entries.lock().pop(hash);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inline_message_dispatch() {
        let (codec, mut rx) = BasicCodec::new(Bytes::from_static(b"hello"));
        let body = codec.wrap_outbound_message(7, b"payload");
        let header = codec.parse_frame_header(&body).unwrap();
        assert_eq!(header.message_type, 7);
        assert!(!header.split);
        assert_eq!(header.total_len, 7);

        codec.dispatch(1, header, body);
        let msg = rx.recv().await.unwrap();
        assert_eq!(&msg.payload[..], b"payload");
        assert_eq!(msg.connection_id, 1);
    }

    #[test]
    fn test_reference_header() {
        let (codec, _rx) = BasicCodec::new(Bytes::from_static(b"hello"));
        let hash = content_hash(b"big body");
        let body = codec.reference_message(9, &hash, 1_000_000).unwrap();
        let header = codec.parse_frame_header(&body).unwrap();
        assert!(header.split);
        assert_eq!(header.content_hash, Some(hash));
        assert_eq!(header.total_len, 1_000_000);

        assert!(codec.parse_frame_header(&body[..10]).is_err());
        assert!(codec.parse_frame_header(&[0u8]).is_err());
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_reference_rejects_length_past_u32() {
        let (codec, _rx) = BasicCodec::new(Bytes::from_static(b"hello"));
        let hash = content_hash(b"huge body");
        let largest = codec.reference_message(9, &hash, u32::MAX as usize).unwrap();
        assert_eq!(
            codec.parse_frame_header(&largest).unwrap().total_len,
            u32::MAX as usize
        );

        let result = codec.reference_message(9, &hash, u32::MAX as usize + 1);
        assert!(matches!(result, Err(ProtocolFault::Codec(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_cache_expiry_and_ack() {
        let cache = MemorySendCache::new(4, Duration::from_secs(60));
        let hash = content_hash(b"x");
        cache.store(hash, Bytes::from_static(b"x"));
        assert!(cache.exists(&hash));
        cache.acknowledge(&hash);
        assert!(!cache.exists(&hash));

        cache.store(hash, Bytes::from_static(b"x"));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.get(&hash).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_send_cache_is_bounded() {
        let cache = MemorySendCache::new(2, Duration::from_secs(60));
        for i in 0..5u8 {
            cache.store(content_hash(&[i]), Bytes::from(vec![i]));
        }
        assert_eq!(cache.len(), 2);
        assert!(cache.exists(&content_hash(&[4])));
        assert!(!cache.exists(&content_hash(&[0])));
    }
}
