//! Byte transport strategies underneath a connection.
//!
//! Both strategies obey the same contract and differ only in how bytes move:
//! `Pipe` queues fragments and flushes them with vectored writes, `Stream`
//! goes through a buffered writer. Reads are bounded by a cycle timeout so the
//! connection can notice a peer that stops sending mid-frame.

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::IoSlice;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ConnectionError;

const PIPE_READ_RESERVE: usize = 64 * 1024;
const STREAM_READ_CHUNK: usize = 16 * 1024;
const STREAM_WRITE_BUFFER: usize = 256 * 1024;
const MAX_IOVECS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportStrategy {
    #[default]
    Pipe,
    Stream,
}

/// Bytes handed from one read cycle to the next.
#[derive(Debug, Default)]
pub struct ReadState {
    /// Unconsumed bytes (carried-over plus newly arrived).
    pub buffer: BytesMut,
    /// Bytes that arrived during the last cycle.
    pub fresh: usize,
    /// The peer closed its side.
    pub eof: bool,
}

impl ReadState {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait FrameSource: Send {
    /// Wait up to one read cycle for more bytes, continuing `previous`.
    async fn read_frame(
        &mut self,
        previous: ReadState,
        cancel: &CancellationToken,
    ) -> Result<ReadState, ConnectionError>;
}

#[async_trait]
pub trait FragmentWriter: Send {
    /// Buffer bytes without flushing.
    async fn write_fragment(&mut self, bytes: Bytes) -> std::io::Result<()>;

    /// Flush everything buffered so far. Returns false if the peer is gone.
    async fn complete_write(&mut self) -> bool;

    async fn shutdown(&mut self);
}

impl TransportStrategy {
    pub fn split<R, W>(
        self,
        reader: R,
        writer: W,
        read_cycle: Duration,
    ) -> (Box<dyn FrameSource>, Box<dyn FragmentWriter>)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        match self {
            TransportStrategy::Pipe => (
                Box::new(PipeReader { inner: reader, read_cycle }),
                Box::new(PipeWriter {
                    inner: writer,
                    pending: VecDeque::new(),
                }),
            ),
            TransportStrategy::Stream => (
                Box::new(StreamReader { inner: reader, read_cycle }),
                Box::new(StreamWriter {
                    inner: BufWriter::with_capacity(STREAM_WRITE_BUFFER, writer),
                }),
            ),
        }
    }
}

struct PipeReader<R> {
    inner: R,
    read_cycle: Duration,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for PipeReader<R> {
    async fn read_frame(
        &mut self,
        mut previous: ReadState,
        cancel: &CancellationToken,
    ) -> Result<ReadState, ConnectionError> {
        previous.fresh = 0;
        previous.buffer.reserve(PIPE_READ_RESERVE);
        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            _ = tokio::time::sleep(self.read_cycle) => Ok(previous),
            // read_buf is cancel-safe: nothing is lost if the cycle ends first
            read = self.inner.read_buf(&mut previous.buffer) => {
                let n = read?;
                previous.fresh = n;
                previous.eof = n == 0;
                Ok(previous)
            }
        }
    }
}

struct PipeWriter<W> {
    inner: W,
    pending: VecDeque<Bytes>,
}

impl<W: AsyncWrite + Unpin + Send> PipeWriter<W> {
    async fn drain(&mut self) -> std::io::Result<()> {
        while !self.pending.is_empty() {
            let written = {
                let slices: Vec<IoSlice<'_>> = self
                    .pending
                    .iter()
                    .take(MAX_IOVECS)
                    .map(|b| IoSlice::new(b))
                    .collect();
                self.inner.write_vectored(&slices).await?
            };
            if written == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            let mut left = written;
            while left > 0 {
                let Some(front) = self.pending.front_mut() else {
                    break;
                };
                if front.len() <= left {
                    left -= front.len();
                    self.pending.pop_front();
                } else {
                    front.advance(left);
                    left = 0;
                }
            }
        }
        self.inner.flush().await
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FragmentWriter for PipeWriter<W> {
    async fn write_fragment(&mut self, bytes: Bytes) -> std::io::Result<()> {
        if !bytes.is_empty() {
            self.pending.push_back(bytes);
        }
        Ok(())
    }

    async fn complete_write(&mut self) -> bool {
        match self.drain().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Vectored write failed: {}", e);
                self.pending.clear();
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        self.pending.clear();
        let _ = self.inner.shutdown().await;
    }
}

struct StreamReader<R> {
    inner: R,
    read_cycle: Duration,
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for StreamReader<R> {
    async fn read_frame(
        &mut self,
        mut previous: ReadState,
        cancel: &CancellationToken,
    ) -> Result<ReadState, ConnectionError> {
        previous.fresh = 0;
        let mut chunk = [0u8; STREAM_READ_CHUNK];
        tokio::select! {
            _ = cancel.cancelled() => Err(ConnectionError::Cancelled),
            _ = tokio::time::sleep(self.read_cycle) => Ok(previous),
            read = self.inner.read(&mut chunk) => {
                let n = read?;
                previous.buffer.extend_from_slice(&chunk[..n]);
                previous.fresh = n;
                previous.eof = n == 0;
                Ok(previous)
            }
        }
    }
}

struct StreamWriter<W: AsyncWrite> {
    inner: BufWriter<W>,
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FragmentWriter for StreamWriter<W> {
    async fn write_fragment(&mut self, bytes: Bytes) -> std::io::Result<()> {
        self.inner.write_all(&bytes).await
    }

    async fn complete_write(&mut self) -> bool {
        match self.inner.flush().await {
            Ok(()) => true,
            Err(e) => {
                debug!("Stream flush failed: {}", e);
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exchange(strategy: TransportStrategy) {
        let (a, b) = tokio::io::duplex(64);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        let (_, mut writer) = strategy.split(a_read, a_write, Duration::from_millis(50));
        let (mut source, _) = strategy.split(b_read, b_write, Duration::from_millis(50));
        let cancel = CancellationToken::new();

        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let send = payload.clone();
        let sender = tokio::spawn(async move {
            writer.write_fragment(Bytes::from_static(b"hdr")).await.unwrap();
            writer.write_fragment(Bytes::from(send)).await.unwrap();
            assert!(writer.complete_write().await);
        });

        let mut state = ReadState::new();
        while state.buffer.len() < 3 + payload.len() {
            state = source.read_frame(state, &cancel).await.unwrap();
            assert!(!state.eof);
        }
        sender.await.unwrap();
        assert_eq!(&state.buffer[..3], b"hdr");
        assert_eq!(&state.buffer[3..], &payload[..]);
    }

    #[tokio::test]
    async fn test_pipe_strategy_delivers_fragments_in_order() {
        exchange(TransportStrategy::Pipe).await;
    }

    #[tokio::test]
    async fn test_stream_strategy_delivers_fragments_in_order() {
        exchange(TransportStrategy::Stream).await;
    }

    #[tokio::test]
    async fn test_idle_cycle_yields_no_bytes() {
        let (a, _b) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(a);
        let (mut source, _) = TransportStrategy::Pipe.split(r, w, Duration::from_millis(20));
        let state = source
            .read_frame(ReadState::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.fresh, 0);
        assert!(!state.eof);
    }

    #[tokio::test]
    async fn test_cancelled_read_reports_cancellation() {
        let (a, _b) = tokio::io::duplex(64);
        let (r, w) = tokio::io::split(a);
        let (mut source, _) = TransportStrategy::Stream.split(r, w, Duration::from_secs(30));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = source.read_frame(ReadState::new(), &cancel).await;
        assert!(matches!(result, Err(ConnectionError::Cancelled)));
    }
}
