use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::tunnel::protocol::{self, Frame, ProtocolError};

/// Outbound half of a frame channel. Callers serialize access; implementations
/// may assume a single writer.
#[async_trait]
pub trait FrameSink: Send {
    async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError>;
    async fn close(&mut self);
}

/// Inbound half of a frame channel. `Ok(None)` means the peer ended the channel.
#[async_trait]
pub trait FrameSource: Send {
    async fn recv(&mut self) -> Result<Option<Frame>, ProtocolError>;
}

/// An established, ordered, bidirectional frame channel to the proxy.
pub struct FrameChannel {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

impl std::fmt::Debug for FrameChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameChannel").finish_non_exhaustive()
    }
}

impl FrameChannel {
    pub fn new(sink: Box<dyn FrameSink>, source: Box<dyn FrameSource>) -> Self {
        Self { sink, source }
    }

    /// Frames the given byte halves with the tunnel codec.
    pub fn from_io<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            Box::new(StreamSink::new(writer)),
            Box::new(StreamSource::new(reader)),
        )
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (r, w) = tokio::io::split(stream);
        Self::from_io(r, w)
    }
}

pub struct StreamSink<W> {
    inner: W,
    buf: BytesMut,
}

impl<W> StreamSink<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }
}

#[async_trait]
impl<W> FrameSink for StreamSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        protocol::write_frame(&mut self.inner, &frame, &mut self.buf).await
    }

    async fn close(&mut self) {
        let _ = self.inner.shutdown().await;
    }
}

pub struct StreamSource<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead> StreamSource<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }
}

#[async_trait]
impl<R> FrameSource for StreamSource<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn recv(&mut self) -> Result<Option<Frame>, ProtocolError> {
        protocol::read_frame(&mut self.inner).await
    }
}

#[derive(Debug, Clone, Default)]
pub struct QuicDialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
    /// PEM bundle of trusted roots for the proxy certificate.
    pub ca_file: String,
    pub next_protos: Vec<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct TransportDialOptions {
    pub tcp_nodelay: bool,
    pub quic: QuicDialOptions,
}

impl Default for TransportDialOptions {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            quic: QuicDialOptions::default(),
        }
    }
}

/// Establishes the frame channel a tunnel session runs over.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<FrameChannel>;
}

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tcp".into();
    }
    match n.as_str() {
        "tcp" | "quic" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tcp|quic)"),
    }
}

pub fn default_alpn(next: &[Vec<u8>]) -> Vec<Vec<u8>> {
    if !next.is_empty() {
        return next.to_vec();
    }
    vec![b"konnect-tunnel".to_vec()]
}

pub mod quic;
pub mod tcp;

pub fn transport_by_name(name: &str) -> anyhow::Result<Box<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "quic" => Ok(Box::new(quic::QuicTransport::new())),
        _ => Ok(Box::new(tcp::TcpTransport::new())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_names_normalize_and_default_to_tcp() {
        assert_eq!(parse_transport("").unwrap(), "tcp");
        assert_eq!(parse_transport(" QUIC ").unwrap(), "quic");
        assert!(parse_transport("udp").is_err());
        assert_eq!(transport_by_name("tcp").unwrap().name(), "tcp");
    }

    #[tokio::test]
    async fn stream_channel_carries_frames_both_ways() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = FrameChannel::from_stream(a);
        let mut right = FrameChannel::from_stream(b);

        left.sink
            .send(Frame::CloseRequest { connection_id: 3 })
            .await
            .unwrap();
        assert_eq!(
            right.source.recv().await.unwrap(),
            Some(Frame::CloseRequest { connection_id: 3 })
        );

        right.sink.close().await;
        drop(right);
        assert_eq!(left.source.recv().await.unwrap(), None);
    }
}
