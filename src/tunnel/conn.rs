use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes};
use futures_util::{FutureExt, future::BoxFuture};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    sync::{mpsc, watch},
};

use crate::tunnel::{
    error::TunnelError,
    protocol::{Frame, MAX_DATA_PAYLOAD},
    session::Shared,
};

/// The tunnel has no real socket endpoints; both accessors report this.
pub const PLACEHOLDER_ADDR: SocketAddr = SocketAddr::new(std::net::IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Local,
    /// CloseResponse from the proxy, with its error if any.
    Remote(Option<String>),
    /// The whole session went away.
    Teardown(Option<String>),
}

/// Fires at most once per connection.
pub(crate) struct CloseSignal {
    tx: watch::Sender<Option<CloseReason>>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Returns false if the signal had already fired.
    pub(crate) fn fire(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|cur| {
            if cur.is_some() {
                return false;
            }
            *cur = Some(reason);
            true
        })
    }

    pub(crate) fn reason(&self) -> Option<CloseReason> {
        self.tx.borrow().clone()
    }

    pub(crate) fn is_fired(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub(crate) async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(Option::is_some).await;
    }
}

/// One logical byte stream multiplexed over a tunnel.
///
/// Reads see the proxy's payloads in arrival order. Payload boundaries carry
/// no meaning. Dropping an open connection closes it.
pub struct Connection {
    id: u64,
    shared: Arc<Shared>,
    inbound: mpsc::Receiver<Bytes>,
    signal: Arc<CloseSignal>,
    /// Unread tail of the last payload handed out through `AsyncRead`.
    leftover: Bytes,
    write_fut: Option<BoxFuture<'static, io::Result<usize>>>,
    close_fut: Option<BoxFuture<'static, ()>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.signal.is_fired())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        shared: Arc<Shared>,
        inbound: mpsc::Receiver<Bytes>,
        signal: Arc<CloseSignal>,
    ) -> Self {
        Self {
            id,
            shared,
            inbound,
            signal,
            leftover: Bytes::new(),
            write_fut: None,
            close_fut: None,
        }
    }

    /// Connection id assigned by the proxy.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }

    pub fn peer_addr(&self) -> SocketAddr {
        PLACEHOLDER_ADDR
    }

    /// Waits for the next payload. `Ok(None)` is end-of-stream; a close error
    /// reported by the proxy is returned as an error.
    pub async fn read_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if !self.leftover.is_empty() {
            return Ok(Some(std::mem::take(&mut self.leftover)));
        }
        match self.inbound.recv().await {
            Some(b) => Ok(Some(b)),
            None => self.end_of_stream().map(|()| None),
        }
    }

    /// Sends `data` to the proxy, split into frames of at most
    /// [`MAX_DATA_PAYLOAD`] bytes.
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let mut rest = Bytes::copy_from_slice(data);
        while !rest.is_empty() {
            let n = rest.len().min(MAX_DATA_PAYLOAD);
            let chunk = rest.split_to(n);
            send_data(&self.shared, &self.signal, self.id, chunk).await?;
        }
        Ok(())
    }

    /// Sends a CloseRequest and forgets the connection locally without waiting
    /// for the proxy to acknowledge. Use [`Connection::closer`] to close from
    /// another task.
    pub async fn close(&mut self) -> io::Result<()> {
        self.shared.close_connection(self.id, &self.signal).await;
        Ok(())
    }

    /// A handle that can close this connection from another task.
    pub fn closer(&self) -> ConnectionCloser {
        ConnectionCloser {
            id: self.id,
            shared: self.shared.clone(),
            signal: self.signal.clone(),
        }
    }

    fn end_of_stream(&self) -> io::Result<()> {
        match self.signal.reason() {
            Some(CloseReason::Remote(Some(msg))) => Err(TunnelError::RemoteClose(msg).into()),
            _ => Ok(()),
        }
    }
}

async fn send_data(
    shared: &Shared,
    signal: &CloseSignal,
    connection_id: u64,
    payload: Bytes,
) -> io::Result<()> {
    if signal.is_fired() {
        return Err(TunnelError::SendAfterClose.into());
    }
    shared
        .send(Frame::Data {
            connection_id,
            payload,
        })
        .await
        .map_err(io::Error::from)
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.signal.is_fired() {
            return;
        }
        let Ok(rt) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(connection_id = self.id, "tunnel: connection dropped outside runtime");
            return;
        };
        let closer = self.closer();
        rt.spawn(async move { closer.close().await });
    }
}

#[derive(Clone)]
pub struct ConnectionCloser {
    id: u64,
    shared: Arc<Shared>,
    signal: Arc<CloseSignal>,
}

impl ConnectionCloser {
    pub async fn close(&self) {
        self.shared.close_connection(self.id, &self.signal).await;
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.leftover.is_empty() {
            match ready!(self.inbound.poll_recv(cx)) {
                Some(b) => self.leftover = b,
                None => return Poll::Ready(self.end_of_stream()),
            }
        }

        let n = self.leftover.len().min(buf.remaining());
        buf.put_slice(&self.leftover[..n]);
        self.leftover.advance(n);
        Poll::Ready(Ok(()))
    }
}

/// The protocol has no half-close: `poll_shutdown` closes the whole
/// connection, so payloads the proxy sends afterwards are discarded.
impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let fut = this.write_fut.get_or_insert_with(|| {
            let n = data.len().min(MAX_DATA_PAYLOAD);
            let payload = Bytes::copy_from_slice(&data[..n]);
            let (shared, signal, id) = (this.shared.clone(), this.signal.clone(), this.id);
            async move { send_data(&shared, &signal, id, payload).await.map(|()| n) }.boxed()
        });

        let res = ready!(fut.poll_unpin(cx));
        this.write_fut = None;
        Poll::Ready(res)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The sink flushes every frame; only an in-flight write needs finishing.
        let this = self.get_mut();
        if let Some(fut) = this.write_fut.as_mut() {
            let res = ready!(fut.poll_unpin(cx));
            this.write_fut = None;
            res?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;

        let this = self.get_mut();
        if this.close_fut.is_none() {
            let closer = this.closer();
            this.close_fut = Some(async move { closer.close().await }.boxed());
        }
        if let Some(fut) = this.close_fut.as_mut() {
            ready!(fut.poll_unpin(cx));
        }
        this.close_fut = None;
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::tunnel::{
        session::{Tunnel, TunnelMode, TunnelOptions},
        testing::{Proxy, within},
        transport::FrameChannel,
    };

    async fn connected(id: u64) -> (Tunnel, Proxy, Connection) {
        let (a, b) = tokio::io::duplex(256 * 1024);
        let tunnel = Tunnel::from_channel(
            FrameChannel::from_stream(a),
            TunnelMode::Reusable,
            &TunnelOptions::default(),
        );
        let mut proxy = Proxy::new(b);

        let t = tunnel.clone();
        let dial = tokio::spawn(async move { t.dial("tcp", "db.internal:5432").await });
        let correlator = proxy.expect_dial("db.internal:5432").await;
        proxy.dial_ok(correlator, id).await;
        let conn = within(dial).await.unwrap().unwrap();
        (tunnel, proxy, conn)
    }

    #[test]
    fn close_signal_fires_once() {
        let s = CloseSignal::new();
        assert!(s.reason().is_none());
        assert!(s.fire(CloseReason::Remote(Some("boom".into()))));
        assert!(!s.fire(CloseReason::Local));
        assert_eq!(s.reason(), Some(CloseReason::Remote(Some("boom".into()))));
    }

    #[tokio::test]
    async fn async_read_spans_payload_boundaries() {
        let (_tunnel, mut proxy, mut conn) = connected(1).await;
        proxy.data(1, "hel").await;
        proxy.data(1, "lo world").await;

        let mut buf = [0u8; 5];
        within(conn.read_exact(&mut buf)).await.unwrap();
        assert_eq!(&buf, b"hello");

        let mut rest = [0u8; 6];
        within(conn.read_exact(&mut rest)).await.unwrap();
        assert_eq!(&rest, b" world");
    }

    #[tokio::test]
    async fn large_writes_are_split_into_data_frames() {
        let (_tunnel, mut proxy, mut conn) = connected(2).await;
        let data = vec![7u8; MAX_DATA_PAYLOAD + 10];
        within(conn.write(&data)).await.unwrap();

        let mut sizes = Vec::new();
        for _ in 0..2 {
            match proxy.recv().await {
                Frame::Data {
                    connection_id,
                    payload,
                } => {
                    assert_eq!(connection_id, 2);
                    sizes.push(payload.len());
                }
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        assert_eq!(sizes, vec![MAX_DATA_PAYLOAD, 10]);
    }

    #[tokio::test]
    async fn async_write_and_shutdown_map_to_frames() {
        let (tunnel, mut proxy, mut conn) = connected(3).await;

        within(conn.write_all(b"ping")).await.unwrap();
        within(conn.shutdown()).await.unwrap();

        assert_eq!(
            proxy.recv().await,
            Frame::Data {
                connection_id: 3,
                payload: Bytes::from_static(b"ping"),
            }
        );
        assert_eq!(proxy.recv().await, Frame::CloseRequest { connection_id: 3 });
        assert_eq!(tunnel.open_connections(), 0);

        let mut buf = Vec::new();
        assert_eq!(within(conn.read_to_end(&mut buf)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closer_unblocks_a_pending_read() {
        let (_tunnel, mut proxy, mut conn) = connected(4).await;
        let closer = conn.closer();

        let reader = tokio::spawn(async move { conn.read_chunk().await });
        tokio::task::yield_now().await;
        closer.close().await;

        assert_eq!(within(reader).await.unwrap().unwrap(), None);
        assert_eq!(proxy.recv().await, Frame::CloseRequest { connection_id: 4 });
    }

    #[tokio::test]
    async fn dropping_an_open_connection_closes_it() {
        let (tunnel, mut proxy, conn) = connected(5).await;
        drop(conn);

        assert_eq!(proxy.recv().await, Frame::CloseRequest { connection_id: 5 });
        assert_eq!(tunnel.open_connections(), 0);
    }

    #[tokio::test]
    async fn connection_can_be_driven_from_a_spawned_task() {
        let (tunnel, mut proxy, mut conn) = connected(7).await;

        let task = tokio::spawn(async move {
            conn.write(b"hi").await?;
            conn.close().await
        });

        assert_eq!(
            proxy.recv().await,
            Frame::Data {
                connection_id: 7,
                payload: Bytes::from_static(b"hi"),
            }
        );
        assert_eq!(proxy.recv().await, Frame::CloseRequest { connection_id: 7 });
        within(task).await.unwrap().unwrap();
        assert_eq!(tunnel.open_connections(), 0);
    }

    #[tokio::test]
    async fn addresses_are_placeholders() {
        let (_tunnel, _proxy, conn) = connected(6).await;
        assert_eq!(conn.local_addr(), PLACEHOLDER_ADDR);
        assert_eq!(conn.peer_addr(), PLACEHOLDER_ADDR);
    }
}
