use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::tunnel::transport::{FrameChannel, Transport, TransportDialOptions};

pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<FrameChannel> {
        let c = TcpStream::connect(addr).await?;
        if opts.tcp_nodelay {
            c.set_nodelay(true)?;
        }
        tracing::debug!(
            remote = ?c.peer_addr().ok(),
            local = ?c.local_addr().ok(),
            "tunnel: tcp transport connected"
        );
        let (r, w) = c.into_split();
        Ok(FrameChannel::from_io(r, w))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::protocol::{self, Frame};

    #[tokio::test]
    async fn dial_frames_over_a_real_socket() {
        let ln = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut c, _) = ln.accept().await.unwrap();
            protocol::read_frame(&mut c).await.unwrap()
        });

        let mut ch = TcpTransport::new()
            .dial(&addr, TransportDialOptions::default())
            .await
            .unwrap();
        ch.sink
            .send(Frame::CloseRequest { connection_id: 11 })
            .await
            .unwrap();

        assert_eq!(
            server.await.unwrap(),
            Some(Frame::CloseRequest { connection_id: 11 })
        );
    }
}
