use std::{future::Future, time::Duration};

use bytes::Bytes;
use tokio::io::DuplexStream;

use crate::tunnel::{protocol::Frame, transport::FrameChannel};

pub(crate) const WAIT: Duration = Duration::from_secs(5);

pub(crate) async fn within<F: Future>(f: F) -> F::Output {
    tokio::time::timeout(WAIT, f)
        .await
        .expect("timed out waiting for the tunnel")
}

/// Scripted remote proxy end of an in-memory frame channel.
pub(crate) struct Proxy {
    ch: FrameChannel,
}

impl Proxy {
    pub(crate) fn new(stream: DuplexStream) -> Self {
        Self {
            ch: FrameChannel::from_stream(stream),
        }
    }

    pub(crate) async fn recv(&mut self) -> Frame {
        within(self.ch.source.recv())
            .await
            .unwrap()
            .expect("tunnel channel ended")
    }

    pub(crate) async fn send(&mut self, frame: Frame) {
        self.ch.sink.send(frame).await.unwrap();
    }

    /// Reads a dial request for `address` and returns its correlator.
    pub(crate) async fn expect_dial(&mut self, address: &str) -> u64 {
        match self.recv().await {
            Frame::DialRequest {
                correlator,
                protocol,
                address: got,
            } => {
                assert_eq!(protocol, "tcp");
                assert_eq!(got, address);
                correlator
            }
            other => panic!("expected DialRequest, got {other:?}"),
        }
    }

    pub(crate) async fn dial_ok(&mut self, correlator: u64, connection_id: u64) {
        self.send(Frame::DialResponse {
            correlator,
            connection_id,
            error: String::new(),
        })
        .await;
    }

    pub(crate) async fn data(&mut self, connection_id: u64, payload: &str) {
        self.send(Frame::Data {
            connection_id,
            payload: Bytes::copy_from_slice(payload.as_bytes()),
        })
        .await;
    }

    pub(crate) async fn expect_silence(&mut self) {
        let got = tokio::time::timeout(Duration::from_millis(100), self.ch.source.recv()).await;
        assert!(got.is_err(), "unexpected frame: {got:?}");
    }

    pub(crate) async fn expect_eof(&mut self) {
        let got = within(self.ch.source.recv()).await.unwrap();
        assert_eq!(got, None);
    }
}
