use std::{io, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel: connect {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("tunnel: unsupported protocol {0:?} (expected tcp)")]
    UnsupportedProtocol(String),
    #[error("tunnel: single-use tunnel was already dialed")]
    ReuseNotPermitted,
    #[error("tunnel: dial {address} timed out after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },
    #[error("tunnel: dial {address}: {message}")]
    RemoteDial { address: String, message: String },
    #[error("tunnel: connection closed by proxy: {0}")]
    RemoteClose(String),
    #[error("tunnel: stream: {0}")]
    Stream(String),
    #[error("tunnel: send after close")]
    SendAfterClose,
    #[error("tunnel: could not allocate a free dial correlator")]
    CorrelatorExhausted,
}

impl TunnelError {
    /// Recovers the tunnel error carried inside an `io::Error` produced by this crate.
    pub fn from_io(err: &io::Error) -> Option<&TunnelError> {
        err.get_ref()?.downcast_ref::<TunnelError>()
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            TunnelError::Connect { .. } => io::ErrorKind::NotConnected,
            TunnelError::UnsupportedProtocol(_) => io::ErrorKind::InvalidInput,
            TunnelError::ReuseNotPermitted => io::ErrorKind::Other,
            TunnelError::DialTimeout { .. } => io::ErrorKind::TimedOut,
            TunnelError::RemoteDial { .. } => io::ErrorKind::ConnectionRefused,
            TunnelError::RemoteClose(_) => io::ErrorKind::ConnectionReset,
            TunnelError::Stream(_) => io::ErrorKind::ConnectionAborted,
            TunnelError::SendAfterClose => io::ErrorKind::BrokenPipe,
            TunnelError::CorrelatorExhausted => io::ErrorKind::Other,
        }
    }
}

// Dial failures surface like a failed socket connect.
impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}
