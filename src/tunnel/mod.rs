//! Tunnel client: many logical TCP connections multiplexed over one ordered
//! frame channel to a remote proxy.
//!
//! A [`Tunnel`] owns the channel and a background demultiplex loop that routes
//! inbound frames to pending dials and open [`Connection`]s.

pub mod conn;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use conn::{Connection, ConnectionCloser};
pub use error::TunnelError;
pub use protocol::{Frame, ProtocolError};
pub use session::{Tunnel, TunnelMode, TunnelOptions};
pub use transport::{FrameChannel, FrameSink, FrameSource, Transport, TransportDialOptions};
