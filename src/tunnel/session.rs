use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use dashmap::{DashMap, mapref::entry::Entry};
use tokio::sync::{mpsc, oneshot, watch};

use crate::tunnel::{
    conn::{CloseReason, CloseSignal, Connection},
    error::TunnelError,
    protocol::Frame,
    transport::{
        DEFAULT_CONNECT_TIMEOUT, FrameChannel, FrameSink, FrameSource, TransportDialOptions,
        transport_by_name,
    },
};

pub const SUPPORTED_PROTOCOL: &str = "tcp";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_CAPACITY: usize = 10;

const CORRELATOR_ATTEMPTS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    /// Any number of concurrent or sequential dials.
    Reusable,
    /// Exactly one dial; closing its connection tears the tunnel down.
    SingleUse,
}

impl TunnelMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelMode::Reusable => "reusable",
            TunnelMode::SingleUse => "single_use",
        }
    }
}

impl std::fmt::Display for TunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub transport: String,
    pub connect_timeout: Duration,
    pub dial_timeout: Duration,
    /// Inbound payloads buffered per connection before the demultiplexer waits.
    pub queue_capacity: usize,
    pub dial: TransportDialOptions,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            transport: "tcp".into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            dial: TransportDialOptions::default(),
        }
    }
}

enum DialOutcome {
    Connected {
        connection_id: u64,
        inbound: mpsc::Receiver<Bytes>,
        signal: Arc<CloseSignal>,
    },
    Refused(String),
    Broken(String),
}

struct ConnSlot {
    inbound: mpsc::Sender<Bytes>,
    signal: Arc<CloseSignal>,
}

type CorrelatorSource = Box<dyn Fn() -> u64 + Send + Sync>;

pub(crate) struct Shared {
    mode: TunnelMode,
    dial_timeout: Duration,
    queue_capacity: usize,
    /// Single-writer send path. `None` once the session is torn down.
    writer: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    pending_dials: DashMap<u64, oneshot::Sender<DialOutcome>>,
    conns: DashMap<u64, ConnSlot>,
    dialed: AtomicBool,
    closed: AtomicBool,
    stop: watch::Sender<bool>,
    correlators: CorrelatorSource,
}

/// Client end of a multiplexing tunnel to a remote proxy.
///
/// Cloning yields another handle to the same session.
#[derive(Clone)]
pub struct Tunnel {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("mode", &self.shared.mode)
            .field("closed", &self.is_closed())
            .field("connections", &self.open_connections())
            .finish_non_exhaustive()
    }
}

impl Tunnel {
    pub async fn connect_reusable(addr: &str, opts: TunnelOptions) -> Result<Self, TunnelError> {
        Self::connect(addr, TunnelMode::Reusable, opts).await
    }

    pub async fn connect_single_use(addr: &str, opts: TunnelOptions) -> Result<Self, TunnelError> {
        Self::connect(addr, TunnelMode::SingleUse, opts).await
    }

    pub async fn connect(
        addr: &str,
        mode: TunnelMode,
        opts: TunnelOptions,
    ) -> Result<Self, TunnelError> {
        let connect_err = |source: anyhow::Error| TunnelError::Connect {
            addr: addr.to_string(),
            source,
        };

        let tr = transport_by_name(&opts.transport).map_err(connect_err)?;
        let dial = tr.dial(addr, opts.dial.clone());
        let channel = match tokio::time::timeout(opts.connect_timeout, dial).await {
            Ok(res) => res.map_err(connect_err)?,
            Err(_) => {
                return Err(connect_err(anyhow::anyhow!(
                    "timed out after {}",
                    humantime::format_duration(opts.connect_timeout)
                )));
            }
        };

        tracing::info!(transport = %tr.name(), server = %addr, %mode, "tunnel: connected");
        Ok(Self::from_channel(channel, mode, &opts))
    }

    /// Starts a session over an already established channel.
    pub fn from_channel(channel: FrameChannel, mode: TunnelMode, opts: &TunnelOptions) -> Self {
        Self::with_correlators(channel, mode, opts, Box::new(rand::random::<u64>))
    }

    fn with_correlators(
        channel: FrameChannel,
        mode: TunnelMode,
        opts: &TunnelOptions,
        correlators: CorrelatorSource,
    ) -> Self {
        let FrameChannel { sink, source } = channel;
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            mode,
            dial_timeout: if opts.dial_timeout.is_zero() {
                DEFAULT_DIAL_TIMEOUT
            } else {
                opts.dial_timeout
            },
            queue_capacity: opts.queue_capacity.max(1),
            writer: tokio::sync::Mutex::new(Some(sink)),
            pending_dials: DashMap::new(),
            conns: DashMap::new(),
            dialed: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            stop,
            correlators,
        });

        metrics::counter!("konnect_tunnels_total", "mode" => mode.as_str()).increment(1);
        tokio::spawn(demux_loop(shared.clone(), source));
        Self { shared }
    }

    pub fn mode(&self) -> TunnelMode {
        self.shared.mode
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn open_connections(&self) -> usize {
        self.shared.conns.len()
    }

    pub fn pending_dials(&self) -> usize {
        self.shared.pending_dials.len()
    }

    /// Resolves once the session has been torn down.
    pub async fn closed(&self) {
        let mut rx = self.shared.stop.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Opens a logical connection to `address` through the proxy.
    ///
    /// Failures are reported like a direct connect failure; the underlying
    /// [`TunnelError`] is available through [`TunnelError::from_io`].
    pub async fn dial(&self, protocol: &str, address: &str) -> io::Result<Connection> {
        let res = self.dial_inner(protocol, address).await;
        if let Err(err) = &res {
            // A single-use tunnel whose one dial failed can never carry a connection.
            if self.shared.mode == TunnelMode::SingleUse
                && !matches!(err, TunnelError::ReuseNotPermitted)
            {
                self.shared.shutdown(None).await;
            }
        }
        let result = if res.is_ok() { "ok" } else { "error" };
        metrics::counter!("konnect_tunnel_dials_total", "result" => result).increment(1);
        res.map_err(io::Error::from)
    }

    async fn dial_inner(&self, protocol: &str, address: &str) -> Result<Connection, TunnelError> {
        let sh = &self.shared;
        if sh.mode == TunnelMode::SingleUse && sh.dialed.swap(true, Ordering::AcqRel) {
            return Err(TunnelError::ReuseNotPermitted);
        }
        if protocol != SUPPORTED_PROTOCOL {
            return Err(TunnelError::UnsupportedProtocol(protocol.to_string()));
        }

        let (correlator, mut rx) = sh.register_dial()?;
        let _pending = PendingDial {
            shared: sh,
            correlator,
        };

        tracing::debug!(correlator, %address, "tunnel: dialing");
        sh.send(Frame::DialRequest {
            protocol: protocol.to_string(),
            address: address.to_string(),
            correlator,
        })
        .await?;

        let outcome = match tokio::time::timeout(sh.dial_timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(TunnelError::Stream("tunnel closed while dialing".into())),
            Err(_) => {
                sh.abandon_dial(&mut rx).await;
                tracing::warn!(
                    correlator,
                    %address,
                    timeout = %humantime::format_duration(sh.dial_timeout),
                    "tunnel: dial timed out"
                );
                return Err(TunnelError::DialTimeout {
                    address: address.to_string(),
                    timeout: sh.dial_timeout,
                });
            }
        };

        match outcome {
            DialOutcome::Connected {
                connection_id,
                inbound,
                signal,
            } => {
                tracing::debug!(correlator, connection_id, %address, "tunnel: dial succeeded");
                Ok(Connection::new(
                    connection_id,
                    sh.clone(),
                    inbound,
                    signal,
                ))
            }
            DialOutcome::Refused(message) => Err(TunnelError::RemoteDial {
                address: address.to_string(),
                message,
            }),
            DialOutcome::Broken(cause) => Err(TunnelError::Stream(cause)),
        }
    }

    /// Tears the session down. Idempotent.
    pub async fn close(&self) {
        self.shared.shutdown(None).await;
    }
}

/// Removes the pending-dial entry on every exit path of `dial`.
struct PendingDial<'a> {
    shared: &'a Arc<Shared>,
    correlator: u64,
}

impl Drop for PendingDial<'_> {
    fn drop(&mut self) {
        self.shared.pending_dials.remove(&self.correlator);
    }
}

impl Shared {
    fn register_dial(&self) -> Result<(u64, oneshot::Receiver<DialOutcome>), TunnelError> {
        for _ in 0..CORRELATOR_ATTEMPTS {
            let correlator = (self.correlators)();
            match self.pending_dials.entry(correlator) {
                Entry::Occupied(_) => {
                    tracing::warn!(correlator, "tunnel: correlator collision; regenerating");
                }
                Entry::Vacant(v) => {
                    let (tx, rx) = oneshot::channel();
                    v.insert(tx);
                    return Ok((correlator, rx));
                }
            }
        }
        Err(TunnelError::CorrelatorExhausted)
    }

    /// A response can land between the timeout firing and the waiter going
    /// away; such a connection is handed straight back to the proxy.
    async fn abandon_dial(&self, rx: &mut oneshot::Receiver<DialOutcome>) {
        rx.close();
        if let Ok(DialOutcome::Connected {
            connection_id,
            signal,
            ..
        }) = rx.try_recv()
        {
            tracing::debug!(connection_id, "tunnel: connection arrived after dial timeout");
            self.close_connection(connection_id, &signal).await;
        }
    }

    /// Sends one frame through the single-writer path. A transport failure is
    /// fatal for the session.
    pub(crate) async fn send(&self, frame: Frame) -> Result<(), TunnelError> {
        let mut w = self.writer.lock().await;
        let Some(sink) = w.as_mut() else {
            return Err(TunnelError::SendAfterClose);
        };

        let kind = frame.kind_name();
        let Err(err) = sink.send(frame).await else {
            return Ok(());
        };

        let cause = format!("send {kind}: {err}");
        tracing::warn!(err = %err, frame = kind, "tunnel: transport send failed");
        let broken = w.take();
        drop(w);
        if let Some(mut sink) = broken {
            sink.close().await;
        }
        self.shutdown(Some(cause.clone())).await;
        Err(TunnelError::Stream(cause))
    }

    /// Local close of one logical connection. Best-effort: a failed
    /// CloseRequest is logged, never awaited for acknowledgment.
    pub(crate) async fn close_connection(&self, connection_id: u64, signal: &CloseSignal) {
        if !signal.fire(CloseReason::Local) {
            return;
        }
        self.forget_connection(connection_id);

        if let Err(err) = self.send(Frame::CloseRequest { connection_id }).await {
            tracing::debug!(connection_id, err = %err, "tunnel: close request not sent");
        }
        self.connection_finished().await;
    }

    fn forget_connection(&self, connection_id: u64) {
        if self.conns.remove(&connection_id).is_some() {
            metrics::gauge!("konnect_tunnel_open_connections").decrement(1.0);
        }
    }

    /// A single-use tunnel ends with its connection.
    async fn connection_finished(&self) {
        if self.mode == TunnelMode::SingleUse {
            self.shutdown(None).await;
        }
    }

    pub(crate) async fn shutdown(&self, cause: Option<String>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.stop.send(true);

        let sink = self.writer.lock().await.take();
        if let Some(mut sink) = sink {
            sink.close().await;
        }

        // Wake every waiter now instead of letting dials run into their timeout.
        let waiters: Vec<u64> = self.pending_dials.iter().map(|e| *e.key()).collect();
        for correlator in waiters {
            if let Some((_, tx)) = self.pending_dials.remove(&correlator) {
                let msg = cause.clone().unwrap_or_else(|| "tunnel closed".into());
                let _ = tx.send(DialOutcome::Broken(msg));
            }
        }

        let open: Vec<u64> = self.conns.iter().map(|e| *e.key()).collect();
        for connection_id in open {
            if let Some((_, slot)) = self.conns.remove(&connection_id) {
                slot.signal.fire(CloseReason::Teardown(cause.clone()));
                metrics::gauge!("konnect_tunnel_open_connections").decrement(1.0);
            }
        }

        match &cause {
            Some(cause) => tracing::warn!(mode = %self.mode, cause = %cause, "tunnel: closed"),
            None => tracing::info!(mode = %self.mode, "tunnel: closed"),
        }
    }

    async fn dispatch(&self, frame: Frame) {
        match frame {
            Frame::DialResponse {
                correlator,
                error,
                connection_id,
            } => self.on_dial_response(correlator, error, connection_id).await,
            Frame::Data {
                connection_id,
                payload,
            } => self.on_data(connection_id, payload).await,
            Frame::CloseResponse {
                connection_id,
                error,
            } => self.on_close_response(connection_id, error).await,
            other @ (Frame::DialRequest { .. } | Frame::CloseRequest { .. }) => {
                tracing::warn!(frame = other.kind_name(), "tunnel: unexpected frame from proxy");
                discarded(other.kind_name());
            }
        }
    }

    async fn on_dial_response(&self, correlator: u64, error: String, connection_id: u64) {
        let Some((_, waiter)) = self.pending_dials.remove(&correlator) else {
            tracing::debug!(correlator, connection_id, "tunnel: dial response for unknown correlator");
            discarded("dial_response");
            if error.is_empty() {
                self.close_orphan(connection_id).await;
            }
            return;
        };

        if !error.is_empty() {
            let _ = waiter.send(DialOutcome::Refused(error));
            return;
        }

        // Register before waking the dialer so data right behind the response is kept.
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let signal = Arc::new(CloseSignal::new());
        self.conns.insert(
            connection_id,
            ConnSlot {
                inbound: tx,
                signal: signal.clone(),
            },
        );
        metrics::gauge!("konnect_tunnel_open_connections").increment(1.0);

        // A teardown since the waiter was taken has already swept `conns`.
        if self.closed.load(Ordering::Acquire) {
            self.forget_connection(connection_id);
            signal.fire(CloseReason::Teardown(None));
            let _ = waiter.send(DialOutcome::Broken("tunnel closed".into()));
            return;
        }

        let delivered = waiter.send(DialOutcome::Connected {
            connection_id,
            inbound: rx,
            signal,
        });
        if delivered.is_err() {
            tracing::debug!(correlator, connection_id, "tunnel: dialer gone before response");
            self.forget_connection(connection_id);
            self.close_orphan(connection_id).await;
        }
    }

    /// The proxy opened a connection nobody is waiting for; ask it to drop it.
    async fn close_orphan(&self, connection_id: u64) {
        if let Err(err) = self.send(Frame::CloseRequest { connection_id }).await {
            tracing::debug!(connection_id, err = %err, "tunnel: orphan close not sent");
        }
    }

    async fn on_data(&self, connection_id: u64, payload: Bytes) {
        let slot = self
            .conns
            .get(&connection_id)
            .map(|e| (e.inbound.clone(), e.signal.clone()));
        let Some((inbound, signal)) = slot else {
            tracing::debug!(connection_id, len = payload.len(), "tunnel: data for unknown connection");
            discarded("data");
            return;
        };

        // A full queue stalls the whole loop until the reader catches up or the
        // connection goes away.
        let mut stop = self.stop.subscribe();
        tokio::select! {
            res = inbound.send(payload) => {
                if res.is_err() {
                    tracing::debug!(connection_id, "tunnel: reader dropped; forgetting connection");
                    self.forget_connection(connection_id);
                }
            }
            _ = signal.fired() => {
                discarded("data");
            }
            _ = stop.wait_for(|stopped| *stopped) => {}
        }
    }

    async fn on_close_response(&self, connection_id: u64, error: String) {
        let Some((_, slot)) = self.conns.remove(&connection_id) else {
            tracing::debug!(connection_id, "tunnel: close response for unknown connection");
            discarded("close_response");
            return;
        };
        metrics::gauge!("konnect_tunnel_open_connections").decrement(1.0);

        let err = (!error.is_empty()).then_some(error);
        tracing::debug!(connection_id, err = ?err, "tunnel: connection closed by proxy");
        slot.signal.fire(CloseReason::Remote(err));
        drop(slot);

        self.connection_finished().await;
    }
}

fn discarded(kind: &'static str) {
    metrics::counter!("konnect_tunnel_frames_discarded_total", "kind" => kind).increment(1);
}

async fn demux_loop(shared: Arc<Shared>, mut source: Box<dyn FrameSource>) {
    let mut stop = shared.stop.subscribe();
    let cause = loop {
        let next = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => None,
            res = source.recv() => Some(res),
        };

        match next {
            None => break None,
            Some(Ok(Some(frame))) => shared.dispatch(frame).await,
            Some(Ok(None)) => {
                tracing::info!("tunnel: proxy ended the stream");
                break None;
            }
            Some(Err(err)) => {
                tracing::warn!(err = %err, "tunnel: receive failed");
                break Some(format!("receive: {err}"));
            }
        }

        if *stop.borrow() {
            break None;
        }
    };

    shared.shutdown(cause).await;
    tracing::debug!("tunnel: demultiplexer stopped");
}
