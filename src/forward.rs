//! Local TCP port forwards carried over the tunnel.

use std::{borrow::Cow, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

use crate::{
    config::{ForwardConfig, TunnelClientConfig},
    tunnel::{Connection, Tunnel, TunnelError, TunnelMode, TunnelOptions},
};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Normalize a bind/listen address: `":PORT"` means all interfaces.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Hands out logical connections for the forwards.
///
/// In reusable mode every connection shares the tunnel kept up by
/// [`TunnelDialer::maintain`]; in single-use mode each one gets its own.
pub struct TunnelDialer {
    server_addr: String,
    mode: TunnelMode,
    opts: TunnelOptions,
    current: watch::Sender<Option<Tunnel>>,
}

impl TunnelDialer {
    pub fn new(server_addr: impl Into<String>, mode: TunnelMode, opts: TunnelOptions) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            server_addr: server_addr.into(),
            mode,
            opts,
            current,
        }
    }

    pub fn from_config(cfg: &TunnelClientConfig) -> Self {
        Self::new(cfg.server_addr.clone(), cfg.mode, cfg.to_tunnel_options())
    }

    pub fn mode(&self) -> TunnelMode {
        self.mode
    }

    async fn connect(&self) -> Result<Tunnel, TunnelError> {
        Tunnel::connect(&self.server_addr, self.mode, self.opts.clone()).await
    }

    /// Keeps the shared tunnel connected until shutdown, reconnecting with
    /// exponential backoff whenever it goes away. Reusable mode only.
    pub async fn maintain(&self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        if self.mode != TunnelMode::Reusable {
            anyhow::bail!("forward: only reusable tunnels are shared");
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect().await {
                Ok(tunnel) => {
                    backoff = INITIAL_BACKOFF;
                    self.current.send_replace(Some(tunnel.clone()));

                    tokio::select! {
                        _ = tunnel.closed() => {
                            self.current.send_replace(None);
                            tracing::warn!(server = %self.server_addr, "forward: tunnel closed; reconnecting");
                            continue;
                        }
                        _ = stopped(&mut shutdown) => {
                            self.current.send_replace(None);
                            tunnel.close().await;
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        server = %self.server_addr,
                        err = %err,
                        backoff = %humantime::format_duration(backoff),
                        "forward: tunnel connect failed; retrying"
                    );
                }
            }

            tokio::select! {
                _ = stopped(&mut shutdown) => return Ok(()),
                _ = tokio::time::sleep(backoff) => {}
            }

            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Opens one logical connection to `destination`.
    pub async fn open(&self, protocol: &str, destination: &str) -> anyhow::Result<Connection> {
        let tunnel = match self.mode {
            TunnelMode::SingleUse => self
                .connect()
                .await
                .with_context(|| format!("forward: connect {}", self.server_addr))?,
            TunnelMode::Reusable => self.shared().await?,
        };
        tunnel
            .dial(protocol, destination)
            .await
            .with_context(|| format!("forward: dial {destination}"))
    }

    /// Waits, up to the connect timeout, for the shared tunnel to be up.
    async fn shared(&self) -> anyhow::Result<Tunnel> {
        let mut rx = self.current.subscribe();
        let wait = rx.wait_for(|t| t.as_ref().is_some_and(|t| !t.is_closed()));
        match tokio::time::timeout(self.opts.connect_timeout, wait).await {
            Ok(Ok(t)) => t.clone().context("forward: tunnel unavailable"),
            Ok(Err(_)) => anyhow::bail!("forward: dialer stopped"),
            Err(_) => anyhow::bail!(
                "forward: no tunnel to {} after {}",
                self.server_addr,
                humantime::format_duration(self.opts.connect_timeout)
            ),
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub async fn serve_forward_with_shutdown(
    fwd: ForwardConfig,
    dialer: Arc<TunnelDialer>,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bind_addr = normalize_bind_addr(&fwd.listen_addr);
    let ln = TcpListener::bind(bind_addr.as_ref())
        .await
        .with_context(|| format!("bind tcp {}", fwd.listen_addr))?;

    tracing::info!(
        listen_addr = %fwd.listen_addr,
        destination = %fwd.destination,
        mode = %dialer.mode(),
        "forward: listening"
    );

    serve_listener(ln, fwd, dialer, shutdown).await
}

pub async fn serve_listener(
    ln: TcpListener,
    fwd: ForwardConfig,
    dialer: Arc<TunnelDialer>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let fwd = Arc::new(fwd);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            res = ln.accept() => {
                let (sock, peer) = res?;
                metrics::counter!("konnect_forward_accepted_total").increment(1);
                let dialer = dialer.clone();
                let fwd = fwd.clone();

                tokio::spawn(async move {
                    tracing::debug!(client = %peer, destination = %fwd.destination, "forward: accepted");
                    if let Err(err) = bridge(sock, &fwd, &dialer).await {
                        tracing::warn!(client = %peer, destination = %fwd.destination, err = %format!("{err:#}"), "forward: connection failed");
                    }
                });
            }
        }
    }

    Ok(())
}

async fn bridge(mut sock: TcpStream, fwd: &ForwardConfig, dialer: &TunnelDialer) -> anyhow::Result<()> {
    let _ = sock.set_nodelay(true);
    let mut conn = dialer.open(&fwd.protocol, &fwd.destination).await?;
    let res = tokio::io::copy_bidirectional(&mut sock, &mut conn).await;
    conn.close().await?;
    let (up, down) = res?;
    tracing::debug!(connection_id = conn.id(), up, down, "forward: connection finished");
    Ok(())
}
