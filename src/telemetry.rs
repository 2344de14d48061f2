use std::net::SocketAddr;

use anyhow::Context;
use metrics::Unit;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Installs the Prometheus recorder for the `metrics` crate and serves the
/// exposition format on `addr`.
///
/// Must be called once per process, from within the tokio runtime.
pub fn init_prometheus(addr: &str) -> anyhow::Result<()> {
    let listen: SocketAddr = addr
        .parse()
        .with_context(|| format!("metrics: invalid metrics_addr {addr:?}"))?;

    PrometheusBuilder::new()
        .with_http_listener(listen)
        .install()
        .context("metrics: install Prometheus exporter")?;

    describe();
    tracing::info!(addr = %listen, "metrics: prometheus exporter listening");
    Ok(())
}

fn describe() {
    metrics::describe_counter!("konnect_tunnels_total", "Tunnel sessions established, by mode");
    metrics::describe_counter!(
        "konnect_tunnel_dials_total",
        "Logical connection dials through a tunnel, by result"
    );
    metrics::describe_counter!(
        "konnect_tunnel_frames_discarded_total",
        "Inbound frames dropped because nothing was waiting for them, by kind"
    );
    metrics::describe_gauge!(
        "konnect_tunnel_open_connections",
        Unit::Count,
        "Logical connections currently open across all tunnels"
    );
    metrics::describe_counter!(
        "konnect_forward_accepted_total",
        "Local sockets accepted by port forwards"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unparseable_listen_addr() {
        let err = init_prometheus("not-an-addr").unwrap_err();
        assert!(err.to_string().contains("metrics_addr"));
    }
}
