pub mod app;
pub mod config;
pub mod forward;
pub mod logging;
pub mod telemetry;
pub mod tunnel;

pub use tunnel::{Connection, Tunnel, TunnelError, TunnelMode, TunnelOptions};

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
