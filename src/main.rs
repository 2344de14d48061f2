use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "konnect",
    version,
    about = "konnect - forward local TCP ports through a multiplexing tunnel"
)]
struct Cli {
    /// Path to konnect config file (.toml/.yaml/.yml). If omitted, uses KONNECT_CONFIG; then auto-detects konnect.toml > konnect.yaml > konnect.yml from CWD; then falls back to the OS default path (Linux: /etc/konnect/konnect.toml; others: user config dir).
    #[arg(long, env = "KONNECT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    konnect::run(cli.config).await
}
