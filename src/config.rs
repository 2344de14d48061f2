use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use directories::ProjectDirs;
use serde::Deserialize;

use crate::tunnel::{
    TunnelMode, TunnelOptions,
    session::{DEFAULT_DIAL_TIMEOUT, DEFAULT_QUEUE_CAPACITY, SUPPORTED_PROTOCOL},
    transport::{DEFAULT_CONNECT_TIMEOUT, QuicDialOptions, TransportDialOptions, parse_transport},
};

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

const CANDIDATES: [&str; 3] = ["konnect.toml", "konnect.yaml", "konnect.yml"];

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap folds KONNECT_CONFIG into the flag; this covers library callers.
    if let Some(p) = std::env::var_os("KONNECT_CONFIG") {
        if !p.is_empty() {
            return Ok(ResolvedConfigPath {
                path: normalize_explicit_path(Path::new(&p))?,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Some(p) = discover_config_path(Path::new(".")) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("konnect.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    CANDIDATES
        .iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/konnect/konnect.toml"));
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj = ProjectDirs::from("dev", "konnect", "konnect")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("konnect.toml"))
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    /// Prometheus scrape listener; empty disables the exporter.
    pub metrics_addr: String,
    pub tunnel: TunnelClientConfig,
    pub forwards: Vec<ForwardConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TunnelClientConfig {
    pub server_addr: String,
    pub transport: String,
    pub mode: TunnelMode,
    pub connect_timeout: Duration,
    pub dial_timeout: Duration,
    pub queue_capacity: usize,
    pub tcp_nodelay: bool,
    pub quic: QuicClientConfig,
}

#[derive(Debug, Clone, Default)]
pub struct QuicClientConfig {
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub ca_file: String,
}

#[derive(Debug, Clone)]
pub struct ForwardConfig {
    pub listen_addr: String,
    /// `host:port` the proxy dials on our behalf.
    pub destination: String,
    pub protocol: String,
}

impl TunnelClientConfig {
    pub fn to_tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            transport: self.transport.clone(),
            connect_timeout: self.connect_timeout,
            dial_timeout: self.dial_timeout,
            queue_capacity: self.queue_capacity,
            dial: TransportDialOptions {
                tcp_nodelay: self.tcp_nodelay,
                quic: QuicDialOptions {
                    server_name: self.quic.server_name.clone(),
                    insecure_skip_verify: self.quic.insecure_skip_verify,
                    ca_file: self.quic.ca_file.clone(),
                    next_protos: vec![],
                },
            },
        }
    }
}

pub fn parse_mode(s: &str) -> anyhow::Result<TunnelMode> {
    match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "" | "reusable" => Ok(TunnelMode::Reusable),
        "single_use" | "singleuse" => Ok(TunnelMode::SingleUse),
        _ => anyhow::bail!("config: unknown tunnel mode {s:?} (expected reusable|single_use)"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    logging: Option<FileLogging>,
    #[serde(default)]
    metrics_addr: String,
    tunnel: Option<FileTunnel>,
    #[serde(default)]
    forwards: Vec<FileForward>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileTunnel {
    server_addr: String,
    transport: Option<String>,
    mode: Option<String>,
    connect_timeout_ms: Option<i64>,
    dial_timeout_ms: Option<i64>,
    queue_capacity: Option<i64>,
    tcp_nodelay: Option<bool>,
    quic: Option<FileQuicClient>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileQuicClient {
    server_name: Option<String>,
    #[serde(default)]
    insecure_skip_verify: bool,
    ca_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileForward {
    listen_addr: String,
    destination: String,
    #[serde(default)]
    protocol: String,
}

fn millis_or(v: Option<i64>, default: Duration) -> Duration {
    match v {
        Some(ms) if ms > 0 => Duration::from_millis(ms as u64),
        _ => default,
    }
}

fn trimmed(v: &Option<String>) -> String {
    v.as_deref().unwrap_or_default().trim().to_string()
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut logging = LoggingConfig::default();
        if let Some(l) = &fc.logging {
            for (dst, src) in [
                (&mut logging.level, &l.level),
                (&mut logging.format, &l.format),
                (&mut logging.output, &l.output),
            ] {
                let v = trimmed(src);
                if !v.is_empty() {
                    *dst = v;
                }
            }
            logging.add_source = l.add_source;
        }

        let Some(t) = fc.tunnel else {
            anyhow::bail!("config: missing [tunnel] section");
        };
        let server_addr = t.server_addr.trim().to_string();
        if server_addr.is_empty() {
            anyhow::bail!("config: tunnel.server_addr is required");
        }
        let transport = parse_transport(t.transport.as_deref().unwrap_or_default())
            .context("config: tunnel.transport")?;
        let mode = parse_mode(t.mode.as_deref().unwrap_or_default())?;
        let queue_capacity = match t.queue_capacity {
            Some(n) if n > 0 => n as usize,
            _ => DEFAULT_QUEUE_CAPACITY,
        };
        let quic = t
            .quic
            .as_ref()
            .map(|q| QuicClientConfig {
                server_name: trimmed(&q.server_name),
                insecure_skip_verify: q.insecure_skip_verify,
                ca_file: trimmed(&q.ca_file),
            })
            .unwrap_or_default();
        if transport == "quic" && !quic.insecure_skip_verify && quic.ca_file.is_empty() {
            anyhow::bail!("config: tunnel.quic.ca_file is required unless insecure_skip_verify");
        }

        let tunnel = TunnelClientConfig {
            server_addr,
            transport,
            mode,
            connect_timeout: millis_or(t.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT),
            dial_timeout: millis_or(t.dial_timeout_ms, DEFAULT_DIAL_TIMEOUT),
            queue_capacity,
            tcp_nodelay: t.tcp_nodelay.unwrap_or(true),
            quic,
        };

        let mut forwards = Vec::with_capacity(fc.forwards.len());
        for (i, f) in fc.forwards.iter().enumerate() {
            let listen_addr = f.listen_addr.trim().to_string();
            let destination = f.destination.trim().to_string();
            if listen_addr.is_empty() {
                anyhow::bail!("config: forwards[{i}] missing listen_addr");
            }
            if destination.is_empty() {
                anyhow::bail!("config: forwards[{i}] missing destination");
            }
            let protocol = if f.protocol.trim().is_empty() {
                SUPPORTED_PROTOCOL.to_string()
            } else {
                f.protocol.trim().to_ascii_lowercase()
            };
            if protocol != SUPPORTED_PROTOCOL {
                anyhow::bail!(
                    "config: forwards[{i}] protocol {protocol:?} is not supported (expected {SUPPORTED_PROTOCOL})"
                );
            }
            forwards.push(ForwardConfig {
                listen_addr,
                destination,
                protocol,
            });
        }

        Ok(Config {
            logging,
            metrics_addr: fc.metrics_addr.trim().to_string(),
            tunnel,
            forwards,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        p.push(format!(
            "konnect_cfg_test_{name}_{}_{}",
            std::process::id(),
            now
        ));
        std::fs::create_dir_all(&p).expect("mkdir");
        p
    }

    #[test]
    fn toml_defaults_fill_in_tunnel_options() {
        let dir = temp_dir("toml_defaults");
        let cfg_path = dir.join("konnect.toml");

        let toml = r#"
[tunnel]
server_addr = "proxy.internal:7000"

[[forwards]]
listen_addr = ":5432"
destination = "db.internal:5432"
"#;

        std::fs::write(&cfg_path, toml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.tunnel.transport, "tcp");
        assert_eq!(cfg.tunnel.mode, TunnelMode::Reusable);
        assert_eq!(cfg.logging.format, "json");
        assert_eq!(cfg.forwards[0].protocol, "tcp");

        let opts = cfg.tunnel.to_tunnel_options();
        assert_eq!(opts.dial_timeout, Duration::from_secs(30));
        assert_eq!(opts.connect_timeout, Duration::from_secs(10));
        assert_eq!(opts.queue_capacity, 10);
        assert!(opts.dial.tcp_nodelay);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn yaml_selects_single_use_quic() {
        let dir = temp_dir("yaml_quic");
        let cfg_path = dir.join("konnect.yaml");

        let yaml = r#"
metrics_addr: "127.0.0.1:9100"
logging:
  level: debug
  format: text
tunnel:
  server_addr: "proxy.internal:7443"
  transport: QUIC
  mode: single-use
  dial_timeout_ms: 1500
  queue_capacity: 0
  quic:
    server_name: tunnel.example
    insecure_skip_verify: true
"#;

        std::fs::write(&cfg_path, yaml).expect("write");
        let cfg = load_config(&cfg_path).expect("load_config");
        assert_eq!(cfg.metrics_addr, "127.0.0.1:9100");
        assert_eq!(cfg.logging.level, "debug");
        assert_eq!(cfg.tunnel.transport, "quic");
        assert_eq!(cfg.tunnel.mode, TunnelMode::SingleUse);
        assert_eq!(cfg.tunnel.dial_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.tunnel.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert_eq!(cfg.tunnel.quic.server_name, "tunnel.example");
        assert!(cfg.forwards.is_empty());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn reject_unknown_fields_and_unsupported_protocols() {
        let dir = temp_dir("reject");
        let cfg_path = dir.join("konnect.toml");

        std::fs::write(
            &cfg_path,
            "[tunnel]\nserver_addr = \"p:1\"\nauth_token = \"x\"\n",
        )
        .expect("write");
        let msg = format!("{:#}", load_config(&cfg_path).unwrap_err());
        assert!(msg.contains("auth_token"), "got: {msg}");

        std::fs::write(
            &cfg_path,
            r#"
[tunnel]
server_addr = "p:1"

[[forwards]]
listen_addr = ":53"
destination = "dns:53"
protocol = "udp"
"#,
        )
        .expect("write");
        let msg = load_config(&cfg_path).unwrap_err().to_string();
        assert!(msg.contains("forwards[0]"), "got: {msg}");

        std::fs::write(&cfg_path, "[tunnel]\nserver_addr = \"p:1\"\nmode = \"sometimes\"\n")
            .expect("write");
        assert!(load_config(&cfg_path).is_err());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn verified_quic_needs_a_ca_file() {
        let dir = temp_dir("quic_ca");
        let cfg_path = dir.join("konnect.toml");

        std::fs::write(
            &cfg_path,
            "[tunnel]\nserver_addr = \"p:1\"\ntransport = \"quic\"\n",
        )
        .expect("write");
        let msg = load_config(&cfg_path).unwrap_err().to_string();
        assert!(msg.contains("ca_file"), "got: {msg}");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn explicit_directory_discovers_config() {
        let dir = temp_dir("discover");
        std::fs::write(dir.join("konnect.yml"), "").expect("write");
        assert_eq!(normalize_explicit_path(&dir).unwrap(), dir.join("konnect.yml"));

        let missing = dir.join("nested").join("client");
        assert_eq!(
            normalize_explicit_path(&missing).unwrap(),
            dir.join("nested").join("client.toml")
        );

        let _ = std::fs::remove_dir_all(&dir);
    }
}
