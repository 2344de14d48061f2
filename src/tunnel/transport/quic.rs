use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, TransportConfig};

use crate::tunnel::{
    protocol::{Frame, ProtocolError},
    transport::{
        default_alpn, FrameChannel, FrameSink, QuicDialOptions, StreamSink, StreamSource, Transport,
        TransportDialOptions,
    },
};

/// Carries the frame channel on a single bidirectional QUIC stream.
pub struct QuicTransport;

impl QuicTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for QuicTransport {
    fn name(&self) -> &'static str {
        "quic"
    }

    async fn dial(&self, addr: &str, opts: TransportDialOptions) -> anyhow::Result<FrameChannel> {
        let QuicDialOptions {
            server_name,
            insecure_skip_verify,
            ca_file,
            next_protos,
        } = opts.quic;
        let next_protos = default_alpn(&next_protos);

        let mut transport_cfg = TransportConfig::default();
        transport_cfg.max_idle_timeout(Some(Duration::from_secs(60).try_into()?));
        transport_cfg.keep_alive_interval(Some(Duration::from_secs(20)));

        let client_crypto = quic_tls::client_crypto_config(insecure_skip_verify, &ca_file, next_protos)?;
        let mut client_cfg = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)?,
        ));
        client_cfg.transport_config(Arc::new(transport_cfg));

        let remote = resolve_socket_addr(addr).await?;
        let bind: SocketAddr = if remote.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = Endpoint::client(bind)?;
        endpoint.set_default_client_config(client_cfg);

        let name = if server_name.trim().is_empty() {
            host_of(addr).to_string()
        } else {
            server_name
        };

        let conn = endpoint.connect(remote, &name)?.await?;
        let (send, recv) = conn.open_bi().await?;
        tracing::debug!(remote = %conn.remote_address(), server_name = %name, "tunnel: quic transport connected");

        Ok(FrameChannel::new(
            Box::new(QuicSink {
                inner: StreamSink::new(send),
                conn,
            }),
            Box::new(StreamSource::new(recv)),
        ))
    }
}

struct QuicSink {
    inner: StreamSink<quinn::SendStream>,
    conn: quinn::Connection,
}

#[async_trait]
impl FrameSink for QuicSink {
    async fn send(&mut self, frame: Frame) -> Result<(), ProtocolError> {
        self.inner.send(frame).await
    }

    async fn close(&mut self) {
        self.inner.close().await;
        self.conn.close(0u32.into(), b"");
    }
}

async fn resolve_socket_addr(addr: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(sa) = addr.parse::<SocketAddr>() {
        return Ok(sa);
    }
    let mut it = tokio::net::lookup_host(addr).await?;
    it.next()
        .ok_or_else(|| anyhow::anyhow!("tunnel: could not resolve {addr:?}"))
}

fn host_of(addr: &str) -> &str {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() { "localhost" } else { host }
}

mod quic_tls {
    use std::{fs, path::Path, sync::Arc};

    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        crypto::CryptoProvider,
        pki_types::{CertificateDer, ServerName, UnixTime},
    };

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(rustls::crypto::ring::default_provider())
    }

    pub fn client_crypto_config(
        insecure_skip_verify: bool,
        ca_file: &str,
        next_protos: Vec<Vec<u8>>,
    ) -> anyhow::Result<rustls::ClientConfig> {
        let builder = rustls::ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&rustls::version::TLS13])?;

        let mut cfg = if insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(SkipServerVerification::new())
                .with_no_client_auth()
        } else {
            let ca_file = ca_file.trim();
            if ca_file.is_empty() {
                anyhow::bail!("tunnel: quic requires ca_file unless insecure_skip_verify is set");
            }
            let mut roots = rustls::RootCertStore::empty();
            for cert in load_certs(Path::new(ca_file))? {
                roots.add(cert)?;
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        cfg.alpn_protocols = next_protos;
        Ok(cfg)
    }

    fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let data = fs::read(path)?;
        let mut rd = std::io::Cursor::new(&data);
        let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
        if certs.is_empty() {
            anyhow::bail!("tunnel: no certificates found in {}", path.display());
        }
        Ok(certs)
    }

    /// Accepts any server certificate. Development only: open to MITM.
    #[derive(Debug)]
    struct SkipServerVerification(Arc<CryptoProvider>);

    impl SkipServerVerification {
        fn new() -> Arc<Self> {
            Arc::new(Self(provider()))
        }
    }

    impl ServerCertVerifier for SkipServerVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &rustls::DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &self.0.signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_name_defaults_to_dialed_host() {
        assert_eq!(host_of("proxy.internal:8443"), "proxy.internal");
        assert_eq!(host_of("[::1]:8443"), "::1");
        assert_eq!(host_of(":8443"), "localhost");
    }

    #[test]
    fn verified_quic_requires_a_ca_bundle() {
        let err = quic_tls::client_crypto_config(false, "  ", vec![]).unwrap_err();
        assert!(err.to_string().contains("ca_file"));
        assert!(quic_tls::client_crypto_config(true, "", vec![b"x".to_vec()]).is_ok());
    }
}
