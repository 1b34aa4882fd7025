//! TLS certificate probes
//!
//! Certificate validity is established by completing a `rustls` handshake:
//! the chain is verified against the bundled web trust anchors and the
//! peer name against the configured hostname, so a completed handshake is
//! the success condition. Protocol versions are tried in descending order;
//! versions older than TLS 1.2 are not supported by the stack and are
//! intentionally absent from the ladder.
//!
//! The handshake runs synchronously over a `std` TCP stream inside
//! `spawn_blocking`; socket timeouts bound every read and write.

use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConnection, StreamOwned};
use tracing::debug;

use super::smtp::SmtpClient;
use super::{Probe, ProbeError, ProbeResult};

const CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(10);
const IO_TIMEOUT_CAP: Duration = Duration::from_secs(30);

/// Shared TLS client configurations, one per rung of the version ladder.
#[derive(Clone)]
pub struct TlsProbeConfig {
    ladder: Vec<(&'static str, Arc<rustls::ClientConfig>)>,
}

impl TlsProbeConfig {
    pub fn new() -> Result<Self, rustls::Error> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let build = |versions: &[&'static rustls::SupportedProtocolVersion]| {
            rustls::ClientConfig::builder_with_provider(
                rustls::crypto::ring::default_provider().into(),
            )
            .with_protocol_versions(versions)
            .map(|b| {
                Arc::new(
                    b.with_root_certificates(roots.clone())
                        .with_no_client_auth(),
                )
            })
        };

        Ok(Self {
            ladder: vec![
                (
                    "tls1.3+1.2",
                    build(&[&rustls::version::TLS13, &rustls::version::TLS12])?,
                ),
                ("tls1.2", build(&[&rustls::version::TLS12])?),
            ],
        })
    }

    /// Version configurations in the order they should be attempted.
    pub(crate) fn ladder(&self) -> &[(&'static str, Arc<rustls::ClientConfig>)] {
        &self.ladder
    }

    /// The preferred (widest) configuration, for conversations that only
    /// need one upgrade attempt.
    pub(crate) fn preferred(&self) -> Arc<rustls::ClientConfig> {
        self.ladder[0].1.clone()
    }
}

/// Open a TCP connection to `hostname:port` with connect and I/O timeouts
/// applied. Resolution failure is a `dns` cause.
pub(crate) fn connect_tcp(hostname: &str, port: u16, timeout: Duration) -> ProbeResult<TcpStream> {
    let addrs = (hostname, port)
        .to_socket_addrs()
        .map_err(|err| ProbeError::Dns(format!("resolving {hostname}: {err}")))?;

    let connect_timeout = timeout.min(CONNECT_TIMEOUT_CAP);
    let io_timeout = timeout.min(IO_TIMEOUT_CAP);

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, connect_timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(io_timeout))?;
                stream.set_write_timeout(Some(io_timeout))?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }

    Err(last_err.map_or_else(
        || ProbeError::Dns(format!("{hostname} resolved to no addresses")),
        ProbeError::from,
    ))
}

/// Complete a TLS handshake over an established stream, verifying chain
/// and hostname.
pub(crate) fn handshake(
    config: Arc<rustls::ClientConfig>,
    hostname: &str,
    sock: TcpStream,
) -> ProbeResult<StreamOwned<ClientConnection, TcpStream>> {
    let server_name = ServerName::try_from(hostname.to_string())
        .map_err(|_| ProbeError::Cert(format!("{hostname} is not a valid server name")))?;

    let conn = ClientConnection::new(config, server_name)
        .map_err(|err| ProbeError::Cert(err.to_string()))?;

    let mut stream = StreamOwned::new(conn, sock);
    while stream.conn.is_handshaking() {
        stream
            .conn
            .complete_io(&mut stream.sock)
            .map_err(map_tls_io_error)?;
    }

    Ok(stream)
}

/// Distinguish TLS-layer rejections from transport failures.
pub(crate) fn map_tls_io_error(err: std::io::Error) -> ProbeError {
    match err.kind() {
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            return ProbeError::Timeout(err.to_string())
        }
        _ => {}
    }

    if let Some(inner) = err.get_ref() {
        if inner.downcast_ref::<rustls::Error>().is_some() {
            return ProbeError::Cert(inner.to_string());
        }
    }

    ProbeError::Network(err.to_string())
}

fn try_ladder<F>(tls: &TlsProbeConfig, mut attempt: F) -> ProbeResult<&'static str>
where
    F: FnMut(Arc<rustls::ClientConfig>) -> ProbeResult<()>,
{
    let mut last_cert_err = None;

    for (label, config) in tls.ladder() {
        match attempt(config.clone()) {
            Ok(()) => return Ok(*label),
            // A TLS-layer rejection may be version-specific; try the next
            // rung. Transport failures will not improve with another rung.
            Err(err @ ProbeError::Cert(_)) => last_cert_err = Some(err),
            Err(err) => return Err(err),
        }
    }

    Err(last_cert_err
        .unwrap_or_else(|| ProbeError::Cert("no TLS protocol version succeeded".to_string())))
}

/// Validates the HTTPS certificate via an implicit TLS handshake.
pub struct HttpsCertificateProbe {
    tls: TlsProbeConfig,
    hostname: String,
    port: u16,
    timeout: Duration,
}

impl HttpsCertificateProbe {
    pub fn new(tls: TlsProbeConfig, hostname: String, port: u16, timeout: Duration) -> Self {
        Self {
            tls,
            hostname,
            port,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for HttpsCertificateProbe {
    fn name(&self) -> &str {
        "https_certificate"
    }

    async fn check(&self) -> ProbeResult<()> {
        let tls = self.tls.clone();
        let hostname = self.hostname.clone();
        let port = self.port;
        let timeout = self.timeout;

        let version = tokio::task::spawn_blocking(move || {
            try_ladder(&tls, |config| {
                let sock = connect_tcp(&hostname, port, timeout)?;
                handshake(config, &hostname, sock).map(drop)
            })
        })
        .await
        .map_err(|err| ProbeError::Other(format!("handshake task failed: {err}")))??;

        debug!(host = %self.hostname, port = self.port, version, "certificate valid");
        Ok(())
    }
}

/// Validates the SMTP certificate, upgrading via STARTTLS on the
/// submission port and using implicit TLS elsewhere.
pub struct SmtpCertificateProbe {
    tls: TlsProbeConfig,
    hostname: String,
    port: u16,
    submission_port: u16,
    timeout: Duration,
}

impl SmtpCertificateProbe {
    pub fn new(
        tls: TlsProbeConfig,
        hostname: String,
        port: u16,
        submission_port: u16,
        timeout: Duration,
    ) -> Self {
        Self {
            tls,
            hostname,
            port,
            submission_port,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for SmtpCertificateProbe {
    fn name(&self) -> &str {
        "smtp_certificate"
    }

    async fn check(&self) -> ProbeResult<()> {
        let tls = self.tls.clone();
        let hostname = self.hostname.clone();
        let port = self.port;
        let starttls = self.port == self.submission_port;
        let timeout = self.timeout;

        let version = tokio::task::spawn_blocking(move || {
            try_ladder(&tls, |config| {
                if starttls {
                    let mut client = SmtpClient::connect(&hostname, port, timeout)?;
                    client.ehlo()?;
                    let mut client = client.starttls(config, &hostname)?;
                    let _ = client.quit();
                    Ok(())
                } else {
                    let sock = connect_tcp(&hostname, port, timeout)?;
                    handshake(config, &hostname, sock).map(drop)
                }
            })
        })
        .await
        .map_err(|err| ProbeError::Other(format!("handshake task failed: {err}")))??;

        debug!(host = %self.hostname, port = self.port, version, starttls = self.port == self.submission_port, "certificate valid");
        Ok(())
    }
}
