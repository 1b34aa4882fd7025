//! SMTP conversation probes and the line-oriented client they share
//!
//! The client speaks just enough SMTP for probing: greeting, EHLO with
//! capability parsing, STARTTLS upgrade, AUTH PLAIN, and envelope
//! commands. It runs synchronously over a `std` TCP stream (plain or
//! wrapped in `rustls`) with socket timeouts bounding every read and
//! write; probes drive it from `spawn_blocking`.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rustls::{ClientConnection, StreamOwned};
use tracing::{debug, warn};

use super::tls::{self, TlsProbeConfig};
use super::{Probe, ProbeError, ProbeResult};

/// Name announced in EHLO
const EHLO_NAME: &str = "mailprobe.invalid";

/// Transport under the SMTP session: plaintext, or TLS after STARTTLS.
enum SmtpStream {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Read for SmtpStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            SmtpStream::Plain(stream) => stream.read(buf),
            SmtpStream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for SmtpStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            SmtpStream::Plain(stream) => stream.write(buf),
            SmtpStream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            SmtpStream::Plain(stream) => stream.flush(),
            SmtpStream::Tls(stream) => stream.flush(),
        }
    }
}

/// One (possibly multiline) SMTP reply
#[derive(Debug, Clone)]
pub struct SmtpReply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl SmtpReply {
    pub fn is_positive(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }

    /// Whether an EHLO response advertises the given extension.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.lines.iter().skip(1).any(|line| {
            line.get(4..)
                .and_then(|rest| rest.split_whitespace().next())
                .is_some_and(|token| token.eq_ignore_ascii_case(capability))
        })
    }
}

impl std::fmt::Display for SmtpReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.lines.first().map_or("", |l| l.as_str()))
    }
}

/// Parse one reply from a buffered reader, consuming continuation lines.
fn read_reply_from<R: BufRead>(reader: &mut R) -> ProbeResult<SmtpReply> {
    let mut lines = Vec::new();

    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).map_err(tls::map_tls_io_error)?;
        if n == 0 {
            return Err(ProbeError::Network(
                "server closed the connection".to_string(),
            ));
        }

        let line = line.trim_end().to_string();
        if line.len() < 3 {
            return Err(ProbeError::Network(format!("malformed reply {line:?}")));
        }

        let code: u16 = line[..3]
            .parse()
            .map_err(|_| ProbeError::Network(format!("malformed reply code in {line:?}")))?;
        let more = line.as_bytes().get(3) == Some(&b'-');

        lines.push(line);
        if !more {
            return Ok(SmtpReply { code, lines });
        }
    }
}

/// Minimal SMTP client for probing
pub struct SmtpClient {
    reader: BufReader<SmtpStream>,
    server: String,
}

impl SmtpClient {
    /// Connect and consume the greeting.
    pub fn connect(hostname: &str, port: u16, timeout: Duration) -> ProbeResult<Self> {
        let sock = tls::connect_tcp(hostname, port, timeout)?;
        let mut client = Self {
            reader: BufReader::new(SmtpStream::Plain(sock)),
            server: format!("{hostname}:{port}"),
        };

        let greeting = client.read_reply()?;
        if greeting.code != 220 {
            return Err(ProbeError::Network(format!(
                "unexpected greeting from {}: {greeting}",
                client.server
            )));
        }

        Ok(client)
    }

    fn read_reply(&mut self) -> ProbeResult<SmtpReply> {
        read_reply_from(&mut self.reader)
    }

    /// Send one command line and read the reply.
    pub fn command(&mut self, line: &str) -> ProbeResult<SmtpReply> {
        let stream = self.reader.get_mut();
        stream
            .write_all(line.as_bytes())
            .and_then(|_| stream.write_all(b"\r\n"))
            .and_then(|_| stream.flush())
            .map_err(tls::map_tls_io_error)?;

        self.read_reply()
    }

    pub fn ehlo(&mut self) -> ProbeResult<SmtpReply> {
        let reply = self.command(&format!("EHLO {EHLO_NAME}"))?;
        if !reply.is_positive() {
            return Err(ProbeError::Network(format!(
                "EHLO rejected by {}: {reply}",
                self.server
            )));
        }
        Ok(reply)
    }

    /// Upgrade the session to TLS. A refusal or a failed handshake is a
    /// certificate-layer failure.
    pub fn starttls(
        mut self,
        config: Arc<rustls::ClientConfig>,
        hostname: &str,
    ) -> ProbeResult<Self> {
        let reply = self.command("STARTTLS")?;
        if reply.code != 220 {
            return Err(ProbeError::Cert(format!(
                "STARTTLS refused by {}: {reply}",
                self.server
            )));
        }

        let server = self.server;
        let sock = match self.reader.into_inner() {
            SmtpStream::Plain(sock) => sock,
            SmtpStream::Tls(_) => {
                return Err(ProbeError::Other("session is already TLS".to_string()))
            }
        };

        let stream = tls::handshake(config, hostname, sock)?;
        Ok(Self {
            reader: BufReader::new(SmtpStream::Tls(Box::new(stream))),
            server,
        })
    }

    /// AUTH PLAIN with the configured credentials.
    pub fn auth_plain(&mut self, username: &str, password: &str) -> ProbeResult<()> {
        let token = BASE64.encode(format!("\0{username}\0{password}"));
        let reply = self.command(&format!("AUTH PLAIN {token}"))?;

        match reply.code {
            235 => Ok(()),
            500..=599 => Err(ProbeError::Auth(format!(
                "authentication rejected by {}: {reply}",
                self.server
            ))),
            _ => Err(ProbeError::Network(format!(
                "unexpected AUTH response from {}: {reply}",
                self.server
            ))),
        }
    }

    pub fn mail_from(&mut self, address: &str) -> ProbeResult<()> {
        let reply = self.command(&format!("MAIL FROM:<{address}>"))?;
        Self::expect_envelope_accepted("MAIL FROM", &self.server, reply)
    }

    pub fn rcpt_to(&mut self, address: &str) -> ProbeResult<()> {
        let reply = self.command(&format!("RCPT TO:<{address}>"))?;
        Self::expect_envelope_accepted("RCPT TO", &self.server, reply)
    }

    /// Permanent rejection of the envelope is a predicate failure;
    /// transient rejection is a server-side problem.
    fn expect_envelope_accepted(
        command: &str,
        server: &str,
        reply: SmtpReply,
    ) -> ProbeResult<()> {
        if reply.is_positive() {
            return Ok(());
        }
        if reply.is_transient() {
            return Err(ProbeError::Network(format!(
                "{command} deferred by {server}: {reply}"
            )));
        }
        Err(ProbeError::CheckFailed(format!(
            "{command} rejected by {server}: {reply}"
        )))
    }

    pub fn rset(&mut self) -> ProbeResult<()> {
        let reply = self.command("RSET")?;
        if !reply.is_positive() {
            return Err(ProbeError::Network(format!(
                "RSET rejected by {}: {reply}",
                self.server
            )));
        }
        Ok(())
    }

    /// Best-effort QUIT; callers typically ignore the result.
    pub fn quit(&mut self) -> ProbeResult<()> {
        self.command("QUIT").map(drop)
    }
}

/// Full authenticated session: EHLO, STARTTLS, EHLO, AUTH, QUIT.
pub struct AuthenticatedSmtpProbe {
    tls: TlsProbeConfig,
    hostname: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl AuthenticatedSmtpProbe {
    pub fn new(
        tls: TlsProbeConfig,
        hostname: String,
        port: u16,
        username: String,
        password: String,
        timeout: Duration,
    ) -> Self {
        Self {
            tls,
            hostname,
            port,
            username,
            password,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for AuthenticatedSmtpProbe {
    fn name(&self) -> &str {
        "smtp_authenticated"
    }

    async fn check(&self) -> ProbeResult<()> {
        let tls = self.tls.clone();
        let hostname = self.hostname.clone();
        let port = self.port;
        let username = self.username.clone();
        let password = self.password.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let mut client = SmtpClient::connect(&hostname, port, timeout)?;

            let reply = client.ehlo()?;
            if !reply.has_capability("STARTTLS") {
                return Err(ProbeError::CheckFailed(format!(
                    "{hostname}:{port} does not advertise STARTTLS"
                )));
            }

            let mut client = client.starttls(tls.preferred(), &hostname)?;
            client.ehlo()?;
            client.auth_plain(&username, &password)?;
            let _ = client.quit();
            Ok(())
        })
        .await
        .map_err(|err| ProbeError::Other(format!("smtp task failed: {err}")))??;

        debug!(host = %self.hostname, port = self.port, "authenticated session succeeded");
        Ok(())
    }
}

/// Unauthenticated envelope test: EHLO, optional STARTTLS, MAIL, RCPT,
/// RSET, QUIT. On the plain SMTP port a refused upgrade is tolerated; on
/// the submission port it fails the probe.
pub struct UnauthenticatedSmtpProbe {
    name: &'static str,
    tls: TlsProbeConfig,
    hostname: String,
    port: u16,
    is_submission: bool,
    from_address: String,
    to_address: String,
    timeout: Duration,
}

impl UnauthenticatedSmtpProbe {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &'static str,
        tls: TlsProbeConfig,
        hostname: String,
        port: u16,
        is_submission: bool,
        from_address: String,
        to_address: String,
        timeout: Duration,
    ) -> Self {
        Self {
            name,
            tls,
            hostname,
            port,
            is_submission,
            from_address,
            to_address,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for UnauthenticatedSmtpProbe {
    fn name(&self) -> &str {
        self.name
    }

    async fn check(&self) -> ProbeResult<()> {
        let tls = self.tls.clone();
        let hostname = self.hostname.clone();
        let port = self.port;
        let is_submission = self.is_submission;
        let from_address = self.from_address.clone();
        let to_address = self.to_address.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let mut client = SmtpClient::connect(&hostname, port, timeout)?;

            let reply = client.ehlo()?;
            if reply.has_capability("STARTTLS") {
                let upgrade = client.command("STARTTLS")?;
                if upgrade.code == 220 {
                    let sock = match client.reader.into_inner() {
                        SmtpStream::Plain(sock) => sock,
                        SmtpStream::Tls(_) => {
                            return Err(ProbeError::Other("session is already TLS".to_string()))
                        }
                    };
                    let stream = tls::handshake(tls.preferred(), &hostname, sock)?;
                    client = SmtpClient {
                        reader: BufReader::new(SmtpStream::Tls(Box::new(stream))),
                        server: format!("{hostname}:{port}"),
                    };
                    client.ehlo()?;
                } else if is_submission {
                    return Err(ProbeError::Cert(format!(
                        "STARTTLS refused by {hostname}:{port}: {upgrade}"
                    )));
                } else {
                    warn!(host = %hostname, port, "STARTTLS refused, continuing in the clear");
                }
            }

            client.mail_from(&from_address)?;
            client.rcpt_to(&to_address)?;
            client.rset()?;
            let _ = client.quit();
            Ok(())
        })
        .await
        .map_err(|err| ProbeError::Other(format!("smtp task failed: {err}")))??;

        debug!(host = %self.hostname, port = self.port, probe = self.name, "envelope accepted");
        Ok(())
    }
}
