//! Reachability probes: ICMP ping and TCP port checks

use std::net::{IpAddr, SocketAddr};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::debug;

use super::{Probe, ProbeError, ProbeResult};

/// Cap on the TCP connect phase; the check's own bound still applies
const CONNECT_TIMEOUT_CAP: Duration = Duration::from_secs(10);

/// One-shot ICMP echo capability.
///
/// The default implementation shells out to the OS ping tool; alternate
/// implementations (raw ICMP sockets where permitted) can be swapped in.
#[async_trait]
pub trait IcmpPinger: Send + Sync {
    async fn icmp_once(&self, host: IpAddr, deadline: Duration) -> ProbeResult<()>;
}

/// ICMP echo via the host OS's ping tool
pub struct SystemPing;

#[async_trait]
impl IcmpPinger for SystemPing {
    async fn icmp_once(&self, host: IpAddr, deadline: Duration) -> ProbeResult<()> {
        let mut command = Command::new("ping");

        // One-shot count and per-reply wait flags differ per platform
        if cfg!(target_os = "windows") {
            command.args(["-n", "1", "-w", "1000"]);
        } else {
            command.args(["-c", "1", "-W", "1"]);
        }

        command
            .arg(host.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let status = tokio::time::timeout(deadline, async {
            command
                .status()
                .await
                .map_err(|err| ProbeError::Other(format!("failed to run ping: {err}")))
        })
        .await
        .map_err(|_| ProbeError::Timeout(format!("ping {host} exceeded deadline")))??;

        if status.success() {
            Ok(())
        } else {
            Err(ProbeError::Network(format!(
                "ping {host} exited with {status}"
            )))
        }
    }
}

/// Probe that checks the server answers a single ICMP echo.
pub struct PingProbe {
    pinger: Box<dyn IcmpPinger>,
    server_ip: IpAddr,
    timeout: Duration,
}

impl PingProbe {
    pub fn new(server_ip: IpAddr, timeout: Duration) -> Self {
        Self::with_pinger(Box::new(SystemPing), server_ip, timeout)
    }

    pub fn with_pinger(pinger: Box<dyn IcmpPinger>, server_ip: IpAddr, timeout: Duration) -> Self {
        Self {
            pinger,
            server_ip,
            timeout,
        }
    }
}

#[async_trait]
impl Probe for PingProbe {
    fn name(&self) -> &str {
        "ip_ping"
    }

    async fn check(&self) -> ProbeResult<()> {
        self.pinger.icmp_once(self.server_ip, self.timeout).await?;
        debug!(ip = %self.server_ip, "ping succeeded");
        Ok(())
    }
}

/// Probe that checks a TCP connection to one port establishes.
pub struct PortProbe {
    name: &'static str,
    addr: SocketAddr,
    timeout: Duration,
}

impl PortProbe {
    pub fn new(name: &'static str, server_ip: IpAddr, port: u16, timeout: Duration) -> Self {
        Self {
            name,
            addr: SocketAddr::new(server_ip, port),
            timeout: timeout.min(CONNECT_TIMEOUT_CAP),
        }
    }
}

#[async_trait]
impl Probe for PortProbe {
    fn name(&self) -> &str {
        self.name
    }

    async fn check(&self) -> ProbeResult<()> {
        let stream = tokio::time::timeout(self.timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| ProbeError::Timeout(format!("connecting to {}", self.addr)))?
            .map_err(ProbeError::from)?;

        drop(stream);
        debug!(addr = %self.addr, probe = self.name, "port is accepting connections");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    struct ScriptedPinger(ProbeResult<()>);

    #[async_trait]
    impl IcmpPinger for ScriptedPinger {
        async fn icmp_once(&self, _host: IpAddr, _deadline: Duration) -> ProbeResult<()> {
            match &self.0 {
                Ok(()) => Ok(()),
                Err(ProbeError::Network(msg)) => Err(ProbeError::Network(msg.clone())),
                Err(other) => Err(ProbeError::Other(other.to_string())),
            }
        }
    }

    #[tokio::test]
    async fn port_probe_succeeds_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let probe = PortProbe::new("mail_port", addr.ip(), addr.port(), Duration::from_secs(5));
        assert!(probe.check().await.is_ok());
    }

    #[tokio::test]
    async fn port_probe_refused_is_network_error() {
        // Bind then drop to obtain a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = PortProbe::new("http_port", addr.ip(), addr.port(), Duration::from_secs(5));
        let err = probe.check().await.unwrap_err();
        assert!(
            matches!(err, ProbeError::Network(_) | ProbeError::Timeout(_)),
            "got {err}"
        );
    }

    #[tokio::test]
    async fn ping_probe_reports_capability_outcome() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();

        let probe =
            PingProbe::with_pinger(Box::new(ScriptedPinger(Ok(()))), ip, Duration::from_secs(1));
        assert!(probe.check().await.is_ok());

        let probe = PingProbe::with_pinger(
            Box::new(ScriptedPinger(Err(ProbeError::Network("unreachable".into())))),
            ip,
            Duration::from_secs(1),
        );
        assert!(matches!(
            probe.check().await.unwrap_err(),
            ProbeError::Network(_)
        ));
    }
}
