//! Probe implementations
//!
//! Each probe is a short-lived, self-contained check of one facet of the
//! mail server: DNS records, raw reachability, TLS certificates, or the
//! SMTP conversation itself. Probes know nothing about scheduling,
//! breakers, or metrics; they either return `Ok(())` or raise a
//! [`ProbeError`] describing the failing layer.
//!
//! ## Probe families
//!
//! - **dns** — MX record presence and MX-target address validation
//! - **connectivity** — ICMP ping and TCP port reachability
//! - **tls** — certificate validation over implicit TLS and STARTTLS
//! - **smtp** — full protocol conversations, authenticated and not
//!
//! Every network operation inside a check carries its own time bound; the
//! kernel additionally enforces the configured upper bound around the
//! whole check.

pub mod connectivity;
pub mod dns;
pub mod error;
pub mod smtp;
pub mod tls;

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;

pub use error::{classify, ErrorCategory, ProbeError, ProbeResult};

use crate::config::Config;

/// A single health check with a stable name.
///
/// Implementations must be `Send + Sync` as each is owned by a kernel task
/// and invoked serially from it.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Stable probe name used as the `probe` metric label
    fn name(&self) -> &str;

    /// Run the check once. Succeeds or fails with a cause.
    async fn check(&self) -> ProbeResult<()>;
}

/// Construct the full probe set for one target server.
///
/// The order here is the registration order; it only affects log and
/// exposition ordering, never scheduling.
pub fn build_probes(config: &Config) -> anyhow::Result<Vec<Box<dyn Probe>>> {
    let resolver = Arc::new(
        TokioAsyncResolver::tokio_from_system_conf()
            .context("failed to initialize DNS resolver from system configuration")?,
    );
    let tls = tls::TlsProbeConfig::new().context("failed to build TLS client configuration")?;
    let timeout = config.check_timeout();

    Ok(vec![
        Box::new(dns::MxDomainProbe::new(
            resolver.clone(),
            config.mx_domain.clone(),
        )),
        Box::new(dns::MxIpProbe::new(
            resolver,
            config.mx_domain.clone(),
            config.expected_ip,
        )),
        Box::new(connectivity::PingProbe::new(config.server_ip, timeout)),
        Box::new(connectivity::PortProbe::new(
            "http_port",
            config.server_ip,
            config.http_port,
            timeout,
        )),
        Box::new(connectivity::PortProbe::new(
            "https_port",
            config.server_ip,
            config.https_port,
            timeout,
        )),
        Box::new(connectivity::PortProbe::new(
            "mail_port",
            config.server_ip,
            config.mail_port,
            timeout,
        )),
        Box::new(connectivity::PortProbe::new(
            "smtp_port",
            config.server_ip,
            config.smtp_port,
            timeout,
        )),
        Box::new(tls::HttpsCertificateProbe::new(
            tls.clone(),
            config.server_hostname.clone(),
            config.https_port,
            timeout,
        )),
        Box::new(tls::SmtpCertificateProbe::new(
            tls.clone(),
            config.server_hostname.clone(),
            config.smtp_port,
            config.smtp_port,
            timeout,
        )),
        Box::new(smtp::AuthenticatedSmtpProbe::new(
            tls.clone(),
            config.server_hostname.clone(),
            config.smtp_port,
            config.smtp_username.clone(),
            config.smtp_password.clone(),
            timeout,
        )),
        Box::new(smtp::UnauthenticatedSmtpProbe::new(
            "smtp_unauthenticated",
            tls.clone(),
            config.server_hostname.clone(),
            config.mail_port,
            false,
            config.from_address.clone(),
            config.to_address.clone(),
            timeout,
        )),
        Box::new(smtp::UnauthenticatedSmtpProbe::new(
            "smtp_unauthenticated_submission",
            tls,
            config.server_hostname.clone(),
            config.smtp_port,
            true,
            config.from_address.clone(),
            config.to_address.clone(),
            timeout,
        )),
    ])
}
