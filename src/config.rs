//! Configuration loaded from environment variables
//!
//! All values are read and validated once at startup, before any worker
//! spawns. Validation failure is fatal: the process exits non-zero without
//! starting a single probe.

use std::net::IpAddr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::backoff::BackoffPolicy;

const MIN_COLLECTION_INTERVAL: u64 = 30;
const MAX_COLLECTION_INTERVAL: u64 = 3600;

/// Immutable process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Email server IP, target of ping and port probes
    pub server_ip: IpAddr,
    /// Email server hostname, target of TLS and SMTP probes
    pub server_hostname: String,
    /// Domain whose MX records are checked
    pub mx_domain: String,
    /// IP every MX target is expected to resolve to
    pub expected_ip: IpAddr,

    pub http_port: u16,
    pub https_port: u16,
    /// Plain SMTP port (25)
    pub mail_port: u16,
    /// Submission port (587), upgraded via STARTTLS
    pub smtp_port: u16,

    pub smtp_username: String,
    pub smtp_password: String,
    pub from_address: String,
    pub to_address: String,

    /// Base probe cadence; also the upper time bound of any single check
    pub collection_interval: Duration,
    pub metrics_port: u16,

    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout: Duration,

    pub backoff_base_interval: Duration,
    pub backoff_max_interval: Duration,
    pub backoff_multiplier: f64,
    pub backoff_max_failures: u32,

    pub error_categorization: bool,
    pub enhanced_logging: bool,

    pub memory_warning_mb: u64,
    pub thread_warning_count: u64,
    pub resource_check_enabled: bool,
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> anyhow::Result<Config> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Tests feed a map here instead of
    /// mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Config> {
        let collection_secs: u64 =
            parse_or_default(&lookup, "PROBE_COLLECTION_INTERVAL", 300)?;
        if !(MIN_COLLECTION_INTERVAL..=MAX_COLLECTION_INTERVAL).contains(&collection_secs) {
            bail!(
                "PROBE_COLLECTION_INTERVAL must be between {MIN_COLLECTION_INTERVAL} and \
                 {MAX_COLLECTION_INTERVAL} seconds, got {collection_secs}"
            );
        }
        let collection_interval = Duration::from_secs(collection_secs);

        let backoff_base_secs: u64 =
            parse_or_default(&lookup, "BACKOFF_BASE_INTERVAL", collection_secs)?;

        Ok(Config {
            server_ip: parse_ip(&lookup, "EMAIL_SERVER_IP")?,
            server_hostname: required(&lookup, "EMAIL_SERVER_HOSTNAME")?,
            mx_domain: required(&lookup, "EMAIL_MX_DOMAIN")?,
            expected_ip: parse_ip(&lookup, "EXPECTED_IP")?,

            http_port: parse_port(&lookup, "EMAIL_SERVER_HTTP_PORT", 80)?,
            https_port: parse_port(&lookup, "EMAIL_SERVER_HTTPS_PORT", 443)?,
            mail_port: parse_port(&lookup, "EMAIL_SERVER_SMTP_PORT", 25)?,
            smtp_port: parse_port(&lookup, "EMAIL_SERVER_SMTP_SECURE_PORT", 587)?,

            smtp_username: required(&lookup, "EMAIL_SMTP_USERNAME")?,
            smtp_password: required(&lookup, "EMAIL_SMTP_PASSWORD")?,
            from_address: lookup("FROM_ADDRESS")
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| "test@example.com".to_string()),
            to_address: lookup("TO_ADDRESS")
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|| "test@example.com".to_string()),

            collection_interval,
            metrics_port: parse_port(&lookup, "METRICS_EXPORT_PORT", 9101)?,

            breaker_failure_threshold: parse_or_default(
                &lookup,
                "CIRCUIT_BREAKER_FAILURE_THRESHOLD",
                5,
            )?,
            breaker_recovery_timeout: Duration::from_secs(parse_or_default(
                &lookup,
                "CIRCUIT_BREAKER_RECOVERY_TIMEOUT",
                60,
            )?),

            backoff_base_interval: Duration::from_secs(backoff_base_secs),
            backoff_max_interval: Duration::from_secs(parse_or_default(
                &lookup,
                "BACKOFF_MAX_INTERVAL",
                3600,
            )?),
            backoff_multiplier: parse_or_default(&lookup, "BACKOFF_MULTIPLIER", 2.0)?,
            backoff_max_failures: parse_or_default(&lookup, "BACKOFF_MAX_FAILURES", 5)?,

            error_categorization: parse_bool(&lookup, "ENABLE_ERROR_CATEGORIZATION", true)?,
            enhanced_logging: parse_bool(&lookup, "ENABLE_ENHANCED_LOGGING", false)?,

            memory_warning_mb: parse_or_default(&lookup, "RESOURCE_MEMORY_WARNING_MB", 512)?,
            thread_warning_count: parse_or_default(
                &lookup,
                "RESOURCE_THREAD_WARNING_COUNT",
                256,
            )?,
            resource_check_enabled: parse_bool(&lookup, "RESOURCE_CHECK_ENABLED", true)?,
        })
    }

    /// Upper time bound for a single probe check.
    pub fn check_timeout(&self) -> Duration {
        self.collection_interval
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            self.backoff_base_interval,
            self.backoff_multiplier,
            self.backoff_max_interval,
            self.backoff_max_failures,
        )
    }
}

fn required(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<String> {
    let value = lookup(key).with_context(|| format!("{key} must be set"))?;
    let value = value.trim();
    if value.is_empty() {
        bail!("{key} must not be empty");
    }
    Ok(value.to_string())
}

fn parse_ip(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<IpAddr> {
    required(lookup, key)?
        .parse()
        .with_context(|| format!("{key} must be a valid IPv4 or IPv6 address"))
}

fn parse_or_default<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has invalid value {raw:?}")),
        None => Ok(default),
    }
}

fn parse_port(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u16,
) -> anyhow::Result<u16> {
    let port: u16 = parse_or_default(lookup, key, default)?;
    if port == 0 {
        bail!("{key} must be between 1 and 65535");
    }
    Ok(port)
}

fn parse_bool(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match lookup(key) {
        None => Ok(default),
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => bail!("{key} has invalid boolean value {raw:?}"),
        },
    }
}
