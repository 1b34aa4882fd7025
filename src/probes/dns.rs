//! DNS probes for MX record presence and MX-target addresses

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use tracing::debug;

use super::{Probe, ProbeError, ProbeResult};

/// Checks that the configured domain publishes at least one MX record.
pub struct MxDomainProbe {
    resolver: Arc<TokioAsyncResolver>,
    domain: String,
}

impl MxDomainProbe {
    pub fn new(resolver: Arc<TokioAsyncResolver>, domain: String) -> Self {
        Self { resolver, domain }
    }
}

#[async_trait]
impl Probe for MxDomainProbe {
    fn name(&self) -> &str {
        "dns_mx_domain"
    }

    async fn check(&self) -> ProbeResult<()> {
        let lookup = self
            .resolver
            .mx_lookup(self.domain.as_str())
            .await
            .map_err(|err| map_mx_error(&self.domain, err))?;

        let count = lookup.iter().count();
        if count == 0 {
            return Err(ProbeError::CheckFailed(format!(
                "no MX records found for {}",
                self.domain
            )));
        }

        debug!(domain = %self.domain, count, "MX records present");
        Ok(())
    }
}

/// Checks that every MX target of the domain resolves to exactly the
/// expected IP.
pub struct MxIpProbe {
    resolver: Arc<TokioAsyncResolver>,
    domain: String,
    expected_ip: IpAddr,
}

impl MxIpProbe {
    pub fn new(resolver: Arc<TokioAsyncResolver>, domain: String, expected_ip: IpAddr) -> Self {
        Self {
            resolver,
            domain,
            expected_ip,
        }
    }
}

#[async_trait]
impl Probe for MxIpProbe {
    fn name(&self) -> &str {
        "dns_mx_ip"
    }

    async fn check(&self) -> ProbeResult<()> {
        let lookup = self
            .resolver
            .mx_lookup(self.domain.as_str())
            .await
            .map_err(|err| map_mx_error(&self.domain, err))?;

        let targets: Vec<String> = lookup
            .iter()
            .map(|mx| mx.exchange().to_utf8().trim_end_matches('.').to_string())
            .collect();

        if targets.is_empty() {
            return Err(ProbeError::CheckFailed(format!(
                "no MX records found for {}",
                self.domain
            )));
        }

        let mut resolutions = Vec::with_capacity(targets.len());
        for target in &targets {
            match self.resolver.lookup_ip(target.as_str()).await {
                Ok(lookup) => {
                    let ips: Vec<IpAddr> = lookup.iter().collect();
                    if ips.is_empty() {
                        resolutions.push(TargetResolution::Missing(target.clone()));
                    } else {
                        resolutions.push(TargetResolution::Resolved(target.clone(), ips));
                    }
                }
                Err(err) => match err.kind() {
                    ResolveErrorKind::Timeout => {
                        return Err(ProbeError::Timeout(format!(
                            "resolving A records for MX target {target}"
                        )))
                    }
                    _ => resolutions.push(TargetResolution::Missing(target.clone())),
                },
            }
        }

        evaluate_targets(&self.domain, &resolutions, self.expected_ip)
    }
}

enum TargetResolution {
    Resolved(String, Vec<IpAddr>),
    Missing(String),
}

/// Decide the probe outcome from the per-target resolutions.
///
/// All targets missing address records is a resolution problem (`dns`);
/// any target resolving to something other than the expected IP is a
/// predicate failure (`check_failed`).
fn evaluate_targets(
    domain: &str,
    resolutions: &[TargetResolution],
    expected_ip: IpAddr,
) -> ProbeResult<()> {
    let mut missing = Vec::new();
    let mut mismatched = Vec::new();

    for resolution in resolutions {
        match resolution {
            TargetResolution::Missing(host) => missing.push(host.as_str()),
            TargetResolution::Resolved(host, ips) => {
                if ips.iter().any(|ip| *ip != expected_ip) {
                    mismatched.push(format!("{host} -> {ips:?}"));
                }
            }
        }
    }

    if missing.len() == resolutions.len() {
        return Err(ProbeError::Dns(format!(
            "no MX target of {domain} has address records: {missing:?}"
        )));
    }

    if !mismatched.is_empty() || !missing.is_empty() {
        return Err(ProbeError::CheckFailed(format!(
            "MX targets of {domain} do not all resolve to {expected_ip}: \
             mismatched {mismatched:?}, missing {missing:?}"
        )));
    }

    debug!(%domain, %expected_ip, "all MX targets resolve to expected IP");
    Ok(())
}

fn map_mx_error(domain: &str, err: ResolveError) -> ProbeError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => {
            ProbeError::CheckFailed(format!("no MX records found for {domain}"))
        }
        ResolveErrorKind::Timeout => {
            ProbeError::Timeout(format!("resolving MX records for {domain}"))
        }
        _ => ProbeError::Dns(format!("MX lookup for {domain} failed: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn expected() -> IpAddr {
        "192.0.2.10".parse().unwrap()
    }

    fn other() -> IpAddr {
        "198.51.100.5".parse().unwrap()
    }

    #[test]
    fn all_targets_matching_succeeds() {
        let resolutions = vec![
            TargetResolution::Resolved("mx1.example.org".into(), vec![expected()]),
            TargetResolution::Resolved("mx2.example.org".into(), vec![expected()]),
        ];

        assert!(evaluate_targets("example.org", &resolutions, expected()).is_ok());
    }

    #[test]
    fn mismatched_target_is_check_failed() {
        let resolutions = vec![
            TargetResolution::Resolved("mx1.example.org".into(), vec![expected()]),
            TargetResolution::Resolved("mx2.example.org".into(), vec![other()]),
        ];

        let err = evaluate_targets("example.org", &resolutions, expected()).unwrap_err();
        assert!(matches!(err, ProbeError::CheckFailed(_)), "got {err}");
    }

    #[test]
    fn extra_address_beyond_expected_is_check_failed() {
        let resolutions = vec![TargetResolution::Resolved(
            "mx1.example.org".into(),
            vec![expected(), other()],
        )];

        let err = evaluate_targets("example.org", &resolutions, expected()).unwrap_err();
        assert!(matches!(err, ProbeError::CheckFailed(_)), "got {err}");
    }

    #[test]
    fn all_targets_missing_is_dns_failure() {
        let resolutions = vec![
            TargetResolution::Missing("mx1.example.org".into()),
            TargetResolution::Missing("mx2.example.org".into()),
        ];

        let err = evaluate_targets("example.org", &resolutions, expected()).unwrap_err();
        assert!(matches!(err, ProbeError::Dns(_)), "got {err}");
    }

    #[test]
    fn partially_missing_targets_are_check_failed() {
        let resolutions = vec![
            TargetResolution::Resolved("mx1.example.org".into(), vec![expected()]),
            TargetResolution::Missing("mx2.example.org".into()),
        ];

        let err = evaluate_targets("example.org", &resolutions, expected()).unwrap_err();
        assert!(matches!(err, ProbeError::CheckFailed(_)), "got {err}");
    }
}
