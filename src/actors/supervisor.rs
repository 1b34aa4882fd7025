//! Probe supervisor
//!
//! Spawns one kernel per registered probe, owns the process-wide
//! cancellation token, and hands the exposition server a read-only
//! snapshot of kernel states. On shutdown it broadcasts cancellation and
//! waits a bounded grace period; kernels that overrun are logged and
//! abandoned.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::kernel::KernelHandle;
use super::messages::ProbeSnapshot;
use crate::config::Config;
use crate::metrics::SharedMetrics;
use crate::probes::Probe;

/// How long shutdown waits for kernels to drain in-flight checks
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct ProbeSupervisor {
    handles: Vec<KernelHandle>,
    cancel: CancellationToken,
    grace: Duration,
}

impl ProbeSupervisor {
    /// Spawn one kernel per probe, all sharing the metrics registry and a
    /// child of the supervisor's cancellation token.
    pub fn spawn(probes: Vec<Box<dyn Probe>>, config: &Config, metrics: SharedMetrics) -> Self {
        let cancel = CancellationToken::new();

        let handles: Vec<KernelHandle> = probes
            .into_iter()
            .map(|probe| {
                let name = probe.name().to_string();
                let handle =
                    KernelHandle::spawn(probe, config, metrics.clone(), cancel.child_token());
                info!(probe = %name, "probe kernel started");
                handle
            })
            .collect();

        info!(count = handles.len(), "probe supervisor running");

        Self {
            handles,
            cancel,
            grace: SHUTDOWN_GRACE,
        }
    }

    /// Token cancelled when the supervisor shuts down; other workers hook
    /// their own loops onto it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn probe_count(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> &[KernelHandle] {
        &self.handles
    }

    /// Read-only view of all kernel states, safe against concurrent
    /// mutation by the kernels themselves.
    pub fn snapshot(&self) -> Vec<ProbeSnapshot> {
        self.handles.iter().map(KernelHandle::snapshot).collect()
    }

    /// Broadcast cancellation and wait up to the grace period for all
    /// kernels to exit.
    pub async fn shutdown(&self) {
        info!("stopping probe kernels");
        self.cancel.cancel();

        let deadline = Instant::now() + self.grace;
        for handle in &self.handles {
            let Some(join) = handle.take_join() else {
                continue;
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if tokio::time::timeout(remaining, join).await.is_err() {
                warn!(
                    probe = handle.name(),
                    "kernel did not stop within the grace period, abandoning"
                );
            }
        }

        info!("probe supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ProbeMetrics;
    use crate::probes::ProbeResult;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct AlwaysOk(&'static str);

    #[async_trait]
    impl Probe for AlwaysOk {
        fn name(&self) -> &str {
            self.0
        }

        async fn check(&self) -> ProbeResult<()> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        let vars: HashMap<&str, &str> = [
            ("EMAIL_SERVER_IP", "192.0.2.10"),
            ("EMAIL_SERVER_HOSTNAME", "mail.example.org"),
            ("EMAIL_MX_DOMAIN", "example.org"),
            ("EXPECTED_IP", "192.0.2.10"),
            ("EMAIL_SMTP_USERNAME", "probe"),
            ("EMAIL_SMTP_PASSWORD", "secret"),
        ]
        .into();

        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    #[tokio::test]
    async fn snapshot_covers_every_registered_probe() {
        let probes: Vec<Box<dyn Probe>> = vec![
            Box::new(AlwaysOk("a")),
            Box::new(AlwaysOk("b")),
            Box::new(AlwaysOk("c")),
        ];
        let supervisor =
            ProbeSupervisor::spawn(probes, &test_config(), Arc::new(ProbeMetrics::new()));

        assert_eq!(supervisor.probe_count(), 3);

        let names: Vec<String> = supervisor
            .snapshot()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_completes_within_grace() {
        let probes: Vec<Box<dyn Probe>> = vec![Box::new(AlwaysOk("a")), Box::new(AlwaysOk("b"))];
        let supervisor =
            ProbeSupervisor::spawn(probes, &test_config(), Arc::new(ProbeMetrics::new()));

        tokio::time::timeout(Duration::from_secs(2), supervisor.shutdown())
            .await
            .expect("shutdown exceeded grace window");

        assert!(supervisor.cancellation_token().is_cancelled());
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let probes: Vec<Box<dyn Probe>> = vec![Box::new(AlwaysOk("a"))];
        let supervisor =
            ProbeSupervisor::spawn(probes, &test_config(), Arc::new(ProbeMetrics::new()));

        supervisor.shutdown().await;
        supervisor.shutdown().await;
    }
}
