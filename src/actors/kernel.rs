//! Probe kernel — the per-probe coordinator
//!
//! The kernel owns one probe and composes the resilience envelope around
//! it: every cycle asks the breaker to execute the check under the
//! configured time bound, classifies the outcome, records exactly one
//! counter increment, and derives the next sleep from the backoff
//! calculator.
//!
//! ```text
//! sleep ──▶ breaker.call(check) ──▶ classify ──▶ record ──▶ backoff ──┐
//!   ▲                                                                │
//!   └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Failures never escape the kernel; they end as metrics and log lines.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::messages::{ProbeCommand, ProbeSnapshot};
use crate::backoff::BackoffPolicy;
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::config::Config;
use crate::metrics::SharedMetrics;
use crate::probes::{classify, ErrorCategory, Probe, ProbeError, ProbeResult};

/// Counters and last-outcome bookkeeping shared between the kernel task
/// and snapshot readers.
#[derive(Debug)]
pub struct KernelState {
    name: String,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    last_error: Mutex<Option<ErrorCategory>>,
    last_outcome_at: Mutex<Option<DateTime<Utc>>>,
}

impl KernelState {
    fn new(name: String) -> Self {
        Self {
            name,
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
            last_outcome_at: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::SeqCst)
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        *self.last_error.lock().expect("kernel state poisoned") = None;
        *self.last_outcome_at.lock().expect("kernel state poisoned") = Some(Utc::now());
    }

    fn record_failure(&self, category: ErrorCategory) {
        self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        self.total_failures.fetch_add(1, Ordering::SeqCst);
        *self.last_error.lock().expect("kernel state poisoned") = Some(category);
        *self.last_outcome_at.lock().expect("kernel state poisoned") = Some(Utc::now());
    }

    fn snapshot(&self, breaker_state: BreakerState) -> ProbeSnapshot {
        ProbeSnapshot {
            name: self.name.clone(),
            breaker_state,
            consecutive_failures: self.consecutive_failures(),
            total_failures: self.total_failures(),
            last_error: *self.last_error.lock().expect("kernel state poisoned"),
            last_outcome_at: *self.last_outcome_at.lock().expect("kernel state poisoned"),
        }
    }
}

/// The kernel task for one probe
pub struct ProbeKernel {
    probe: Box<dyn Probe>,
    breaker: Arc<CircuitBreaker>,
    backoff: BackoffPolicy,
    metrics: SharedMetrics,
    state: Arc<KernelState>,
    command_rx: mpsc::Receiver<ProbeCommand>,
    cancel: CancellationToken,
    check_timeout: Duration,
    enhanced_logging: bool,
    categorization: bool,
}

impl ProbeKernel {
    /// Main loop: wait out the computed interval or a cancellation, then
    /// run one cycle and reschedule.
    #[instrument(skip(self), fields(probe = %self.state.name))]
    pub async fn run(mut self) {
        debug!("starting probe kernel");

        let mut delay = self.backoff.delay(0);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("cancellation received, stopping kernel");
                    break;
                }

                _ = tokio::time::sleep(delay) => {
                    let _ = self.cycle().await;
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ProbeCommand::CheckNow { respond_to } => {
                            debug!("received CheckNow command");
                            let result = self.cycle().await;
                            let _ = respond_to.send(result);
                        }
                        ProbeCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }
            }

            delay = self.backoff.delay(self.state.consecutive_failures());
        }

        debug!("probe kernel stopped");
    }

    /// Execute one check through the breaker and record the outcome.
    async fn cycle(&self) -> ProbeResult<()> {
        let probe = &self.probe;
        let check_timeout = self.check_timeout;
        let started = Instant::now();

        let result = self
            .breaker
            .call(|| async move {
                match tokio::time::timeout(check_timeout, probe.check()).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ProbeError::Timeout(format!(
                        "check exceeded {}s bound",
                        check_timeout.as_secs()
                    ))),
                }
            })
            .await;

        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                self.state.record_success();
                self.metrics.record_outcome(self.state.name(), None);
                if self.enhanced_logging {
                    info!(duration_ms, "probe succeeded");
                } else {
                    debug!(duration_ms, "probe succeeded");
                }
                Ok(())
            }
            Err(err) => {
                let category = classify(&err, self.categorization);
                self.state.record_failure(category);
                self.metrics
                    .record_outcome(self.state.name(), Some(category));
                warn!(
                    duration_ms,
                    category = %category,
                    consecutive = self.state.consecutive_failures(),
                    total = self.state.total_failures(),
                    error = %err,
                    "probe failed"
                );
                Err(err)
            }
        }
    }
}

/// Handle for one spawned kernel
pub struct KernelHandle {
    sender: mpsc::Sender<ProbeCommand>,
    state: Arc<KernelState>,
    breaker: Arc<CircuitBreaker>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl KernelHandle {
    /// Spawn a kernel task for `probe` and return its handle.
    pub fn spawn(
        probe: Box<dyn Probe>,
        config: &Config,
        metrics: SharedMetrics,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(8);

        let state = Arc::new(KernelState::new(probe.name().to_string()));
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker_failure_threshold,
            config.breaker_recovery_timeout,
        ));

        let kernel = ProbeKernel {
            probe,
            breaker: breaker.clone(),
            backoff: config.backoff_policy(),
            metrics,
            state: state.clone(),
            command_rx: cmd_rx,
            cancel,
            check_timeout: config.check_timeout(),
            enhanced_logging: config.enhanced_logging,
            categorization: config.error_categorization,
        };

        let join = tokio::spawn(kernel.run());

        Self {
            sender: cmd_tx,
            state,
            breaker,
            join: Mutex::new(Some(join)),
        }
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    pub fn snapshot(&self) -> ProbeSnapshot {
        self.state.snapshot(self.breaker.state())
    }

    /// Run a check immediately, bypassing the schedule.
    pub async fn check_now(&self) -> ProbeResult<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ProbeCommand::CheckNow { respond_to: tx })
            .await
            .map_err(|_| ProbeError::Other("kernel command channel closed".to_string()))?;

        rx.await
            .map_err(|_| ProbeError::Other("kernel dropped the response".to_string()))?
    }

    /// Take the join handle; used once by the supervisor at shutdown.
    pub(crate) fn take_join(&self) -> Option<JoinHandle<()>> {
        self.join.lock().expect("kernel join poisoned").take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::ProbeMetrics;
    use async_trait::async_trait;
    use std::collections::{HashMap, VecDeque};

    /// Probe whose outcomes follow a script, then stay Ok.
    struct ScriptedProbe {
        outcomes: Mutex<VecDeque<ProbeResult<()>>>,
    }

    impl ScriptedProbe {
        fn new(outcomes: Vec<ProbeResult<()>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
            }
        }
    }

    #[async_trait]
    impl Probe for ScriptedProbe {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn check(&self) -> ProbeResult<()> {
            self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }

    fn test_config(threshold: u32) -> Config {
        let vars: HashMap<&str, &str> = [
            ("EMAIL_SERVER_IP", "192.0.2.10"),
            ("EMAIL_SERVER_HOSTNAME", "mail.example.org"),
            ("EMAIL_MX_DOMAIN", "example.org"),
            ("EXPECTED_IP", "192.0.2.10"),
            ("EMAIL_SMTP_USERNAME", "probe"),
            ("EMAIL_SMTP_PASSWORD", "secret"),
        ]
        .into();

        let mut config = Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        config.breaker_failure_threshold = threshold;
        config
    }

    fn spawn_scripted(outcomes: Vec<ProbeResult<()>>, threshold: u32) -> (KernelHandle, SharedMetrics) {
        let metrics = Arc::new(ProbeMetrics::new());
        let handle = KernelHandle::spawn(
            Box::new(ScriptedProbe::new(outcomes)),
            &test_config(threshold),
            metrics.clone(),
            CancellationToken::new(),
        );
        (handle, metrics)
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let (handle, _metrics) = spawn_scripted(
            vec![
                Err(ProbeError::Network("down".into())),
                Err(ProbeError::Network("down".into())),
                Ok(()),
            ],
            10,
        );

        handle.check_now().await.unwrap_err();
        handle.check_now().await.unwrap_err();
        assert_eq!(handle.snapshot().consecutive_failures, 2);

        handle.check_now().await.unwrap();
        let snapshot = handle.snapshot();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.total_failures, 2);
        assert!(snapshot.last_error.is_none());
    }

    #[tokio::test]
    async fn every_execution_emits_exactly_one_increment() {
        let (handle, metrics) = spawn_scripted(
            vec![Ok(()), Err(ProbeError::Timeout("slow".into())), Ok(())],
            10,
        );

        handle.check_now().await.unwrap();
        handle.check_now().await.unwrap_err();
        handle.check_now().await.unwrap();

        assert_eq!(metrics.outcome_count("scripted", true, "none"), 2);
        assert_eq!(metrics.outcome_count("scripted", false, "timeout"), 1);
    }

    #[tokio::test]
    async fn breaker_open_marks_circuit_breaker_category() {
        let failures = (0..3)
            .map(|_| Err(ProbeError::Network("down".into())))
            .collect();
        let (handle, metrics) = spawn_scripted(failures, 3);

        for _ in 0..3 {
            handle.check_now().await.unwrap_err();
        }
        assert_eq!(handle.snapshot().breaker_state, BreakerState::Open);

        // Fourth cycle short-circuits; still counted as a failure, but
        // distinguishable by its category.
        let err = handle.check_now().await.unwrap_err();
        assert!(matches!(err, ProbeError::CircuitOpen));

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.consecutive_failures, 4);
        assert_eq!(snapshot.last_error, Some(ErrorCategory::CircuitBreaker));
        assert_eq!(metrics.outcome_count("scripted", false, "network"), 3);
        assert_eq!(metrics.outcome_count("scripted", false, "circuit_breaker"), 1);
    }

    #[tokio::test]
    async fn categorization_toggle_collapses_labels() {
        let metrics = Arc::new(ProbeMetrics::new());
        let mut config = test_config(10);
        config.error_categorization = false;

        let handle = KernelHandle::spawn(
            Box::new(ScriptedProbe::new(vec![Err(ProbeError::Auth("535".into()))])),
            &config,
            metrics.clone(),
            CancellationToken::new(),
        );

        handle.check_now().await.unwrap_err();
        assert_eq!(metrics.outcome_count("scripted", false, "unknown"), 1);
        assert_eq!(metrics.outcome_count("scripted", false, "auth"), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_kernel() {
        let metrics = Arc::new(ProbeMetrics::new());
        let cancel = CancellationToken::new();
        let handle = KernelHandle::spawn(
            Box::new(ScriptedProbe::new(vec![])),
            &test_config(5),
            metrics,
            cancel.clone(),
        );

        cancel.cancel();
        let join = handle.take_join().unwrap();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("kernel did not stop after cancellation")
            .unwrap();
    }
}
