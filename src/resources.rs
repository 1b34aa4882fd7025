//! Resource watcher
//!
//! Low-frequency loop sampling the prober's own resident memory and live
//! task count. Publishes both as gauges and raises warning flags above the
//! configured thresholds. Warnings are advisory for probes (none is ever
//! disabled) but they do fold into the composite health verdict.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::metrics::SharedMetrics;

const RESOURCE_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Latest resource sample, shared with the exposition server
#[derive(Debug, Default)]
pub struct ResourceStatus {
    memory_mb: AtomicU64,
    task_count: AtomicU64,
    memory_warning: AtomicBool,
    task_warning: AtomicBool,
}

impl ResourceStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb.load(Ordering::Relaxed)
    }

    pub fn task_count(&self) -> u64 {
        self.task_count.load(Ordering::Relaxed)
    }

    pub(crate) fn set_memory_warning(&self, active: bool) {
        self.memory_warning.store(active, Ordering::Relaxed);
    }

    /// Active warning labels, one per warning type.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.memory_warning.load(Ordering::Relaxed) {
            warnings.push("memory".to_string());
        }
        if self.task_warning.load(Ordering::Relaxed) {
            warnings.push("threads".to_string());
        }
        warnings
    }
}

/// The sampling loop
pub struct ResourceWatcher {
    status: Arc<ResourceStatus>,
    metrics: SharedMetrics,
    memory_warning_mb: u64,
    task_warning_count: u64,
    interval: Duration,
    cancel: CancellationToken,
}

impl ResourceWatcher {
    pub fn spawn(
        config: &Config,
        metrics: SharedMetrics,
        status: Arc<ResourceStatus>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        Self::spawn_with_interval(config, metrics, status, cancel, RESOURCE_CHECK_INTERVAL)
    }

    fn spawn_with_interval(
        config: &Config,
        metrics: SharedMetrics,
        status: Arc<ResourceStatus>,
        cancel: CancellationToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let watcher = Self {
            status,
            metrics,
            memory_warning_mb: config.memory_warning_mb,
            task_warning_count: config.thread_warning_count,
            interval,
            cancel,
        };

        tokio::spawn(watcher.run())
    }

    async fn run(self) {
        debug!("starting resource watcher");

        let mut system = System::new();
        let pid = sysinfo::get_current_pid().ok();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("cancellation received, stopping resource watcher");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {
                    self.sample(&mut system, pid);
                }
            }
        }
    }

    fn sample(&self, system: &mut System, pid: Option<Pid>) {
        let memory_mb = pid.map_or(0, |pid| {
            system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            system
                .process(pid)
                .map_or(0, |process| process.memory() / (1024 * 1024))
        });

        let task_count =
            tokio::runtime::Handle::current().metrics().num_alive_tasks() as u64;

        self.status.memory_mb.store(memory_mb, Ordering::Relaxed);
        self.status.task_count.store(task_count, Ordering::Relaxed);
        self.metrics.set_memory_mb(memory_mb);
        self.metrics.set_thread_count(task_count);

        self.update_warning(
            &self.status.memory_warning,
            memory_mb > self.memory_warning_mb,
            "memory",
            memory_mb,
            self.memory_warning_mb,
        );
        self.update_warning(
            &self.status.task_warning,
            task_count > self.task_warning_count,
            "threads",
            task_count,
            self.task_warning_count,
        );

        self.metrics
            .set_memory_warning(self.status.memory_warning.load(Ordering::Relaxed));
        self.metrics
            .set_thread_warning(self.status.task_warning.load(Ordering::Relaxed));

        debug!(memory_mb, task_count, "resource sample");
    }

    fn update_warning(
        &self,
        flag: &AtomicBool,
        active: bool,
        kind: &str,
        value: u64,
        threshold: u64,
    ) {
        let was_active = flag.swap(active, Ordering::Relaxed);

        if active && !was_active {
            warn!(kind, value, threshold, "resource warning raised");
        } else if !active && was_active {
            info!(kind, value, threshold, "resource warning cleared");
        }
    }
}
