//! Message and snapshot types for the probe kernels

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::breaker::BreakerState;
use crate::probes::{ErrorCategory, ProbeResult};

/// Commands accepted by a probe kernel
#[derive(Debug)]
pub enum ProbeCommand {
    /// Run a check immediately, bypassing the schedule.
    ///
    /// Used by tests and manual triggers; the outcome still flows through
    /// the breaker, the classifier, and the metrics registry.
    CheckNow {
        respond_to: oneshot::Sender<ProbeResult<()>>,
    },

    /// Stop the kernel after any in-flight check completes.
    Shutdown,
}

/// Point-in-time view of one kernel, consumed by the exposition server
#[derive(Debug, Clone)]
pub struct ProbeSnapshot {
    pub name: String,
    pub breaker_state: BreakerState,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub last_error: Option<ErrorCategory>,
    pub last_outcome_at: Option<DateTime<Utc>>,
}

impl ProbeSnapshot {
    /// A probe is healthy while its breaker is not open.
    pub fn is_healthy(&self) -> bool {
        self.breaker_state != BreakerState::Open
    }
}
