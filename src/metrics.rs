//! In-process metrics registry exposed as `GET /metrics` in Prometheus
//! text format.
//!
//! The registry is the only shared mutable resource touched by all workers:
//! gauges are atomics, the labeled outcome counter sits behind a mutex held
//! only for the duration of an increment. Label sets are kept in a sorted
//! map so identical configurations render identical exposition across
//! restarts.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::probes::ErrorCategory;

/// Shared handle to the registry
pub type SharedMetrics = Arc<ProbeMetrics>;

/// Label set of one `email_probe_success_count` series
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct OutcomeKey {
    probe: String,
    success: bool,
    error_type: &'static str,
}

/// Registry for all metrics the prober publishes
#[derive(Debug, Default)]
pub struct ProbeMetrics {
    outcomes: Mutex<BTreeMap<OutcomeKey, u64>>,
    memory_mb: AtomicU64,
    thread_count: AtomicU64,
    memory_warning: AtomicBool,
    thread_warning: AtomicBool,
}

impl ProbeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one probe execution outcome.
    ///
    /// `category` is `None` for a success, which renders as
    /// `success="true", error_type="none"`. Exactly one series is
    /// incremented per call.
    pub fn record_outcome(&self, probe: &str, category: Option<ErrorCategory>) {
        let key = OutcomeKey {
            probe: probe.to_string(),
            success: category.is_none(),
            error_type: category.map_or("none", |c| c.as_str()),
        };

        let mut outcomes = self.outcomes.lock().expect("metrics registry poisoned");
        *outcomes.entry(key).or_insert(0) += 1;
    }

    /// Current value of one outcome series, for assertions in tests and the
    /// enhanced failure logs.
    pub fn outcome_count(&self, probe: &str, success: bool, error_type: &str) -> u64 {
        let outcomes = self.outcomes.lock().expect("metrics registry poisoned");
        outcomes
            .iter()
            .find(|(k, _)| k.probe == probe && k.success == success && k.error_type == error_type)
            .map_or(0, |(_, v)| *v)
    }

    pub fn set_memory_mb(&self, mb: u64) {
        self.memory_mb.store(mb, Ordering::Relaxed);
    }

    pub fn set_thread_count(&self, count: u64) {
        self.thread_count.store(count, Ordering::Relaxed);
    }

    pub fn set_memory_warning(&self, active: bool) {
        self.memory_warning.store(active, Ordering::Relaxed);
    }

    pub fn set_thread_warning(&self, active: bool) {
        self.thread_warning.store(active, Ordering::Relaxed);
    }

    /// Render the full registry in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str(
            "# HELP email_probe_success_count Count of probe execution successes and failures.\n\
             # TYPE email_probe_success_count counter\n",
        );
        {
            let outcomes = self.outcomes.lock().expect("metrics registry poisoned");
            for (key, value) in outcomes.iter() {
                let _ = writeln!(
                    out,
                    "email_probe_success_count{{probe=\"{}\",success=\"{}\",error_type=\"{}\"}} {}",
                    key.probe, key.success, key.error_type, value
                );
            }
        }

        let _ = writeln!(
            out,
            "# HELP email_probe_memory_usage_mb Resident memory of the prober process in megabytes.\n\
             # TYPE email_probe_memory_usage_mb gauge\n\
             email_probe_memory_usage_mb {}",
            self.memory_mb.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP email_probe_thread_count Live worker tasks in the prober runtime.\n\
             # TYPE email_probe_thread_count gauge\n\
             email_probe_thread_count {}",
            self.thread_count.load(Ordering::Relaxed)
        );

        let _ = writeln!(
            out,
            "# HELP email_probe_resource_warnings Active resource warnings, one series per warning type.\n\
             # TYPE email_probe_resource_warnings gauge\n\
             email_probe_resource_warnings{{warning=\"memory\"}} {}\n\
             email_probe_resource_warnings{{warning=\"threads\"}} {}",
            self.memory_warning.load(Ordering::Relaxed) as u8,
            self.thread_warning.load(Ordering::Relaxed) as u8
        );

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_series_accumulate_independently() {
        let metrics = ProbeMetrics::new();

        metrics.record_outcome("https_certificate", None);
        metrics.record_outcome("https_certificate", None);
        metrics.record_outcome("https_certificate", Some(ErrorCategory::Cert));
        metrics.record_outcome("http_port", Some(ErrorCategory::Network));

        assert_eq!(metrics.outcome_count("https_certificate", true, "none"), 2);
        assert_eq!(metrics.outcome_count("https_certificate", false, "cert"), 1);
        assert_eq!(metrics.outcome_count("http_port", false, "network"), 1);
        assert_eq!(metrics.outcome_count("http_port", true, "none"), 0);
    }

    #[test]
    fn render_contains_typed_series_and_gauges() {
        let metrics = ProbeMetrics::new();
        metrics.record_outcome("dns_mx_domain", None);
        metrics.set_memory_mb(42);
        metrics.set_thread_count(17);
        metrics.set_memory_warning(true);

        let text = metrics.render();

        assert!(text.contains("# TYPE email_probe_success_count counter"));
        assert!(text.contains(
            "email_probe_success_count{probe=\"dns_mx_domain\",success=\"true\",error_type=\"none\"} 1"
        ));
        assert!(text.contains("email_probe_memory_usage_mb 42"));
        assert!(text.contains("email_probe_thread_count 17"));
        assert!(text.contains("email_probe_resource_warnings{warning=\"memory\"} 1"));
        assert!(text.contains("email_probe_resource_warnings{warning=\"threads\"} 0"));
    }

    #[test]
    fn render_order_is_deterministic() {
        let build = || {
            let metrics = ProbeMetrics::new();
            metrics.record_outcome("smtp_port", Some(ErrorCategory::Timeout));
            metrics.record_outcome("dns_mx_ip", Some(ErrorCategory::CheckFailed));
            metrics.record_outcome("dns_mx_ip", None);
            metrics.render()
        };

        assert_eq!(build(), build());
    }

    #[test]
    fn every_line_is_comment_or_sample() {
        let metrics = ProbeMetrics::new();
        metrics.record_outcome("ip_ping", Some(ErrorCategory::Unknown));

        for line in metrics.render().lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.rsplitn(2, ' ');
            let value = parts.next().unwrap();
            assert!(
                value.parse::<f64>().is_ok(),
                "sample line has no numeric value: {line}"
            );
        }
    }
}
