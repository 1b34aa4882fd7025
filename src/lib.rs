//! mailprobe — external health prober for a mail server
//!
//! Runs a fixed set of probes (DNS, reachability, TLS certificates, SMTP
//! conversations) against one email server on independent schedules, wraps
//! each in a circuit breaker and jittered exponential backoff, and exposes
//! outcomes as Prometheus metrics plus a composite `/health` verdict.

pub mod actors;
pub mod api;
pub mod backoff;
pub mod breaker;
pub mod config;
pub mod metrics;
pub mod probes;
pub mod resources;

pub use actors::messages::ProbeSnapshot;
pub use actors::supervisor::ProbeSupervisor;
pub use backoff::BackoffPolicy;
pub use breaker::{BreakerState, CircuitBreaker};
pub use config::Config;
pub use metrics::{ProbeMetrics, SharedMetrics};
pub use probes::{classify, ErrorCategory, Probe, ProbeError, ProbeResult};
pub use resources::{ResourceStatus, ResourceWatcher};
