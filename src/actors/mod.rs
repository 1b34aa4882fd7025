//! Actor-based probe scheduling
//!
//! Each probe runs inside its own kernel task; the supervisor owns the set
//! of kernels and the process-wide cancellation token.
//!
//! ```text
//!                  ┌─────────────────┐
//!                  │ Supervisor      │
//!                  └────────┬────────┘
//!                           │ spawns
//!          ┌────────────────┼────────────────┐
//!          │                │                │
//!  ┌───────▼───────┐        │        ┌───────▼───────┐
//!  │ Kernel-1      │        │        │ Kernel-N      │
//!  │ (dns_mx_...)  │        │        │ (smtp_...)    │
//!  └───────┬───────┘        │        └───────┬───────┘
//!          │   sleep → check → classify →    │
//!          │   record → backoff → sleep      │
//!          └────────────────┬────────────────┘
//!                           │ concurrent-safe increments
//!                  ┌────────▼────────┐
//!                  │ Metrics registry│──▶ GET /metrics
//!                  └─────────────────┘
//! ```
//!
//! Outcomes within one kernel are strictly serialized: one in-flight check
//! at a time. Kernels never interact with each other; the exposition
//! server reads their state through the supervisor's snapshot.

pub mod kernel;
pub mod messages;
pub mod supervisor;
