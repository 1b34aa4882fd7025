//! Shared state for the exposition handlers

use std::sync::Arc;

use crate::actors::supervisor::ProbeSupervisor;
use crate::metrics::SharedMetrics;
use crate::resources::ResourceStatus;

/// Read-only view handed to every handler.
///
/// The supervisor snapshot and the resource sample are the only data the
/// server touches; it never blocks on a probe worker.
#[derive(Clone)]
pub struct ApiState {
    pub supervisor: Arc<ProbeSupervisor>,
    pub metrics: SharedMetrics,
    pub resources: Arc<ResourceStatus>,
}

impl ApiState {
    pub fn new(
        supervisor: Arc<ProbeSupervisor>,
        metrics: SharedMetrics,
        resources: Arc<ResourceStatus>,
    ) -> Self {
        Self {
            supervisor,
            metrics,
            resources,
        }
    }
}
