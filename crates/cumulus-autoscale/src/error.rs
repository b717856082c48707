//! Control loop error types.

use thiserror::Error;

use cumulus_metrics::MonitorError;
use cumulus_scheduler::SchedulerError;

/// Errors that end the control loop.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("provisioning failed: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("monitoring failed: {0}")]
    Monitor(#[from] MonitorError),
}

impl ControlError {
    /// Whether the loop stopped because it was asked to.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ControlError::Monitor(MonitorError::Cancelled { .. }))
    }
}

impl From<cumulus_state::StateError> for ControlError {
    fn from(e: cumulus_state::StateError) -> Self {
        ControlError::Scheduler(SchedulerError::State(e))
    }
}

pub type ControlResult<T> = Result<T, ControlError>;
