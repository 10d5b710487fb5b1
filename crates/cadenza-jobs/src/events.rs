//! Job event fan-out
//!
//! Each job owns a broadcast channel; consumers subscribe for UI binding.
//! Event names are kept as semantic tags. Publishing with no subscriber is
//! a non-error; the job itself remains the source of truth.

use tokio::sync::broadcast;

use crate::job::{JobId, JobOutcome, JobStatus};

/// Notification emitted at documented job transition points
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The job's status advanced
    StatusChange {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    /// A dependency edge was added
    Dependency { job: JobId, dependency: JobId },
    /// A dependency edge was dropped after its settlement was consumed
    DependencyRemove { job: JobId, dependency: JobId },
    /// The job reached a terminal outcome
    Settle { job: JobId, outcome: JobOutcome },
}

impl JobEvent {
    /// Semantic tag for the event, stable across the API
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::StatusChange { .. } => "statuschange",
            JobEvent::Dependency { .. } => "dependency",
            JobEvent::DependencyRemove { .. } => "dependencyremove",
            JobEvent::Settle { .. } => "settle",
        }
    }
}

pub(crate) struct JobEvents {
    tx: broadcast::Sender<JobEvent>,
}

impl JobEvents {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // Ignore "no receiver" as a non-error; the job state is authoritative.
        match self.tx.send(event) {
            Ok(_) => {}
            Err(broadcast::error::SendError(_)) => {}
        }
    }
}
