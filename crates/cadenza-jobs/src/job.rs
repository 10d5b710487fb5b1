//! Job - named, cancelable, dependency-aware unit of work
//!
//! A job wraps a compensating task series with a status lifecycle:
//!
//! ```text
//! pending -> waiting -> doing -> done
//!                             -> cancelling -> cancelled | failed
//!                             -> failed
//! ```
//!
//! `waiting` is entered only when unsettled dependencies exist at the moment
//! `run` is called. Status only advances forward; a settled job is immutable
//! apart from listeners detaching.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use cadenza_core::cancel::{CancelHandle, CancelReason, CancelToken};
use cadenza_core::series::{SeriesError, SeriesObserver, Step, TaskSeries};

use crate::events::{JobEvent, JobEvents};

/// Process-wide monotonic job identifier
pub type JobId = u64;

/// Category a job belongs to when none is given
pub const DEFAULT_CATEGORY: &str = "main";

pub(crate) const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Job lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created, not yet run
    Pending,
    /// Run requested, dependencies still unsettled
    Waiting,
    /// Steps executing
    Doing,
    /// Cancellation observed, unwind in progress
    Cancelling,
    /// All steps completed
    Done,
    /// Cancelled; any completed steps were unwound
    Cancelled,
    /// A step or dependency failed
    Failed,
}

impl JobStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Cancelled | JobStatus::Failed)
    }

    pub fn accepts_dependencies(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Waiting)
    }

    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Doing | JobStatus::Cancelling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Waiting => "waiting",
            JobStatus::Doing => "doing",
            JobStatus::Cancelling => "cancelling",
            JobStatus::Done => "done",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a settled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Done,
    Cancelled,
    Failed,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Done => "done",
            JobOutcome::Cancelled => "cancelled",
            JobOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-level error; cancellation and failure are never conflated
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The job was cancelled; carries the original reason as cause
    #[error("job cancelled ({reason})")]
    Cancelled { reason: CancelReason },
    /// A step's computation or perform failed
    #[error("step {index} failed: {message}")]
    Step { index: usize, message: String },
    /// A dependency settled other than done before this job could run
    #[error("dependency job {id} did not complete: {cause}")]
    Dependency { id: JobId, cause: Arc<JobError> },
    /// The operation is not valid for the job's current status
    #[error("job is {status}, cannot {operation}")]
    InvalidStatus {
        status: JobStatus,
        operation: &'static str,
    },
    /// The dependency belongs to a different registry
    #[error("dependency belongs to a different registry")]
    RegistryMismatch,
}

/// Terminal outcome plus the stored result or error
#[derive(Debug, Clone)]
pub struct Settlement {
    pub outcome: JobOutcome,
    pub result: Result<Vec<Value>, JobError>,
}

/// Construction options for a job
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub category: Option<String>,
    pub host: Option<String>,
    pub goals: Option<cadenza_core::Goals>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_goals(mut self, goals: cadenza_core::Goals) -> Self {
        self.goals = Some(goals);
        self
    }
}

/// Options for [`Job::run`]
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Controller the run is tied to; a private one is created when absent
    pub handle: Option<CancelHandle>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handle(mut self, handle: CancelHandle) -> Self {
        self.handle = Some(handle);
        self
    }
}

struct JobInner {
    status: JobStatus,
    dependencies: Vec<Arc<Job>>,
    steps: Option<Vec<Arc<dyn Step>>>,
    handle: Option<CancelHandle>,
    mirrors: Option<JobId>,
    updated_at: DateTime<Utc>,
}

/// A fallible, abortable, multi-step unit of work with compensation
pub struct Job {
    id: JobId,
    name: String,
    category: String,
    host: Option<String>,
    goals: Option<cadenza_core::Goals>,
    registry_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    inner: Mutex<JobInner>,
    events: JobEvents,
    settlement: watch::Sender<Option<Settlement>>,
}

impl Job {
    /// Standalone construction; registry-created jobs get their id allocated
    pub fn new(
        id: JobId,
        name: impl Into<String>,
        steps: Vec<Arc<dyn Step>>,
        options: JobOptions,
    ) -> Arc<Self> {
        Self::with_registry(id, name, steps, options, None, DEFAULT_EVENT_CAPACITY)
    }

    pub(crate) fn with_registry(
        id: JobId,
        name: impl Into<String>,
        steps: Vec<Arc<dyn Step>>,
        options: JobOptions,
        registry_id: Option<Uuid>,
        event_capacity: usize,
    ) -> Arc<Self> {
        let (settlement, _) = watch::channel(None);
        let now = Utc::now();
        Arc::new(Self {
            id,
            name: name.into(),
            category: options
                .category
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            host: options.host,
            goals: options.goals,
            registry_id,
            created_at: now,
            inner: Mutex::new(JobInner {
                status: JobStatus::Pending,
                dependencies: Vec::new(),
                steps: Some(steps),
                handle: None,
                mirrors: None,
                updated_at: now,
            }),
            events: JobEvents::new(event_capacity),
            settlement,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn goals(&self) -> Option<&cadenza_core::Goals> {
        self.goals.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.lock_inner().updated_at
    }

    pub fn status(&self) -> JobStatus {
        self.lock_inner().status
    }

    /// Terminal outcome once settled
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.settlement.borrow().as_ref().map(|s| s.outcome)
    }

    /// Stored result or error once settled
    pub fn result(&self) -> Option<Result<Vec<Value>, JobError>> {
        self.settlement.borrow().as_ref().map(|s| s.result.clone())
    }

    /// Ids of the current dependency edges
    pub fn dependencies(&self) -> Vec<JobId> {
        self.lock_inner().dependencies.iter().map(|d| d.id).collect()
    }

    /// The job this one coalesced onto, if any
    pub fn mirrored_from(&self) -> Option<JobId> {
        self.lock_inner().mirrors
    }

    /// Subscribe to this job's events
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Add a dependency edge; only valid while pending or waiting, and only
    /// within the same registry
    pub fn add_dependency(&self, dependency: &Arc<Job>) -> Result<(), JobError> {
        if self.registry_id != dependency.registry_id {
            return Err(JobError::RegistryMismatch);
        }
        {
            let mut inner = self.lock_inner();
            if !inner.status.accepts_dependencies() {
                return Err(JobError::InvalidStatus {
                    status: inner.status,
                    operation: "add a dependency",
                });
            }
            inner.dependencies.push(Arc::clone(dependency));
        }
        self.events.emit(JobEvent::Dependency {
            job: self.id,
            dependency: dependency.id,
        });
        Ok(())
    }

    /// Run the job: await dependencies, then drive the task series.
    ///
    /// Only valid from `pending`. A coalesced job awaits the settlement it
    /// mirrors instead of executing its own steps.
    pub async fn run(self: &Arc<Self>, options: RunOptions) -> Result<Vec<Value>, JobError> {
        let prepared = {
            let mut inner = self.lock_inner();
            if inner.mirrors.is_some() {
                None
            } else {
                if inner.status != JobStatus::Pending {
                    return Err(JobError::InvalidStatus {
                        status: inner.status,
                        operation: "run",
                    });
                }
                let handle = options.handle.clone().unwrap_or_default();
                inner.handle = Some(handle.clone());
                let steps = inner.steps.take().unwrap_or_default();
                let dependencies = inner.dependencies.clone();
                if dependencies.iter().any(|dep| !dep.status().is_settled()) {
                    self.transition(&mut inner, JobStatus::Waiting);
                }
                Some((steps, dependencies, handle))
            }
        };
        let Some((steps, dependencies, handle)) = prepared else {
            return self.settled().await;
        };

        let token = handle.token();
        if !dependencies.is_empty() {
            if let Err(error) = self.await_dependencies(&dependencies, &token).await {
                return Err(error);
            }
            if self.outcome().is_some() {
                // Cancelled (or mirrored-settled) during the dependency wait.
                return self.settled().await;
            }
            self.clear_dependencies();
        }

        if token.is_cancelled() {
            let reason = token
                .reason()
                .unwrap_or_else(|| CancelReason::explicit("cancelled"));
            let error = JobError::Cancelled { reason };
            if self.settle(JobOutcome::Cancelled, Err(error.clone())) {
                return Err(error);
            }
            return self.settled().await;
        }
        let already_settled = {
            let mut inner = self.lock_inner();
            let already_settled = inner.status.is_settled();
            if !already_settled {
                self.transition(&mut inner, JobStatus::Doing);
            }
            already_settled
        };
        if already_settled {
            return self.settled().await;
        }

        let observer: Arc<dyn SeriesObserver> = Arc::new(StatusObserver {
            job: Arc::clone(self),
        });
        let series = TaskSeries::new().with_observer(observer);
        match series.run(&steps, &token).await {
            Ok(results) => {
                self.settle(JobOutcome::Done, Ok(results.clone()));
                Ok(results)
            }
            Err(SeriesError::Cancelled { reason }) => {
                let error = JobError::Cancelled { reason };
                self.settle(JobOutcome::Cancelled, Err(error.clone()));
                Err(error)
            }
            Err(SeriesError::Step { index, message }) => {
                let error = JobError::Step { index, message };
                self.settle(JobOutcome::Failed, Err(error.clone()));
                Err(error)
            }
        }
    }

    /// Cancel the job.
    ///
    /// Idempotent once cancelled (returns the original reason); an error for
    /// the other terminal states. A pending or waiting job settles
    /// immediately without running a step; a doing or cancelling job settles
    /// only after its unwind completes.
    pub async fn cancel(&self, reason: Option<CancelReason>) -> Result<CancelReason, JobError> {
        let reason = reason.unwrap_or_else(|| CancelReason::explicit("cancelled"));

        enum CancelPath {
            Settle(Option<CancelHandle>),
            Trigger(CancelHandle),
            Await,
        }

        let path = {
            let inner = self.lock_inner();
            match inner.status {
                JobStatus::Cancelled => {
                    return Ok(self.cancelled_reason().unwrap_or(reason));
                }
                JobStatus::Done | JobStatus::Failed => {
                    return Err(JobError::InvalidStatus {
                        status: inner.status,
                        operation: "cancel",
                    });
                }
                JobStatus::Pending | JobStatus::Waiting => {
                    CancelPath::Settle(inner.handle.clone())
                }
                JobStatus::Doing => match inner.handle.clone() {
                    Some(handle) => CancelPath::Trigger(handle),
                    None => CancelPath::Settle(None),
                },
                JobStatus::Cancelling => CancelPath::Await,
            }
        };

        match path {
            CancelPath::Settle(handle) => {
                let error = JobError::Cancelled {
                    reason: reason.clone(),
                };
                if self.settle(JobOutcome::Cancelled, Err(error)) {
                    // Wake an in-flight dependency wait, if any.
                    if let Some(handle) = handle {
                        handle.cancel(reason.clone());
                    }
                    Ok(reason)
                } else {
                    self.finished_cancel(reason).await
                }
            }
            CancelPath::Trigger(handle) => {
                handle.cancel(reason.clone());
                self.finished_cancel(reason).await
            }
            CancelPath::Await => self.finished_cancel(reason).await,
        }
    }

    /// Resolves with the results once done, rejects with the stored error
    /// otherwise; any number of waiters
    pub async fn settled(&self) -> Result<Vec<Value>, JobError> {
        self.wait_settlement().await.result
    }

    pub(crate) async fn wait_settlement(&self) -> Settlement {
        let mut rx = self.settlement.subscribe();
        loop {
            let current = self.settlement.borrow().as_ref().cloned();
            if let Some(settlement) = current {
                return settlement;
            }
            if rx.changed().await.is_err() {
                return Settlement {
                    outcome: JobOutcome::Failed,
                    result: Err(JobError::InvalidStatus {
                        status: self.status(),
                        operation: "await settlement",
                    }),
                };
            }
        }
    }

    pub(crate) fn mark_mirror_of(&self, original: JobId) {
        self.lock_inner().mirrors = Some(original);
    }

    /// Adopt another job's settlement verbatim; a no-op once settled
    pub(crate) fn adopt_settlement(&self, settlement: Settlement) {
        self.settle(settlement.outcome, settlement.result);
    }

    async fn await_dependencies(
        self: &Arc<Self>,
        dependencies: &[Arc<Job>],
        token: &CancelToken,
    ) -> Result<(), JobError> {
        let waits = dependencies.iter().cloned().map(|dep| async move {
            let settlement = dep.wait_settlement().await;
            (dep.id(), settlement)
        });
        let mut settle_rx = self.settlement.subscribe();

        tokio::select! {
            settlements = join_all(waits) => {
                for (dep_id, settlement) in settlements {
                    if settlement.outcome != JobOutcome::Done {
                        let cause = settlement.result.err().unwrap_or(JobError::InvalidStatus {
                            status: JobStatus::Done,
                            operation: "read dependency error",
                        });
                        let error = JobError::Dependency {
                            id: dep_id,
                            cause: Arc::new(cause),
                        };
                        self.clear_dependencies();
                        if self.settle(JobOutcome::Failed, Err(error.clone())) {
                            return Err(error);
                        }
                        return Err(self.wait_settlement().await.result.err().unwrap_or(error));
                    }
                }
                Ok(())
            }
            reason = token.cancelled() => {
                let error = JobError::Cancelled { reason };
                if self.settle(JobOutcome::Cancelled, Err(error.clone())) {
                    return Err(error);
                }
                Err(self.wait_settlement().await.result.err().unwrap_or(error))
            }
            _ = async { settle_rx.wait_for(|slot| slot.is_some()).await.map(|_| ()) } => {
                // Settled out from under us, e.g. by cancel().
                Err(self.wait_settlement().await.result.err().unwrap_or(
                    JobError::InvalidStatus { status: self.status(), operation: "run" },
                ))
            }
        }
    }

    async fn finished_cancel(&self, requested: CancelReason) -> Result<CancelReason, JobError> {
        let settlement = self.wait_settlement().await;
        match settlement.outcome {
            JobOutcome::Cancelled => Ok(self.cancelled_reason().unwrap_or(requested)),
            _ => Err(JobError::InvalidStatus {
                status: self.status(),
                operation: "cancel",
            }),
        }
    }

    fn cancelled_reason(&self) -> Option<CancelReason> {
        match self.settlement.borrow().as_ref() {
            Some(Settlement {
                result: Err(JobError::Cancelled { reason }),
                ..
            }) => Some(reason.clone()),
            _ => None,
        }
    }

    fn settle(&self, outcome: JobOutcome, result: Result<Vec<Value>, JobError>) -> bool {
        {
            let mut inner = self.lock_inner();
            if inner.status.is_settled() {
                return false;
            }
            let status = match outcome {
                JobOutcome::Done => JobStatus::Done,
                JobOutcome::Cancelled => JobStatus::Cancelled,
                JobOutcome::Failed => JobStatus::Failed,
            };
            self.transition(&mut inner, status);
            inner.handle = None;
            inner.steps = None;
            self.settlement.send_modify(|slot| {
                if slot.is_none() {
                    *slot = Some(Settlement { outcome, result });
                }
            });
        }
        self.events.emit(JobEvent::Settle {
            job: self.id,
            outcome,
        });
        tracing::debug!(job_id = self.id, outcome = %outcome, "job settled");
        true
    }

    fn transition(&self, inner: &mut JobInner, to: JobStatus) {
        let from = inner.status;
        if from == to {
            return;
        }
        inner.status = to;
        inner.updated_at = Utc::now();
        self.events.emit(JobEvent::StatusChange {
            job: self.id,
            from,
            to,
        });
        tracing::debug!(job_id = self.id, from = %from, to = %to, "job status changed");
    }

    fn mark_cancelling(&self) {
        let mut inner = self.lock_inner();
        if inner.status == JobStatus::Doing {
            self.transition(&mut inner, JobStatus::Cancelling);
        }
    }

    fn clear_dependencies(&self) {
        let removed: Vec<JobId> = {
            let mut inner = self.lock_inner();
            inner.dependencies.drain(..).map(|dep| dep.id).collect()
        };
        for dependency in removed {
            self.events.emit(JobEvent::DependencyRemove {
                job: self.id,
                dependency,
            });
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("category", &self.category)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Flips the job to cancelling when its series begins a cancellation unwind
struct StatusObserver {
    job: Arc<Job>,
}

#[async_trait]
impl SeriesObserver for StatusObserver {
    async fn on_step_start(&self, index: usize, total: usize) {
        tracing::debug!(job_id = self.job.id(), index, total, "job step starting");
    }

    async fn on_unwind_start(&self, cause: &SeriesError) {
        if matches!(cause, SeriesError::Cancelled { .. }) {
            self.job.mark_cancelling();
        }
    }

    async fn on_revert_error(&self, index: usize, message: &str) {
        tracing::warn!(
            job_id = self.job.id(),
            index,
            error = message,
            "revert failed during job unwind"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::cancel::CancelKind;
    use cadenza_core::series::{steps, StepError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::sleep;

    fn counting_step(counter: Arc<AtomicUsize>, value: Value) -> Arc<dyn Step> {
        steps::compute(move |_results, _token| {
            let counter = Arc::clone(&counter);
            let value = value.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(value)
            }
        })
    }

    fn slow_compensated_step(
        delay_ms: u64,
        reverts: Arc<AtomicUsize>,
        value: Value,
    ) -> Arc<dyn Step> {
        steps::compensated(
            move |_results, _token| {
                let value = value.clone();
                async move {
                    sleep(Duration::from_millis(delay_ms)).await;
                    Ok(value)
                }
            },
            move |_results, _value| {
                let reverts = Arc::clone(&reverts);
                async move {
                    sleep(Duration::from_millis(5)).await;
                    reverts.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        )
    }

    fn collect_event_names(rx: &mut broadcast::Receiver<JobEvent>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[test]
    fn test_successful_run_settles_done_with_results() {
        tokio_test::block_on(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let job = Job::new(
                1,
                "load",
                vec![
                    counting_step(Arc::clone(&counter), json!("a")),
                    counting_step(Arc::clone(&counter), json!("b")),
                ],
                JobOptions::new(),
            );
            let mut rx = job.subscribe();

            let results = job.run(RunOptions::new()).await.expect("results");
            assert_eq!(results, vec![json!("a"), json!("b")]);
            assert_eq!(job.status(), JobStatus::Done);
            assert_eq!(job.outcome(), Some(JobOutcome::Done));
            assert_eq!(counter.load(Ordering::SeqCst), 2);

            let names = collect_event_names(&mut rx);
            assert_eq!(names, vec!["statuschange", "statuschange", "settle"]);
        });
    }

    #[test]
    fn test_run_twice_is_invalid() {
        tokio_test::block_on(async {
            let job = Job::new(1, "once", Vec::new(), JobOptions::new());
            job.run(RunOptions::new()).await.expect("first run");

            let err = job.run(RunOptions::new()).await.expect_err("second run");
            assert!(matches!(
                err,
                JobError::InvalidStatus {
                    status: JobStatus::Done,
                    ..
                }
            ));
        });
    }

    #[test]
    fn test_cancel_pending_settles_without_running_steps() {
        tokio_test::block_on(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let job = Job::new(
                1,
                "never-runs",
                vec![counting_step(Arc::clone(&counter), json!(null))],
                JobOptions::new(),
            );

            let reason = job
                .cancel(Some(CancelReason::explicit("navigated away")))
                .await
                .expect("cancelled");
            assert_eq!(reason.message(), "navigated away");
            assert_eq!(job.status(), JobStatus::Cancelled);
            assert_eq!(counter.load(Ordering::SeqCst), 0);

            // Idempotent: a second cancel returns the original reason.
            let again = job.cancel(None).await.expect("idempotent");
            assert_eq!(again.message(), "navigated away");
        });
    }

    #[test]
    fn test_cancel_terminal_job_is_invalid() {
        tokio_test::block_on(async {
            let job = Job::new(1, "done", Vec::new(), JobOptions::new());
            job.run(RunOptions::new()).await.expect("run");

            let err = job.cancel(None).await.expect_err("terminal");
            assert!(matches!(
                err,
                JobError::InvalidStatus {
                    status: JobStatus::Done,
                    ..
                }
            ));
        });
    }

    #[test]
    fn test_cancel_while_doing_waits_for_unwind() {
        tokio_test::block_on(async {
            let reverts = Arc::new(AtomicUsize::new(0));
            let job = Job::new(
                1,
                "long",
                vec![
                    slow_compensated_step(5, Arc::clone(&reverts), json!("first")),
                    slow_compensated_step(40, Arc::clone(&reverts), json!("second")),
                    slow_compensated_step(5, Arc::clone(&reverts), json!("third")),
                ],
                JobOptions::new(),
            );

            let runner = {
                let job = Arc::clone(&job);
                tokio::spawn(async move { job.run(RunOptions::new()).await })
            };
            sleep(Duration::from_millis(20)).await;

            let reason = job
                .cancel(Some(CancelReason::explicit("user pressed stop")))
                .await
                .expect("cancelled");
            assert_eq!(reason.kind(), CancelKind::Explicit);
            // cancel() returned only after the unwind ran.
            assert_eq!(job.status(), JobStatus::Cancelled);
            assert_eq!(reverts.load(Ordering::SeqCst), 2);

            let run_err = runner.await.expect("join").expect_err("cancelled");
            assert!(matches!(run_err, JobError::Cancelled { .. }));
        });
    }

    #[test]
    fn test_step_failure_settles_failed_not_cancelled() {
        tokio_test::block_on(async {
            let job = Job::new(
                1,
                "broken",
                vec![steps::compute(|_results, _token| async move {
                    Err(StepError::failed("disk full"))
                })],
                JobOptions::new(),
            );

            let err = job.run(RunOptions::new()).await.expect_err("failed");
            match err {
                JobError::Step { index, message } => {
                    assert_eq!(index, 0);
                    assert_eq!(message, "disk full");
                }
                other => panic!("expected step failure, got {other:?}"),
            }
            assert_eq!(job.outcome(), Some(JobOutcome::Failed));
        });
    }

    #[test]
    fn test_dependency_failure_wraps_and_skips_steps() {
        tokio_test::block_on(async {
            let counter = Arc::new(AtomicUsize::new(0));
            let failing = Job::new(
                1,
                "dep",
                vec![steps::compute(|_results, _token| async move {
                    Err(StepError::failed("dep broke"))
                })],
                JobOptions::new(),
            );
            let dependent = Job::new(
                2,
                "main-work",
                vec![counting_step(Arc::clone(&counter), json!(null))],
                JobOptions::new(),
            );
            dependent.add_dependency(&failing).expect("edge");

            let waiter = {
                let dependent = Arc::clone(&dependent);
                tokio::spawn(async move { dependent.run(RunOptions::new()).await })
            };
            sleep(Duration::from_millis(10)).await;
            assert_eq!(dependent.status(), JobStatus::Waiting);

            let _ = failing.run(RunOptions::new()).await;
            let err = waiter.await.expect("join").expect_err("dependency error");
            match err {
                JobError::Dependency { id, cause } => {
                    assert_eq!(id, 1);
                    assert!(matches!(cause.as_ref(), JobError::Step { .. }));
                }
                other => panic!("expected dependency error, got {other:?}"),
            }
            assert_eq!(dependent.status(), JobStatus::Failed);
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn test_dependency_success_runs_steps_after_wait() {
        tokio_test::block_on(async {
            let dep = Job::new(
                1,
                "dep",
                vec![steps::compute(|_results, _token| async move {
                    sleep(Duration::from_millis(15)).await;
                    Ok(json!("dep-done"))
                })],
                JobOptions::new(),
            );
            let dependent = Job::new(
                2,
                "after",
                vec![steps::compute(|_results, _token| async move {
                    Ok(json!("after-done"))
                })],
                JobOptions::new(),
            );
            dependent.add_dependency(&dep).expect("edge");
            let mut rx = dependent.subscribe();

            let waiter = {
                let dependent = Arc::clone(&dependent);
                tokio::spawn(async move { dependent.run(RunOptions::new()).await })
            };
            sleep(Duration::from_millis(5)).await;
            dep.run(RunOptions::new()).await.expect("dep run");

            let results = waiter.await.expect("join").expect("results");
            assert_eq!(results, vec![json!("after-done")]);
            assert!(dependent.dependencies().is_empty());

            let names = collect_event_names(&mut rx);
            assert!(names.contains(&"dependencyremove"));
        });
    }

    #[test]
    fn test_cancel_while_waiting_settles_immediately() {
        tokio_test::block_on(async {
            let dep = Job::new(1, "never-settles", Vec::new(), JobOptions::new());
            let counter = Arc::new(AtomicUsize::new(0));
            let dependent = Job::new(
                2,
                "waiting",
                vec![counting_step(Arc::clone(&counter), json!(null))],
                JobOptions::new(),
            );
            dependent.add_dependency(&dep).expect("edge");

            let waiter = {
                let dependent = Arc::clone(&dependent);
                tokio::spawn(async move { dependent.run(RunOptions::new()).await })
            };
            sleep(Duration::from_millis(5)).await;
            assert_eq!(dependent.status(), JobStatus::Waiting);

            dependent.cancel(None).await.expect("cancelled");
            let err = waiter.await.expect("join").expect_err("cancelled");
            assert!(matches!(err, JobError::Cancelled { .. }));
            assert_eq!(counter.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn test_add_dependency_rejected_once_settled() {
        tokio_test::block_on(async {
            let job = Job::new(1, "settled", Vec::new(), JobOptions::new());
            job.run(RunOptions::new()).await.expect("run");

            let other = Job::new(2, "late", Vec::new(), JobOptions::new());
            let err = job.add_dependency(&other).expect_err("settled");
            assert!(matches!(err, JobError::InvalidStatus { .. }));
        });
    }

    #[test]
    fn test_settled_observable_by_many_waiters() {
        tokio_test::block_on(async {
            let job = Job::new(
                1,
                "shared",
                vec![steps::compute(|_results, _token| async move {
                    sleep(Duration::from_millis(10)).await;
                    Ok(json!("value"))
                })],
                JobOptions::new(),
            );

            let runner = {
                let job = Arc::clone(&job);
                tokio::spawn(async move { job.run(RunOptions::new()).await })
            };
            let (a, b) = tokio::join!(job.settled(), job.settled());
            assert_eq!(a.expect("a"), vec![json!("value")]);
            assert_eq!(b.expect("b"), vec![json!("value")]);
            runner.await.expect("join").expect("run");
        });
    }
}
