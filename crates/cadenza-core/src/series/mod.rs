//! Compensating task series
//!
//! `TaskSeries` executes an ordered list of steps, accumulating each step's
//! resolved value. A step is either a plain computation or a perform/revert
//! pair; on failure or cancellation the reverts of completed compensated
//! steps run in reverse order before the original cause is surfaced.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use crate::cancel::{CancelReason, CancelToken, CancelledError};

/// Error returned by a step's perform or revert
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// The step observed cancellation through its token
    #[error("{0}")]
    Cancelled(#[from] CancelledError),
    /// The step failed
    #[error("{message}")]
    Failed { message: String },
}

impl StepError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

impl From<String> for StepError {
    fn from(message: String) -> Self {
        Self::Failed { message }
    }
}

impl From<&str> for StepError {
    fn from(message: &str) -> Self {
        Self::Failed {
            message: message.to_string(),
        }
    }
}

/// Terminal outcome of a series run that did not complete
#[derive(Debug, Clone, Error)]
pub enum SeriesError {
    /// Cancellation was requested; completed steps were unwound
    #[error("series cancelled ({reason})")]
    Cancelled { reason: CancelReason },
    /// A step failed; completed steps were unwound
    #[error("step {index} failed: {message}")]
    Step { index: usize, message: String },
}

/// One unit of work in a series
///
/// `perform` receives the accumulated results of all prior steps and the
/// series token. A compensated step additionally records an undo entry;
/// `revert` receives the accumulated results and the step's own value.
#[async_trait]
pub trait Step: Send + Sync {
    async fn perform(&self, results: &[Value], token: &CancelToken) -> Result<Value, StepError>;

    async fn revert(&self, _results: &[Value], _value: &Value) -> Result<(), StepError> {
        Ok(())
    }

    /// Whether a successful perform records an undo entry
    fn is_compensated(&self) -> bool {
        false
    }
}

/// Hooks driven while a series runs; every method defaults to a no-op.
/// `on_step_start` feeds progress reporting, the unwind hooks let a caller
/// observe compensation without owning the run.
#[async_trait]
pub trait SeriesObserver: Send + Sync {
    async fn on_step_start(&self, _index: usize, _total: usize) {}

    /// Called once when the series enters its unwind, before any revert runs
    async fn on_unwind_start(&self, _cause: &SeriesError) {}

    /// Revert errors are reported here instead of replacing the original cause
    async fn on_revert_error(&self, _index: usize, _message: &str) {}
}

type PerformFn =
    Box<dyn Fn(Vec<Value>, CancelToken) -> BoxFuture<'static, Result<Value, StepError>> + Send + Sync>;
type RevertFn =
    Box<dyn Fn(Vec<Value>, Value) -> BoxFuture<'static, Result<(), StepError>> + Send + Sync>;

struct ComputeStep {
    perform: PerformFn,
}

#[async_trait]
impl Step for ComputeStep {
    async fn perform(&self, results: &[Value], token: &CancelToken) -> Result<Value, StepError> {
        (self.perform)(results.to_vec(), token.clone()).await
    }
}

struct CompensatedStep {
    perform: PerformFn,
    revert: RevertFn,
}

#[async_trait]
impl Step for CompensatedStep {
    async fn perform(&self, results: &[Value], token: &CancelToken) -> Result<Value, StepError> {
        (self.perform)(results.to_vec(), token.clone()).await
    }

    async fn revert(&self, results: &[Value], value: &Value) -> Result<(), StepError> {
        (self.revert)(results.to_vec(), value.clone()).await
    }

    fn is_compensated(&self) -> bool {
        true
    }
}

/// Closure adapters for building steps
pub mod steps {
    use super::*;

    /// A plain computation; contributes no undo entry
    pub fn compute<F, Fut>(perform: F) -> Arc<dyn Step>
    where
        F: Fn(Vec<Value>, CancelToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, StepError>> + Send + 'static,
    {
        Arc::new(ComputeStep {
            perform: Box::new(move |results, token| Box::pin(perform(results, token))),
        })
    }

    /// A perform/revert pair; a successful perform records an undo entry
    pub fn compensated<P, PF, R, RF>(perform: P, revert: R) -> Arc<dyn Step>
    where
        P: Fn(Vec<Value>, CancelToken) -> PF + Send + Sync + 'static,
        PF: Future<Output = Result<Value, StepError>> + Send + 'static,
        R: Fn(Vec<Value>, Value) -> RF + Send + Sync + 'static,
        RF: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        Arc::new(CompensatedStep {
            perform: Box::new(move |results, token| Box::pin(perform(results, token))),
            revert: Box::new(move |results, value| Box::pin(revert(results, value))),
        })
    }
}

/// Sequential runner with reverse-order compensation
#[derive(Default)]
pub struct TaskSeries {
    observer: Option<Arc<dyn SeriesObserver>>,
    initial_results: Vec<Value>,
}

impl TaskSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn SeriesObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Seed the accumulated results visible to the first step
    pub fn with_initial_results(mut self, results: Vec<Value>) -> Self {
        self.initial_results = results;
        self
    }

    /// Execute `steps` strictly in order under `token`.
    ///
    /// The returned future completes only after any unwind has finished, so
    /// awaiting it is awaiting the revert chain too. On success the result
    /// array holds one entry per step, in order, after the initial results.
    pub async fn run(
        &self,
        steps: &[Arc<dyn Step>],
        token: &CancelToken,
    ) -> Result<Vec<Value>, SeriesError> {
        let total = steps.len();
        let mut results = self.initial_results.clone();
        let mut undo: Vec<(usize, Arc<dyn Step>, Value)> = Vec::new();

        for (index, step) in steps.iter().enumerate() {
            // A cancellation requested earlier means this step never starts.
            if token.is_cancelled() {
                let reason = token
                    .reason()
                    .unwrap_or_else(|| CancelReason::explicit("cancelled"));
                let cause = SeriesError::Cancelled { reason };
                return Err(self.unwind(cause, &results, &mut undo).await);
            }

            if let Some(observer) = &self.observer {
                observer.on_step_start(index, total).await;
            }
            tracing::debug!(index, total, "series step starting");

            match step.perform(&results, token).await {
                Ok(value) => {
                    if step.is_compensated() {
                        undo.push((index, Arc::clone(step), value.clone()));
                    }
                    results.push(value);
                }
                Err(StepError::Cancelled(cancelled)) => {
                    let cause = SeriesError::Cancelled {
                        reason: cancelled.reason,
                    };
                    return Err(self.unwind(cause, &results, &mut undo).await);
                }
                Err(StepError::Failed { message }) => {
                    tracing::warn!(index, error = %message, "series step failed");
                    let cause = SeriesError::Step { index, message };
                    return Err(self.unwind(cause, &results, &mut undo).await);
                }
            }
        }

        Ok(results)
    }

    /// Run recorded reverts most-recently-completed first; revert errors are
    /// logged and reported, never raised in place of `cause`.
    async fn unwind(
        &self,
        cause: SeriesError,
        results: &[Value],
        undo: &mut Vec<(usize, Arc<dyn Step>, Value)>,
    ) -> SeriesError {
        if let Some(observer) = &self.observer {
            observer.on_unwind_start(&cause).await;
        }
        while let Some((index, step, value)) = undo.pop() {
            if let Err(error) = step.revert(results, &value).await {
                let message = error.to_string();
                tracing::warn!(index, error = %message, "revert failed during unwind");
                if let Some(observer) = &self.observer {
                    observer.on_revert_error(index, &message).await;
                }
            }
        }
        cause
    }
}
