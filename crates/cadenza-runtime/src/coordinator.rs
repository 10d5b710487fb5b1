//! Concurrent-action coordination
//!
//! `ActionCoordinator` keeps, per action category, the single in-flight
//! attempt: its goal set, cancellation controller, shared future, and a
//! payload bag for late-arriving callers. A new request either attaches to an
//! in-flight attempt with equal goals, supersedes one with different goals,
//! or skips redundant work when the state already matches the desired goals.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;

use cadenza_core::cancel::{CancelHandle, CancelReason, CancelToken, CancelledError};
use cadenza_core::future::CancelableFuture;
use cadenza_core::goals::Goals;

/// Error surfaced by a coordinated action
#[derive(Debug, Clone, Error)]
pub enum ActionError {
    /// The attempt was cancelled, e.g. superseded by a newer request
    #[error("action cancelled ({reason})")]
    Cancelled { reason: CancelReason },
    /// The perform callback failed
    #[error("action failed: {0}")]
    Failed(String),
}

impl ActionError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

impl From<CancelledError> for ActionError {
    fn from(error: CancelledError) -> Self {
        Self::Cancelled {
            reason: error.reason,
        }
    }
}

/// Shared bag callers stash data into for late-arriving attachers
pub type PayloadBag = Arc<Mutex<HashMap<String, Value>>>;

/// Create an empty payload bag
pub fn payload_bag() -> PayloadBag {
    Arc::new(Mutex::new(HashMap::new()))
}

fn lock_bag(bag: &PayloadBag) -> MutexGuard<'_, HashMap<String, Value>> {
    bag.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn copy_payload(source: &PayloadBag, target: &PayloadBag) {
    if Arc::ptr_eq(source, target) {
        return;
    }
    let entries: Vec<(String, Value)> = lock_bag(source)
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    let mut target = lock_bag(target);
    for (key, value) in entries {
        target.insert(key, value);
    }
}

/// Options for [`ActionCoordinator::coordinate`]
#[derive(Debug, Clone, Default)]
pub struct CoordinateOptions {
    /// Run even when the current state already matches the desired goals
    pub force: bool,
    /// Controller for the new attempt; a private one is created when absent
    pub handle: Option<CancelHandle>,
    /// Caller's payload bag; filled from the in-flight bag when attaching
    pub payload: Option<PayloadBag>,
}

impl CoordinateOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn with_handle(mut self, handle: CancelHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn with_payload(mut self, payload: PayloadBag) -> Self {
        self.payload = Some(payload);
        self
    }
}

struct CategoryEntry {
    generation: u64,
    goals: Goals,
    handle: CancelHandle,
    attempt: CancelableFuture<Goals, ActionError>,
    payload: PayloadBag,
    active: bool,
}

/// Process-scoped map from action category to its current attempt
///
/// Constructor-injected; clones share the same state.
#[derive(Clone, Default)]
pub struct ActionCoordinator {
    entries: Arc<Mutex<HashMap<String, CategoryEntry>>>,
}

impl ActionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `perform` for `category` with at-most-one-in-flight semantics.
    ///
    /// An active attempt with goals equal to `new_goals` absorbs this call
    /// (the caller's payload bag is filled from the in-flight one and the
    /// shared future is awaited). An active attempt with different goals is
    /// superseded: its controller is cancelled and a new generation replaces
    /// it. Without `force`, a request whose goals already equal
    /// `current_goals` resolves immediately without invoking `perform`.
    pub async fn coordinate<F, Fut>(
        &self,
        category: &str,
        new_goals: Goals,
        current_goals: &Goals,
        perform: F,
        options: CoordinateOptions,
    ) -> Result<Goals, ActionError>
    where
        F: FnOnce(CancelToken) -> Fut,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        let attached = {
            let entries = self.lock_entries();
            match entries.get(category) {
                Some(entry) if entry.active => {
                    if entry.goals.matches(&new_goals) {
                        if let Some(bag) = &options.payload {
                            copy_payload(&entry.payload, bag);
                        }
                        Some(entry.attempt.clone())
                    } else {
                        entry
                            .handle
                            .cancel(CancelReason::explicit("superseded by a newer attempt"));
                        tracing::debug!(category, "superseded in-flight action");
                        None
                    }
                }
                _ => None,
            }
        };
        if let Some(attempt) = attached {
            tracing::debug!(category, "attached to in-flight action");
            return attempt.settled().await;
        }

        if !options.force && new_goals.matches(current_goals) {
            tracing::debug!(category, "goals already satisfied, skipping");
            return Ok(current_goals.clone());
        }

        let handle = options.handle.unwrap_or_default();
        let payload = options.payload.unwrap_or_else(payload_bag);
        let (attempt, settler) = CancelableFuture::channel(Some(handle.clone()));
        let generation = {
            let mut entries = self.lock_entries();
            let generation = entries
                .get(category)
                .map(|entry| entry.generation + 1)
                .unwrap_or(1);
            entries.insert(
                category.to_string(),
                CategoryEntry {
                    generation,
                    goals: new_goals.clone(),
                    handle: handle.clone(),
                    attempt: attempt.clone(),
                    payload,
                    active: true,
                },
            );
            generation
        };

        let attempt_future = perform(handle.token());
        let coordinator = self.clone();
        let category_owned = category.to_string();
        let resolved_goals = new_goals;
        tokio::spawn(async move {
            // The coordinator itself observes the outcome so a rejection is
            // consumed even when no external caller awaits it.
            match attempt_future.await {
                Ok(()) => {
                    settler.resolve(resolved_goals);
                }
                Err(error) => {
                    tracing::warn!(
                        category = %category_owned,
                        error = %error,
                        "concurrent action attempt failed"
                    );
                    settler.reject(error);
                }
            }
            coordinator.finish(&category_owned, generation);
        });

        attempt.settled().await
    }

    /// Whether an attempt is currently in flight for the category
    pub fn is_active(&self, category: &str) -> bool {
        self.lock_entries()
            .get(category)
            .map(|entry| entry.active)
            .unwrap_or(false)
    }

    /// Generation counter of the category's current entry
    pub fn generation(&self, category: &str) -> Option<u64> {
        self.lock_entries().get(category).map(|entry| entry.generation)
    }

    /// The current entry's payload bag
    pub fn payload(&self, category: &str) -> Option<PayloadBag> {
        self.lock_entries()
            .get(category)
            .map(|entry| Arc::clone(&entry.payload))
    }

    /// Deactivate the entry for a finished attempt, unless a newer generation
    /// superseded it in the meantime.
    fn finish(&self, category: &str, generation: u64) {
        let mut entries = self.lock_entries();
        match entries.get_mut(category) {
            Some(entry) if entry.generation == generation => {
                entry.active = false;
            }
            Some(entry) => {
                tracing::debug!(
                    category,
                    stale = generation,
                    current = entry.generation,
                    "stale action attempt finished after being superseded"
                );
            }
            None => {}
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<String, CategoryEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
