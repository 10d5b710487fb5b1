//! Jobs registry
//!
//! A constructor-injected index of live jobs. The registry allocates job ids,
//! performs de-duplication at creation (equal category, host, and goal set
//! means the new job mirrors the existing one instead of re-running its
//! steps), and offers filtered lookup. Jobs are added exactly once, at
//! construction, and are never removed automatically; pruning is the
//! caller's responsibility.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use futures_util::future::{join_all, try_join_all};
use serde_json::Value;
use uuid::Uuid;

use cadenza_core::cancel::CancelReason;
use cadenza_core::goals::Goals;
use cadenza_core::series::Step;

use crate::job::{Job, JobError, JobId, JobOptions, DEFAULT_CATEGORY, DEFAULT_EVENT_CAPACITY};

/// Configuration for a [`Jobs`] registry
#[derive(Debug, Clone)]
pub struct JobsConfig {
    /// Category assigned to jobs created without one
    pub default_category: String,
    /// Capacity of each job's event channel
    pub event_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            default_category: DEFAULT_CATEGORY.to_string(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Criteria for [`Jobs::filter`]; an absent criterion matches everything
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    categories: Option<Vec<String>>,
    names: Option<Vec<String>>,
    settled: Option<bool>,
    host: Option<String>,
    goals: Option<Goals>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(self, category: impl Into<String>) -> Self {
        self.with_categories(vec![category.into()])
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.with_names(vec![name.into()])
    }

    pub fn with_names(mut self, names: Vec<String>) -> Self {
        self.names = Some(names);
        self
    }

    pub fn settled(mut self, settled: bool) -> Self {
        self.settled = Some(settled);
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Requires an exact key/value match; a job with no goal set never matches
    pub fn with_goals(mut self, goals: Goals) -> Self {
        self.goals = Some(goals);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        if let Some(categories) = &self.categories {
            if !categories.iter().any(|c| c == job.category()) {
                return false;
            }
        }
        if let Some(names) = &self.names {
            if !names.iter().any(|n| n == job.name()) {
                return false;
            }
        }
        if let Some(settled) = self.settled {
            if job.status().is_settled() != settled {
                return false;
            }
        }
        if let Some(host) = &self.host {
            if job.host() != Some(host.as_str()) {
                return false;
            }
        }
        if let Some(goals) = &self.goals {
            match job.goals() {
                Some(job_goals) => {
                    if !job_goals.matches(goals) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// Keyed store of live jobs
pub struct Jobs {
    registry_id: Uuid,
    next_id: AtomicU64,
    jobs: RwLock<HashMap<JobId, Arc<Job>>>,
    config: JobsConfig,
}

impl Jobs {
    pub fn new() -> Self {
        Self::with_config(JobsConfig::default())
    }

    pub fn with_config(config: JobsConfig) -> Self {
        Self {
            registry_id: Uuid::new_v4(),
            next_id: AtomicU64::new(0),
            jobs: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Create and register a job.
    ///
    /// When an unsettled job with the same category, host, and goal set
    /// already exists, the new job depends on it and adopts its settlement
    /// without executing its own steps.
    pub fn create(
        &self,
        name: impl Into<String>,
        steps: Vec<Arc<dyn Step>>,
        options: JobOptions,
    ) -> Arc<Job> {
        let mut options = options;
        if options.category.is_none() {
            options.category = Some(self.config.default_category.clone());
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Job::with_registry(
            id,
            name,
            steps,
            options,
            Some(self.registry_id),
            self.config.event_capacity,
        );

        let duplicate = match job.goals() {
            Some(goals) => self
                .read_jobs()
                .values()
                .find(|candidate| {
                    !candidate.status().is_settled()
                        && candidate.category() == job.category()
                        && candidate.host() == job.host()
                        && candidate.goals().is_some_and(|g| g.matches(goals))
                })
                .cloned(),
            None => None,
        };

        self.write_jobs().insert(id, Arc::clone(&job));

        if let Some(original) = duplicate {
            match job.add_dependency(&original) {
                Ok(()) => {
                    job.mark_mirror_of(original.id());
                    tracing::debug!(
                        job_id = job.id(),
                        original = original.id(),
                        category = job.category(),
                        "job coalesced onto equivalent in-flight job"
                    );
                    let mirror = Arc::clone(&job);
                    tokio::spawn(async move {
                        let settlement = original.wait_settlement().await;
                        mirror.adopt_settlement(settlement);
                    });
                }
                Err(error) => {
                    tracing::warn!(
                        job_id = job.id(),
                        error = %error,
                        "failed to link duplicate job"
                    );
                }
            }
        }

        job
    }

    pub fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.read_jobs().get(&id).cloned()
    }

    /// All jobs matching the filter
    pub fn filter(&self, filter: &JobFilter) -> Vec<Arc<Job>> {
        self.read_jobs()
            .values()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_jobs().is_empty()
    }

    /// Manual pruning; the registry never removes a job on its own
    pub fn remove(&self, id: JobId) -> Option<Arc<Job>> {
        self.write_jobs().remove(&id)
    }

    /// Await every job's settlement concurrently, failing on the first error
    pub async fn wait_for(jobs: &[Arc<Job>]) -> Result<Vec<Vec<Value>>, JobError> {
        try_join_all(jobs.iter().map(|job| job.settled())).await
    }

    /// Cancel every job concurrently; one result per job, in order
    pub async fn cancel_all(
        jobs: &[Arc<Job>],
        reason: Option<CancelReason>,
    ) -> Vec<Result<CancelReason, JobError>> {
        join_all(jobs.iter().map(|job| {
            let reason = reason.clone();
            async move { job.cancel(reason).await }
        }))
        .await
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Arc<Job>>> {
        self.jobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Jobs {
    fn default() -> Self {
        Self::new()
    }
}
