//! # Cadenza Jobs
//!
//! Job layer on top of `cadenza-core`:
//!
//! - `Job`: status lifecycle, dependency edges, settlement propagation
//! - `JobEvent`: per-job notification channel for UI binding
//! - `Jobs`: registry with creation-time de-duplication and filtered lookup
//!
//! This crate does NOT care about:
//! - how job progress is rendered
//! - what the steps themselves touch

pub mod events;
pub mod job;
pub mod registry;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::events::JobEvent;
    pub use crate::job::{
        Job, JobError, JobId, JobOptions, JobOutcome, JobStatus, RunOptions, Settlement,
        DEFAULT_CATEGORY,
    };
    pub use crate::registry::{JobFilter, Jobs, JobsConfig};
}

// Re-export key types at crate root
pub use events::JobEvent;
pub use job::{
    Job, JobError, JobId, JobOptions, JobOutcome, JobStatus, RunOptions, Settlement,
    DEFAULT_CATEGORY,
};
pub use registry::{JobFilter, Jobs, JobsConfig};
