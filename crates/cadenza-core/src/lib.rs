//! # Cadenza Core
//!
//! Core abstractions for running fallible, abortable, multi-step operations:
//!
//! - cancellation controller/token pair with reason discrimination
//! - `CancelableFuture`: a settle-once future bound to its controller
//! - `TaskSeries`: an ordered step runner with reverse-order compensation
//! - `Goals`: goal sets for de-duplication and idempotence checks
//!
//! This crate does NOT care about:
//! - what a step actually performs (I/O, storage, rendering)
//! - how outcomes are displayed or persisted
//! - which operations run concurrently with which

pub mod cancel;
pub mod future;
pub mod goals;
pub mod series;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::cancel::{CancelHandle, CancelKind, CancelReason, CancelToken, CancelledError};
    pub use crate::future::{CancelableFuture, FutureState, Settler};
    pub use crate::goals::Goals;
    pub use crate::series::{
        steps, SeriesError, SeriesObserver, Step, StepError, TaskSeries,
    };
}

// Re-export key types at crate root
pub use cancel::{CancelHandle, CancelKind, CancelReason, CancelToken, CancelledError};
pub use future::{CancelableFuture, FutureState, Settler};
pub use goals::Goals;
pub use series::{SeriesError, SeriesObserver, Step, StepError, TaskSeries};
