//! # Cadenza Runtime
//!
//! Concurrent-action coordination on top of `cadenza-core`: at most one
//! in-flight attempt per action category, with attach (coalesce), supersede
//! (cancel), and skip (idempotence) semantics.
//!
//! The coordinator sits beside the job layer, not inside it; feature code
//! that wants at-most-one-in-flight semantics without a full job reaches for
//! it directly.

pub mod coordinator;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::coordinator::{
        payload_bag, ActionCoordinator, ActionError, CoordinateOptions, PayloadBag,
    };
}

// Re-export key types at crate root
pub use coordinator::{payload_bag, ActionCoordinator, ActionError, CoordinateOptions, PayloadBag};
