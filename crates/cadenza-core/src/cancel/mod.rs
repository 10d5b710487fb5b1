//! Cancellation controller/token pair
//!
//! This module wraps `tokio_util`'s `CancellationToken` with a reason layer:
//! - `CancelHandle`: the controller side, cancels at most once with a reason
//! - `CancelToken`: the observer side, threaded through every async call
//! - `CancelReason` / `CancelKind`: the reason value with its name discriminator
//!
//! The `expired` kind is bookkeeping emitted by a settled future onto its own
//! controller; it is never a user-facing cancellation.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Discriminator for why a cancellation was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelKind {
    /// The owning future settled; the controller is retired, not aborted
    Expired,
    /// Caller-initiated cancellation
    Explicit,
    /// Deadline-initiated cancellation
    Timeout,
}

impl CancelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelKind::Expired => "expired",
            CancelKind::Explicit => "explicit",
            CancelKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for CancelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a controller was triggered
#[derive(Debug, Clone)]
pub struct CancelReason {
    kind: CancelKind,
    message: String,
}

impl CancelReason {
    /// Bookkeeping reason emitted when a settled future retires its controller
    pub fn expired() -> Self {
        Self {
            kind: CancelKind::Expired,
            message: "settled".to_string(),
        }
    }

    /// Caller-initiated cancellation with a message
    pub fn explicit(message: impl Into<String>) -> Self {
        Self {
            kind: CancelKind::Explicit,
            message: message.into(),
        }
    }

    /// Deadline-initiated cancellation
    pub fn timeout(after: Duration) -> Self {
        Self {
            kind: CancelKind::Timeout,
            message: format!("timed out after {}ms", after.as_millis()),
        }
    }

    pub fn kind(&self) -> CancelKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether this is the bookkeeping reason, not a user abort
    pub fn is_expiry(&self) -> bool {
        self.kind == CancelKind::Expired
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The abort error surfaced when an operation observes cancellation
#[derive(Debug, Clone, Error)]
#[error("cancelled ({reason})")]
pub struct CancelledError {
    pub reason: CancelReason,
}

#[derive(Debug)]
struct CancelShared {
    token: CancellationToken,
    reason: Mutex<Option<CancelReason>>,
}

/// Controller side of a cancellation pair
///
/// The first `cancel` wins; later calls are no-ops. Triggering wakes every
/// listener obtained through [`CancelToken::cancelled`].
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<CancelShared>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(CancelShared {
                token: CancellationToken::new(),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Trigger cancellation with the given reason. Returns false when the
    /// controller was already triggered.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut slot = self
                .shared
                .reason
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
        }
        self.shared.token.cancel();
        true
    }

    /// Retire the controller with the bookkeeping `expired` reason
    pub fn expire(&self) -> bool {
        self.cancel(CancelReason::expired())
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.shared
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Observer side of this controller
    pub fn token(&self) -> CancelToken {
        CancelToken {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Arm a timer that triggers this controller with a `timeout` reason.
    /// A controller that was already triggered by then is left untouched.
    pub fn cancel_after(&self, deadline: Duration) {
        let handle = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            handle.cancel(CancelReason::timeout(deadline));
        });
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer side of a cancellation pair
///
/// Steps and perform callbacks are expected to check this voluntarily; the
/// core never preempts running work.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<CancelShared>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    pub fn reason(&self) -> Option<CancelReason> {
        self.shared
            .reason
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Completes once the controller is triggered, with its reason
    pub async fn cancelled(&self) -> CancelReason {
        self.shared.token.cancelled().await;
        self.reason()
            .unwrap_or_else(|| CancelReason::explicit("cancelled"))
    }

    /// Voluntary checkpoint: error when cancellation has been requested
    pub fn ensure_active(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            let reason = self
                .reason()
                .unwrap_or_else(|| CancelReason::explicit("cancelled"));
            return Err(CancelledError { reason });
        }
        Ok(())
    }
}
