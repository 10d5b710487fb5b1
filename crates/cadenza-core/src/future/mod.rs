//! CancelableFuture - settle-once future bound to a cancellation controller
//!
//! A `CancelableFuture` couples a shared, settle-once result cell with exactly
//! one `CancelHandle`. Settling retires the controller with the bookkeeping
//! `expired` reason so listeners keyed on the controller always fire; a real
//! cancellation (explicit or timeout) rejects a still-pending future.

use std::sync::Arc;

use tokio::sync::watch;

use crate::cancel::{CancelHandle, CancelReason, CancelToken, CancelledError};

/// Settlement state of a [`CancelableFuture`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    Pending,
    Fulfilled,
    Rejected,
}

type Cell<T, E> = Arc<watch::Sender<Option<Result<T, E>>>>;

/// Settle-once resolver handed to the executor closure
pub struct Settler<T, E> {
    cell: Cell<T, E>,
    handle: CancelHandle,
}

impl<T, E> Clone for Settler<T, E> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            handle: self.handle.clone(),
        }
    }
}

impl<T, E> Settler<T, E> {
    /// Fulfill the future. Returns false when it had already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Reject the future. Returns false when it had already settled.
    pub fn reject(&self, error: E) -> bool {
        self.settle(Err(error))
    }

    pub fn is_settled(&self) -> bool {
        self.cell.borrow().is_some()
    }

    fn settle(&self, outcome: Result<T, E>) -> bool {
        let mut pending = Some(outcome);
        let mut settled = false;
        self.cell.send_modify(|slot| {
            if slot.is_none() {
                *slot = pending.take();
                settled = true;
            }
        });
        if settled {
            // Retire the controller so listeners keyed on it always fire.
            self.handle.expire();
        }
        settled
    }
}

/// Future wrapping a computation whose result is tied to a cancellation
/// controller; resolves or rejects exactly once
pub struct CancelableFuture<T, E> {
    cell: Cell<T, E>,
    handle: CancelHandle,
}

impl<T, E> Clone for CancelableFuture<T, E> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            handle: self.handle.clone(),
        }
    }
}

impl<T, E> CancelableFuture<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<CancelledError> + 'static,
{
    /// Run `executor` synchronously with a settler and the controller's token.
    /// A private controller is created when `handle` is `None`. When
    /// `handle_cancellation` is true, triggering the controller rejects a
    /// still-pending future with the cancellation reason.
    pub fn new<F>(executor: F, handle: Option<CancelHandle>, handle_cancellation: bool) -> Self
    where
        F: FnOnce(Settler<T, E>, CancelToken),
    {
        let (future, settler) = Self::channel_with(handle, handle_cancellation);
        let token = future.token();
        executor(settler, token);
        future
    }

    /// Pair-style construction for drivers that settle later
    pub fn channel(handle: Option<CancelHandle>) -> (Self, Settler<T, E>) {
        Self::channel_with(handle, true)
    }

    pub fn channel_with(
        handle: Option<CancelHandle>,
        handle_cancellation: bool,
    ) -> (Self, Settler<T, E>) {
        let handle = handle.unwrap_or_default();
        let (sender, _) = watch::channel(None);
        let cell: Cell<T, E> = Arc::new(sender);
        if handle_cancellation {
            Self::watch_cancellation(Arc::clone(&cell), handle.clone());
        }
        let future = Self {
            cell: Arc::clone(&cell),
            handle: handle.clone(),
        };
        let settler = Settler { cell, handle };
        (future, settler)
    }

    /// Trigger the controller with an `explicit` reason
    pub fn cancel(&self) -> bool {
        self.handle.cancel(CancelReason::explicit("cancelled"))
    }

    pub fn cancel_with(&self, reason: CancelReason) -> bool {
        self.handle.cancel(reason)
    }

    pub fn state(&self) -> FutureState {
        match self.cell.borrow().as_ref() {
            None => FutureState::Pending,
            Some(Ok(_)) => FutureState::Fulfilled,
            Some(Err(_)) => FutureState::Rejected,
        }
    }

    pub fn handle(&self) -> &CancelHandle {
        &self.handle
    }

    pub fn token(&self) -> CancelToken {
        self.handle.token()
    }

    /// Wait for settlement; any number of holders may wait
    pub async fn settled(&self) -> Result<T, E> {
        let mut rx = self.cell.subscribe();
        loop {
            let current = self.cell.borrow().as_ref().cloned();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(E::from(CancelledError {
                    reason: CancelReason::expired(),
                }));
            }
        }
    }

    fn watch_cancellation(cell: Cell<T, E>, handle: CancelHandle) {
        let token = handle.token();
        tokio::spawn(async move {
            let mut rx = cell.subscribe();
            tokio::select! {
                reason = token.cancelled() => {
                    cell.send_modify(|slot| {
                        if slot.is_none() {
                            *slot = Some(Err(E::from(CancelledError { reason })));
                        }
                    });
                }
                _ = rx.wait_for(|slot| slot.is_some()) => {}
            }
        });
    }
}
