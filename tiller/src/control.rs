//! Cooperative cancellation and pause primitives.
//!
//! Every agent owns a root [`CancelToken`]; provider calls, tool
//! executions, and subscription writers hold children of it. Cancelling
//! the root reaches every child without polling loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Notify, watch};

#[derive(Debug)]
struct Shared {
    flag: AtomicBool,
    notify: Notify,
    parent: Option<Arc<Shared>>,
}

/// A cancellation token with hierarchical propagation.
///
/// Cloning shares the same token; [`CancelToken::child`] creates a token
/// that observes its parent's cancellation but can also be cancelled
/// independently.
#[derive(Debug, Clone)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Create a new root token.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                parent: None,
            }),
        }
    }

    /// Create a child token. Cancelling the parent cancels the child;
    /// cancelling the child leaves the parent untouched.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            shared: Arc::new(Shared {
                flag: AtomicBool::new(false),
                notify: Notify::new(),
                parent: Some(Arc::clone(&self.shared)),
            }),
        }
    }

    /// Cancel this token and every child derived from it.
    pub fn cancel(&self) {
        self.shared.flag.store(true, Ordering::SeqCst);
        self.shared.notify.notify_waiters();
    }

    /// Returns `true` if this token or any ancestor has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        let mut cur = Some(&self.shared);
        while let Some(shared) = cur {
            if shared.flag.load(Ordering::SeqCst) {
                return true;
            }
            cur = shared.parent.as_ref();
        }
        false
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut chain = Vec::new();
        let mut cur = Some(&self.shared);
        while let Some(shared) = cur {
            chain.push(Arc::clone(shared));
            cur = shared.parent.as_ref();
        }

        loop {
            // Register waiters before checking the flag so a concurrent
            // `cancel` cannot slip between check and sleep.
            let mut waiters: Vec<_> = chain
                .iter()
                .map(|s| Box::pin(s.notify.notified()))
                .collect();
            for waiter in &mut waiters {
                waiter.as_mut().enable();
            }
            if self.is_cancelled() {
                return;
            }
            let _ = futures::future::select_all(waiters).await;
        }
    }
}

/// Sender half of a pause gate. Owned by the agent control plane.
#[derive(Debug)]
pub struct PauseController {
    tx: watch::Sender<bool>,
}

/// Receiver half of a pause gate. Held at every loop suspension point.
#[derive(Debug, Clone)]
pub struct PauseGate {
    rx: watch::Receiver<bool>,
}

/// Create a linked pause controller/gate pair. Initially running.
#[must_use]
pub fn pause_gate() -> (PauseController, PauseGate) {
    let (tx, rx) = watch::channel(false);
    (PauseController { tx }, PauseGate { rx })
}

impl PauseController {
    /// Suspend holders of the gate at their next checkpoint.
    pub fn pause(&self) {
        let _ = self.tx.send(true);
    }

    /// Release the gate.
    pub fn resume(&self) {
        let _ = self.tx.send(false);
    }

    /// Returns `true` if the gate is currently closed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }
}

impl PauseGate {
    /// Returns `true` if the gate is currently closed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until the gate is open. Returns immediately when running.
    pub async fn wait_ready(&mut self) {
        while *self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                // Controller dropped: treat as running.
                return;
            }
        }
    }
}
