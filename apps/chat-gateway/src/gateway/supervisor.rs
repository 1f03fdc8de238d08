//! Process-wide connection accounting and shutdown coordination.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{watch, Notify};

pub struct Supervisor {
    active: AtomicUsize,
    max_connections: Option<usize>,
    shutdown_tx: watch::Sender<bool>,
    drained: Notify,
}

/// Proof of admission. Dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    supervisor: Arc<Supervisor>,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        if self.supervisor.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.supervisor.drained.notify_waiters();
        }
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("active", &self.active())
            .field("max_connections", &self.max_connections)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl Supervisor {
    /// `None` means no connection bound.
    pub fn new(max_connections: Option<usize>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            active: AtomicUsize::new(0),
            max_connections,
            shutdown_tx,
            drained: Notify::new(),
        }
    }

    /// Reserve a connection slot, or `None` when full or shutting down.
    pub fn try_admit(self: &Arc<Self>) -> Option<ConnectionPermit> {
        if self.is_shutting_down() {
            return None;
        }
        let limit = self.max_connections.unwrap_or(usize::MAX);
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .ok()?;

        Some(ConnectionPermit {
            supervisor: self.clone(),
        })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Receiver that flips to `true` once shutdown begins.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn begin_shutdown(&self) {
        if !self.shutdown_tx.send_replace(true) {
            tracing::info!(active = self.active(), "shutdown started; closing connections");
        }
    }

    /// Wait up to `grace` for every permit to be released. Returns whether
    /// the process drained in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.drained.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.active() == 0 {
                    return;
                }
                notified.await;
            }
        };

        let drained = tokio::time::timeout(grace, wait).await.is_ok();
        if !drained {
            tracing::warn!(
                remaining = self.active(),
                grace_secs = grace.as_secs(),
                "connections still open after grace period"
            );
        }
        drained
    }

    /// Run one connection task while holding its permit. A panic inside the
    /// task is logged and still releases the slot.
    pub async fn run<F>(permit: ConnectionPermit, task: F)
    where
        F: Future<Output = ()>,
    {
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            tracing::error!("connection task panicked");
        }
        drop(permit);
    }
}
