use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::Notify;

/// Count of connection handling tasks still running, used to drain on shutdown.
#[derive(Debug, Clone, Default)]
pub struct ActiveConnections {
    inner: Arc<Counter>,
}

#[derive(Debug, Default)]
struct Counter {
    count: AtomicUsize,
    idle: Notify,
}

/// RAII guard held by a handling task; decrements the count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    inner: Arc<Counter>,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new handling task. Called by the accept loop before spawning.
    pub fn track(&self) -> ConnectionGuard {
        self.inner.count.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.load(Ordering::Acquire)
    }

    /// Waits until no handling task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Like [`wait_idle`](Self::wait_idle) but gives up after `timeout`.
    /// Returns `false` when tasks were still running at the deadline.
    pub async fn wait_idle_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_idle()).await.is_ok()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}
