//! Counter-based wait group for draining in-flight work.
//!
//! Workers hold a [`WaitGuard`]; [`WaitGroup::wait`] resolves once every
//! guard has dropped. Used by the server to drain connections and stream
//! workers on graceful stop.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Tracks outstanding work via RAII guards.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: AtomicUsize,
    notify: Notify,
}

impl WaitGroup {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register one unit of in-flight work.
    pub fn guard(self: &Arc<Self>) -> WaitGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        WaitGuard {
            group: Arc::clone(self),
        }
    }

    /// Current number of outstanding guards.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until every guard has dropped.
    pub async fn wait(&self) {
        loop {
            let released = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            released.await;
        }
    }
}

/// RAII handle for one unit of in-flight work.
pub struct WaitGuard {
    group: Arc<WaitGroup>,
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.group.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.group.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_with_no_guards_returns_immediately() {
        let wg = WaitGroup::new();
        wg.wait().await;
    }

    #[tokio::test]
    async fn test_wait_drains_outstanding_guards() {
        let wg = WaitGroup::new();

        for _ in 0..4 {
            let guard = wg.guard();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                drop(guard);
            });
        }

        tokio::time::timeout(Duration::from_secs(1), wg.wait())
            .await
            .expect("wait group never drained");
        assert_eq!(wg.count(), 0);
    }
}
