use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Notify;

#[derive(Default)]
struct Counts {
    current: AtomicUsize,
    peak: AtomicUsize,
    drained: Notify,
}

/// Number of instance executions currently running, shared by every dispatch path.
///
/// Counting is tied to [`InFlightGuard`]: the count goes up in [`enter`](Self::enter)
/// and down when the guard drops, whether the execution succeeded, failed or panicked.
#[derive(Clone, Default)]
pub struct InFlightCounter {
    counts: Arc<Counts>,
}

impl InFlightCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> InFlightGuard {
        let now = self.counts.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.counts.peak.fetch_max(now, Ordering::SeqCst);
        InFlightGuard {
            counts: self.counts.clone(),
        }
    }

    pub fn current(&self) -> usize {
        self.counts.current.load(Ordering::SeqCst)
    }

    /// Highest value observed since creation or the last [`reset_peak`](Self::reset_peak).
    pub fn peak(&self) -> usize {
        self.counts.peak.load(Ordering::SeqCst)
    }

    pub fn reset_peak(&self) {
        self.counts.peak.store(self.current(), Ordering::SeqCst);
    }

    /// Resolve once the count is zero.
    pub async fn wait_idle(&self) {
        loop {
            let drained = self.counts.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();
            if self.current() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Decrements the owning counter on drop.
pub struct InFlightGuard {
    counts: Arc<Counts>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.counts.current.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counts.drained.notify_waiters();
        }
    }
}
