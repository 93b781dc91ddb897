use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Why a worker asked for the whole epoch to be torn down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// Probe instances of `series` could not be reclaimed.
    ReclaimExceeded { series: String, iterations: u32 },
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::ReclaimExceeded { series, iterations } => write!(
                f,
                "{series}: probe instances still active after {iterations} reclaim iterations"
            ),
        }
    }
}

/// Shared between every worker of an epoch; the first request wins and cancels the epoch.
#[derive(Clone)]
pub struct RestartHandle {
    inner: Arc<RestartInner>,
}

struct RestartInner {
    triggered: AtomicBool,
    epoch_shutdown: CancellationToken,
    reason: Mutex<Option<RestartReason>>,
    notify: Notify,
}

impl RestartHandle {
    pub fn new(epoch_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(RestartInner {
                triggered: AtomicBool::new(false),
                epoch_shutdown,
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Requests an epoch restart. Returns `true` for the request that actually triggered it.
    pub fn request(&self, reason: RestartReason) -> bool {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!(reason = %reason, "restart already requested");
            return false;
        }

        tracing::warn!(reason = %reason, "restart requested; stopping all measurement workers");
        {
            let mut slot = lock(&self.inner.reason);
            if slot.is_none() {
                *slot = Some(reason);
            }
        }

        self.inner.epoch_shutdown.cancel();
        self.inner.notify.notify_waiters();
        true
    }

    pub fn triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<RestartReason> {
        lock(&self.inner.reason).clone()
    }

    /// Resolves once a restart has been requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.triggered() {
                return;
            }
            notified.await;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
