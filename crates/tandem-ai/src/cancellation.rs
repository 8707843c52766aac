use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Observer half of a cancellation pair. Cloneable; adapters race it
/// against in-flight network futures.
#[derive(Clone)]
pub struct CancelSignal {
    inner: Arc<CancelInner>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.inner.notify.notified().await;
    }
}

pub struct CancelController {
    signal: CancelSignal,
}

impl CancelController {
    pub fn new() -> Self {
        Self {
            signal: CancelSignal {
                inner: Arc::new(CancelInner {
                    cancelled: AtomicBool::new(false),
                    notify: Notify::new(),
                }),
            },
        }
    }

    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    pub fn cancel(&self) {
        self.signal.inner.cancelled.store(true, Ordering::SeqCst);
        self.signal.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

impl Default for CancelController {
    fn default() -> Self {
        Self::new()
    }
}
