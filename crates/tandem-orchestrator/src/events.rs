use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tandem_ai::{CancelController, CancelSignal, StreamEvent};
use tracing::warn;

use crate::pipeline::PipelineStatus;

/// Everything the core publishes toward the presentation layer. Stream
/// events for one response are delivered in the exact order produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    MessageAdded {
        thread_id: String,
        message_id: String,
    },
    MessageUpdated {
        thread_id: String,
        message_id: String,
    },
    Stream {
        thread_id: String,
        event: StreamEvent,
    },
    Typing {
        thread_id: String,
        active: bool,
    },
    PipelineCreated {
        thread_id: String,
        pipeline_id: String,
    },
    StageStarted {
        pipeline_id: String,
        stage_index: usize,
    },
    StageCompleted {
        pipeline_id: String,
        stage_index: usize,
    },
    StageHandoff {
        pipeline_id: String,
        from_stage: String,
        to_stage: String,
    },
    ApprovalRequested {
        thread_id: String,
        message_id: String,
        pipeline_id: String,
    },
    ApprovalResolved {
        thread_id: String,
        message_id: String,
        approved: bool,
    },
    PipelineFinished {
        pipeline_id: String,
        status: PipelineStatus,
    },
    VariantsReady {
        thread_id: String,
        request_id: String,
        variant_count: usize,
    },
    VariantSelected {
        thread_id: String,
        request_id: String,
        variant_id: String,
    },
    Error {
        thread_id: String,
        message: String,
    },
}

pub type ChatListener = Arc<dyn Fn(&ChatEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Event bus plus per-conversation cancellation registry. Producers
/// (adapters, the orchestrator) never see their consumers; a conversation
/// holds at most one live cancellation token at a time.
pub struct StreamHandler {
    listeners: Mutex<BTreeMap<u64, ChatListener>>,
    next_listener_id: AtomicU64,
    cancellations: Mutex<HashMap<String, CancelController>>,
}

impl StreamHandler {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(BTreeMap::new()),
            next_listener_id: AtomicU64::new(1),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, listener: ChatListener) -> SubscriberId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .insert(id, listener);
        SubscriberId(id)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.listeners
            .lock()
            .expect("listener registry lock poisoned")
            .remove(&id.0);
    }

    /// A panicking listener is isolated and logged; delivery continues to
    /// the remaining listeners in subscription order.
    pub fn publish(&self, event: ChatEvent) {
        let listeners: Vec<(u64, ChatListener)> = self
            .listeners
            .lock()
            .expect("listener registry lock poisoned")
            .iter()
            .map(|(id, listener)| (*id, Arc::clone(listener)))
            .collect();

        for (id, listener) in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener(&event)));
            if result.is_err() {
                warn!(subscriber = id, "chat event listener panicked; continuing delivery");
            }
        }
    }

    /// Registers a fresh token for the conversation, replacing any existing
    /// association. The displaced token is not retroactively aborted;
    /// callers cancel explicitly before re-registering when they need that.
    pub fn register_cancellation(&self, thread_id: &str) -> CancelSignal {
        let controller = CancelController::new();
        let signal = controller.signal();
        self.cancellations
            .lock()
            .expect("cancellation registry lock poisoned")
            .insert(thread_id.to_string(), controller);
        signal
    }

    /// Idempotent: a no-op when no token is registered.
    pub fn cancel(&self, thread_id: &str) {
        let registry = self
            .cancellations
            .lock()
            .expect("cancellation registry lock poisoned");
        if let Some(controller) = registry.get(thread_id) {
            controller.cancel();
        }
    }

    /// Drops the token after completion, successful or not.
    pub fn cleanup(&self, thread_id: &str) {
        self.cancellations
            .lock()
            .expect("cancellation registry lock poisoned")
            .remove(thread_id);
    }

    pub fn has_cancellation(&self, thread_id: &str) -> bool {
        self.cancellations
            .lock()
            .expect("cancellation registry lock poisoned")
            .contains_key(thread_id)
    }
}

impl Default for StreamHandler {
    fn default() -> Self {
        Self::new()
    }
}
