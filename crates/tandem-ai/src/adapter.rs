use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};

use crate::cancellation::CancelSignal;
use crate::error::AiError;
use crate::types::{CompletionOptions, CompletionResponse, Message, StreamEvent};

pub type AdapterFuture = Pin<Box<dyn Future<Output = Result<CompletionResponse, AiError>> + Send>>;

pub type OnStreamEvent = Arc<dyn Fn(StreamEvent) + Send + Sync>;

/// One completion call, canonical shape. Adapters translate this into
/// whatever the upstream vendor requires.
#[derive(Clone)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub options: CompletionOptions,
    pub api_key: Option<String>,
    pub extra_headers: Option<HashMap<String, String>>,
    pub cancel: Option<CancelSignal>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>, options: CompletionOptions) -> Self {
        Self {
            messages,
            options,
            api_key: None,
            extra_headers: None,
            cancel: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Provider-specific implementation of the canonical completion interface.
/// Construction is cheap and side-effect-free; errors surface at call time.
pub trait CompletionAdapter: Send + Sync {
    fn provider(&self) -> &str;
    fn complete(&self, request: CompletionRequest) -> AdapterFuture;
    fn complete_stream(&self, request: CompletionRequest, on_event: OnStreamEvent) -> AdapterFuture;
}

pub type AdapterRef = Arc<dyn CompletionAdapter>;

pub type AdapterCallFn = Arc<dyn Fn(CompletionRequest) -> AdapterFuture + Send + Sync>;
pub type AdapterStreamFn =
    Arc<dyn Fn(CompletionRequest, OnStreamEvent) -> AdapterFuture + Send + Sync>;

/// Closure-backed adapter, mainly for registering test doubles.
#[derive(Clone)]
pub struct ClosureAdapter {
    pub provider: String,
    pub complete: AdapterCallFn,
    pub complete_stream: AdapterStreamFn,
}

impl CompletionAdapter for ClosureAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn complete(&self, request: CompletionRequest) -> AdapterFuture {
        (self.complete)(request)
    }

    fn complete_stream(&self, request: CompletionRequest, on_event: OnStreamEvent) -> AdapterFuture {
        (self.complete_stream)(request, on_event)
    }
}

#[derive(Clone)]
struct RegisteredAdapter {
    adapter: AdapterRef,
    source_id: Option<String>,
}

fn adapter_registry() -> &'static RwLock<HashMap<String, RegisteredAdapter>> {
    static REGISTRY: OnceLock<RwLock<HashMap<String, RegisteredAdapter>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

pub fn register_adapter(adapter: AdapterRef, source_id: Option<String>) {
    let mut registry = adapter_registry()
        .write()
        .expect("adapter registry lock poisoned");
    registry.insert(
        adapter.provider().to_string(),
        RegisteredAdapter { adapter, source_id },
    );
}

pub fn get_adapter(provider: &str) -> Option<AdapterRef> {
    let registry = adapter_registry()
        .read()
        .expect("adapter registry lock poisoned");
    registry.get(provider).map(|entry| entry.adapter.clone())
}

pub fn registered_providers() -> Vec<String> {
    let registry = adapter_registry()
        .read()
        .expect("adapter registry lock poisoned");
    registry.keys().cloned().collect()
}

pub fn unregister_adapters(source_id: &str) {
    let mut registry = adapter_registry()
        .write()
        .expect("adapter registry lock poisoned");
    registry.retain(|_, entry| entry.source_id.as_deref() != Some(source_id));
}

pub fn clear_adapters() {
    let mut registry = adapter_registry()
        .write()
        .expect("adapter registry lock poisoned");
    registry.clear();
}
