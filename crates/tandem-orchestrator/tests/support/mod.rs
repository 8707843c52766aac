#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tandem_ai::{
    register_adapter, AiError, AiErrorCode, BlockDelta, ClosureAdapter, CompletionResponse,
    ContentBlock, OnStreamEvent, StopReason, StreamEvent, Usage,
};
use tandem_orchestrator::{
    ChatEvent, ConversationStore, CredentialStatus, CredentialStore, MessageStatus,
    PipelineOrchestrator, PipelineStatus, StageVisibilityState, StoredMessage, StreamHandler,
    TaskVisibility, ToolBridge,
};

pub struct MemoryConversationStore {
    messages: Mutex<Vec<StoredMessage>>,
    next_id: AtomicUsize,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn all(&self, thread_id: &str) -> Vec<StoredMessage> {
        self.messages
            .lock()
            .expect("message store lock poisoned")
            .iter()
            .filter(|message| message.thread_id == thread_id)
            .cloned()
            .collect()
    }

    pub fn find_by_type(&self, thread_id: &str, content_type: &str) -> Vec<StoredMessage> {
        self.all(thread_id)
            .into_iter()
            .filter(|message| message.content_type == content_type)
            .collect()
    }

    pub fn senders(&self, thread_id: &str) -> Vec<String> {
        self.all(thread_id)
            .into_iter()
            .map(|message| message.sender)
            .collect()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn append_message(
        &self,
        thread_id: &str,
        sender: &str,
        content: &str,
        content_type: &str,
        metadata: Option<Value>,
    ) -> String {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.messages
            .lock()
            .expect("message store lock poisoned")
            .push(StoredMessage {
                id: id.clone(),
                thread_id: thread_id.to_string(),
                sender: sender.to_string(),
                content: content.to_string(),
                content_type: content_type.to_string(),
                status: MessageStatus::Pending,
                metadata,
            });
        id
    }

    async fn update_message_content(&self, message_id: &str, thread_id: &str, content: &str) {
        let mut messages = self.messages.lock().expect("message store lock poisoned");
        if let Some(message) = messages
            .iter_mut()
            .find(|message| message.id == message_id && message.thread_id == thread_id)
        {
            message.content = content.to_string();
        }
    }

    async fn update_message_status(&self, message_id: &str, thread_id: &str, status: MessageStatus) {
        let mut messages = self.messages.lock().expect("message store lock poisoned");
        if let Some(message) = messages
            .iter_mut()
            .find(|message| message.id == message_id && message.thread_id == thread_id)
        {
            message.status = status;
        }
    }

    async fn messages(&self, thread_id: &str) -> Vec<StoredMessage> {
        self.all(thread_id)
    }
}

pub struct MemoryCredentialStore {
    secrets: HashMap<String, String>,
    pub probes: Mutex<Vec<String>>,
}

impl MemoryCredentialStore {
    pub fn new(secrets: &[(&str, &str)]) -> Self {
        Self {
            secrets: secrets
                .iter()
                .map(|(provider, secret)| (provider.to_string(), secret.to_string()))
                .collect(),
            probes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn status(&self, provider: &str) -> CredentialStatus {
        self.probes
            .lock()
            .expect("probe log lock poisoned")
            .push(provider.to_string());
        if self.secrets.contains_key(provider) {
            CredentialStatus::Valid
        } else {
            CredentialStatus::Missing
        }
    }

    async fn retrieve_secret(&self, provider: &str) -> Option<String> {
        self.secrets.get(provider).cloned()
    }
}

pub struct EchoToolBridge {
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl EchoToolBridge {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ToolBridge for EchoToolBridge {
    async fn execute(&self, tool_name: &str, input: &Value) -> Result<String, String> {
        self.calls
            .lock()
            .expect("tool call log lock poisoned")
            .push((tool_name.to_string(), input.clone()));
        Ok(format!("{tool_name} ok"))
    }
}

pub struct RecordingVisibility {
    pub records: Mutex<Vec<(String, usize, StageVisibilityState)>>,
}

impl RecordingVisibility {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl TaskVisibility for RecordingVisibility {
    async fn record_stage(&self, pipeline_id: &str, stage_index: usize, state: StageVisibilityState) {
        self.records
            .lock()
            .expect("visibility log lock poisoned")
            .push((pipeline_id.to_string(), stage_index, state));
    }
}

pub struct EventRecorder {
    pub events: Arc<Mutex<Vec<ChatEvent>>>,
}

impl EventRecorder {
    pub fn attach(handler: &StreamHandler) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        handler.subscribe(Arc::new(move |event: &ChatEvent| {
            sink.lock().expect("event recorder lock poisoned").push(event.clone());
        }));
        Self { events }
    }

    pub fn snapshot(&self) -> Vec<ChatEvent> {
        self.events
            .lock()
            .expect("event recorder lock poisoned")
            .clone()
    }
}

pub fn text_response(model: &str, text: &str) -> CompletionResponse {
    CompletionResponse {
        id: "resp-test".to_string(),
        content: vec![ContentBlock::Text {
            text: text.to_string(),
        }],
        model: model.to_string(),
        stop_reason: StopReason::EndTurn,
        usage: Usage::new(10, 5),
    }
}

/// Registers a scripted adapter that streams `text` as two deltas and
/// resolves with the matching response.
pub fn register_text_provider(provider: &str, text: &'static str) {
    let provider_name = provider.to_string();
    register_adapter(
        Arc::new(ClosureAdapter {
            provider: provider.to_string(),
            complete: {
                let model = provider_name.clone();
                Arc::new(move |_request| {
                    let model = model.clone();
                    Box::pin(async move { Ok(text_response(&model, text)) })
                })
            },
            complete_stream: {
                let model = provider_name;
                Arc::new(move |_request, on_event: OnStreamEvent| {
                    let model = model.clone();
                    Box::pin(async move {
                        let split = text.len() / 2;
                        stream_text_events(&on_event, &text[..split], &text[split..]);
                        Ok(text_response(&model, text))
                    })
                })
            },
        }),
        Some("orchestrator-tests".to_string()),
    );
}

pub fn stream_text_events(on_event: &OnStreamEvent, first: &str, second: &str) {
    on_event(StreamEvent::MessageStart);
    on_event(StreamEvent::ContentBlockStart {
        index: 0,
        block: ContentBlock::Text {
            text: String::new(),
        },
    });
    on_event(StreamEvent::ContentBlockDelta {
        index: 0,
        delta: BlockDelta::TextDelta {
            text: first.to_string(),
        },
    });
    on_event(StreamEvent::ContentBlockDelta {
        index: 0,
        delta: BlockDelta::TextDelta {
            text: second.to_string(),
        },
    });
    on_event(StreamEvent::ContentBlockStop { index: 0 });
    on_event(StreamEvent::MessageDelta {
        output_tokens: Some(5),
    });
    on_event(StreamEvent::MessageStop);
}

/// Adapter that fails every call with a transport-shaped error.
pub fn register_failing_provider(provider: &str) {
    register_adapter(
        Arc::new(ClosureAdapter {
            provider: provider.to_string(),
            complete: Arc::new(|_request| {
                Box::pin(async {
                    Err(AiError::new(
                        AiErrorCode::ProviderHttp,
                        "upstream HTTP 500: boom",
                    ))
                })
            }),
            complete_stream: Arc::new(|_request, _on_event| {
                Box::pin(async {
                    Err(AiError::new(
                        AiErrorCode::ProviderHttp,
                        "upstream HTTP 500: boom",
                    ))
                })
            }),
        }),
        Some("orchestrator-tests".to_string()),
    );
}

/// Succeeds `successes` times, then fails every later call. Streamed calls
/// count the same as plain completions.
pub fn register_flaky_provider(provider: &str, successes: usize, text: &'static str) {
    let calls = Arc::new(AtomicUsize::new(0));
    let provider_name = provider.to_string();
    let stream_calls = Arc::clone(&calls);

    register_adapter(
        Arc::new(ClosureAdapter {
            provider: provider.to_string(),
            complete: {
                let calls = Arc::clone(&calls);
                let model = provider_name.clone();
                Arc::new(move |_request| {
                    let call_index = calls.fetch_add(1, Ordering::SeqCst);
                    let model = model.clone();
                    Box::pin(async move {
                        if call_index < successes {
                            Ok(text_response(&model, text))
                        } else {
                            Err(AiError::new(
                                AiErrorCode::ProviderHttp,
                                "upstream HTTP 500: boom",
                            ))
                        }
                    })
                })
            },
            complete_stream: {
                let model = provider_name;
                Arc::new(move |_request, on_event: OnStreamEvent| {
                    let call_index = stream_calls.fetch_add(1, Ordering::SeqCst);
                    let model = model.clone();
                    Box::pin(async move {
                        if call_index < successes {
                            stream_text_events(&on_event, text, "");
                            Ok(text_response(&model, text))
                        } else {
                            Err(AiError::new(
                                AiErrorCode::ProviderHttp,
                                "upstream HTTP 500: boom",
                            ))
                        }
                    })
                })
            },
        }),
        Some("orchestrator-tests".to_string()),
    );
}

/// Streams one delta, then parks until the request's cancel signal fires
/// and resolves with the distinguished cancellation error.
pub fn register_hanging_provider(provider: &str) {
    register_adapter(
        Arc::new(ClosureAdapter {
            provider: provider.to_string(),
            complete: Arc::new(|request| {
                Box::pin(async move {
                    match request.cancel {
                        Some(cancel) => {
                            cancel.cancelled().await;
                            Err(AiError::cancelled())
                        }
                        None => Err(AiError::new(
                            AiErrorCode::ProviderTransport,
                            "hanging provider needs a cancel signal",
                        )),
                    }
                })
            }),
            complete_stream: Arc::new(|request, on_event: OnStreamEvent| {
                Box::pin(async move {
                    on_event(StreamEvent::MessageStart);
                    on_event(StreamEvent::ContentBlockStart {
                        index: 0,
                        block: ContentBlock::Text {
                            text: String::new(),
                        },
                    });
                    on_event(StreamEvent::ContentBlockDelta {
                        index: 0,
                        delta: BlockDelta::TextDelta {
                            text: "partial".to_string(),
                        },
                    });
                    match request.cancel {
                        Some(cancel) => {
                            cancel.cancelled().await;
                            Err(AiError::cancelled())
                        }
                        None => Err(AiError::new(
                            AiErrorCode::ProviderTransport,
                            "hanging provider needs a cancel signal",
                        )),
                    }
                })
            }),
        }),
        Some("orchestrator-tests".to_string()),
    );
}

pub async fn wait_for_status(
    orchestrator: &PipelineOrchestrator,
    thread_id: &str,
    status: PipelineStatus,
) {
    for _ in 0..200 {
        if orchestrator
            .pipeline(thread_id)
            .map(|pipeline| pipeline.status == status)
            .unwrap_or(false)
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "pipeline on {thread_id} never reached {status:?}; last: {:?}",
        orchestrator.pipeline(thread_id).map(|pipeline| pipeline.status)
    );
}

pub async fn wait_until<F>(mut condition: F, what: &str)
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never met: {what}");
}
