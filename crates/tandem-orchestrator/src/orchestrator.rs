use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::json;
use tandem_ai::{
    create_ai_client, BlockDelta, CompletionOptions, ContentBlock, Message, MessageContent,
    OnStreamEvent, Role, StreamEvent,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::credentials::{CredentialResolver, FallbackEntry, ResolvedCredential};
use crate::error::OrchestratorError;
use crate::events::{ChatEvent, StreamHandler};
use crate::pipeline::{is_multi_step_request, plan_stages, Pipeline, PipelineError, PipelineStatus, Stage};
use crate::stores::{
    ConversationStore, CredentialStore, MessageStatus, StageVisibilityState, StoredMessage,
    TaskVisibility, ToolBridge,
};
use crate::variants::{
    generate_variants, text_of, variants_metadata, DiversityMode, Variant, VariantOptions,
    VariantResult,
};

const NO_CREDENTIALS_MESSAGE: &str =
    "No AI provider credentials are configured. Add an API key in settings to continue.";

#[derive(Clone)]
pub struct OrchestratorConfig {
    /// Ordered provider priority; the first entry with a usable credential
    /// wins.
    pub priority: Vec<FallbackEntry>,
    pub max_tokens: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            priority: vec![
                FallbackEntry::new("anthropic", "claude-3-5-sonnet-latest"),
                FallbackEntry::new("openai", "gpt-4o"),
                FallbackEntry::new("ollama", "llama3.1"),
            ],
            max_tokens: 4096,
        }
    }
}

struct ApprovalGate {
    thread_id: String,
    sender: oneshot::Sender<bool>,
}

struct PendingVariants {
    thread_id: String,
    variants: Vec<Variant>,
}

enum StageFailure {
    Cancelled,
    Error(String),
}

enum GateOutcome {
    Approved,
    Rejected,
    Cancelled,
}

struct OrchestratorInner {
    conversations: Arc<dyn ConversationStore>,
    resolver: CredentialResolver,
    handler: Arc<StreamHandler>,
    tools: Arc<dyn ToolBridge>,
    visibility: Option<Arc<dyn TaskVisibility>>,
    max_tokens: u32,
    pipelines: Mutex<HashMap<String, Pipeline>>,
    approvals: Mutex<HashMap<String, ApprovalGate>>,
    pending_variants: Mutex<HashMap<String, PendingVariants>>,
    id_counter: AtomicU64,
}

/// Runs ordered multi-agent stages against the completion protocol:
/// approval gates, variant fan-out, failure and cancellation handling.
/// The pipeline object is owned here exclusively; readers get clones.
#[derive(Clone)]
pub struct PipelineOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl PipelineOrchestrator {
    pub fn new(
        conversations: Arc<dyn ConversationStore>,
        credentials: Arc<dyn CredentialStore>,
        handler: Arc<StreamHandler>,
        tools: Arc<dyn ToolBridge>,
        visibility: Option<Arc<dyn TaskVisibility>>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                conversations,
                resolver: CredentialResolver::new(credentials, config.priority),
                handler,
                tools,
                visibility,
                max_tokens: config.max_tokens,
                pipelines: Mutex::new(HashMap::new()),
                approvals: Mutex::new(HashMap::new()),
                pending_variants: Mutex::new(HashMap::new()),
                id_counter: AtomicU64::new(0),
            }),
        }
    }

    pub fn handler(&self) -> Arc<StreamHandler> {
        Arc::clone(&self.inner.handler)
    }

    pub fn resolver(&self) -> &CredentialResolver {
        &self.inner.resolver
    }

    /// Read-only snapshot; mutation stays inside the orchestrator.
    pub fn pipeline(&self, thread_id: &str) -> Option<Pipeline> {
        self.inner
            .pipelines
            .lock()
            .expect("pipeline registry lock poisoned")
            .get(thread_id)
            .cloned()
    }

    fn generate_id(&self, prefix: &str) -> String {
        let counter = self.inner.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("{prefix}-{}-{}", Utc::now().timestamp_millis(), counter)
    }

    fn update_pipeline<F>(&self, thread_id: &str, mutate: F) -> Option<Pipeline>
    where
        F: FnOnce(&mut Pipeline),
    {
        let mut pipelines = self
            .inner
            .pipelines
            .lock()
            .expect("pipeline registry lock poisoned");
        let pipeline = pipelines.get_mut(thread_id)?;
        mutate(pipeline);
        pipeline.updated_at = Utc::now();
        Some(pipeline.clone())
    }

    async fn record_stage(&self, pipeline_id: &str, stage_index: usize, state: StageVisibilityState) {
        if let Some(visibility) = &self.inner.visibility {
            visibility.record_stage(pipeline_id, stage_index, state).await;
        }
    }

    /// Creates and starts a pipeline for a multi-step request. Returns
    /// `None` for single-step requests, and for credential absence after
    /// posting a user-facing instruction (a normal outcome, not an error).
    pub async fn request_pipeline_response(
        &self,
        thread_id: &str,
        text: &str,
    ) -> Option<Pipeline> {
        if !is_multi_step_request(text) {
            return None;
        }
        if self.inner.resolver.resolve().await.is_none() {
            self.post_system_message(thread_id, NO_CREDENTIALS_MESSAGE).await;
            return None;
        }

        let pipeline = Pipeline::new(
            self.generate_id("pl"),
            summarize_request(text),
            text.to_string(),
            plan_stages(text),
        );
        let pipeline_id = pipeline.id.clone();
        {
            let mut pipelines = self
                .inner
                .pipelines
                .lock()
                .expect("pipeline registry lock poisoned");
            pipelines.insert(thread_id.to_string(), pipeline.clone());
        }

        info!(
            thread_id,
            pipeline_id = pipeline_id.as_str(),
            stages = pipeline.stages.len(),
            "created pipeline"
        );
        self.inner.handler.publish(ChatEvent::PipelineCreated {
            thread_id: thread_id.to_string(),
            pipeline_id,
        });

        let runner = self.clone();
        let run_thread = thread_id.to_string();
        tokio::spawn(async move {
            runner.run_pipeline(run_thread).await;
        });

        Some(pipeline)
    }

    async fn run_pipeline(self, thread_id: String) {
        self.drive_stages(&thread_id).await;
        // finally-equivalent path: the typing indicator is never left on
        // and the conversation's cancellation token is always dropped.
        self.inner.handler.publish(ChatEvent::Typing {
            thread_id: thread_id.clone(),
            active: false,
        });
        self.inner.handler.cleanup(&thread_id);
    }

    async fn drive_stages(&self, thread_id: &str) {
        let Some(pipeline) = self.pipeline(thread_id) else {
            return;
        };
        let pipeline_id = pipeline.id.clone();
        let stages = pipeline.stages.clone();

        self.update_pipeline(thread_id, |pipeline| {
            pipeline.status = PipelineStatus::Running;
        });

        for (index, stage) in stages.iter().enumerate() {
            if index > 0 {
                self.post_handoff(thread_id, &pipeline_id, &stages[index - 1], stage)
                    .await;
            }

            self.update_pipeline(thread_id, |pipeline| {
                pipeline.current_stage_index = index;
                pipeline.status = PipelineStatus::Running;
            });
            self.inner.handler.publish(ChatEvent::StageStarted {
                pipeline_id: pipeline_id.clone(),
                stage_index: index,
            });
            self.record_stage(&pipeline_id, index, StageVisibilityState::Started)
                .await;

            match self.execute_stage(thread_id, &pipeline_id, index, stage).await {
                Ok(()) => {
                    self.inner.handler.publish(ChatEvent::StageCompleted {
                        pipeline_id: pipeline_id.clone(),
                        stage_index: index,
                    });
                    self.record_stage(&pipeline_id, index, StageVisibilityState::Completed)
                        .await;
                }
                Err(StageFailure::Cancelled) => {
                    info!(
                        thread_id,
                        pipeline_id = pipeline_id.as_str(),
                        stage_index = index,
                        "pipeline cancelled mid-stage"
                    );
                    self.finish_cancelled(thread_id, &pipeline_id, "Pipeline cancelled.")
                        .await;
                    return;
                }
                Err(StageFailure::Error(message)) => {
                    warn!(
                        thread_id,
                        pipeline_id = pipeline_id.as_str(),
                        stage_index = index,
                        error = message.as_str(),
                        "pipeline stage failed"
                    );
                    self.update_pipeline(thread_id, |pipeline| {
                        pipeline.status = PipelineStatus::Failed;
                        pipeline.error = Some(PipelineError {
                            stage_index: index,
                            message: message.clone(),
                        });
                    });
                    self.record_stage(&pipeline_id, index, StageVisibilityState::Failed)
                        .await;
                    self.post_system_message(
                        thread_id,
                        &format!("The {} stage failed: {message}", stage.title),
                    )
                    .await;
                    self.inner.handler.publish(ChatEvent::Error {
                        thread_id: thread_id.to_string(),
                        message,
                    });
                    self.inner.handler.publish(ChatEvent::PipelineFinished {
                        pipeline_id,
                        status: PipelineStatus::Failed,
                    });
                    return;
                }
            }

            let is_last = index + 1 == stages.len();
            if stage.requires_approval && !is_last {
                match self
                    .await_approval(thread_id, &pipeline_id, index, &stages[index + 1])
                    .await
                {
                    GateOutcome::Approved => {}
                    GateOutcome::Rejected => {
                        self.finish_cancelled(
                            thread_id,
                            &pipeline_id,
                            "Pipeline stopped: the plan was not approved.",
                        )
                        .await;
                        return;
                    }
                    GateOutcome::Cancelled => {
                        self.finish_cancelled(thread_id, &pipeline_id, "Pipeline cancelled.")
                            .await;
                        return;
                    }
                }
            }
        }

        self.update_pipeline(thread_id, |pipeline| {
            pipeline.status = PipelineStatus::Completed;
            pipeline.completed_at = Some(Utc::now());
        });
        info!(thread_id, pipeline_id = pipeline_id.as_str(), "pipeline completed");
        self.inner.handler.publish(ChatEvent::PipelineFinished {
            pipeline_id,
            status: PipelineStatus::Completed,
        });
    }

    async fn finish_cancelled(&self, thread_id: &str, pipeline_id: &str, note: &str) {
        self.update_pipeline(thread_id, |pipeline| {
            pipeline.status = PipelineStatus::Cancelled;
        });
        self.post_system_message(thread_id, note).await;
        self.inner.handler.publish(ChatEvent::PipelineFinished {
            pipeline_id: pipeline_id.to_string(),
            status: PipelineStatus::Cancelled,
        });
    }

    async fn post_handoff(
        &self,
        thread_id: &str,
        pipeline_id: &str,
        finished: &Stage,
        starting: &Stage,
    ) {
        let note = format!(
            "{} finished the {} stage; {} is starting the {} stage.",
            finished.role.as_str(),
            finished.title,
            starting.role.as_str(),
            starting.title
        );
        self.post_system_message(thread_id, &note).await;
        self.inner.handler.publish(ChatEvent::StageHandoff {
            pipeline_id: pipeline_id.to_string(),
            from_stage: finished.title.clone(),
            to_stage: starting.title.clone(),
        });
    }

    async fn post_system_message(&self, thread_id: &str, content: &str) -> String {
        let message_id = self
            .inner
            .conversations
            .append_message(thread_id, "system", content, "text", None)
            .await;
        self.inner.handler.publish(ChatEvent::MessageAdded {
            thread_id: thread_id.to_string(),
            message_id: message_id.clone(),
        });
        message_id
    }

    /// One completion against the resolved credentials with the stage's
    /// role prompt, streamed into the stage-owning message as deltas
    /// arrive. Tool calls in the response run through the tool bridge.
    async fn execute_stage(
        &self,
        thread_id: &str,
        pipeline_id: &str,
        stage_index: usize,
        stage: &Stage,
    ) -> Result<(), StageFailure> {
        let Some(credential) = self.inner.resolver.resolve().await else {
            return Err(StageFailure::Error(
                "no usable provider credentials".to_string(),
            ));
        };

        let cancel = self.inner.handler.register_cancellation(thread_id);
        self.inner.handler.publish(ChatEvent::Typing {
            thread_id: thread_id.to_string(),
            active: true,
        });

        let message_id = self
            .inner
            .conversations
            .append_message(
                thread_id,
                stage.role.as_str(),
                "",
                "text",
                Some(json!({ "pipelineId": pipeline_id, "stageIndex": stage_index })),
            )
            .await;
        self.inner.handler.publish(ChatEvent::MessageAdded {
            thread_id: thread_id.to_string(),
            message_id: message_id.clone(),
        });
        self.inner
            .conversations
            .update_message_status(&message_id, thread_id, MessageStatus::Streaming)
            .await;

        let history = self.conversation_context(thread_id).await;
        let options = CompletionOptions {
            model: credential.model.clone(),
            max_tokens: self.inner.max_tokens,
            system_prompt: Some(stage.role.system_prompt().to_string()),
            ..CompletionOptions::default()
        };

        debug!(
            thread_id,
            pipeline_id,
            stage_index,
            provider = credential.provider.as_str(),
            model = options.model.as_str(),
            "executing pipeline stage"
        );

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let on_event: OnStreamEvent = Arc::new(move |event| {
            let _ = event_tx.send(event);
        });
        let forwarder = tokio::spawn(forward_stream_events(
            event_rx,
            Arc::clone(&self.inner.conversations),
            Arc::clone(&self.inner.handler),
            thread_id.to_string(),
            message_id.clone(),
        ));

        let client = create_ai_client(credential.provider.clone(), Some(credential.secret.clone()));
        let result = client
            .complete_stream(history, options, on_event, Some(cancel))
            .await;
        let streamed_text = forwarder.await.unwrap_or_default();

        let clear_typing = || {
            self.inner.handler.publish(ChatEvent::Typing {
                thread_id: thread_id.to_string(),
                active: false,
            });
        };

        match result {
            Ok(response) => {
                let mut final_text = text_of(&response.content);
                if final_text.is_empty() {
                    final_text = streamed_text;
                }
                self.inner
                    .conversations
                    .update_message_content(&message_id, thread_id, &final_text)
                    .await;
                self.inner
                    .conversations
                    .update_message_status(&message_id, thread_id, MessageStatus::Complete)
                    .await;
                self.inner.handler.publish(ChatEvent::MessageUpdated {
                    thread_id: thread_id.to_string(),
                    message_id: message_id.clone(),
                });
                clear_typing();
                self.execute_stage_tools(thread_id, &response.content).await;
                Ok(())
            }
            Err(error) if error.is_cancelled() => {
                self.inner
                    .conversations
                    .update_message_status(&message_id, thread_id, MessageStatus::Cancelled)
                    .await;
                clear_typing();
                Err(StageFailure::Cancelled)
            }
            Err(error) => {
                self.inner
                    .conversations
                    .update_message_status(&message_id, thread_id, MessageStatus::Failed)
                    .await;
                clear_typing();
                Err(StageFailure::Error(error.message))
            }
        }
    }

    async fn execute_stage_tools(&self, thread_id: &str, content: &[ContentBlock]) {
        for block in content {
            let ContentBlock::ToolUse { id, name, input } = block else {
                continue;
            };
            let outcome = self.inner.tools.execute(name, input).await;
            let (text, is_error) = match outcome {
                Ok(output) => (output, false),
                Err(error) => (error, true),
            };
            let message_id = self
                .inner
                .conversations
                .append_message(
                    thread_id,
                    "system",
                    &text,
                    "tool_result",
                    Some(json!({ "toolUseId": id, "toolName": name, "isError": is_error })),
                )
                .await;
            self.inner.handler.publish(ChatEvent::MessageAdded {
                thread_id: thread_id.to_string(),
                message_id,
            });
        }
    }

    /// Suspends until the matching approval response arrives: a one-shot
    /// future keyed by the approval message id, resolved exactly once.
    /// There is deliberately no timeout; only an explicit response or an
    /// explicit cancel resumes the pipeline.
    async fn await_approval(
        &self,
        thread_id: &str,
        pipeline_id: &str,
        stage_index: usize,
        next_stage: &Stage,
    ) -> GateOutcome {
        self.update_pipeline(thread_id, |pipeline| {
            pipeline.status = PipelineStatus::AwaitingApproval;
        });
        self.record_stage(pipeline_id, stage_index, StageVisibilityState::AwaitingApproval)
            .await;

        let prompt = format!(
            "Approve moving on to the {} stage?",
            next_stage.title.to_lowercase()
        );
        let (message_id, receiver) = self
            .open_approval_gate(thread_id, Some(pipeline_id), &prompt)
            .await;
        self.inner.handler.publish(ChatEvent::ApprovalRequested {
            thread_id: thread_id.to_string(),
            message_id: message_id.clone(),
            pipeline_id: pipeline_id.to_string(),
        });

        // the gate replaces the stage's spent token, so an explicit cancel
        // during the wait still lands here
        let cancel = self.inner.handler.register_cancellation(thread_id);
        let outcome = tokio::select! {
            response = receiver => match response {
                Ok(true) => GateOutcome::Approved,
                Ok(false) => GateOutcome::Rejected,
                Err(_) => GateOutcome::Cancelled,
            },
            _ = cancel.cancelled() => GateOutcome::Cancelled,
        };

        if matches!(outcome, GateOutcome::Cancelled) {
            self.inner
                .approvals
                .lock()
                .expect("approval registry lock poisoned")
                .remove(&message_id);
            self.inner
                .conversations
                .update_message_status(&message_id, thread_id, MessageStatus::Cancelled)
                .await;
        }
        outcome
    }

    async fn open_approval_gate(
        &self,
        thread_id: &str,
        pipeline_id: Option<&str>,
        content: &str,
    ) -> (String, oneshot::Receiver<bool>) {
        let metadata = pipeline_id.map(|id| json!({ "pipelineId": id }));
        let message_id = self
            .inner
            .conversations
            .append_message(thread_id, "system", content, "approval_request", metadata)
            .await;
        self.inner.handler.publish(ChatEvent::MessageAdded {
            thread_id: thread_id.to_string(),
            message_id: message_id.clone(),
        });

        let (sender, receiver) = oneshot::channel();
        self.inner
            .approvals
            .lock()
            .expect("approval registry lock poisoned")
            .insert(
                message_id.clone(),
                ApprovalGate {
                    thread_id: thread_id.to_string(),
                    sender,
                },
            );
        (message_id, receiver)
    }

    /// Posts a standalone approval request. The resolution is observable
    /// via the `ApprovalResolved` event.
    pub async fn request_approval(&self, thread_id: &str, content: &str) -> String {
        let (message_id, _receiver) = self.open_approval_gate(thread_id, None, content).await;
        self.inner.handler.publish(ChatEvent::ApprovalRequested {
            thread_id: thread_id.to_string(),
            message_id: message_id.clone(),
            pipeline_id: String::new(),
        });
        message_id
    }

    /// Resolves the gate exactly once; a second response for the same
    /// message is rejected.
    pub async fn respond_to_approval(
        &self,
        thread_id: &str,
        message_id: &str,
        approved: bool,
    ) -> Result<(), OrchestratorError> {
        let gate = {
            let mut approvals = self
                .inner
                .approvals
                .lock()
                .expect("approval registry lock poisoned");
            approvals.remove(message_id)
        };
        let Some(gate) = gate else {
            return Err(OrchestratorError::UnknownApproval(message_id.to_string()));
        };
        if gate.thread_id != thread_id {
            // wrong thread; restore the gate untouched
            self.inner
                .approvals
                .lock()
                .expect("approval registry lock poisoned")
                .insert(message_id.to_string(), gate);
            return Err(OrchestratorError::UnknownApproval(message_id.to_string()));
        }

        self.inner
            .conversations
            .update_message_status(message_id, thread_id, MessageStatus::Complete)
            .await;
        self.inner.handler.publish(ChatEvent::ApprovalResolved {
            thread_id: thread_id.to_string(),
            message_id: message_id.to_string(),
            approved,
        });
        // the pipeline task may have been cancelled while the response was
        // in flight; a closed channel is fine
        let _ = gate.sender.send(approved);
        Ok(())
    }

    /// Explicit conversation-level cancel: aborts whatever is in flight and
    /// resolves an armed approval gate as cancelled.
    pub fn cancel(&self, thread_id: &str) {
        info!(thread_id, "cancelling conversation");
        self.inner.handler.cancel(thread_id);
    }

    /// Fans out `variant_count` generations and returns them for
    /// side-by-side selection. `None` means no usable credentials (after a
    /// user-facing instruction); an empty variant list means every
    /// generation failed. The two are deliberately distinct.
    pub async fn request_variant_response(
        &self,
        thread_id: &str,
        prompt: &str,
        options: VariantOptions,
    ) -> Option<VariantResult> {
        if options.variant_count == 0 {
            return Some(VariantResult {
                request_id: String::new(),
                variants: vec![],
            });
        }

        let targets: Vec<ResolvedCredential> = match options.diversity_mode {
            DiversityMode::Single => self.inner.resolver.resolve().await.into_iter().collect(),
            DiversityMode::MultiProvider => self.inner.resolver.resolve_all().await,
        };
        if targets.is_empty() {
            self.post_system_message(thread_id, NO_CREDENTIALS_MESSAGE).await;
            return None;
        }

        self.inner.handler.publish(ChatEvent::Typing {
            thread_id: thread_id.to_string(),
            active: true,
        });
        let cancel = self.inner.handler.register_cancellation(thread_id);

        let variants = generate_variants(
            &targets,
            prompt,
            options.variant_count,
            self.inner.max_tokens,
            Some(cancel),
        )
        .await;

        self.inner.handler.cleanup(thread_id);
        self.inner.handler.publish(ChatEvent::Typing {
            thread_id: thread_id.to_string(),
            active: false,
        });

        info!(
            thread_id,
            requested = options.variant_count,
            generated = variants.len(),
            "variant fan-out finished"
        );

        let request_id = self
            .inner
            .conversations
            .append_message(
                thread_id,
                "assistant",
                &format!("Generated {} variants for review.", variants.len()),
                "variants",
                Some(variants_metadata(&variants)),
            )
            .await;
        self.inner.handler.publish(ChatEvent::MessageAdded {
            thread_id: thread_id.to_string(),
            message_id: request_id.clone(),
        });
        self.inner.handler.publish(ChatEvent::VariantsReady {
            thread_id: thread_id.to_string(),
            request_id: request_id.clone(),
            variant_count: variants.len(),
        });

        self.inner
            .pending_variants
            .lock()
            .expect("variant registry lock poisoned")
            .insert(
                request_id.clone(),
                PendingVariants {
                    thread_id: thread_id.to_string(),
                    variants: variants.clone(),
                },
            );

        Some(VariantResult {
            request_id,
            variants,
        })
    }

    /// Terminal, one-time action: posts the chosen content as the
    /// canonical conversation turn and discards the selection opportunity.
    pub async fn select_variant(
        &self,
        thread_id: &str,
        message_id: &str,
        variant_id: &str,
    ) -> Result<Variant, OrchestratorError> {
        let pending = {
            let mut registry = self
                .inner
                .pending_variants
                .lock()
                .expect("variant registry lock poisoned");
            registry.remove(message_id)
        };
        let Some(pending) = pending else {
            return Err(OrchestratorError::UnknownVariantRequest(
                message_id.to_string(),
            ));
        };
        if pending.thread_id != thread_id {
            self.inner
                .pending_variants
                .lock()
                .expect("variant registry lock poisoned")
                .insert(message_id.to_string(), pending);
            return Err(OrchestratorError::UnknownVariantRequest(
                message_id.to_string(),
            ));
        }

        let Some(variant) = pending
            .variants
            .iter()
            .find(|variant| variant.id == variant_id)
            .cloned()
        else {
            // an unknown id does not burn the one-time selection
            self.inner
                .pending_variants
                .lock()
                .expect("variant registry lock poisoned")
                .insert(message_id.to_string(), pending);
            return Err(OrchestratorError::UnknownVariant(variant_id.to_string()));
        };

        let canonical_id = self
            .inner
            .conversations
            .append_message(
                thread_id,
                "assistant",
                &variant.content,
                "text",
                Some(json!({
                    "variantId": variant.id,
                    "provider": variant.provider,
                    "model": variant.model,
                })),
            )
            .await;
        self.inner
            .conversations
            .update_message_status(message_id, thread_id, MessageStatus::Selected)
            .await;
        self.inner.handler.publish(ChatEvent::MessageAdded {
            thread_id: thread_id.to_string(),
            message_id: canonical_id,
        });
        self.inner.handler.publish(ChatEvent::VariantSelected {
            thread_id: thread_id.to_string(),
            request_id: message_id.to_string(),
            variant_id: variant.id.clone(),
        });
        Ok(variant)
    }

    /// Conversation history as canonical protocol messages. Only plain text
    /// turns participate; protocol artifacts (approval requests, variant
    /// menus, tool transcripts) stay out of the model context.
    async fn conversation_context(&self, thread_id: &str) -> Vec<Message> {
        self.inner
            .conversations
            .messages(thread_id)
            .await
            .into_iter()
            .filter(|message| message.content_type == "text" && !message.content.is_empty())
            .map(stored_to_canonical)
            .collect()
    }
}

fn stored_to_canonical(message: StoredMessage) -> Message {
    let role = match message.sender.as_str() {
        "user" => Role::User,
        "system" => Role::System,
        _ => Role::Assistant,
    };
    Message {
        role,
        content: MessageContent::Text(message.content),
    }
}

fn summarize_request(text: &str) -> String {
    const LIMIT: usize = 60;
    let trimmed = text.trim();
    if trimmed.chars().count() <= LIMIT {
        return trimmed.to_string();
    }
    let prefix: String = trimmed.chars().take(LIMIT).collect();
    format!("{prefix}…")
}

/// Applies streamed deltas to the stage-owning message as they arrive and
/// republishes every canonical event, preserving order. Returns the text
/// assembled from the deltas.
async fn forward_stream_events(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    conversations: Arc<dyn ConversationStore>,
    handler: Arc<StreamHandler>,
    thread_id: String,
    message_id: String,
) -> String {
    let mut text = String::new();
    while let Some(event) = events.recv().await {
        if let StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text: delta },
            ..
        } = &event
        {
            text.push_str(delta);
            conversations
                .update_message_content(&message_id, &thread_id, &text)
                .await;
            handler.publish(ChatEvent::MessageUpdated {
                thread_id: thread_id.clone(),
                message_id: message_id.clone(),
            });
        }
        handler.publish(ChatEvent::Stream {
            thread_id: thread_id.clone(),
            event,
        });
    }
    text
}
