mod support;

use std::sync::Arc;

use serde_json::json;
use tandem_ai::{register_adapter, ClosureAdapter, ContentBlock, StreamEvent};
use tandem_orchestrator::{
    ChatEvent, FallbackEntry, MessageStatus, OrchestratorConfig, PipelineOrchestrator,
    PipelineStatus, StreamHandler,
};

use support::{
    register_flaky_provider, register_hanging_provider, register_text_provider, text_response,
    wait_for_status, wait_until, EchoToolBridge, EventRecorder, MemoryConversationStore,
    MemoryCredentialStore, RecordingVisibility,
};

struct Harness {
    orchestrator: PipelineOrchestrator,
    conversations: Arc<MemoryConversationStore>,
    tools: Arc<EchoToolBridge>,
    visibility: Arc<RecordingVisibility>,
    recorder: EventRecorder,
}

fn build_harness(provider: &str, secrets: &[(&str, &str)]) -> Harness {
    let conversations = Arc::new(MemoryConversationStore::new());
    let credentials = Arc::new(MemoryCredentialStore::new(secrets));
    let handler = Arc::new(StreamHandler::new());
    let tools = Arc::new(EchoToolBridge::new());
    let visibility = Arc::new(RecordingVisibility::new());
    let recorder = EventRecorder::attach(&handler);

    let orchestrator = PipelineOrchestrator::new(
        conversations.clone(),
        credentials,
        handler.clone(),
        tools.clone(),
        Some(visibility.clone()),
        OrchestratorConfig {
            priority: vec![FallbackEntry::new(provider, "test-model")],
            max_tokens: 256,
        },
    );
    Harness {
        orchestrator,
        conversations,
        tools,
        visibility,
        recorder,
    }
}

async fn approved_first_stage(harness: &Harness, thread: &str) {
    wait_for_status(&harness.orchestrator, thread, PipelineStatus::AwaitingApproval).await;
    wait_until(
        || {
            !harness
                .conversations
                .find_by_type(thread, "approval_request")
                .is_empty()
        },
        "approval request message",
    )
    .await;
    let approval = harness
        .conversations
        .find_by_type(thread, "approval_request")
        .remove(0);
    harness
        .orchestrator
        .respond_to_approval(thread, &approval.id, true)
        .await
        .expect("approval resolves");
}

#[tokio::test(flavor = "multi_thread")]
async fn approval_gate_pauses_then_approval_advances_to_completion() {
    let provider = "prov-approve-flow";
    register_text_provider(provider, "stage output");
    let harness = build_harness(provider, &[(provider, "sk-test")]);
    let thread = "t-approve";

    let pipeline = harness
        .orchestrator
        .request_pipeline_response(thread, "build a todo app")
        .await
        .expect("multi-step request creates a pipeline");
    assert_eq!(pipeline.stages.len(), 3);

    wait_for_status(&harness.orchestrator, thread, PipelineStatus::AwaitingApproval).await;

    // stage 0 finished, stage 1 has not started
    let senders = harness.conversations.senders(thread);
    assert!(senders.contains(&"architect".to_string()));
    assert!(!senders.contains(&"developer".to_string()));

    wait_until(
        || {
            !harness
                .conversations
                .find_by_type(thread, "approval_request")
                .is_empty()
        },
        "approval request message",
    )
    .await;
    let approval = harness
        .conversations
        .find_by_type(thread, "approval_request")
        .remove(0);

    harness
        .orchestrator
        .respond_to_approval(thread, &approval.id, true)
        .await
        .expect("approval resolves");

    wait_for_status(&harness.orchestrator, thread, PipelineStatus::Completed).await;
    let finished = harness.orchestrator.pipeline(thread).expect("pipeline");
    assert!(finished.completed_at.is_some());
    assert_eq!(finished.error, None);

    let senders = harness.conversations.senders(thread);
    for stage_sender in ["architect", "developer", "reviewer"] {
        assert!(
            senders.contains(&stage_sender.to_string()),
            "missing {stage_sender} stage message"
        );
    }

    // handoff notes were posted between stages
    let handoffs: Vec<_> = harness
        .conversations
        .all(thread)
        .into_iter()
        .filter(|message| message.content.contains("is starting the"))
        .collect();
    assert_eq!(handoffs.len(), 2);

    // the stage message streamed progressively and finished complete
    let architect = harness
        .conversations
        .all(thread)
        .into_iter()
        .find(|message| message.sender == "architect")
        .expect("architect message");
    assert_eq!(architect.content, "stage output");
    assert_eq!(architect.status, MessageStatus::Complete);

    // typing indicator never left on
    let events = harness.recorder.snapshot();
    let last_typing = events
        .iter()
        .rev()
        .find_map(|event| match event {
            ChatEvent::Typing { active, .. } => Some(*active),
            _ => None,
        })
        .expect("typing events present");
    assert!(!last_typing);

    // observability mirror saw every stage
    let records = harness.visibility.records.lock().expect("records lock");
    assert!(records.iter().any(|(_, index, _)| *index == 2));
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_approval_cancels_and_runs_no_further_stage() {
    let provider = "prov-reject-flow";
    register_text_provider(provider, "the plan");
    let harness = build_harness(provider, &[(provider, "sk-test")]);
    let thread = "t-reject";

    harness
        .orchestrator
        .request_pipeline_response(thread, "implement a search feature")
        .await
        .expect("pipeline created");

    wait_for_status(&harness.orchestrator, thread, PipelineStatus::AwaitingApproval).await;
    wait_until(
        || {
            !harness
                .conversations
                .find_by_type(thread, "approval_request")
                .is_empty()
        },
        "approval request message",
    )
    .await;
    let approval = harness
        .conversations
        .find_by_type(thread, "approval_request")
        .remove(0);

    harness
        .orchestrator
        .respond_to_approval(thread, &approval.id, false)
        .await
        .expect("rejection resolves");

    wait_for_status(&harness.orchestrator, thread, PipelineStatus::Cancelled).await;
    let senders = harness.conversations.senders(thread);
    assert!(!senders.contains(&"developer".to_string()));

    // a second response for the same gate is rejected
    let error = harness
        .orchestrator
        .respond_to_approval(thread, &approval.id, true)
        .await
        .expect_err("gate resolves exactly once");
    assert!(error.to_string().contains("no pending approval"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stage_failure_records_error_and_skips_later_stages() {
    let provider = "prov-failing-stage";
    // architect succeeds; the developer stage throws
    register_flaky_provider(provider, 1, "the plan");
    let harness = build_harness(provider, &[(provider, "sk-test")]);
    let thread = "t-fail";

    harness
        .orchestrator
        .request_pipeline_response(thread, "build a billing service")
        .await
        .expect("pipeline created");

    approved_first_stage(&harness, thread).await;

    wait_for_status(&harness.orchestrator, thread, PipelineStatus::Failed).await;
    let pipeline = harness.orchestrator.pipeline(thread).expect("pipeline");
    let error = pipeline.error.expect("failure recorded");
    assert_eq!(error.stage_index, 1);
    assert!(error.message.contains("HTTP 500"));

    let senders = harness.conversations.senders(thread);
    assert!(!senders.contains(&"reviewer".to_string()));

    // the failure surfaced as a human-readable chat message and an error
    // event, and typing ended cleared
    assert!(harness
        .conversations
        .all(thread)
        .iter()
        .any(|message| message.content.contains("stage failed")));
    let events = harness.recorder.snapshot();
    assert!(events
        .iter()
        .any(|event| matches!(event, ChatEvent::Error { .. })));
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_mid_stream_aborts_without_marking_failed() {
    let provider = "prov-cancel-stream";
    register_hanging_provider(provider);
    let harness = build_harness(provider, &[(provider, "sk-test")]);
    let thread = "t-cancel";

    harness
        .orchestrator
        .request_pipeline_response(thread, "create a reporting tool")
        .await
        .expect("pipeline created");

    // the stage streamed a partial delta into its message
    wait_until(
        || {
            harness
                .conversations
                .all(thread)
                .iter()
                .any(|message| message.content == "partial")
        },
        "partial streamed content",
    )
    .await;

    harness.orchestrator.cancel(thread);
    wait_for_status(&harness.orchestrator, thread, PipelineStatus::Cancelled).await;

    let pipeline = harness.orchestrator.pipeline(thread).expect("pipeline");
    assert_eq!(pipeline.error, None);

    // no terminal stream events were emitted for the aborted call
    let events = harness.recorder.snapshot();
    assert!(!events.iter().any(|event| matches!(
        event,
        ChatEvent::Stream {
            event: StreamEvent::MessageStop,
            ..
        }
    )));
    assert!(!events.iter().any(|event| matches!(
        event,
        ChatEvent::Stream {
            event: StreamEvent::MessageDelta { .. },
            ..
        }
    )));

    // the aborted stage message is marked cancelled, not failed
    let architect = harness
        .conversations
        .all(thread)
        .into_iter()
        .find(|message| message.sender == "architect")
        .expect("architect message");
    assert_eq!(architect.status, MessageStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread")]
async fn single_step_requests_do_not_create_pipelines() {
    let provider = "prov-single-step";
    register_text_provider(provider, "answer");
    let harness = build_harness(provider, &[(provider, "sk-test")]);

    let result = harness
        .orchestrator
        .request_pipeline_response("t-single", "what does this error mean?")
        .await;
    assert!(result.is_none());
    assert!(harness.conversations.all("t-single").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_credentials_post_an_instruction_instead_of_erroring() {
    let provider = "prov-no-creds";
    register_text_provider(provider, "unused");
    let harness = build_harness(provider, &[]);
    let thread = "t-no-creds";

    let result = harness
        .orchestrator
        .request_pipeline_response(thread, "build a dashboard app")
        .await;
    assert!(result.is_none());

    let messages = harness.conversations.all(thread);
    assert_eq!(messages.len(), 1);
    assert!(messages[0].content.contains("Add an API key"));
}

#[tokio::test(flavor = "multi_thread")]
async fn stage_tool_calls_run_through_the_bridge() {
    let provider = "prov-tool-stage";
    register_adapter(
        Arc::new(ClosureAdapter {
            provider: provider.to_string(),
            complete: Arc::new(move |_request| {
                Box::pin(async move { Ok(text_response("test-model", "done")) })
            }),
            complete_stream: Arc::new(move |_request, on_event| {
                Box::pin(async move {
                    support::stream_text_events(&on_event, "do", "ne");
                    let mut response = text_response("test-model", "done");
                    response.content.push(ContentBlock::ToolUse {
                        id: "call_1".to_string(),
                        name: "write_file".to_string(),
                        input: json!({"path": "main.rs"}),
                    });
                    Ok(response)
                })
            }),
        }),
        Some("orchestrator-tests".to_string()),
    );

    let harness = build_harness(provider, &[(provider, "sk-test")]);
    let thread = "t-tools";

    harness
        .orchestrator
        .request_pipeline_response(thread, "write a parser module")
        .await
        .expect("pipeline created");
    approved_first_stage(&harness, thread).await;
    wait_for_status(&harness.orchestrator, thread, PipelineStatus::Completed).await;

    let calls = harness.tools.calls.lock().expect("tool calls lock");
    assert!(!calls.is_empty());
    assert_eq!(calls[0].0, "write_file");
    drop(calls);

    let tool_results = harness.conversations.find_by_type(thread, "tool_result");
    assert!(!tool_results.is_empty());
    assert!(tool_results[0].content.contains("write_file ok"));
}
