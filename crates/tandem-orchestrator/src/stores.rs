use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Valid,
    Invalid,
    Missing,
}

/// Secret-retrieval capability. Absence of a credential is a normal
/// outcome ("try the next provider"), never an error.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn status(&self, provider: &str) -> CredentialStatus;
    async fn retrieve_secret(&self, provider: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Streaming,
    Complete,
    Failed,
    Cancelled,
    Selected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    #[serde(rename = "threadId")]
    pub thread_id: String,
    pub sender: String,
    pub content: String,
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub status: MessageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Conversation history owned elsewhere; the orchestrator only appends and
/// patches messages it created.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn append_message(
        &self,
        thread_id: &str,
        sender: &str,
        content: &str,
        content_type: &str,
        metadata: Option<Value>,
    ) -> String;
    async fn update_message_content(&self, message_id: &str, thread_id: &str, content: &str);
    async fn update_message_status(&self, message_id: &str, thread_id: &str, status: MessageStatus);
    async fn messages(&self, thread_id: &str) -> Vec<StoredMessage>;
}

/// Agent-specific tool execution, implemented outside this core.
#[async_trait]
pub trait ToolBridge: Send + Sync {
    async fn execute(&self, tool_name: &str, input: &Value) -> Result<String, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageVisibilityState {
    Started,
    Completed,
    Failed,
    AwaitingApproval,
}

/// Observability mirror for stage progress. Not required for correctness;
/// implementations are free to drop records.
#[async_trait]
pub trait TaskVisibility: Send + Sync {
    async fn record_stage(&self, pipeline_id: &str, stage_index: usize, state: StageVisibilityState);
}
