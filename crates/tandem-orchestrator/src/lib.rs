//! Multi-agent pipeline orchestration over the canonical completion
//! protocol: staged execution with approval gates, credential fallback,
//! cancellation and variant fan-out.

mod credentials;
mod error;
mod events;
mod orchestrator;
mod pipeline;
mod stores;
mod variants;

pub use credentials::{
    CredentialResolver, FallbackEntry, ResolvedCredential, RoutingDecision,
};
pub use error::OrchestratorError;
pub use events::{ChatEvent, ChatListener, StreamHandler, SubscriberId};
pub use orchestrator::{OrchestratorConfig, PipelineOrchestrator};
pub use pipeline::{
    is_multi_step_request, plan_stages, AgentRole, Pipeline, PipelineError, PipelineStatus, Stage,
};
pub use stores::{
    ConversationStore, CredentialStatus, CredentialStore, MessageStatus, StageVisibilityState,
    StoredMessage, TaskVisibility, ToolBridge,
};
pub use variants::{DiversityMode, Variant, VariantOptions, VariantResult};
