//! Provider-agnostic completion protocol: one canonical event/response
//! model over wire-incompatible upstream vendors.

mod accumulator;
mod adapter;
mod cancellation;
mod error;
mod providers;
mod router;
mod types;

pub use accumulator::{
    finalize_stream, AssembledToolCall, BlockAccumulator, StepOutput, ToolCallAssembler,
};
pub use adapter::{
    clear_adapters, get_adapter, register_adapter, registered_providers, unregister_adapters,
    AdapterCallFn, AdapterFuture, AdapterRef, AdapterStreamFn, ClosureAdapter, CompletionAdapter,
    CompletionRequest, OnStreamEvent,
};
pub use cancellation::{CancelController, CancelSignal};
pub use error::{AiError, AiErrorCode};
pub use providers::{register_builtin_adapters, reset_adapters};
pub use router::{
    available_models, create_ai_client, default_model, known_providers, AiClient,
};
pub use types::{
    BlockDelta, BlockOpen, CompletionOptions, CompletionResponse, ContentBlock, MediaSource,
    Message, MessageContent, ProviderEvent, ProviderId, Role, StopReason, StreamEvent, ToolSpec,
    Usage,
};
