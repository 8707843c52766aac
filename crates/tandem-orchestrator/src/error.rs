use tandem_ai::AiError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no active pipeline for thread {0}")]
    UnknownPipeline(String),
    #[error("no pending approval for message {0}")]
    UnknownApproval(String),
    #[error("no pending variants for message {0}")]
    UnknownVariantRequest(String),
    #[error("unknown variant id {0}")]
    UnknownVariant(String),
    #[error(transparent)]
    Ai(#[from] AiError),
}
