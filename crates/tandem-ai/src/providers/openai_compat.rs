use std::sync::Arc;

use super::openai::OpenAiAdapter;
use crate::adapter::AdapterRef;

/// OpenAI-compatible endpoints reuse the chat-completions wire with a
/// different base url. Ollama serves loopback without credentials.
pub(crate) fn ollama_adapter() -> AdapterRef {
    Arc::new(OpenAiAdapter::new(
        "ollama",
        "http://localhost:11434/v1",
        false,
    ))
}

pub(crate) fn openrouter_adapter() -> AdapterRef {
    Arc::new(OpenAiAdapter::new(
        "openrouter",
        "https://openrouter.ai/api/v1",
        true,
    ))
}
