use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiErrorCode {
    UnsupportedProvider,
    AuthMissing,
    ProviderHttp,
    ProviderTransport,
    ProviderProtocol,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiError {
    pub code: AiErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl AiError {
    pub fn new(code: AiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(AiErrorCode::Cancelled, "Request was cancelled")
    }

    pub fn unsupported_provider(provider: &str) -> Self {
        Self::new(
            AiErrorCode::UnsupportedProvider,
            format!("Unsupported provider: {provider}"),
        )
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.code == AiErrorCode::Cancelled
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"provider_protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for AiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for AiError {}
