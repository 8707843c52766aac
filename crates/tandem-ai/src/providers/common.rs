use std::future::Future;
use std::sync::OnceLock;

use reqwest::Client;

use crate::cancellation::CancelSignal;
use crate::error::{AiError, AiErrorCode};

/// Races a future against the caller's cancel signal. On cancellation the
/// in-flight future is dropped, which aborts any underlying network call.
pub(super) async fn race_cancel<F, T>(
    cancel: Option<&CancelSignal>,
    future: F,
) -> Result<T, AiError>
where
    F: Future<Output = T>,
{
    match cancel {
        Some(signal) => {
            if signal.is_cancelled() {
                return Err(AiError::cancelled());
            }
            tokio::select! {
                _ = signal.cancelled() => Err(AiError::cancelled()),
                value = future => Ok(value),
            }
        }
        None => Ok(future.await),
    }
}

pub(super) fn join_url(base_url: &str, path: &str) -> String {
    if base_url.ends_with('/') {
        format!("{base_url}{path}")
    } else {
        format!("{base_url}/{path}")
    }
}

pub(super) fn shared_http_client(base_url: &str) -> &'static Client {
    static DEFAULT_CLIENT: OnceLock<Client> = OnceLock::new();
    static LOOPBACK_CLIENT: OnceLock<Client> = OnceLock::new();

    if is_loopback_base_url(base_url) {
        LOOPBACK_CLIENT.get_or_init(|| {
            Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new())
        })
    } else {
        DEFAULT_CLIENT.get_or_init(Client::new)
    }
}

pub(super) fn is_loopback_base_url(base_url: &str) -> bool {
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" || host == "::1"
}

pub(super) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// Vendors occasionally omit a response id; synthesize a timestamp-seeded one.
pub(super) fn synthesize_response_id() -> String {
    format!("resp-{}", now_millis())
}

pub(super) fn transport_error(provider: &str, error: reqwest::Error) -> AiError {
    AiError::new(
        AiErrorCode::ProviderTransport,
        format!("{provider} transport failed: {error}"),
    )
}

pub(super) fn http_error(provider: &str, status: u16, body: &str) -> AiError {
    AiError::new(
        AiErrorCode::ProviderHttp,
        format!("{provider} HTTP {status}: {body}"),
    )
}

/// Incremental server-sent-event framing: feed raw chunks in, pull complete
/// `data:` payloads out. Events are `\n\n`-separated; a trailing partial
/// event stays buffered until its terminator arrives.
#[derive(Debug, Default)]
pub(super) struct SseFramer {
    buffer: String,
}

impl SseFramer {
    pub(super) fn new() -> Self {
        Self::default()
    }

    pub(super) fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let normalized = self.buffer.replace("\r\n", "\n");
        self.buffer = normalized;

        let mut payloads = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..boundary + 2).collect();
            if let Some(data) = extract_data_payload(&event) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Drains whatever remains after the stream closes without a final
    /// terminator.
    pub(super) fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        extract_data_payload(&rest)
    }
}

fn extract_data_payload(event: &str) -> Option<String> {
    let data = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:").map(str::trim_start))
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        None
    } else {
        Some(data)
    }
}
