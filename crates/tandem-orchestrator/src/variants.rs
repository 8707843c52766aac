use serde::{Deserialize, Serialize};
use serde_json::json;
use tandem_ai::{CancelSignal, CompletionOptions, ContentBlock, Message};
use tokio::task::JoinSet;
use tracing::warn;

use crate::credentials::ResolvedCredential;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiversityMode {
    Single,
    MultiProvider,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantOptions {
    #[serde(rename = "variantCount")]
    pub variant_count: usize,
    #[serde(rename = "diversityMode")]
    pub diversity_mode: DiversityMode,
}

impl Default for VariantOptions {
    fn default() -> Self {
        Self {
            variant_count: 3,
            diversity_mode: DiversityMode::Single,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub description: String,
    pub content: String,
    pub provider: String,
    pub model: String,
    #[serde(rename = "tokensUsed")]
    pub tokens_used: u64,
}

/// Transient per-request result; superseded once one variant is selected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantResult {
    #[serde(rename = "requestId")]
    pub request_id: String,
    pub variants: Vec<Variant>,
}

pub(crate) fn variant_name(index: usize) -> String {
    let letter = (b'A' + (index % 26) as u8) as char;
    format!("Variant {letter}")
}

/// Fans `count` generations out over the target credentials, round-robin
/// when there are fewer targets than requested variants. One generation
/// failing never aborts the rest; failures are logged and dropped.
pub(crate) async fn generate_variants(
    targets: &[ResolvedCredential],
    prompt: &str,
    count: usize,
    max_tokens: u32,
    cancel: Option<CancelSignal>,
) -> Vec<Variant> {
    let mut join_set = JoinSet::new();
    for index in 0..count {
        let target = targets[index % targets.len()].clone();
        let prompt = prompt.to_string();
        let cancel = cancel.clone();
        join_set.spawn(async move {
            let client =
                tandem_ai::create_ai_client(target.provider.clone(), Some(target.secret.clone()));
            let options = CompletionOptions {
                model: target.model.clone(),
                max_tokens,
                // fan-out wants spread, not determinism
                temperature: Some(1.0),
                ..CompletionOptions::default()
            };
            let result = client
                .complete(vec![Message::user(prompt)], options, cancel)
                .await;
            (index, target, result)
        });
    }

    let mut generated = Vec::new();
    while let Some(joined) = join_set.join_next().await {
        let Ok((index, target, result)) = joined else {
            warn!("variant generation task panicked");
            continue;
        };
        match result {
            Ok(response) => {
                let content = text_of(&response.content);
                generated.push((
                    index,
                    Variant {
                        id: format!("var-{}", index + 1),
                        name: variant_name(index),
                        description: format!("{} / {}", target.provider, response.model),
                        content,
                        provider: target.provider,
                        model: response.model,
                        tokens_used: response.usage.total_tokens,
                    },
                ));
            }
            Err(error) if error.is_cancelled() => {
                // cancellation is not a failure; the variant simply
                // does not materialize
            }
            Err(error) => {
                warn!(
                    provider = target.provider.as_str(),
                    model = target.model.as_str(),
                    error = error.message.as_str(),
                    "variant generation failed"
                );
            }
        }
    }

    generated.sort_by_key(|(index, _)| *index);
    generated.into_iter().map(|(_, variant)| variant).collect()
}

pub(crate) fn text_of(content: &[ContentBlock]) -> String {
    content
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn variants_metadata(variants: &[Variant]) -> serde_json::Value {
    json!({ "variants": variants })
}
