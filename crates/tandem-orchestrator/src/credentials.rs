use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stores::{CredentialStatus, CredentialStore};

/// One ranked fallback candidate. `confidence` is an extension point: it is
/// carried and serialized but no current policy computes or consults it.
/// Resolution order is strictly the list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl FallbackEntry {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            confidence: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub entries: Vec<FallbackEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCredential {
    pub provider: String,
    pub model: String,
    pub secret: String,
}

/// Walks an ordered provider priority list and returns the first usable
/// `(provider, secret)` pair. Exhaustion is a normal outcome, not an error;
/// providers past the first hit are never probed.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    priority: Vec<FallbackEntry>,
}

impl CredentialResolver {
    pub fn new(store: Arc<dyn CredentialStore>, priority: Vec<FallbackEntry>) -> Self {
        Self { store, priority }
    }

    pub fn priority(&self) -> &[FallbackEntry] {
        &self.priority
    }

    pub fn routing_decision(&self) -> RoutingDecision {
        RoutingDecision {
            entries: self.priority.clone(),
        }
    }

    pub async fn resolve(&self) -> Option<ResolvedCredential> {
        for entry in &self.priority {
            if let Some(resolved) = self.try_entry(entry).await {
                return Some(resolved);
            }
        }
        debug!("credential resolution exhausted the provider priority list");
        None
    }

    /// Every entry with a usable credential, in priority order. Used by
    /// multi-provider variant fan-out.
    pub async fn resolve_all(&self) -> Vec<ResolvedCredential> {
        let mut resolved = Vec::new();
        for entry in &self.priority {
            if let Some(credential) = self.try_entry(entry).await {
                resolved.push(credential);
            }
        }
        resolved
    }

    async fn try_entry(&self, entry: &FallbackEntry) -> Option<ResolvedCredential> {
        if self.store.status(&entry.provider).await != CredentialStatus::Valid {
            debug!(
                provider = entry.provider.as_str(),
                "skipping provider without a valid credential record"
            );
            return None;
        }
        match self.store.retrieve_secret(&entry.provider).await {
            Some(secret) if !secret.trim().is_empty() => {
                debug!(
                    provider = entry.provider.as_str(),
                    model = entry.model.as_str(),
                    "resolved provider credential"
                );
                Some(ResolvedCredential {
                    provider: entry.provider.clone(),
                    model: entry.model.clone(),
                    secret,
                })
            }
            _ => None,
        }
    }
}
