//! Persistence interfaces the data plane consumes. The relational layer
//! itself lives outside this workspace; these traits are its contract, and
//! the in-memory implementations back tests and keyless local runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),
    #[error("constraint violation: {0}")]
    Constraint(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u64,
    pub window_secs: u64,
}

/// Cached authentication principal for one API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyInfo {
    pub name: String,
    pub key_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimit>,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none", with = "time::serde::rfc3339::option", default)]
    pub expires_at: Option<OffsetDateTime>,
}

impl ApiKeyInfo {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardStatus {
    Active,
    Deprecated,
    Archived,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Opaque card document.
    pub card: JsonValue,
    pub version: i64,
    pub status: CardStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Agent cards share the model-card schema; the distinction is the key
/// namespace and the repository table behind it.
pub type AgentCard = ModelCard;

/// Emitted once per completed request, streaming or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub trace_id: String,
    pub api_key_name: String,
    pub incoming_api_type: String,
    pub incoming_model: String,
    pub selected_model: String,
    pub provider: String,
    pub response_status: String,
    pub duration_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    /// True when token counts came from the delta-count floor rather than
    /// upstream accounting.
    #[serde(default)]
    pub usage_estimated: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyInfo>, RepositoryError>;
}

#[async_trait]
pub trait ModelCardRepository: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<ModelCard>, RepositoryError>;
    async fn list_by_project(&self, project_id: &str) -> Result<Vec<ModelCard>, RepositoryError>;
    async fn list_by_skill(&self, skill_id: &str) -> Result<Vec<ModelCard>, RepositoryError>;
    async fn upsert(&self, card: ModelCard) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait UsageRepository: Send + Sync {
    async fn insert(&self, record: UsageRecord) -> Result<(), RepositoryError>;
}

#[derive(Default)]
pub struct MemoryApiKeyRepository {
    keys: Mutex<HashMap<String, ApiKeyInfo>>,
}

impl MemoryApiKeyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ApiKeyInfo) {
        self.keys
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(info.key_hash.clone(), info);
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryApiKeyRepository {
    async fn find_by_hash(&self, key_hash: &str) -> Result<Option<ApiKeyInfo>, RepositoryError> {
        Ok(self
            .keys
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(key_hash)
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryModelCardRepository {
    cards: Mutex<HashMap<String, ModelCard>>,
}

impl MemoryModelCardRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ModelCardRepository for MemoryModelCardRepository {
    async fn get(&self, id: &str) -> Result<Option<ModelCard>, RepositoryError> {
        Ok(self
            .cards
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .get(id)
            .cloned())
    }

    async fn list_by_project(&self, project_id: &str) -> Result<Vec<ModelCard>, RepositoryError> {
        Ok(self
            .cards
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .values()
            .filter(|card| card.workspace_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_by_skill(&self, skill_id: &str) -> Result<Vec<ModelCard>, RepositoryError> {
        Ok(self
            .cards
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .values()
            .filter(|card| {
                card.card
                    .get("skills")
                    .and_then(JsonValue::as_array)
                    .is_some_and(|skills| {
                        skills.iter().any(|skill| skill.as_str() == Some(skill_id))
                    })
            })
            .cloned()
            .collect())
    }

    async fn upsert(&self, card: ModelCard) -> Result<(), RepositoryError> {
        self.cards
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .insert(card.id.clone(), card);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryUsageRepository {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }
}

#[async_trait]
impl UsageRepository for MemoryUsageRepository {
    async fn insert(&self, record: UsageRecord) -> Result<(), RepositoryError> {
        self.records
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .push(record);
        Ok(())
    }
}
