//! Typed cache-aside views over the byte cache: model cards, agent cards,
//! API-key auth info. Key conventions and TTLs are part of the contract —
//! writers must invalidate every key a card can appear under.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::warn;

use rad_provider_core::{AgentCard, ApiKeyInfo, ModelCard};

use crate::cache::{Cache, CacheError};

pub const MODEL_CARD_TTL: Duration = Duration::from_secs(300);
/// Lists churn more than individual cards.
pub const PROJECT_LIST_TTL: Duration = Duration::from_secs(120);
pub const SKILL_LIST_TTL: Duration = Duration::from_secs(300);
pub const API_KEY_TTL: Duration = Duration::from_secs(300);

fn model_card_key(id: &str) -> String {
    format!("model_card:{id}")
}

fn model_project_key(project_id: &str) -> String {
    format!("model_cards:project:{project_id}")
}

fn model_skill_key(skill_id: &str) -> String {
    format!("model_cards:skill:{skill_id}")
}

fn agent_card_key(id: &str) -> String {
    format!("agent_card:{id}")
}

fn agent_project_key(project_id: &str) -> String {
    format!("agent_cards:project:{project_id}")
}

fn api_key_key(hash: &str) -> String {
    format!("api_key:{hash}")
}

#[derive(Clone)]
pub struct TypedCache {
    cache: Arc<dyn Cache>,
}

impl TypedCache {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }

    pub fn raw(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(bytes) = self.cache.get(key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                // A corrupt entry is treated as a miss and purged.
                warn!(event = "cache_decode_failed", key = %key, error = %err);
                self.cache.delete(key).await?;
                Ok(None)
            }
        }
    }

    async fn set_json<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let bytes =
            serde_json::to_vec(value).map_err(|err| CacheError::Encoding(err.to_string()))?;
        self.cache.set(key, Bytes::from(bytes), ttl).await
    }

    pub async fn model_card(&self, id: &str) -> Result<Option<ModelCard>, CacheError> {
        self.get_json(&model_card_key(id)).await
    }

    pub async fn put_model_card(&self, card: &ModelCard) -> Result<(), CacheError> {
        self.set_json(&model_card_key(&card.id), card, MODEL_CARD_TTL)
            .await
    }

    pub async fn project_cards(
        &self,
        project_id: &str,
    ) -> Result<Option<Vec<ModelCard>>, CacheError> {
        self.get_json(&model_project_key(project_id)).await
    }

    pub async fn put_project_cards(
        &self,
        project_id: &str,
        cards: &[ModelCard],
    ) -> Result<(), CacheError> {
        self.set_json(&model_project_key(project_id), &cards, PROJECT_LIST_TTL)
            .await
    }

    pub async fn skill_cards(&self, skill_id: &str) -> Result<Option<Vec<ModelCard>>, CacheError> {
        self.get_json(&model_skill_key(skill_id)).await
    }

    pub async fn put_skill_cards(
        &self,
        skill_id: &str,
        cards: &[ModelCard],
    ) -> Result<(), CacheError> {
        self.set_json(&model_skill_key(skill_id), &cards, SKILL_LIST_TTL)
            .await
    }

    /// Invalidation contract for card writes: the individual key, the
    /// project-list key when known, and every skill-list key.
    pub async fn invalidate_card(
        &self,
        id: &str,
        project_id: Option<&str>,
    ) -> Result<(), CacheError> {
        self.cache.delete(&model_card_key(id)).await?;
        if let Some(project_id) = project_id {
            self.cache.delete(&model_project_key(project_id)).await?;
        }
        self.cache.delete_pattern("model_cards:skill:*").await?;
        Ok(())
    }

    pub async fn agent_card(&self, id: &str) -> Result<Option<AgentCard>, CacheError> {
        self.get_json(&agent_card_key(id)).await
    }

    pub async fn put_agent_card(&self, card: &AgentCard) -> Result<(), CacheError> {
        self.set_json(&agent_card_key(&card.id), card, MODEL_CARD_TTL)
            .await
    }

    pub async fn invalidate_agent_card(
        &self,
        id: &str,
        project_id: Option<&str>,
    ) -> Result<(), CacheError> {
        self.cache.delete(&agent_card_key(id)).await?;
        if let Some(project_id) = project_id {
            self.cache.delete(&agent_project_key(project_id)).await?;
        }
        self.cache.delete_pattern("agent_cards:skill:*").await?;
        Ok(())
    }

    /// Cached auth info self-expires against `expires_at` even when the TTL
    /// has not elapsed.
    pub async fn api_key(&self, hash: &str) -> Result<Option<ApiKeyInfo>, CacheError> {
        let key = api_key_key(hash);
        let Some(info) = self.get_json::<ApiKeyInfo>(&key).await? else {
            return Ok(None);
        };
        if info.is_expired(OffsetDateTime::now_utc()) {
            self.cache.delete(&key).await?;
            return Ok(None);
        }
        Ok(Some(info))
    }

    pub async fn put_api_key(&self, info: &ApiKeyInfo) -> Result<(), CacheError> {
        self.set_json(&api_key_key(&info.key_hash), info, API_KEY_TTL)
            .await
    }

    pub async fn invalidate_api_key(&self, hash: &str) -> Result<(), CacheError> {
        self.cache.delete(&api_key_key(hash)).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::Duration as TimeDuration;

    use rad_provider_core::CardStatus;

    use crate::cache::Namespace;
    use crate::memory::MemoryCache;

    use super::*;

    fn typed() -> TypedCache {
        TypedCache::new(Arc::new(MemoryCache::new(Namespace::default())))
    }

    fn card(id: &str, project: &str) -> ModelCard {
        let now = OffsetDateTime::now_utc();
        ModelCard {
            id: id.to_string(),
            workspace_id: project.to_string(),
            name: format!("card {id}"),
            slug: id.to_string(),
            description: None,
            card: json!({"skills": ["s1"]}),
            version: 1,
            status: CardStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn card_round_trips() {
        let typed = typed();
        let card = card("42", "p1");
        typed.put_model_card(&card).await.unwrap();
        assert_eq!(typed.model_card("42").await.unwrap(), Some(card));
        assert_eq!(typed.model_card("43").await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalidate_clears_every_view() {
        let typed = typed();
        let card = card("42", "p1");
        typed.put_model_card(&card).await.unwrap();
        typed.put_project_cards("p1", &[card.clone()]).await.unwrap();
        typed.put_skill_cards("s1", &[card.clone()]).await.unwrap();
        typed.put_skill_cards("s2", &[card.clone()]).await.unwrap();

        typed.invalidate_card("42", Some("p1")).await.unwrap();

        assert!(typed.model_card("42").await.unwrap().is_none());
        assert!(typed.project_cards("p1").await.unwrap().is_none());
        assert!(typed.skill_cards("s1").await.unwrap().is_none());
        assert!(typed.skill_cards("s2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn api_key_self_invalidates_past_expiry() {
        let typed = typed();
        let info = ApiKeyInfo {
            name: "ci".to_string(),
            key_hash: "abc".to_string(),
            project_id: None,
            role: None,
            rate_limit: None,
            valid: true,
            expires_at: Some(OffsetDateTime::now_utc() - TimeDuration::seconds(1)),
        };
        typed.put_api_key(&info).await.unwrap();
        // TTL has not elapsed, but the key itself has.
        assert!(typed.api_key("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn live_api_key_is_served() {
        let typed = typed();
        let info = ApiKeyInfo {
            name: "ci".to_string(),
            key_hash: "abc".to_string(),
            project_id: Some("p1".to_string()),
            role: None,
            rate_limit: None,
            valid: true,
            expires_at: Some(OffsetDateTime::now_utc() + TimeDuration::hours(1)),
        };
        typed.put_api_key(&info).await.unwrap();
        assert_eq!(typed.api_key("abc").await.unwrap(), Some(info));
    }

    #[tokio::test]
    async fn corrupt_entry_reads_as_miss() {
        let raw = Arc::new(MemoryCache::new(Namespace::default()));
        let typed = TypedCache::new(raw.clone());
        raw.set(
            "model_card:bad",
            Bytes::from_static(b"not json"),
            Duration::from_secs(60),
        )
        .await
        .unwrap();
        assert!(typed.model_card("bad").await.unwrap().is_none());
    }
}
