use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

pub const DEFAULT_NAMESPACE: &str = "rad:";

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("cache encoding error: {0}")]
    Encoding(String),
}

/// Byte-level KV cache. A miss is `Ok(None)`, never an error; callers fall
/// through to the repository and repopulate.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError>;
    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Glob pattern over un-prefixed keys; returns the number deleted.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64, CacheError>;
    async fn ping(&self) -> Result<(), CacheError>;
    async fn close(&self);
}

/// All keys are prefixed with a configured namespace before they reach the
/// store.
#[derive(Debug, Clone)]
pub struct Namespace(String);

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self(prefix.into())
    }

    pub fn key(&self, key: &str) -> String {
        format!("{}{}", self.0, key)
    }

    pub fn prefix(&self) -> &str {
        &self.0
    }
}

impl Default for Namespace {
    fn default() -> Self {
        Self(DEFAULT_NAMESPACE.to_string())
    }
}

/// Minimal glob matcher: `*` matches any run (including empty), `?` one
/// character. Enough for the cache's key patterns.
pub(crate) fn glob_match(pattern: &str, input: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let input: Vec<char> = input.chars().collect();

    let (mut p, mut i) = (0usize, 0usize);
    let (mut star, mut star_input) = (None::<usize>, 0usize);

    while i < input.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == input[i]) {
            p += 1;
            i += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_input = i;
            p += 1;
        } else if let Some(star_at) = star {
            p = star_at + 1;
            star_input += 1;
            i = star_input;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespace_prefixes_keys() {
        let ns = Namespace::default();
        assert_eq!(ns.key("model_card:42"), "rad:model_card:42");
        let custom = Namespace::new("gw:");
        assert_eq!(custom.key("x"), "gw:x");
    }

    #[test]
    fn glob_star_matches_runs() {
        assert!(glob_match("model_cards:skill:*", "model_cards:skill:s1"));
        assert!(glob_match("model_cards:skill:*", "model_cards:skill:"));
        assert!(!glob_match("model_cards:skill:*", "model_cards:project:p1"));
        assert!(glob_match("*", "anything"));
        assert!(glob_match("a*c", "abbbc"));
        assert!(!glob_match("a*c", "abbb"));
    }

    #[test]
    fn glob_question_matches_one() {
        assert!(glob_match("key:?", "key:a"));
        assert!(!glob_match("key:?", "key:ab"));
    }
}
