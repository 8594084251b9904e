use serde::{Deserialize, Serialize};

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: i64,
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Always serialized, `null` on non-terminal chunks.
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_total: Option<f64>,
}

/// Unified streaming delta, serialized on the wire as an OpenAI
/// `chat.completion.chunk`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ChunkUsage>,
    /// Terminal marker for chunks that carry no `finish_reason` of their own
    /// (an upstream `[DONE]`). Never serialized.
    #[serde(skip)]
    pub terminal: bool,
}

impl Chunk {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            object: CHUNK_OBJECT.to_string(),
            created,
            model: model.into(),
            choices: Vec::new(),
            usage: None,
            terminal: false,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.choices.push(ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: Some(role.into()),
                content: None,
            },
            finish_reason: None,
        });
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.choices.push(ChunkChoice {
            index: 0,
            delta: ChunkDelta {
                role: None,
                content: Some(content.into()),
            },
            finish_reason: None,
        });
        self
    }

    pub fn with_finish(mut self, reason: FinishReason) -> Self {
        self.choices.push(ChunkChoice {
            index: 0,
            delta: ChunkDelta::default(),
            finish_reason: Some(reason),
        });
        self.terminal = true;
        self
    }

    pub fn with_usage(mut self, usage: ChunkUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.iter().find_map(|choice| choice.finish_reason)
    }

    pub fn is_finished(&self) -> bool {
        self.terminal || self.finish_reason().is_some()
    }

    /// First non-empty content delta, if any.
    pub fn content(&self) -> Option<&str> {
        self.choices
            .iter()
            .find_map(|choice| choice.delta.content.as_deref())
            .filter(|content| !content.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_terminal_chunk_serializes_null_finish_reason() {
        let chunk = Chunk::new("c1", "gpt-4", 1_700_000_000).with_content("Hi");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["choices"][0]["finish_reason"], serde_json::Value::Null);
        assert!(json.get("usage").is_none());
    }

    #[test]
    fn terminal_chunk_carries_reason() {
        let chunk = Chunk::new("c1", "gpt-4", 0).with_finish(FinishReason::Length);
        assert!(chunk.is_finished());
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn decodes_sparse_openai_chunk() {
        let chunk: Chunk = serde_json::from_str(
            r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.content(), Some("Hi"));
        assert!(!chunk.is_finished());
        assert!(chunk.model.is_empty());
    }
}
