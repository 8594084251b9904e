//! Request mappings between provider dialects and the unified chat shape.
//!
//! Ingress: Anthropic/Gemini-shaped requests are normalized into the unified
//! (OpenAI) shape. Egress: adapters translate the unified shape back into
//! whatever their upstream speaks.

use serde_json::{json, Map, Value as JsonValue};

use rad_protocol::anthropic::{AnthropicMessage, MessagesRequest};
use rad_protocol::gemini::{GeminiContent, GeminiPart, GenerateContentRequest};
use rad_protocol::openai::{ChatCompletionRequest, ChatMessage};

const DEFAULT_ANTHROPIC_MAX_TOKENS: u64 = 4096;

fn block_text(content: &JsonValue) -> String {
    match content {
        JsonValue::String(text) => text.clone(),
        JsonValue::Array(blocks) => blocks
            .iter()
            .filter_map(|block| block.get("text").and_then(JsonValue::as_str))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

/// Ingress: Anthropic `/v1/messages` body → unified chat request.
pub fn anthropic_to_chat(request: MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if let Some(system) = &request.system {
        let text = block_text(system);
        if !text.is_empty() {
            messages.push(ChatMessage::text("system", text));
        }
    }
    for message in &request.messages {
        messages.push(ChatMessage::text(
            message.role.clone(),
            block_text(&message.content),
        ));
    }
    ChatCompletionRequest {
        model: request.model,
        messages,
        stream: request.stream,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        extra: Map::new(),
    }
}

/// Ingress: Gemini `generateContent` body → unified chat request. The model
/// comes from the URL, not the body.
pub fn gemini_to_chat(
    request: GenerateContentRequest,
    model: String,
    stream: bool,
) -> ChatCompletionRequest {
    let mut messages = Vec::with_capacity(request.contents.len() + 1);
    if let Some(instruction) = &request.system_instruction {
        let text = instruction.text();
        if !text.is_empty() {
            messages.push(ChatMessage::text("system", text));
        }
    }
    for content in &request.contents {
        let role = match content.role.as_deref() {
            Some("model") => "assistant",
            Some(role) => role,
            None => "user",
        };
        messages.push(ChatMessage::text(role, content.text()));
    }
    let max_tokens = request
        .generation_config
        .as_ref()
        .and_then(|config| config.get("maxOutputTokens"))
        .and_then(JsonValue::as_u64);
    let temperature = request
        .generation_config
        .as_ref()
        .and_then(|config| config.get("temperature"))
        .and_then(JsonValue::as_f64);
    ChatCompletionRequest {
        model,
        messages,
        stream: stream.then_some(true),
        max_tokens,
        temperature,
        extra: Map::new(),
    }
}

/// Egress: unified chat request → Anthropic messages request.
pub fn chat_to_anthropic(request: &ChatCompletionRequest) -> MessagesRequest {
    let mut system_parts = Vec::new();
    let mut messages = Vec::new();
    for message in &request.messages {
        if message.role == "system" || message.role == "developer" {
            system_parts.push(message.content_text());
        } else {
            messages.push(AnthropicMessage {
                role: message.role.clone(),
                content: JsonValue::String(message.content_text()),
            });
        }
    }
    let system = if system_parts.is_empty() {
        None
    } else {
        Some(JsonValue::String(system_parts.join("\n")))
    };
    MessagesRequest {
        model: request.model.clone(),
        max_tokens: request.max_tokens.unwrap_or(DEFAULT_ANTHROPIC_MAX_TOKENS),
        messages,
        system,
        stream: request.stream,
        temperature: request.temperature,
        extra: Map::new(),
    }
}

/// Egress: unified chat request → Gemini generateContent request.
pub fn chat_to_gemini(request: &ChatCompletionRequest) -> GenerateContentRequest {
    let mut system_parts = Vec::new();
    let mut contents = Vec::new();
    for message in &request.messages {
        let text = message.content_text();
        match message.role.as_str() {
            "system" | "developer" => system_parts.push(text),
            role => contents.push(GeminiContent {
                role: Some(if role == "assistant" {
                    "model".to_string()
                } else {
                    "user".to_string()
                }),
                parts: vec![GeminiPart { text: Some(text) }],
            }),
        }
    }
    let system_instruction = if system_parts.is_empty() {
        None
    } else {
        Some(GeminiContent {
            role: None,
            parts: vec![GeminiPart {
                text: Some(system_parts.join("\n")),
            }],
        })
    };
    let mut config = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        config.insert("maxOutputTokens".to_string(), json!(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), json!(temperature));
    }
    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: if config.is_empty() {
            None
        } else {
            Some(JsonValue::Object(config))
        },
        extra: Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_system_prompt_becomes_leading_message() {
        let request: MessagesRequest = serde_json::from_str(
            r#"{"model":"claude-3","max_tokens":128,"system":"be brief","messages":[{"role":"user","content":"hi"}]}"#,
        )
        .unwrap();
        let chat = anthropic_to_chat(request);
        assert_eq!(chat.messages[0].role, "system");
        assert_eq!(chat.messages[0].content_text(), "be brief");
        assert_eq!(chat.messages[1].role, "user");
        assert_eq!(chat.max_tokens, Some(128));
    }

    #[test]
    fn gemini_model_role_maps_to_assistant() {
        let request: GenerateContentRequest = serde_json::from_str(
            r#"{"contents":[{"role":"user","parts":[{"text":"hi"}]},{"role":"model","parts":[{"text":"hello"}]}]}"#,
        )
        .unwrap();
        let chat = gemini_to_chat(request, "gemini-1.5-pro".to_string(), true);
        assert_eq!(chat.model, "gemini-1.5-pro");
        assert_eq!(chat.messages[1].role, "assistant");
        assert_eq!(chat.stream, Some(true));
    }

    #[test]
    fn chat_round_trips_to_anthropic_shape() {
        let chat: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"claude-3","messages":[{"role":"system","content":"be brief"},{"role":"user","content":"hi"}],"max_tokens":64}"#,
        )
        .unwrap();
        let messages = chat_to_anthropic(&chat);
        assert_eq!(messages.system, Some(JsonValue::String("be brief".into())));
        assert_eq!(messages.messages.len(), 1);
        assert_eq!(messages.max_tokens, 64);
    }

    #[test]
    fn chat_maps_to_gemini_generation_config() {
        let chat: ChatCompletionRequest = serde_json::from_str(
            r#"{"model":"gemini-1.5-flash","messages":[{"role":"user","content":"hi"}],"max_tokens":32,"temperature":0.5}"#,
        )
        .unwrap();
        let generate = chat_to_gemini(&chat);
        let config = generate.generation_config.expect("config");
        assert_eq!(config["maxOutputTokens"], 32);
        assert_eq!(config["temperature"], 0.5);
    }
}
