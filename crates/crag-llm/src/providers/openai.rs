use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crag_core::config::ModelConfig;
use crag_core::error::Result;
use crag_core::types::{ChatMessage, Role, StopReason, StreamDelta};

use super::WireFormat;
use crate::streaming::SseEvent;

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI chat completions, and everything that speaks it: Ollama, vLLM,
/// Groq, OpenRouter. The API key is optional for local servers.
#[derive(Default)]
pub struct OpenAiCompatible;

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    stream_options: UsageOption,
}

#[derive(Serialize)]
struct UsageOption {
    include_usage: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct Chunk {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    delta: ChoiceDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct ChoiceDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage<'_>> {
    messages
        .iter()
        .map(|m| WireMessage {
            role: match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
            },
            content: &m.content,
        })
        .collect()
}

/// Reasoning models (o1, o3, o4 families) reject `temperature`.
fn accepts_temperature(model_id: &str) -> bool {
    !["o1", "o3", "o4"].iter().any(|p| model_id.starts_with(p))
}

impl WireFormat for OpenAiCompatible {
    const NAME: &'static str = "openai";

    fn request(&self, http: &Client, config: &ModelConfig, messages: &[ChatMessage]) -> Result<RequestBuilder> {
        let body = CompletionRequest {
            model: &config.model_id,
            messages: wire_messages(messages),
            max_tokens: config.max_tokens,
            temperature: accepts_temperature(&config.model_id).then_some(config.temperature),
            stream: true,
            stream_options: UsageOption {
                include_usage: true,
            },
        };
        let mut request = http
            .post(config.base_url.as_deref().unwrap_or(CHAT_COMPLETIONS_URL))
            .json(&body);
        if let Some(key) = &config.api_key {
            request = request.bearer_auth(key);
        }
        Ok(request)
    }

    fn parse_event(event: SseEvent) -> Vec<Result<StreamDelta>> {
        if event.data.trim() == "[DONE]" {
            return vec![];
        }
        let chunk = match serde_json::from_str::<Chunk>(&event.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(data = %event.data, error = %e, "Unreadable OpenAI chunk");
                return vec![];
            }
        };

        let mut deltas = Vec::new();
        if let Some(usage) = chunk.usage {
            deltas.push(Ok(StreamDelta::Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            }));
        }
        // Text and finish reason can arrive in the same chunk
        for choice in chunk.choices.into_iter().take(1) {
            if let Some(text) = choice.delta.content.filter(|t| !t.is_empty()) {
                deltas.push(Ok(StreamDelta::TextDelta(text)));
            }
            if let Some(reason) = choice.finish_reason {
                deltas.push(Ok(StreamDelta::Stop(match reason.as_str() {
                    "length" => StopReason::MaxTokens,
                    "stop_sequence" => StopReason::StopSequence,
                    _ => StopReason::EndTurn,
                })));
            }
        }
        deltas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::event;
    use crag_test_utils::test_model_config;

    #[test]
    fn test_wire_roles() {
        let messages = vec![ChatMessage::system("grade it"), ChatMessage::user("question")];
        assert_eq!(
            wire_messages(&messages),
            vec![
                WireMessage {
                    role: "system",
                    content: "grade it"
                },
                WireMessage {
                    role: "user",
                    content: "question"
                },
            ]
        );
    }

    #[test]
    fn test_request_without_key_for_local_server() {
        let mut config = test_model_config();
        config.base_url = Some("http://localhost:11434/v1/chat/completions".into());
        let request = OpenAiCompatible
            .request(&Client::new(), &config, &[ChatMessage::user("hi")])
            .unwrap()
            .build()
            .unwrap();
        assert!(request.headers().get("authorization").is_none());
        assert_eq!(request.url().port(), Some(11434));
    }

    #[test]
    fn test_reasoning_models_omit_temperature() {
        assert!(accepts_temperature("gpt-4o-mini"));
        assert!(!accepts_temperature("o3-mini"));

        let mut config = test_model_config();
        config.model_id = "o4-mini".into();
        config.api_key = Some("sk".into());
        let request = OpenAiCompatible
            .request(&Client::new(), &config, &[ChatMessage::user("hi")])
            .unwrap()
            .build()
            .unwrap();
        let body: serde_json::Value =
            serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert!(body.get("temperature").is_none());
        assert_eq!(request.headers()["authorization"], "Bearer sk");
    }

    #[test]
    fn test_parse_text_with_finish_reason() {
        let deltas = OpenAiCompatible::parse_event(event(
            r#"{"choices":[{"delta":{"content":"yes"},"finish_reason":"stop"}]}"#,
        ));
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "yes"));
        assert!(matches!(deltas[1], Ok(StreamDelta::Stop(StopReason::EndTurn))));
    }

    #[test]
    fn test_parse_usage_chunk() {
        let deltas = OpenAiCompatible::parse_event(event(
            r#"{"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#,
        ));
        assert!(matches!(
            deltas[..],
            [Ok(StreamDelta::Usage {
                input_tokens: 12,
                output_tokens: 3
            })]
        ));
    }

    #[test]
    fn test_parse_done_and_garbage() {
        assert!(OpenAiCompatible::parse_event(event("[DONE]")).is_empty());
        assert!(OpenAiCompatible::parse_event(event("not json")).is_empty());
    }
}
