use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crag_core::config::ModelConfig;
use crag_core::error::{CragError, Result};
use crag_core::types::{ChatMessage, Role, StopReason, StreamDelta};

use super::WireFormat;
use crate::streaming::SseEvent;

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini `streamGenerateContent`.
#[derive(Default)]
pub struct Gemini;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize, Debug, PartialEq)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'static str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize, Debug, PartialEq)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateChunk {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
}

/// System messages become the system instruction; the assistant role is
/// called "model".
fn to_contents(messages: &[ChatMessage]) -> (Option<Content<'_>>, Vec<Content<'_>>) {
    let mut system = Vec::new();
    let mut contents = Vec::new();
    for m in messages {
        let part = Part { text: &m.content };
        match m.role {
            Role::System => system.push(part),
            Role::User => contents.push(Content {
                role: Some("user"),
                parts: vec![part],
            }),
            Role::Assistant => contents.push(Content {
                role: Some("model"),
                parts: vec![part],
            }),
        }
    }
    let system = (!system.is_empty()).then_some(Content {
        role: None,
        parts: system,
    });
    (system, contents)
}

impl WireFormat for Gemini {
    const NAME: &'static str = "gemini";

    fn request(&self, http: &Client, config: &ModelConfig, messages: &[ChatMessage]) -> Result<RequestBuilder> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| CragError::Config("gemini: api_key is required".into()))?;
        let base = config.base_url.as_deref().unwrap_or(API_BASE).trim_end_matches('/');
        let url = format!("{}/models/{}:streamGenerateContent?alt=sse", base, config.model_id);

        let (system_instruction, contents) = to_contents(messages);
        let body = GenerateRequest {
            contents,
            system_instruction,
            generation_config: GenerationConfig {
                max_output_tokens: config.max_tokens,
                temperature: config.temperature,
            },
        };
        Ok(http.post(url).header("x-goog-api-key", api_key).json(&body))
    }

    /// A single chunk can carry text, a finish reason and usage together.
    fn parse_event(event: SseEvent) -> Vec<Result<StreamDelta>> {
        let chunk = match serde_json::from_str::<GenerateChunk>(&event.data) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(data = %event.data, error = %e, "Unreadable Gemini chunk");
                return vec![];
            }
        };

        let mut deltas = Vec::new();
        if let Some(candidate) = chunk.candidates.into_iter().next() {
            let text: String = candidate
                .content
                .map(|c| c.parts.into_iter().map(|p| p.text).collect())
                .unwrap_or_default();
            if !text.is_empty() {
                deltas.push(Ok(StreamDelta::TextDelta(text)));
            }
            if let Some(reason) = candidate.finish_reason {
                let stop = if reason == "MAX_TOKENS" {
                    StopReason::MaxTokens
                } else {
                    StopReason::EndTurn
                };
                deltas.push(Ok(StreamDelta::Stop(stop)));
            }
        }
        if let Some(usage) = chunk.usage_metadata {
            deltas.push(Ok(StreamDelta::Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            }));
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
    fn test_system_instruction_and_model_role() {
        let messages = vec![
            ChatMessage::system("Route the question."),
            ChatMessage::user("What is the weather in Tokyo?"),
            ChatMessage::assistant_text("web_search"),
        ];
        let (system, contents) = to_contents(&messages);
        assert_eq!(
            system,
            Some(Content {
                role: None,
                parts: vec![Part {
                    text: "Route the question."
                }],
            })
        );
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1].role, Some("model"));
    }

    #[test]
    fn test_request_url_and_camel_case_body() {
        let mut config = test_model_config();
        config.model_id = "gemini-2.5-flash".into();
        config.api_key = Some("g-key".into());
        let request = Gemini
            .request(&Client::new(), &config, &[ChatMessage::system("s"), ChatMessage::user("hi")])
            .unwrap()
            .build()
            .unwrap();
        assert!(request
            .url()
            .as_str()
            .ends_with("/models/gemini-2.5-flash:streamGenerateContent?alt=sse"));
        let body: serde_json::Value =
            serde_json::from_slice(request.body().unwrap().as_bytes().unwrap()).unwrap();
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "s");
    }

    #[test]
    fn test_request_requires_key() {
        let result = Gemini.request(&Client::new(), &test_model_config(), &[]);
        assert!(matches!(result, Err(CragError::Config(_))));
    }

    #[test]
    fn test_parse_final_chunk() {
        let deltas = Gemini::parse_event(event(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"useful"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":40,"candidatesTokenCount":1}}"#,
        ));
        assert_eq!(deltas.len(), 3);
        assert!(matches!(&deltas[0], Ok(StreamDelta::TextDelta(t)) if t == "useful"));
        assert!(matches!(deltas[1], Ok(StreamDelta::Stop(StopReason::EndTurn))));
    }

    #[test]
    fn test_parse_truncated_answer() {
        let deltas = Gemini::parse_event(event(r#"{"candidates":[{"finishReason":"MAX_TOKENS"}]}"#));
        assert!(matches!(deltas[..], [Ok(StreamDelta::Stop(StopReason::MaxTokens))]));
    }
}
