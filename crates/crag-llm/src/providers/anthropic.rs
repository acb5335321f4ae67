use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crag_core::config::ModelConfig;
use crag_core::error::{CragError, Result};
use crag_core::types::{ChatMessage, Role, StopReason, StreamDelta};

use super::WireFormat;
use crate::streaming::SseEvent;

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API.
#[derive(Default)]
pub struct Anthropic;

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Turn<'a>>,
    stream: bool,
}

#[derive(Serialize, Debug, PartialEq)]
struct Turn<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event {
    MessageStart { message: StartedMessage },
    ContentBlockDelta { delta: BlockDelta },
    MessageDelta {
        delta: MessageStatus,
        #[serde(default)]
        usage: Option<Usage>,
    },
    Error { error: ApiError },
    #[serde(other)]
    Ignored,
}

#[derive(Deserialize)]
struct StartedMessage {
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct MessageStatus {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// System prompts travel out of band; several are joined with a blank line.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<Turn<'_>>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let turns = messages
        .iter()
        .filter_map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => return None,
            };
            Some(Turn {
                role,
                content: &m.content,
            })
        })
        .collect();
    let system = (!system.is_empty()).then(|| system.join("\n\n"));
    (system, turns)
}

impl WireFormat for Anthropic {
    const NAME: &'static str = "anthropic";

    fn request(&self, http: &Client, config: &ModelConfig, messages: &[ChatMessage]) -> Result<RequestBuilder> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| CragError::Config("anthropic: api_key is required".into()))?;
        let (system, turns) = split_system(messages);
        let body = MessagesRequest {
            model: &config.model_id,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system,
            messages: turns,
            stream: true,
        };
        Ok(http
            .post(config.base_url.as_deref().unwrap_or(MESSAGES_URL))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body))
    }

    fn parse_event(event: SseEvent) -> Vec<Result<StreamDelta>> {
        let parsed = match serde_json::from_str::<Event>(&event.data) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(data = %event.data, error = %e, "Unreadable Anthropic event");
                return vec![];
            }
        };
        match parsed {
            Event::MessageStart { message } => message
                .usage
                .map(|u| {
                    Ok(StreamDelta::Usage {
                        input_tokens: u.input_tokens,
                        output_tokens: u.output_tokens,
                    })
                })
                .into_iter()
                .collect(),
            Event::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
            } => vec![Ok(StreamDelta::TextDelta(text))],
            Event::MessageDelta { delta, usage } => {
                if let Some(u) = usage {
                    debug!(output_tokens = u.output_tokens, "Anthropic usage");
                }
                let stop = match delta.stop_reason.as_deref() {
                    Some("end_turn") => StopReason::EndTurn,
                    Some("max_tokens") => StopReason::MaxTokens,
                    Some("stop_sequence") => StopReason::StopSequence,
                    _ => return vec![],
                };
                vec![Ok(StreamDelta::Stop(stop))]
            }
            Event::Error { error } => vec![Err(CragError::LlmStream(error.message))],
            Event::ContentBlockDelta { .. } | Event::Ignored => vec![],
        }
    }
}
