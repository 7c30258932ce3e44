use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::json;

use crate::services::ai::types::{CanonicalChunk, CanonicalRequest, ContentPart, PromptRole};
use crate::services::config::{ProviderFamily, ProviderSettings};

use super::{data_uri_mime, data_uri_payload, non_blank, ChunkBatch, ProviderAdapter};

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic Messages API. System prompts move to the top-level `system` field.
pub struct AnthropicAdapter;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    ContentBlockDelta { delta: BlockDelta },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    #[serde(other)]
    Other,
}

impl ProviderAdapter for AnthropicAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn build_request_body(
        &self,
        request: &CanonicalRequest,
        settings: &ProviderSettings,
    ) -> serde_json::Value {
        let mut system = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            if message.role == PromptRole::System {
                system.push(message.joined_text("\n"));
                continue;
            }
            let blocks: Vec<serde_json::Value> = message
                .content
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(json!({ "type": "text", "text": text })),
                    ContentPart::Image { url } => Some(json!({
                        "type": "image",
                        "source": {
                            "type": "base64",
                            "media_type": data_uri_mime(url).unwrap_or("image/jpeg"),
                            "data": data_uri_payload(url),
                        }
                    })),
                    ContentPart::Video { .. } => {
                        log::debug!("Anthropic does not accept video input; part dropped");
                        None
                    }
                })
                .collect();
            messages.push(json!({ "role": message.role, "content": blocks }));
        }

        let mut body = json!({
            "model": settings.model,
            "max_tokens": settings.max_tokens,
            "temperature": settings.temperature,
            "top_p": settings.top_p,
            "messages": messages,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        body
    }

    fn build_headers(&self, settings: &ProviderSettings) -> BTreeMap<String, String> {
        let mut headers = super::json_headers();
        headers.insert("x-api-key".to_string(), settings.api_key.clone());
        headers.insert(
            "anthropic-version".to_string(),
            ANTHROPIC_VERSION.to_string(),
        );
        headers
    }

    fn completion_text(&self, response: &serde_json::Value) -> Option<String> {
        response
            .get("content")?
            .as_array()?
            .iter()
            .filter(|block| block.get("type").and_then(|t| t.as_str()) == Some("text"))
            .filter_map(|block| block.get("text")?.as_str())
            .find_map(non_blank)
    }

    fn parse_payload(&self, payload: &str) -> Result<ChunkBatch, serde_json::Error> {
        let event: StreamEvent = serde_json::from_str(payload)?;
        let mut batch = ChunkBatch::new();
        if let StreamEvent::ContentBlockDelta { delta } = event {
            match delta {
                BlockDelta::TextDelta { text } if !text.is_empty() => {
                    batch.push(CanonicalChunk::content(text))
                }
                BlockDelta::ThinkingDelta { thinking } if !thinking.is_empty() => {
                    batch.push(CanonicalChunk::reasoning(thinking))
                }
                _ => {}
            }
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ai::types::CanonicalMessage;
    use crate::services::config::Provider;
    use pretty_assertions::assert_eq;

    #[test]
    fn body_lifts_system_prompt() {
        let mut settings = ProviderSettings::for_provider(Provider::Anthropic);
        settings.model = "claude-test".to_string();
        settings.max_tokens = 100;
        settings.temperature = 0.7;
        settings.top_p = 1.0;
        let request = CanonicalRequest {
            messages: vec![
                CanonicalMessage {
                    role: PromptRole::System,
                    content: vec![ContentPart::text("be brief")],
                },
                CanonicalMessage {
                    role: PromptRole::User,
                    content: vec![
                        ContentPart::text("what is this?"),
                        ContentPart::Image {
                            url: "data:image/png;base64,QUJD".to_string(),
                        },
                    ],
                },
            ],
        };

        let body = AnthropicAdapter.build_request_body(&request, &settings);
        assert_eq!(
            body,
            json!({
                "model": "claude-test",
                "max_tokens": 100,
                "temperature": 0.7,
                "top_p": 1.0,
                "stream": true,
                "system": "be brief",
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "what is this?" },
                        { "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": "QUJD" } }
                    ]
                }]
            })
        );
    }

    #[test]
    fn headers_carry_key_and_version() {
        let mut settings = ProviderSettings::for_provider(Provider::Anthropic);
        settings.api_key = "ak".to_string();
        let headers = AnthropicAdapter.build_headers(&settings);
        assert_eq!(headers["x-api-key"], "ak");
        assert_eq!(headers["anthropic-version"], "2023-06-01");
        assert!(!headers.contains_key("Authorization"));
    }

    #[test]
    fn parses_text_and_thinking_deltas() {
        let text = AnthropicAdapter.parse_chunk(
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        );
        assert_eq!(text.as_slice(), &[CanonicalChunk::content("Hi")]);

        let thinking = AnthropicAdapter.parse_chunk(
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
        );
        assert_eq!(thinking.as_slice(), &[CanonicalChunk::reasoning("hmm")]);
    }

    #[test]
    fn bookkeeping_events_yield_nothing() {
        assert!(AnthropicAdapter
            .parse_chunk(r#"data: {"type":"message_start","message":{"id":"m"}}"#)
            .is_empty());
        assert!(AnthropicAdapter.parse_chunk("event: content_block_delta").is_empty());
        assert!(AnthropicAdapter
            .parse_chunk(r#"data: {"type":"ping"}"#)
            .is_empty());
    }

    #[test]
    fn completion_reads_first_text_block() {
        let response = json!({ "content": [
            { "type": "thinking", "thinking": "hmm" },
            { "type": "text", "text": "answer" }
        ] });
        assert_eq!(AnthropicAdapter.completion_text(&response).as_deref(), Some("answer"));

        let request = CanonicalRequest { messages: Vec::new() };
        let settings = ProviderSettings::for_provider(Provider::Anthropic);
        let (_, spec) = AnthropicAdapter.build_completion_request(&request, &settings);
        let body: serde_json::Value = serde_json::from_str(&spec.body.unwrap()).unwrap();
        assert_eq!(body["stream"], json!(false));
    }
}
