use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::json;

use crate::services::ai::types::{
    CanonicalChunk, CanonicalMessage, CanonicalRequest, ContentPart,
};
use crate::services::config::{Provider, ProviderFamily, ProviderSettings};

use super::{data_uri_payload, non_blank, ChunkBatch, ProviderAdapter};

const OPENROUTER_REFERER: &str = "https://github.com/polaris-desk/polaris";
const OPENROUTER_TITLE: &str = "PolarisDesk";

/// OpenAI chat-completions wire format, shared by DeepSeek, Moonshot,
/// OpenRouter, SiliconCloud, Zhipu and custom endpoints.
pub struct OpenAiCompatibleAdapter;

/// Stream chunk that keeps DeepSeek-style `reasoning_content`.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    reasoning_content: Option<String>,
}

fn message_json(message: &CanonicalMessage) -> serde_json::Value {
    let parts: Vec<serde_json::Value> = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::Text { text } => json!({ "type": "text", "text": text }),
            ContentPart::Image { url } => {
                json!({ "type": "image_url", "image_url": { "url": data_uri_payload(url) } })
            }
            ContentPart::Video { url } => {
                json!({ "type": "video_url", "video_url": { "url": data_uri_payload(url) } })
            }
        })
        .collect();
    json!({ "role": message.role, "content": parts })
}

impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAiCompatible
    }

    fn build_request_body(
        &self,
        request: &CanonicalRequest,
        settings: &ProviderSettings,
    ) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request.messages.iter().map(message_json).collect();
        json!({
            "model": settings.model,
            "temperature": settings.temperature,
            "max_tokens": settings.max_tokens,
            "messages": messages,
            "stream": true,
            "top_p": settings.top_p,
        })
    }

    fn build_headers(&self, settings: &ProviderSettings) -> BTreeMap<String, String> {
        let mut headers = super::json_headers();
        if !settings.api_key.is_empty() {
            headers.insert(
                "Authorization".to_string(),
                format!("Bearer {}", settings.api_key),
            );
        }
        if settings.provider == Provider::OpenRouter {
            headers.insert("HTTP-Referer".to_string(), OPENROUTER_REFERER.to_string());
            headers.insert("X-Title".to_string(), OPENROUTER_TITLE.to_string());
        }
        headers
    }

    /// `content`, or `reasoning_content` from reasoning models that leave it empty.
    fn completion_text(&self, response: &serde_json::Value) -> Option<String> {
        let message = response.pointer("/choices/0/message")?;
        ["content", "reasoning_content"]
            .into_iter()
            .filter_map(|field| message.get(field)?.as_str())
            .find_map(non_blank)
    }

    fn parse_payload(&self, payload: &str) -> Result<ChunkBatch, serde_json::Error> {
        let response: StreamResponse = serde_json::from_str(payload)?;
        let mut batch = ChunkBatch::new();
        let Some(delta) = response.choices.into_iter().next().and_then(|c| c.delta) else {
            return Ok(batch);
        };
        if let Some(reasoning) = delta.reasoning_content.filter(|s| !s.is_empty()) {
            batch.push(CanonicalChunk::reasoning(reasoning));
        }
        if let Some(content) = delta.content.filter(|s| !s.is_empty()) {
            batch.push(CanonicalChunk::content(content));
        }
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ai::types::{ChunkChannel, PromptRole};
    use pretty_assertions::assert_eq;

    fn settings(provider: Provider) -> ProviderSettings {
        let mut settings = ProviderSettings::for_provider(provider);
        settings.api_key = "sk-test".to_string();
        settings.model = "test-model".to_string();
        settings.max_tokens = 1024;
        settings.temperature = 0.5;
        settings.top_p = 1.0;
        settings
    }

    #[test]
    fn parses_content_delta() {
        let batch = OpenAiCompatibleAdapter
            .parse_chunk(r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#);
        assert_eq!(batch.as_slice(), &[CanonicalChunk::content("Hi")]);
    }

    #[test]
    fn parses_reasoning_delta() {
        let batch = OpenAiCompatibleAdapter
            .parse_chunk(r#"data: {"choices":[{"delta":{"reasoning_content":"thinking..."}}]}"#);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].text, "thinking...");
        assert_eq!(batch[0].channel, ChunkChannel::Reasoning);
    }

    #[test]
    fn both_channels_yield_reasoning_first() {
        let batch = OpenAiCompatibleAdapter.parse_chunk(
            r#"data: {"choices":[{"delta":{"content":"b","reasoning_content":"a"}}]}"#,
        );
        assert_eq!(
            batch.as_slice(),
            &[CanonicalChunk::reasoning("a"), CanonicalChunk::content("b")]
        );
    }

    #[test]
    fn empty_and_role_only_deltas_yield_nothing() {
        assert!(OpenAiCompatibleAdapter
            .parse_chunk(r#"data: {"choices":[{"delta":{"role":"assistant","content":""}}]}"#)
            .is_empty());
        assert!(OpenAiCompatibleAdapter
            .parse_chunk(r#"data: {"choices":[]}"#)
            .is_empty());
    }

    #[test]
    fn body_embeds_media_as_url_objects() {
        let request = CanonicalRequest {
            messages: vec![CanonicalMessage {
                role: PromptRole::User,
                content: vec![
                    ContentPart::text("look"),
                    ContentPart::Image {
                        url: "data:image/png;base64,QUJD".to_string(),
                    },
                    ContentPart::Video {
                        url: "data:video/mp4;base64,VklE".to_string(),
                    },
                ],
            }],
        };
        let body = OpenAiCompatibleAdapter.build_request_body(&request, &settings(Provider::Zhipu));
        assert_eq!(
            body,
            json!({
                "model": "test-model",
                "temperature": 0.5,
                "max_tokens": 1024,
                "stream": true,
                "top_p": 1.0,
                "messages": [{
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "look" },
                        { "type": "image_url", "image_url": { "url": "QUJD" } },
                        { "type": "video_url", "video_url": { "url": "VklE" } }
                    ]
                }]
            })
        );
    }

    #[test]
    fn headers_use_bearer_and_openrouter_extras() {
        let headers = OpenAiCompatibleAdapter.build_headers(&settings(Provider::OpenRouter));
        assert_eq!(headers["Authorization"], "Bearer sk-test");
        assert_eq!(headers["Content-Type"], "application/json");
        assert!(headers.contains_key("HTTP-Referer"));
        assert_eq!(headers["X-Title"], OPENROUTER_TITLE);

        let mut keyless = settings(Provider::Custom);
        keyless.api_key.clear();
        assert!(!OpenAiCompatibleAdapter
            .build_headers(&keyless)
            .contains_key("Authorization"));
    }

    #[test]
    fn completion_turns_streaming_off_and_reads_message() {
        let request = CanonicalRequest {
            messages: vec![CanonicalMessage {
                role: PromptRole::User,
                content: vec![ContentPart::text("hi")],
            }],
        };
        let (url, spec) =
            OpenAiCompatibleAdapter.build_completion_request(&request, &settings(Provider::DeepSeek));
        assert_eq!(url, settings(Provider::DeepSeek).api_url);
        let body: serde_json::Value = serde_json::from_str(&spec.body.unwrap()).unwrap();
        assert_eq!(body["stream"], json!(false));

        let answer = json!({ "choices": [{ "message": { "content": " ok " } }] });
        assert_eq!(OpenAiCompatibleAdapter.completion_text(&answer).as_deref(), Some("ok"));
        let reasoning_only = json!({ "choices": [{ "message": { "content": "", "reasoning_content": "{}" } }] });
        assert_eq!(
            OpenAiCompatibleAdapter.completion_text(&reasoning_only).as_deref(),
            Some("{}")
        );
        assert_eq!(OpenAiCompatibleAdapter.completion_text(&json!({ "choices": [] })), None);
    }
}
