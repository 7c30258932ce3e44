use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::json;

use crate::services::ai::sse::sse_data_payload;
use crate::services::ai::types::{CanonicalChunk, CanonicalRequest, ContentPart};
use crate::services::config::{ProviderFamily, ProviderSettings};

use super::{data_uri_payload, non_blank, ChunkBatch, ProviderAdapter};

/// Ollama `/api/chat`. Streams newline-delimited JSON rather than SSE.
pub struct OllamaAdapter;

#[derive(Debug, Deserialize)]
struct StreamLine {
    message: Option<StreamMessage>,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    content: Option<String>,
    thinking: Option<String>,
}

impl ProviderAdapter for OllamaAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Ollama
    }

    fn build_request_body(
        &self,
        request: &CanonicalRequest,
        settings: &ProviderSettings,
    ) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|message| {
                let images: Vec<&str> = message
                    .content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Image { url } => Some(data_uri_payload(url)),
                        _ => None,
                    })
                    .collect();
                let mut value = json!({
                    "role": message.role,
                    "content": message.joined_text("\n"),
                });
                if !images.is_empty() {
                    value["images"] = json!(images);
                }
                value
            })
            .collect();

        json!({
            "model": settings.model,
            "messages": messages,
            "stream": true,
            "options": {
                "temperature": settings.temperature,
                "top_p": settings.top_p,
                "num_predict": settings.max_tokens,
            }
        })
    }

    fn build_headers(&self, _settings: &ProviderSettings) -> BTreeMap<String, String> {
        super::json_headers()
    }

    /// Accepts bare NDJSON lines as well as SSE-wrapped ones.
    fn extract_payload<'a>(&self, line: &'a str) -> Option<&'a str> {
        if line.starts_with('{') {
            Some(line)
        } else {
            sse_data_payload(line)
        }
    }

    fn completion_text(&self, response: &serde_json::Value) -> Option<String> {
        non_blank(response.pointer("/message/content")?.as_str()?)
    }

    fn parse_payload(&self, payload: &str) -> Result<ChunkBatch, serde_json::Error> {
        let line: StreamLine = serde_json::from_str(payload)?;
        let mut batch = ChunkBatch::new();
        if let Some(message) = line.message {
            if let Some(thinking) = message.thinking.filter(|s| !s.is_empty()) {
                batch.push(CanonicalChunk::reasoning(thinking));
            }
            if let Some(content) = message.content.filter(|s| !s.is_empty()) {
                batch.push(CanonicalChunk::content(content));
            }
        }
        Ok(batch)
    }
}
