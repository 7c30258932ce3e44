use serde::Deserialize;
use serde_json::json;

use crate::services::ai::types::{CanonicalChunk, CanonicalRequest, ContentPart, PromptRole};
use crate::services::config::{ProviderFamily, ProviderSettings};

use super::{data_uri_mime, data_uri_payload, non_blank, ChunkBatch, ProviderAdapter};

const MODEL_PLACEHOLDER: &str = "{model}";
const STREAM_METHOD: &str = ":streamGenerateContent";
const ONESHOT_METHOD: &str = ":generateContent";

/// Google Gemini `streamGenerateContent`. The key travels as a query parameter.
pub struct GeminiAdapter;

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

fn gemini_role(role: PromptRole) -> &'static str {
    match role {
        PromptRole::Assistant => "model",
        PromptRole::User | PromptRole::System => "user",
    }
}

fn media_part(url: &str, fallback_mime: &str) -> serde_json::Value {
    json!({
        "inlineData": {
            "mimeType": data_uri_mime(url).unwrap_or(fallback_mime),
            "data": data_uri_payload(url),
        }
    })
}

fn gemini_url(settings: &ProviderSettings, streaming: bool) -> String {
    let mut base = settings
        .api_url
        .trim()
        .replace(MODEL_PLACEHOLDER, &settings.model);
    if !streaming {
        base = base.replace(STREAM_METHOD, ONESHOT_METHOD);
    }
    match reqwest::Url::parse(&base) {
        Ok(mut url) => {
            {
                let mut query = url.query_pairs_mut();
                if streaming {
                    query.append_pair("alt", "sse");
                }
                if !settings.api_key.is_empty() {
                    query.append_pair("key", &settings.api_key);
                }
            }
            url.to_string()
        }
        Err(err) => {
            log::warn!("Gemini api url is not absolute ({err}); appending query verbatim");
            let separator = if base.contains('?') { '&' } else { '?' };
            let alt = if streaming { "alt=sse&" } else { "" };
            format!("{base}{separator}{alt}key={}", settings.api_key)
        }
    }
}

impl ProviderAdapter for GeminiAdapter {
    fn family(&self) -> ProviderFamily {
        ProviderFamily::Gemini
    }

    fn build_request_body(
        &self,
        request: &CanonicalRequest,
        settings: &ProviderSettings,
    ) -> serde_json::Value {
        let mut system = Vec::new();
        let mut contents = Vec::new();
        for message in &request.messages {
            if message.role == PromptRole::System {
                system.push(message.joined_text("\n"));
                continue;
            }
            let parts: Vec<serde_json::Value> = message
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({ "text": text }),
                    ContentPart::Image { url } => media_part(url, "image/jpeg"),
                    ContentPart::Video { url } => media_part(url, "video/mp4"),
                })
                .collect();
            contents.push(json!({ "role": gemini_role(message.role), "parts": parts }));
        }

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": settings.temperature,
                "topP": settings.top_p,
                "maxOutputTokens": settings.max_tokens,
            }
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": [{ "text": system.join("\n\n") }] });
        }
        body
    }

    /// Expands `{model}` and appends `alt=sse` plus the key.
    fn build_url(&self, settings: &ProviderSettings) -> String {
        gemini_url(settings, true)
    }

    /// `generateContent` instead of `streamGenerateContent`, without `alt=sse`.
    fn completion_url(&self, settings: &ProviderSettings) -> String {
        gemini_url(settings, false)
    }

    fn completion_text(&self, response: &serde_json::Value) -> Option<String> {
        response
            .pointer("/candidates/0/content/parts")?
            .as_array()?
            .iter()
            .filter(|part| !part.get("thought").and_then(|t| t.as_bool()).unwrap_or(false))
            .filter_map(|part| part.get("text")?.as_str())
            .find_map(non_blank)
    }

    fn build_headers(
        &self,
        _settings: &ProviderSettings,
    ) -> std::collections::BTreeMap<String, String> {
        super::json_headers()
    }

    fn parse_payload(&self, payload: &str) -> Result<ChunkBatch, serde_json::Error> {
        let response: StreamResponse = serde_json::from_str(payload)?;
        let mut batch = ChunkBatch::new();
        let parts = response
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content)
            .map(|content| content.parts)
            .unwrap_or_default();
        for part in parts {
            let Some(text) = part.text.filter(|t| !t.is_empty()) else {
                continue;
            };
            batch.push(if part.thought {
                CanonicalChunk::reasoning(text)
            } else {
                CanonicalChunk::content(text)
            });
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

    fn settings() -> ProviderSettings {
        let mut settings = ProviderSettings::for_provider(Provider::Google);
        settings.api_key = "gk".to_string();
        settings.model = "gemini-test".to_string();
        settings.max_tokens = 256;
        settings.temperature = 0.7;
        settings.top_p = 1.0;
        settings
    }

    #[test]
    fn url_expands_model_and_key() {
        assert_eq!(
            GeminiAdapter.build_url(&settings()),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-test:streamGenerateContent?alt=sse&key=gk"
        );
        assert!(!GeminiAdapter.build_headers(&settings()).contains_key("Authorization"));
    }

    #[test]
    fn body_uses_contents_and_generation_config() {
        let request = CanonicalRequest {
            messages: vec![
                CanonicalMessage {
                    role: PromptRole::System,
                    content: vec![ContentPart::text("sys")],
                },
                CanonicalMessage {
                    role: PromptRole::User,
                    content: vec![ContentPart::text("hi")],
                },
                CanonicalMessage {
                    role: PromptRole::Assistant,
                    content: vec![ContentPart::text("hello")],
                },
                CanonicalMessage {
                    role: PromptRole::User,
                    content: vec![ContentPart::Image {
                        url: "QUJD".to_string(),
                    }],
                },
            ],
        };
        let body = GeminiAdapter.build_request_body(&request, &settings());
        assert_eq!(
            body,
            json!({
                "systemInstruction": { "parts": [{ "text": "sys" }] },
                "contents": [
                    { "role": "user", "parts": [{ "text": "hi" }] },
                    { "role": "model", "parts": [{ "text": "hello" }] },
                    { "role": "user", "parts": [{ "inlineData": { "mimeType": "image/jpeg", "data": "QUJD" } }] }
                ],
                "generationConfig": { "temperature": 0.7, "topP": 1.0, "maxOutputTokens": 256 }
            })
        );
    }

    #[test]
    fn parses_text_and_thought_parts() {
        let batch = GeminiAdapter.parse_chunk(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"plan","thought":true},{"text":"Hi"}],"role":"model"}}]}"#,
        );
        assert_eq!(
            batch.as_slice(),
            &[CanonicalChunk::reasoning("plan"), CanonicalChunk::content("Hi")]
        );
    }

    #[test]
    fn completion_uses_generate_content() {
        let request = CanonicalRequest {
            messages: vec![CanonicalMessage {
                role: PromptRole::User,
                content: vec![ContentPart::text("hi")],
            }],
        };
        let (url, spec) = GeminiAdapter.build_completion_request(&request, &settings());
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-test:generateContent?key=gk"
        );
        assert!(!spec.body.unwrap().contains("stream"));

        let response = json!({ "candidates": [{ "content": { "parts": [
            { "text": "thinking", "thought": true },
            { "text": " {\"depth\":3} " }
        ] } }] });
        assert_eq!(
            GeminiAdapter.completion_text(&response).as_deref(),
            Some("{\"depth\":3}")
        );
    }

    #[test]
    fn usage_only_payload_yields_nothing() {
        assert!(GeminiAdapter
            .parse_chunk(r#"data: {"usageMetadata":{"totalTokenCount":3}}"#)
            .is_empty());
    }
}
