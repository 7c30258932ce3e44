//! Per-provider wire translation.
//!
//! Adapters are pure and stateless: no I/O, no mutable state. Adding a
//! provider family means adding one adapter and one arm in [`adapter_for`].

mod anthropic;
mod gemini;
mod ollama;
mod openai;

use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::services::config::{Provider, ProviderFamily, ProviderSettings};

use super::sse::{sse_data_payload, DONE_SENTINEL};
use super::types::{CanonicalChunk, CanonicalRequest, RequestSpec};

pub use anthropic::AnthropicAdapter;
pub use gemini::GeminiAdapter;
pub use ollama::OllamaAdapter;
pub use openai::OpenAiCompatibleAdapter;

/// Decoded deltas from one line. Usually zero or one; an OpenAI-compatible
/// delta carrying both channels yields reasoning first, then content.
pub type ChunkBatch = SmallVec<[CanonicalChunk; 2]>;

pub trait ProviderAdapter: Send + Sync {
    fn family(&self) -> ProviderFamily;

    /// Provider-specific JSON body, with the streaming flag set where the provider needs it.
    fn build_request_body(
        &self,
        request: &CanonicalRequest,
        settings: &ProviderSettings,
    ) -> serde_json::Value;

    /// Default: JSON content type plus a bearer token when a key is configured.
    fn build_headers(&self, settings: &ProviderSettings) -> BTreeMap<String, String> {
        let mut headers = json_headers();
        if !settings.api_key.is_empty() {
            headers.insert(
                "Authorization".to_string(),
                format!("Bearer {}", settings.api_key),
            );
        }
        headers
    }

    fn build_url(&self, settings: &ProviderSettings) -> String {
        settings.api_url.trim().to_string()
    }

    /// JSON payload carried by one raw line, if any.
    fn extract_payload<'a>(&self, line: &'a str) -> Option<&'a str> {
        sse_data_payload(line)
    }

    fn parse_payload(&self, payload: &str) -> Result<ChunkBatch, serde_json::Error>;

    /// Decodes one raw stream line. Malformed lines are logged and skipped.
    fn parse_chunk(&self, line: &str) -> ChunkBatch {
        let Some(payload) = self.extract_payload(line.trim()) else {
            return ChunkBatch::new();
        };
        if payload.is_empty() || payload == DONE_SENTINEL {
            return ChunkBatch::new();
        }
        match self.parse_payload(payload) {
            Ok(batch) => batch,
            Err(err) => {
                log::debug!("Skipping unparsable stream line ({:?}): {}", self.family(), err);
                ChunkBatch::new()
            }
        }
    }

    fn completion_url(&self, settings: &ProviderSettings) -> String {
        self.build_url(settings)
    }

    /// Answer text of a non-streaming completion response.
    fn completion_text(&self, response: &serde_json::Value) -> Option<String>;

    /// Url, headers and body for one non-streaming call.
    fn build_completion_request(
        &self,
        request: &CanonicalRequest,
        settings: &ProviderSettings,
    ) -> (String, RequestSpec) {
        let mut body = self.build_request_body(request, settings);
        if let Some(stream) = body.get_mut("stream") {
            *stream = serde_json::Value::Bool(false);
        }
        (
            self.completion_url(settings),
            RequestSpec::post_json(self.build_headers(settings), &body),
        )
    }

    /// Url, headers and body for one streaming call.
    fn build_request(&self, request: &CanonicalRequest, settings: &ProviderSettings) -> (String, RequestSpec) {
        let body = self.build_request_body(request, settings);
        (
            self.build_url(settings),
            RequestSpec::post_json(self.build_headers(settings), &body),
        )
    }
}

static OPENAI_COMPATIBLE: OpenAiCompatibleAdapter = OpenAiCompatibleAdapter;
static ANTHROPIC: AnthropicAdapter = AnthropicAdapter;
static GEMINI: GeminiAdapter = GeminiAdapter;
static OLLAMA: OllamaAdapter = OllamaAdapter;

pub fn adapter_for(family: ProviderFamily) -> &'static dyn ProviderAdapter {
    match family {
        ProviderFamily::OpenAiCompatible => &OPENAI_COMPATIBLE,
        ProviderFamily::Anthropic => &ANTHROPIC,
        ProviderFamily::Gemini => &GEMINI,
        ProviderFamily::Ollama => &OLLAMA,
    }
}

impl Provider {
    pub fn adapter(self) -> &'static dyn ProviderAdapter {
        adapter_for(self.family())
    }
}

pub(crate) fn json_headers() -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers
}

/// Trimmed text, `None` when blank.
pub(crate) fn non_blank(text: &str) -> Option<String> {
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

/// Payload after the first comma of a `data:` URI; bare payloads pass through.
pub(crate) fn data_uri_payload(url: &str) -> &str {
    match url.split_once(',') {
        Some((_, payload)) => payload,
        None => url,
    }
}

/// MIME type declared by a `data:` URI.
pub(crate) fn data_uri_mime(url: &str) -> Option<&str> {
    let rest = url.strip_prefix("data:")?;
    let end = rest.find([';', ',']).unwrap_or(rest.len());
    let mime = &rest[..end];
    (!mime.is_empty()).then_some(mime)
}
