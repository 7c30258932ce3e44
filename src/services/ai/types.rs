use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::error::ChatError;

/// Event name for raw stream chunks (privileged -> UI).
pub const EVT_STREAM_CHUNK: &str = "stream-chunk";
/// Event name for terminal stream errors (privileged -> UI).
pub const EVT_STREAM_ERROR: &str = "stream-error";

/// Inbound event on the privileged -> UI channel.
///
/// Each stream produces any number of non-final chunks followed by exactly one
/// terminal event: a final chunk (`data: None, is_final: true`) or an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StreamEvent {
    #[serde(rename_all = "camelCase")]
    Chunk {
        stream_id: String,
        data: Option<String>,
        is_final: bool,
    },
    #[serde(rename_all = "camelCase")]
    Error { stream_id: String, error: ChatError },
}

impl StreamEvent {
    pub fn chunk(stream_id: &str, data: String) -> Self {
        Self::Chunk {
            stream_id: stream_id.to_string(),
            data: Some(data),
            is_final: false,
        }
    }

    pub fn finished(stream_id: &str) -> Self {
        Self::Chunk {
            stream_id: stream_id.to_string(),
            data: None,
            is_final: true,
        }
    }

    pub fn error(stream_id: &str, error: ChatError) -> Self {
        Self::Error {
            stream_id: stream_id.to_string(),
            error,
        }
    }

    pub fn stream_id(&self) -> &str {
        match self {
            Self::Chunk { stream_id, .. } | Self::Error { stream_id, .. } => stream_id,
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Chunk { is_final, .. } => *is_final,
            Self::Error { .. } => true,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => EVT_STREAM_CHUNK,
            Self::Error { .. } => EVT_STREAM_ERROR,
        }
    }
}

/// Outbound operations on the UI -> privileged channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ProxyCommand {
    #[serde(rename_all = "camelCase")]
    OpenStream {
        stream_id: String,
        url: String,
        options: RequestSpec,
    },
    #[serde(rename_all = "camelCase")]
    CancelStream { stream_id: String },
    CancelAllStreams,
}

/// HTTP request description handed to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSpec {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RequestSpec {
    pub fn post_json(headers: BTreeMap<String, String>, body: &serde_json::Value) -> Self {
        Self {
            method: default_method(),
            headers,
            body: Some(body.to_string()),
        }
    }
}

/// Which semantic channel a decoded delta belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkChannel {
    Content,
    Reasoning,
}

/// One decoded delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalChunk {
    pub text: String,
    pub channel: ChunkChannel,
}

impl CanonicalChunk {
    pub fn content(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            channel: ChunkChannel::Content,
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            channel: ChunkChannel::Reasoning,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

/// A media reference is either a `data:` URI or a bare base64 payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ContentPart {
    Text { text: String },
    Image { url: String },
    Video { url: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub role: PromptRole,
    pub content: Vec<ContentPart>,
}

impl CanonicalMessage {
    /// Concatenation of all text parts.
    pub fn joined_text(&self, separator: &str) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(separator)
    }
}

/// Provider-agnostic request; translated per provider only at the boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalRequest {
    pub messages: Vec<CanonicalMessage>,
}
