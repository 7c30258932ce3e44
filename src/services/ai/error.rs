use serde::{Deserialize, Serialize};

/// Failure taxonomy for a chat turn.
///
/// Line-level parse failures never reach this type: adapters skip malformed
/// lines and keep streaming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChatError {
    Transport { message: String },
    HttpStatus { status: u16, message: String },
    Cancelled { message: String },
    InvalidRequest { message: String },
    Storage { message: String },
    Internal { message: String },
}

impl ChatError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// `detail` is the response body (or status text when the body was unreadable).
    pub fn http_status(status: u16, detail: impl Into<String>) -> Self {
        Self::HttpStatus {
            status,
            message: detail.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::Cancelled {
            message: "Request cancelled".to_string(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transport { message }
            | Self::HttpStatus { message, .. }
            | Self::Cancelled { message }
            | Self::InvalidRequest { message }
            | Self::Storage { message }
            | Self::Internal { message } => message,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Text shown to the user and appended to the transcript as an assistant message.
    pub fn user_message(&self) -> String {
        match self {
            Self::HttpStatus { status, message } => {
                let hint = match status {
                    400 => "The provider rejected the request",
                    401 | 403 => "Authentication failed, please check your API key",
                    404 => "The API endpoint or model was not found",
                    408 | 504 => "The provider timed out",
                    413 => "The request is too large for this provider",
                    429 => "Rate limit reached, please try again later",
                    500..=599 => "The provider is temporarily unavailable",
                    _ => "The provider returned an error",
                };
                let detail = message.trim();
                if detail.is_empty() {
                    format!("{hint} (HTTP {status})")
                } else {
                    format!("{hint} (HTTP {status}): {}", clip(detail, 300))
                }
            }
            Self::Transport { message } => {
                let lower = message.to_ascii_lowercase();
                if lower.contains("timed out") || lower.contains("timeout") {
                    "The request timed out, please check your network connection".to_string()
                } else if lower.contains("dns")
                    || lower.contains("connect")
                    || lower.contains("resolve")
                {
                    "Could not reach the provider, please check the API URL and your network"
                        .to_string()
                } else {
                    format!("Network error: {}", clip(message.trim(), 300))
                }
            }
            Self::Cancelled { .. } => "Request cancelled".to_string(),
            Self::InvalidRequest { message } => message.clone(),
            Self::Storage { message } => format!("Failed to save conversation: {message}"),
            Self::Internal { message } => format!("Unexpected error: {message}"),
        }
    }
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect::<String>() + "…"
}

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::http_status(status.as_u16(), err.to_string());
        }
        Self::transport(err.to_string())
    }
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { message } => write!(f, "Transport: {}", message),
            Self::HttpStatus { status, message } => write!(f, "HTTP {}: {}", status, message),
            Self::Cancelled { message } => write!(f, "Cancelled: {}", message),
            Self::InvalidRequest { message } => write!(f, "InvalidRequest: {}", message),
            Self::Storage { message } => write!(f, "Storage: {}", message),
            Self::Internal { message } => write!(f, "Internal: {}", message),
        }
    }
}

impl std::error::Error for ChatError {}
