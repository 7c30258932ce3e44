use serde::{Deserialize, Serialize};

use crate::services::ai::error::ChatError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryError {
    NotFound { message: String },
    Locked { message: String },
    InvalidInput { message: String },
    Database { message: String },
    Internal { message: String },
}

impl HistoryError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    pub fn locked(message: impl Into<String>) -> Self {
        Self::Locked {
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
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
            Self::NotFound { message }
            | Self::Locked { message }
            | Self::InvalidInput { message }
            | Self::Database { message }
            | Self::Internal { message } => message,
        }
    }
}

fn is_db_locked_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("database is locked")
        || lower.contains("sqlite_busy")
        || lower.contains("sqlite busy")
        || lower.contains("database is busy")
}

impl From<libsql::Error> for HistoryError {
    fn from(err: libsql::Error) -> Self {
        let message = err.to_string();
        if is_db_locked_error(&message) {
            return Self::locked(message);
        }
        Self::database(message)
    }
}

impl From<serde_json::Error> for HistoryError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(format!("Invalid stored data: {err}"))
    }
}

impl From<HistoryError> for ChatError {
    fn from(err: HistoryError) -> Self {
        ChatError::storage(err.to_string())
    }
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { message } => write!(f, "NotFound: {}", message),
            Self::Locked { message } => write!(f, "Locked: {}", message),
            Self::InvalidInput { message } => write!(f, "InvalidInput: {}", message),
            Self::Database { message } => write!(f, "Database: {}", message),
            Self::Internal { message } => write!(f, "Internal: {}", message),
        }
    }
}

impl std::error::Error for HistoryError {}
