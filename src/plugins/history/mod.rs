//! Conversation history persistence backed by Turso (libSQL).

mod error;
mod store;
mod title;
mod types;

pub use error::HistoryError;
pub use store::{ConversationStore, HistoryStore, MAX_SAVE_BYTES};
pub use title::{title_from_messages, DEFAULT_TITLE};
pub use types::{
    is_complete, real_messages, ChatMessage, Conversation, ConversationSummary, MediaAttachments,
    MessageRole, WELCOME_MESSAGE_ID_PREFIX,
};
