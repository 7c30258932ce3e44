use super::types::{ChatMessage, MessageRole};

pub const DEFAULT_TITLE: &str = "New conversation";
const MAX_TITLE_CHARS: usize = 30;

/// First user message, cut to 30 characters with `...` appended when longer.
pub fn title_from_messages(messages: &[ChatMessage]) -> String {
    let Some(first_user) = messages
        .iter()
        .find(|m| m.role == MessageRole::User && !m.is_welcome())
    else {
        return DEFAULT_TITLE.to_string();
    };
    truncate_title(&first_user.content)
}

fn truncate_title(content: &str) -> String {
    if content.is_empty() {
        return DEFAULT_TITLE.to_string();
    }
    if content.chars().count() <= MAX_TITLE_CHARS {
        return content.to_string();
    }
    content.chars().take(MAX_TITLE_CHARS).collect::<String>() + "..."
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_first_user_message() {
        let messages = vec![
            ChatMessage::new(MessageRole::Assistant, "hello", 1),
            ChatMessage::new(MessageRole::User, "what is rust", 2),
            ChatMessage::new(MessageRole::User, "second", 3),
        ];
        assert_eq!(title_from_messages(&messages), "what is rust");
    }

    #[test]
    fn long_titles_are_cut_by_characters() {
        let content = "你".repeat(40);
        let title = truncate_title(&content);
        assert_eq!(title, format!("{}...", "你".repeat(30)));
    }

    #[test]
    fn falls_back_to_default() {
        assert_eq!(title_from_messages(&[]), DEFAULT_TITLE);
        assert_eq!(
            title_from_messages(&[ChatMessage::new(MessageRole::User, "", 1)]),
            DEFAULT_TITLE
        );
    }
}
