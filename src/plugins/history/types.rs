use serde::{Deserialize, Serialize};

use crate::services::ai::types::ContentPart;

/// Messages whose id starts with this prefix are UI greetings, never history.
pub const WELCOME_MESSAGE_ID_PREFIX: &str = "welcome_msg";

/// Inline image payloads above this many characters are treated as oversized.
pub const MAX_INLINE_IMAGE_CHARS: usize = 100_000;
/// Document page images above this many characters are treated as oversized.
pub const MAX_INLINE_PAGE_IMAGE_CHARS: usize = 50_000;

pub const IMAGE_OMITTED: &str = "[image data omitted]";
pub const VIDEO_OMITTED: &str = "[video data omitted]";
pub const PDF_IMAGES_OMITTED: &str = "[PDF image data omitted]";
pub const PPT_IMAGES_OMITTED: &str = "[PPT image data omitted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Media attached to a message. Images and page images are data URIs or bare base64.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttachments {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Local path or URL of a video.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppt_images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ppt_total_pages: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_images: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_total_pages: Option<u32>,
}

fn any_oversized(images: &Option<Vec<String>>, limit: usize) -> bool {
    images
        .as_ref()
        .map(|images| images.iter().any(|img| img.len() > limit))
        .unwrap_or(false)
}

impl MediaAttachments {
    pub fn is_empty(&self) -> bool {
        self.image.is_none()
            && self.video.is_none()
            && self.video_base64.is_none()
            && self.pdf_images.as_ref().is_none_or(Vec::is_empty)
            && self.ppt_images.as_ref().is_none_or(Vec::is_empty)
            && self.word_images.as_ref().is_none_or(Vec::is_empty)
    }

    /// Drops payloads too large to persist. Videos are always dropped.
    pub fn without_oversized(&self) -> Self {
        let mut media = self.clone();
        if media
            .image
            .as_ref()
            .is_some_and(|img| img.len() > MAX_INLINE_IMAGE_CHARS)
        {
            media.image = None;
        }
        media.video = None;
        media.video_base64 = None;
        if any_oversized(&media.pdf_images, MAX_INLINE_PAGE_IMAGE_CHARS) {
            media.pdf_images = None;
        }
        if any_oversized(&media.ppt_images, MAX_INLINE_PAGE_IMAGE_CHARS) {
            media.ppt_images = None;
        }
        media
    }

    /// Replaces payloads too large for a sync envelope with placeholder markers.
    pub fn with_placeholders(&self) -> Self {
        let mut media = self.clone();
        if media.video_base64.is_some() {
            media.video_base64 = Some(VIDEO_OMITTED.to_string());
        }
        if media
            .image
            .as_ref()
            .is_some_and(|img| img.len() > MAX_INLINE_IMAGE_CHARS)
        {
            media.image = Some(IMAGE_OMITTED.to_string());
        }
        if any_oversized(&media.pdf_images, MAX_INLINE_PAGE_IMAGE_CHARS) {
            media.pdf_images = Some(vec![PDF_IMAGES_OMITTED.to_string()]);
        }
        if any_oversized(&media.ppt_images, MAX_INLINE_PAGE_IMAGE_CHARS) {
            media.ppt_images = Some(vec![PPT_IMAGES_OMITTED.to_string()]);
        }
        media
    }

    /// Prompt parts for the media, in image, video, document-page order.
    pub fn content_parts(&self) -> Vec<ContentPart> {
        let mut parts = Vec::new();
        if let Some(image) = &self.image {
            parts.push(ContentPart::Image { url: image.clone() });
        }
        let video = self
            .video_base64
            .clone()
            .or_else(|| self.video.clone().filter(|v| v.starts_with("data:")));
        if let Some(url) = video {
            parts.push(ContentPart::Video { url });
        }
        for pages in [&self.pdf_images, &self.ppt_images, &self.word_images]
            .into_iter()
            .flatten()
        {
            parts.extend(pages.iter().map(|url| ContentPart::Image { url: url.clone() }));
        }
        parts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(flatten)]
    pub media: MediaAttachments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
    /// Set when media was stripped to fit a sync envelope.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub has_media: bool,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            id: format!("{}_{}", role.as_str(), uuid::Uuid::new_v4()),
            role,
            content: content.into(),
            media: MediaAttachments::default(),
            timestamp: Some(timestamp_ms),
            has_media: false,
        }
    }

    pub fn with_media(mut self, media: MediaAttachments) -> Self {
        self.media = media;
        self
    }

    pub fn is_welcome(&self) -> bool {
        self.id.starts_with(WELCOME_MESSAGE_ID_PREFIX)
    }

    /// Heuristic identity used to suppress duplicate sync deliveries.
    pub fn same_delivery(&self, other: &ChatMessage) -> bool {
        self.timestamp == other.timestamp && self.role == other.role && self.content == other.content
    }

    /// Text-only copy that still records that media existed.
    pub fn text_only(&self) -> Self {
        Self {
            id: self.id.clone(),
            role: self.role,
            content: self.content.clone(),
            media: MediaAttachments::default(),
            timestamp: self.timestamp,
            has_media: self.has_media || !self.media.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<ChatMessage>,
    pub timestamp: u64,
    pub message_count: usize,
}

impl Conversation {
    /// Builds a conversation from a transcript, skipping welcome messages.
    pub fn from_messages(id: impl Into<String>, messages: &[ChatMessage], timestamp: u64) -> Self {
        let messages: Vec<ChatMessage> = real_messages(messages).cloned().collect();
        Self {
            id: id.into(),
            title: super::title::title_from_messages(&messages),
            message_count: messages.len(),
            messages,
            timestamp,
        }
    }

    pub fn is_complete(&self) -> bool {
        is_complete(&self.messages)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub timestamp: u64,
    pub message_count: usize,
}

impl From<&Conversation> for ConversationSummary {
    fn from(conversation: &Conversation) -> Self {
        Self {
            id: conversation.id.clone(),
            title: conversation.title.clone(),
            timestamp: conversation.timestamp,
            message_count: conversation.message_count,
        }
    }
}

pub fn real_messages(messages: &[ChatMessage]) -> impl Iterator<Item = &ChatMessage> {
    messages.iter().filter(|m| !m.is_welcome())
}

/// At least one user message and one non-empty assistant message, ignoring greetings.
pub fn is_complete(messages: &[ChatMessage]) -> bool {
    let has_user = real_messages(messages).any(|m| m.role == MessageRole::User);
    let has_answer = real_messages(messages)
        .any(|m| m.role == MessageRole::Assistant && !m.content.trim().is_empty());
    has_user && has_answer
}
