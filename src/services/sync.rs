//! Cross-window mirroring of the chat transcript.
//!
//! Windows do not share memory. Each one publishes envelopes into a single
//! last-writer-wins slot and every other window is notified of the write.
//! Delivery is best-effort and at-most-recent: a lagging subscriber skips to
//! whatever the slot holds now.

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::plugins::history::ChatMessage;

/// Serialized envelopes above this size are shrunk before publishing.
pub const MAX_SYNC_BYTES: usize = 1_000_000;
/// Characters kept from an oversized update.
pub const TRUNCATED_CONTENT_CHARS: usize = 50_000;
pub const TRUNCATION_MARKER: &str = "\n\n[content too long, truncated...]";

const CHANGE_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEnvelope {
    User {
        message: ChatMessage,
        timestamp: u64,
    },
    Assistant {
        message: ChatMessage,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        message_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        truncated: bool,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    Remove { message_id: String, timestamp: u64 },
}

impl SyncEnvelope {
    /// User messages travel with oversized media replaced by placeholders.
    pub fn user(message: &ChatMessage, timestamp: u64) -> Self {
        let mut message = message.clone();
        message.media = message.media.with_placeholders();
        Self::User { message, timestamp }
    }

    pub fn assistant(message: &ChatMessage, timestamp: u64) -> Self {
        Self::Assistant {
            message: message.clone(),
            timestamp,
        }
    }

    pub fn update(message_id: &str, content: impl Into<String>, timestamp: u64) -> Self {
        Self::Update {
            message_id: message_id.to_string(),
            content: content.into(),
            truncated: false,
            timestamp,
        }
    }

    pub fn remove(message_id: &str, timestamp: u64) -> Self {
        Self::Remove {
            message_id: message_id.to_string(),
            timestamp,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            Self::User { timestamp, .. }
            | Self::Assistant { timestamp, .. }
            | Self::Update { timestamp, .. }
            | Self::Remove { timestamp, .. } => *timestamp,
        }
    }

    /// Serializes the envelope, shrinking it when it exceeds [`MAX_SYNC_BYTES`].
    ///
    /// Oversized messages lose their media first (`hasMedia` is set); if the
    /// text alone is still too large, it keeps the first
    /// [`TRUNCATED_CONTENT_CHARS`] characters plus [`TRUNCATION_MARKER`].
    /// Oversized updates are cut the same way.
    pub fn to_bounded_json(&self) -> Result<String, serde_json::Error> {
        let json = serde_json::to_string(self)?;
        if json.len() <= MAX_SYNC_BYTES {
            return Ok(json);
        }
        log::warn!(
            "Sync envelope of {} bytes exceeds the {} byte ceiling; shrinking",
            json.len(),
            MAX_SYNC_BYTES
        );

        let shrunk = match self {
            Self::User { message, timestamp } => {
                let text_only = Self::User {
                    message: message.text_only(),
                    timestamp: *timestamp,
                };
                let json = serde_json::to_string(&text_only)?;
                if json.len() <= MAX_SYNC_BYTES {
                    return Ok(json);
                }
                Self::User {
                    message: truncated_message(message),
                    timestamp: *timestamp,
                }
            }
            Self::Assistant { message, timestamp } => Self::Assistant {
                message: truncated_message(message),
                timestamp: *timestamp,
            },
            Self::Update {
                message_id,
                content,
                timestamp,
                ..
            } => Self::Update {
                message_id: message_id.clone(),
                content: truncate_content(content),
                truncated: true,
                timestamp: *timestamp,
            },
            // Only a generated id; never near the ceiling.
            Self::Remove { .. } => return Ok(json),
        };
        serde_json::to_string(&shrunk)
    }
}

fn truncate_content(content: &str) -> String {
    content.chars().take(TRUNCATED_CONTENT_CHARS).collect::<String>() + TRUNCATION_MARKER
}

fn truncated_message(message: &ChatMessage) -> ChatMessage {
    let mut message = message.text_only();
    message.content = truncate_content(&message.content);
    message
}

/// One write to the shared slot.
#[derive(Debug)]
struct SlotRecord {
    origin: String,
    payload: String,
}

/// Process-scoped shared slot plus change notification.
pub struct SyncHub {
    slot: ArcSwapOption<SlotRecord>,
    changes: broadcast::Sender<Arc<SlotRecord>>,
}

impl Default for SyncHub {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            slot: ArcSwapOption::empty(),
            changes,
        }
    }
}

impl SyncHub {
    pub fn endpoint(self: &Arc<Self>, window_id: impl Into<String>) -> SyncEndpoint {
        SyncEndpoint {
            window_id: window_id.into(),
            hub: self.clone(),
        }
    }

    /// Raw JSON currently held by the slot.
    pub fn latest_json(&self) -> Option<String> {
        self.slot.load_full().map(|record| record.payload.clone())
    }
}

/// A window's handle on the hub.
#[derive(Clone)]
pub struct SyncEndpoint {
    window_id: String,
    hub: Arc<SyncHub>,
}

impl SyncEndpoint {
    pub fn window_id(&self) -> &str {
        &self.window_id
    }

    /// Writes the envelope to the slot and notifies other windows. Failures are logged.
    pub fn publish(&self, envelope: &SyncEnvelope) {
        let payload = match envelope.to_bounded_json() {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!("Failed to serialize sync envelope: {}", err);
                return;
            }
        };
        let record = Arc::new(SlotRecord {
            origin: self.window_id.clone(),
            payload,
        });
        self.hub.slot.store(Some(record.clone()));
        // No receivers is fine: nobody else is open.
        let _ = self.hub.changes.send(record);
    }

    pub fn subscribe(&self) -> SyncSubscription {
        SyncSubscription {
            window_id: self.window_id.clone(),
            hub: self.hub.clone(),
            changes: self.hub.changes.subscribe(),
        }
    }
}

/// Stream of envelopes written by other windows.
pub struct SyncSubscription {
    window_id: String,
    hub: Arc<SyncHub>,
    changes: broadcast::Receiver<Arc<SlotRecord>>,
}

impl SyncSubscription {
    fn decode(&self, record: &SlotRecord) -> Option<SyncEnvelope> {
        if record.origin == self.window_id {
            return None;
        }
        match serde_json::from_str(&record.payload) {
            Ok(envelope) => Some(envelope),
            Err(err) => {
                log::warn!("Ignoring malformed sync envelope from {}: {}", record.origin, err);
                None
            }
        }
    }

    /// Next envelope written by another window.
    pub async fn recv(&mut self) -> Option<SyncEnvelope> {
        loop {
            match self.changes.recv().await {
                Ok(record) => {
                    if let Some(envelope) = self.decode(&record) {
                        return Some(envelope);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!(
                        "Sync subscriber {} lagged by {} writes; resyncing from slot",
                        self.window_id,
                        skipped
                    );
                    self.changes = self.changes.resubscribe();
                    if let Some(record) = self.hub.slot.load_full() {
                        if let Some(envelope) = self.decode(&record) {
                            return Some(envelope);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// A window's local copy of the transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalTranscript {
    messages: Vec<ChatMessage>,
}

impl LocalTranscript {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn replace_all(&mut self, messages: Vec<ChatMessage>) {
        self.messages = messages;
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn get(&self, message_id: &str) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == message_id)
    }

    pub fn set_content(&mut self, message_id: &str, content: &str) -> bool {
        match self.messages.iter_mut().find(|m| m.id == message_id) {
            Some(message) if message.content != content => {
                message.content = content.to_string();
                true
            }
            _ => false,
        }
    }

    pub fn remove(&mut self, message_id: &str) -> bool {
        let Some(index) = self.messages.iter().position(|m| m.id == message_id) else {
            return false;
        };
        self.messages.remove(index);
        true
    }

    /// Last `max_turns * 2 + 1` messages, greetings excluded.
    pub fn recent_history(&self, max_turns: usize) -> Vec<&ChatMessage> {
        let real: Vec<&ChatMessage> = self.messages.iter().filter(|m| !m.is_welcome()).collect();
        let keep = max_turns * 2 + 1;
        real[real.len().saturating_sub(keep)..].to_vec()
    }

    /// Applies an envelope from another window. Returns whether anything changed.
    ///
    /// New messages are suppressed when one with the same timestamp, role and
    /// content already exists, so a repeated delivery is a no-op.
    pub fn apply(&mut self, envelope: &SyncEnvelope) -> bool {
        match envelope {
            SyncEnvelope::User { message, .. } | SyncEnvelope::Assistant { message, .. } => {
                if self.messages.iter().any(|m| m.same_delivery(message)) {
                    return false;
                }
                self.messages.push(message.clone());
                true
            }
            SyncEnvelope::Update {
                message_id,
                content,
                ..
            } => self.set_content(message_id, content),
            SyncEnvelope::Remove { message_id, .. } => self.remove(message_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::history::{MediaAttachments, MessageRole};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn user(content: &str, timestamp: u64) -> ChatMessage {
        let mut message = ChatMessage::new(MessageRole::User, content, timestamp);
        message.id = format!("u{timestamp}");
        message
    }

    #[test]
    fn apply_is_idempotent() {
        let mut transcript = LocalTranscript::default();
        let envelope = SyncEnvelope::user(&user("hi", 1), 10);
        assert!(transcript.apply(&envelope));
        let snapshot = transcript.clone();
        assert!(!transcript.apply(&envelope));
        assert_eq!(transcript, snapshot);

        let update = SyncEnvelope::update("u1", "hi there", 11);
        assert!(transcript.apply(&update));
        assert!(!transcript.apply(&update));
        assert_eq!(transcript.messages()[0].content, "hi there");
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut transcript = LocalTranscript::new(vec![user("hi", 1)]);
        assert!(!transcript.apply(&SyncEnvelope::update("missing", "x", 2)));
        assert!(!transcript.apply(&SyncEnvelope::remove("missing", 2)));
        assert!(transcript.apply(&SyncEnvelope::remove("u1", 3)));
        assert!(transcript.messages().is_empty());
    }

    #[test]
    fn envelope_wire_shape() {
        let value: serde_json::Value =
            serde_json::from_str(&SyncEnvelope::update("m1", "abc", 5).to_bounded_json().unwrap())
                .unwrap();
        assert_eq!(
            value,
            serde_json::json!({ "type": "update", "messageId": "m1", "content": "abc", "timestamp": 5 })
        );
    }

    #[test]
    fn oversized_update_is_truncated_with_marker() {
        let content = "a".repeat(MAX_SYNC_BYTES + 10);
        let json = SyncEnvelope::update("m1", content, 1).to_bounded_json().unwrap();
        let envelope: SyncEnvelope = serde_json::from_str(&json).unwrap();
        match envelope {
            SyncEnvelope::Update {
                content, truncated, ..
            } => {
                assert!(truncated);
                assert_eq!(content.len(), TRUNCATED_CONTENT_CHARS + TRUNCATION_MARKER.len());
                assert!(content.ends_with(TRUNCATION_MARKER));
            }
            other => panic!("unexpected envelope: {other:?}"),
        }
    }

    #[test]
    fn oversized_user_message_drops_media() {
        let message = user("look", 1).with_media(MediaAttachments {
            image: Some("i".repeat(90_000)),
            pdf_images: Some(vec!["p".repeat(40_000); 30]),
            ..Default::default()
        });
        let json = SyncEnvelope::user(&message, 2).to_bounded_json().unwrap();
        assert!(json.len() < MAX_SYNC_BYTES);
        let SyncEnvelope::User { message: sent, .. } = serde_json::from_str::<SyncEnvelope>(&json).unwrap() else {
            panic!("expected user envelope");
        };
        assert!(sent.has_media);
        assert!(sent.media.is_empty());
        assert_eq!(sent.content, "look");
    }

    #[test]
    fn oversized_user_text_is_truncated_with_marker() {
        let message = user(&"u".repeat(2_000_000), 1).with_media(MediaAttachments {
            image: Some("data:image/png;base64,QUJD".to_string()),
            ..Default::default()
        });
        let json = SyncEnvelope::user(&message, 2).to_bounded_json().unwrap();
        assert!(json.len() <= MAX_SYNC_BYTES);
        let SyncEnvelope::User { message: sent, .. } = serde_json::from_str::<SyncEnvelope>(&json).unwrap() else {
            panic!("expected user envelope");
        };
        assert!(sent.has_media);
        assert!(sent.media.is_empty());
        assert!(sent.content.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            sent.content.chars().count(),
            TRUNCATED_CONTENT_CHARS + TRUNCATION_MARKER.chars().count()
        );
    }

    #[test]
    fn oversized_assistant_message_is_truncated_with_marker() {
        let mut answer = ChatMessage::new(MessageRole::Assistant, "答".repeat(400_000), 3);
        answer.id = "a3".to_string();
        let json = SyncEnvelope::assistant(&answer, 4).to_bounded_json().unwrap();
        assert!(json.len() <= MAX_SYNC_BYTES);
        let SyncEnvelope::Assistant { message: sent, timestamp } =
            serde_json::from_str::<SyncEnvelope>(&json).unwrap()
        else {
            panic!("expected assistant envelope");
        };
        assert_eq!(timestamp, 4);
        assert_eq!(sent.id, "a3");
        assert!(sent.content.ends_with(TRUNCATION_MARKER));
        assert!(sent.content.starts_with(&"答".repeat(TRUNCATED_CONTENT_CHARS)));
    }

    #[test]
    fn small_envelopes_pass_through_unchanged() {
        let answer = ChatMessage::new(MessageRole::Assistant, "short", 3);
        let envelope = SyncEnvelope::assistant(&answer, 4);
        let json = envelope.to_bounded_json().unwrap();
        assert_eq!(json, serde_json::to_string(&envelope).unwrap());
        assert!(!json.contains("truncated"));
    }

    #[tokio::test]
    async fn subscribers_skip_their_own_writes() {
        let hub = Arc::new(SyncHub::default());
        let main = hub.endpoint("main");
        let mini = hub.endpoint("mini");
        let mut main_rx = main.subscribe();
        let mut mini_rx = mini.subscribe();

        main.publish(&SyncEnvelope::update("m1", "from main", 1));
        mini.publish(&SyncEnvelope::update("m1", "from mini", 2));

        let seen_by_mini = tokio::time::timeout(Duration::from_secs(1), mini_rx.recv())
            .await
            .unwrap();
        assert_eq!(seen_by_mini, Some(SyncEnvelope::update("m1", "from main", 1)));
        let seen_by_main = tokio::time::timeout(Duration::from_secs(1), main_rx.recv())
            .await
            .unwrap();
        assert_eq!(seen_by_main, Some(SyncEnvelope::update("m1", "from mini", 2)));
    }

    #[tokio::test]
    async fn lagging_subscriber_resyncs_to_latest() {
        let hub = Arc::new(SyncHub::default());
        let writer = hub.endpoint("main");
        let mut reader = hub.endpoint("mini").subscribe();

        for i in 0..(CHANGE_CAPACITY as u64 + 10) {
            writer.publish(&SyncEnvelope::update("m1", format!("v{i}"), i));
        }
        let last = CHANGE_CAPACITY as u64 + 9;
        let seen = reader.recv().await;
        assert_eq!(seen, Some(SyncEnvelope::update("m1", format!("v{last}"), last)));
        assert!(hub.latest_json().unwrap().contains(&format!("v{last}")));
    }

    #[test]
    fn recent_history_keeps_last_turns() {
        let mut transcript = LocalTranscript::default();
        let mut welcome = ChatMessage::new(MessageRole::Assistant, "welcome", 0);
        welcome.id = "welcome_msg_0".to_string();
        transcript.push(welcome);
        for i in 1..=10 {
            transcript.push(user(&format!("m{i}"), i));
        }
        let recent: Vec<&str> = transcript
            .recent_history(2)
            .into_iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(recent, vec!["m6", "m7", "m8", "m9", "m10"]);
    }
}
