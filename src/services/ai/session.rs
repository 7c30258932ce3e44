//! One UI context's chat: transcript, active turn, persistence and mirroring.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::mpsc;

use crate::plugins::history::{
    ChatMessage, Conversation, ConversationStore, MediaAttachments, MessageRole,
};
use crate::services::config::ChatSettings;
use crate::services::prompts;
use crate::services::sync::{LocalTranscript, SyncEndpoint, SyncEnvelope};

use super::consumer::{now_ms, run_turn, ChatTurn, RepaintSink, TurnController, TurnOutcome, TurnOutputs};
use super::error::ChatError;
use super::proxy::StreamProxy;
use super::throttle::{Clock, SystemClock};
use super::types::{CanonicalMessage, CanonicalRequest, ContentPart, PromptRole};

/// Prompt used when a user message carries only media.
const MEDIA_ONLY_PROMPT: &str = "Please analyze this content";

/// System prompt followed by recent history, media expanded into parts.
pub fn build_canonical_request(system_prompt: &str, history: &[&ChatMessage]) -> CanonicalRequest {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if !system_prompt.trim().is_empty() {
        messages.push(CanonicalMessage {
            role: PromptRole::System,
            content: vec![ContentPart::text(system_prompt)],
        });
    }

    for message in history {
        let role = match message.role {
            MessageRole::User => PromptRole::User,
            MessageRole::Assistant => PromptRole::Assistant,
        };
        let mut content = Vec::new();
        if !message.content.is_empty() {
            content.push(ContentPart::text(message.content.as_str()));
        }
        content.extend(message.media.content_parts());
        if content.is_empty() {
            content.push(ContentPart::text(MEDIA_ONLY_PROMPT));
        }
        messages.push(CanonicalMessage { role, content });
    }

    CanonicalRequest { messages }
}

fn new_conversation_id() -> String {
    format!("conv_{}", uuid::Uuid::new_v4())
}

pub struct ChatSession {
    controller: TurnController,
    sync: SyncEndpoint,
    store: Arc<dyn ConversationStore>,
    settings: ArcSwap<ChatSettings>,
    // NOTE: std Mutex; every lock is scoped away from `.await` points.
    transcript: Mutex<LocalTranscript>,
    conversation_id: Mutex<String>,
    clock: Arc<dyn Clock>,
}

impl ChatSession {
    pub fn new(
        proxy: Arc<StreamProxy>,
        sync: SyncEndpoint,
        store: Arc<dyn ConversationStore>,
        settings: ChatSettings,
    ) -> Self {
        Self {
            controller: TurnController::new(proxy),
            sync,
            store,
            settings: ArcSwap::from_pointee(settings),
            transcript: Mutex::new(LocalTranscript::default()),
            conversation_id: Mutex::new(new_conversation_id()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn settings(&self) -> Arc<ChatSettings> {
        self.settings.load_full()
    }

    /// Takes effect from the next turn.
    pub fn update_settings(&self, settings: ChatSettings) {
        self.settings.store(Arc::new(settings));
    }

    pub fn sync_endpoint(&self) -> &SyncEndpoint {
        &self.sync
    }

    pub fn conversation_id(&self) -> Result<String, ChatError> {
        self.conversation_id
            .lock()
            .map(|id| id.clone())
            .map_err(|_| ChatError::internal("Conversation id lock poisoned"))
    }

    fn with_transcript<R>(&self, f: impl FnOnce(&mut LocalTranscript) -> R) -> Result<R, ChatError> {
        let mut transcript = self
            .transcript
            .lock()
            .map_err(|_| ChatError::internal("Transcript lock poisoned"))?;
        Ok(f(&mut transcript))
    }

    pub fn messages(&self) -> Result<Vec<ChatMessage>, ChatError> {
        self.with_transcript(|t| t.messages().to_vec())
    }

    /// Applies a mirror envelope written by another window.
    pub fn apply_remote(&self, envelope: &SyncEnvelope) -> Result<bool, ChatError> {
        self.with_transcript(|t| t.apply(envelope))
    }

    pub fn cancel_current(&self) -> bool {
        self.controller.cancel_current()
    }

    /// Cancels any running turn and starts an empty conversation.
    pub fn new_conversation(&self) -> Result<String, ChatError> {
        self.controller.cancel_current();
        let id = new_conversation_id();
        self.with_transcript(|t| t.clear())?;
        *self
            .conversation_id
            .lock()
            .map_err(|_| ChatError::internal("Conversation id lock poisoned"))? = id.clone();
        Ok(id)
    }

    /// Cancels any running turn and replaces the transcript with a stored conversation.
    pub async fn open_conversation(&self, id: &str) -> Result<(), ChatError> {
        self.controller.cancel_current();
        let conversation = self.store.load_conversation(id).await?;
        self.with_transcript(|t| t.replace_all(conversation.messages))?;
        *self
            .conversation_id
            .lock()
            .map_err(|_| ChatError::internal("Conversation id lock poisoned"))? = conversation.id;
        Ok(())
    }

    /// Runs one chat turn to completion.
    ///
    /// Any turn still streaming in this session is cancelled first. Completed
    /// turns are saved unless private mode is on. Failures leave the partial
    /// answer in place and append a readable error message.
    pub async fn send(
        &self,
        text: &str,
        media: MediaAttachments,
        repaint: &dyn RepaintSink,
    ) -> Result<TurnOutcome, ChatError> {
        let settings = self.settings.load_full();
        if text.trim().is_empty() && media.is_empty() {
            return Err(ChatError::invalid_request("Message is empty"));
        }
        if settings.provider.requires_api_key() && settings.provider.api_key.is_empty() {
            return Err(ChatError::invalid_request(format!(
                "API key for {} is not configured",
                settings.provider.provider.as_str()
            )));
        }

        let stream_id = format!("stream_{}", uuid::Uuid::new_v4());
        let cancel = self.controller.begin_turn(&stream_id)?;

        let user = ChatMessage::new(MessageRole::User, text, now_ms()).with_media(media);
        let system_prompt = prompts::build_system_prompt(&settings.system_prompt, settings.language);
        let request = self.with_transcript(|t| {
            t.push(user.clone());
            build_canonical_request(&system_prompt, &t.recent_history(settings.history_turns))
        })?;
        self.sync.publish(&SyncEnvelope::user(&user, now_ms()));

        let placeholder = ChatMessage::new(MessageRole::Assistant, "", now_ms());
        self.with_transcript(|t| t.push(placeholder.clone()))?;
        self.sync.publish(&SyncEnvelope::assistant(&placeholder, now_ms()));

        let adapter = settings.provider.provider.adapter();
        let (url, spec) = adapter.build_request(&request, &settings.provider);
        let mut turn = ChatTurn::new(&stream_id, &placeholder.id, adapter, self.clock.now());
        let outputs = TurnOutputs {
            repaint,
            mirror: Some(&self.sync),
        };

        log::info!(
            "Turn {} starting ({}, model {}, {} prompt messages)",
            stream_id,
            settings.provider.provider.as_str(),
            settings.provider.model,
            request.messages.len()
        );

        turn.mark_sending();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outcome = match self.controller.proxy().open(&stream_id, &url, spec, tx) {
            Ok(()) => {
                turn.mark_dispatched();
                run_turn(&mut turn, &mut rx, &cancel, self.clock.as_ref(), &outputs).await
            }
            Err(err) => {
                turn.fail(err, self.clock.now(), &outputs);
                match turn.outcome() {
                    Some(outcome) => outcome,
                    None => TurnOutcome::Failed {
                        content: String::new(),
                        error: ChatError::internal("Turn did not finish"),
                    },
                }
            }
        };
        self.controller.finish_turn(&stream_id);
        // A cancelled turn may still have a live request if cancellation came from the token.
        self.controller.proxy().cancel(&stream_id);

        self.settle(&placeholder.id, &outcome)?;

        if matches!(outcome, TurnOutcome::Completed { .. }) && !settings.private_mode {
            self.persist().await?;
        }
        Ok(outcome)
    }

    /// Writes the outcome into the transcript and mirrors structural changes.
    fn settle(&self, message_id: &str, outcome: &TurnOutcome) -> Result<(), ChatError> {
        let content = outcome.content();
        let removed = self.with_transcript(|t| {
            if content.is_empty() && !matches!(outcome, TurnOutcome::Completed { .. }) {
                t.remove(message_id)
            } else {
                t.set_content(message_id, content);
                false
            }
        })?;
        if removed {
            self.sync.publish(&SyncEnvelope::remove(message_id, now_ms()));
        }

        if let TurnOutcome::Failed { error, .. } = outcome {
            let notice = ChatMessage::new(
                MessageRole::Assistant,
                format!("Error: {}", error.user_message()),
                now_ms(),
            );
            self.with_transcript(|t| t.push(notice.clone()))?;
            self.sync.publish(&SyncEnvelope::assistant(&notice, now_ms()));
        }
        Ok(())
    }

    async fn persist(&self) -> Result<(), ChatError> {
        let id = self.conversation_id()?;
        let conversation =
            self.with_transcript(|t| Conversation::from_messages(id, t.messages(), now_ms()))?;
        if !conversation.is_complete() {
            log::debug!("Conversation {} is incomplete; not saving", conversation.id);
            return Ok(());
        }
        self.store.save_conversation(&conversation).await?;
        Ok(())
    }
}
