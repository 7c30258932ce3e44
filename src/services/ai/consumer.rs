//! Turns raw proxy events into displayed assistant text for one chat turn.
//!
//! A [`ChatTurn`] owns the channel buffers of a single stream and pushes
//! throttled repaints to the local window and throttled mirrors to the other
//! windows. [`TurnController`] keeps at most one turn alive per UI context.

use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::services::sync::{SyncEndpoint, SyncEnvelope};

use super::error::ChatError;
use super::provider::ProviderAdapter;
use super::proxy::StreamProxy;
use super::sse::LineBuffer;
use super::throttle::{Clock, Throttle, MIRROR_INTERVAL, REPAINT_INTERVAL};
use super::types::{ChunkChannel, StreamEvent};

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Reasoning wrapped in a think block, followed by the answer.
pub fn display_content(reasoning: &str, content: &str) -> String {
    if reasoning.is_empty() {
        return content.to_string();
    }
    format!("<think>\n{reasoning}\n</think>\n\n{content}")
}

/// Inverse of [`display_content`]: `(reasoning, content)`.
///
/// A think block that has not been closed yet is all reasoning.
pub fn split_display(display: &str) -> (&str, &str) {
    let Some(rest) = display.strip_prefix("<think>\n") else {
        return ("", display);
    };
    match rest.split_once("\n</think>\n\n") {
        Some((reasoning, content)) => (reasoning, content),
        None => (rest, ""),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Sending,
    Streaming,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    fn can_transition_to(self, next: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, next),
            (Idle, Sending)
                | (Idle, Finalizing)
                | (Sending, Streaming)
                | (Sending, Finalizing)
                | (Streaming, Finalizing)
                | (Finalizing, Completed)
                | (Finalizing, Cancelled)
                | (Finalizing, Failed)
        )
    }

    fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sending => "sending",
            Self::Streaming => "streaming",
            Self::Finalizing => "finalizing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "error",
        }
    }
}

/// Receives the full displayed content of the streaming message.
pub trait RepaintSink: Send + Sync {
    fn repaint(&self, message_id: &str, content: &str);
}

impl<F> RepaintSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn repaint(&self, message_id: &str, content: &str) {
        self(message_id, content)
    }
}

/// Where a turn pushes its visible state.
pub struct TurnOutputs<'a> {
    pub repaint: &'a dyn RepaintSink,
    /// `None` in windows that do not mirror (e.g. private sessions).
    pub mirror: Option<&'a SyncEndpoint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed { content: String },
    Cancelled { content: String },
    Failed { content: String, error: ChatError },
}

impl TurnOutcome {
    pub fn content(&self) -> &str {
        match self {
            Self::Completed { content }
            | Self::Cancelled { content }
            | Self::Failed { content, .. } => content,
        }
    }
}

pub struct ChatTurn {
    stream_id: String,
    message_id: String,
    adapter: &'static dyn ProviderAdapter,
    state: TurnState,
    reasoning: String,
    content: String,
    lines: LineBuffer,
    chunk_count: usize,
    started: Instant,
    repaint: Throttle,
    mirror: Throttle,
    error: Option<ChatError>,
}

impl ChatTurn {
    pub fn new(
        stream_id: impl Into<String>,
        message_id: impl Into<String>,
        adapter: &'static dyn ProviderAdapter,
        now: Instant,
    ) -> Self {
        Self {
            stream_id: stream_id.into(),
            message_id: message_id.into(),
            adapter,
            state: TurnState::Idle,
            reasoning: String::new(),
            content: String::new(),
            lines: LineBuffer::default(),
            chunk_count: 0,
            started: now,
            repaint: Throttle::new(REPAINT_INTERVAL),
            mirror: Throttle::new(MIRROR_INTERVAL),
            error: None,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn display_content(&self) -> String {
        display_content(&self.reasoning, &self.content)
    }

    fn transition(&mut self, next: TurnState) -> bool {
        if !self.state.can_transition_to(next) {
            log::debug!(
                "Ignoring turn transition {:?} -> {:?} for stream {}",
                self.state,
                next,
                self.stream_id
            );
            return false;
        }
        self.state = next;
        true
    }

    pub fn mark_sending(&mut self) -> bool {
        self.transition(TurnState::Sending)
    }

    /// The proxy accepted the request; response headers may still be pending.
    pub fn mark_dispatched(&mut self) -> bool {
        self.transition(TurnState::Streaming)
    }

    pub fn apply_event(&mut self, event: &StreamEvent, now: Instant, out: &TurnOutputs<'_>) {
        if event.stream_id() != self.stream_id {
            log::debug!(
                "Turn {} ignoring event for stream {}",
                self.stream_id,
                event.stream_id()
            );
            return;
        }
        if self.state.is_terminal() || self.state == TurnState::Finalizing {
            return;
        }
        if self.state == TurnState::Sending {
            self.transition(TurnState::Streaming);
        }

        match event {
            StreamEvent::Chunk { data, is_final, .. } => {
                let mut changed = false;
                if let Some(data) = data {
                    for line in self.lines.push(data) {
                        changed |= self.ingest_line(&line);
                    }
                }
                if *is_final {
                    self.drain_partial_line();
                    self.finalize(TurnState::Completed, None, now, out);
                } else if changed {
                    self.publish_progress(now, out);
                }
            }
            StreamEvent::Error { error, .. } => {
                self.drain_partial_line();
                if error.is_cancelled() {
                    self.finalize(TurnState::Cancelled, None, now, out);
                } else {
                    self.finalize(TurnState::Failed, Some(error.clone()), now, out);
                }
            }
        }
    }

    /// Stops the turn, keeping whatever was already displayed. No-op once finished.
    pub fn cancel(&mut self, now: Instant, out: &TurnOutputs<'_>) -> bool {
        if self.state.is_terminal() || self.state == TurnState::Finalizing {
            return false;
        }
        self.finalize(TurnState::Cancelled, None, now, out);
        true
    }

    pub fn fail(&mut self, error: ChatError, now: Instant, out: &TurnOutputs<'_>) {
        if self.state.is_terminal() || self.state == TurnState::Finalizing {
            return;
        }
        self.finalize(TurnState::Failed, Some(error), now, out);
    }

    /// Emits deferred repaints or mirrors whose interval has elapsed.
    pub fn tick(&mut self, now: Instant, out: &TurnOutputs<'_>) {
        if self.state != TurnState::Streaming {
            return;
        }
        if self.repaint.poll(now) {
            out.repaint.repaint(&self.message_id, &self.display_content());
        }
        if self.mirror.poll(now) {
            self.mirror_now(out);
        }
    }

    /// Earliest instant at which [`tick`](Self::tick) has deferred work.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.repaint.deadline(), self.mirror.deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn outcome(&self) -> Option<TurnOutcome> {
        let content = self.display_content();
        match self.state {
            TurnState::Completed => Some(TurnOutcome::Completed { content }),
            TurnState::Cancelled => Some(TurnOutcome::Cancelled { content }),
            TurnState::Failed => Some(TurnOutcome::Failed {
                content,
                error: self
                    .error
                    .clone()
                    .unwrap_or_else(|| ChatError::internal("Stream failed")),
            }),
            _ => None,
        }
    }

    fn ingest_line(&mut self, line: &str) -> bool {
        let mut changed = false;
        for chunk in self.adapter.parse_chunk(line) {
            if chunk.text.is_empty() {
                continue;
            }
            match chunk.channel {
                ChunkChannel::Reasoning => self.reasoning.push_str(&chunk.text),
                ChunkChannel::Content => self.content.push_str(&chunk.text),
            }
            self.chunk_count += 1;
            changed = true;
        }
        changed
    }

    fn drain_partial_line(&mut self) {
        if let Some(rest) = self.lines.finish() {
            self.ingest_line(&rest);
        }
    }

    fn publish_progress(&mut self, now: Instant, out: &TurnOutputs<'_>) {
        if self.repaint.request(now) {
            out.repaint.repaint(&self.message_id, &self.display_content());
        }
        if self.mirror.request(now) {
            self.mirror_now(out);
        }
    }

    fn mirror_now(&self, out: &TurnOutputs<'_>) {
        if let Some(mirror) = out.mirror {
            mirror.publish(&SyncEnvelope::update(
                &self.message_id,
                self.display_content(),
                now_ms(),
            ));
        }
    }

    fn finalize(
        &mut self,
        end: TurnState,
        error: Option<ChatError>,
        now: Instant,
        out: &TurnOutputs<'_>,
    ) {
        if !self.transition(TurnState::Finalizing) {
            return;
        }

        // Final state always goes out, regardless of throttles.
        self.repaint.flush();
        self.mirror.flush();
        out.repaint.repaint(&self.message_id, &self.display_content());
        self.mirror_now(out);

        let elapsed_ms = now.saturating_duration_since(self.started).as_millis();
        match &error {
            Some(err) => log::warn!(
                "Turn {} ({:?}) error after {}ms ({} chunks, {} reasoning chars, {} content chars): {}",
                self.stream_id,
                self.adapter.family(),
                elapsed_ms,
                self.chunk_count,
                self.reasoning.chars().count(),
                self.content.chars().count(),
                err
            ),
            None => log::info!(
                "Turn {} ({:?}) {} after {}ms ({} chunks, {} reasoning chars, {} content chars)",
                self.stream_id,
                self.adapter.family(),
                end.label(),
                elapsed_ms,
                self.chunk_count,
                self.reasoning.chars().count(),
                self.content.chars().count()
            ),
        }

        self.error = error;
        self.transition(end);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending::<()>().await,
    }
}

/// Feeds proxy events into `turn` until it reaches a terminal state.
///
/// `cancel` is observed before every event. Deferred repaints and mirrors are
/// flushed when their interval elapses even if no further chunk arrives.
pub async fn run_turn(
    turn: &mut ChatTurn,
    events: &mut mpsc::UnboundedReceiver<StreamEvent>,
    cancel: &CancellationToken,
    clock: &dyn Clock,
    out: &TurnOutputs<'_>,
) -> TurnOutcome {
    loop {
        if let Some(outcome) = turn.outcome() {
            return outcome;
        }
        let deadline = turn.next_deadline();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                turn.cancel(clock.now(), out);
            }
            event = events.recv() => match event {
                Some(event) => turn.apply_event(&event, clock.now(), out),
                None => turn.fail(
                    ChatError::internal("Stream closed without a terminal event"),
                    clock.now(),
                    out,
                ),
            },
            _ = sleep_until(deadline) => turn.tick(clock.now(), out),
        }
    }
}

struct ActiveTurn {
    stream_id: String,
    token: CancellationToken,
}

/// Single-active-turn guard for one UI context.
pub struct TurnController {
    proxy: Arc<StreamProxy>,
    // NOTE: std Mutex; never held across `.await`.
    active: Mutex<Option<ActiveTurn>>,
}

impl TurnController {
    pub fn new(proxy: Arc<StreamProxy>) -> Self {
        Self {
            proxy,
            active: Mutex::new(None),
        }
    }

    pub fn proxy(&self) -> &Arc<StreamProxy> {
        &self.proxy
    }

    /// Cancels the previous turn, if any, then makes `stream_id` the active one.
    pub fn begin_turn(&self, stream_id: &str) -> Result<CancellationToken, ChatError> {
        let token = CancellationToken::new();
        let previous = {
            let mut active = self
                .active
                .lock()
                .map_err(|_| ChatError::internal("Turn controller lock poisoned"))?;
            active.replace(ActiveTurn {
                stream_id: stream_id.to_string(),
                token: token.clone(),
            })
        };

        if let Some(previous) = previous {
            log::info!(
                "Cancelling turn {} before starting {}",
                previous.stream_id,
                stream_id
            );
            previous.token.cancel();
            self.proxy.cancel(&previous.stream_id);
        }
        Ok(token)
    }

    /// Cancels the active turn. Safe to call repeatedly.
    pub fn cancel_current(&self) -> bool {
        let Some(active) = self.active.lock().ok().and_then(|mut a| a.take()) else {
            return false;
        };
        active.token.cancel();
        self.proxy.cancel(&active.stream_id);
        true
    }

    /// Clears the active slot if it still belongs to `stream_id`.
    pub fn finish_turn(&self, stream_id: &str) {
        if let Ok(mut active) = self.active.lock() {
            if active.as_ref().is_some_and(|a| a.stream_id == stream_id) {
                active.take();
            }
        }
    }

    pub fn active_stream(&self) -> Option<String> {
        self.active
            .lock()
            .ok()
            .and_then(|a| a.as_ref().map(|a| a.stream_id.clone()))
    }
}
