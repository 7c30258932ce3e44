use std::{collections::HashMap, sync::Mutex};

use tokio_util::sync::CancellationToken;

use super::error::ChatError;

/// Live cancellation capability for one registered stream.
#[derive(Debug, Clone)]
pub struct StreamTicket {
    pub token: CancellationToken,
    generation: u64,
}

struct StreamEntry {
    token: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct RegistryInner {
    streams: HashMap<String, StreamEntry>,
    next_generation: u64,
}

/// Open-stream map of the privileged side.
///
/// Every entry is removed exactly once: by [`cancel`](Self::cancel),
/// [`cancel_all`](Self::cancel_all) or [`complete`](Self::complete), whichever
/// comes first. The generation stamp keeps a finished stream from removing a
/// newer registration that reuses its id.
#[derive(Default)]
pub struct StreamChannelRegistry {
    // NOTE: std Mutex; the lock is never held across `.await`.
    inner: Mutex<RegistryInner>,
}

impl StreamChannelRegistry {
    pub fn register(&self, stream_id: &str) -> Result<StreamTicket, ChatError> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ChatError::internal("Stream registry lock poisoned"))?;
        if inner.streams.contains_key(stream_id) {
            return Err(ChatError::invalid_request(format!(
                "Stream already in progress: {stream_id}"
            )));
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        let token = CancellationToken::new();
        inner.streams.insert(
            stream_id.to_string(),
            StreamEntry {
                token: token.clone(),
                generation,
            },
        );
        Ok(StreamTicket { token, generation })
    }

    /// Cancels and removes a live stream. Returns `false` for unknown or finished ids.
    pub fn cancel(&self, stream_id: &str) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let Some(entry) = inner.streams.remove(stream_id) else {
            return false;
        };
        entry.token.cancel();
        true
    }

    pub fn cancel_all(&self) -> usize {
        let Ok(mut inner) = self.inner.lock() else {
            return 0;
        };
        let count = inner.streams.len();
        for (_, entry) in inner.streams.drain() {
            entry.token.cancel();
        }
        count
    }

    /// Removes the entry after a terminal event, unless it was already cancelled.
    pub fn complete(&self, stream_id: &str, ticket: &StreamTicket) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let is_current = inner
            .streams
            .get(stream_id)
            .map(|entry| entry.generation == ticket.generation)
            .unwrap_or(false);
        if is_current {
            inner.streams.remove(stream_id);
        }
        is_current
    }

    pub fn contains(&self, stream_id: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.streams.contains_key(stream_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.streams.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_ids() {
        let registry = StreamChannelRegistry::default();
        registry.register("s1").unwrap();
        assert!(matches!(
            registry.register("s1"),
            Err(ChatError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn cancel_is_idempotent() {
        let registry = StreamChannelRegistry::default();
        let ticket = registry.register("s1").unwrap();
        assert!(registry.cancel("s1"));
        assert!(ticket.token.is_cancelled());
        assert!(!registry.cancel("s1"));
        assert!(!registry.complete("s1", &ticket));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_after_completion_is_noop() {
        let registry = StreamChannelRegistry::default();
        let ticket = registry.register("s1").unwrap();
        assert!(registry.complete("s1", &ticket));
        assert!(!registry.cancel("s1"));
        assert!(!ticket.token.is_cancelled());
    }

    #[test]
    fn stale_completion_leaves_newer_registration() {
        let registry = StreamChannelRegistry::default();
        let old = registry.register("s1").unwrap();
        registry.cancel("s1");
        let _new = registry.register("s1").unwrap();
        assert!(!registry.complete("s1", &old));
        assert!(registry.contains("s1"));
    }

    #[test]
    fn cancel_all_drains_everything() {
        let registry = StreamChannelRegistry::default();
        let a = registry.register("a").unwrap();
        let b = registry.register("b").unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(a.token.is_cancelled() && b.token.is_cancelled());
        assert_eq!(registry.cancel_all(), 0);
    }
}
