use std::{sync::Arc, time::Instant};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::mpsc;

use super::error::ChatError;
use super::registry::StreamChannelRegistry;
use super::sse::Utf8Decoder;
use super::types::{ProxyCommand, RequestSpec, StreamEvent};

/// Privileged -> UI event channel.
pub trait StreamEventSink: Send + Sync + 'static {
    /// Returns `false` once the receiving side is gone.
    fn emit(&self, event: StreamEvent) -> bool;
}

impl StreamEventSink for mpsc::UnboundedSender<StreamEvent> {
    fn emit(&self, event: StreamEvent) -> bool {
        self.send(event).is_ok()
    }
}

impl<S: StreamEventSink> StreamEventSink for Arc<S> {
    fn emit(&self, event: StreamEvent) -> bool {
        (**self).emit(event)
    }
}

/// Result of a non-streaming proxied request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JsonResponse {
    pub ok: bool,
    pub status: u16,
    pub data: serde_json::Value,
}

#[derive(Debug, Default)]
struct PumpStats {
    chunks: usize,
    bytes: usize,
}

enum PumpOutcome {
    Completed,
    Cancelled,
    Failed(ChatError),
}

/// The only component that performs network I/O for chat streams.
pub struct StreamProxy {
    http_client: reqwest::Client,
    registry: Arc<StreamChannelRegistry>,
}

impl Default for StreamProxy {
    fn default() -> Self {
        let http_client = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::new(http_client)
    }
}

impl StreamProxy {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            registry: Arc::new(StreamChannelRegistry::default()),
        }
    }

    pub fn registry(&self) -> &Arc<StreamChannelRegistry> {
        &self.registry
    }

    fn build_request(
        &self,
        url: &str,
        spec: &RequestSpec,
    ) -> Result<reqwest::RequestBuilder, ChatError> {
        let method = reqwest::Method::from_bytes(spec.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| ChatError::invalid_request(format!("Invalid HTTP method: {}", spec.method)))?;
        let url = reqwest::Url::parse(url.trim())
            .map_err(|err| ChatError::invalid_request(format!("Invalid URL {url}: {err}")))?;

        let mut request = self.http_client.request(method, url);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &spec.body {
            request = request.body(body.clone());
        }
        Ok(request)
    }

    /// Registers the stream and spawns its request task.
    ///
    /// Returns once the request is dispatched; response headers are not awaited.
    /// The sink then receives chunk events and exactly one terminal event.
    pub fn open(
        &self,
        stream_id: &str,
        url: &str,
        spec: RequestSpec,
        sink: impl StreamEventSink,
    ) -> Result<(), ChatError> {
        let request = self.build_request(url, &spec)?;
        let ticket = self.registry.register(stream_id)?;
        let registry = self.registry.clone();
        let stream_id = stream_id.to_string();

        log::debug!("Opening stream {} ({} {})", stream_id, spec.method, url);

        tokio::spawn(async move {
            let started = Instant::now();
            let mut stats = PumpStats::default();

            let outcome = tokio::select! {
                biased;
                _ = ticket.token.cancelled() => PumpOutcome::Cancelled,
                result = pump(request, &stream_id, &sink, &mut stats) => match result {
                    Ok(()) => PumpOutcome::Completed,
                    Err(err) if err.is_cancelled() => PumpOutcome::Cancelled,
                    Err(err) => PumpOutcome::Failed(err),
                },
            };

            // Remove before the terminal event so observers never see a finished id as live.
            registry.complete(&stream_id, &ticket);
            let elapsed_ms = started.elapsed().as_millis();

            match outcome {
                PumpOutcome::Completed => {
                    log::info!(
                        "Stream {} completed in {}ms ({} chunks, {} bytes)",
                        stream_id,
                        elapsed_ms,
                        stats.chunks,
                        stats.bytes
                    );
                    sink.emit(StreamEvent::finished(&stream_id));
                }
                PumpOutcome::Cancelled => {
                    log::info!(
                        "Stream {} cancelled after {}ms ({} chunks, {} bytes)",
                        stream_id,
                        elapsed_ms,
                        stats.chunks,
                        stats.bytes
                    );
                    sink.emit(StreamEvent::finished(&stream_id));
                }
                PumpOutcome::Failed(err) => {
                    log::warn!(
                        "Stream {} error after {}ms ({} chunks, {} bytes): {}",
                        stream_id,
                        elapsed_ms,
                        stats.chunks,
                        stats.bytes,
                        err
                    );
                    sink.emit(StreamEvent::error(&stream_id, err));
                }
            }
        });

        Ok(())
    }

    pub fn cancel(&self, stream_id: &str) -> bool {
        let cancelled = self.registry.cancel(stream_id);
        if cancelled {
            log::debug!("Cancel requested for stream {}", stream_id);
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let count = self.registry.cancel_all();
        if count > 0 {
            log::info!("Cancelled {} open streams", count);
        }
        count
    }

    /// Entry point for commands arriving over the UI -> privileged channel.
    pub fn handle(&self, command: ProxyCommand, sink: impl StreamEventSink) -> Result<(), ChatError> {
        match command {
            ProxyCommand::OpenStream {
                stream_id,
                url,
                options,
            } => self.open(&stream_id, &url, options, sink),
            ProxyCommand::CancelStream { stream_id } => {
                self.cancel(&stream_id);
                Ok(())
            }
            ProxyCommand::CancelAllStreams => {
                self.cancel_all();
                Ok(())
            }
        }
    }

    /// Non-streaming request. Non-JSON bodies come back as `{ error, content }`.
    pub async fn request_json(&self, url: &str, spec: RequestSpec) -> Result<JsonResponse, ChatError> {
        let response = self.build_request(url, &spec)?.send().await?;
        let status = response.status();
        let text = response.text().await?;
        let data = serde_json::from_str(&text).unwrap_or_else(|_| {
            serde_json::json!({
                "error": "Invalid JSON response",
                "content": text,
            })
        });
        Ok(JsonResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            data,
        })
    }
}

async fn pump(
    request: reqwest::RequestBuilder,
    stream_id: &str,
    sink: &impl StreamEventSink,
    stats: &mut PumpStats,
) -> Result<(), ChatError> {
    let response = request.send().await?;
    let status = response.status();
    if !status.is_success() {
        let detail = match response.text().await {
            Ok(body) if !body.trim().is_empty() => body,
            _ => status.canonical_reason().unwrap_or_default().to_string(),
        };
        return Err(ChatError::http_status(status.as_u16(), detail));
    }

    let mut decoder = Utf8Decoder::default();
    let mut body = response.bytes_stream();
    while let Some(bytes) = body.next().await {
        let bytes = bytes?;
        stats.bytes += bytes.len();
        let text = decoder.push(&bytes);
        if text.is_empty() {
            continue;
        }
        stats.chunks += 1;
        if !sink.emit(StreamEvent::chunk(stream_id, text)) {
            // Nobody is listening any more.
            return Err(ChatError::cancelled());
        }
    }

    let rest = decoder.finish();
    if !rest.is_empty() {
        stats.chunks += 1;
        sink.emit(StreamEvent::chunk(stream_id, rest));
    }
    Ok(())
}
