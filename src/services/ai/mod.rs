//! Streaming chat core.
//!
//! - `proxy` + `registry`: the only place that performs network I/O; forwards
//!   raw chunks and one terminal event per stream.
//! - `provider`: pure per-provider request/response translation.
//! - `consumer` + `session`: per-turn state machine, throttled repaint and
//!   cross-window mirroring, persistence of completed turns.

pub mod consumer;
pub mod error;
pub mod provider;
pub mod proxy;
pub mod registry;
pub mod session;
pub mod sse;
pub mod throttle;
pub mod types;

pub use consumer::{
    display_content, run_turn, split_display, ChatTurn, RepaintSink, TurnController,
    TurnOutcome, TurnOutputs, TurnState,
};
pub use error::ChatError;
pub use provider::{adapter_for, ProviderAdapter};
pub use proxy::{JsonResponse, StreamEventSink, StreamProxy};
pub use registry::{StreamChannelRegistry, StreamTicket};
pub use session::{build_canonical_request, ChatSession};
pub use types::{
    CanonicalChunk, CanonicalMessage, CanonicalRequest, ChunkChannel, ContentPart, PromptRole,
    ProxyCommand, RequestSpec, StreamEvent,
};
