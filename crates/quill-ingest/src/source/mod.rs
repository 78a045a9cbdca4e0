//! Event source adapters.
//!
//! This module defines the seam between the pipeline and the upstream event
//! source. The gateway protocol itself (handshake, heartbeats, sharding) is
//! owned by the chat-client library; the pipeline consumes it through the
//! [`Gateway`] trait as an opaque, possibly-resumable stream of decoded
//! events.
//!
//! # Available Sources
//!
//! - [`JsonlGateway`] - Replays JSONL event files (one JSON event per line);
//!   resumable via a line-offset cursor. Used for backfill and local runs.
//! - [`EventConsumer`] - Drives any [`Gateway`], owning reconnect/backoff,
//!   resume-or-resync, and the bounded handoff to the normalizer.

mod consumer;
mod jsonl;

pub use consumer::{ConsumerConfig, EventConsumer};
pub use jsonl::{JsonlConfig, JsonlGateway};

use crate::Result;
use async_trait::async_trait;
use quill_core::RawEvent;

/// Opaque resume position within an event stream.
///
/// Produced by a [`GatewayConnection`] as events are consumed and handed
/// back on reconnect. The format is private to each gateway implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor(pub String);

/// An upstream source of chat events.
///
/// Implementations own the connection establishment only; the
/// [`EventConsumer`] owns the retry/backoff/resume policy around it.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Human-readable name for this source (used in logs and metrics).
    fn name(&self) -> &'static str;

    /// Whether this gateway can resume from a [`Cursor`]. Non-resumable
    /// gateways trigger a full resync on reconnect, which is reported but
    /// never treated as a failure.
    fn supports_resume(&self) -> bool;

    /// Establish a connection, optionally resuming from a prior position.
    ///
    /// Transient connection failures should surface as [`Error::Gateway`];
    /// credential rejection as [`Error::Auth`].
    ///
    /// [`Error::Gateway`]: crate::Error::Gateway
    /// [`Error::Auth`]: crate::Error::Auth
    async fn connect(&self, resume: Option<&Cursor>) -> Result<Box<dyn GatewayConnection>>;
}

/// An established gateway connection delivering decoded events in arrival
/// order per logical channel.
#[async_trait]
pub trait GatewayConnection: Send {
    /// Receive the next decoded event.
    ///
    /// Returns `Ok(None)` on a clean end of stream (finite sources such as
    /// replay files). A malformed event surfaces as [`Error::Decode`] and
    /// does not invalidate the connection; any other error means the
    /// connection is lost and the consumer should reconnect.
    ///
    /// [`Error::Decode`]: crate::Error::Decode
    async fn next_event(&mut self) -> Result<Option<RawEvent>>;

    /// Current resume position, if the stream tracks one.
    fn cursor(&self) -> Option<Cursor>;
}

/// Statistics from a consumer run.
#[derive(Debug, Clone, Default)]
pub struct SourceStats {
    /// Total events received from the gateway.
    pub total_events: usize,

    /// Events that failed to decode and were skipped.
    pub decode_errors: usize,

    /// Reconnection attempts made.
    pub reconnects: usize,

    /// Full resyncs performed because resume was unavailable.
    pub resyncs: usize,
}
