//! Gateway event consumer.
//!
//! The [`EventConsumer`] owns the connection lifecycle for a [`Gateway`]:
//! it connects, streams decoded events into a bounded channel toward the
//! normalizer, and on connection loss reconnects with capped exponential
//! backoff and jitter, resuming from the last acknowledged position when
//! the gateway supports it.
//!
//! Every await that can block indefinitely (waiting on a quiet stream,
//! sleeping out a backoff) is raced against the shared [`Shutdown`]
//! signal, so the consumer stops accepting events promptly on shutdown.
//!
//! # Failure policy
//!
//! - Credential rejection aborts the run immediately.
//! - Transient connect/stream errors are retried; a configurable run of
//!   consecutive connect failures escalates to a fatal error.
//! - A full resync (resume unsupported or cursor lost) is reported via
//!   logs and metrics, never treated as a failure.

use super::{Cursor, Gateway, SourceStats};
use crate::shutdown::Shutdown;
use crate::{Error, Result};
use metrics::{counter, gauge};
use quill_core::RawEvent;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for the event consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// First reconnect delay.
    pub initial_backoff: Duration,

    /// Ceiling for the reconnect delay.
    pub max_backoff: Duration,

    /// Consecutive connect failures before escalating to a fatal error.
    pub fatal_after: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            fatal_after: 10,
        }
    }
}

/// Drives a [`Gateway`], feeding decoded events into the pipeline.
pub struct EventConsumer<G> {
    gateway: G,
    config: ConsumerConfig,
    shutdown: Arc<Shutdown>,
}

impl<G: Gateway> EventConsumer<G> {
    /// Create a new consumer.
    ///
    /// When `shutdown` triggers, the consumer stops accepting new events
    /// and returns its statistics, even if it is mid-await on the stream.
    pub fn new(gateway: G, config: ConsumerConfig, shutdown: Arc<Shutdown>) -> Self {
        Self {
            gateway,
            config,
            shutdown,
        }
    }

    /// Run the consume loop until shutdown, clean end of stream, or a
    /// fatal error.
    ///
    /// Every decoded event is sent exactly once, in arrival order, into
    /// `tx`. The send awaits when the channel is full, which is the
    /// pipeline's backpressure point.
    pub async fn run(&self, tx: mpsc::Sender<RawEvent>) -> Result<SourceStats> {
        let mut stats = SourceStats::default();
        let mut cursor: Option<Cursor> = None;
        let mut consecutive_failures = 0u32;

        while !self.shutdown.is_triggered() {
            if cursor.is_some() && !self.gateway.supports_resume() {
                stats.resyncs += 1;
                counter!("gateway_resyncs_total").increment(1);
                tracing::info!(
                    source = self.gateway.name(),
                    "gateway cannot resume, performing full resync"
                );
                cursor = None;
            }

            let mut conn = match self.gateway.connect(cursor.as_ref()).await {
                Ok(conn) => conn,
                Err(e @ Error::Auth(_)) => {
                    tracing::error!(error = %e, "gateway rejected credentials");
                    return Err(e);
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.config.fatal_after {
                        tracing::error!(
                            failures = consecutive_failures,
                            error = %e,
                            "giving up on gateway reconnection"
                        );
                        return Err(Error::ReconnectExhausted(consecutive_failures));
                    }

                    let delay = self.backoff_delay(consecutive_failures);
                    stats.reconnects += 1;
                    counter!("gateway_reconnects_total").increment(1);
                    tracing::warn!(
                        error = %e,
                        attempt = consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "gateway connect failed, backing off"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                    continue;
                }
            };

            gauge!("gateway_connected").set(1.0);
            tracing::info!(source = self.gateway.name(), "gateway connected");

            let outcome = self.consume(conn.as_mut(), &tx, &mut stats, &mut cursor).await;
            gauge!("gateway_connected").set(0.0);

            match outcome {
                StreamOutcome::Finished => return Ok(stats),
                StreamOutcome::Lost(e) => {
                    consecutive_failures = 1;
                    stats.reconnects += 1;
                    counter!("gateway_reconnects_total").increment(1);
                    let delay = self.backoff_delay(consecutive_failures);
                    tracing::warn!(
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "gateway connection lost, reconnecting"
                    );
                    if self.sleep_or_shutdown(delay).await {
                        break;
                    }
                }
                StreamOutcome::Stopped => break,
            }
        }

        Ok(stats)
    }

    /// Stream events from one established connection.
    async fn consume(
        &self,
        conn: &mut dyn super::GatewayConnection,
        tx: &mpsc::Sender<RawEvent>,
        stats: &mut SourceStats,
        cursor: &mut Option<Cursor>,
    ) -> StreamOutcome {
        loop {
            let next = tokio::select! {
                next = conn.next_event() => next,
                _ = self.shutdown.wait() => return StreamOutcome::Stopped,
            };

            match next {
                Ok(Some(event)) => {
                    stats.total_events += 1;
                    counter!("gateway_events_total").increment(1);

                    if tx.send(event).await.is_err() {
                        // Normalizer side is gone; nothing left to feed.
                        tracing::info!("event channel closed, stopping consumer");
                        return StreamOutcome::Finished;
                    }

                    // The event is acknowledged once it is handed off, so a
                    // resume after reconnect starts just past it.
                    *cursor = conn.cursor();
                }
                Ok(None) => {
                    tracing::info!(source = self.gateway.name(), "event stream finished");
                    return StreamOutcome::Finished;
                }
                Err(Error::Decode(reason)) => {
                    stats.decode_errors += 1;
                    counter!("gateway_decode_errors_total").increment(1);
                    tracing::warn!(%reason, "skipping undecodable event");
                }
                Err(e) => return StreamOutcome::Lost(e),
            }
        }
    }

    /// Sleep for `delay`; returns `true` if shutdown triggered first.
    async fn sleep_or_shutdown(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = self.shutdown.wait() => true,
        }
    }

    /// Exponential backoff with jitter, capped at `max_backoff`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .config
            .initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.config.max_backoff);
        let factor = rand::thread_rng().gen_range(0.5..1.0);
        base.mul_f64(factor)
    }
}

enum StreamOutcome {
    /// Clean end of stream or downstream hung up.
    Finished,
    /// Connection dropped; reconnect.
    Lost(Error),
    /// Shutdown triggered.
    Stopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::GatewayConnection;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use quill_core::EventKind;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    fn test_event(n: u64) -> RawEvent {
        RawEvent {
            channel_id: "chan".to_string(),
            message_id: format!("msg-{n}"),
            kind: EventKind::Create,
            timestamp: n,
            payload: serde_json::json!({"text": format!("event {n}")}),
        }
    }

    fn fast_config(fatal_after: u32) -> ConsumerConfig {
        ConsumerConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            fatal_after,
        }
    }

    /// Gateway that fails the first `fail_connects` connection attempts,
    /// then delivers its events and ends the stream.
    struct FlakyGateway {
        fail_connects: AtomicU32,
        events: Mutex<VecDeque<RawEvent>>,
        resumable: bool,
    }

    struct FlakyConnection {
        events: VecDeque<RawEvent>,
        position: u64,
    }

    #[async_trait]
    impl Gateway for FlakyGateway {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn supports_resume(&self) -> bool {
            self.resumable
        }

        async fn connect(&self, resume: Option<&Cursor>) -> Result<Box<dyn GatewayConnection>> {
            if self.fail_connects.load(Ordering::SeqCst) > 0 {
                self.fail_connects.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Gateway("connection refused".to_string()));
            }
            let position = resume
                .and_then(|c| c.0.parse::<u64>().ok())
                .unwrap_or(0);
            let mut events = self.events.lock().clone();
            for _ in 0..position {
                events.pop_front();
            }
            Ok(Box::new(FlakyConnection { events, position }))
        }
    }

    #[async_trait]
    impl GatewayConnection for FlakyConnection {
        async fn next_event(&mut self) -> Result<Option<RawEvent>> {
            match self.events.pop_front() {
                Some(event) => {
                    self.position += 1;
                    Ok(Some(event))
                }
                None => Ok(None),
            }
        }

        fn cursor(&self) -> Option<Cursor> {
            Some(Cursor(self.position.to_string()))
        }
    }

    /// Gateway that always rejects credentials.
    struct AuthFailGateway;

    #[async_trait]
    impl Gateway for AuthFailGateway {
        fn name(&self) -> &'static str {
            "authfail"
        }

        fn supports_resume(&self) -> bool {
            false
        }

        async fn connect(&self, _resume: Option<&Cursor>) -> Result<Box<dyn GatewayConnection>> {
            Err(Error::Auth("invalid token".to_string()))
        }
    }

    /// Gateway whose stream delivers nothing and never ends, like a quiet
    /// live connection.
    struct QuietGateway;

    struct QuietConnection;

    #[async_trait]
    impl Gateway for QuietGateway {
        fn name(&self) -> &'static str {
            "quiet"
        }

        fn supports_resume(&self) -> bool {
            false
        }

        async fn connect(&self, _resume: Option<&Cursor>) -> Result<Box<dyn GatewayConnection>> {
            Ok(Box::new(QuietConnection))
        }
    }

    #[async_trait]
    impl GatewayConnection for QuietConnection {
        async fn next_event(&mut self) -> Result<Option<RawEvent>> {
            std::future::pending().await
        }

        fn cursor(&self) -> Option<Cursor> {
            None
        }
    }

    #[tokio::test]
    async fn test_delivers_events_in_order() {
        let gateway = FlakyGateway {
            fail_connects: AtomicU32::new(0),
            events: Mutex::new((1..=5).map(test_event).collect()),
            resumable: true,
        };
        let consumer = EventConsumer::new(gateway, fast_config(10), Shutdown::new());

        let (tx, mut rx) = mpsc::channel(16);
        let stats = consumer.run(tx).await.unwrap();

        assert_eq!(stats.total_events, 5);
        for n in 1..=5 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.message_id, format!("msg-{n}"));
        }
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnects_after_transient_failures() {
        let gateway = FlakyGateway {
            fail_connects: AtomicU32::new(3),
            events: Mutex::new((1..=2).map(test_event).collect()),
            resumable: true,
        };
        let consumer = EventConsumer::new(gateway, fast_config(10), Shutdown::new());

        let (tx, mut rx) = mpsc::channel(16);
        let stats = consumer.run(tx).await.unwrap();

        assert_eq!(stats.total_events, 2);
        assert_eq!(stats.reconnects, 3);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_auth_failure_is_fatal() {
        let consumer = EventConsumer::new(AuthFailGateway, fast_config(10), Shutdown::new());

        let (tx, _rx) = mpsc::channel(16);
        let err = consumer.run(tx).await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn test_escalates_after_consecutive_failures() {
        let gateway = FlakyGateway {
            fail_connects: AtomicU32::new(u32::MAX),
            events: Mutex::new(VecDeque::new()),
            resumable: true,
        };
        let consumer = EventConsumer::new(gateway, fast_config(4), Shutdown::new());

        let (tx, _rx) = mpsc::channel(16);
        let err = consumer.run(tx).await.unwrap_err();
        assert!(matches!(err, Error::ReconnectExhausted(4)));
    }

    #[tokio::test]
    async fn test_stops_when_shutdown_already_triggered() {
        let gateway = FlakyGateway {
            fail_connects: AtomicU32::new(0),
            events: Mutex::new(VecDeque::new()),
            resumable: true,
        };
        let shutdown = Shutdown::new();
        shutdown.trigger();
        let consumer = EventConsumer::new(gateway, fast_config(10), shutdown);

        let (tx, _rx) = mpsc::channel(16);
        let stats = consumer.run(tx).await.unwrap();
        assert_eq!(stats.total_events, 0);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_blocked_stream() {
        let shutdown = Shutdown::new();
        let consumer = EventConsumer::new(QuietGateway, fast_config(10), Arc::clone(&shutdown));

        let (tx, _rx) = mpsc::channel(16);
        let run = tokio::spawn(async move { consumer.run(tx).await });

        // Let the consumer connect and park on the quiet stream
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!run.is_finished());

        let triggered = Instant::now();
        shutdown.trigger();

        let stats = tokio::time::timeout(Duration::from_secs(1), run)
            .await
            .expect("consumer should stop promptly on shutdown")
            .unwrap()
            .unwrap();
        assert!(triggered.elapsed() < Duration::from_secs(1));
        assert_eq!(stats.total_events, 0);
    }
}
