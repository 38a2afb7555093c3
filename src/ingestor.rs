//! Message-driven ingestion of sensor readings.
//!
//! Every delivery walks an explicit state machine:
//!
//! ```text
//! Received ─┬─ Parsed ─┬─ Stored ─────────── Acked
//!           │          ├─ StoreInvalid ───── Acked
//!           │          └─ StoreUnavailable ─ Redelivered
//!           └─ ParseFailed ───────────────── Acked
//! ```
//!
//! Only `StoreUnavailable` leaves the message on the queue. Malformed payloads and
//! rows the store rejects are acknowledged and dropped so they cannot stall the
//! consumer. Redelivered messages are not deduplicated.

use crate::queue::{Delivery, DeliveryTag, MessageQueue, QueueError};
use chrono::{DateTime, Utc};
use sensorline_core::reading::NewReading;
use sensorline_core::storage::{Store, StoreError};
use serde::Deserialize;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Where a single delivery is in its handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Parsed,
    ParseFailed,
    Stored,
    StoreUnavailable,
    StoreInvalid,
    /// Settled as consumed. Terminal.
    Acked,
    /// Returned to the queue. Terminal for this attempt; a later delivery of the
    /// same payload starts again at `Received`.
    Redelivered,
}

/// Events that move a delivery between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageEvent {
    ParseSucceeded,
    ParseFailed,
    InsertSucceeded,
    InsertUnavailable,
    InsertInvalid,
    Settled,
}

/// How a delivery is settled with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
}

impl MessageState {
    /// Applies an event. Events that do not apply to the current state leave it
    /// unchanged.
    pub fn next(self, event: MessageEvent) -> MessageState {
        use MessageEvent as E;
        use MessageState as S;
        match (self, event) {
            (S::Received, E::ParseSucceeded) => S::Parsed,
            (S::Received, E::ParseFailed) => S::ParseFailed,
            (S::Parsed, E::InsertSucceeded) => S::Stored,
            (S::Parsed, E::InsertUnavailable) => S::StoreUnavailable,
            (S::Parsed, E::InsertInvalid) => S::StoreInvalid,
            (S::Stored | S::ParseFailed | S::StoreInvalid, E::Settled) => S::Acked,
            (S::StoreUnavailable, E::Settled) => S::Redelivered,
            (state, _) => state,
        }
    }

    /// The settlement a state calls for, once handling has reached it.
    pub fn settlement(self) -> Option<Settlement> {
        match self {
            MessageState::Stored | MessageState::ParseFailed | MessageState::StoreInvalid => Some(Settlement::Ack),
            MessageState::StoreUnavailable => Some(Settlement::Requeue),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, MessageState::Acked | MessageState::Redelivered)
    }
}

impl From<&StoreError> for MessageEvent {
    fn from(err: &StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => MessageEvent::InsertUnavailable,
            StoreError::Invalid(_) => MessageEvent::InsertInvalid,
        }
    }
}

/// Inbound payload. Unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct InboundMessage {
    pub sensor_type: String,
    pub value: f64,
    #[serde(default)]
    pub sensor_id: Option<i64>,
}

/// The payload could not be turned into a reading.
#[derive(Debug, Error)]
#[error("malformed message: {0}")]
pub struct MessageMalformed(#[from] serde_json::Error);

impl InboundMessage {
    pub fn parse(body: &[u8]) -> Result<Self, MessageMalformed> {
        Ok(serde_json::from_slice(body)?)
    }

    fn into_reading(self, received_at: DateTime<Utc>) -> NewReading {
        NewReading {
            timestamp: Some(received_at),
            sensor_id: self.sensor_id,
            sensor_type: self.sensor_type,
            value: self.value,
        }
    }
}

/// Hands out receipt timestamps that never go backwards within the process,
/// even when the wall clock does.
#[derive(Debug, Default)]
pub struct ReceiptClock {
    last_micros: AtomicI64,
}

impl ReceiptClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let micros = now.timestamp_micros();
        let latest = self.last_micros.fetch_max(micros, Ordering::SeqCst).max(micros);
        DateTime::from_timestamp_micros(latest).unwrap_or(now)
    }
}

/// Per-worker message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub received: u64,
    pub stored: u64,
    pub dropped_malformed: u64,
    pub dropped_invalid: u64,
    pub requeued: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: MessageState) {
        match outcome {
            MessageState::Stored => self.stored += 1,
            MessageState::ParseFailed => self.dropped_malformed += 1,
            MessageState::StoreInvalid => self.dropped_invalid += 1,
            MessageState::StoreUnavailable => self.requeued += 1,
            _ => {}
        }
    }
}

impl AddAssign for WorkerStats {
    fn add_assign(&mut self, other: Self) {
        self.received += other.received;
        self.stored += other.stored;
        self.dropped_malformed += other.dropped_malformed;
        self.dropped_invalid += other.dropped_invalid;
        self.requeued += other.requeued;
    }
}

/// Turns deliveries into stored readings. Cheap to clone; every worker gets its
/// own handle onto the shared store and clock.
#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn Store>,
    clock: Arc<ReceiptClock>,
    requeue_backoff: Duration,
}

impl Ingestor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            clock: Arc::new(ReceiptClock::new()),
            requeue_backoff: Duration::from_secs(1),
        }
    }

    /// Sets the pause a worker takes after returning a message to the queue.
    pub fn with_requeue_backoff(mut self, backoff: Duration) -> Self {
        self.requeue_backoff = backoff;
        self
    }

    /// Parses and stores one delivery, returning the state it must be settled
    /// from. Never fails: every outcome is a state.
    pub async fn process(&self, delivery: &Delivery) -> MessageState {
        let state = MessageState::Received;

        let message = match InboundMessage::parse(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(delivery_tag = delivery.tag, error = %e, "Dropping malformed message");
                return state.next(MessageEvent::ParseFailed);
            }
        };
        let state = state.next(MessageEvent::ParseSucceeded);

        let sensor_type = message.sensor_type.clone();
        let sensor_id = message.sensor_id;
        let reading = message.into_reading(self.clock.now());
        let value = reading.value;

        match self.store.insert(reading).await {
            Ok(row_id) => {
                info!(
                    row_id,
                    sensor_type = %sensor_type,
                    sensor_id = ?sensor_id,
                    value,
                    redelivered = delivery.redelivered,
                    "Recorded data from sensor"
                );
                state.next(MessageEvent::InsertSucceeded)
            }
            Err(e) => {
                match &e {
                    StoreError::Unavailable(_) => {
                        warn!(delivery_tag = delivery.tag, sensor_type = %sensor_type, error = %e, "Store unavailable, requeueing message")
                    }
                    StoreError::Invalid(_) => {
                        warn!(delivery_tag = delivery.tag, sensor_type = %sensor_type, error = %e, "Dropping reading rejected by store")
                    }
                }
                state.next(MessageEvent::from(&e))
            }
        }
    }

    /// Processes one delivery and settles it with the queue. Returns the
    /// terminal state.
    pub async fn handle<Q>(&self, queue: &mut Q, delivery: Delivery, stats: &mut WorkerStats) -> Result<MessageState, QueueError>
    where
        Q: MessageQueue + ?Sized,
    {
        stats.received += 1;
        let outcome = self.process(&delivery).await;
        settle(queue, delivery.tag, outcome).await?;
        stats.record(outcome);
        Ok(outcome.next(MessageEvent::Settled))
    }
}

async fn settle<Q>(queue: &mut Q, tag: DeliveryTag, state: MessageState) -> Result<(), QueueError>
where
    Q: MessageQueue + ?Sized,
{
    match state.settlement() {
        Some(Settlement::Ack) => queue.ack(tag).await,
        Some(Settlement::Requeue) => queue.requeue(tag).await,
        None => Err(QueueError::Protocol(format!(
            "delivery {} cannot be settled from state {:?}",
            tag, state
        ))),
    }
}

/// Runs one worker until the queue ends or shutdown is signalled.
///
/// Shutdown is observed only between messages: a delivery already pulled is
/// processed and settled before the worker returns. A dropped shutdown sender
/// counts as a shutdown signal.
pub async fn run_worker<Q>(
    worker: usize,
    ingestor: Ingestor,
    mut queue: Q,
    mut shutdown: watch::Receiver<bool>,
) -> Result<WorkerStats, QueueError>
where
    Q: MessageQueue,
{
    let mut stats = WorkerStats::default();
    debug!(worker, "Worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            received = queue.receive() => match received? {
                Some(delivery) => delivery,
                None => {
                    debug!(worker, "Queue drained");
                    break;
                }
            },
        };

        let state = ingestor.handle(&mut queue, delivery, &mut stats).await?;

        if state == MessageState::Redelivered && !ingestor.requeue_backoff.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(ingestor.requeue_backoff) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    info!(
        worker,
        received = stats.received,
        stored = stats.stored,
        dropped_malformed = stats.dropped_malformed,
        dropped_invalid = stats.dropped_invalid,
        requeued = stats.requeued,
        "Worker stopped"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let state = MessageState::Received
            .next(MessageEvent::ParseSucceeded)
            .next(MessageEvent::InsertSucceeded);
        assert_eq!(state, MessageState::Stored);
        assert_eq!(state.settlement(), Some(Settlement::Ack));
        assert_eq!(state.next(MessageEvent::Settled), MessageState::Acked);
    }

    #[test]
    fn test_failure_transitions() {
        let parsed = MessageState::Received.next(MessageEvent::ParseSucceeded);

        let unavailable = parsed.next(MessageEvent::InsertUnavailable);
        assert_eq!(unavailable.settlement(), Some(Settlement::Requeue));
        assert_eq!(unavailable.next(MessageEvent::Settled), MessageState::Redelivered);

        let invalid = parsed.next(MessageEvent::InsertInvalid);
        assert_eq!(invalid.settlement(), Some(Settlement::Ack));
        assert_eq!(invalid.next(MessageEvent::Settled), MessageState::Acked);

        let malformed = MessageState::Received.next(MessageEvent::ParseFailed);
        assert_eq!(malformed.settlement(), Some(Settlement::Ack));
        assert_eq!(malformed.next(MessageEvent::Settled), MessageState::Acked);
    }

    #[test]
    fn test_inapplicable_events_are_ignored() {
        assert_eq!(MessageState::Received.next(MessageEvent::Settled), MessageState::Received);
        assert_eq!(MessageState::Received.next(MessageEvent::InsertSucceeded), MessageState::Received);
        assert_eq!(MessageState::Acked.next(MessageEvent::ParseSucceeded), MessageState::Acked);
        assert_eq!(MessageState::Received.settlement(), None);
        assert_eq!(MessageState::Parsed.settlement(), None);
        assert!(MessageState::Acked.is_terminal());
        assert!(MessageState::Redelivered.is_terminal());
        assert!(!MessageState::Stored.is_terminal());
    }

    #[test]
    fn test_store_errors_map_to_events() {
        assert_eq!(
            MessageEvent::from(&StoreError::Unavailable("down".into())),
            MessageEvent::InsertUnavailable
        );
        assert_eq!(
            MessageEvent::from(&StoreError::Invalid("bad".into())),
            MessageEvent::InsertInvalid
        );
    }

    #[test]
    fn test_parse_message() {
        let message = InboundMessage::parse(br#"{"sensor_type":"gas","value":12,"sensor_id":3,"extra":true}"#).unwrap();
        assert_eq!(message.sensor_type, "gas");
        assert_eq!(message.value, 12.0);
        assert_eq!(message.sensor_id, Some(3));

        let without_id = InboundMessage::parse(br#"{"sensor_type":"smoke","value":4.5}"#).unwrap();
        assert_eq!(without_id.sensor_id, None);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(InboundMessage::parse(br#"{"sensor_type":"gas"}"#).is_err());
        assert!(InboundMessage::parse(br#"{"value":1.0}"#).is_err());
        assert!(InboundMessage::parse(br#"{"sensor_type":"gas","value":"hot"}"#).is_err());
        assert!(InboundMessage::parse(b"not json").is_err());
        assert!(InboundMessage::parse(b"").is_err());
    }

    #[test]
    fn test_receipt_clock_never_goes_back() {
        let clock = ReceiptClock::new();
        let ahead = (Utc::now() + chrono::Duration::hours(1)).timestamp_micros();
        clock.last_micros.store(ahead, Ordering::SeqCst);

        let first = clock.now();
        let second = clock.now();
        assert_eq!(first.timestamp_micros(), ahead);
        assert!(second >= first);
    }

    #[test]
    fn test_stats_add() {
        let mut total = WorkerStats::default();
        total += WorkerStats {
            received: 3,
            stored: 1,
            dropped_malformed: 1,
            dropped_invalid: 0,
            requeued: 1,
        };
        total += WorkerStats {
            received: 2,
            stored: 2,
            ..Default::default()
        };
        assert_eq!(total.received, 5);
        assert_eq!(total.stored, 3);
        assert_eq!(total.requeued, 1);
    }
}
