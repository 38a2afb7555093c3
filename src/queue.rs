//! Queue seam between the ingestor and a message broker.
//!
//! A [`MessageQueue`] is one consumer with prefetch 1: it hands out a single
//! [`Delivery`] and expects it to be settled (acked or requeued) before the next
//! `receive`. Workers each own one consumer, so the broker never has more than one
//! unsettled message per worker.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::Notify;

/// Broker-assigned delivery identifier, unique per consumer.
pub type DeliveryTag = u64;

/// One message pulled from the queue and not yet settled.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub body: Vec<u8>,
    /// Set when the broker has handed this message out before.
    pub redelivered: bool,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection failed: {0}")]
    Connection(String),
    #[error("queue protocol error: {0}")]
    Protocol(String),
    #[error("queue closed")]
    Closed,
}

/// A single prefetch-1 consumer.
#[async_trait]
pub trait MessageQueue: Send {
    /// Waits for the next message. `Ok(None)` means the queue has been closed and
    /// drained.
    async fn receive(&mut self) -> Result<Option<Delivery>, QueueError>;

    /// Settles a delivery as consumed.
    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError>;

    /// Returns a delivery to the queue so it is redelivered later.
    async fn requeue(&mut self, tag: DeliveryTag) -> Result<(), QueueError>;
}

#[derive(Debug, Clone)]
struct Pending {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    ready: VecDeque<Pending>,
    unacked: HashMap<DeliveryTag, Pending>,
    next_tag: DeliveryTag,
    acked: u64,
    closed: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: Mutex<MemoryState>,
    notify: Notify,
}

/// In-process queue with broker-like redelivery.
///
/// Requeued messages go back to the front of the queue flagged as redelivered.
/// Once [`MemoryQueue::close`] is called, consumers drain what is left and then
/// see the end of the queue.
#[derive(Debug, Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<MemoryInner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn publish(&self, body: impl Into<Vec<u8>>) -> Result<(), QueueError> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(QueueError::Closed);
            }
            state.ready.push_back(Pending {
                body: body.into(),
                redelivered: false,
            });
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Stops accepting new messages.
    pub fn close(&self) {
        self.state().closed = true;
        self.inner.notify.notify_waiters();
    }

    /// A new prefetch-1 consumer on this queue.
    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            queue: self.clone(),
            in_flight: None,
        }
    }

    /// Messages waiting to be delivered.
    pub fn ready(&self) -> usize {
        self.state().ready.len()
    }

    /// Messages delivered but not yet settled.
    pub fn unacked(&self) -> usize {
        self.state().unacked.len()
    }

    /// Messages settled as consumed.
    pub fn acked(&self) -> u64 {
        self.state().acked
    }
}

/// Consumer handle returned by [`MemoryQueue::consumer`].
#[derive(Debug)]
pub struct MemoryConsumer {
    queue: MemoryQueue,
    in_flight: Option<DeliveryTag>,
}

impl MemoryConsumer {
    fn settle(&mut self, tag: DeliveryTag) -> Result<Pending, QueueError> {
        if self.in_flight != Some(tag) {
            return Err(QueueError::Protocol(format!("unknown delivery tag {}", tag)));
        }
        let pending = self
            .queue
            .state()
            .unacked
            .remove(&tag)
            .ok_or_else(|| QueueError::Protocol(format!("delivery {} already settled", tag)))?;
        self.in_flight = None;
        Ok(pending)
    }
}

#[async_trait]
impl MessageQueue for MemoryConsumer {
    async fn receive(&mut self) -> Result<Option<Delivery>, QueueError> {
        if let Some(tag) = self.in_flight {
            return Err(QueueError::Protocol(format!("delivery {} is still unsettled", tag)));
        }
        loop {
            let notified = self.queue.inner.notify.notified();
            {
                let mut state = self.queue.state();
                if let Some(pending) = state.ready.pop_front() {
                    state.next_tag += 1;
                    let tag = state.next_tag;
                    let delivery = Delivery {
                        tag,
                        body: pending.body.clone(),
                        redelivered: pending.redelivered,
                    };
                    state.unacked.insert(tag, pending);
                    self.in_flight = Some(tag);
                    return Ok(Some(delivery));
                }
                // Another consumer may still requeue what it holds.
                if state.closed && state.unacked.is_empty() {
                    return Ok(None);
                }
            }
            notified.await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        self.settle(tag)?;
        self.queue.state().acked += 1;
        self.queue.inner.notify.notify_waiters();
        Ok(())
    }

    async fn requeue(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        let mut pending = self.settle(tag)?;
        pending.redelivered = true;
        self.queue.state().ready.push_front(pending);
        self.queue.inner.notify.notify_waiters();
        Ok(())
    }
}

impl Drop for MemoryConsumer {
    // A consumer that goes away with an unsettled message returns it to the queue,
    // as a broker does when a channel closes.
    fn drop(&mut self) {
        if let Some(tag) = self.in_flight.take() {
            let mut state = self.queue.state();
            if let Some(mut pending) = state.unacked.remove(&tag) {
                pending.redelivered = true;
                state.ready.push_front(pending);
            }
            drop(state);
            self.queue.inner.notify.notify_waiters();
        }
    }
}
