//! RabbitMQ consumer built on `lapin`.
//!
//! One [`AmqpBroker`] holds the broker connection; every worker opens its own
//! channel through [`AmqpBroker::consumer`] with a prefetch of one, so the broker
//! holds back further messages until the in-flight one is settled.

use crate::queue::{Delivery, DeliveryTag, MessageQueue, QueueError};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, Consumer};
use sensorline_core::config::QueueConfig;
use tracing::{debug, info};

impl From<lapin::Error> for QueueError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
                QueueError::Connection(err.to_string())
            }
            lapin::Error::IOError(_) | lapin::Error::MissingHeartbeatError => QueueError::Connection(err.to_string()),
            other => QueueError::Protocol(other.to_string()),
        }
    }
}

/// Connection to the broker shared by all consumers.
pub struct AmqpBroker {
    connection: Connection,
    queue: String,
}

impl AmqpBroker {
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        let connection = Connection::connect(&config.amqp_uri(), ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Connection(format!("{}:{}: {}", config.host, config.port, e)))?;
        info!(host = %config.host, port = config.port, queue = %config.queue, "Connected to broker");
        Ok(Self {
            connection,
            queue: config.queue.clone(),
        })
    }

    /// Opens a channel and starts consuming with prefetch 1.
    pub async fn consumer(&self, worker: usize) -> Result<AmqpQueue, QueueError> {
        let channel = self.connection.create_channel().await?;
        channel.basic_qos(1, BasicQosOptions::default()).await?;
        channel
            .queue_declare(&self.queue, QueueDeclareOptions::default(), FieldTable::default())
            .await?;
        let consumer = channel
            .basic_consume(
                &self.queue,
                &format!("sensorline-worker-{}", worker),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(worker, queue = %self.queue, "Consumer started");
        Ok(AmqpQueue {
            consumer,
            in_flight: None,
        })
    }

    pub async fn close(&self) -> Result<(), QueueError> {
        self.connection.close(200, "shutdown").await?;
        Ok(())
    }
}

/// One prefetch-1 consumer on its own channel. An unsettled message returns to
/// the queue when the channel closes.
pub struct AmqpQueue {
    consumer: Consumer,
    in_flight: Option<lapin::message::Delivery>,
}

impl AmqpQueue {
    fn take_in_flight(&mut self, tag: DeliveryTag) -> Result<lapin::message::Delivery, QueueError> {
        take_matching(&mut self.in_flight, tag, |delivery| delivery.delivery_tag)
    }
}

/// Takes the slot's value when its tag is `tag`; any other value stays put.
fn take_matching<T>(slot: &mut Option<T>, tag: DeliveryTag, tag_of: impl Fn(&T) -> DeliveryTag) -> Result<T, QueueError> {
    match slot.take() {
        Some(value) if tag_of(&value) == tag => Ok(value),
        other => {
            *slot = other;
            Err(QueueError::Protocol(format!("unknown delivery tag {}", tag)))
        }
    }
}

#[async_trait]
impl MessageQueue for AmqpQueue {
    async fn receive(&mut self) -> Result<Option<Delivery>, QueueError> {
        if let Some(delivery) = &self.in_flight {
            return Err(QueueError::Protocol(format!(
                "delivery {} is still unsettled",
                delivery.delivery_tag
            )));
        }
        match self.consumer.next().await {
            Some(Ok(delivery)) => {
                let out = Delivery {
                    tag: delivery.delivery_tag,
                    body: delivery.data.clone(),
                    redelivered: delivery.redelivered,
                };
                self.in_flight = Some(delivery);
                Ok(Some(out))
            }
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        let delivery = self.take_in_flight(tag)?;
        delivery.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn requeue(&mut self, tag: DeliveryTag) -> Result<(), QueueError> {
        let delivery = self.take_in_flight(tag)?;
        delivery
            .acker
            .nack(BasicNackOptions {
                requeue: true,
                ..BasicNackOptions::default()
            })
            .await?;
        Ok(())
    }
}
