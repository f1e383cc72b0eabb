//! Test utilities.
//!
//! [`FakeWorker`] plays the remote side of the protocol against a
//! [`MemoryBroker`]: it receives task envelopes and publishes replies the
//! way a Celery worker with the AMQP result backend does.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::broker::{
    Broker, ChannelRef, ExchangeKind, ExchangeParams, MemoryBroker, MemoryConnection,
    PublishProperties, QueueParams, Wait,
};
use crate::envelope::{decode_body, TaskEnvelope};
use crate::error::{FatmouseError, Result};
use crate::topology::{
    self, API_EXCHANGE, API_ROUTING_KEY, EVENT_EXCHANGE, EVENT_ROUTING_KEY, RESULTS_EXCHANGE,
};

/// Scripted stand-in for the worker behind an exchange.
pub struct FakeWorker {
    connection: MemoryConnection,
    channel: ChannelRef,
}

impl FakeWorker {
    /// Worker consuming tasks sent to the API exchange.
    pub async fn api(broker: &MemoryBroker) -> Result<Self> {
        Self::listen(broker, API_EXCHANGE, API_ROUTING_KEY).await
    }

    /// Agent consuming synchronous calls for `server_id`.
    pub async fn agent(broker: &MemoryBroker, server_id: &str) -> Result<Self> {
        Self::listen(broker, &topology::server_exchange(server_id), "").await
    }

    async fn listen(broker: &MemoryBroker, exchange: &str, routing_key: &str) -> Result<Self> {
        let connection = broker.connect().await;
        let inbox = format!("worker.{}", exchange);
        topology::ensure_queue(
            &connection,
            &inbox,
            &QueueParams {
                exclusive: false,
                ..Default::default()
            },
        )
        .await?;
        topology::ensure_exchange(
            &connection,
            exchange,
            ExchangeKind::Direct,
            &ExchangeParams::default(),
        )
        .await?;
        topology::ensure_exchange(
            &connection,
            RESULTS_EXCHANGE,
            ExchangeKind::Direct,
            &ExchangeParams::default(),
        )
        .await?;

        let channel = connection.open_channel().await?;
        channel.bind_queue(&inbox, exchange, routing_key).await?;
        channel.consume(&inbox, false).await?;
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Receive and acknowledge the next task, if one arrives within `timeout`.
    pub async fn next_task(&self, timeout: Duration) -> Result<Option<TaskEnvelope>> {
        match self.channel.next_delivery(Some(timeout)).await? {
            Wait::TimedOut => Ok(None),
            Wait::Delivered(delivery) => {
                self.channel.ack(delivery.delivery_tag).await?;
                decode_body(&delivery.body, "task envelope").map(Some)
            }
        }
    }

    /// Post a `SUCCESS` result for an asynchronous task.
    pub async fn reply_success(&self, correlation_id: &str, result: Value) -> Result<()> {
        let body = json!({"status": "SUCCESS", "result": result});
        self.reply_async(correlation_id, body.to_string().as_bytes()).await
    }

    /// Post a `FAILURE` result for an asynchronous task.
    pub async fn reply_failure(
        &self,
        correlation_id: &str,
        exc_type: &str,
        exc_message: &str,
        exc_data: Value,
    ) -> Result<()> {
        let body = json!({
            "status": "FAILURE",
            "result": {
                "exc_type": exc_type,
                "exc_message": exc_message,
                "exc_data": exc_data,
            }
        });
        self.reply_async(correlation_id, body.to_string().as_bytes()).await
    }

    /// Post `body` as the result of an asynchronous task, declaring the
    /// result queue first as the Celery result backend does.
    pub async fn reply_async(&self, correlation_id: &str, body: &[u8]) -> Result<()> {
        topology::ensure_bound_queue(
            &self.connection,
            correlation_id,
            &topology::result_queue(),
            RESULTS_EXCHANGE,
            correlation_id,
        )
        .await?;
        self.publish_result(correlation_id, body).await
    }

    /// Post `body` to the results exchange under `correlation_id` as-is.
    pub async fn publish_result(&self, correlation_id: &str, body: &[u8]) -> Result<()> {
        self.channel
            .publish(
                RESULTS_EXCHANGE,
                correlation_id,
                body,
                &PublishProperties::default(),
            )
            .await?;
        Ok(())
    }

    /// In the background, answer the next task with the raw `result` (the
    /// synchronous call path carries no status envelope). Resolves to the
    /// task that was answered.
    pub fn answer_next(self, result: Value) -> JoinHandle<Result<TaskEnvelope>> {
        tokio::spawn(async move {
            let task = match self.channel.next_delivery(None).await? {
                Wait::Delivered(delivery) => {
                    self.channel.ack(delivery.delivery_tag).await?;
                    decode_body::<TaskEnvelope>(&delivery.body, "task envelope")?
                }
                Wait::TimedOut => {
                    return Err(FatmouseError::misuse("worker wait cannot time out"));
                }
            };
            self.publish_result(&task.id, result.to_string().as_bytes()).await?;
            Ok(task)
        })
    }
}

/// Publish an event envelope to the event exchange, declaring the event
/// exchange if needed.
pub async fn publish_event(broker: &MemoryBroker, event: &Value) -> Result<()> {
    let connection = broker.connect().await;
    topology::ensure_exchange(
        &connection,
        EVENT_EXCHANGE,
        ExchangeKind::Direct,
        &ExchangeParams::default(),
    )
    .await?;
    connection.close().await?;
    broker
        .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, event.to_string().as_bytes())
        .await?;
    Ok(())
}
