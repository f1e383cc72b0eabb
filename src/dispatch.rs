//! Task Dispatcher.
//!
//! Two ways to run a task:
//! - [`TaskDispatcher::dispatch_async`] publishes to the shared API exchange
//!   and hands back a [`ResultFuture`]; the reply queue lives for up to an
//!   hour and is deleted when the future is acknowledged.
//! - [`TaskDispatcher::dispatch_to_server_and_wait`] publishes to one
//!   server's exchange and waits inline on a short-lived reply queue that
//!   expires with the call.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, ExchangeKind, ExchangeParams, PublishProperties, Wait};
use crate::config::ClientConfig;
use crate::envelope::{decode_body, encode_kwargs, TaskEnvelope};
use crate::error::{FatmouseError, Result};
use crate::result::ResultFuture;
use crate::topology::{self, with_channel, API_EXCHANGE, API_ROUTING_KEY, RESULTS_EXCHANGE};

/// A serialized task ready to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTask {
    pub correlation_id: String,
    pub body: Vec<u8>,
}

/// Generate a fresh correlation id.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Build and serialize the envelope for `task`.
///
/// Only side effect is generating the correlation id.
pub fn prepare<K>(task: &str, kwargs: &K) -> Result<PreparedTask>
where
    K: Serialize + ?Sized,
{
    if task.is_empty() {
        return Err(FatmouseError::InvalidInput(
            "task name must not be empty".to_string(),
        ));
    }
    let kwargs = encode_kwargs(kwargs)?;
    let correlation_id = new_correlation_id();
    let body = TaskEnvelope::new(correlation_id.clone(), task, kwargs).to_bytes()?;
    Ok(PreparedTask {
        correlation_id,
        body,
    })
}

/// Publishes tasks over a shared broker connection.
#[derive(Clone)]
pub struct TaskDispatcher {
    broker: Arc<dyn Broker>,
    properties: PublishProperties,
    default_timeout: Option<Duration>,
}

impl TaskDispatcher {
    pub fn new(broker: Arc<dyn Broker>, config: &ClientConfig) -> Self {
        Self {
            broker,
            properties: config.publish.properties(),
            default_timeout: config.call_agent_timeout(),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Future for a task dispatched earlier, possibly by another process.
    pub fn result_future<T: DeserializeOwned>(
        &self,
        correlation_id: &str,
    ) -> Result<ResultFuture<T>> {
        if correlation_id.is_empty() {
            return Err(FatmouseError::InvalidInput(
                "correlation id must not be empty".to_string(),
            ));
        }
        Ok(ResultFuture::new(self.broker.clone(), correlation_id))
    }

    /// Publish `task` to the API exchange and return its result future.
    ///
    /// The returned future does nothing until polled with
    /// [`ResultFuture::get`]; it may be dropped and rebuilt from its
    /// correlation id elsewhere.
    #[tracing::instrument(name = "dispatch.async", skip_all, fields(task = %task, correlation_id))]
    pub async fn dispatch_async<T, K>(&self, task: &str, kwargs: &K) -> Result<ResultFuture<T>>
    where
        T: DeserializeOwned,
        K: Serialize + ?Sized + Sync,
    {
        let prepared = prepare(task, kwargs)?;
        tracing::Span::current().record("correlation_id", prepared.correlation_id.as_str());

        let body = &prepared.body;
        with_channel(self.broker.as_ref(), |channel| async move {
            channel
                .publish(API_EXCHANGE, API_ROUTING_KEY, body, &self.properties)
                .await
        })
        .await?;

        info!(correlation_id = %prepared.correlation_id, "Task dispatched");
        Ok(ResultFuture::new(self.broker.clone(), prepared.correlation_id))
    }

    /// Run `task` on the agent of `server_id` and wait for its raw result.
    ///
    /// `timeout` of `None` uses the configured default; a zero timeout waits
    /// without bound and creates a reply queue without expiry.
    ///
    /// The reply is consumed with automatic acknowledgment at delivery, unlike
    /// [`ResultFuture`] which acknowledges explicitly. The reply queue belongs
    /// to this call alone and expires with it, so there is no second step.
    /// The worker's result is returned as-is, without a status envelope.
    ///
    /// On timeout the remote task may still run; its late reply dies with
    /// the expiring queue.
    #[tracing::instrument(
        name = "dispatch.server_call",
        skip_all,
        fields(task = %task, server_id = %server_id, correlation_id)
    )]
    pub async fn dispatch_to_server_and_wait<T, K>(
        &self,
        server_id: &str,
        task: &str,
        kwargs: &K,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
        K: Serialize + ?Sized + Sync,
    {
        if server_id.is_empty() {
            return Err(FatmouseError::InvalidInput(
                "server id must not be empty".to_string(),
            ));
        }
        let prepared = prepare(task, kwargs)?;
        let id = prepared.correlation_id.as_str();
        tracing::Span::current().record("correlation_id", id);

        let timeout = match timeout {
            Some(t) if t.is_zero() => None,
            Some(t) => Some(t),
            None => self.default_timeout,
        };

        let broker = self.broker.as_ref();
        topology::ensure_queue(broker, id, &topology::call_reply_queue(timeout)).await?;
        topology::ensure_exchange(
            broker,
            RESULTS_EXCHANGE,
            ExchangeKind::Direct,
            &ExchangeParams::default(),
        )
        .await?;

        let exchange = topology::server_exchange(server_id);
        let request = &prepared.body;
        let reply = with_channel(broker, |channel| async move {
            channel.bind_queue(id, RESULTS_EXCHANGE, id).await?;
            channel
                .publish(&exchange, "", request, &self.properties)
                .await?;
            debug!(exchange = %exchange, "Task published, waiting for reply");

            // Auto-ack: deliberately differs from the explicit ack of the
            // async path.
            channel.consume(id, true).await?;
            match channel.next_delivery(timeout).await? {
                Wait::Delivered(delivery) => Ok(delivery.body),
                Wait::TimedOut => {
                    let after = timeout.unwrap_or_default();
                    warn!(timeout_secs = after.as_secs_f64(), "Agent call timed out");
                    Err(FatmouseError::Timeout {
                        context: format!("task '{}' to complete on server '{}'", task, server_id),
                        after,
                    })
                }
            }
        })
        .await?;

        decode_body(&reply, "agent call result")
    }
}
