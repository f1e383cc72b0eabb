//! Result Future: the client's handle on one asynchronous task result.
//!
//! The reply queue is named after the task's correlation id and bound to the
//! results exchange under the same key. Any process that knows the id can
//! build a future for it, so a result may be collected by a different
//! process than the one that dispatched the task.
//!
//! Exactly one future should consume a given reply queue at a time. Nothing
//! prevents two futures for the same id from racing for the reply.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::broker::{Broker, ChannelRef, Wait};
use crate::envelope::ResultEnvelope;
use crate::error::{FatmouseError, Result};
use crate::topology::{self, RESULTS_EXCHANGE};

enum State<T> {
    /// No consumer yet; the reply queue may not even exist.
    Unconsumed,
    /// Consuming the reply queue, nothing received so far.
    Awaiting(ChannelRef),
    /// Reply received and decoded. Kept until acknowledged.
    Received {
        channel: ChannelRef,
        delivery_tag: u64,
        outcome: Result<T>,
    },
    /// Reply acknowledged and reply queue deleted.
    Acked,
}

impl<T> State<T> {
    fn name(&self) -> &'static str {
        match self {
            State::Unconsumed => "unconsumed",
            State::Awaiting(_) => "awaiting",
            State::Received { .. } => "received",
            State::Acked => "acked",
        }
    }
}

/// Future result of a task dispatched with
/// [`TaskDispatcher::dispatch_async`](crate::dispatch::TaskDispatcher::dispatch_async).
///
/// `T` is the type the success value is decoded into; it defaults to raw
/// JSON.
///
/// Once [`get`](Self::get) has returned an outcome, success or failure, the
/// future must be [`ack`](Self::ack)ed to delete the reply queue. Otherwise
/// the queue lingers until its one hour expiry.
pub struct ResultFuture<T = Value> {
    broker: Arc<dyn Broker>,
    correlation_id: String,
    state: State<T>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> fmt::Debug for ResultFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultFuture")
            .field("correlation_id", &self.correlation_id)
            .field("state", &self.state.name())
            .finish()
    }
}

impl<T: DeserializeOwned> ResultFuture<T> {
    /// Future for the task with `correlation_id`.
    ///
    /// No broker traffic happens until the first [`get`](Self::get).
    pub fn new(broker: Arc<dyn Broker>, correlation_id: impl Into<String>) -> Self {
        Self {
            broker,
            correlation_id: correlation_id.into(),
            state: State::Unconsumed,
            _marker: PhantomData,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// True once a reply has been received (and not yet acknowledged).
    pub fn is_received(&self) -> bool {
        matches!(self.state, State::Received { .. })
    }

    pub fn is_acked(&self) -> bool {
        matches!(self.state, State::Acked)
    }

    /// Wait up to `timeout` for the result (`None` waits without bound).
    ///
    /// The first call declares and binds the reply queue if needed and starts
    /// consuming it. A timeout leaves the consumer in place, so `get` may
    /// simply be called again. Once a reply arrives its decoded outcome is
    /// kept, and later calls return it without touching the broker.
    ///
    /// # Errors
    /// - `Timeout` when nothing arrived in time
    /// - `Remote` when the worker reported a failure
    /// - `Decode` when the reply was not a valid result envelope
    /// - `ProtocolMisuse` after [`ack`](Self::ack)
    #[tracing::instrument(name = "result.get", skip_all, fields(correlation_id = %self.correlation_id))]
    pub async fn get(&mut self, timeout: Option<Duration>) -> Result<&T> {
        if let State::Acked = self.state {
            return Err(FatmouseError::misuse(
                "Result has already been acknowledged, so could not get result",
            ));
        }

        if let State::Unconsumed = self.state {
            let channel = self.start_consumer().await?;
            self.state = State::Awaiting(channel);
        }

        if let State::Awaiting(channel) = &self.state {
            let channel = channel.clone();
            match channel.next_delivery(timeout).await {
                Ok(Wait::TimedOut) => {
                    return Err(FatmouseError::Timeout {
                        context: format!("result of task '{}'", self.correlation_id),
                        after: timeout.unwrap_or_default(),
                    });
                }
                Ok(Wait::Delivered(delivery)) => {
                    let outcome = ResultEnvelope::from_slice(&delivery.body)
                        .and_then(ResultEnvelope::into_outcome);
                    if let Err(e) = &outcome {
                        debug!(error = %e, "Result received with failure outcome");
                    } else {
                        debug!("Result received");
                    }
                    self.state = State::Received {
                        channel,
                        delivery_tag: delivery.delivery_tag,
                        outcome,
                    };
                }
                Err(e) => {
                    // Start over with a fresh consumer on the next call.
                    warn!(error = %e, "Result consumer failed");
                    close_quietly(&channel).await;
                    self.state = State::Unconsumed;
                    return Err(e.into());
                }
            }
        }

        match &self.state {
            State::Received { outcome, .. } => outcome.as_ref().map_err(Clone::clone),
            other => Err(FatmouseError::misuse(format!(
                "result future is {} after receiving",
                other.name()
            ))),
        }
    }

    /// Acknowledge the received result, delete the reply queue and close the
    /// channel.
    ///
    /// Must be called once per future that received a reply, whatever its
    /// outcome. Calling it before a reply arrived, or a second time, is a
    /// `ProtocolMisuse` and leaves the future unchanged.
    #[tracing::instrument(name = "result.ack", skip_all, fields(correlation_id = %self.correlation_id))]
    pub async fn ack(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Acked) {
            State::Received {
                channel,
                delivery_tag,
                ..
            } => {
                let outcome = async {
                    channel.ack(delivery_tag).await?;
                    channel.delete_queue(&self.correlation_id).await
                }
                .await;
                close_quietly(&channel).await;
                outcome?;
                debug!("Result acknowledged, reply queue deleted");
                Ok(())
            }
            State::Acked => Err(FatmouseError::misuse(
                "Result has already been acknowledged",
            )),
            other => {
                self.state = other;
                Err(FatmouseError::misuse(
                    "Result has not yet been received, so could not be acknowledged",
                ))
            }
        }
    }

    async fn start_consumer(&self) -> Result<ChannelRef> {
        let broker = self.broker.as_ref();
        let id = self.correlation_id.as_str();
        topology::ensure_bound_queue(broker, id, &topology::result_queue(), RESULTS_EXCHANGE, id)
            .await?;

        let channel = broker.open_channel().await?;
        if let Err(e) = channel.consume(id, false).await {
            close_quietly(&channel).await;
            return Err(e.into());
        }
        debug!(queue = %id, "Consuming result queue");
        Ok(channel)
    }
}

async fn close_quietly(channel: &ChannelRef) {
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Channel close failed");
    }
}
