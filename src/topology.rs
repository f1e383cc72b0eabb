//! Queue and exchange topology.
//!
//! Resources are ensured with a passive declaration first. When the broker
//! answers not-found (which also kills the probing channel), a fresh channel
//! declares the resource for real. A resource that already exists is left
//! as it is, whatever flags it was created with.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::broker::{
    Broker, ChannelRef, Declare, ExchangeKind, ExchangeParams, QueueParams, Result,
    TransportError,
};

/// Exchange receiving every task submission.
pub const API_EXCHANGE: &str = "api";
/// Routing key used for task submissions.
pub const API_ROUTING_KEY: &str = "api";
/// Exchange the worker publishes results to, keyed by correlation id.
pub const RESULTS_EXCHANGE: &str = "celeryresults";
/// Exchange, queue and routing key of the shared event stream.
pub const EVENT_EXCHANGE: &str = "fatmouse.event";
pub const EVENT_QUEUE: &str = "fatmouse.event";
pub const EVENT_ROUTING_KEY: &str = "fatmouse.event";
/// Unused asynchronous result queues expire after one hour.
pub const RESULT_QUEUE_TTL: Duration = Duration::from_millis(3_600_000);

/// Smallest expiry RabbitMQ accepts for `x-expires`.
const MIN_QUEUE_EXPIRY: Duration = Duration::from_millis(1);

/// Exchange for synchronous calls to one server's agent.
pub fn server_exchange(server_id: &str) -> String {
    format!("server.{}.celery", server_id)
}

/// Queue holding the reply of one asynchronous task.
pub fn result_queue() -> QueueParams {
    QueueParams {
        durable: true,
        exclusive: false,
        auto_delete: true,
        expires: Some(RESULT_QUEUE_TTL),
    }
}

/// Queue holding the reply of one synchronous agent call.
///
/// The queue expires together with the call; `None` (no deadline) means no
/// expiry. `x-expires` is whole milliseconds and must be positive, so a
/// sub-millisecond deadline is rounded up to 1 ms.
pub fn call_reply_queue(timeout: Option<Duration>) -> QueueParams {
    QueueParams {
        durable: false,
        exclusive: true,
        auto_delete: true,
        expires: timeout
            .filter(|t| !t.is_zero())
            .map(|t| t.max(MIN_QUEUE_EXPIRY)),
    }
}

/// The shared durable event queue.
pub fn event_queue() -> QueueParams {
    QueueParams {
        durable: true,
        exclusive: false,
        auto_delete: false,
        expires: None,
    }
}

/// Make sure queue `name` exists, creating it with `params` if absent.
pub async fn ensure_queue(broker: &dyn Broker, name: &str, params: &QueueParams) -> Result<()> {
    let existed = with_channel(broker, |channel| async move {
        probe(channel.declare_queue(name, Declare::Passive).await)
    })
    .await?;

    if existed {
        debug!(queue = %name, "Queue already exists");
        return Ok(());
    }

    with_channel(broker, |channel| async move {
        channel
            .declare_queue(name, Declare::Create(params.clone()))
            .await
    })
    .await?;

    debug!(
        queue = %name,
        durable = params.durable,
        exclusive = params.exclusive,
        auto_delete = params.auto_delete,
        expires_ms = ?params.expires_ms(),
        "Declared queue"
    );
    Ok(())
}

/// Make sure exchange `name` exists, creating it with `params` if absent.
pub async fn ensure_exchange(
    broker: &dyn Broker,
    name: &str,
    kind: ExchangeKind,
    params: &ExchangeParams,
) -> Result<()> {
    let existed = with_channel(broker, |channel| async move {
        probe(channel.declare_exchange(name, kind, Declare::Passive).await)
    })
    .await?;

    if existed {
        debug!(exchange = %name, "Exchange already exists");
        return Ok(());
    }

    with_channel(broker, |channel| async move {
        channel
            .declare_exchange(name, kind, Declare::Create(params.clone()))
            .await
    })
    .await?;

    debug!(
        exchange = %name,
        kind = kind.as_str(),
        durable = params.durable,
        "Declared exchange"
    );
    Ok(())
}

/// Ensure `queue` and `exchange` exist and bind them with `routing_key`.
pub async fn ensure_bound_queue(
    broker: &dyn Broker,
    queue: &str,
    queue_params: &QueueParams,
    exchange: &str,
    routing_key: &str,
) -> Result<()> {
    ensure_queue(broker, queue, queue_params).await?;
    ensure_exchange(broker, exchange, ExchangeKind::Direct, &ExchangeParams::default()).await?;
    with_channel(broker, |channel| async move {
        channel.bind_queue(queue, exchange, routing_key).await
    })
    .await
}

/// Map a passive declaration outcome to "exists?", passing through every
/// error other than not-found.
fn probe(outcome: Result<()>) -> Result<bool> {
    match outcome {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// Run `op` on a fresh channel and close the channel on every exit path.
///
/// Close failures are logged only; a channel already closed by the broker
/// after a channel error is the common case.
pub(crate) async fn with_channel<F, Fut, T, E>(
    broker: &dyn Broker,
    op: F,
) -> std::result::Result<T, E>
where
    F: FnOnce(ChannelRef) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: From<TransportError>,
{
    let channel = broker.open_channel().await?;
    let outcome = op(channel.clone()).await;
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Channel close after scoped use failed");
    }
    outcome
}
