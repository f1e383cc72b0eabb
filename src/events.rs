//! Event Consumer.
//!
//! Server events arrive on one shared durable queue (`fatmouse.event`),
//! bound once per client. Each delivery is decoded into an [`Event`] and
//! handed to the subscriber's [`EventHandler`]. Nothing is acknowledged
//! automatically: an event not [`ack`](Event::ack)ed is redelivered to the
//! next consumer of the queue after this one disconnects.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, ChannelRef, Delivery, ExchangeKind, ExchangeParams, Wait};
use crate::envelope::{decode_value, EventEnvelope};
use crate::error::{FatmouseError, Result};
use crate::topology::{self, EVENT_EXCHANGE, EVENT_QUEUE, EVENT_ROUTING_KEY};
use crate::types::{RebootCompletePayload, TaskFinishPayload};

pub const EVENT_REBOOT_COMPLETE: &str = "reboot_complete";
pub const EVENT_TASK_FINISH: &str = "task_finish";

// ============================================================================
// Payloads
// ============================================================================

/// Event payload, typed for known event names.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    RebootComplete(RebootCompletePayload),
    TaskFinish(TaskFinishPayload),
    /// Any event without a typed payload.
    Generic(Value),
}

type PayloadDecoder = fn(Value) -> Result<EventPayload>;

fn decode_reboot_complete(payload: Value) -> Result<EventPayload> {
    decode_value(payload, "reboot_complete payload").map(EventPayload::RebootComplete)
}

fn decode_task_finish(payload: Value) -> Result<EventPayload> {
    decode_value(payload, "task_finish payload").map(EventPayload::TaskFinish)
}

/// Event name to payload decoder. Names not listed decode as
/// [`EventPayload::Generic`].
const PAYLOAD_DECODERS: &[(&str, PayloadDecoder)] = &[
    (EVENT_REBOOT_COMPLETE, decode_reboot_complete),
    (EVENT_TASK_FINISH, decode_task_finish),
];

impl EventPayload {
    pub fn decode(name: &str, payload: Value) -> Result<Self> {
        match PAYLOAD_DECODERS.iter().find(|(known, _)| *known == name) {
            Some((_, decode)) => decode(payload),
            None => Ok(EventPayload::Generic(payload)),
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// A delivered event.
///
/// Holds on to the channel it arrived on so it can be acknowledged after
/// the poll that produced it has returned.
pub struct Event {
    id: String,
    name: String,
    date: Option<DateTime<Utc>>,
    payload: EventPayload,
    redelivered: bool,
    delivery_tag: u64,
    channel: ChannelRef,
}

impl Event {
    /// Decode `delivery`, received on `channel`.
    pub fn from_delivery(delivery: &Delivery, channel: ChannelRef) -> Result<Self> {
        let envelope = EventEnvelope::from_slice(&delivery.body)?;
        let payload = EventPayload::decode(&envelope.name, envelope.payload)?;
        Ok(Self {
            id: envelope.event_id,
            name: envelope.name,
            date: envelope.date,
            payload,
            redelivered: delivery.redelivered,
            delivery_tag: delivery.delivery_tag,
            channel,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.date
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// True if this event was delivered before and never acknowledged.
    pub fn is_redelivered(&self) -> bool {
        self.redelivered
    }

    /// Acknowledge this event so it is never redelivered.
    ///
    /// The shared queue is not affected. Acknowledging the same event twice
    /// is rejected by the broker, which also closes the event channel.
    pub async fn ack(&self) -> Result<()> {
        self.channel.ack(self.delivery_tag).await?;
        debug!(event_id = %self.id, "Event acknowledged");
        Ok(())
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({} id={})", self.name, self.id)
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("date", &self.date)
            .field("payload", &self.payload)
            .field("redelivered", &self.redelivered)
            .field("delivery_tag", &self.delivery_tag)
            .finish()
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Receives events from [`EventConsumer::poll`].
///
/// Errors are logged by the consumer; the event stays unacknowledged unless
/// the handler acked it.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: Event) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> EventHandler for F
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, event: Event) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(event))
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct Subscription {
    channel: ChannelRef,
    handler: Box<dyn EventHandler>,
}

/// The client's subscription to the shared event queue.
pub struct EventConsumer {
    broker: Arc<dyn Broker>,
    subscription: Option<Subscription>,
}

impl EventConsumer {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            subscription: None,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    /// Bind the event queue and start consuming it into `handler`.
    ///
    /// Allowed once per consumer; a second call is a `ProtocolMisuse` and
    /// leaves the existing subscription alone.
    #[tracing::instrument(name = "events.subscribe", skip_all, fields(queue = EVENT_QUEUE))]
    pub async fn subscribe<H>(&mut self, handler: H) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        if self.subscription.is_some() {
            return Err(FatmouseError::misuse("Event consumer has already been started"));
        }

        let broker = self.broker.as_ref();
        topology::ensure_queue(broker, EVENT_QUEUE, &topology::event_queue()).await?;
        topology::ensure_exchange(
            broker,
            EVENT_EXCHANGE,
            ExchangeKind::Direct,
            &ExchangeParams::default(),
        )
        .await?;

        let channel = broker.open_channel().await?;
        let started = async {
            channel
                .bind_queue(EVENT_QUEUE, EVENT_EXCHANGE, EVENT_ROUTING_KEY)
                .await?;
            channel.consume(EVENT_QUEUE, false).await
        }
        .await;
        if let Err(e) = started {
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "Event channel close failed");
            }
            return Err(e.into());
        }

        self.subscription = Some(Subscription {
            channel,
            handler: Box::new(handler),
        });
        info!(exchange = EVENT_EXCHANGE, "Subscribed to events");
        Ok(())
    }

    /// Wait up to `timeout` for events (`None` waits without bound).
    ///
    /// Once the first event arrives, further events already buffered are
    /// handled too, until the buffer is empty or `timeout` has passed since
    /// the call began. Returns `false` when nothing arrived in time; timing
    /// out is not an error.
    ///
    /// A transport failure after at least one event was handled is logged
    /// and the poll still returns `true`; the next poll reports it.
    #[tracing::instrument(name = "events.poll", skip_all)]
    pub async fn poll(&self, timeout: Option<Duration>) -> Result<bool> {
        let subscription = self
            .subscription
            .as_ref()
            .ok_or_else(|| FatmouseError::misuse("Event consumer has not been started yet"))?;
        let deadline = timeout.map(|t| Instant::now() + t);

        let Wait::Delivered(first) = subscription.channel.next_delivery(timeout).await? else {
            return Ok(false);
        };
        subscription.dispatch(first).await;

        let mut handled = 1usize;
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                debug!(deliveries = handled, "Event poll deadline reached");
                break;
            }
            match subscription.channel.next_delivery(Some(Duration::ZERO)).await {
                Ok(Wait::Delivered(delivery)) => {
                    subscription.dispatch(delivery).await;
                    handled += 1;
                }
                Ok(Wait::TimedOut) => break,
                Err(e) => {
                    warn!(deliveries = handled, error = %e, "Event drain failed");
                    break;
                }
            }
        }
        debug!(deliveries = handled, "Event poll finished");
        Ok(true)
    }

    /// Close the event channel. Unacknowledged events return to the queue.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(subscription) = self.subscription.take() {
            subscription.channel.close().await?;
            info!("Event subscription closed");
        }
        Ok(())
    }
}

impl Subscription {
    async fn dispatch(&self, delivery: Delivery) {
        match Event::from_delivery(&delivery, self.channel.clone()) {
            Ok(event) => {
                debug!(event_id = %event.id, name = %event.name, "Event received");
                let label = event.to_string();
                if let Err(e) = self.handler.handle(event).await {
                    error!(event = %label, error = %e, "Event handler failed");
                }
            }
            Err(e) => {
                // Undecodable: drop rather than redeliver it forever.
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Rejecting undecodable event"
                );
                if let Err(e) = self.channel.reject(delivery.delivery_tag, false).await {
                    error!(error = %e, "Failed to reject undecodable event");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::sync::Mutex;

    const REBOOT: &[u8] = br#"{"event_id":"e1","name":"reboot_complete","date":"2024-03-01T12:00:00","payload":{"server_id":"srv-1","boot_id":"b1"}}"#;

    /// Collects received events and acks them when asked to.
    #[derive(Clone, Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
        ack: bool,
    }

    impl EventHandler for Recorder {
        fn handle(&self, event: Event) -> BoxFuture<'static, Result<()>> {
            let events = self.events.clone();
            let ack = self.ack;
            Box::pin(async move {
                events.lock().unwrap().push(event.to_string());
                if ack {
                    event.ack().await?;
                }
                Ok(())
            })
        }
    }

    impl Recorder {
        fn seen(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    async fn consumer(broker: &MemoryBroker) -> EventConsumer {
        EventConsumer::new(Arc::new(broker.connect().await))
    }

    #[test]
    fn test_payload_decode_known_names() {
        let payload = EventPayload::decode(
            EVENT_REBOOT_COMPLETE,
            serde_json::json!({"server_id": "srv-1", "boot_id": "b1"}),
        )
        .unwrap();
        assert_eq!(
            payload,
            EventPayload::RebootComplete(RebootCompletePayload {
                server_id: "srv-1".to_string(),
                boot_id: "b1".to_string(),
            })
        );

        let payload = EventPayload::decode(
            EVENT_TASK_FINISH,
            serde_json::json!({"task": {"state": "completed", "result": 1}}),
        )
        .unwrap();
        assert!(matches!(payload, EventPayload::TaskFinish(p) if !p.task.failed()));
    }

    #[test]
    fn test_payload_decode_unknown_name_is_generic() {
        let raw = serde_json::json!({"anything": [1, 2]});
        let payload = EventPayload::decode("server_created", raw.clone()).unwrap();
        assert_eq!(payload, EventPayload::Generic(raw));
    }

    #[test]
    fn test_payload_decode_bad_shape_is_decode_failure() {
        let err = EventPayload::decode(EVENT_TASK_FINISH, serde_json::json!({"task": 5}))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DecodeFailure);
    }

    #[tokio::test]
    async fn test_poll_before_subscribe_is_misuse() {
        let broker = MemoryBroker::new();
        let consumer = consumer(&broker).await;
        let err = consumer.poll(Some(Duration::ZERO)).await.unwrap_err();
        assert!(err.is_protocol_misuse());
    }

    #[tokio::test]
    async fn test_subscribe_declares_topology() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        consumer.subscribe(Recorder::default()).await.unwrap();

        assert_eq!(broker.queue_params(EVENT_QUEUE).await, Some(topology::event_queue()));
        assert_eq!(
            broker.bindings(EVENT_EXCHANGE, EVENT_QUEUE).await,
            vec![EVENT_ROUTING_KEY]
        );
        assert_eq!(broker.consumer_count(EVENT_QUEUE).await, 1);
    }

    #[tokio::test]
    async fn test_second_subscribe_is_misuse_and_keeps_first() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        let first = Recorder::default();
        consumer.subscribe(first.clone()).await.unwrap();

        let err = consumer.subscribe(Recorder::default()).await.unwrap_err();
        assert!(err.is_protocol_misuse());

        broker
            .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, REBOOT)
            .await
            .unwrap();
        assert!(consumer.poll(Some(Duration::from_secs(1))).await.unwrap());
        assert_eq!(first.seen(), vec!["Event(reboot_complete id=e1)"]);
        assert_eq!(broker.consumer_count(EVENT_QUEUE).await, 1);
    }

    #[tokio::test]
    async fn test_poll_times_out_with_false() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        let recorder = Recorder::default();
        consumer.subscribe(recorder.clone()).await.unwrap();

        let got = consumer.poll(Some(Duration::from_millis(20))).await.unwrap();
        assert!(!got);
        assert!(recorder.seen().is_empty());
    }

    #[tokio::test]
    async fn test_poll_handles_every_buffered_event_once() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        let recorder = Recorder {
            ack: true,
            ..Default::default()
        };
        consumer.subscribe(recorder.clone()).await.unwrap();

        for id in ["a", "b", "c"] {
            let body = format!(r#"{{"event_id":"{}","name":"ping","payload":{{}}}}"#, id);
            broker
                .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, body.as_bytes())
                .await
                .unwrap();
        }

        assert!(consumer.poll(Some(Duration::from_secs(1))).await.unwrap());
        assert_eq!(
            recorder.seen(),
            vec!["Event(ping id=a)", "Event(ping id=b)", "Event(ping id=c)"]
        );
        assert_eq!(broker.unacked_count(EVENT_QUEUE).await, 0);
        assert!(!consumer.poll(Some(Duration::ZERO)).await.unwrap());
    }

    #[tokio::test]
    async fn test_event_accessors() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        let captured: Arc<Mutex<Option<Event>>> = Arc::default();
        let slot = captured.clone();
        consumer
            .subscribe(move |event: Event| {
                let slot = slot.clone();
                async move {
                    *slot.lock().unwrap() = Some(event);
                    Ok::<(), FatmouseError>(())
                }
            })
            .await
            .unwrap();

        broker
            .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, REBOOT)
            .await
            .unwrap();
        consumer.poll(Some(Duration::from_secs(1))).await.unwrap();

        let event = captured.lock().unwrap().take().unwrap();
        assert_eq!(event.id(), "e1");
        assert_eq!(event.name(), "reboot_complete");
        assert!(event.date().is_some());
        assert!(!event.is_redelivered());
        match event.payload() {
            EventPayload::RebootComplete(p) => assert_eq!(p.boot_id, "b1"),
            other => panic!("unexpected payload {:?}", other),
        }
        event.ack().await.unwrap();
        assert_eq!(broker.unacked_count(EVENT_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_undecodable_event_is_rejected_without_handler() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        let recorder = Recorder::default();
        consumer.subscribe(recorder.clone()).await.unwrap();

        broker
            .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, b"{broken")
            .await
            .unwrap();
        assert!(consumer.poll(Some(Duration::from_secs(1))).await.unwrap());

        assert!(recorder.seen().is_empty());
        assert_eq!(broker.unacked_count(EVENT_QUEUE).await, 0);
        assert_eq!(broker.ready_count(EVENT_QUEUE).await, 0);
    }

    #[tokio::test]
    async fn test_handler_error_does_not_abort_poll() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        consumer
            .subscribe(move |_event: Event| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    Err::<(), _>(FatmouseError::InvalidInput("handler refused".to_string()))
                }
            })
            .await
            .unwrap();

        for _ in 0..2 {
            broker
                .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, REBOOT)
                .await
                .unwrap();
        }
        assert!(consumer.poll(Some(Duration::from_secs(1))).await.unwrap());
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(broker.unacked_count(EVENT_QUEUE).await, 2);
    }

    #[tokio::test]
    async fn test_close_returns_unacked_events_to_queue() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        consumer.subscribe(Recorder::default()).await.unwrap();
        broker
            .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, REBOOT)
            .await
            .unwrap();
        consumer.poll(Some(Duration::from_secs(1))).await.unwrap();

        consumer.close().await.unwrap();

        assert!(!consumer.is_subscribed());
        assert_eq!(broker.ready_count(EVENT_QUEUE).await, 1);
        assert!(broker.queue_exists(EVENT_QUEUE).await);
    }

    #[tokio::test]
    async fn test_poll_stops_draining_at_deadline() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = calls.clone();
        let publisher = broker.clone();
        consumer
            .subscribe(move |event: Event| {
                let counter = counter.clone();
                let publisher = publisher.clone();
                async move {
                    event.ack().await?;
                    // Keep the queue busy: every event brings the next one.
                    if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) < 2000 {
                        tokio::time::sleep(Duration::from_millis(1)).await;
                        publisher
                            .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, REBOOT)
                            .await?;
                    }
                    Ok::<(), FatmouseError>(())
                }
            })
            .await
            .unwrap();
        broker
            .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, REBOOT)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        assert!(consumer.poll(Some(Duration::from_millis(10))).await.unwrap());

        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(calls.load(std::sync::atomic::Ordering::SeqCst) < 2000);
    }

    #[tokio::test]
    async fn test_poll_reports_handled_events_despite_drain_failure() {
        let broker = MemoryBroker::new();
        let mut consumer = consumer(&broker).await;
        consumer
            .subscribe(|event: Event| async move {
                event.ack().await?;
                // A second ack kills the channel under the drain loop.
                let _ = event.ack().await;
                Ok::<(), FatmouseError>(())
            })
            .await
            .unwrap();
        broker
            .publish(EVENT_EXCHANGE, EVENT_ROUTING_KEY, REBOOT)
            .await
            .unwrap();

        assert!(consumer.poll(Some(Duration::from_secs(1))).await.unwrap());

        let err = consumer.poll(Some(Duration::ZERO)).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}
