//! Broker transport.
//!
//! This module contains:
//! - `Broker` trait: one logical connection, handing out channels
//! - `BrokerChannel` trait: declare, bind, publish, consume, wait, ack
//! - Declaration parameter types shared by every implementation
//! - Implementations: AMQP (RabbitMQ), in-memory

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod memory;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpChannel};
pub use memory::{MemoryBroker, MemoryChannel, MemoryConnection, PublishedMessage};

// ============================================================================
// Traits
// ============================================================================

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Shared handle to an open channel.
///
/// Events keep a handle to the channel they were delivered on so they can be
/// acknowledged after the poll that produced them has returned.
pub type ChannelRef = Arc<dyn BrokerChannel>;

/// Errors that can occur at the transport level.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The broker reported that a queue or exchange does not exist.
    /// The channel that received this is no longer usable.
    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Channel closed")]
    Closed,
}

impl TransportError {
    /// Returns true if this is the broker's not-found signal.
    pub fn is_not_found(&self) -> bool {
        matches!(self, TransportError::NotFound(_))
    }
}

/// One logical broker connection.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP 0-9-1
/// - `MemoryConnection`: in-process broker model for testing
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a fresh channel on this connection.
    ///
    /// The first call may establish the underlying connection.
    async fn open_channel(&self) -> Result<ChannelRef>;

    /// Close the connection and every channel still open on it.
    async fn close(&self) -> Result<()>;
}

/// A channel multiplexed over a broker connection.
///
/// A channel carries at most one consumer. Deliveries for that consumer are
/// pulled with [`BrokerChannel::next_delivery`], in broker order.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, name: &str, declare: Declare<QueueParams>) -> Result<()>;

    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        declare: Declare<ExchangeParams>,
    ) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: &PublishProperties,
    ) -> Result<()>;

    /// Start consuming `queue` on this channel.
    ///
    /// With `no_ack` the broker considers each message handled as soon as it
    /// is delivered.
    async fn consume(&self, queue: &str, no_ack: bool) -> Result<()>;

    /// Wait for the next delivery on this channel's consumer.
    ///
    /// `None` waits without bound. Expiry is reported as [`Wait::TimedOut`],
    /// never as an error.
    async fn next_delivery(&self, timeout: Option<Duration>) -> Result<Wait<Delivery>>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn delete_queue(&self, name: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

// ============================================================================
// Declarations
// ============================================================================

/// How to declare a queue or exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declare<P> {
    /// Existence check only. Fails with [`TransportError::NotFound`] when the
    /// resource is absent.
    Passive,
    /// Create the resource with these parameters (no-op if it exists).
    Create(P),
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueParams {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Delete the queue after it has been unused for this long (`x-expires`).
    pub expires: Option<Duration>,
}

impl Default for QueueParams {
    fn default() -> Self {
        Self {
            durable: true,
            exclusive: true,
            auto_delete: false,
            expires: None,
        }
    }
}

impl QueueParams {
    /// The `x-expires` argument in milliseconds, if any.
    pub fn expires_ms(&self) -> Option<u64> {
        self.expires.map(|d| d.as_millis() as u64)
    }
}

/// Exchange declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeParams {
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
}

impl Default for ExchangeParams {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            internal: false,
        }
    }
}

/// Exchange routing type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

/// Message properties attached to a publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    /// Ask the broker to return the message if it cannot be routed.
    pub mandatory: bool,
    pub headers: BTreeMap<String, String>,
}

/// A message delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// True if the message was delivered before and not acknowledged.
    pub redelivered: bool,
    pub body: Vec<u8>,
}

/// Outcome of waiting for a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wait<T> {
    Delivered(T),
    TimedOut,
}

impl<T> Wait<T> {
    pub fn is_timed_out(&self) -> bool {
        matches!(self, Wait::TimedOut)
    }
}

/// Wait on `fut` for at most `timeout` (`None` waits without bound).
///
/// The future is polled once before the deadline is checked, so a zero
/// timeout still picks up anything already buffered.
pub(crate) async fn wait_with_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Wait<T>
where
    F: std::future::Future<Output = T>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(value) => Wait::Delivered(value),
            Err(_) => Wait::TimedOut,
        },
        None => Wait::Delivered(fut.await),
    }
}
