//! Fatmouse client.
//!
//! Talks to the Fatmouse server and its per-server agents over RabbitMQ
//! using Celery's wire conventions:
//!
//! - [`Client::dispatch_async`] sends a task to the server and returns a
//!   [`ResultFuture`] that can be waited on, dropped, and rebuilt from its
//!   correlation id in another process.
//! - [`Client::dispatch_to_server_and_wait`] (and the [`Agent`] proxy) runs
//!   a task on one server's agent and blocks until it answers.
//! - [`Client::subscribe`] and [`Client::poll_events`] receive server
//!   events on a durable queue with explicit acknowledgment.
//!
//! Remote failures surface as [`FatmouseError::Remote`] carrying the
//! worker's error record.

pub mod agent;
pub mod broker;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod events;
pub mod result;
pub mod test_utils;
pub mod topology;
pub mod types;
pub mod utils;

pub use agent::{Agent, Sys};
pub use client::Client;
pub use config::ClientConfig;
pub use dispatch::TaskDispatcher;
pub use error::{ErrorKind, FatmouseError, RemoteError, Result};
pub use events::{Event, EventConsumer, EventHandler, EventPayload};
pub use result::ResultFuture;
pub use utils::init_tracing;
