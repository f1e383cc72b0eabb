//! Fatmouse client facade.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::agent::Agent;
use crate::broker::Broker;
use crate::config::ClientConfig;
use crate::dispatch::TaskDispatcher;
use crate::error::{FatmouseError, Result};
use crate::events::{EventConsumer, EventHandler};
use crate::result::ResultFuture;
use crate::types::{RegisterServer, Run};

/// Client for the Fatmouse server and its agents.
///
/// One client owns one broker connection, opened on first use. Each call
/// takes its own short-lived channel; the event subscription keeps one
/// long-lived channel. A client is meant for use by one task at a time.
///
/// ```no_run
/// # async fn example() -> fatmouse_client::Result<()> {
/// use fatmouse_client::{Client, ClientConfig};
/// use std::time::Duration;
///
/// let mut client = Client::connect(ClientConfig::new("amqp://user:pw@rabbit:5672/%2f"))?;
/// let mut future = client.register_server("srv-1", "env-1").await?;
/// let creds = future.get(Some(Duration::from_secs(30))).await?;
/// println!("agent user: {}", creds.username);
/// future.ack().await?;
/// client.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    broker: Arc<dyn Broker>,
    dispatcher: TaskDispatcher,
    events: EventConsumer,
}

impl Client {
    /// Client for the RabbitMQ broker at `config.broker_url`.
    ///
    /// No connection is made until the first operation needs one.
    #[cfg(feature = "amqp")]
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let broker = crate::broker::AmqpBroker::new(config.broker_url.clone())?;
        Ok(Self::with_broker(config, Arc::new(broker)))
    }

    /// Client over an existing broker connection.
    pub fn with_broker(config: ClientConfig, broker: Arc<dyn Broker>) -> Self {
        let dispatcher = TaskDispatcher::new(broker.clone(), &config);
        let events = EventConsumer::new(broker.clone());
        Self {
            config,
            broker,
            dispatcher,
            events,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// Dispatch `task` to the server; see [`TaskDispatcher::dispatch_async`].
    pub async fn dispatch_async<T, K>(&self, task: &str, kwargs: &K) -> Result<ResultFuture<T>>
    where
        T: DeserializeOwned,
        K: Serialize + ?Sized + Sync,
    {
        self.dispatcher.dispatch_async(task, kwargs).await
    }

    /// Rebuild the future of a task dispatched earlier, possibly elsewhere.
    pub fn result_future<T: DeserializeOwned>(&self, correlation_id: &str) -> Result<ResultFuture<T>> {
        self.dispatcher.result_future(correlation_id)
    }

    /// Run `task` on a server's agent and wait for the result; see
    /// [`TaskDispatcher::dispatch_to_server_and_wait`].
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
        self.dispatcher
            .dispatch_to_server_and_wait(server_id, task, kwargs, timeout)
            .await
    }

    /// Proxy to the agent of `server_id`.
    pub fn agent(&self, server_id: impl Into<String>) -> Agent {
        Agent::new(self.dispatcher.clone(), server_id)
    }

    /// Register a new server; the result carries its broker credentials and
    /// agent configuration.
    pub async fn register_server(
        &self,
        server_id: &str,
        env_id: &str,
    ) -> Result<ResultFuture<RegisterServer>> {
        self.dispatch_async(
            "register_server",
            &json!({"server_id": server_id, "env_id": env_id}),
        )
        .await
    }

    pub async fn deregister_server(&self, server_id: &str) -> Result<ResultFuture<Value>> {
        self.dispatch_async("deregister_server", &json!({"server_id": server_id}))
            .await
    }

    /// Start the `init` workflow for a freshly booted server.
    pub async fn run_init_workflow(&self, server_id: &str) -> Result<ResultFuture<Run>> {
        self.dispatch_async(
            "run",
            &json!({"name": "init", "parameters": {"server_id": server_id}}),
        )
        .await
    }

    /// Start the `orchestration` workflow triggered by `event_id`.
    pub async fn run_orchestration_workflow(&self, event_id: &str) -> Result<ResultFuture<Run>> {
        self.dispatch_async(
            "run",
            &json!({"name": "orchestration", "parameters": {"event_id": event_id}}),
        )
        .await
    }

    /// Start receiving events; see [`EventConsumer::subscribe`].
    pub async fn subscribe<H>(&mut self, handler: H) -> Result<()>
    where
        H: EventHandler + 'static,
    {
        self.events.subscribe(handler).await
    }

    /// Wait for events; see [`EventConsumer::poll`].
    pub async fn poll_events(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.events.poll(timeout).await
    }

    /// Close the event subscription, then the connection.
    ///
    /// The connection is closed even when the event channel fails to close;
    /// the first error is returned.
    pub async fn close(&mut self) -> Result<()> {
        let events = self.events.close().await;
        if let Err(e) = &events {
            warn!(error = %e, "Event subscription close failed");
        }
        let connection = self.broker.close().await.map_err(FatmouseError::from);
        info!("Client closed");
        events.and(connection)
    }
}
