//! Acceptance tests using cucumber-rs (Gherkin).
//!
//! Every scenario runs against its own in-memory broker. "Processes" are
//! separate broker connections, and the remote server is a scripted worker.

mod steps;

use std::sync::{Arc, Mutex};

use cucumber::World;

use fatmouse_client::broker::{Broker, MemoryBroker};
use fatmouse_client::test_utils::FakeWorker;
use fatmouse_client::{Client, ClientConfig, Event, ResultFuture};

/// Test world containing all scenario state.
#[derive(World)]
#[world(init = Self::new)]
pub struct AcceptanceWorld {
    broker: MemoryBroker,
    client: Client,
    worker: Option<FakeWorker>,
    /// Correlation id of the last dispatched task.
    correlation_id: Option<String>,
    future: Option<ResultFuture>,
    /// Events handed to the subscription handler, oldest first.
    received: Arc<Mutex<Vec<Event>>>,
    /// Id of the last event published by the scenario.
    sent_event_id: Option<String>,
    /// Last event taken from `received`, kept for acknowledgment.
    last_event: Option<Event>,
}

impl std::fmt::Debug for AcceptanceWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptanceWorld")
            .field("correlation_id", &self.correlation_id)
            .field("sent_event_id", &self.sent_event_id)
            .field("last_event", &self.last_event)
            .finish()
    }
}

impl AcceptanceWorld {
    async fn new() -> Self {
        let broker = MemoryBroker::new();
        let client = connect(&broker).await;
        Self {
            broker,
            client,
            worker: None,
            correlation_id: None,
            future: None,
            received: Arc::new(Mutex::new(Vec::new())),
            sent_event_id: None,
            last_event: None,
        }
    }

    /// Drop the current client and connect a fresh one.
    async fn reconnect(&mut self) {
        self.client.close().await.unwrap();
        self.future = None;
        self.client = connect(&self.broker).await;
    }

    fn worker(&self) -> &FakeWorker {
        self.worker.as_ref().expect("no worker is serving")
    }

    fn correlation_id(&self) -> &str {
        self.correlation_id.as_deref().expect("no task was dispatched")
    }
}

async fn connect(broker: &MemoryBroker) -> Client {
    let connection: Arc<dyn Broker> = Arc::new(broker.connect().await);
    Client::with_broker(ClientConfig::default(), connection)
}

#[tokio::main]
async fn main() {
    AcceptanceWorld::cucumber()
        .run_and_exit("tests/acceptance/features")
        .await;
}
