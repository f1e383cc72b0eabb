//! Proxy for tasks executed by one server's agent.
//!
//! Agent tasks run synchronously through
//! [`TaskDispatcher::dispatch_to_server_and_wait`].

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};

use crate::dispatch::TaskDispatcher;
use crate::error::Result;

/// Calls tasks on the agent of one server.
#[derive(Clone)]
pub struct Agent {
    dispatcher: TaskDispatcher,
    server_id: String,
}

impl Agent {
    pub fn new(dispatcher: TaskDispatcher, server_id: impl Into<String>) -> Self {
        Self {
            dispatcher,
            server_id: server_id.into(),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Run `task` and wait for its result. `None` uses the configured
    /// default timeout.
    pub async fn call<T, K>(&self, task: &str, kwargs: &K, timeout: Option<Duration>) -> Result<T>
    where
        T: DeserializeOwned,
        K: Serialize + ?Sized + Sync,
    {
        self.dispatcher
            .dispatch_to_server_and_wait(&self.server_id, task, kwargs, timeout)
            .await
    }

    /// Operating system tasks.
    pub fn sys(&self) -> Sys<'_> {
        Sys { agent: self }
    }
}

/// Operating system tasks (`sys.*`).
pub struct Sys<'a> {
    agent: &'a Agent,
}

impl Sys<'_> {
    /// Gather the system facts named by `keys`.
    pub async fn get_facts(&self, keys: &[&str]) -> Result<Value> {
        self.agent
            .call("sys.get_facts", &json!({ "keys": keys }), None)
            .await
    }

    pub async fn set_hostname(&self, hostname: &str) -> Result<Value> {
        self.agent
            .call("sys.set_hostname", &json!({ "hostname": hostname }), None)
            .await
    }

    /// Sync the clock, from `ntp_servers` or the agent's defaults when `None`.
    pub async fn sync_time(&self, ntp_servers: Option<&[&str]>) -> Result<Value> {
        self.agent
            .call("sys.sync_time", &json!({ "ntp_servers": ntp_servers }), None)
            .await
    }
}
