//! Results of the server-side tasks the client wraps.

use serde::Deserialize;
use serde_json::Value;

use super::{Task, Workflow};

/// Result of `register_server`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegisterServer {
    /// RabbitMQ username for the server's agent.
    pub username: String,
    /// RabbitMQ password for the server's agent.
    pub password: String,
    /// Agent configuration, injected as `/etc/fatmouse/fatmouse.yaml`.
    pub agent_config: Value,
    /// Celery configuration, injected as `/etc/fatmouse/celery.yaml`.
    pub celery_config: Value,
}

/// Result of a `run` workflow.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Run {
    pub result: Value,
    pub workflow: Option<Workflow>,
    pub completed_tasks: Vec<Task>,
    pub failed_tasks: Vec<Task>,
}

impl Run {
    pub fn succeeded(&self) -> bool {
        self.failed_tasks.is_empty()
    }
}
