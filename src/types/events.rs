//! Event payloads.

use serde::Deserialize;

use super::{Task, Workflow};

/// Payload of `reboot_complete`: the server's OS came back after a reboot.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RebootCompletePayload {
    pub server_id: String,
    /// Operating system boot id.
    pub boot_id: String,
}

/// Payload of `task_finish`: a task finished executing.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TaskFinishPayload {
    pub task: Task,
    #[serde(default)]
    pub workflow: Option<Workflow>,
}
