//! Typed payloads.
//!
//! Plain serde structs for the results and event payloads the server is
//! known to produce. Unknown fields are ignored so newer servers stay
//! readable.

pub mod events;
pub mod results;

pub use events::{RebootCompletePayload, TaskFinishPayload};
pub use results::{RegisterServer, Run};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::deserialize_optional_date;
use crate::error::{translate_failure, FatmouseError};

/// Celery bookkeeping for a task or workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Celery {
    /// Celery task id (e.g. `"7e644d6d-28f4-42b7-863a-96f82e756183"`).
    pub task_id: String,
    /// Celery task name (e.g. `"chef.install"`).
    pub name: String,
}

/// Workflow state machine position of a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Fsm {
    /// Human friendly state (e.g. `"sync time from ntp server"`).
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Workflow {
    pub celery: Option<Celery>,
}

/// Task state reported for completed tasks.
pub const TASK_STATE_COMPLETED: &str = "completed";
/// Task state reported for failed tasks.
pub const TASK_STATE_FAILED: &str = "failed";

/// A task executed as part of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Task {
    pub celery: Option<Celery>,
    pub fsm: Option<Fsm>,
    pub state: String,
    pub server_id: Option<String>,
    #[serde(deserialize_with = "deserialize_optional_date")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "deserialize_optional_date")]
    pub end_date: Option<DateTime<Utc>>,
    /// Result value, or the remote error record when the task failed.
    pub result: Value,
}

impl Task {
    pub fn failed(&self) -> bool {
        self.state == TASK_STATE_FAILED
    }

    /// The task's result, or its error when the task failed.
    pub fn outcome(&self) -> Result<&Value, FatmouseError> {
        if self.failed() {
            Err(translate_failure(self.result.clone()))
        } else {
            Ok(&self.result)
        }
    }
}
