//! Task envelope and payload types

use chrono::Utc;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};

/// Traceability key stamped on every envelope at creation
pub type TaskKey = Uuid;

/// Named arguments handed to a task's handlers
pub type TaskData = Map<String, Value>;

/// The JSON object that travels through the task list:
/// `{"key": "<uuid>", "type": "<string>", "data": {...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    /// Fresh for every envelope; never used for lookup or deduplication
    pub key: TaskKey,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub data: TaskData,
}

impl TaskEnvelope {
    pub fn new<S: Into<String>>(task_type: S, data: TaskData) -> Self {
        Self {
            key: TaskKey::new_v4(),
            task_type: task_type.into(),
            data,
        }
    }

    /// Envelope carrying no arguments
    pub fn bare<S: Into<String>>(task_type: S) -> Self {
        Self::new(task_type, TaskData::new())
    }

    pub fn has_data(&self) -> bool {
        !self.data.is_empty()
    }

    pub fn to_json(&self) -> TaskResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(raw: &str) -> TaskResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<TaskData, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<TaskData>::deserialize(deserializer)?.unwrap_or_default())
}

/// Turn any serializable struct or map into task arguments.
///
/// `null`/unit serialize to no arguments; anything that is not a JSON
/// object is rejected since handlers receive named arguments only.
pub fn to_task_data<T: Serialize + ?Sized>(value: &T) -> TaskResult<TaskData> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(TaskData::new()),
        other => Err(TaskError::queue_operation(
            "encode task data".to_string(),
            format!("expected a JSON object, got {}", other),
        )),
    }
}

/// Current wall-clock time as fractional unix seconds
pub fn now_unix() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}
