//! Task record: the unit of deferred work

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use super::registry::HandlerError;
use crate::error::{CoreError, CoreResult};

/// Default number of retries after the first failed attempt
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Metadata key holding the message of the last failed attempt while a task
/// waits for its retry
pub const LAST_ERROR_KEY: &str = "last_error";

/// Task priority; lower numeric value is served first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Numeric rank used for ordering and the shared priority index
    pub fn value(self) -> u8 {
        match self {
            Self::High => 0,
            Self::Normal => 5,
            Self::Low => 10,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Normal => write!(f, "normal"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" | "0" => Ok(Self::High),
            "normal" | "5" => Ok(Self::Normal),
            "low" | "10" => Ok(Self::Low),
            _ => Err(format!("Unknown priority: {}", s)),
        }
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Completed, failed and cancelled tasks never change again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Status name as stored
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Task arguments: string keys to JSON values, kept in key order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskArgs(BTreeMap<String, Value>);

impl TaskArgs {
    /// Empty argument map
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Insert an argument, replacing any previous value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw value of an argument
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String argument, if present and a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Integer argument, if present and an integer
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(Value::as_i64)
    }

    /// Boolean argument, if present and a boolean
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    /// Required string argument
    pub fn require_str(&self, key: &str) -> Result<&str, HandlerError> {
        match self.0.get(key) {
            Some(Value::String(s)) => Ok(s),
            Some(other) => Err(HandlerError::InvalidArgs(format!(
                "argument '{}' must be a string, got {}",
                key, other
            ))),
            None => Err(HandlerError::InvalidArgs(format!("missing argument '{}'", key))),
        }
    }

    /// Required integer argument
    pub fn require_i64(&self, key: &str) -> Result<i64, HandlerError> {
        match self.0.get(key) {
            Some(value) => value.as_i64().ok_or_else(|| {
                HandlerError::InvalidArgs(format!("argument '{}' must be an integer, got {}", key, value))
            }),
            None => Err(HandlerError::InvalidArgs(format!("missing argument '{}'", key))),
        }
    }

    /// Deserialize the whole map into a typed payload
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, HandlerError> {
        let value = serde_json::to_value(&self.0)
            .map_err(|e| HandlerError::InvalidArgs(e.to_string()))?;
        serde_json::from_value(value).map_err(|e| HandlerError::InvalidArgs(e.to_string()))
    }

    /// Iterate arguments in key order
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no arguments
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn validate(&self) -> CoreResult<()> {
        if self.0.keys().any(|k| k.is_empty()) {
            return Err(CoreError::Validation("task argument names must not be empty".to_string()));
        }
        Ok(())
    }
}

impl From<BTreeMap<String, Value>> for TaskArgs {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for TaskArgs {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// A unit of deferred work
///
/// The task store owns the authoritative copy; a task handed out by `dequeue`
/// is a working copy the worker writes back through `update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id assigned at creation
    pub id: String,

    /// Handler name
    pub name: String,

    /// Handler arguments
    #[serde(default)]
    pub args: TaskArgs,

    /// Scheduling priority
    #[serde(default)]
    pub priority: Priority,

    /// Lifecycle state
    #[serde(default)]
    pub status: TaskStatus,

    /// Handler output, only set once completed. A handler may return `null`,
    /// which is kept as `Some(Value::Null)` and told apart from "no result yet"
    /// by omitting the field for `None`.
    #[serde(default, deserialize_with = "present_value", skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Failure description, only set once failed
    #[serde(default)]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Retries performed so far, never above `max_retries`
    #[serde(default)]
    pub retry_count: u32,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Optional owner used for grouping and listing
    #[serde(default)]
    pub owner_id: Option<String>,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,

    /// A pending task is not handed out before this time (retry backoff)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// A field that is present always deserializes to `Some`, even when it is `null`
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Task {
    /// Create a pending task with a fresh id
    pub fn new(name: impl Into<String>, args: TaskArgs) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            args,
            priority: Priority::default(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            owner_id: None,
            metadata: BTreeMap::new(),
            not_before: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether the task may be handed to a worker at `now`
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before.map_or(true, |at| at <= now)
    }

    /// Whether another attempt is allowed after a failure
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Check the record is well formed before it enters a store
    pub fn validate(&self) -> CoreResult<()> {
        if self.id.is_empty() {
            return Err(CoreError::Validation("task id must not be empty".to_string()));
        }
        if self.name.trim().is_empty() {
            return Err(CoreError::Validation("task name must not be empty".to_string()));
        }
        if self.retry_count > self.max_retries {
            return Err(CoreError::Validation(format!(
                "retry_count {} exceeds max_retries {}",
                self.retry_count, self.max_retries
            )));
        }
        self.args.validate()
    }

    /// Serialize into a JSON object
    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a task from a JSON object
    pub fn from_value(value: Value) -> CoreResult<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize into a JSON string
    pub fn to_json(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Rebuild a task from a JSON string
    pub fn from_json(raw: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_ordering_serves_high_first() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::High.value(), 0);
        assert_eq!(Priority::Normal.value(), 5);
        assert_eq!(Priority::Low.value(), 10);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("10".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_status_terminal() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert_eq!("retrying".parse::<TaskStatus>().unwrap(), TaskStatus::Retrying);
    }

    #[test]
    fn test_value_roundtrip_preserves_task() {
        let mut task = Task::new(
            "generate",
            TaskArgs::new()
                .with("prompt", "hello")
                .with("tags", json!(["a", "b"]))
                .with("options", json!({})),
        )
        .with_priority(Priority::High)
        .with_owner("user-1")
        .with_metadata("source", "api");
        task.status = TaskStatus::Completed;
        task.result = Some(json!({"text": "done", "tokens": 12}));
        task.started_at = Some(Utc::now());
        task.completed_at = Some(Utc::now());

        let restored = Task::from_value(task.to_value().unwrap()).unwrap();
        assert_eq!(restored, task);
    }

    #[test]
    fn test_value_roundtrip_edge_cases() {
        let mut task = Task::new("audit", TaskArgs::new()).with_max_retries(3);
        task.retry_count = 3;
        task.status = TaskStatus::Failed;
        task.error = Some("boom".to_string());

        let value = task.to_value().unwrap();
        assert_eq!(value["result"], Value::Null);
        assert_eq!(value["args"], json!({}));

        let restored = Task::from_value(value).unwrap();
        assert_eq!(restored, task);
        assert!(restored.result.is_none());
        assert!(restored.args.is_empty());

        let restored = Task::from_json(&task.to_json().unwrap()).unwrap();
        assert_eq!(restored, task);

        // A handler that returned null keeps its result
        let mut task = Task::new("noop", TaskArgs::new());
        task.status = TaskStatus::Completed;
        task.result = Some(Value::Null);

        let value = task.to_value().unwrap();
        assert!(value.as_object().unwrap().contains_key("result"));
        let restored = Task::from_value(value).unwrap();
        assert_eq!(restored.result, Some(Value::Null));
        assert_eq!(restored, task);

        let restored = Task::from_json(&task.to_json().unwrap()).unwrap();
        assert_eq!(restored, task);

        // An explicit null is a result too
        let mut value = Task::new("noop", TaskArgs::new()).to_value().unwrap();
        assert!(!value.as_object().unwrap().contains_key("result"));
        value["result"] = Value::Null;
        assert_eq!(Task::from_value(value).unwrap().result, Some(Value::Null));
    }

    #[test]
    fn test_validate() {
        let task = Task::new("ok", TaskArgs::new());
        assert!(task.validate().is_ok());

        let task = Task::new("  ", TaskArgs::new());
        assert!(matches!(task.validate(), Err(CoreError::Validation(_))));

        let mut task = Task::new("retry", TaskArgs::new()).with_max_retries(1);
        task.retry_count = 2;
        assert!(matches!(task.validate(), Err(CoreError::Validation(_))));

        let task = Task::new("args", TaskArgs::new().with("", 1));
        assert!(matches!(task.validate(), Err(CoreError::Validation(_))));
    }

    #[test]
    fn test_is_ready_respects_not_before() {
        let now = Utc::now();
        let mut task = Task::new("later", TaskArgs::new());
        assert!(task.is_ready(now));

        task.not_before = Some(now + chrono::Duration::seconds(5));
        assert!(!task.is_ready(now));
        assert!(task.is_ready(now + chrono::Duration::seconds(5)));

        task.status = TaskStatus::Running;
        assert!(!task.is_ready(now + chrono::Duration::seconds(10)));
    }

    #[test]
    fn test_args_accessors() {
        let args = TaskArgs::new().with("url", "https://example.com").with("depth", 2).with("js", true);

        assert_eq!(args.get_str("url"), Some("https://example.com"));
        assert_eq!(args.get_i64("depth"), Some(2));
        assert_eq!(args.get_bool("js"), Some(true));
        assert_eq!(args.require_str("url").unwrap(), "https://example.com");
        assert!(matches!(args.require_str("depth"), Err(HandlerError::InvalidArgs(_))));
        assert!(matches!(args.require_i64("missing"), Err(HandlerError::InvalidArgs(_))));
        assert_eq!(args.len(), 3);
    }
}
