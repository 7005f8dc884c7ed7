//! Task identifiers, payloads and rows.

use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(raw.trim()).map(Self)
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Serialized arguments of one unit of background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskPayload {
    /// Build a user's baseline from raw image bytes, in submission order.
    EnrollUser {
        user_id: String,
        #[serde(with = "base64_images")]
        images: Vec<Vec<u8>>,
    },
}

impl TaskPayload {
    /// Value of the `name` column.
    pub fn name(&self) -> &'static str {
        match self {
            TaskPayload::EnrollUser { .. } => "enroll_user",
        }
    }
}

mod base64_images {
    use super::BASE64;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(images: &[Vec<u8>], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(images.iter().map(|image| BASE64.encode(image)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Vec<u8>>, D::Error> {
        Vec::<String>::deserialize(d)?
            .iter()
            .map(|s| BASE64.decode(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    /// Gave up: payload undecodable or attempts exhausted.
    Dead,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Done => "done",
            TaskStatus::Dead => "dead",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Dead)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "done" => Ok(TaskStatus::Done),
            "dead" => Ok(TaskStatus::Dead),
            other => Err(format!("unknown task status {other:?}")),
        }
    }
}

/// A task handed to a worker by [`claim_next`](crate::claim_next).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedTask {
    pub id: TaskId,
    pub payload: TaskPayload,
    /// Including the current one.
    pub attempts: u32,
}

/// Externally visible state of a task. The payload is never exposed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub outcome: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_json_shape() {
        let payload = TaskPayload::EnrollUser {
            user_id: "42".into(),
            images: vec![b"\xff\xd8jpeg".to_vec(), Vec::new()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"task": "enroll_user", "user_id": "42", "images": ["/9hqcGVn", ""]})
        );
        assert_eq!(serde_json::from_value::<TaskPayload>(json).unwrap(), payload);
        assert_eq!(payload.name(), "enroll_user");
    }

    #[test]
    fn test_payload_rejects_bad_base64() {
        let raw = r#"{"task": "enroll_user", "user_id": "42", "images": ["***"]}"#;
        assert!(serde_json::from_str::<TaskPayload>(raw).is_err());
    }

    #[test]
    fn test_task_id_parse() {
        let id = TaskId::new();
        assert_eq!(TaskId::parse(&id.to_string()).unwrap(), id);
        assert!(TaskId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_status_round_trips_through_column_text() {
        for status in [TaskStatus::Queued, TaskStatus::Running, TaskStatus::Done, TaskStatus::Dead] {
            assert_eq!(status.as_str().parse::<TaskStatus>().unwrap(), status);
        }
        assert!("paused".parse::<TaskStatus>().is_err());
    }
}
