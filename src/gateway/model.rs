//! Wire types shared by the poll and stream paths.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::EventKind;
use crate::task::{Phase, TaskId, TaskState};

/// What `GET /status/{taskId}` returns and what stream events carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusView {
    pub task_id: TaskId,
    pub task: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<serde_json::Value>,
    pub percent: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub retries: u32,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl From<&TaskState> for StatusView {
    fn from(state: &TaskState) -> Self {
        Self {
            task_id: state.task_id,
            task: state.task_name.clone(),
            phase: state.phase,
            progress: state.progress.clone(),
            percent: state.percent,
            result: state.result.clone(),
            error: state.error.clone(),
            attempts: state.attempts,
            retries: state.retries,
            version: state.version,
            updated_at: state.updated_at,
        }
    }
}

/// Payload of a keep-alive event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingView {
    pub task_id: TaskId,
    pub timestamp: DateTime<Utc>,
}

/// One event on a task's live stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    PhaseChanged(StatusView),
    Ping(PingView),
    Terminal(StatusView),
}

impl StreamEvent {
    /// `Terminal` for finished tasks, `PhaseChanged` otherwise.
    pub fn from_state(state: &TaskState) -> Self {
        let view = StatusView::from(state);
        if state.is_terminal() {
            Self::Terminal(view)
        } else {
            Self::PhaseChanged(view)
        }
    }

    pub fn ping(task_id: TaskId) -> Self {
        Self::Ping(PingView {
            task_id,
            timestamp: Utc::now(),
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::PhaseChanged(_) => EventKind::PhaseChanged,
            Self::Ping(_) => EventKind::Ping,
            Self::Terminal(_) => EventKind::Terminal,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal(_))
    }

    /// Status carried by the event; pings carry none.
    pub fn status(&self) -> Option<&StatusView> {
        match self {
            Self::PhaseChanged(view) | Self::Terminal(view) => Some(view),
            Self::Ping(_) => None,
        }
    }

    /// JSON for the SSE `data` field.
    pub fn data(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::PhaseChanged(view) | Self::Terminal(view) => serde_json::to_string(view),
            Self::Ping(ping) => serde_json::to_string(ping),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::task::{RetryPolicy, TaskInvocation};

    #[test]
    fn status_view_uses_camel_case_and_omits_empty_fields() {
        let inv = TaskInvocation::new("send_email", json!({}), RetryPolicy::default());
        let mut state = TaskState::pending(&inv);
        let value = serde_json::to_value(StatusView::from(&state)).unwrap();
        assert_eq!(value["taskId"], json!(inv.task_id.to_string()));
        assert_eq!(value["phase"], json!("PENDING"));
        assert_eq!(value["percent"], json!(0));
        assert!(value.get("result").is_none());
        assert!(value.get("updatedAt").is_some());

        state.start().unwrap();
        state.succeed(json!("Email sent to a@b.io")).unwrap();
        let event = StreamEvent::from_state(&state);
        assert!(event.is_terminal());
        assert_eq!(event.kind().as_str(), "terminal");
        let data: serde_json::Value = serde_json::from_str(&event.data().unwrap()).unwrap();
        assert_eq!(data["result"], json!("Email sent to a@b.io"));
        assert_eq!(data["percent"], json!(100));
    }

    #[test]
    fn ping_payload() {
        let id = TaskId::new();
        let event = StreamEvent::ping(id);
        assert_eq!(event.kind(), EventKind::Ping);
        assert!(event.status().is_none());
        let data: serde_json::Value = serde_json::from_str(&event.data().unwrap()).unwrap();
        assert_eq!(data["taskId"], json!(id.to_string()));
        assert!(data["timestamp"].is_string());
    }
}
