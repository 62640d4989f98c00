use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskStatus;

/// 结果消息
///
/// 每个任务尝试恰好产生一条结果消息，与TaskMessage按task_id一一对应。
/// 被重试任务的中间结果只作历史记录，消费方应以终态尝试的结果为准。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMessage {
    pub task_id: String,
    pub worker_id: String,
    pub status: TaskStatus,
    pub status_code: Option<u16>,
    pub content: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub cookies: HashMap<String, String>,
    pub response_time: Option<f64>,
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl ResultMessage {
    pub fn success(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        status_code: u16,
        content: String,
        response_time: f64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            status: TaskStatus::Success,
            status_code: Some(status_code),
            content: Some(content),
            headers: HashMap::new(),
            cookies: HashMap::new(),
            response_time: Some(response_time),
            error_message: None,
            completed_at: Utc::now(),
        }
    }

    pub fn timeout(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            status: TaskStatus::Timeout,
            status_code: None,
            content: None,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            response_time: Some(timeout_seconds as f64),
            error_message: Some(format!("任务执行超时 ({timeout_seconds}s)")),
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        worker_id: impl Into<String>,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            worker_id: worker_id.into(),
            status: TaskStatus::Failed,
            status_code: None,
            content: None,
            headers: HashMap::new(),
            cookies: HashMap::new(),
            response_time: None,
            error_message: Some(error_message.into()),
            completed_at: Utc::now(),
        }
    }

    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_result() {
        let result = ResultMessage::success("t-1", "worker-001", 200, "<html/>".to_string(), 0.42);
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.status_code, Some(200));
        assert!(result.error_message.is_none());
    }

    #[test]
    fn test_timeout_result_carries_message() {
        let result = ResultMessage::timeout("t-2", "worker-001", 30);
        assert_eq!(result.status, TaskStatus::Timeout);
        assert!(result.error_message.unwrap().contains("30"));
    }

    #[test]
    fn test_roundtrip() {
        let result = ResultMessage::failed("t-3", "worker-002", "connection reset");
        let json = result.serialize().unwrap();
        let parsed = ResultMessage::deserialize(&json).unwrap();
        assert_eq!(parsed.task_id, "t-3");
        assert_eq!(parsed.status, TaskStatus::Failed);
    }
}
