use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Ready,
    Busy,
    Error,
    Stopped,
    Online,
    Offline,
}

impl WorkerStatus {
    /// 处于该状态的节点可以被分配任务
    pub fn is_schedulable(&self) -> bool {
        matches!(self, WorkerStatus::Ready | WorkerStatus::Online)
    }
}

/// 状态消息
///
/// Worker周期性上报的心跳载荷，同时写入状态流和注册表。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub worker_id: String,
    pub node_type: String,
    pub status: WorkerStatus,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl StatusMessage {
    pub fn serialize(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Worker节点信息（调度器侧视图）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub node_type: String,
    pub status: WorkerStatus,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_tasks: u32,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl WorkerInfo {
    pub fn from_status(status: &StatusMessage) -> Self {
        Self {
            worker_id: status.worker_id.clone(),
            node_type: status.node_type.clone(),
            status: status.status,
            cpu_usage: status.cpu_usage,
            memory_usage: status.memory_usage,
            active_tasks: status.active_tasks,
            completed_tasks: status.completed_tasks,
            failed_tasks: status.failed_tasks,
            last_heartbeat: status.last_heartbeat,
            capabilities: status.capabilities.clone(),
        }
    }

    /// 用新的心跳内容覆盖节点状态
    pub fn update_from_status(&mut self, status: &StatusMessage, now: DateTime<Utc>) {
        self.status = status.status;
        self.cpu_usage = status.cpu_usage;
        self.memory_usage = status.memory_usage;
        self.active_tasks = status.active_tasks;
        self.completed_tasks = status.completed_tasks;
        self.failed_tasks = status.failed_tasks;
        self.last_heartbeat = now;
    }

    /// 负载分数，越低越空闲
    pub fn load_score(&self) -> f64 {
        (self.cpu_usage + self.memory_usage) / 2.0 + self.active_tasks as f64 * 10.0
    }

    /// 节点是否健康
    ///
    /// 心跳新鲜度60秒，CPU和内存使用率均低于90%。
    pub fn is_healthy(&self, now: DateTime<Utc>) -> bool {
        self.status.is_schedulable()
            && (now - self.last_heartbeat).num_seconds() < 60
            && self.cpu_usage < 90.0
            && self.memory_usage < 90.0
    }

    /// 心跳是否超过注册表清理阈值
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn status(worker_id: &str) -> StatusMessage {
        StatusMessage {
            worker_id: worker_id.to_string(),
            node_type: "general".to_string(),
            status: WorkerStatus::Ready,
            cpu_usage: 10.0,
            memory_usage: 20.0,
            active_tasks: 1,
            completed_tasks: 5,
            failed_tasks: 0,
            last_heartbeat: Utc::now(),
            capabilities: vec!["stealth".to_string()],
        }
    }

    #[test]
    fn test_load_score() {
        let info = WorkerInfo::from_status(&status("w1"));
        // (10 + 20) / 2 + 1 * 10
        assert!((info.load_score() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_health_requires_fresh_heartbeat() {
        let now = Utc::now();
        let mut info = WorkerInfo::from_status(&status("w1"));
        assert!(info.is_healthy(now));

        info.last_heartbeat = now - Duration::seconds(61);
        assert!(!info.is_healthy(now));
    }

    #[test]
    fn test_health_rejects_overloaded_worker() {
        let now = Utc::now();
        let mut info = WorkerInfo::from_status(&status("w1"));
        info.cpu_usage = 95.0;
        assert!(!info.is_healthy(now));

        info.cpu_usage = 10.0;
        info.memory_usage = 92.0;
        assert!(!info.is_healthy(now));
    }

    #[test]
    fn test_stopped_worker_not_schedulable() {
        let now = Utc::now();
        let mut info = WorkerInfo::from_status(&status("w1"));
        info.status = WorkerStatus::Stopped;
        assert!(!info.is_healthy(now));
    }

    #[test]
    fn test_registry_expiry() {
        let now = Utc::now();
        let mut info = WorkerInfo::from_status(&status("w1"));
        info.last_heartbeat = now - Duration::seconds(301);
        assert!(info.is_heartbeat_expired(now, 300));
        assert!(!info.is_heartbeat_expired(now, 600));
    }
}
