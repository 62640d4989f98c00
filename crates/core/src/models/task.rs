use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// 任务优先级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Urgent = 4,
}

impl Priority {
    /// 按调度顺序（从高到低）返回所有优先级
    pub fn descending() -> [Priority; 4] {
        [
            Priority::Urgent,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ]
    }

    /// 队列名称后缀
    pub fn queue_suffix(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn as_i64(&self) -> i64 {
        *self as i64
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Retry,
    Cancelled,
}

impl TaskStatus {
    /// 是否为终态（不会再被调度）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 爬虫类型
///
/// 取代按字符串键查找爬虫实现的做法，未知类型在解析阶段即报错。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CrawlerKind {
    /// 浏览器自动化 + 反检测路径，默认值
    Stealth,
    /// 纯HTTP客户端路径
    Http,
}

impl Default for CrawlerKind {
    fn default() -> Self {
        CrawlerKind::Stealth
    }
}

impl std::str::FromStr for CrawlerKind {
    type Err = crate::CrawlerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "stealth" | "default" => Ok(CrawlerKind::Stealth),
            "http" => Ok(CrawlerKind::Http),
            other => Err(crate::CrawlerError::UnknownCrawlerKind(other.to_string())),
        }
    }
}

/// 任务消息
///
/// 队列中流转的爬取任务描述，以JSON形式持久化在任务存储里。
/// `params`使用BTreeMap保证键有序，使去重哈希稳定。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub task_id: String,
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    #[serde(default)]
    pub crawler_kind: CrawlerKind,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub stealth_config: serde_json::Value,
    #[serde(default)]
    pub proxy_config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl TaskMessage {
    /// 创建一个指向指定URL的GET任务，其余字段取默认值
    pub fn new(url: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            url: url.into(),
            method: "GET".to_string(),
            headers: HashMap::new(),
            params: BTreeMap::new(),
            payload: serde_json::Value::Null,
            priority,
            retry_count: 0,
            max_retries: 3,
            timeout_seconds: 30,
            crawler_kind: CrawlerKind::default(),
            node_type: None,
            stealth_config: serde_json::Value::Null,
            proxy_config: serde_json::Value::Null,
            created_at: now,
            scheduled_at: now,
            worker_id: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_params(mut self, params: BTreeMap<String, String>) -> Self {
        self.params = params;
        self
    }

    /// 去重哈希
    ///
    /// 相同 (url, method, params) 的任务在TTL窗口内只接受一次。
    pub fn dedup_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.url.as_bytes());
        hasher.update(b":");
        hasher.update(self.method.as_bytes());
        for (k, v) in &self.params {
            hasher.update(b":");
            hasher.update(k.as_bytes());
            hasher.update(b"=");
            hasher.update(v.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// 是否还有剩余重试预算
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
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
    fn test_priority_order() {
        let order = Priority::descending();
        assert_eq!(order[0], Priority::Urgent);
        assert_eq!(order[3], Priority::Low);
        assert!(Priority::Urgent.as_i64() > Priority::Low.as_i64());
    }

    #[test]
    fn test_dedup_hash_ignores_param_insertion_order() {
        let mut a = TaskMessage::new("https://example.com", Priority::Normal);
        a.params.insert("b".to_string(), "2".to_string());
        a.params.insert("a".to_string(), "1".to_string());

        let mut b = TaskMessage::new("https://example.com", Priority::Urgent);
        b.params.insert("a".to_string(), "1".to_string());
        b.params.insert("b".to_string(), "2".to_string());

        // 优先级不同不影响去重判定
        assert_eq!(a.dedup_hash(), b.dedup_hash());
    }

    #[test]
    fn test_dedup_hash_differs_on_method() {
        let a = TaskMessage::new("https://example.com", Priority::Normal);
        let mut b = a.clone();
        b.method = "POST".to_string();
        assert_ne!(a.dedup_hash(), b.dedup_hash());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let task = TaskMessage::new("https://example.com/page", Priority::High);
        let json = task.serialize().expect("serialize");
        let parsed = TaskMessage::deserialize(&json).expect("deserialize");
        assert_eq!(parsed.task_id, task.task_id);
        assert_eq!(parsed.priority, Priority::High);
        assert_eq!(parsed.crawler_kind, CrawlerKind::Stealth);
    }

    #[test]
    fn test_can_retry_respects_max_retries() {
        let mut task = TaskMessage::new("https://example.com", Priority::Normal);
        task.max_retries = 2;
        assert!(task.can_retry());
        task.retry_count = 2;
        assert!(!task.can_retry());
    }

    #[test]
    fn test_crawler_kind_parsing() {
        use std::str::FromStr;
        assert_eq!(CrawlerKind::from_str("default").unwrap(), CrawlerKind::Stealth);
        assert_eq!(CrawlerKind::from_str("HTTP").unwrap(), CrawlerKind::Http);
        assert!(CrawlerKind::from_str("selenium").is_err());
    }
}
