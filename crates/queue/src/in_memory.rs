use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, warn};
use uuid::Uuid;

use crawler_core::models::{
    Priority, QueueStats, ResultMessage, StatusMessage, TaskMessage, TaskStatus,
};
use crawler_core::{QueueConfig, Result, TaskQueue};

/// 等待新任务时的轮询间隔，防止错过唤醒信号
const WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct TaskStatusEntry {
    status: TaskStatus,
    worker_id: Option<String>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone)]
struct WorkerEntry {
    status: StatusMessage,
}

#[derive(Default)]
struct QueueState {
    /// 各优先级队列，队首为最新入队（LPUSH语义），队尾弹出
    queues: HashMap<Priority, VecDeque<String>>,
    retry_queue: VecDeque<String>,
    dead_letter_queue: VecDeque<String>,
    results: VecDeque<ResultMessage>,
    status_stream: VecDeque<StatusMessage>,
    storage: HashMap<String, TaskMessage>,
    task_status: HashMap<String, TaskStatusEntry>,
    /// 去重哈希 -> 过期时刻
    hashes: HashMap<String, Instant>,
    workers: HashMap<String, WorkerEntry>,
    counters: HashMap<String, u64>,
}

impl QueueState {
    fn bump(&mut self, key: &str) {
        *self.counters.entry(key.to_string()).or_insert(0) += 1;
    }

    fn set_task_status(&mut self, task_id: &str, status: TaskStatus, worker_id: Option<String>) {
        self.task_status.insert(
            task_id.to_string(),
            TaskStatusEntry {
                status,
                worker_id,
                updated_at: Utc::now(),
            },
        );
    }

    fn purge_expired_hashes(&mut self, now: Instant) {
        self.hashes.retain(|_, expiry| *expiry > now);
    }
}

/// 内存任务队列实现
///
/// 与Redis实现共享同一套协议语义，用于嵌入式部署和测试，
/// 不需要外部存储。
pub struct InMemoryTaskQueue {
    config: QueueConfig,
    state: Arc<Mutex<QueueState>>,
    notify: Arc<Notify>,
}

impl InMemoryTaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(QueueState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// 尝试按优先级顺序弹出一个任务
    async fn try_pop(&self, worker_id: &str) -> Option<TaskMessage> {
        let mut state = self.state.lock().await;

        let task_id = Priority::descending()
            .iter()
            .find_map(|p| state.queues.get_mut(p).and_then(|q| q.pop_back()))
            .or_else(|| state.retry_queue.pop_back())?;

        let mut task = match state.storage.get(&task_id) {
            Some(task) => task.clone(),
            None => {
                warn!("任务数据不存在: {}", task_id);
                return None;
            }
        };

        task.worker_id = Some(worker_id.to_string());
        state.storage.insert(task_id.clone(), task.clone());
        state.set_task_status(&task_id, TaskStatus::Running, Some(worker_id.to_string()));
        state.bump("tasks_consumed");

        debug!("任务已分配给工作节点: {} -> {}", task_id, worker_id);
        Some(task)
    }

    /// 在已持有锁的情况下执行重试转移，避免complete_task重入死锁
    fn retry_task_locked(state: &mut QueueState, task_id: &str, delay: u64) {
        let mut task = match state.storage.get(task_id) {
            Some(task) => task.clone(),
            None => {
                warn!("任务数据不存在: {}", task_id);
                return;
            }
        };

        if task.retry_count >= task.max_retries {
            state.dead_letter_queue.push_front(task_id.to_string());
            state.set_task_status(task_id, TaskStatus::Failed, None);
            state.bump("tasks_dead");
            warn!("任务超过最大重试次数，移入死信队列: {}", task_id);
            return;
        }

        task.retry_count += 1;
        task.scheduled_at = Utc::now() + chrono::Duration::seconds(delay as i64);
        state.storage.insert(task_id.to_string(), task.clone());
        state.retry_queue.push_front(task_id.to_string());
        state.set_task_status(task_id, TaskStatus::Retry, None);
        state.bump("tasks_retried");
        debug!(
            "任务已加入重试队列: {} (第{}次重试)",
            task_id, task.retry_count
        );
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn add_task(&self, task: &TaskMessage, check_duplicate: bool) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if check_duplicate {
            state.purge_expired_hashes(now);
            let hash = task.dedup_hash();
            if state.hashes.contains_key(&hash) {
                debug!("任务已存在，跳过: {}", task.url);
                return Ok(false);
            }
            let expiry = now + Duration::from_secs(self.config.dedup_ttl_seconds);
            state.hashes.insert(hash, expiry);
        }

        let mut task = task.clone();
        if task.task_id.is_empty() {
            task.task_id = Uuid::new_v4().to_string();
        }
        let task_id = task.task_id.clone();
        let priority = task.priority;

        state.storage.insert(task_id.clone(), task);
        state
            .queues
            .entry(priority)
            .or_default()
            .push_front(task_id.clone());
        state.set_task_status(&task_id, TaskStatus::Pending, None);
        state.bump("tasks_added");
        drop(state);

        self.notify.notify_waiters();
        Ok(true)
    }

    async fn get_task(&self, worker_id: &str, timeout: Duration) -> Result<Option<TaskMessage>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_pop(worker_id).await {
                return Ok(Some(task));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining.min(WAIT_SLICE), self.notify.notified()).await;
        }
    }

    async fn complete_task(&self, task_id: &str, result: &ResultMessage) -> Result<()> {
        let mut state = self.state.lock().await;

        state.set_task_status(task_id, result.status, Some(result.worker_id.clone()));
        state.results.push_front(result.clone());
        if result.status == TaskStatus::Success {
            state.bump("tasks_completed");
        } else {
            state.bump("tasks_failed");
        }

        if self.config.auto_retry
            && matches!(result.status, TaskStatus::Failed | TaskStatus::Timeout)
        {
            Self::retry_task_locked(&mut state, task_id, self.config.retry_delay_seconds);
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn retry_task(&self, task_id: &str, delay_seconds: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::retry_task_locked(&mut state, task_id, delay_seconds);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        node_type: &str,
        capabilities: &[String],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.workers.insert(
            worker_id.to_string(),
            WorkerEntry {
                status: StatusMessage {
                    worker_id: worker_id.to_string(),
                    node_type: node_type.to_string(),
                    status: crawler_core::WorkerStatus::Online,
                    cpu_usage: 0.0,
                    memory_usage: 0.0,
                    active_tasks: 0,
                    completed_tasks: 0,
                    failed_tasks: 0,
                    last_heartbeat: Utc::now(),
                    capabilities: capabilities.to_vec(),
                },
            },
        );
        debug!("工作节点已注册: {} ({})", worker_id, node_type);
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.workers.remove(worker_id);
        Ok(())
    }

    async fn update_worker_status(&self, status: &StatusMessage) -> Result<()> {
        let mut state = self.state.lock().await;
        state.status_stream.push_front(status.clone());
        if let Some(entry) = state.workers.get_mut(&status.worker_id) {
            entry.status = status.clone();
        } else {
            state.workers.insert(
                status.worker_id.clone(),
                WorkerEntry {
                    status: status.clone(),
                },
            );
        }
        Ok(())
    }

    async fn poll_status_messages(&self, limit: usize) -> Result<Vec<StatusMessage>> {
        let mut state = self.state.lock().await;
        let mut messages = Vec::new();
        while messages.len() < limit {
            match state.status_stream.pop_back() {
                Some(msg) => messages.push(msg),
                None => break,
            }
        }
        Ok(messages)
    }

    async fn get_workers(&self) -> Result<Vec<StatusMessage>> {
        let state = self.state.lock().await;
        Ok(state
            .workers
            .values()
            .map(|entry| entry.status.clone())
            .collect())
    }

    async fn get_pending_tasks(&self, limit: usize) -> Result<Vec<TaskMessage>> {
        let state = self.state.lock().await;
        let pending = state
            .storage
            .values()
            .filter(|task| {
                state
                    .task_status
                    .get(&task.task_id)
                    .map(|entry| entry.status == TaskStatus::Pending)
                    .unwrap_or(false)
            })
            .take(limit)
            .cloned()
            .collect();
        Ok(pending)
    }

    async fn assign_task(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.storage.get(task_id).cloned() {
            Some(mut task) => {
                task.worker_id = Some(worker_id.to_string());
                state.storage.insert(task_id.to_string(), task);
                if let Some(entry) = state.task_status.get_mut(task_id) {
                    entry.worker_id = Some(worker_id.to_string());
                    entry.updated_at = Utc::now();
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn poll_results(&self, limit: usize) -> Result<Vec<ResultMessage>> {
        let mut state = self.state.lock().await;
        let mut results = Vec::new();
        while results.len() < limit {
            match state.results.pop_back() {
                Some(result) => results.push(result),
                None => break,
            }
        }
        Ok(results)
    }

    async fn get_queue_stats(&self) -> Result<QueueStats> {
        let state = self.state.lock().await;
        let mut stats = QueueStats::default();
        for priority in Priority::descending() {
            let length = state
                .queues
                .get(&priority)
                .map(|q| q.len() as u64)
                .unwrap_or(0);
            stats.queue_lengths.insert(priority.as_i64(), length);
        }
        stats.retry_queue_length = state.retry_queue.len() as u64;
        stats.dead_letter_queue_length = state.dead_letter_queue.len() as u64;
        stats.result_queue_length = state.results.len() as u64;
        stats.active_workers = state.workers.len() as u64;
        stats.counters = state.counters.clone();
        Ok(stats)
    }

    async fn clear_queues(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        *state = QueueState::default();
        debug!("所有队列已清空");
        Ok(())
    }
}
