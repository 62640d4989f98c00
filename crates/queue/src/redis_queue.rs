use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::time::sleep;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crawler_core::models::{
    Priority, QueueStats, ResultMessage, StatusMessage, TaskMessage, TaskStatus,
};
use crawler_core::{CrawlerError, QueueConfig, RedisConfig, Result, TaskQueue};

use crate::keys::QueueKeys;

/// 节点存活键的TTL（3倍默认心跳间隔），崩溃节点自动从注册表消失
const WORKER_ALIVE_TTL_SECONDS: u64 = 90;

/// Redis任务队列实现
///
/// 队列为List（LPUSH入队、BRPOP按优先级顺序出队），任务体存Hash，
/// 去重哈希存带TTL的Set，计数器用HINCRBY维护。
pub struct RedisTaskQueue {
    manager: ConnectionManager,
    keys: QueueKeys,
    config: QueueConfig,
}

impl RedisTaskQueue {
    /// 建立连接并验证可达性
    ///
    /// 启动阶段的连接失败是致命错误，带有限次数的重试。
    pub async fn connect(redis_config: &RedisConfig, queue_config: QueueConfig) -> Result<Self> {
        let redis_url = redis_config.build_connection_url();
        let client = Client::open(redis_url)
            .map_err(|e| CrawlerError::Store(format!("Failed to create Redis client: {e}")))?;

        let mut last_error = None;
        for attempt in 0..redis_config.max_retry_attempts {
            match ConnectionManager::new(client.clone()).await {
                Ok(manager) => {
                    let queue = Self {
                        manager,
                        keys: QueueKeys::new(&queue_config.prefix),
                        config: queue_config,
                    };
                    queue.ping().await?;
                    debug!(
                        "Successfully connected to Redis at {}:{}",
                        redis_config.host, redis_config.port
                    );
                    return Ok(queue);
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt + 1 < redis_config.max_retry_attempts {
                        warn!(
                            "Failed to connect to Redis (attempt {}/{}): {}. Retrying in {}s...",
                            attempt + 1,
                            redis_config.max_retry_attempts,
                            last_error.as_ref().unwrap(),
                            redis_config.retry_delay_seconds
                        );
                        sleep(Duration::from_secs(redis_config.retry_delay_seconds)).await;
                    }
                }
            }
        }

        let error_msg = format!(
            "Failed to connect to Redis after {} attempts. Last error: {}",
            redis_config.max_retry_attempts,
            last_error.map_or("Unknown".to_string(), |e| e.to_string())
        );
        error!("{}", error_msg);
        Err(CrawlerError::Store(error_msg))
    }

    async fn execute<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.manager.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| CrawlerError::Store(format!("Redis command failed: {e}")))
    }

    pub async fn ping(&self) -> Result<()> {
        let response: String = self.execute(&redis::cmd("PING")).await?;
        if response == "PONG" {
            Ok(())
        } else {
            Err(CrawlerError::Store(format!(
                "Unexpected PING response: {response}"
            )))
        }
    }

    pub async fn health_check(&self) -> bool {
        match self.ping().await {
            Ok(()) => true,
            Err(e) => {
                warn!("Redis health check failed: {}", e);
                false
            }
        }
    }

    async fn bump(&self, counter: &str) {
        let mut cmd = redis::cmd("HINCRBY");
        cmd.arg(self.keys.stats()).arg(counter).arg(1);
        if let Err(e) = self.execute::<i64>(&cmd).await {
            warn!("Failed to update counter {}: {}", counter, e);
        }
    }

    async fn set_task_status(
        &self,
        task_id: &str,
        status: TaskStatus,
        worker_id: Option<&str>,
    ) -> Result<()> {
        let status_info = serde_json::json!({
            "status": status,
            "worker_id": worker_id,
            "updated_at": Utc::now(),
        });
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.keys.task_status())
            .arg(task_id)
            .arg(status_info.to_string());
        self.execute::<i64>(&cmd).await?;
        Ok(())
    }

    async fn load_task(&self, task_id: &str) -> Result<Option<TaskMessage>> {
        let mut cmd = redis::cmd("HGET");
        cmd.arg(self.keys.storage()).arg(task_id);
        let task_json: Option<String> = self.execute(&cmd).await?;
        match task_json {
            Some(json) => Ok(Some(TaskMessage::deserialize(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_task(&self, task: &TaskMessage) -> Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.keys.storage())
            .arg(&task.task_id)
            .arg(task.serialize()?);
        self.execute::<i64>(&cmd).await?;
        Ok(())
    }

    /// 重试转移：预算耗尽则进入死信队列，否则延迟后重新入队
    async fn move_to_retry(&self, task_id: &str, delay_seconds: u64) -> Result<()> {
        let mut task = match self.load_task(task_id).await? {
            Some(task) => task,
            None => {
                warn!("任务数据不存在: {}", task_id);
                return Ok(());
            }
        };

        if task.retry_count >= task.max_retries {
            let mut cmd = redis::cmd("LPUSH");
            cmd.arg(self.keys.dead_letter_queue()).arg(task_id);
            self.execute::<i64>(&cmd).await?;
            self.set_task_status(task_id, TaskStatus::Failed, None).await?;
            self.bump("tasks_dead").await;
            warn!("任务超过最大重试次数，移入死信队列: {}", task_id);
            return Ok(());
        }

        task.retry_count += 1;
        task.scheduled_at = Utc::now() + chrono::Duration::seconds(delay_seconds as i64);
        self.store_task(&task).await?;

        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(self.keys.retry_queue()).arg(task_id);
        self.execute::<i64>(&cmd).await?;
        self.set_task_status(task_id, TaskStatus::Retry, None).await?;
        self.bump("tasks_retried").await;
        debug!(
            "任务已加入重试队列: {} (第{}次重试)",
            task_id, task.retry_count
        );
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn add_task(&self, task: &TaskMessage, check_duplicate: bool) -> Result<bool> {
        let result: Result<bool> = async {
            if check_duplicate {
                let hash = task.dedup_hash();
                let mut cmd = redis::cmd("SADD");
                cmd.arg(self.keys.hash_set()).arg(&hash);
                let added: i64 = self.execute(&cmd).await?;
                if added == 0 {
                    debug!("任务已存在，跳过: {}", task.url);
                    return Ok(false);
                }
                let mut cmd = redis::cmd("EXPIRE");
                cmd.arg(self.keys.hash_set())
                    .arg(self.config.dedup_ttl_seconds);
                self.execute::<i64>(&cmd).await?;
            }

            let mut task = task.clone();
            if task.task_id.is_empty() {
                task.task_id = Uuid::new_v4().to_string();
            }
            self.store_task(&task).await?;

            let mut cmd = redis::cmd("LPUSH");
            cmd.arg(self.keys.task_queue(task.priority)).arg(&task.task_id);
            self.execute::<i64>(&cmd).await?;

            self.set_task_status(&task.task_id, TaskStatus::Pending, None)
                .await?;
            self.bump("tasks_added").await;
            debug!("任务已添加到队列: {} -> {}", task.task_id, task.url);
            Ok(true)
        }
        .await;

        // 存储不可用按“稍后重试”处理，不向上传播
        match result {
            Ok(added) => Ok(added),
            Err(e) => {
                error!("添加任务失败: {}", e);
                Ok(false)
            }
        }
    }

    async fn get_task(&self, worker_id: &str, timeout: Duration) -> Result<Option<TaskMessage>> {
        let result: Result<Option<TaskMessage>> = async {
            let mut cmd = redis::cmd("BRPOP");
            for queue_name in self.keys.blocking_pop_order() {
                cmd.arg(queue_name);
            }
            cmd.arg(timeout.as_secs().max(1));
            let popped: Option<(String, String)> = self.execute(&cmd).await?;

            let (_, task_id) = match popped {
                Some(pair) => pair,
                None => return Ok(None),
            };

            let mut task = match self.load_task(&task_id).await? {
                Some(task) => task,
                None => {
                    warn!("任务数据不存在: {}", task_id);
                    return Ok(None);
                }
            };

            task.worker_id = Some(worker_id.to_string());
            self.set_task_status(&task_id, TaskStatus::Running, Some(worker_id))
                .await?;
            self.bump("tasks_consumed").await;
            debug!("任务已分配给工作节点: {} -> {}", task_id, worker_id);
            Ok(Some(task))
        }
        .await;

        match result {
            Ok(task) => Ok(task),
            Err(e) => {
                error!("获取任务失败: {}", e);
                Ok(None)
            }
        }
    }

    async fn complete_task(&self, task_id: &str, result: &ResultMessage) -> Result<()> {
        self.set_task_status(task_id, result.status, Some(&result.worker_id))
            .await?;

        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(self.keys.result_queue()).arg(result.serialize()?);
        self.execute::<i64>(&cmd).await?;

        if result.status == TaskStatus::Success {
            self.bump("tasks_completed").await;
        } else {
            self.bump("tasks_failed").await;
        }
        debug!("任务完成: {} -> {:?}", task_id, result.status);

        if self.config.auto_retry
            && matches!(result.status, TaskStatus::Failed | TaskStatus::Timeout)
        {
            self.move_to_retry(task_id, self.config.retry_delay_seconds)
                .await?;
        }
        Ok(())
    }

    async fn retry_task(&self, task_id: &str, delay_seconds: u64) -> Result<()> {
        self.move_to_retry(task_id, delay_seconds).await
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        node_type: &str,
        capabilities: &[String],
    ) -> Result<()> {
        let status = StatusMessage {
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
        };
        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.keys.worker_registry())
            .arg(worker_id)
            .arg(status.serialize()?);
        self.execute::<i64>(&cmd).await?;
        debug!("工作节点已注册: {} ({})", worker_id, node_type);
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<()> {
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(self.keys.worker_registry()).arg(worker_id);
        self.execute::<i64>(&cmd).await?;

        let mut cmd = redis::cmd("DEL");
        cmd.arg(self.keys.worker_alive(worker_id));
        self.execute::<i64>(&cmd).await?;
        Ok(())
    }

    async fn update_worker_status(&self, status: &StatusMessage) -> Result<()> {
        let json = status.serialize()?;

        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(self.keys.status_queue()).arg(&json);
        self.execute::<i64>(&cmd).await?;

        let mut cmd = redis::cmd("HSET");
        cmd.arg(self.keys.worker_registry())
            .arg(&status.worker_id)
            .arg(&json);
        self.execute::<i64>(&cmd).await?;

        // 带TTL的存活标记，节点崩溃后自动过期
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.keys.worker_alive(&status.worker_id))
            .arg(&json)
            .arg("EX")
            .arg(WORKER_ALIVE_TTL_SECONDS);
        self.execute::<String>(&cmd).await?;
        Ok(())
    }

    async fn poll_status_messages(&self, limit: usize) -> Result<Vec<StatusMessage>> {
        let mut cmd = redis::cmd("RPOP");
        cmd.arg(self.keys.status_queue()).arg(limit);
        let popped: Option<Vec<String>> = self.execute(&cmd).await?;

        let mut messages = Vec::new();
        for json in popped.unwrap_or_default() {
            match StatusMessage::deserialize(&json) {
                Ok(msg) => messages.push(msg),
                Err(e) => warn!("Failed to parse status message: {}", e),
            }
        }
        Ok(messages)
    }

    async fn get_workers(&self) -> Result<Vec<StatusMessage>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(self.keys.worker_registry());
        let entries: std::collections::HashMap<String, String> = self.execute(&cmd).await?;

        let mut workers = Vec::new();
        for (worker_id, json) in entries {
            match StatusMessage::deserialize(&json) {
                Ok(status) => workers.push(status),
                Err(e) => warn!("Failed to parse registry entry for {}: {}", worker_id, e),
            }
        }
        Ok(workers)
    }

    async fn get_pending_tasks(&self, limit: usize) -> Result<Vec<TaskMessage>> {
        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(self.keys.task_status());
        let statuses: std::collections::HashMap<String, String> = self.execute(&cmd).await?;

        let mut pending = Vec::new();
        for (task_id, json) in statuses {
            if pending.len() >= limit {
                break;
            }
            let is_pending = serde_json::from_str::<serde_json::Value>(&json)
                .ok()
                .and_then(|v| v.get("status").cloned())
                .map(|s| s == serde_json::json!("pending"))
                .unwrap_or(false);
            if is_pending {
                if let Some(task) = self.load_task(&task_id).await? {
                    pending.push(task);
                }
            }
        }
        Ok(pending)
    }

    async fn assign_task(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let mut task = match self.load_task(task_id).await? {
            Some(task) => task,
            None => return Ok(false),
        };
        task.worker_id = Some(worker_id.to_string());
        self.store_task(&task).await?;
        Ok(true)
    }

    async fn poll_results(&self, limit: usize) -> Result<Vec<ResultMessage>> {
        let mut cmd = redis::cmd("RPOP");
        cmd.arg(self.keys.result_queue()).arg(limit);
        let popped: Option<Vec<String>> = self.execute(&cmd).await?;

        let mut results = Vec::new();
        for json in popped.unwrap_or_default() {
            match ResultMessage::deserialize(&json) {
                Ok(result) => results.push(result),
                Err(e) => warn!("Failed to parse result message: {}", e),
            }
        }
        Ok(results)
    }

    async fn get_queue_stats(&self) -> Result<QueueStats> {
        let mut stats = QueueStats::default();

        for priority in Priority::descending() {
            let mut cmd = redis::cmd("LLEN");
            cmd.arg(self.keys.task_queue(priority));
            let length: u64 = self.execute(&cmd).await?;
            stats.queue_lengths.insert(priority.as_i64(), length);
        }

        let mut cmd = redis::cmd("LLEN");
        cmd.arg(self.keys.retry_queue());
        stats.retry_queue_length = self.execute(&cmd).await?;

        let mut cmd = redis::cmd("LLEN");
        cmd.arg(self.keys.dead_letter_queue());
        stats.dead_letter_queue_length = self.execute(&cmd).await?;

        let mut cmd = redis::cmd("LLEN");
        cmd.arg(self.keys.result_queue());
        stats.result_queue_length = self.execute(&cmd).await?;

        let mut cmd = redis::cmd("HLEN");
        cmd.arg(self.keys.worker_registry());
        stats.active_workers = self.execute(&cmd).await?;

        let mut cmd = redis::cmd("HGETALL");
        cmd.arg(self.keys.stats());
        stats.counters = self.execute(&cmd).await?;

        Ok(stats)
    }

    async fn clear_queues(&self) -> Result<()> {
        let mut cmd = redis::cmd("DEL");
        for key in self.keys.all_list_keys() {
            cmd.arg(key);
        }
        for key in self.keys.all_storage_keys() {
            cmd.arg(key);
        }
        self.execute::<i64>(&cmd).await?;
        debug!("所有队列已清空");
        Ok(())
    }
}
