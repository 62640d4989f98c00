use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crawler_core::models::{StatusMessage, TaskMessage, WorkerInfo};
use crawler_core::{CrawlerError, DispatchStrategy, Result, SchedulerConfig, TaskQueue};

use crate::rules::{apply_rules, default_rules, SchedulingRule};
use crate::strategies::create_strategy;

/// 调度器统计
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatistics {
    pub total_workers: usize,
    pub healthy_workers: usize,
    pub current_strategy: String,
    pub active_rules: usize,
    pub workers_by_type: HashMap<String, usize>,
}

/// 任务调度器
///
/// 维护节点注册表的内存视图（由状态流驱动），把待调度任务
/// 指派给规则过滤后、按策略选出的健康节点。
pub struct TaskScheduler {
    queue: Arc<dyn TaskQueue>,
    config: SchedulerConfig,
    workers: Arc<RwLock<HashMap<String, WorkerInfo>>>,
    rules: Arc<RwLock<Vec<SchedulingRule>>>,
    strategy: Arc<dyn DispatchStrategy>,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_running: Arc<RwLock<bool>>,
}

impl TaskScheduler {
    pub fn new(queue: Arc<dyn TaskQueue>, config: SchedulerConfig) -> Result<Self> {
        let strategy = create_strategy(&config.strategy)?;
        Ok(Self::with_strategy(queue, config, strategy))
    }

    pub fn with_strategy(
        queue: Arc<dyn TaskQueue>,
        config: SchedulerConfig,
        strategy: Arc<dyn DispatchStrategy>,
    ) -> Self {
        Self {
            queue,
            config,
            workers: Arc::new(RwLock::new(HashMap::new())),
            rules: Arc::new(RwLock::new(default_rules())),
            strategy,
            shutdown_tx: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    /// 添加调度规则
    pub async fn add_rule(&self, rule: SchedulingRule) {
        let mut rules = self.rules.write().await;
        info!("添加调度规则: {}", rule.name);
        rules.push(rule);
    }

    /// 用心跳内容更新节点视图
    pub async fn update_worker_status(&self, status: &StatusMessage) {
        let mut workers = self.workers.write().await;
        let now = Utc::now();
        match workers.get_mut(&status.worker_id) {
            Some(worker) => worker.update_from_status(status, now),
            None => {
                let mut worker = WorkerInfo::from_status(status);
                worker.last_heartbeat = now;
                workers.insert(status.worker_id.clone(), worker);
            }
        }
    }

    /// 获取健康节点，可按节点类型过滤
    pub async fn get_healthy_workers(&self, node_type: Option<&str>) -> Vec<WorkerInfo> {
        let workers = self.workers.read().await;
        let now = Utc::now();
        workers
            .values()
            .filter(|worker| worker.is_healthy(now))
            .filter(|worker| match node_type {
                Some(required) => worker.node_type == required,
                None => true,
            })
            .cloned()
            .collect()
    }

    /// 为任务选择节点
    pub async fn select_worker(&self, task: &TaskMessage) -> Result<Option<String>> {
        let healthy = self.get_healthy_workers(task.node_type.as_deref()).await;
        if healthy.is_empty() {
            warn!("没有可用的健康工作节点");
            return Ok(None);
        }

        let rules = self.rules.read().await;
        let candidates = apply_rules(&rules, task, healthy);
        drop(rules);

        if candidates.is_empty() {
            warn!("所有工作节点都被调度规则过滤");
            return Ok(None);
        }
        self.strategy.select_worker(task, &candidates).await
    }

    /// 移除心跳超时的节点，返回被移除的节点ID
    pub async fn evict_stale_workers(&self) -> Vec<String> {
        let mut workers = self.workers.write().await;
        let now = Utc::now();
        let expiry = self.config.worker_expiry_seconds;
        let stale: Vec<String> = workers
            .values()
            .filter(|worker| worker.is_heartbeat_expired(now, expiry))
            .map(|worker| worker.worker_id.clone())
            .collect();
        for worker_id in &stale {
            workers.remove(worker_id);
            warn!("移除超时工作节点: {}", worker_id);
        }
        stale
    }

    /// 消费状态流，刷新节点视图
    async fn ingest_status_messages(&self) -> Result<()> {
        let messages = self.queue.poll_status_messages(100).await?;
        for status in messages {
            self.update_worker_status(&status).await;
        }
        Ok(())
    }

    /// 一轮调度：把待调度任务指派给选出的节点
    async fn schedule_pending_tasks(&self) -> Result<usize> {
        let pending = self
            .queue
            .get_pending_tasks(self.config.pending_batch_size)
            .await?;
        let mut assigned = 0;

        for task in pending {
            match self.select_worker(&task).await? {
                Some(worker_id) => {
                    if self.queue.assign_task(&task.task_id, &worker_id).await? {
                        debug!("任务 {} 分配给工作节点 {}", task.task_id, worker_id);
                        assigned += 1;
                    } else {
                        warn!("任务分配失败: {}", task.task_id);
                    }
                }
                None => {
                    debug!("无可用工作节点，任务等待: {}", task.task_id);
                }
            }
        }
        Ok(assigned)
    }

    /// 启动后台循环
    pub async fn start(&self) -> Result<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(CrawlerError::Internal("调度器已在运行".to_string()));
        }

        info!("启动任务调度器...");

        // 从注册表恢复已知节点
        match self.queue.get_workers().await {
            Ok(workers) => {
                for status in workers {
                    self.update_worker_status(&status).await;
                }
            }
            Err(e) => warn!("恢复节点注册表失败: {}", e),
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        {
            let mut tx_guard = self.shutdown_tx.write().await;
            *tx_guard = Some(shutdown_tx.clone());
        }

        // 状态流消费循环
        let scheduler = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(500));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = scheduler.ingest_status_messages().await {
                            error!("消费状态流失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("状态消费循环收到停止信号");
                        break;
                    }
                }
            }
        });

        // 节点监控循环
        let scheduler = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(
                scheduler.config.monitor_interval_seconds.max(1),
            ));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        scheduler.evict_stale_workers().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("节点监控循环收到停止信号");
                        break;
                    }
                }
            }
        });

        // 调度循环
        let scheduler = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(
                scheduler.config.schedule_interval_ms.max(100),
            ));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = scheduler.schedule_pending_tasks().await {
                            error!("任务调度失败: {}", e);
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("调度循环收到停止信号");
                        break;
                    }
                }
            }
        });

        *is_running = true;
        info!("任务调度器已启动");
        Ok(())
    }

    pub async fn stop(&self) {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return;
        }
        info!("停止任务调度器...");
        {
            let tx_guard = self.shutdown_tx.read().await;
            if let Some(shutdown_tx) = tx_guard.as_ref() {
                let _ = shutdown_tx.send(());
            }
        }
        *is_running = false;
        info!("任务调度器已停止");
    }

    pub async fn statistics(&self) -> SchedulerStatistics {
        let workers = self.workers.read().await;
        let now = Utc::now();
        let mut workers_by_type: HashMap<String, usize> = HashMap::new();
        for worker in workers.values() {
            *workers_by_type.entry(worker.node_type.clone()).or_insert(0) += 1;
        }
        let rules = self.rules.read().await;

        SchedulerStatistics {
            total_workers: workers.len(),
            healthy_workers: workers.values().filter(|w| w.is_healthy(now)).count(),
            current_strategy: self.strategy.name().to_string(),
            active_rules: rules.iter().filter(|r| r.enabled).count(),
            workers_by_type,
        }
    }
}

impl Clone for TaskScheduler {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
            workers: Arc::clone(&self.workers),
            rules: Arc::clone(&self.rules),
            strategy: Arc::clone(&self.strategy),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            is_running: Arc::clone(&self.is_running),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use crawler_core::models::{Priority, WorkerStatus};
    use crawler_core::QueueConfig;
    use crawler_queue::InMemoryTaskQueue;

    fn status(worker_id: &str, cpu: f64, mem: f64, active: u32) -> StatusMessage {
        StatusMessage {
            worker_id: worker_id.to_string(),
            node_type: "general".to_string(),
            status: WorkerStatus::Ready,
            cpu_usage: cpu,
            memory_usage: mem,
            active_tasks: active,
            completed_tasks: 0,
            failed_tasks: 0,
            last_heartbeat: Utc::now(),
            capabilities: vec![],
        }
    }

    fn scheduler_with(strategy: &str) -> TaskScheduler {
        let queue = Arc::new(InMemoryTaskQueue::new(QueueConfig::default()));
        TaskScheduler::new(
            queue,
            SchedulerConfig {
                strategy: strategy.to_string(),
                ..SchedulerConfig::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_least_loaded_selects_idle_worker() {
        let scheduler = scheduler_with("least_loaded");
        scheduler.update_worker_status(&status("idle", 10.0, 10.0, 0)).await;
        scheduler.update_worker_status(&status("medium", 50.0, 50.0, 2)).await;
        scheduler.update_worker_status(&status("busy", 90.0, 90.0, 5)).await;

        let task = TaskMessage::new("https://example.com", Priority::Normal);
        let selected = scheduler.select_worker(&task).await.unwrap();
        // busy节点的cpu/mem达到90已不健康，idle在剩下两个里负载最低
        assert_eq!(selected.as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn test_no_workers_gives_none() {
        let scheduler = scheduler_with("least_loaded");
        let task = TaskMessage::new("https://example.com", Priority::Normal);
        assert!(scheduler.select_worker(&task).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_heartbeat_excluded_from_selection() {
        let scheduler = scheduler_with("least_loaded");
        scheduler.update_worker_status(&status("w1", 10.0, 10.0, 0)).await;

        // 把心跳改旧，超过健康阈值
        {
            let mut workers = scheduler.workers.write().await;
            workers.get_mut("w1").unwrap().last_heartbeat =
                Utc::now() - ChronoDuration::seconds(120);
        }

        let task = TaskMessage::new("https://example.com", Priority::Normal);
        assert!(scheduler.select_worker(&task).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_eviction_after_five_minutes() {
        let scheduler = scheduler_with("least_loaded");
        scheduler.update_worker_status(&status("fresh", 10.0, 10.0, 0)).await;
        scheduler.update_worker_status(&status("stale", 10.0, 10.0, 0)).await;
        {
            let mut workers = scheduler.workers.write().await;
            workers.get_mut("stale").unwrap().last_heartbeat =
                Utc::now() - ChronoDuration::seconds(301);
        }

        let evicted = scheduler.evict_stale_workers().await;
        assert_eq!(evicted, vec!["stale".to_string()]);

        let stats = scheduler.statistics().await;
        assert_eq!(stats.total_workers, 1);
    }

    #[tokio::test]
    async fn test_status_ingest_from_queue_stream() {
        let queue = Arc::new(InMemoryTaskQueue::new(QueueConfig::default()));
        let scheduler = TaskScheduler::new(
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
            SchedulerConfig::default(),
        )
        .unwrap();

        queue.update_worker_status(&status("w1", 5.0, 5.0, 0)).await.unwrap();
        scheduler.ingest_status_messages().await.unwrap();

        let stats = scheduler.statistics().await;
        assert_eq!(stats.total_workers, 1);
        assert_eq!(stats.healthy_workers, 1);
        assert_eq!(stats.workers_by_type.get("general"), Some(&1));
    }

    #[tokio::test]
    async fn test_schedule_pending_assigns_worker() {
        let queue = Arc::new(InMemoryTaskQueue::new(QueueConfig::default()));
        let scheduler = TaskScheduler::new(
            Arc::clone(&queue) as Arc<dyn TaskQueue>,
            SchedulerConfig::default(),
        )
        .unwrap();
        scheduler.update_worker_status(&status("w1", 10.0, 10.0, 0)).await;

        let task = TaskMessage::new("https://example.com", Priority::Normal);
        queue.add_task(&task, true).await.unwrap();

        let assigned = scheduler.schedule_pending_tasks().await.unwrap();
        assert_eq!(assigned, 1);
    }

    #[tokio::test]
    async fn test_statistics_reports_strategy() {
        let scheduler = scheduler_with("resource_aware");
        let stats = scheduler.statistics().await;
        assert_eq!(stats.current_strategy, "resource_aware");
        assert_eq!(stats.active_rules, 3);
    }
}
