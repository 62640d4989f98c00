use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sysinfo::System;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crawler_core::models::{
    CrawlerKind, ResultMessage, StatusMessage, TaskMessage, TaskStatus, WorkerStatus,
};
use crawler_core::{Crawler, CrawlerError, Result, TaskQueue, WorkerConfig};

use crate::registry::CrawlerRegistry;

/// Worker服务构建器
pub struct WorkerServiceBuilder {
    worker_id: String,
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    registry: CrawlerRegistry,
    hostname: String,
}

impl WorkerServiceBuilder {
    pub fn new(worker_id: String, queue: Arc<dyn TaskQueue>, config: WorkerConfig) -> Self {
        Self {
            worker_id,
            queue,
            config,
            registry: CrawlerRegistry::new(),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
        }
    }

    /// 注册爬虫实现
    pub fn register_crawler(mut self, kind: CrawlerKind, crawler: Arc<dyn Crawler>) -> Self {
        info!("注册爬虫实现: {:?} -> {}", kind, crawler.name());
        self.registry.register(kind, crawler);
        self
    }

    pub fn hostname(mut self, hostname: String) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn build(self) -> Result<WorkerService> {
        if self.registry.is_empty() {
            return Err(CrawlerError::Configuration(
                "工作节点至少需要注册一个爬虫实现".to_string(),
            ));
        }
        Ok(WorkerService {
            worker_id: self.worker_id,
            queue: self.queue,
            config: self.config,
            registry: Arc::new(self.registry),
            hostname: self.hostname,
            active_tasks: Arc::new(AtomicU32::new(0)),
            total_tasks: Arc::new(AtomicU64::new(0)),
            success_tasks: Arc::new(AtomicU64::new(0)),
            failed_tasks: Arc::new(AtomicU64::new(0)),
            system: Arc::new(Mutex::new(System::new_all())),
            shutdown_tx: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
        })
    }
}

/// 工作节点服务
///
/// 两个并行活动：心跳循环上报资源状态并刷新注册表，任务循环
/// 在并发上限内阻塞拉取任务并执行。每次任务尝试恰好上报一条
/// 终态结果，重试与否由队列层裁决。
pub struct WorkerService {
    worker_id: String,
    queue: Arc<dyn TaskQueue>,
    config: WorkerConfig,
    registry: Arc<CrawlerRegistry>,
    hostname: String,
    active_tasks: Arc<AtomicU32>,
    total_tasks: Arc<AtomicU64>,
    success_tasks: Arc<AtomicU64>,
    failed_tasks: Arc<AtomicU64>,
    system: Arc<Mutex<System>>,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_running: Arc<RwLock<bool>>,
}

impl WorkerService {
    pub fn builder(
        worker_id: String,
        queue: Arc<dyn TaskQueue>,
        config: WorkerConfig,
    ) -> WorkerServiceBuilder {
        WorkerServiceBuilder::new(worker_id, queue, config)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn active_task_count(&self) -> u32 {
        self.active_tasks.load(Ordering::SeqCst)
    }

    /// 采样当前状态，心跳用
    async fn sample_status(&self) -> StatusMessage {
        let (cpu_usage, memory_usage) = {
            let mut system = self.system.lock().await;
            system.refresh_cpu_usage();
            system.refresh_memory();
            let cpu = system.global_cpu_usage() as f64;
            let memory = if system.total_memory() > 0 {
                system.used_memory() as f64 / system.total_memory() as f64 * 100.0
            } else {
                0.0
            };
            (cpu, memory)
        };

        let active = self.active_tasks.load(Ordering::SeqCst);
        StatusMessage {
            worker_id: self.worker_id.clone(),
            node_type: self.config.node_type.clone(),
            status: if active > 0 {
                WorkerStatus::Busy
            } else {
                WorkerStatus::Ready
            },
            cpu_usage,
            memory_usage,
            active_tasks: active,
            completed_tasks: self.success_tasks.load(Ordering::SeqCst),
            failed_tasks: self.failed_tasks.load(Ordering::SeqCst),
            last_heartbeat: Utc::now(),
            capabilities: self.registry.capabilities(),
        }
    }

    async fn send_heartbeat(&self) {
        let status = self.sample_status().await;
        if let Err(e) = self.queue.update_worker_status(&status).await {
            error!("更新节点状态失败: {}", e);
        } else {
            debug!(
                "发送心跳: worker_id={}, active={}, cpu={:.1}%",
                self.worker_id, status.active_tasks, status.cpu_usage
            );
        }
    }

    /// 执行单个任务，总是产出一条终态结果
    pub async fn execute_task(&self, task: &TaskMessage) -> ResultMessage {
        let crawler = match self.registry.resolve(task.crawler_kind) {
            Some(crawler) => crawler,
            None => {
                error!("未注册的爬虫类型: {:?}", task.crawler_kind);
                return ResultMessage::failed(
                    task.task_id.clone(),
                    self.worker_id.clone(),
                    format!("不支持的爬虫类型: {:?}", task.crawler_kind),
                );
            }
        };

        let timeout_seconds = if task.timeout_seconds > 0 {
            task.timeout_seconds
        } else {
            self.config.task_timeout_seconds
        };

        tokio::select! {
            crawl_result = crawler.crawl(task) => match crawl_result {
                Ok(crawl) if crawl.success => {
                    info!("任务执行成功: {} ({})", task.task_id, task.url);
                    let mut result = ResultMessage::success(
                        task.task_id.clone(),
                        self.worker_id.clone(),
                        crawl.status_code.unwrap_or(200),
                        crawl.content.unwrap_or_default(),
                        crawl.response_time.unwrap_or(0.0),
                    );
                    result.headers = crawl.headers;
                    result
                }
                Ok(crawl) => {
                    let error_message = crawl
                        .error
                        .unwrap_or_else(|| "抓取失败".to_string());
                    warn!("任务执行失败: {} - {}", task.task_id, error_message);
                    let mut result = ResultMessage::failed(
                        task.task_id.clone(),
                        self.worker_id.clone(),
                        error_message,
                    );
                    result.status_code = crawl.status_code;
                    result
                }
                Err(e) => {
                    error!("任务执行异常: {} - {}", task.task_id, e);
                    ResultMessage::failed(task.task_id.clone(), self.worker_id.clone(), e.to_string())
                }
            },
            _ = tokio::time::sleep(Duration::from_secs(timeout_seconds)) => {
                error!("任务执行超时: {} ({}s)", task.task_id, timeout_seconds);
                ResultMessage::timeout(task.task_id.clone(), self.worker_id.clone(), timeout_seconds)
            }
        }
    }

    /// 拉取一个任务并派发执行
    async fn poll_and_execute(&self) {
        if self.active_tasks.load(Ordering::SeqCst) >= self.config.max_concurrent_tasks {
            return;
        }

        let task = match self
            .queue
            .get_task(
                &self.worker_id,
                Duration::from_secs(self.config.poll_timeout_seconds),
            )
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                error!("获取任务失败: {}", e);
                return;
            }
        };

        self.active_tasks.fetch_add(1, Ordering::SeqCst);
        self.total_tasks.fetch_add(1, Ordering::SeqCst);

        let service = self.clone();
        tokio::spawn(async move {
            let result = service.execute_task(&task).await;

            if result.status == TaskStatus::Success {
                service.success_tasks.fetch_add(1, Ordering::SeqCst);
            } else {
                service.failed_tasks.fetch_add(1, Ordering::SeqCst);
            }

            if let Err(e) = service.queue.complete_task(&task.task_id, &result).await {
                error!("上报任务结果失败: {} - {}", task.task_id, e);
            }
            service.active_tasks.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// 启动工作节点
    pub async fn start(&self) -> Result<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            return Err(CrawlerError::Internal("工作节点已在运行".to_string()));
        }

        info!("启动工作节点: {} ({})", self.worker_id, self.hostname);

        self.queue
            .register_worker(
                &self.worker_id,
                &self.config.node_type,
                &self.registry.capabilities(),
            )
            .await?;
        self.send_heartbeat().await;

        let (shutdown_tx, _) = broadcast::channel(1);
        {
            let mut tx_guard = self.shutdown_tx.write().await;
            *tx_guard = Some(shutdown_tx.clone());
        }

        // 心跳循环
        let service = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_secs(
                service.config.heartbeat_interval_seconds.max(1),
            ));
            loop {
                tokio::select! {
                    _ = tick.tick() => service.send_heartbeat().await,
                    _ = shutdown_rx.recv() => {
                        info!("心跳循环收到停止信号");
                        break;
                    }
                }
            }
        });

        // 任务循环
        let service = self.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(Duration::from_millis(200));
            loop {
                tokio::select! {
                    _ = tick.tick() => service.poll_and_execute().await,
                    _ = shutdown_rx.recv() => {
                        info!("任务循环收到停止信号");
                        break;
                    }
                }
            }
        });

        *is_running = true;
        info!("工作节点已启动: {}", self.worker_id);
        Ok(())
    }

    /// 停止工作节点
    ///
    /// 先停止接收新任务，等待在途任务完成（有上限），
    /// 上报最终的stopped状态后释放注册表条目。
    pub async fn stop(&self) -> Result<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }
        info!("停止工作节点: {}", self.worker_id);

        {
            let tx_guard = self.shutdown_tx.read().await;
            if let Some(shutdown_tx) = tx_guard.as_ref() {
                let _ = shutdown_tx.send(());
            }
        }

        let mut waited = 0u64;
        while self.active_tasks.load(Ordering::SeqCst) > 0
            && waited < self.config.shutdown_drain_seconds
        {
            info!(
                "等待 {} 个任务完成...",
                self.active_tasks.load(Ordering::SeqCst)
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
            waited += 1;
        }

        let mut final_status = self.sample_status().await;
        final_status.status = WorkerStatus::Stopped;
        if let Err(e) = self.queue.update_worker_status(&final_status).await {
            warn!("上报停止状态失败: {}", e);
        }
        if let Err(e) = self.queue.unregister_worker(&self.worker_id).await {
            warn!("注销工作节点失败: {}", e);
        }

        *is_running = false;
        info!("工作节点已停止: {}", self.worker_id);
        Ok(())
    }
}

impl Clone for WorkerService {
    fn clone(&self) -> Self {
        Self {
            worker_id: self.worker_id.clone(),
            queue: Arc::clone(&self.queue),
            config: self.config.clone(),
            registry: Arc::clone(&self.registry),
            hostname: self.hostname.clone(),
            active_tasks: Arc::clone(&self.active_tasks),
            total_tasks: Arc::clone(&self.total_tasks),
            success_tasks: Arc::clone(&self.success_tasks),
            failed_tasks: Arc::clone(&self.failed_tasks),
            system: Arc::clone(&self.system),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            is_running: Arc::clone(&self.is_running),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crawler_core::models::{CrawlResult, Priority};
    use crawler_core::QueueConfig;
    use crawler_queue::InMemoryTaskQueue;

    /// 行为可配置的假爬虫
    struct StubCrawler {
        behavior: StubBehavior,
    }

    enum StubBehavior {
        Succeed,
        Fail,
        Hang,
    }

    #[async_trait]
    impl Crawler for StubCrawler {
        fn name(&self) -> &str {
            "stub"
        }

        async fn crawl(&self, task: &TaskMessage) -> crawler_core::Result<CrawlResult> {
            match self.behavior {
                StubBehavior::Succeed => {
                    let mut result = CrawlResult::pending(&task.url);
                    result.success = true;
                    result.status_code = Some(200);
                    result.content = Some("<html>ok</html>".to_string());
                    result.response_time = Some(0.05);
                    Ok(result)
                }
                StubBehavior::Fail => Ok(CrawlResult::failure(&task.url, "connection refused")),
                StubBehavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
            }
        }
    }

    fn queue() -> Arc<InMemoryTaskQueue> {
        Arc::new(InMemoryTaskQueue::new(QueueConfig {
            auto_retry: false,
            ..QueueConfig::default()
        }))
    }

    fn worker(
        queue: Arc<InMemoryTaskQueue>,
        behavior: StubBehavior,
        config: WorkerConfig,
    ) -> WorkerService {
        WorkerService::builder("worker-001".to_string(), queue, config)
            .register_crawler(CrawlerKind::Stealth, Arc::new(StubCrawler { behavior }))
            .build()
            .unwrap()
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_timeout_seconds: 1,
            heartbeat_interval_seconds: 1,
            shutdown_drain_seconds: 5,
            ..WorkerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_builder_requires_a_crawler() {
        let result = WorkerService::builder(
            "w".to_string(),
            queue() as Arc<dyn TaskQueue>,
            WorkerConfig::default(),
        )
        .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_execute_task_success() {
        let queue = queue();
        let service = worker(Arc::clone(&queue), StubBehavior::Succeed, fast_config());

        let task = TaskMessage::new("https://example.com", Priority::Normal);
        let result = service.execute_task(&task).await;
        assert_eq!(result.status, TaskStatus::Success);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.worker_id, "worker-001");
    }

    #[tokio::test]
    async fn test_execute_task_failure_carries_error() {
        let queue = queue();
        let service = worker(Arc::clone(&queue), StubBehavior::Fail, fast_config());

        let task = TaskMessage::new("https://example.com", Priority::Normal);
        let result = service.execute_task(&task).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_message.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_execute_task_timeout() {
        let queue = queue();
        let service = worker(Arc::clone(&queue), StubBehavior::Hang, fast_config());

        let mut task = TaskMessage::new("https://example.com", Priority::Normal);
        task.timeout_seconds = 1;
        let result = service.execute_task(&task).await;
        assert_eq!(result.status, TaskStatus::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_crawler_kind_fails_attempt() {
        let queue = queue();
        let service = worker(Arc::clone(&queue), StubBehavior::Succeed, fast_config());

        let mut task = TaskMessage::new("https://example.com", Priority::Normal);
        task.crawler_kind = CrawlerKind::Http;
        let result = service.execute_task(&task).await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.error_message.unwrap().contains("Http"));
    }

    #[tokio::test]
    async fn test_worker_processes_queue_end_to_end() {
        let queue = queue();
        let service = worker(Arc::clone(&queue), StubBehavior::Succeed, fast_config());

        service.start().await.unwrap();

        let task = TaskMessage::new("https://example.com/page", Priority::High);
        queue.add_task(&task, true).await.unwrap();

        // 等任务被拉取并执行完
        let mut results = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            results = queue.poll_results(10).await.unwrap();
            if !results.is_empty() {
                break;
            }
        }
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TaskStatus::Success);
        assert_eq!(results[0].task_id, task.task_id);

        service.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_reports_stopped_and_releases_registry() {
        let queue = queue();
        let service = worker(Arc::clone(&queue), StubBehavior::Succeed, fast_config());

        service.start().await.unwrap();
        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.active_workers, 1);

        service.stop().await.unwrap();
        let stats = queue.get_queue_stats().await.unwrap();
        assert_eq!(stats.active_workers, 0);

        // 状态流里能看到最终的stopped状态
        let messages = queue.poll_status_messages(100).await.unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.status, WorkerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_sample_status_reports_capabilities() {
        let queue = queue();
        let service = worker(Arc::clone(&queue), StubBehavior::Succeed, fast_config());
        let status = service.sample_status().await;
        assert_eq!(status.worker_id, "worker-001");
        assert_eq!(status.capabilities, vec!["stub"]);
        assert!(status.cpu_usage >= 0.0);
        assert_eq!(status.status, WorkerStatus::Ready);
    }
}
