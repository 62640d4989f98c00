use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::info;

use crawler_core::models::CrawlerKind;
use crawler_core::{AppConfig, TaskQueue};
use crawler_dispatcher::TaskScheduler;
use crawler_proxy::{
    FreeProxyProvider, LocalFileProvider, PremiumProxyProvider, ProxyPool, ProxyValidator,
    TorProvider,
};
use crawler_queue::RedisTaskQueue;
use crawler_stealth::{AccessController, HttpCrawler, StealthCrawler};
use crawler_worker::WorkerService;

/// 应用运行模式
#[derive(Debug, Clone)]
pub enum AppMode {
    /// 仅运行调度器
    Scheduler,
    /// 仅运行工作节点
    Worker,
    /// 运行所有组件
    All,
}

/// 主应用程序
///
/// 所有组件在这里一次性构造并显式注入，没有全局单例。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    node_id: String,
    queue: Arc<dyn TaskQueue>,
}

impl Application {
    /// 创建应用实例，后端存储不可达时启动失败
    pub async fn new(config: AppConfig, mode: AppMode, node_id: Option<String>) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);

        let queue = RedisTaskQueue::connect(&config.redis, config.queue.clone())
            .await
            .context("连接后端存储失败")?;

        let node_id = node_id.unwrap_or_else(|| {
            let host = hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string();
            format!("worker-{}-{}", host, std::process::id())
        });

        Ok(Self {
            config,
            mode,
            node_id,
            queue: Arc::new(queue),
        })
    }

    /// 运行应用程序直到收到关闭信号
    pub async fn run(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {:?}", self.mode);

        match self.mode {
            AppMode::Scheduler => self.run_scheduler(shutdown_rx).await,
            AppMode::Worker => self.run_worker(shutdown_rx).await,
            AppMode::All => self.run_all(shutdown_rx).await,
        }
    }

    async fn run_scheduler(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动调度器服务");
        let scheduler =
            TaskScheduler::new(Arc::clone(&self.queue), self.config.scheduler.clone())?;
        scheduler.start().await?;

        let _ = shutdown_rx.recv().await;
        scheduler.stop().await;
        Ok(())
    }

    async fn run_worker(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("启动工作节点服务: {}", self.node_id);

        let pool = self.build_proxy_pool()?;
        if let Some(pool) = &pool {
            pool.start().await;
        }

        let access = Arc::new(AccessController::new(self.config.access.clone()));
        let stealth_crawler = Arc::new(StealthCrawler::new(
            self.config.stealth.clone(),
            Arc::clone(&access),
            pool.clone(),
        ));
        let http_crawler = Arc::new(HttpCrawler::new(
            &self.config.stealth,
            Arc::clone(&access),
            pool.clone(),
        ));

        let worker = WorkerService::builder(
            self.node_id.clone(),
            Arc::clone(&self.queue),
            self.config.worker.clone(),
        )
        .register_crawler(CrawlerKind::Stealth, stealth_crawler)
        .register_crawler(CrawlerKind::Http, http_crawler)
        .build()?;

        worker.start().await?;

        let _ = shutdown_rx.recv().await;
        worker.stop().await?;
        if let Some(pool) = &pool {
            pool.stop().await;
        }
        Ok(())
    }

    async fn run_all(&self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        info!("以单进程模式启动全部组件");

        let scheduler_rx = shutdown_rx.resubscribe();
        let worker_rx = shutdown_rx.resubscribe();

        let scheduler = self.run_scheduler(scheduler_rx);
        let worker = self.run_worker(worker_rx);
        let (scheduler_result, worker_result) = tokio::join!(scheduler, worker);
        scheduler_result?;
        worker_result?;
        Ok(())
    }

    /// 按配置组装代理池
    fn build_proxy_pool(&self) -> Result<Option<Arc<ProxyPool>>> {
        let pool_config = &self.config.proxy_pool;
        if !pool_config.enabled {
            info!("代理池被禁用，使用直连");
            return Ok(None);
        }

        let mut builder = ProxyPool::builder(pool_config.clone())
            .with_checker(Arc::new(ProxyValidator::new(pool_config.validator.clone())));

        if pool_config.use_free_providers {
            builder = builder.with_provider(Arc::new(FreeProxyProvider::new()));
        }
        for premium in &pool_config.premium_providers {
            builder = builder.with_provider(Arc::new(PremiumProxyProvider::new(premium.clone())));
        }
        if let Some(path) = &pool_config.local_proxy_file {
            builder = builder.with_provider(Arc::new(LocalFileProvider::new(path.clone())));
        }
        if pool_config.tor.enabled {
            builder = builder.with_provider(Arc::new(TorProvider::new(pool_config.tor.clone())));
        }

        Ok(Some(Arc::new(builder.build()?)))
    }
}
