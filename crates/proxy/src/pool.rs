use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crawler_core::models::{ProxyInfo, ProxyStatus};
use crawler_core::{ProxyPoolConfig, Result};

use crate::providers::ProxyProvider;
use crate::rotator::{ProxyRotator, RotationStrategy, SelectionContext};
use crate::validator::{validate_batch, ProxyCheck};

/// 代理池统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub total_proxies: usize,
    pub active_proxies: usize,
    pub failed_proxies: usize,
    pub banned_proxies: usize,
    pub providers: Vec<String>,
}

struct PoolInner {
    proxies: Vec<ProxyInfo>,
    last_refresh: Option<Instant>,
}

/// 代理池构建器
pub struct ProxyPoolBuilder {
    config: ProxyPoolConfig,
    providers: Vec<Arc<dyn ProxyProvider>>,
    checker: Option<Arc<dyn ProxyCheck>>,
}

impl ProxyPoolBuilder {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            config,
            providers: Vec::new(),
            checker: None,
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn ProxyProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn with_checker(mut self, checker: Arc<dyn ProxyCheck>) -> Self {
        self.checker = Some(checker);
        self
    }

    pub fn build(self) -> Result<ProxyPool> {
        let strategy = RotationStrategy::from_str(&self.config.rotation_strategy)?;
        let checker = self.checker.ok_or_else(|| {
            crawler_core::CrawlerError::Configuration("代理池缺少验证器".to_string())
        })?;

        Ok(ProxyPool {
            config: self.config,
            providers: self.providers,
            checker,
            inner: RwLock::new(PoolInner {
                proxies: Vec::new(),
                last_refresh: None,
            }),
            rotator: Mutex::new(ProxyRotator::new(strategy)),
            shutdown_tx: Mutex::new(None),
        })
    }
}

/// 代理池
///
/// 独占持有存活代理集合。消费方通过get_proxy借出快照，
/// 用record_usage回报结果，所有状态改写都发生在池内部。
pub struct ProxyPool {
    config: ProxyPoolConfig,
    providers: Vec<Arc<dyn ProxyProvider>>,
    checker: Arc<dyn ProxyCheck>,
    inner: RwLock<PoolInner>,
    rotator: Mutex<ProxyRotator>,
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
}

impl ProxyPool {
    pub fn builder(config: ProxyPoolConfig) -> ProxyPoolBuilder {
        ProxyPoolBuilder::new(config)
    }

    /// 刷新代理池：并发拉取所有提供者，去重后批量验证
    pub async fn refresh_proxies(&self, force: bool) -> Result<usize> {
        {
            let inner = self.inner.read().await;
            if !force {
                if let Some(last_refresh) = inner.last_refresh {
                    if last_refresh.elapsed()
                        < Duration::from_secs(self.config.refresh_interval_seconds)
                    {
                        return Ok(inner.proxies.len());
                    }
                }
            }
        }

        info!("开始刷新代理池...");
        let fetches = self.providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            let limit = self.config.max_proxies;
            async move {
                match provider.fetch_proxies(limit).await {
                    Ok(proxies) => proxies,
                    Err(e) => {
                        error!("从 {} 获取代理失败: {}", provider.name(), e);
                        Vec::new()
                    }
                }
            }
        });
        let fetched: Vec<Vec<ProxyInfo>> = futures::future::join_all(fetches).await;

        let mut seen = std::collections::HashSet::new();
        let candidates: Vec<ProxyInfo> = fetched
            .into_iter()
            .flatten()
            .filter(|proxy| seen.insert(proxy.key()))
            .collect();
        debug!("去重后共 {} 个候选代理", candidates.len());

        let mut valid = validate_batch(
            Arc::clone(&self.checker),
            candidates,
            self.config.validator.concurrent_limit,
        )
        .await;
        valid.truncate(self.config.max_proxies);

        let count = valid.len();
        {
            let mut inner = self.inner.write().await;
            inner.proxies = valid;
            inner.last_refresh = Some(Instant::now());
        }
        info!("代理池刷新完成: {} 个可用代理", count);
        Ok(count)
    }

    /// 借出一个代理快照，没有可用代理时返回None
    pub async fn get_proxy(&self, ctx: &SelectionContext) -> Option<ProxyInfo> {
        let inner = self.inner.read().await;
        let candidates: Vec<ProxyInfo> = inner
            .proxies
            .iter()
            .filter(|proxy| proxy.status == ProxyStatus::Active)
            .cloned()
            .collect();
        drop(inner);

        if candidates.is_empty() {
            return None;
        }
        let mut rotator = self.rotator.lock().await;
        rotator.select(&candidates, ctx)
    }

    /// 回报一次使用结果
    pub async fn record_usage(&self, proxy_key: &str, success: bool, response_time: Option<f64>) {
        {
            let mut inner = self.inner.write().await;
            if let Some(proxy) = inner.proxies.iter_mut().find(|p| p.key() == proxy_key) {
                proxy.record_result(success, response_time);
                if proxy.status == ProxyStatus::Banned {
                    warn!("代理已被标记为banned: {}", proxy_key);
                }
            }
        }
        let mut rotator = self.rotator.lock().await;
        rotator.record_usage(proxy_key, success, response_time);
    }

    /// 清理失效和被封禁的代理
    pub async fn cleanup_failed(&self) -> usize {
        let mut inner = self.inner.write().await;
        let before = inner.proxies.len();
        inner.proxies.retain(|proxy| {
            !matches!(proxy.status, ProxyStatus::Failed | ProxyStatus::Banned)
        });
        let removed = before - inner.proxies.len();
        if removed > 0 {
            info!("清理了 {} 个失效代理", removed);
        }
        removed
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.read().await;
        PoolStats {
            total_proxies: inner.proxies.len(),
            active_proxies: inner
                .proxies
                .iter()
                .filter(|p| p.status == ProxyStatus::Active)
                .count(),
            failed_proxies: inner
                .proxies
                .iter()
                .filter(|p| p.status == ProxyStatus::Failed)
                .count(),
            banned_proxies: inner
                .proxies
                .iter()
                .filter(|p| p.status == ProxyStatus::Banned)
                .count(),
            providers: self.providers.iter().map(|p| p.name().to_string()).collect(),
        }
    }

    /// 启动后台刷新循环
    pub async fn start(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        {
            let mut tx_guard = self.shutdown_tx.lock().await;
            *tx_guard = Some(shutdown_tx);
        }

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                pool.config.refresh_interval_seconds.max(1),
            ));
            // 第一次tick立即返回，先完成一次初始填充
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = pool.refresh_proxies(false).await {
                            error!("代理池刷新失败: {}", e);
                        }
                        pool.cleanup_failed().await;
                    }
                    _ = shutdown_rx.recv() => {
                        info!("代理池刷新循环收到停止信号");
                        break;
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        let tx_guard = self.shutdown_tx.lock().await;
        if let Some(shutdown_tx) = tx_guard.as_ref() {
            let _ = shutdown_tx.send(());
        }
    }

    /// 直接注入代理（测试和静态配置用）
    pub async fn add_proxies(&self, proxies: Vec<ProxyInfo>) {
        let mut inner = self.inner.write().await;
        let mut seen: std::collections::HashSet<String> =
            inner.proxies.iter().map(|p| p.key()).collect();
        for proxy in proxies {
            if seen.insert(proxy.key()) {
                inner.proxies.push(proxy);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crawler_core::models::ProxyType;
    use crawler_core::ValidatorConfig;

    struct StaticProvider {
        proxies: Vec<ProxyInfo>,
    }

    #[async_trait]
    impl ProxyProvider for StaticProvider {
        fn name(&self) -> &str {
            "static"
        }

        async fn fetch_proxies(&self, _limit: usize) -> Result<Vec<ProxyInfo>> {
            Ok(self.proxies.clone())
        }
    }

    /// 按主机名单决定验证结果的假验证器
    struct StubCheck {
        valid_hosts: Vec<String>,
    }

    #[async_trait]
    impl ProxyCheck for StubCheck {
        async fn validate(&self, proxy: &mut ProxyInfo) -> bool {
            if self.valid_hosts.contains(&proxy.host) {
                proxy.record_result(true, Some(0.2));
                proxy.status = ProxyStatus::Active;
                true
            } else {
                proxy.status = ProxyStatus::Failed;
                false
            }
        }
    }

    fn pool_config() -> ProxyPoolConfig {
        ProxyPoolConfig {
            rotation_strategy: "round_robin".to_string(),
            validator: ValidatorConfig {
                concurrent_limit: 4,
                ..ValidatorConfig::default()
            },
            ..ProxyPoolConfig::default()
        }
    }

    fn build_pool(valid_hosts: Vec<&str>, candidates: Vec<ProxyInfo>) -> ProxyPool {
        ProxyPool::builder(pool_config())
            .with_provider(Arc::new(StaticProvider { proxies: candidates }))
            .with_checker(Arc::new(StubCheck {
                valid_hosts: valid_hosts.into_iter().map(String::from).collect(),
            }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_failed_validation_excludes_proxy() {
        let pool = build_pool(
            vec!["1.1.1.1"],
            vec![
                ProxyInfo::new("1.1.1.1", 80, ProxyType::Http),
                ProxyInfo::new("2.2.2.2", 80, ProxyType::Http),
            ],
        );

        let count = pool.refresh_proxies(true).await.unwrap();
        assert_eq!(count, 1);

        // 验证失败的代理永远不会被借出
        for _ in 0..10 {
            let proxy = pool.get_proxy(&SelectionContext::default()).await.unwrap();
            assert_eq!(proxy.host, "1.1.1.1");
        }
    }

    #[tokio::test]
    async fn test_empty_pool_returns_none() {
        let pool = build_pool(vec![], vec![ProxyInfo::new("2.2.2.2", 80, ProxyType::Http)]);
        pool.refresh_proxies(true).await.unwrap();
        assert!(pool.get_proxy(&SelectionContext::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_usage_triggers_cooldown() {
        let pool = build_pool(
            vec!["1.1.1.1"],
            vec![ProxyInfo::new("1.1.1.1", 80, ProxyType::Http)],
        );
        pool.refresh_proxies(true).await.unwrap();

        let proxy = pool.get_proxy(&SelectionContext::default()).await.unwrap();
        pool.record_usage(&proxy.key(), false, None).await;

        // 冷却窗口内这个唯一的代理不可用
        assert!(pool.get_proxy(&SelectionContext::default()).await.is_none());
    }

    #[tokio::test]
    async fn test_refresh_respects_interval() {
        let pool = build_pool(
            vec!["1.1.1.1"],
            vec![ProxyInfo::new("1.1.1.1", 80, ProxyType::Http)],
        );
        pool.refresh_proxies(true).await.unwrap();

        // 间隔未到时不触发新的拉取，直接返回当前数量
        let count = pool.refresh_proxies(false).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_cleanup_failed_removes_dead_proxies() {
        let pool = build_pool(
            vec!["1.1.1.1"],
            vec![ProxyInfo::new("1.1.1.1", 80, ProxyType::Http)],
        );
        pool.refresh_proxies(true).await.unwrap();

        // 连续失败把代理打成Failed
        for _ in 0..3 {
            pool.record_usage("1.1.1.1:80", false, None).await;
        }
        let removed = pool.cleanup_failed().await;
        assert_eq!(removed, 1);

        let stats = pool.stats().await;
        assert_eq!(stats.total_proxies, 0);
    }

    #[tokio::test]
    async fn test_stats_reflect_statuses() {
        let pool = build_pool(
            vec!["1.1.1.1", "2.2.2.2"],
            vec![
                ProxyInfo::new("1.1.1.1", 80, ProxyType::Http),
                ProxyInfo::new("2.2.2.2", 80, ProxyType::Http),
            ],
        );
        pool.refresh_proxies(true).await.unwrap();

        let stats = pool.stats().await;
        assert_eq!(stats.total_proxies, 2);
        assert_eq!(stats.active_proxies, 2);
        assert_eq!(stats.providers, vec!["static".to_string()]);
    }

    #[tokio::test]
    async fn test_add_proxies_deduplicates() {
        let pool = build_pool(vec![], vec![]);
        let mut proxy = ProxyInfo::new("9.9.9.9", 80, ProxyType::Http);
        proxy.status = ProxyStatus::Active;
        pool.add_proxies(vec![proxy.clone(), proxy.clone()]).await;
        let stats = pool.stats().await;
        assert_eq!(stats.total_proxies, 1);
    }
}
