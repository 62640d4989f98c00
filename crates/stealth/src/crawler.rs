use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crawler_core::models::{CrawlResult, TaskMessage};
use crawler_core::{Crawler, Result, StealthConfig};
use crawler_proxy::{ProxyPool, SelectionContext};

use crate::access::AccessController;
use crate::browser::{BrowserManager, PageFetcher};
use crate::client::HttpClient;
use crate::detection::{detect, DetectionKind};

#[derive(Debug, Clone, Default, Serialize)]
pub struct CrawlStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub fallback_uses: u64,
    pub anti_crawler_detections: u64,
}

/// Stealth爬虫
///
/// 主路径是绑定代理的无头浏览器，对每次响应做反爬虫签名检查，
/// 按检测类别执行缓解动作后重试；浏览器路径全部失败后可降级
/// 到纯HTTP客户端。普通抓取失败不抛错，结果里带错误信息。
pub struct StealthCrawler {
    config: StealthConfig,
    fetcher: Arc<dyn PageFetcher>,
    pool: Option<Arc<ProxyPool>>,
    access: Arc<AccessController>,
    fallback: Option<HttpClient>,
    stats: Mutex<CrawlStats>,
}

impl StealthCrawler {
    pub fn new(
        config: StealthConfig,
        access: Arc<AccessController>,
        pool: Option<Arc<ProxyPool>>,
    ) -> Self {
        let fetcher = Arc::new(BrowserManager::new(config.clone()));
        Self::with_fetcher(config, access, pool, fetcher)
    }

    /// 用自定义的页面抓取实现构造（测试注入用）
    pub fn with_fetcher(
        config: StealthConfig,
        access: Arc<AccessController>,
        pool: Option<Arc<ProxyPool>>,
        fetcher: Arc<dyn PageFetcher>,
    ) -> Self {
        let fallback = if config.use_fallback {
            Some(HttpClient::new(&config, pool.clone()))
        } else {
            None
        };
        Self {
            config,
            fetcher,
            pool,
            access,
            fallback,
            stats: Mutex::new(CrawlStats::default()),
        }
    }

    /// 按检测类别执行缓解动作，返回下次尝试是否要模拟人工交互
    async fn mitigate(&self, kind: DetectionKind, proxy_key: Option<&str>) -> bool {
        match kind {
            DetectionKind::RateLimit => {
                let wait = rand::rng().random_range(10.0..30.0);
                info!("检测到频率限制，等待 {:.1}s 并轮换代理...", wait);
                if let (Some(pool), Some(key)) = (&self.pool, proxy_key) {
                    pool.record_usage(key, false, None).await;
                }
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                false
            }
            DetectionKind::Blocked => {
                info!("检测到IP封禁，轮换代理...");
                if let (Some(pool), Some(key)) = (&self.pool, proxy_key) {
                    pool.record_usage(key, false, None).await;
                }
                false
            }
            DetectionKind::Challenge => {
                info!("检测到挑战页，等待验证完成...");
                tokio::time::sleep(Duration::from_secs(5)).await;
                false
            }
            DetectionKind::BotDetection => {
                info!("检测到机器人识别，下次尝试模拟人工交互");
                true
            }
            // 验证码不自动求解，调用方直接终止
            DetectionKind::Captcha => false,
        }
    }

    /// 爬取单个URL
    pub async fn crawl_url(&self, url: &str) -> CrawlResult {
        let start = Instant::now();
        {
            let mut stats = self.stats.lock().await;
            stats.total_requests += 1;
        }

        let ctx = SelectionContext {
            target_domain: Some(AccessController::domain_key(url)),
            ..SelectionContext::default()
        };

        let mut result = CrawlResult::pending(url);
        let mut simulate_human = false;

        for attempt in 0..=self.config.max_retries {
            result.retry_count = attempt;

            self.access.wait_before_request(url).await;

            let proxy = match &self.pool {
                Some(pool) => pool.get_proxy(&ctx).await,
                None => None,
            };
            let proxy_key = proxy.as_ref().map(|p| p.key());
            let proxy_url = proxy.as_ref().map(|p| p.proxy_url());

            let attempt_start = Instant::now();
            let fetched = self
                .fetcher
                .fetch(url, proxy_url.clone(), simulate_human)
                .await;
            let attempt_time = attempt_start.elapsed().as_secs_f64();
            self.access.record_access(url, attempt_time);

            match fetched {
                Ok(page) => {
                    match detect(&page.content, 200, &result.headers) {
                        None => {
                            if let (Some(pool), Some(key)) = (&self.pool, &proxy_key) {
                                pool.record_usage(key, true, Some(attempt_time)).await;
                            }
                            result.success = true;
                            result.content = Some(page.content);
                            result.status_code = Some(200);
                            result.stealth_applied = self.config.enable_stealth;
                            result.proxy_used = proxy_key.clone();
                            result.error = None;
                            break;
                        }
                        Some(kind) => {
                            {
                                let mut stats = self.stats.lock().await;
                                stats.anti_crawler_detections += 1;
                            }
                            info!("检测到反爬虫机制: {:?}", kind);
                            result.error = Some(format!("检测到反爬虫机制: {kind:?}"));

                            if !kind.is_recoverable() {
                                warn!("验证码需要人工处理，终止尝试: {}", url);
                                break;
                            }
                            if attempt < self.config.max_retries {
                                simulate_human =
                                    self.mitigate(kind, proxy_key.as_deref()).await || simulate_human;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("浏览器爬取失败 (尝试 {}): {}", attempt + 1, e);
                    if let (Some(pool), Some(key)) = (&self.pool, &proxy_key) {
                        pool.record_usage(key, false, None).await;
                    }
                    result.error = Some(e.to_string());
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(Duration::from_secs(
                            self.config.retry_delay_seconds * (attempt as u64 + 1),
                        ))
                        .await;
                    }
                }
            }
        }

        // 浏览器路径失败后的纯HTTP兜底
        if !result.success {
            if let Some(fallback) = &self.fallback {
                debug!("浏览器路径失败，尝试HTTP兜底: {}", url);
                match fallback.get(url).await {
                    Ok(response) => {
                        let mut stats = self.stats.lock().await;
                        stats.fallback_uses += 1;
                        drop(stats);

                        result.success = response.status_code < 400;
                        result.status_code = Some(response.status_code);
                        result.headers = response.headers;
                        result.content = Some(response.body);
                        result.stealth_applied = false;
                        if result.success {
                            result.error = None;
                        }
                    }
                    Err(e) => {
                        warn!("HTTP兜底同样失败: {}", e);
                        if result.error.is_none() {
                            result.error = Some(e.to_string());
                        }
                    }
                }
            }
        }

        result.response_time = Some(start.elapsed().as_secs_f64());
        {
            let mut stats = self.stats.lock().await;
            if result.success {
                stats.successful_requests += 1;
            } else {
                stats.failed_requests += 1;
            }
        }
        result
    }

    pub async fn stats(&self) -> CrawlStats {
        self.stats.lock().await.clone()
    }
}

#[async_trait]
impl Crawler for StealthCrawler {
    fn name(&self) -> &str {
        "stealth"
    }

    async fn crawl(&self, task: &TaskMessage) -> Result<CrawlResult> {
        Ok(self.crawl_url(&task.url).await)
    }
}

/// 纯HTTP爬虫
///
/// 不经过浏览器，适合接口型目标。
pub struct HttpCrawler {
    client: HttpClient,
    access: Arc<AccessController>,
}

impl HttpCrawler {
    pub fn new(
        config: &StealthConfig,
        access: Arc<AccessController>,
        pool: Option<Arc<ProxyPool>>,
    ) -> Self {
        Self {
            client: HttpClient::new(config, pool),
            access,
        }
    }
}

#[async_trait]
impl Crawler for HttpCrawler {
    fn name(&self) -> &str {
        "http"
    }

    async fn crawl(&self, task: &TaskMessage) -> Result<CrawlResult> {
        self.access.wait_before_request(&task.url).await;

        let start = Instant::now();
        let mut result = CrawlResult::pending(&task.url);
        match self.client.get(&task.url).await {
            Ok(response) => {
                self.access.record_access(&task.url, response.response_time);
                result.success = response.status_code < 400;
                result.status_code = Some(response.status_code);
                result.headers = response.headers;
                result.content = Some(response.body);
                result.response_time = Some(response.response_time);
            }
            Err(e) => {
                self.access
                    .record_access(&task.url, start.elapsed().as_secs_f64());
                result.error = Some(e.to_string());
                result.response_time = Some(start.elapsed().as_secs_f64());
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::PageFetch;
    use crawler_core::AccessConfig;
    use std::sync::Mutex as StdMutex;

    /// 按脚本回放的假页面抓取器，记录每次调用的simulate_human标记
    struct ScriptedFetcher {
        pages: Vec<Result<PageFetch>>,
        calls: StdMutex<Vec<bool>>,
    }

    impl ScriptedFetcher {
        fn new(pages: Vec<Result<PageFetch>>) -> Self {
            Self {
                pages,
                calls: StdMutex::new(Vec::new()),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PageFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            url: &str,
            _proxy_url: Option<String>,
            simulate_human: bool,
        ) -> Result<PageFetch> {
            let mut calls = self.calls.lock().unwrap();
            let index = calls.len().min(self.pages.len() - 1);
            calls.push(simulate_human);
            match &self.pages[index] {
                Ok(page) => Ok(page.clone()),
                Err(_) => Err(crawler_core::CrawlerError::Browser(format!(
                    "fetch failed: {url}"
                ))),
            }
        }
    }

    fn page(content: &str) -> Result<PageFetch> {
        Ok(PageFetch {
            content: content.to_string(),
            final_url: "https://example.com/".to_string(),
        })
    }

    fn fast_config(max_retries: u32) -> StealthConfig {
        StealthConfig {
            max_retries,
            retry_delay_seconds: 0,
            use_fallback: false,
            ..StealthConfig::default()
        }
    }

    fn fast_access() -> Arc<AccessController> {
        Arc::new(AccessController::new(AccessConfig {
            min_delay: 0.0,
            max_delay: 0.0,
            adaptive_delay: false,
        }))
    }

    fn crawler(fetcher: Arc<ScriptedFetcher>, max_retries: u32) -> StealthCrawler {
        StealthCrawler::with_fetcher(fast_config(max_retries), fast_access(), None, fetcher)
    }

    #[tokio::test]
    async fn test_clean_page_succeeds_first_try() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![page("<html>ok</html>")]));
        let crawler = crawler(Arc::clone(&fetcher), 3);

        let result = crawler.crawl_url("https://example.com/").await;
        assert!(result.success);
        assert!(result.stealth_applied);
        assert_eq!(result.retry_count, 0);
        assert_eq!(fetcher.call_count(), 1);

        let stats = crawler.stats().await;
        assert_eq!(stats.successful_requests, 1);
        assert_eq!(stats.anti_crawler_detections, 0);
    }

    #[tokio::test]
    async fn test_captcha_aborts_without_retry() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![page(
            "please solve the captcha to continue",
        )]));
        let crawler = crawler(Arc::clone(&fetcher), 3);

        let result = crawler.crawl_url("https://example.com/").await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Captcha"));
        // 验证码是不可恢复的，没有第二次尝试
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn test_bot_detection_enables_human_simulation() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![
            page("suspicious activity detected"),
            page("<html>welcome back</html>"),
        ]));
        let crawler = crawler(Arc::clone(&fetcher), 3);

        let result = crawler.crawl_url("https://example.com/").await;
        assert!(result.success);
        assert_eq!(result.retry_count, 1);

        let calls = fetcher.calls.lock().unwrap().clone();
        assert_eq!(calls, vec![false, true]);

        let stats = crawler.stats().await;
        assert_eq!(stats.anti_crawler_detections, 1);
    }

    #[tokio::test]
    async fn test_browser_errors_exhaust_retries() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(
            crawler_core::CrawlerError::Browser("boom".to_string()),
        )]));
        let crawler = crawler(Arc::clone(&fetcher), 2);

        let result = crawler.crawl_url("https://example.com/").await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert_eq!(fetcher.call_count(), 3);
        assert_eq!(result.retry_count, 2);

        let stats = crawler.stats().await;
        assert_eq!(stats.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_crawler_trait_never_errors_on_fetch_failure() {
        let fetcher = Arc::new(ScriptedFetcher::new(vec![Err(
            crawler_core::CrawlerError::Browser("boom".to_string()),
        )]));
        let crawler = crawler(fetcher, 0);

        let task = TaskMessage::new("https://example.com/", crawler_core::Priority::Normal);
        let result = crawler.crawl(&task).await.unwrap();
        assert!(!result.success);
    }
}
