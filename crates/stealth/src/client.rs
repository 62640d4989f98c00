use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crawler_core::{CrawlerError, Result, StealthConfig};
use crawler_proxy::{ProxyPool, SelectionContext};

use crate::access::AccessController;

/// 浏览器式的默认请求头
fn default_headers() -> HeaderMap {
    let pairs = [
        (
            "User-Agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/122.0.0.0 Safari/537.36",
        ),
        (
            "Accept",
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8",
        ),
        ("Accept-Language", "zh-CN,zh;q=0.9,en;q=0.8"),
        ("Connection", "keep-alive"),
        ("Upgrade-Insecure-Requests", "1"),
    ];
    let mut headers = HeaderMap::new();
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    }
    headers
}

/// 一次HTTP抓取的响应
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
    pub response_time: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub proxy_requests: u64,
    pub direct_requests: u64,
    pub retry_count: u64,
}

/// 纯HTTP爬取客户端
///
/// 浏览器路径的兜底实现，同样走代理池轮换，每次失败后
/// 换一个出口重试。
pub struct HttpClient {
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
    pool: Option<Arc<ProxyPool>>,
    stats: Mutex<ClientStats>,
}

impl HttpClient {
    pub fn new(config: &StealthConfig, pool: Option<Arc<ProxyPool>>) -> Self {
        Self {
            timeout: Duration::from_secs(config.navigation_timeout_seconds),
            max_retries: config.max_retries,
            retry_delay: Duration::from_secs(config.retry_delay_seconds),
            pool,
            stats: Mutex::new(ClientStats::default()),
        }
    }

    fn build_client(&self, proxy_url: Option<&str>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.timeout)
            .default_headers(default_headers())
            .cookie_store(true)
            .gzip(true);

        if let Some(proxy_url) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| CrawlerError::InvalidProxy(format!("{proxy_url}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| CrawlerError::Network(e.to_string()))
    }

    /// GET抓取，失败时轮换代理重试
    pub async fn get(&self, url: &str) -> Result<FetchResponse> {
        {
            let mut stats = self.stats.lock().await;
            stats.total_requests += 1;
        }

        let ctx = SelectionContext {
            target_domain: Some(AccessController::domain_key(url)),
            ..SelectionContext::default()
        };

        let mut last_error = CrawlerError::Network("no attempt made".to_string());
        for attempt in 0..=self.max_retries {
            let proxy = match &self.pool {
                Some(pool) => pool.get_proxy(&ctx).await,
                None => None,
            };
            let proxy_url = proxy.as_ref().map(|p| p.proxy_url());

            {
                let mut stats = self.stats.lock().await;
                if proxy.is_some() {
                    stats.proxy_requests += 1;
                } else {
                    stats.direct_requests += 1;
                }
                if attempt > 0 {
                    stats.retry_count += 1;
                }
            }

            let client = self.build_client(proxy_url.as_deref())?;
            let start = Instant::now();
            match client.get(url).send().await {
                Ok(response) => {
                    let response_time = start.elapsed().as_secs_f64();
                    let status_code = response.status().as_u16();
                    let headers = response
                        .headers()
                        .iter()
                        .map(|(k, v)| {
                            (
                                k.to_string(),
                                v.to_str().unwrap_or_default().to_string(),
                            )
                        })
                        .collect();
                    let body = response
                        .text()
                        .await
                        .map_err(|e| CrawlerError::Network(e.to_string()))?;

                    if let (Some(pool), Some(proxy)) = (&self.pool, &proxy) {
                        pool.record_usage(&proxy.key(), true, Some(response_time))
                            .await;
                    }
                    let mut stats = self.stats.lock().await;
                    stats.successful_requests += 1;

                    return Ok(FetchResponse {
                        status_code,
                        headers,
                        body,
                        response_time,
                    });
                }
                Err(e) => {
                    warn!("HTTP请求失败 (尝试 {}/{}): {}", attempt + 1, self.max_retries + 1, e);
                    if let (Some(pool), Some(proxy)) = (&self.pool, &proxy) {
                        pool.record_usage(&proxy.key(), false, None).await;
                    }
                    last_error = CrawlerError::Network(e.to_string());
                    if attempt < self.max_retries {
                        let backoff = self.retry_delay * (attempt + 1);
                        debug!("等待 {:?} 后重试", backoff);
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        let mut stats = self.stats.lock().await;
        stats.failed_requests += 1;
        Err(last_error)
    }

    pub async fn stats(&self) -> ClientStats {
        self.stats.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_headers_look_like_browser() {
        let headers = default_headers();
        assert!(headers
            .get("User-Agent")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("Chrome"));
        assert!(headers.contains_key("Accept-Language"));
    }

    #[tokio::test]
    async fn test_unreachable_host_exhausts_retries() {
        let client = HttpClient::new(
            &StealthConfig {
                max_retries: 1,
                retry_delay_seconds: 0,
                navigation_timeout_seconds: 1,
                ..StealthConfig::default()
            },
            None,
        );
        // 不可路由地址，既不依赖DNS也不会真的联网成功
        let result = client.get("http://127.0.0.1:9").await;
        assert!(result.is_err());

        let stats = client.stats().await;
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.retry_count, 1);
        assert_eq!(stats.direct_requests, 2);
    }
}
