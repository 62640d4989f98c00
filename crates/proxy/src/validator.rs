use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crawler_core::models::{Anonymity, ProxyInfo, ProxyStatus, ProxyType};
use crawler_core::{CrawlerError, Result, ValidatorConfig};

/// 泄露源IP的转发头
const FORWARDING_HEADERS: [&str; 6] = [
    "X-Forwarded-For",
    "X-Real-Ip",
    "X-Originating-Ip",
    "Client-Ip",
    "Via",
    "Proxy-Connection",
];

/// 代理校验接口
///
/// 抽象出来便于在测试中替换掉真实的网络探测。
#[async_trait]
pub trait ProxyCheck: Send + Sync {
    /// 验证单个候选代理，结果写回proxy自身的状态字段
    async fn validate(&self, proxy: &mut ProxyInfo) -> bool;
}

/// 根据响应头分类匿名级别
///
/// 没有任何转发头为elite，出现Via/Proxy-Connection为transparent，
/// 其余情况为anonymous。
pub fn classify_anonymity(headers: &HashMap<String, String>) -> Anonymity {
    let has_forwarding = FORWARDING_HEADERS
        .iter()
        .any(|h| headers.keys().any(|k| k.eq_ignore_ascii_case(h)));
    if !has_forwarding {
        return Anonymity::Elite;
    }
    let transparent = headers
        .keys()
        .any(|k| k.eq_ignore_ascii_case("Via") || k.eq_ignore_ascii_case("Proxy-Connection"));
    if transparent {
        Anonymity::Transparent
    } else {
        Anonymity::Anonymous
    }
}

/// 代理验证器
///
/// 依次执行连接性检查、计时测速、匿名性探测和可选的地理位置查询。
pub struct ProxyValidator {
    config: ValidatorConfig,
}

impl ProxyValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    fn build_client(&self, proxy: &ProxyInfo) -> Result<reqwest::Client> {
        let proxy_url = proxy.proxy_url();
        let reqwest_proxy = reqwest::Proxy::all(&proxy_url)
            .map_err(|e| CrawlerError::InvalidProxy(format!("{proxy_url}: {e}")))?;

        reqwest::Client::builder()
            .proxy(reqwest_proxy)
            .timeout(Duration::from_secs(self.config.timeout_seconds))
            .danger_accept_invalid_certs(true)
            .user_agent(
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
            )
            .build()
            .map_err(|e| CrawlerError::Network(e.to_string()))
    }

    async fn test_connectivity(&self, client: &reqwest::Client) -> bool {
        match client.get(&self.config.test_url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// 计时抓取，返回耗时（秒）
    async fn test_speed(&self, client: &reqwest::Client) -> Option<f64> {
        let start = Instant::now();
        let response = client.get(&self.config.test_url).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.bytes().await.ok()?;
        Some(start.elapsed().as_secs_f64())
    }

    async fn test_anonymity(&self, client: &reqwest::Client) -> Option<Anonymity> {
        let response = client
            .get(&self.config.anonymity_test_url)
            .send()
            .await
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        let body: serde_json::Value = response.json().await.ok()?;
        let headers: HashMap<String, String> = body
            .get("headers")?
            .as_object()?
            .iter()
            .map(|(k, v)| (k.clone(), v.as_str().unwrap_or_default().to_string()))
            .collect();
        Some(classify_anonymity(&headers))
    }

    async fn detect_location(&self, client: &reqwest::Client) -> Option<(String, Option<String>)> {
        let response = client.get("http://ip-api.com/json").send().await.ok()?;
        let body: serde_json::Value = response.json().await.ok()?;
        let country = body
            .get("countryCode")
            .or_else(|| body.get("country"))?
            .as_str()?
            .to_string();
        let city = body
            .get("city")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Some((country, city))
    }
}

#[async_trait]
impl ProxyCheck for ProxyValidator {
    async fn validate(&self, proxy: &mut ProxyInfo) -> bool {
        let client = match self.build_client(proxy) {
            Ok(client) => client,
            Err(e) => {
                debug!("代理配置非法 {}: {}", proxy.key(), e);
                proxy.status = ProxyStatus::Failed;
                proxy.last_checked = Some(Utc::now());
                return false;
            }
        };

        if !self.test_connectivity(&client).await {
            debug!("连接测试失败: {}", proxy.key());
            proxy.status = ProxyStatus::Failed;
            proxy.last_checked = Some(Utc::now());
            return false;
        }

        let speed = match self.test_speed(&client).await {
            Some(speed) => speed,
            None => {
                debug!("速度测试失败: {}", proxy.key());
                proxy.status = ProxyStatus::Failed;
                proxy.last_checked = Some(Utc::now());
                return false;
            }
        };

        if let Some(anonymity) = self.test_anonymity(&client).await {
            proxy.anonymity = Some(anonymity);
        }

        if self.config.geo_lookup {
            if let Some((country, city)) = self.detect_location(&client).await {
                proxy.country = Some(country);
                proxy.city = city;
            }
        }

        proxy.record_result(true, Some(speed));
        proxy.status = ProxyStatus::Active;
        proxy.last_checked = Some(Utc::now());
        debug!("代理验证成功: {} (速度: {:.2}s)", proxy.key(), speed);
        true
    }
}

/// 批量验证，信号量限制并发探测数量
pub async fn validate_batch(
    checker: Arc<dyn ProxyCheck>,
    proxies: Vec<ProxyInfo>,
    concurrent_limit: usize,
) -> Vec<ProxyInfo> {
    let total = proxies.len();
    let semaphore = Arc::new(Semaphore::new(concurrent_limit.max(1)));
    let start = Instant::now();

    let mut handles = Vec::with_capacity(total);
    for mut proxy in proxies {
        let semaphore = Arc::clone(&semaphore);
        let checker = Arc::clone(&checker);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire().await.expect("semaphore closed");
            let valid = checker.validate(&mut proxy).await;
            (proxy, valid)
        }));
    }

    let mut valid_proxies = Vec::new();
    for handle in handles {
        if let Ok((proxy, valid)) = handle.await {
            if valid {
                valid_proxies.push(proxy);
            }
        }
    }

    info!(
        "代理验证完成: {}/{} 通过验证 (耗时: {:.1}s)",
        valid_proxies.len(),
        total,
        start.elapsed().as_secs_f64()
    );
    valid_proxies
}

/// SOCKS代理通常更慢，验证时放宽超时
pub fn adaptive_timeout(base_seconds: u64, proxy: &ProxyInfo) -> u64 {
    match proxy.proxy_type {
        ProxyType::Socks4 | ProxyType::Socks5 => base_seconds + base_seconds / 5,
        _ => base_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_elite_when_no_forwarding_headers() {
        let h = headers(&[("Host", "httpbin.org"), ("User-Agent", "x")]);
        assert_eq!(classify_anonymity(&h), Anonymity::Elite);
    }

    #[test]
    fn test_transparent_when_via_present() {
        let h = headers(&[("Via", "1.1 proxy"), ("X-Forwarded-For", "1.2.3.4")]);
        assert_eq!(classify_anonymity(&h), Anonymity::Transparent);
    }

    #[test]
    fn test_anonymous_when_only_forwarded() {
        let h = headers(&[("X-Forwarded-For", "1.2.3.4")]);
        assert_eq!(classify_anonymity(&h), Anonymity::Anonymous);
    }

    #[test]
    fn test_header_matching_is_case_insensitive() {
        let h = headers(&[("x-forwarded-for", "1.2.3.4")]);
        assert_eq!(classify_anonymity(&h), Anonymity::Anonymous);
    }

    #[test]
    fn test_adaptive_timeout() {
        let http = ProxyInfo::new("1.1.1.1", 80, ProxyType::Http);
        let socks = ProxyInfo::new("1.1.1.1", 1080, ProxyType::Socks5);
        assert_eq!(adaptive_timeout(10, &http), 10);
        assert_eq!(adaptive_timeout(10, &socks), 12);
    }

    struct StubCheck {
        valid_hosts: Vec<String>,
    }

    #[async_trait]
    impl ProxyCheck for StubCheck {
        async fn validate(&self, proxy: &mut ProxyInfo) -> bool {
            if self.valid_hosts.contains(&proxy.host) {
                proxy.record_result(true, Some(0.1));
                proxy.status = ProxyStatus::Active;
                true
            } else {
                proxy.status = ProxyStatus::Failed;
                false
            }
        }
    }

    #[tokio::test]
    async fn test_validate_batch_filters_invalid() {
        let checker = Arc::new(StubCheck {
            valid_hosts: vec!["1.1.1.1".to_string(), "3.3.3.3".to_string()],
        });
        let proxies = vec![
            ProxyInfo::new("1.1.1.1", 80, ProxyType::Http),
            ProxyInfo::new("2.2.2.2", 80, ProxyType::Http),
            ProxyInfo::new("3.3.3.3", 80, ProxyType::Http),
        ];

        let valid = validate_batch(checker, proxies, 2).await;
        let mut hosts: Vec<String> = valid.iter().map(|p| p.host.clone()).collect();
        hosts.sort();
        assert_eq!(hosts, vec!["1.1.1.1", "3.3.3.3"]);
        assert!(valid.iter().all(|p| p.status == ProxyStatus::Active));
    }
}
