use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;
use url::Url;

use crawler_core::AccessConfig;

/// 同一域名两次请求之间的硬性最小间隔
const MIN_INTERVAL: Duration = Duration::from_millis(300);
/// recent_requests计数的重置周期（秒）
const RECENT_WINDOW_SECS: u64 = 3600;

/// 单个域名的访问统计
#[derive(Debug, Clone)]
pub struct DomainStats {
    pub total_requests: u64,
    pub recent_requests: u64,
    pub avg_response_time: f64,
    last_reset: Instant,
}

impl DomainStats {
    fn new() -> Self {
        Self {
            total_requests: 0,
            recent_requests: 0,
            avg_response_time: 0.0,
            last_reset: Instant::now(),
        }
    }
}

/// 人性化访问控制器
///
/// 为每个域名维持带随机性的访问节奏，模拟真实用户的浏览间隔。
/// 爬虫在发请求前调用wait_before_request，请求结束后无论成败
/// 都调用record_access。
pub struct AccessController {
    config: AccessConfig,
    domain_stats: Mutex<HashMap<String, DomainStats>>,
    last_access: Mutex<HashMap<String, Instant>>,
}

impl AccessController {
    pub fn new(config: AccessConfig) -> Self {
        Self {
            config,
            domain_stats: Mutex::new(HashMap::new()),
            last_access: Mutex::new(HashMap::new()),
        }
    }

    /// 提取小写的域名键，解析失败归入"unknown"
    pub fn domain_key(url: &str) -> String {
        match Url::parse(url) {
            Ok(parsed) => match parsed.host_str() {
                Some(host) => {
                    let host = host.to_lowercase();
                    match parsed.port() {
                        Some(port) => format!("{host}:{port}"),
                        None => host,
                    }
                }
                None => "unknown".to_string(),
            },
            Err(_) => "unknown".to_string(),
        }
    }

    /// 300ms限速窗口还剩多少需要等待
    fn rate_limit_remaining(&self, domain: &str) -> Duration {
        let last_access = self.last_access.lock().expect("lock poisoned");
        match last_access.get(domain) {
            Some(last) => {
                let elapsed = last.elapsed();
                if elapsed < MIN_INTERVAL {
                    MIN_INTERVAL - elapsed
                } else {
                    Duration::ZERO
                }
            }
            None => Duration::ZERO,
        }
    }

    /// 计算人性化延迟（秒）
    ///
    /// 基础延迟均匀取自[min_delay, max_delay]，按近期访问频率调整，
    /// 最后加上±10%的抖动并钳回配置区间。
    fn human_delay(&self, domain: &str) -> f64 {
        let mut rng = rand::rng();
        let mut delay = rng.random_range(self.config.min_delay..=self.config.max_delay);

        if self.config.adaptive_delay {
            let stats = self.domain_stats.lock().expect("lock poisoned");
            if let Some(stats) = stats.get(domain) {
                if stats.recent_requests > 10 {
                    delay *= (1.0 + stats.recent_requests as f64 / 20.0).min(2.0);
                } else if stats.recent_requests == 0 {
                    delay *= 0.8;
                }
            } else {
                // 首次访问用较短延迟
                delay *= 0.8;
            }
        }

        delay *= rng.random_range(0.9..=1.1);
        delay.clamp(self.config.min_delay, self.config.max_delay)
    }

    /// 在发送请求前等待合适的时间，返回实际等待秒数
    pub async fn wait_before_request(&self, url: &str) -> f64 {
        let domain = Self::domain_key(url);
        let rate_limit_delay = self.rate_limit_remaining(&domain).as_secs_f64();
        let human_delay = self.human_delay(&domain);
        let total_delay = rate_limit_delay.max(human_delay);

        if total_delay > 0.0 {
            debug!("等待 {:.2} 秒后访问 {}", total_delay, domain);
            tokio::time::sleep(Duration::from_secs_f64(total_delay)).await;
        }
        total_delay
    }

    /// 记录一次访问，失败的请求同样计入
    pub fn record_access(&self, url: &str, response_time: f64) {
        let domain = Self::domain_key(url);
        let now = Instant::now();

        {
            let mut last_access = self.last_access.lock().expect("lock poisoned");
            last_access.insert(domain.clone(), now);
        }

        let mut all_stats = self.domain_stats.lock().expect("lock poisoned");
        let stats = all_stats.entry(domain).or_insert_with(DomainStats::new);
        stats.total_requests += 1;
        stats.recent_requests += 1;

        let total = stats.total_requests as f64;
        stats.avg_response_time = (stats.avg_response_time * (total - 1.0) + response_time) / total;

        // 近似滑动窗口：每小时整体重置一次
        if stats.last_reset.elapsed() > Duration::from_secs(RECENT_WINDOW_SECS) {
            stats.recent_requests = 0;
            stats.last_reset = now;
        }
    }

    pub fn domain_stats(&self, domain: &str) -> Option<DomainStats> {
        self.domain_stats
            .lock()
            .expect("lock poisoned")
            .get(domain)
            .cloned()
    }

    pub fn reset(&self) {
        self.domain_stats.lock().expect("lock poisoned").clear();
        self.last_access.lock().expect("lock poisoned").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AccessController {
        AccessController::new(AccessConfig::default())
    }

    #[test]
    fn test_domain_key_extraction() {
        assert_eq!(
            AccessController::domain_key("HTTPS://ExAmPle.COM/path?q=1"),
            "example.com"
        );
        assert_eq!(
            AccessController::domain_key("http://example.com:8080/x"),
            "example.com:8080"
        );
        assert_eq!(AccessController::domain_key("not a url"), "unknown");
    }

    #[test]
    fn test_human_delay_stays_in_bounds() {
        let controller = controller();
        for _ in 0..200 {
            let delay = controller.human_delay("example.com");
            assert!(delay >= 0.5, "delay {delay} below min");
            assert!(delay <= 2.0, "delay {delay} above max");
        }
    }

    #[test]
    fn test_human_delay_bounds_hold_under_load() {
        let controller = controller();
        // 高频访问触发自适应放大，仍须钳在区间内
        for _ in 0..30 {
            controller.record_access("http://example.com/a", 0.1);
        }
        for _ in 0..200 {
            let delay = controller.human_delay("example.com");
            assert!((0.5..=2.0).contains(&delay));
        }
    }

    #[test]
    fn test_rate_limit_floor() {
        let controller = controller();
        assert_eq!(
            controller.rate_limit_remaining("example.com"),
            Duration::ZERO
        );

        controller.record_access("http://example.com/", 0.2);
        let remaining = controller.rate_limit_remaining("example.com");
        assert!(remaining > Duration::ZERO);
        assert!(remaining <= MIN_INTERVAL);

        // 其他域名不受影响
        assert_eq!(controller.rate_limit_remaining("other.com"), Duration::ZERO);
    }

    #[test]
    fn test_record_access_updates_stats() {
        let controller = controller();
        controller.record_access("http://example.com/a", 1.0);
        controller.record_access("http://example.com/b", 3.0);

        let stats = controller.domain_stats("example.com").unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.recent_requests, 2);
        assert!((stats.avg_response_time - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_reset_clears_state() {
        let controller = controller();
        controller.record_access("http://example.com/", 0.5);
        controller.reset();
        assert!(controller.domain_stats("example.com").is_none());
        assert_eq!(
            controller.rate_limit_remaining("example.com"),
            Duration::ZERO
        );
    }

    #[tokio::test]
    async fn test_wait_returns_waited_duration() {
        let controller = AccessController::new(AccessConfig {
            min_delay: 0.01,
            max_delay: 0.02,
            adaptive_delay: true,
        });
        let waited = controller.wait_before_request("http://example.com/").await;
        assert!(waited >= 0.01);
        assert!(waited <= 0.3 + 0.02);
    }
}
