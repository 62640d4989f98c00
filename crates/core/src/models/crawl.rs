use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 单次爬取结果
///
/// 普通的抓取失败不抛错，错误信息记录在error字段里。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlResult {
    pub url: String,
    pub success: bool,
    pub content: Option<String>,
    pub status_code: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    pub error: Option<String>,
    pub response_time: Option<f64>,
    pub proxy_used: Option<String>,
    pub stealth_applied: bool,
    pub retry_count: u32,
    pub fetched_at: DateTime<Utc>,
}

impl CrawlResult {
    pub fn pending(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            success: false,
            content: None,
            status_code: None,
            headers: HashMap::new(),
            error: None,
            response_time: None,
            proxy_used: None,
            stealth_applied: false,
            retry_count: 0,
            fetched_at: Utc::now(),
        }
    }

    pub fn failure(url: impl Into<String>, error: impl Into<String>) -> Self {
        let mut result = Self::pending(url);
        result.error = Some(error.into());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_captures_error() {
        let result = CrawlResult::failure("https://example.com", "dns error");
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("dns error"));
    }
}
