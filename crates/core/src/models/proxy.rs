use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 代理协议类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Http,
    Https,
    Socks4,
    Socks5,
}

impl ProxyType {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Https => "https",
            ProxyType::Socks4 => "socks4",
            ProxyType::Socks5 => "socks5",
        }
    }
}

/// 代理状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyStatus {
    Unknown,
    Active,
    Failed,
    Banned,
    Slow,
}

/// 匿名级别
///
/// 根据转发头是否泄露源IP分类。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Anonymity {
    Elite,
    Anonymous,
    Transparent,
}

/// 连续失败多少次后标记为Failed
const CONSECUTIVE_FAILURE_LIMIT: u32 = 3;
/// 累计失败多少次后标记为Banned
const BAN_FAILURE_LIMIT: u64 = 5;

/// 代理信息
///
/// 代理池独占这些字段的可变访问；消费方只借用快照，
/// 通过池的record_usage回报结果，不直接改写状态。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInfo {
    pub host: String,
    pub port: u16,
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub anonymity: Option<Anonymity>,
    #[serde(default)]
    pub source: Option<String>,

    // 性能指标
    #[serde(default)]
    pub response_time: f64,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    pub status: ProxyStatus,

    // 统计信息
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub successful_requests: u64,
    #[serde(default)]
    pub failed_requests: u64,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl ProxyInfo {
    pub fn new(host: impl Into<String>, port: u16, proxy_type: ProxyType) -> Self {
        Self {
            host: host.into(),
            port,
            proxy_type,
            username: None,
            password: None,
            country: None,
            city: None,
            anonymity: None,
            source: None,
            response_time: 0.0,
            success_rate: 0.0,
            last_used: None,
            last_checked: None,
            status: ProxyStatus::Unknown,
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            consecutive_failures: 0,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// 池内唯一标识
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// 渲染为客户端可直接使用的代理URL
    pub fn proxy_url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}://{}:{}@{}:{}",
                self.proxy_type.scheme(),
                user,
                pass,
                self.host,
                self.port
            ),
            _ => format!("{}://{}:{}", self.proxy_type.scheme(), self.host, self.port),
        }
    }

    /// 代理是否健康
    ///
    /// 成功率阈值0.7，响应时间上限10秒。
    pub fn is_healthy(&self) -> bool {
        self.status == ProxyStatus::Active && self.success_rate >= 0.7 && self.response_time < 10.0
    }

    /// 记录一次使用结果，更新成功率与响应时间
    pub fn record_result(&mut self, success: bool, response_time: Option<f64>) {
        self.total_requests += 1;
        self.last_used = Some(Utc::now());

        if success {
            self.successful_requests += 1;
            self.consecutive_failures = 0;
            if let Some(rt) = response_time {
                self.response_time = if self.response_time > 0.0 {
                    (self.response_time + rt) / 2.0
                } else {
                    rt
                };
            }
            self.status = ProxyStatus::Active;
        } else {
            self.failed_requests += 1;
            self.consecutive_failures += 1;
            if self.failed_requests >= BAN_FAILURE_LIMIT {
                self.status = ProxyStatus::Banned;
            } else if self.consecutive_failures >= CONSECUTIVE_FAILURE_LIMIT {
                self.status = ProxyStatus::Failed;
            }
        }

        self.success_rate = if self.total_requests > 0 {
            self.successful_requests as f64 / self.total_requests as f64
        } else {
            0.0
        };
    }
}

impl Display for ProxyInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.proxy_url())
    }
}
