use serde::{Deserialize, Serialize};

use crate::{CrawlerError, Result};

/// Redis连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub connect_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            connect_timeout_seconds: 5,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
        }
    }
}

impl RedisConfig {
    pub fn build_connection_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// 队列配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 所有键的公共前缀
    pub prefix: String,
    /// 去重哈希的TTL窗口（秒）
    pub dedup_ttl_seconds: u64,
    /// 失败任务自动重试的基础延迟（秒）
    pub retry_delay_seconds: u64,
    /// 是否由队列层对失败/超时结果自动发起重试
    pub auto_retry: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            prefix: "crawler".to_string(),
            dedup_ttl_seconds: 86400,
            retry_delay_seconds: 60,
            auto_retry: true,
        }
    }
}

/// 工作节点配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub node_type: String,
    pub max_concurrent_tasks: u32,
    pub heartbeat_interval_seconds: u64,
    /// 单个任务的硬超时（秒），任务自身未指定时使用
    pub task_timeout_seconds: u64,
    /// 阻塞获取任务的等待时间（秒）
    pub poll_timeout_seconds: u64,
    /// 停机时等待在途任务完成的上限（秒）
    pub shutdown_drain_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            node_type: "general".to_string(),
            max_concurrent_tasks: 10,
            heartbeat_interval_seconds: 30,
            task_timeout_seconds: 300,
            poll_timeout_seconds: 5,
            shutdown_drain_seconds: 30,
        }
    }
}

/// 调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 节点选择策略: round_robin / least_loaded / random / priority_based / resource_aware
    pub strategy: String,
    pub schedule_interval_ms: u64,
    pub monitor_interval_seconds: u64,
    /// 心跳超过该时长的节点将被移出注册表（秒）
    pub worker_expiry_seconds: i64,
    /// 每个调度周期处理的待调度任务上限
    pub pending_batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: "least_loaded".to_string(),
            schedule_interval_ms: 1000,
            monitor_interval_seconds: 10,
            worker_expiry_seconds: 300,
            pending_batch_size: 100,
        }
    }
}

/// 代理验证配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub test_url: String,
    pub anonymity_test_url: String,
    pub timeout_seconds: u64,
    /// 批量验证的并发上限
    pub concurrent_limit: usize,
    /// 是否在验证时做地理位置查询
    pub geo_lookup: bool,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            test_url: "http://httpbin.org/ip".to_string(),
            anonymity_test_url: "http://httpbin.org/headers".to_string(),
            timeout_seconds: 10,
            concurrent_limit: 50,
            geo_lookup: false,
        }
    }
}

/// 付费代理服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PremiumProviderConfig {
    pub service_name: String,
    pub api_url: String,
    pub api_key: String,
    #[serde(default = "default_auth_header")]
    pub auth_header: String,
    #[serde(default = "default_auth_format")]
    pub auth_format: String,
}

fn default_auth_header() -> String {
    "Authorization".to_string()
}

fn default_auth_format() -> String {
    "Bearer {api_key}".to_string()
}

/// Tor出口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TorConfig {
    pub enabled: bool,
    pub socks_host: String,
    pub socks_port: u16,
    pub control_port: u16,
    pub control_password: Option<String>,
}

impl Default for TorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            socks_host: "127.0.0.1".to_string(),
            socks_port: 9050,
            control_port: 9051,
            control_password: None,
        }
    }
}

/// 代理池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub enabled: bool,
    pub refresh_interval_seconds: u64,
    pub max_proxies: usize,
    pub rotation_strategy: String,
    pub use_free_providers: bool,
    pub premium_providers: Vec<PremiumProviderConfig>,
    pub local_proxy_file: Option<String>,
    pub validator: ValidatorConfig,
    pub tor: TorConfig,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            refresh_interval_seconds: 3600,
            max_proxies: 1000,
            rotation_strategy: "adaptive".to_string(),
            use_free_providers: true,
            premium_providers: Vec::new(),
            local_proxy_file: None,
            validator: ValidatorConfig::default(),
            tor: TorConfig::default(),
        }
    }
}

/// 人性化访问控制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// 最小延迟（秒）
    pub min_delay: f64,
    /// 最大延迟（秒）
    pub max_delay: f64,
    /// 是否按访问频率自适应调整
    pub adaptive_delay: bool,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            min_delay: 0.5,
            max_delay: 2.0,
            adaptive_delay: true,
        }
    }
}

/// Stealth爬虫配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StealthConfig {
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    /// 浏览器路径全部失败后是否降级到纯HTTP客户端
    pub use_fallback: bool,
    pub headless: bool,
    pub enable_stealth: bool,
    /// 浏览器导航超时（秒）
    pub navigation_timeout_seconds: u64,
}

impl Default for StealthConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_seconds: 2,
            use_fallback: true,
            headless: true,
            enable_stealth: true,
            navigation_timeout_seconds: 30,
        }
    }
}

/// 应用总配置
///
/// 从TOML文件加载，环境变量（CRAWLER_前缀，段间用__分隔）可覆盖任意字段。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub proxy_pool: ProxyPoolConfig,
    pub access: AccessConfig,
    pub stealth: StealthConfig,
}

impl AppConfig {
    /// 加载配置文件并应用环境变量覆盖
    ///
    /// 配置文件缺失时使用默认值，配置内容非法则启动失败。
    pub fn load(config_path: &str) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("CRAWLER")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = builder
            .build()
            .map_err(|e| CrawlerError::Configuration(format!("加载配置失败: {e}")))?;

        let app_config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| CrawlerError::Configuration(format!("解析配置失败: {e}")))?;

        app_config.validate()?;
        Ok(app_config)
    }

    /// 校验配置的一致性
    pub fn validate(&self) -> Result<()> {
        if self.redis.host.is_empty() {
            return Err(CrawlerError::Configuration(
                "redis.host 不能为空".to_string(),
            ));
        }
        if self.queue.prefix.is_empty() {
            return Err(CrawlerError::Configuration(
                "queue.prefix 不能为空".to_string(),
            ));
        }
        if self.worker.max_concurrent_tasks == 0 {
            return Err(CrawlerError::Configuration(
                "worker.max_concurrent_tasks 必须大于0".to_string(),
            ));
        }
        if self.access.min_delay < 0.0 || self.access.min_delay > self.access.max_delay {
            return Err(CrawlerError::Configuration(
                "access.min_delay 必须为非负且不大于 access.max_delay".to_string(),
            ));
        }
        if self.proxy_pool.validator.concurrent_limit == 0 {
            return Err(CrawlerError::Configuration(
                "proxy_pool.validator.concurrent_limit 必须大于0".to_string(),
            ));
        }
        let strategy = self.scheduler.strategy.as_str();
        if !matches!(
            strategy,
            "round_robin" | "least_loaded" | "random" | "priority_based" | "resource_aware"
        ) {
            return Err(CrawlerError::Configuration(format!(
                "未知的调度策略: {strategy}"
            )));
        }
        Ok(())
    }
}
