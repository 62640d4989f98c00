mod app_config;

pub use app_config::{
    AccessConfig, AppConfig, PremiumProviderConfig, ProxyPoolConfig, QueueConfig, RedisConfig,
    SchedulerConfig, StealthConfig, TorConfig, ValidatorConfig, WorkerConfig,
};
