pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::*;
pub use errors::*;
// Re-export only specific items from models to avoid conflicts
pub use models::{
    Anonymity, CrawlResult, CrawlerKind, Priority, ProxyInfo, ProxyStatus, ProxyType, QueueStats,
    ResultMessage, StatusMessage, TaskMessage, TaskStatus, WorkerInfo, WorkerStatus,
};
pub use traits::{Crawler, DispatchStrategy, TaskQueue};

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, CrawlerError>;
