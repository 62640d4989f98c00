pub mod crawl;
pub mod proxy;
pub mod result;
pub mod stats;
pub mod task;
pub mod worker;

pub use crawl::CrawlResult;
pub use proxy::{Anonymity, ProxyInfo, ProxyStatus, ProxyType};
pub use result::ResultMessage;
pub use stats::QueueStats;
pub use task::{CrawlerKind, Priority, TaskMessage, TaskStatus};
pub use worker::{StatusMessage, WorkerInfo, WorkerStatus};
