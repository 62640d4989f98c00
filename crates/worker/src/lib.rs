pub mod registry;
pub mod service;

pub use registry::CrawlerRegistry;
pub use service::{WorkerService, WorkerServiceBuilder};
