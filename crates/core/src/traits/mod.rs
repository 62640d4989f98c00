pub mod crawler;
pub mod dispatch;
pub mod task_queue;

pub use crawler::Crawler;
pub use dispatch::DispatchStrategy;
pub use task_queue::TaskQueue;
