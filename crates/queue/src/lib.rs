pub mod in_memory;
pub mod keys;
pub mod redis_queue;

pub use in_memory::InMemoryTaskQueue;
pub use keys::QueueKeys;
pub use redis_queue::RedisTaskQueue;
