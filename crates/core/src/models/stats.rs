use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// 队列统计信息
///
/// 死信队列深度是面向运维的首要系统性故障信号。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    /// 各优先级队列长度，键为优先级数值
    pub queue_lengths: HashMap<i64, u64>,
    pub retry_queue_length: u64,
    pub dead_letter_queue_length: u64,
    pub result_queue_length: u64,
    pub active_workers: u64,
    /// 累计计数器（tasks_added、tasks_consumed等）
    pub counters: HashMap<String, u64>,
}

impl QueueStats {
    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    /// 所有待执行任务总数（不含死信）
    pub fn pending_total(&self) -> u64 {
        self.queue_lengths.values().sum::<u64>() + self.retry_queue_length
    }
}
