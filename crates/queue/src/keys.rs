use crawler_core::Priority;

/// 队列键名约定
///
/// 所有键共享一个前缀，便于多套系统共用同一个Redis实例。
#[derive(Debug, Clone)]
pub struct QueueKeys {
    prefix: String,
}

impl QueueKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn task_queue(&self, priority: Priority) -> String {
        format!("{}:tasks:{}", self.prefix, priority.queue_suffix())
    }

    pub fn retry_queue(&self) -> String {
        format!("{}:tasks:retry", self.prefix)
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}:tasks:dead", self.prefix)
    }

    pub fn result_queue(&self) -> String {
        format!("{}:results", self.prefix)
    }

    pub fn status_queue(&self) -> String {
        format!("{}:status", self.prefix)
    }

    pub fn hash_set(&self) -> String {
        format!("{}:hashes", self.prefix)
    }

    pub fn storage(&self) -> String {
        format!("{}:storage", self.prefix)
    }

    pub fn worker_registry(&self) -> String {
        format!("{}:workers", self.prefix)
    }

    /// 带TTL的节点存活键，节点崩溃后无需人工清理即自动消失
    pub fn worker_alive(&self, worker_id: &str) -> String {
        format!("{}:workers:{}", self.prefix, worker_id)
    }

    pub fn stats(&self) -> String {
        format!("{}:stats", self.prefix)
    }

    pub fn task_status(&self) -> String {
        format!("{}:task_status", self.prefix)
    }

    /// 阻塞弹出时的队列顺序: urgent > high > normal > low > retry
    pub fn blocking_pop_order(&self) -> Vec<String> {
        let mut order: Vec<String> = Priority::descending()
            .iter()
            .map(|p| self.task_queue(*p))
            .collect();
        order.push(self.retry_queue());
        order
    }

    /// 所有列表型键（清空时用）
    pub fn all_list_keys(&self) -> Vec<String> {
        let mut keys = self.blocking_pop_order();
        keys.push(self.dead_letter_queue());
        keys.push(self.result_queue());
        keys.push(self.status_queue());
        keys
    }

    /// 所有存储型键（清空时用）
    pub fn all_storage_keys(&self) -> Vec<String> {
        vec![
            self.hash_set(),
            self.storage(),
            self.worker_registry(),
            self.stats(),
            self.task_status(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        let keys = QueueKeys::new("crawler");
        assert_eq!(keys.task_queue(Priority::Urgent), "crawler:tasks:urgent");
        assert_eq!(keys.task_queue(Priority::Low), "crawler:tasks:low");
        assert_eq!(keys.retry_queue(), "crawler:tasks:retry");
        assert_eq!(keys.dead_letter_queue(), "crawler:tasks:dead");
        assert_eq!(keys.result_queue(), "crawler:results");
        assert_eq!(keys.worker_alive("w1"), "crawler:workers:w1");
    }

    #[test]
    fn test_blocking_pop_order() {
        let keys = QueueKeys::new("c");
        let order = keys.blocking_pop_order();
        assert_eq!(
            order,
            vec![
                "c:tasks:urgent",
                "c:tasks:high",
                "c:tasks:normal",
                "c:tasks:low",
                "c:tasks:retry"
            ]
        );
    }
}
