use thiserror::Error;

/// 爬虫系统错误类型定义
#[derive(Debug, Error)]
pub enum CrawlerError {
    #[error("存储错误: {0}")]
    Store(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务执行超时")]
    ExecutionTimeout,

    #[error("任务 {task_id} 超过最大重试次数，已移入死信队列")]
    RetriesExhausted { task_id: String },

    #[error("没有可用的健康代理")]
    ProxyUnavailable,

    #[error("无效的代理地址: {0}")]
    InvalidProxy(String),

    #[error("检测到反爬虫机制: {0}")]
    Detection(String),

    #[error("不支持的爬虫类型: {0}")]
    UnknownCrawlerKind(String),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("浏览器错误: {0}")]
    Browser(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl CrawlerError {
    /// 判断错误是否为暂时性错误，调用方可稍后重试
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CrawlerError::Store(_) | CrawlerError::Network(_) | CrawlerError::ProxyUnavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CrawlerError::Store("connection refused".to_string()).is_transient());
        assert!(CrawlerError::ProxyUnavailable.is_transient());
        assert!(!CrawlerError::Configuration("bad".to_string()).is_transient());
        assert!(!CrawlerError::RetriesExhausted {
            task_id: "t-1".to_string()
        }
        .is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = CrawlerError::TaskNotFound {
            id: "abc".to_string(),
        };
        assert_eq!(err.to_string(), "任务未找到: abc");
    }
}
