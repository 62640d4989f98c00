use async_trait::async_trait;

use crate::models::{TaskMessage, WorkerInfo};
use crate::Result;

/// 节点选择策略接口
#[async_trait]
pub trait DispatchStrategy: Send + Sync {
    /// 从候选节点中为任务选择一个，没有合适节点时返回None
    async fn select_worker(
        &self,
        task: &TaskMessage,
        candidates: &[WorkerInfo],
    ) -> Result<Option<String>>;

    fn name(&self) -> &str;
}
