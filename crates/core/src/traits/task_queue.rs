use std::time::Duration;

use async_trait::async_trait;

use crate::models::{QueueStats, ResultMessage, StatusMessage, TaskMessage};
use crate::Result;

/// 任务队列抽象接口
///
/// 背后的存储是任务与结果状态的唯一事实来源，所有组件的可写状态
/// 都经由这里流转。存储不可用时各方法记录日志并返回失败指示
/// （false/None），而不是让调用方崩溃；已入队的任务不会因此丢失。
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// 添加任务到队列
    ///
    /// check_duplicate开启时按去重哈希拒绝TTL窗口内的重复提交，
    /// 被拒绝或存储失败都返回false。
    async fn add_task(&self, task: &TaskMessage, check_duplicate: bool) -> Result<bool>;

    /// 按优先级顺序阻塞获取任务
    ///
    /// urgent > high > normal > low > retry，整体等待不超过timeout。
    /// 超时返回None，不是错误。
    async fn get_task(&self, worker_id: &str, timeout: Duration) -> Result<Option<TaskMessage>>;

    /// 标记任务完成并投递结果
    ///
    /// 失败/超时的尝试由队列层决定是否重试或进入死信队列。
    async fn complete_task(&self, task_id: &str, result: &ResultMessage) -> Result<()>;

    /// 重试任务
    ///
    /// 重试次数已达上限时移入死信队列并标记failed（终态）。
    async fn retry_task(&self, task_id: &str, delay_seconds: u64) -> Result<()>;

    /// 注册工作节点
    async fn register_worker(
        &self,
        worker_id: &str,
        node_type: &str,
        capabilities: &[String],
    ) -> Result<()>;

    /// 注销工作节点
    async fn unregister_worker(&self, worker_id: &str) -> Result<()>;

    /// 更新节点状态并广播到状态流
    async fn update_worker_status(&self, status: &StatusMessage) -> Result<()>;

    /// 调度器侧消费状态流
    async fn poll_status_messages(&self, limit: usize) -> Result<Vec<StatusMessage>>;

    /// 读取注册表中的全部节点（监控与调度器启动恢复用）
    async fn get_workers(&self) -> Result<Vec<StatusMessage>>;

    /// 获取处于pending状态的任务（调度循环用）
    async fn get_pending_tasks(&self, limit: usize) -> Result<Vec<TaskMessage>>;

    /// 将任务标记为已分配给指定节点
    async fn assign_task(&self, task_id: &str, worker_id: &str) -> Result<bool>;

    /// 结果消费接口（ResultCollector用），不阻塞任务完成
    async fn poll_results(&self, limit: usize) -> Result<Vec<ResultMessage>>;

    /// 获取队列统计信息
    async fn get_queue_stats(&self) -> Result<QueueStats>;

    /// 清空所有队列与存储（测试/运维用）
    async fn clear_queues(&self) -> Result<()>;
}
