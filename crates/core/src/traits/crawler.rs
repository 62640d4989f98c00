use async_trait::async_trait;

use crate::models::{CrawlResult, TaskMessage};
use crate::Result;

/// 爬虫实现接口
///
/// crawl对普通抓取失败不返回Err，失败信息写入CrawlResult；
/// Err只用于实现自身不可恢复的故障（如浏览器进程无法启动）。
#[async_trait]
pub trait Crawler: Send + Sync {
    /// 实现名称，用于日志
    fn name(&self) -> &str;

    /// 执行一次爬取
    async fn crawl(&self, task: &TaskMessage) -> Result<CrawlResult>;
}
