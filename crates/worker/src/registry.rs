use std::collections::HashMap;
use std::sync::Arc;

use crawler_core::models::CrawlerKind;
use crawler_core::Crawler;

/// 爬虫注册表
///
/// 以类型化的CrawlerKind为键，不支持的类型在任务解析阶段
/// 就会被拒绝，不存在运行期的字符串查找失败。
#[derive(Default)]
pub struct CrawlerRegistry {
    crawlers: HashMap<CrawlerKind, Arc<dyn Crawler>>,
}

impl CrawlerRegistry {
    pub fn new() -> Self {
        Self {
            crawlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: CrawlerKind, crawler: Arc<dyn Crawler>) {
        self.crawlers.insert(kind, crawler);
    }

    pub fn resolve(&self, kind: CrawlerKind) -> Option<Arc<dyn Crawler>> {
        self.crawlers.get(&kind).cloned()
    }

    /// 注册表里各实现的名称，上报为节点能力
    pub fn capabilities(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .crawlers
            .values()
            .map(|crawler| crawler.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.crawlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crawler_core::models::{CrawlResult, TaskMessage};
    use crawler_core::Result;

    struct NamedCrawler(&'static str);

    #[async_trait]
    impl Crawler for NamedCrawler {
        fn name(&self) -> &str {
            self.0
        }

        async fn crawl(&self, task: &TaskMessage) -> Result<CrawlResult> {
            Ok(CrawlResult::pending(&task.url))
        }
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = CrawlerRegistry::new();
        assert!(registry.is_empty());

        registry.register(CrawlerKind::Stealth, Arc::new(NamedCrawler("stealth")));
        registry.register(CrawlerKind::Http, Arc::new(NamedCrawler("http")));

        assert!(registry.resolve(CrawlerKind::Stealth).is_some());
        assert!(registry.resolve(CrawlerKind::Http).is_some());
        assert_eq!(registry.capabilities(), vec!["http", "stealth"]);
    }

    #[test]
    fn test_unregistered_kind_resolves_to_none() {
        let registry = CrawlerRegistry::new();
        assert!(registry.resolve(CrawlerKind::Http).is_none());
    }
}
