use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use tracing::debug;

use crawler_core::models::{TaskMessage, WorkerInfo};
use crawler_core::{CrawlerError, DispatchStrategy, Result};

/// 轮询策略，游标在多次调用间保持
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchStrategy for RoundRobinStrategy {
    async fn select_worker(
        &self,
        _task: &TaskMessage,
        candidates: &[WorkerInfo],
    ) -> Result<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的Worker节点");
            return Ok(None);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let selected = &candidates[index];
        debug!(
            "轮询策略选择Worker: {} (索引: {}/{})",
            selected.worker_id,
            index,
            candidates.len()
        );
        Ok(Some(selected.worker_id.clone()))
    }

    fn name(&self) -> &str {
        "round_robin"
    }
}

/// 最低负载策略
pub struct LeastLoadedStrategy;

impl LeastLoadedStrategy {
    pub fn new() -> Self {
        Self
    }

    fn pick(candidates: &[WorkerInfo]) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                a.load_score()
                    .partial_cmp(&b.load_score())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|worker| worker.worker_id.clone())
    }
}

impl Default for LeastLoadedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchStrategy for LeastLoadedStrategy {
    async fn select_worker(
        &self,
        _task: &TaskMessage,
        candidates: &[WorkerInfo],
    ) -> Result<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的Worker节点");
            return Ok(None);
        }
        let selected = Self::pick(candidates);
        if let Some(worker_id) = &selected {
            debug!("负载均衡策略选择Worker: {}", worker_id);
        }
        Ok(selected)
    }

    fn name(&self) -> &str {
        "least_loaded"
    }
}

/// 随机策略
pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }

    fn pick(candidates: &[WorkerInfo]) -> Option<String> {
        let mut rng = rand::rng();
        candidates
            .choose(&mut rng)
            .map(|worker| worker.worker_id.clone())
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchStrategy for RandomStrategy {
    async fn select_worker(
        &self,
        _task: &TaskMessage,
        candidates: &[WorkerInfo],
    ) -> Result<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的Worker节点");
            return Ok(None);
        }
        Ok(Self::pick(candidates))
    }

    fn name(&self) -> &str {
        "random"
    }
}

/// 基于优先级的策略
///
/// priority >= 8 的任务用最低负载选择，其余随机。该阈值沿用
/// 既有系统的取值，与1..4的优先级取值范围并不一致，保留原样。
pub struct PriorityBasedStrategy;

impl PriorityBasedStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PriorityBasedStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchStrategy for PriorityBasedStrategy {
    async fn select_worker(
        &self,
        task: &TaskMessage,
        candidates: &[WorkerInfo],
    ) -> Result<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的Worker节点");
            return Ok(None);
        }
        if task.priority.as_i64() >= 8 {
            Ok(LeastLoadedStrategy::pick(candidates))
        } else {
            Ok(RandomStrategy::pick(candidates))
        }
    }

    fn name(&self) -> &str {
        "priority_based"
    }
}

/// 资源感知策略
///
/// 综合CPU、内存和当前任务数: 0.7 * avg(cpu, mem) + 0.3 * active。
pub struct ResourceAwareStrategy;

impl ResourceAwareStrategy {
    pub fn new() -> Self {
        Self
    }

    fn score(worker: &WorkerInfo) -> f64 {
        let resource_usage = (worker.cpu_usage + worker.memory_usage) / 2.0;
        resource_usage * 0.7 + worker.active_tasks as f64 * 0.3
    }
}

impl Default for ResourceAwareStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DispatchStrategy for ResourceAwareStrategy {
    async fn select_worker(
        &self,
        _task: &TaskMessage,
        candidates: &[WorkerInfo],
    ) -> Result<Option<String>> {
        if candidates.is_empty() {
            debug!("没有可用的Worker节点");
            return Ok(None);
        }
        let selected = candidates
            .iter()
            .min_by(|a, b| {
                Self::score(a)
                    .partial_cmp(&Self::score(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|worker| worker.worker_id.clone());

        if let Some(worker_id) = &selected {
            debug!("资源感知策略选择Worker: {}", worker_id);
        }
        Ok(selected)
    }

    fn name(&self) -> &str {
        "resource_aware"
    }
}

/// 按配置名构造策略实例
pub fn create_strategy(name: &str) -> Result<Arc<dyn DispatchStrategy>> {
    match name {
        "round_robin" => Ok(Arc::new(RoundRobinStrategy::new())),
        "least_loaded" => Ok(Arc::new(LeastLoadedStrategy::new())),
        "random" => Ok(Arc::new(RandomStrategy::new())),
        "priority_based" => Ok(Arc::new(PriorityBasedStrategy::new())),
        "resource_aware" => Ok(Arc::new(ResourceAwareStrategy::new())),
        other => Err(CrawlerError::Configuration(format!(
            "未知的调度策略: {other}"
        ))),
    }
}
