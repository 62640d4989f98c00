use serde::{Deserialize, Serialize};
use tracing::debug;

use crawler_core::models::{TaskMessage, WorkerInfo};

/// 数值比较算子
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl CmpOp {
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            CmpOp::Gt => value > threshold,
            CmpOp::Ge => value >= threshold,
            CmpOp::Lt => value < threshold,
            CmpOp::Le => value <= threshold,
            CmpOp::Eq => (value - threshold).abs() < f64::EPSILON,
        }
    }
}

/// 调度规则条件
///
/// 对任务或节点字段做数值比较或精确匹配。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RuleCondition {
    /// 任务优先级
    TaskPriority(CmpOp, f64),
    /// 节点CPU使用率
    CpuUsage(CmpOp, f64),
    /// 节点内存使用率
    MemoryUsage(CmpOp, f64),
    /// 节点失败任务数
    FailedTasks(CmpOp, f64),
    /// 任务要求的节点类型必须与节点匹配
    NodeTypeMatch,
}

impl RuleCondition {
    /// 条件对(task, worker)组合是否成立
    pub fn matches(&self, task: &TaskMessage, worker: &WorkerInfo) -> bool {
        match self {
            RuleCondition::TaskPriority(op, threshold) => {
                op.apply(task.priority.as_i64() as f64, *threshold)
            }
            RuleCondition::CpuUsage(op, threshold) => op.apply(worker.cpu_usage, *threshold),
            RuleCondition::MemoryUsage(op, threshold) => op.apply(worker.memory_usage, *threshold),
            RuleCondition::FailedTasks(op, threshold) => {
                op.apply(worker.failed_tasks as f64, *threshold)
            }
            RuleCondition::NodeTypeMatch => match &task.node_type {
                Some(required) => worker.node_type == *required,
                None => true,
            },
        }
    }
}

/// 调度规则
///
/// 所有条件同时成立时节点保留在候选集中。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingRule {
    pub name: String,
    /// 数值越大越先应用
    pub priority: i32,
    pub conditions: Vec<RuleCondition>,
    pub enabled: bool,
}

impl SchedulingRule {
    pub fn new(name: impl Into<String>, priority: i32, conditions: Vec<RuleCondition>) -> Self {
        Self {
            name: name.into(),
            priority,
            conditions,
            enabled: true,
        }
    }

    fn matches(&self, task: &TaskMessage, worker: &WorkerInfo) -> bool {
        self.conditions.iter().all(|c| c.matches(task, worker))
    }
}

/// 默认规则集
///
/// 资源吃紧或失败过多的节点被过滤掉；要求特定节点类型的任务
/// 只落到匹配的节点上。
pub fn default_rules() -> Vec<SchedulingRule> {
    vec![
        SchedulingRule::new(
            "resource_constraint",
            90,
            vec![
                RuleCondition::CpuUsage(CmpOp::Le, 80.0),
                RuleCondition::MemoryUsage(CmpOp::Le, 80.0),
            ],
        ),
        SchedulingRule::new(
            "failed_task_limit",
            80,
            vec![RuleCondition::FailedTasks(CmpOp::Le, 10.0)],
        ),
        SchedulingRule::new("node_type_matching", 70, vec![RuleCondition::NodeTypeMatch]),
    ]
}

/// 按优先级从高到低应用规则过滤候选节点
///
/// 会清空候选集的规则被跳过而不是强制执行，避免规则过紧时
/// 任务被饿死。
pub fn apply_rules(
    rules: &[SchedulingRule],
    task: &TaskMessage,
    workers: Vec<WorkerInfo>,
) -> Vec<WorkerInfo> {
    let mut sorted: Vec<&SchedulingRule> = rules.iter().filter(|r| r.enabled).collect();
    sorted.sort_by(|a, b| b.priority.cmp(&a.priority));

    let mut candidates = workers;
    for rule in sorted {
        let filtered: Vec<WorkerInfo> = candidates
            .iter()
            .filter(|worker| rule.matches(task, worker))
            .cloned()
            .collect();
        if filtered.is_empty() {
            debug!("规则 {} 过滤了所有候选节点，跳过该规则", rule.name);
        } else {
            candidates = filtered;
        }
    }
    candidates
}
