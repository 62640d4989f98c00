pub mod rules;
pub mod scheduler;
pub mod strategies;

pub use rules::{CmpOp, RuleCondition, SchedulingRule};
pub use scheduler::{SchedulerStatistics, TaskScheduler};
pub use strategies::{
    create_strategy, LeastLoadedStrategy, PriorityBasedStrategy, RandomStrategy,
    ResourceAwareStrategy, RoundRobinStrategy,
};
