//! Event-driven behavior tree scheduler built on `arbor-core` blackboards.
//!
//! Trees are immutable assets ([`BehaviorTree`]) shared between agents; each agent runs them
//! through its own [`BehaviorTreeComponent`], which owns the agent's blackboard, the per-node
//! memory of every pushed tree instance and the currently executing branch. Branch changes are
//! driven by requests (task completions, observed blackboard changes, messages) rather than by
//! re-walking the whole tree every tick.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod composites;
pub mod config;
pub mod decorators;
pub mod error;
pub mod message;
pub mod node;
pub mod scheduler;
pub mod services;
pub mod tasks;
pub mod tree;

pub use composites::{Selector, Sequence};
pub use config::{ConfigError, SchedulerConfig};
pub use decorators::{
    BlackboardDecorator, CompareBlackboardKeys, Condition, Cooldown, KeyCompareOp, KeyQuery,
    TimeLimit,
};
pub use error::TreeError;
pub use message::AiMessage;
pub use node::{
    AbortResult, AuxContext, ChildSelection, CompositeNode, ConditionContext, DecoratorNode,
    FlowAbortMode, LastChild, NodeId, NodeMemory, NodeResult, ServiceNode, TaskContext,
    TaskHandle, TaskNode, TaskResult, TaskState,
};
pub use scheduler::{BehaviorTreeComponent, InstanceId, TreeStatus};
pub use services::TickService;
pub use tasks::{FinishWithResult, RunBehavior, RunBehaviorDynamic, Wait, WaitForMessage};
pub use tree::{BehaviorTree, DecoratorSpec, KeyResolver, NodeSpec, ServiceSpec};
