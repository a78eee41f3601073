//! Umbrella crate that re-exports the `arbor-*` building blocks.
//!
//! [`core`] holds the agent/world vocabulary and the blackboard, [`bt`] the behavior tree
//! scheduler, [`nav`] the navigation call contract and [`trace`] the deterministic trace events
//! the scheduler records.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

#[cfg(feature = "core")]
#[cfg_attr(docsrs, doc(cfg(feature = "core")))]
pub use arbor_core as core;

#[cfg(feature = "trace")]
#[cfg_attr(docsrs, doc(cfg(feature = "trace")))]
pub use arbor_trace as trace;

#[cfg(feature = "bt")]
#[cfg_attr(docsrs, doc(cfg(feature = "bt")))]
pub use arbor_bt as bt;

#[cfg(feature = "nav")]
#[cfg_attr(docsrs, doc(cfg(feature = "nav")))]
pub use arbor_nav as nav;

/// Everyday imports for building and running trees.
#[cfg(feature = "bt")]
#[cfg_attr(docsrs, doc(cfg(feature = "bt")))]
pub mod prelude {
    pub use arbor_bt::{
        AiMessage, BehaviorTree, BehaviorTreeComponent, DecoratorSpec, FlowAbortMode, NodeResult,
        NodeSpec, SchedulerConfig, ServiceSpec, TaskContext, TaskNode, TaskResult,
    };
    pub use arbor_core::{
        BlackboardComponent, BlackboardData, KeyEntry, KeyId, TickContext, WorldMut, WorldView,
    };
}
