//! Deterministic, engine-agnostic AI kernel primitives.
//!
//! Besides the agent/world/tick vocabulary shared by every `arbor-*` crate, this crate hosts the
//! [`blackboard`]: a schema-driven, packed key/value store with change observers and optional
//! cross-agent synchronization of selected keys.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![forbid(unsafe_code)]

pub mod blackboard;
pub mod math;
pub mod name;
pub mod object;
pub mod tick;
pub mod world;

pub use blackboard::{
    ArithmeticOp, BasicOp, BlackboardComponent, BlackboardData, BlackboardError, BlackboardView,
    KeyComparison, KeyEntry, KeyId, KeyKind, KeyType, ObserverHandle, ObserverOwner,
    ObserverResult, SchemaError, SyncGroup, TestOperation, TextOp, TypedKey,
};
pub use math::{Rotator, Vec3};
pub use name::Name;
pub use object::{ClassId, ObjectHandle};
pub use tick::TickContext;
pub use world::{AgentId, WorldMut, WorldView};
