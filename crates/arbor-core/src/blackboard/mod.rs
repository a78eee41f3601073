//! Schema-driven agent memory.
//!
//! A [`BlackboardData`] declares typed keys (optionally inheriting from a parent schema); a
//! [`BlackboardComponent`] holds one agent's values for that schema in a single packed buffer.
//! Keys are addressed by [`KeyId`], resolved from names once at setup time.

mod component;
mod data;
mod error;
mod key_type;
pub mod keys;
mod sync;

pub use component::{
    BlackboardComponent, BlackboardView, ObserverFn, ObserverHandle, ObserverOwner, ObserverResult,
};
pub use data::{BlackboardData, KeyEntry};
pub use error::{BlackboardError, SchemaError};
pub use key_type::{
    ArithmeticOp, BasicOp, KeyComparison, KeyId, KeyKind, KeyType, TestOperation, TextOp,
    TypedKey,
};
pub use keys::{
    BoolKey, ClassKey, EnumKey, FloatKey, IntKey, NameKey, ObjectKey, RotatorKey, StringKey,
    VectorKey,
};
pub use sync::SyncGroup;
