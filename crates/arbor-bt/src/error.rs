use arbor_core::{BlackboardError, KeyKind, SchemaError, TestOperation};
use thiserror::Error;

/// Reasons a tree refuses to build, start or push.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("tree `{tree}`: root node `{node}` is not a composite")]
    RootNotComposite { tree: String, node: String },

    #[error("tree `{tree}`: root node `{node}` cannot carry decorators")]
    RootDecorators { tree: String, node: String },

    #[error("tree `{tree}`: composite `{node}` has no children")]
    EmptyComposite { tree: String, node: String },

    #[error("tree `{tree}`: task `{node}` cannot have children")]
    TaskWithChildren { tree: String, node: String },

    #[error("node `{node}` references key `{key}` but its tree has no blackboard")]
    MissingBlackboard { node: String, key: String },

    #[error("node `{node}` references unknown blackboard key `{key}`")]
    UnknownKey { node: String, key: String },

    #[error("node `{node}`: key `{key}` supports {actual:?} queries, not {expected:?}")]
    KeyQueryMismatch {
        node: String,
        key: String,
        expected: TestOperation,
        actual: TestOperation,
    },

    #[error("node `{node}`: keys `{a}` ({a_kind:?}) and `{b}` ({b_kind:?}) cannot be compared")]
    KeyKindMismatch {
        node: String,
        a: String,
        a_kind: KeyKind,
        b: String,
        b_kind: KeyKind,
    },

    #[error("node `{node}`: key `{key}` of kind {kind:?} cannot be used here")]
    UnsupportedKeyKind {
        node: String,
        key: String,
        kind: KeyKind,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Blackboard(#[from] BlackboardError),

    #[error("tree `{tree}` expects blackboard `{expected}`, agent uses `{actual}`")]
    IncompatibleBlackboard {
        tree: String,
        expected: String,
        actual: String,
    },

    #[error("tree `{tree}` is already running in this agent's instance stack")]
    RecursiveSubtree { tree: String },

    #[error("instance stack limit of {limit} reached")]
    InstanceDepthExceeded { limit: usize },
}

pub type Result<T> = std::result::Result<T, TreeError>;
