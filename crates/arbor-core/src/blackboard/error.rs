use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("blackboard `{schema}` has a key with an empty name")]
    EmptyKeyName { schema: String },

    #[error("blackboard `{schema}` declares key `{key}` more than once")]
    DuplicateKey { schema: String, key: String },

    #[error("blackboard `{schema}` key `{key}` shadows a key inherited from `{parent}`")]
    ShadowedKey {
        schema: String,
        key: String,
        parent: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BlackboardError {
    #[error("invalid blackboard schema: {0}")]
    InvalidSchema(#[from] SchemaError),
}

pub type Result<T> = std::result::Result<T, BlackboardError>;
