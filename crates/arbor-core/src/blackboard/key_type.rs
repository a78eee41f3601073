use std::fmt;

use crate::Vec3;

/// Flat index of a blackboard entry across a schema's whole parent chain.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyId(u32);

impl KeyId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyId({})", self.0)
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    Object,
    Vector,
    Rotator,
    Int,
    Float,
    Bool,
    String,
    Name,
    Class,
    Enum,
}

/// Family of condition checks a key type supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOperation {
    Basic,
    Arithmetic,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum BasicOp {
    IsSet,
    IsNotSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArithmeticOp {
    Equal,
    NotEqual,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl ArithmeticOp {
    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            ArithmeticOp::Equal => ordering == Equal,
            ArithmeticOp::NotEqual => ordering != Equal,
            ArithmeticOp::Less => ordering == Less,
            ArithmeticOp::LessOrEqual => ordering != Greater,
            ArithmeticOp::Greater => ordering == Greater,
            ArithmeticOp::GreaterOrEqual => ordering != Less,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TextOp {
    Equal,
    NotEqual,
    Contain,
    NotContain,
}

impl TextOp {
    pub fn holds(self, value: &str, operand: &str) -> bool {
        match self {
            TextOp::Equal => value == operand,
            TextOp::NotEqual => value != operand,
            TextOp::Contain => value.contains(operand),
            TextOp::NotContain => !value.contains(operand),
        }
    }
}

/// Result of comparing two stored values of the same key type.
///
/// Types without an ordering only ever report `Equal` / `NotEqual`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyComparison {
    Equal,
    NotEqual,
    Less,
    Greater,
}

/// Value representation and semantics of one blackboard scalar kind.
///
/// Every operation works on the raw bytes of a single slot of the packed value buffer; the
/// slot is exactly `value_size()` bytes long. Implementations assume the slot really holds
/// their kind: type checks happen in the component before a slot is handed out.
///
/// Text keys are the exception: they report an [`initial_text`](Self::initial_text), take no
/// room in the packed buffer, and receive the UTF-8 bytes of their current text instead.
pub trait KeyType: fmt::Debug + Send + Sync + 'static {
    fn kind(&self) -> KeyKind;

    /// Fixed slot size. Must not change after construction.
    fn value_size(&self) -> usize;

    fn test_operation(&self) -> TestOperation {
        TestOperation::Basic
    }

    /// Writes the initial bit pattern of a freshly laid out slot.
    fn initialize(&self, raw: &mut [u8]);

    /// Resets the slot to the "not set" value. Returns whether the stored bytes changed.
    fn clear(&self, raw: &mut [u8]) -> bool;

    fn compare(&self, a: &[u8], b: &[u8]) -> KeyComparison {
        if a == b {
            KeyComparison::Equal
        } else {
            KeyComparison::NotEqual
        }
    }

    fn describe(&self, raw: &[u8]) -> String;

    fn test_basic(&self, _raw: &[u8], _op: BasicOp) -> bool {
        false
    }

    fn test_arithmetic(&self, _raw: &[u8], _op: ArithmeticOp, _int: i32, _float: f32) -> bool {
        false
    }

    fn test_text(&self, _raw: &[u8], _op: TextOp, _operand: &str) -> bool {
        false
    }

    /// World location held by the slot, for keys that can express one.
    fn location(&self, _raw: &[u8]) -> Option<Vec3> {
        None
    }

    /// Starting value of keys stored as text outside the packed buffer.
    fn initial_text(&self) -> Option<&str> {
        None
    }
}

/// Largest slot any built-in key type needs.
pub(crate) const MAX_VALUE_SIZE: usize = 16;

/// Typed access to a key kind, used as the type parameter of
/// [`BlackboardComponent::get_value`](crate::BlackboardComponent::get_value) and
/// [`BlackboardComponent::set_value`](crate::BlackboardComponent::set_value).
pub trait TypedKey: KeyType + Default {
    const KIND: KeyKind;

    type Value: Clone + PartialEq + fmt::Debug;

    /// Value reported for absent keys or mismatched access.
    fn invalid_value() -> Self::Value;

    fn read(raw: &[u8]) -> Self::Value;

    fn encode(value: &Self::Value, out: &mut [u8]);

    /// The text to store for kinds kept outside the packed buffer.
    fn text(_value: &Self::Value) -> Option<&str> {
        None
    }

    /// Stores `value`, returning whether the slot bytes changed.
    fn write(raw: &mut [u8], value: &Self::Value) -> bool {
        let mut encoded = [0u8; MAX_VALUE_SIZE];
        let encoded = &mut encoded[..raw.len()];
        Self::encode(value, encoded);
        if raw == &encoded[..] {
            return false;
        }
        raw.copy_from_slice(encoded);
        true
    }
}

/// Overwrites `raw` with `pattern` and reports whether anything changed.
pub(crate) fn replace_bytes(raw: &mut [u8], pattern: &[u8]) -> bool {
    if raw == pattern {
        return false;
    }
    raw.copy_from_slice(pattern);
    true
}
