//! Built-in blackboard key types.

use std::cmp::Ordering;

use super::key_type::{
    replace_bytes, ArithmeticOp, BasicOp, KeyComparison, KeyKind, KeyType, TestOperation, TextOp,
    TypedKey,
};
use crate::math::read_f32;
use crate::{ClassId, Name, ObjectHandle, Rotator, Vec3};

const FLOAT_TOLERANCE: f32 = 1.0e-4;

fn read_u32(raw: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&raw[..4]);
    u32::from_le_bytes(bytes)
}

fn read_u64(raw: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&raw[..8]);
    u64::from_le_bytes(bytes)
}

fn float_ordering(a: f32, b: f32) -> Ordering {
    if (a - b).abs() <= FLOAT_TOLERANCE {
        Ordering::Equal
    } else if a < b {
        Ordering::Less
    } else {
        Ordering::Greater
    }
}

fn ordered(ordering: Ordering) -> KeyComparison {
    match ordering {
        Ordering::Less => KeyComparison::Less,
        Ordering::Equal => KeyComparison::Equal,
        Ordering::Greater => KeyComparison::Greater,
    }
}

fn basic(is_set: bool, op: BasicOp) -> bool {
    match op {
        BasicOp::IsSet => is_set,
        BasicOp::IsNotSet => !is_set,
    }
}

/// Writes the encoding of `value` into `raw`, reporting whether it changed.
fn store<K: TypedKey>(raw: &mut [u8], value: &K::Value) -> bool {
    K::write(raw, value)
}

// ---------------------------------------------------------------------------------------------
// Object / Class

/// Reference to a world object. `base_class` is advisory metadata for editors and debuggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObjectKey {
    pub base_class: ClassId,
}

impl KeyType for ObjectKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Object
    }

    fn value_size(&self) -> usize {
        8
    }

    fn initialize(&self, raw: &mut [u8]) {
        Self::encode(&ObjectHandle::NONE, raw);
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        store::<Self>(raw, &ObjectHandle::NONE)
    }

    fn describe(&self, raw: &[u8]) -> String {
        format!("{:?}", Self::read(raw))
    }

    fn test_basic(&self, raw: &[u8], op: BasicOp) -> bool {
        basic(Self::read(raw).is_some(), op)
    }
}

impl TypedKey for ObjectKey {
    const KIND: KeyKind = KeyKind::Object;
    type Value = ObjectHandle;

    fn invalid_value() -> ObjectHandle {
        ObjectHandle::NONE
    }

    fn read(raw: &[u8]) -> ObjectHandle {
        ObjectHandle(read_u64(raw))
    }

    fn encode(value: &ObjectHandle, out: &mut [u8]) {
        out.copy_from_slice(&value.0.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassKey {
    pub base_class: ClassId,
}

impl KeyType for ClassKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Class
    }

    fn value_size(&self) -> usize {
        4
    }

    fn initialize(&self, raw: &mut [u8]) {
        Self::encode(&ClassId::NONE, raw);
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        store::<Self>(raw, &ClassId::NONE)
    }

    fn describe(&self, raw: &[u8]) -> String {
        format!("{:?}", Self::read(raw))
    }

    fn test_basic(&self, raw: &[u8], op: BasicOp) -> bool {
        basic(Self::read(raw).is_some(), op)
    }
}

impl TypedKey for ClassKey {
    const KIND: KeyKind = KeyKind::Class;
    type Value = ClassId;

    fn invalid_value() -> ClassId {
        ClassId::NONE
    }

    fn read(raw: &[u8]) -> ClassId {
        ClassId(read_u32(raw))
    }

    fn encode(value: &ClassId, out: &mut [u8]) {
        out.copy_from_slice(&value.0.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------------------------
// Vector / Rotator

/// World position. Unset vectors hold [`Vec3::INVALID`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VectorKey;

impl KeyType for VectorKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Vector
    }

    fn value_size(&self) -> usize {
        12
    }

    fn initialize(&self, raw: &mut [u8]) {
        Self::encode(&Vec3::INVALID, raw);
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        replace_bytes(raw, &Vec3::INVALID.to_le_bytes())
    }

    fn describe(&self, raw: &[u8]) -> String {
        let v = Self::read(raw);
        if v.is_valid() {
            format!("({:.2}, {:.2}, {:.2})", v.x, v.y, v.z)
        } else {
            "(invalid)".to_string()
        }
    }

    fn test_basic(&self, raw: &[u8], op: BasicOp) -> bool {
        basic(Self::read(raw).is_valid(), op)
    }

    fn location(&self, raw: &[u8]) -> Option<Vec3> {
        Some(Self::read(raw)).filter(|v| v.is_valid())
    }
}

impl TypedKey for VectorKey {
    const KIND: KeyKind = KeyKind::Vector;
    type Value = Vec3;

    fn invalid_value() -> Vec3 {
        Vec3::INVALID
    }

    fn read(raw: &[u8]) -> Vec3 {
        Vec3::from_le_slice(raw)
    }

    fn encode(value: &Vec3, out: &mut [u8]) {
        out.copy_from_slice(&value.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotatorKey;

impl KeyType for RotatorKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Rotator
    }

    fn value_size(&self) -> usize {
        12
    }

    fn initialize(&self, raw: &mut [u8]) {
        Self::encode(&Rotator::INVALID, raw);
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        replace_bytes(raw, &Rotator::INVALID.to_le_bytes())
    }

    fn describe(&self, raw: &[u8]) -> String {
        let r = Self::read(raw);
        if r.is_valid() {
            format!("P={:.2} Y={:.2} R={:.2}", r.pitch, r.yaw, r.roll)
        } else {
            "(invalid)".to_string()
        }
    }

    fn test_basic(&self, raw: &[u8], op: BasicOp) -> bool {
        basic(Self::read(raw).is_valid(), op)
    }
}

impl TypedKey for RotatorKey {
    const KIND: KeyKind = KeyKind::Rotator;
    type Value = Rotator;

    fn invalid_value() -> Rotator {
        Rotator::INVALID
    }

    fn read(raw: &[u8]) -> Rotator {
        Rotator::from_le_slice(raw)
    }

    fn encode(value: &Rotator, out: &mut [u8]) {
        out.copy_from_slice(&value.to_le_bytes());
    }
}

// ---------------------------------------------------------------------------------------------
// Int / Float / Bool / Enum

/// Signed integer. A freshly initialized slot holds `default_value`; clearing writes `0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntKey {
    pub default_value: i32,
}

impl IntKey {
    pub fn with_default(default_value: i32) -> Self {
        Self { default_value }
    }
}

impl KeyType for IntKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Int
    }

    fn value_size(&self) -> usize {
        4
    }

    fn test_operation(&self) -> TestOperation {
        TestOperation::Arithmetic
    }

    fn initialize(&self, raw: &mut [u8]) {
        Self::encode(&self.default_value, raw);
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        store::<Self>(raw, &0)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> KeyComparison {
        ordered(Self::read(a).cmp(&Self::read(b)))
    }

    fn describe(&self, raw: &[u8]) -> String {
        Self::read(raw).to_string()
    }

    fn test_arithmetic(&self, raw: &[u8], op: ArithmeticOp, int: i32, _float: f32) -> bool {
        op.holds(Self::read(raw).cmp(&int))
    }
}

impl TypedKey for IntKey {
    const KIND: KeyKind = KeyKind::Int;
    type Value = i32;

    fn invalid_value() -> i32 {
        0
    }

    fn read(raw: &[u8]) -> i32 {
        read_u32(raw) as i32
    }

    fn encode(value: &i32, out: &mut [u8]) {
        out.copy_from_slice(&value.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FloatKey {
    pub default_value: f32,
}

impl FloatKey {
    pub fn with_default(default_value: f32) -> Self {
        Self { default_value }
    }
}

impl KeyType for FloatKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Float
    }

    fn value_size(&self) -> usize {
        4
    }

    fn test_operation(&self) -> TestOperation {
        TestOperation::Arithmetic
    }

    fn initialize(&self, raw: &mut [u8]) {
        Self::encode(&self.default_value, raw);
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        store::<Self>(raw, &0.0)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> KeyComparison {
        ordered(float_ordering(Self::read(a), Self::read(b)))
    }

    fn describe(&self, raw: &[u8]) -> String {
        format!("{:.3}", Self::read(raw))
    }

    fn test_arithmetic(&self, raw: &[u8], op: ArithmeticOp, _int: i32, float: f32) -> bool {
        op.holds(float_ordering(Self::read(raw), float))
    }
}

impl TypedKey for FloatKey {
    const KIND: KeyKind = KeyKind::Float;
    type Value = f32;

    fn invalid_value() -> f32 {
        0.0
    }

    fn read(raw: &[u8]) -> f32 {
        read_f32(raw)
    }

    fn encode(value: &f32, out: &mut [u8]) {
        out.copy_from_slice(&value.to_le_bytes());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoolKey {
    pub default_value: bool,
}

impl BoolKey {
    pub fn with_default(default_value: bool) -> Self {
        Self { default_value }
    }
}

impl KeyType for BoolKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Bool
    }

    fn value_size(&self) -> usize {
        1
    }

    fn initialize(&self, raw: &mut [u8]) {
        Self::encode(&self.default_value, raw);
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        store::<Self>(raw, &false)
    }

    fn describe(&self, raw: &[u8]) -> String {
        Self::read(raw).to_string()
    }

    fn test_basic(&self, raw: &[u8], op: BasicOp) -> bool {
        basic(Self::read(raw), op)
    }
}

impl TypedKey for BoolKey {
    const KIND: KeyKind = KeyKind::Bool;
    type Value = bool;

    fn invalid_value() -> bool {
        false
    }

    fn read(raw: &[u8]) -> bool {
        raw[0] != 0
    }

    fn encode(value: &bool, out: &mut [u8]) {
        out[0] = u8::from(*value);
    }
}

/// Small enumeration stored as its discriminant. `values` names each discriminant for display.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumKey {
    pub enum_name: String,
    pub values: Vec<String>,
}

impl EnumKey {
    pub fn new<I, S>(enum_name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enum_name: enum_name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

impl KeyType for EnumKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Enum
    }

    fn value_size(&self) -> usize {
        1
    }

    fn test_operation(&self) -> TestOperation {
        TestOperation::Arithmetic
    }

    fn initialize(&self, raw: &mut [u8]) {
        raw[0] = 0;
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        store::<Self>(raw, &0)
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> KeyComparison {
        ordered(Self::read(a).cmp(&Self::read(b)))
    }

    fn describe(&self, raw: &[u8]) -> String {
        let value = Self::read(raw);
        match self.values.get(value as usize) {
            Some(name) => name.clone(),
            None => value.to_string(),
        }
    }

    fn test_arithmetic(&self, raw: &[u8], op: ArithmeticOp, int: i32, _float: f32) -> bool {
        op.holds(i32::from(Self::read(raw)).cmp(&int))
    }
}

impl TypedKey for EnumKey {
    const KIND: KeyKind = KeyKind::Enum;
    type Value = u8;

    fn invalid_value() -> u8 {
        0
    }

    fn read(raw: &[u8]) -> u8 {
        raw[0]
    }

    fn encode(value: &u8, out: &mut [u8]) {
        out[0] = *value;
    }
}

// ---------------------------------------------------------------------------------------------
// Name / String

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NameKey {
    pub default_value: Name,
}

impl KeyType for NameKey {
    fn kind(&self) -> KeyKind {
        KeyKind::Name
    }

    fn value_size(&self) -> usize {
        4
    }

    fn test_operation(&self) -> TestOperation {
        TestOperation::Text
    }

    fn initialize(&self, raw: &mut [u8]) {
        Self::encode(&self.default_value, raw);
    }

    fn clear(&self, raw: &mut [u8]) -> bool {
        store::<Self>(raw, &Name::NONE)
    }

    fn describe(&self, raw: &[u8]) -> String {
        Self::read(raw).to_string()
    }

    fn test_text(&self, raw: &[u8], op: TextOp, operand: &str) -> bool {
        op.holds(&Self::read(raw).as_str(), operand)
    }
}

impl TypedKey for NameKey {
    const KIND: KeyKind = KeyKind::Name;
    type Value = Name;

    fn invalid_value() -> Name {
        Name::NONE
    }

    fn read(raw: &[u8]) -> Name {
        Name::from_index(read_u32(raw))
    }

    fn encode(value: &Name, out: &mut [u8]) {
        out.copy_from_slice(&value.index().to_le_bytes());
    }
}

/// Free-form text.
///
/// Each component keeps the value in its own text slot, overwritten in place, so arbitrary
/// strings never accumulate anywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringKey {
    pub default_value: String,
}

impl StringKey {
    pub fn with_default(default_value: impl Into<String>) -> Self {
        Self {
            default_value: default_value.into(),
        }
    }
}

impl KeyType for StringKey {
    fn kind(&self) -> KeyKind {
        KeyKind::String
    }

    fn value_size(&self) -> usize {
        0
    }

    fn test_operation(&self) -> TestOperation {
        TestOperation::Text
    }

    fn initialize(&self, _raw: &mut [u8]) {}

    fn clear(&self, _raw: &mut [u8]) -> bool {
        false
    }

    fn describe(&self, raw: &[u8]) -> String {
        Self::read(raw)
    }

    fn test_text(&self, raw: &[u8], op: TextOp, operand: &str) -> bool {
        op.holds(&String::from_utf8_lossy(raw), operand)
    }

    fn initial_text(&self) -> Option<&str> {
        Some(self.default_value.as_str())
    }
}

impl TypedKey for StringKey {
    const KIND: KeyKind = KeyKind::String;
    type Value = String;

    fn invalid_value() -> String {
        String::new()
    }

    fn read(raw: &[u8]) -> String {
        String::from_utf8_lossy(raw).into_owned()
    }

    fn encode(_value: &String, _out: &mut [u8]) {}

    fn text(value: &String) -> Option<&str> {
        Some(value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_slot_starts_invalid_and_clears_back() {
        let key = VectorKey;
        let mut raw = [0u8; 12];
        key.initialize(&mut raw);
        assert!(!key.test_basic(&raw, BasicOp::IsSet));

        assert!(VectorKey::write(&mut raw, &Vec3::new(1.0, 2.0, 3.0)));
        assert!(key.test_basic(&raw, BasicOp::IsSet));
        assert_eq!(key.location(&raw), Some(Vec3::new(1.0, 2.0, 3.0)));

        assert!(key.clear(&mut raw));
        assert!(!key.clear(&mut raw));
        assert_eq!(key.location(&raw), None);
    }

    #[test]
    fn float_arithmetic_uses_tolerance() {
        let key = FloatKey::default();
        let mut raw = [0u8; 4];
        FloatKey::write(&mut raw, &0.5);
        assert!(key.test_arithmetic(&raw, ArithmeticOp::Equal, 0, 0.50001));
        assert!(key.test_arithmetic(&raw, ArithmeticOp::Less, 0, 0.75));
        assert!(!key.test_arithmetic(&raw, ArithmeticOp::Greater, 0, 0.75));
    }

    #[test]
    fn string_text_ops() {
        let key = StringKey::with_default("idle");
        let raw = b"patrol_route_a";
        assert!(key.test_text(raw, TextOp::Contain, "route"));
        assert!(key.test_text(raw, TextOp::NotEqual, "patrol"));
        assert_eq!(key.describe(raw), "patrol_route_a");
        assert_eq!(key.initial_text(), Some("idle"));
        assert_eq!(key.value_size(), 0);
    }

    #[test]
    fn enum_describes_by_value_name() {
        let key = EnumKey::new("Stance", ["Idle", "Alert", "Combat"]);
        let mut raw = [0u8; 1];
        EnumKey::write(&mut raw, &2);
        assert_eq!(key.describe(&raw), "Combat");
        EnumKey::write(&mut raw, &9);
        assert_eq!(key.describe(&raw), "9");
    }
}
