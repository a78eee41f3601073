//! Opaque handles to engine-side objects and classes.
//!
//! The blackboard never dereferences these; it only stores, compares and describes them. The
//! host engine decides what an object or class id means.

use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ObjectHandle(pub u64);

impl ObjectHandle {
    pub const NONE: ObjectHandle = ObjectHandle(0);

    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_some() {
            write!(f, "Object#{}", self.0)
        } else {
            f.write_str("None")
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ClassId(pub u32);

impl ClassId {
    pub const NONE: ClassId = ClassId(0);

    pub fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_some() {
            write!(f, "Class#{}", self.0)
        } else {
            f.write_str("None")
        }
    }
}
