//! Process-wide interned names.
//!
//! Name keys, message names and subtree tags use a fixed-size [`Name`] handle; the text lives
//! in a global table that only ever grows, so intern identifiers, not free-form text.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use parking_lot::RwLock;

#[derive(Default)]
struct NameTable {
    by_text: HashMap<Arc<str>, u32>,
    texts: Vec<Arc<str>>,
}

static NAMES: LazyLock<RwLock<NameTable>> = LazyLock::new(|| {
    let empty: Arc<str> = Arc::from("");
    let mut table = NameTable::default();
    table.by_text.insert(empty.clone(), 0);
    table.texts.push(empty);
    RwLock::new(table)
});

/// Interned, cheaply comparable string handle. `Name::NONE` is the empty string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Name(u32);

impl Name {
    pub const NONE: Name = Name(0);

    pub fn new(text: &str) -> Self {
        if let Some(&index) = NAMES.read().by_text.get(text) {
            return Name(index);
        }

        let mut table = NAMES.write();
        if let Some(&index) = table.by_text.get(text) {
            return Name(index);
        }
        let index = table.texts.len() as u32;
        let text: Arc<str> = Arc::from(text);
        table.by_text.insert(text.clone(), index);
        table.texts.push(text);
        Name(index)
    }

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn as_str(self) -> Arc<str> {
        NAMES
            .read()
            .texts
            .get(self.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from(""))
    }

    pub(crate) fn index(self) -> u32 {
        self.0
    }

    pub(crate) fn from_index(index: u32) -> Self {
        Name(index)
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({:?})", &*self.as_str())
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let a = Name::new("SelfActor");
        let b = Name::from("SelfActor");
        assert_eq!(a, b);
        assert_eq!(&*a.as_str(), "SelfActor");
        assert_ne!(a, Name::new("Target"));
        assert!(Name::new("").is_none());
    }
}
