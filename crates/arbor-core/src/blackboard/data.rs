use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::error::SchemaError;
use super::key_type::{KeyId, KeyKind, KeyType, TypedKey};

static NEXT_SCHEMA_ID: AtomicU64 = AtomicU64::new(1);

/// One named entry of a blackboard schema.
#[derive(Clone)]
pub struct KeyEntry {
    pub name: String,
    pub key_type: Arc<dyn KeyType>,
    /// Writes to this key are mirrored into every synchronized sibling component.
    pub instance_synced: bool,
}

impl KeyEntry {
    pub fn new(name: impl Into<String>, key_type: impl KeyType) -> Self {
        Self {
            name: name.into(),
            key_type: Arc::new(key_type),
            instance_synced: false,
        }
    }

    pub fn synced(mut self) -> Self {
        self.instance_synced = true;
        self
    }
}

impl fmt::Debug for KeyEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyEntry")
            .field("name", &self.name)
            .field("kind", &self.key_type.kind())
            .field("instance_synced", &self.instance_synced)
            .finish()
    }
}

/// Blackboard schema: an ordered list of keys, optionally extending a parent schema.
///
/// Key IDs are flattened across the chain: the root's keys come first, then each child's own
/// keys in declaration order, so a child's first key ID equals its parent's total key count.
/// Schemas are built mutably and then shared as `Arc<BlackboardData>`; once shared they are
/// read-only.
#[derive(Debug)]
pub struct BlackboardData {
    id: u64,
    name: String,
    parent: Option<Arc<BlackboardData>>,
    keys: Vec<KeyEntry>,
    first_key_id: u32,
}

impl BlackboardData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: NEXT_SCHEMA_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            parent: None,
            keys: Vec::new(),
            first_key_id: 0,
        }
    }

    pub fn with_parent(name: impl Into<String>, parent: Arc<BlackboardData>) -> Self {
        let mut data = Self::new(name);
        data.first_key_id = parent.num_keys() as u32;
        data.parent = Some(parent);
        data
    }

    pub fn with_key(mut self, entry: KeyEntry) -> Self {
        self.keys.push(entry);
        self
    }

    pub fn add_key(&mut self, entry: KeyEntry) -> KeyId {
        self.keys.push(entry);
        KeyId::new(self.first_key_id + self.keys.len() as u32 - 1)
    }

    /// Process-unique identity of this schema object.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<BlackboardData>> {
        self.parent.as_ref()
    }

    /// Keys declared by this schema itself, excluding inherited ones.
    pub fn own_keys(&self) -> &[KeyEntry] {
        &self.keys
    }

    pub fn first_key_id(&self) -> KeyId {
        KeyId::new(self.first_key_id)
    }

    /// Total key count including every ancestor.
    pub fn num_keys(&self) -> usize {
        self.first_key_id as usize + self.keys.len()
    }

    pub fn key_id(&self, name: &str) -> Option<KeyId> {
        if let Some(index) = self.keys.iter().position(|entry| entry.name == name) {
            return Some(KeyId::new(self.first_key_id + index as u32));
        }
        self.parent.as_ref().and_then(|parent| parent.key_id(name))
    }

    pub fn key(&self, id: KeyId) -> Option<&KeyEntry> {
        let index = id.index();
        if index < self.first_key_id as usize {
            return self.parent.as_ref().and_then(|parent| parent.key(id));
        }
        self.keys.get(index - self.first_key_id as usize)
    }

    pub fn key_name(&self, id: KeyId) -> Option<&str> {
        self.key(id).map(|entry| entry.name.as_str())
    }

    pub fn key_kind(&self, id: KeyId) -> Option<KeyKind> {
        self.key(id).map(|entry| entry.key_type.kind())
    }

    pub fn is_key_instance_synced(&self, id: KeyId) -> bool {
        self.key(id).is_some_and(|entry| entry.instance_synced)
    }

    pub fn has_synced_keys(&self) -> bool {
        self.keys.iter().any(|entry| entry.instance_synced)
            || self.parent.as_ref().is_some_and(|p| p.has_synced_keys())
    }

    /// Iterates `(KeyId, &KeyEntry)` over the whole chain in key ID order.
    pub fn iter_keys(&self) -> impl Iterator<Item = (KeyId, &KeyEntry)> + '_ {
        (0..self.num_keys() as u32).filter_map(move |i| {
            let id = KeyId::new(i);
            self.key(id).map(|entry| (id, entry))
        })
    }

    /// True when `self` is `other` or inherits from it.
    pub fn is_child_of(&self, other: &BlackboardData) -> bool {
        if self.id == other.id {
            return true;
        }
        self.parent
            .as_ref()
            .is_some_and(|parent| parent.is_child_of(other))
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Checks the whole chain for empty, duplicate and shadowing key names.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if let Some(parent) = &self.parent {
            parent.validate()?;
        }

        let mut seen = HashSet::new();
        for entry in &self.keys {
            if entry.name.is_empty() {
                return Err(SchemaError::EmptyKeyName {
                    schema: self.name.clone(),
                });
            }
            if !seen.insert(entry.name.as_str()) {
                return Err(SchemaError::DuplicateKey {
                    schema: self.name.clone(),
                    key: entry.name.clone(),
                });
            }
            if let Some(parent) = &self.parent {
                if parent.key_id(&entry.name).is_some() {
                    return Err(SchemaError::ShadowedKey {
                        schema: self.name.clone(),
                        key: entry.name.clone(),
                        parent: parent.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Makes sure a key every schema must expose (e.g. `SelfActor`) exists exactly once in the
    /// chain.
    ///
    /// A root schema adds the entry when it is missing. A schema with a parent never adds one:
    /// it drops its own copy instead, leaving the root to provide it. Returns whether the key
    /// list changed.
    pub fn update_persistent_key<K: TypedKey>(&mut self, name: &str) -> bool {
        let own_index = self.keys.iter().position(|entry| entry.name == name);
        match (&self.parent, own_index) {
            (None, None) => {
                self.keys.push(KeyEntry::new(name, K::default()));
                tracing::debug!(schema = %self.name, key = name, "added persistent key");
                true
            }
            (Some(_), Some(index)) => {
                self.keys.remove(index);
                tracing::debug!(schema = %self.name, key = name, "removed shadowed persistent key");
                true
            }
            _ => false,
        }
    }
}
