use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::data::{BlackboardData, KeyEntry};
use super::error::Result;
use super::key_type::{
    replace_bytes, ArithmeticOp, BasicOp, KeyComparison, KeyId, KeyKind, KeyType, TextOp,
    TypedKey,
};
use super::sync::{self, SharedState, SyncGroup};
use crate::Vec3;

static NEXT_COMPONENT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverResult {
    ContinueObserving,
    RemoveObserver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObserverHandle(u64);

/// Tag naming whoever registered an observer, so all of its observers can be dropped at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObserverOwner(pub u64);

pub type ObserverFn = Box<dyn FnMut(&BlackboardView<'_>, KeyId) -> ObserverResult + Send>;

struct Observer {
    handle: ObserverHandle,
    owner: ObserverOwner,
    callback: ObserverFn,
}

/// Where a key's value lives.
#[derive(Debug, Clone, Copy)]
enum Storage {
    Packed { offset: usize, size: usize },
    /// Index into the component's text slots.
    Text(usize),
}

fn packed_range(offset: usize, size: usize) -> Range<usize> {
    offset..offset + size
}

/// Slot assignment for one schema. Shared by every component using it.
struct Layout {
    data: Arc<BlackboardData>,
    storage: Vec<Storage>,
    packed_size: usize,
    texts: usize,
}

impl Layout {
    fn new(data: Arc<BlackboardData>) -> Self {
        let mut storage = vec![Storage::Text(0); data.num_keys()];
        let mut texts = 0;

        // Largest slots first; ties keep key order.
        let mut packed: Vec<(KeyId, usize)> = Vec::new();
        for (id, entry) in data.iter_keys() {
            if entry.key_type.initial_text().is_some() {
                storage[id.index()] = Storage::Text(texts);
                texts += 1;
            } else {
                packed.push((id, entry.key_type.value_size()));
            }
        }
        packed.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut offset = 0;
        for (id, size) in packed {
            storage[id.index()] = Storage::Packed { offset, size };
            offset += size;
        }

        Self {
            data,
            storage,
            packed_size: offset,
            texts,
        }
    }

    fn slot(&self, key: KeyId) -> Option<(&KeyEntry, Storage)> {
        let entry = self.data.key(key)?;
        let storage = *self.storage.get(key.index())?;
        Some((entry, storage))
    }

    fn initial_values(&self) -> (Vec<u8>, Vec<String>) {
        let mut values = vec![0; self.packed_size];
        let mut texts = vec![String::new(); self.texts];
        for (id, entry) in self.data.iter_keys() {
            match self.storage[id.index()] {
                Storage::Packed { offset, size } => {
                    entry.key_type.initialize(&mut values[packed_range(offset, size)]);
                }
                Storage::Text(slot) => {
                    texts[slot] = entry.key_type.initial_text().unwrap_or_default().to_string();
                }
            }
        }
        (values, texts)
    }
}

/// Values and observers of one component. Siblings reach it through the sync registry.
pub(crate) struct BoardState {
    layout: Option<Arc<Layout>>,
    values: Vec<u8>,
    texts: Vec<String>,
    observers: BTreeMap<KeyId, Vec<Observer>>,
    paused: bool,
    queued: Vec<KeyId>,
}

impl BoardState {
    fn new() -> Self {
        Self {
            layout: None,
            values: Vec::new(),
            texts: Vec::new(),
            observers: BTreeMap::new(),
            paused: false,
            queued: Vec::new(),
        }
    }

    fn reset(&mut self, layout: Option<Arc<Layout>>) {
        let (values, texts) = layout
            .as_ref()
            .map(|layout| layout.initial_values())
            .unwrap_or_default();
        self.layout = layout;
        self.values = values;
        self.texts = texts;
        self.queued.clear();
    }

    fn raw(&self, storage: Storage) -> &[u8] {
        match storage {
            Storage::Packed { offset, size } => &self.values[packed_range(offset, size)],
            Storage::Text(slot) => self.texts[slot].as_bytes(),
        }
    }

    /// Overwrites a slot with bytes read from a component of the same schema.
    fn replace(&mut self, storage: Storage, raw: &[u8]) -> bool {
        match storage {
            Storage::Packed { offset, size } if raw.len() == size => {
                replace_bytes(&mut self.values[packed_range(offset, size)], raw)
            }
            Storage::Packed { .. } => false,
            Storage::Text(slot) => {
                let text = String::from_utf8_lossy(raw);
                set_text(&mut self.texts[slot], &text)
            }
        }
    }

    /// Applies a sibling's write and notifies this component's observers, paused or not.
    fn apply_mirrored(&mut self, key: KeyId, raw: &[u8]) -> bool {
        let Some((_, storage)) = self.layout.as_ref().and_then(|layout| layout.slot(key)) else {
            return false;
        };
        if !self.replace(storage, raw) {
            return false;
        }
        self.dispatch(key);
        true
    }

    fn notify(&mut self, key: KeyId) {
        if self.paused {
            if !self.queued.contains(&key) {
                self.queued.push(key);
            }
            return;
        }
        self.dispatch(key);
    }

    /// Runs the observers of `key` with the state locked. Observers get a read-only view and
    /// must not write to a sync sibling of the component they observe.
    fn dispatch(&mut self, key: KeyId) {
        let Self {
            layout,
            values,
            texts,
            observers,
            ..
        } = self;
        let Some(layout) = layout.as_deref() else {
            return;
        };
        let Some(list) = observers.get_mut(&key) else {
            return;
        };
        let view = BlackboardView {
            layout,
            values: values.as_slice(),
            texts: texts.as_slice(),
        };
        list.retain_mut(|observer| {
            (observer.callback)(&view, key) == ObserverResult::ContinueObserving
        });
        if list.is_empty() {
            observers.remove(&key);
        }
    }

    fn view(&self) -> Option<BlackboardView<'_>> {
        Some(BlackboardView {
            layout: self.layout.as_deref()?,
            values: &self.values,
            texts: &self.texts,
        })
    }
}

fn set_text(slot: &mut String, text: &str) -> bool {
    if slot.as_str() == text {
        return false;
    }
    slot.clear();
    slot.push_str(text);
    true
}

/// Read access to a component's values, as handed to observers.
pub struct BlackboardView<'a> {
    layout: &'a Layout,
    values: &'a [u8],
    texts: &'a [String],
}

impl<'a> BlackboardView<'a> {
    pub fn blackboard_data(&self) -> &'a Arc<BlackboardData> {
        let layout: &'a Layout = self.layout;
        &layout.data
    }

    pub fn key_id(&self, name: &str) -> Option<KeyId> {
        self.layout.data.key_id(name)
    }

    pub fn key_name(&self, key: KeyId) -> Option<&'a str> {
        let layout: &'a Layout = self.layout;
        layout.data.key(key).map(|entry| entry.name.as_str())
    }

    pub fn key_kind(&self, key: KeyId) -> Option<KeyKind> {
        self.layout.data.key(key).map(|entry| entry.key_type.kind())
    }

    /// Reads a key as `K`. Unknown keys and kind mismatches yield `K::invalid_value()`.
    pub fn get_value<K: TypedKey>(&self, key: KeyId) -> K::Value {
        match self.slot(key) {
            Some((key_type, raw)) if key_type.kind() == K::KIND => K::read(raw),
            _ => K::invalid_value(),
        }
    }

    /// Location expressed by the key, for vector keys holding a valid position.
    pub fn location(&self, key: KeyId) -> Option<Vec3> {
        let (key_type, raw) = self.slot(key)?;
        key_type.location(raw)
    }

    pub fn describe_key_value(&self, key: KeyId) -> Option<String> {
        self.slot(key).map(|(key_type, raw)| key_type.describe(raw))
    }

    pub fn test_basic_operation(&self, key: KeyId, op: BasicOp) -> bool {
        self.slot(key)
            .is_some_and(|(key_type, raw)| key_type.test_basic(raw, op))
    }

    pub fn test_arithmetic_operation(
        &self,
        key: KeyId,
        op: ArithmeticOp,
        int_operand: i32,
        float_operand: f32,
    ) -> bool {
        self.slot(key).is_some_and(|(key_type, raw)| {
            key_type.test_arithmetic(raw, op, int_operand, float_operand)
        })
    }

    pub fn test_text_operation(&self, key: KeyId, op: TextOp, operand: &str) -> bool {
        self.slot(key)
            .is_some_and(|(key_type, raw)| key_type.test_text(raw, op, operand))
    }

    /// Compares two keys. `None` if either is unknown or the kinds differ.
    pub fn compare_key_values(&self, a: KeyId, b: KeyId) -> Option<KeyComparison> {
        let (type_a, raw_a) = self.slot(a)?;
        let (type_b, raw_b) = self.slot(b)?;
        if type_a.kind() != type_b.kind() {
            return None;
        }
        Some(type_a.compare(raw_a, raw_b))
    }

    fn slot(&self, key: KeyId) -> Option<(&'a dyn KeyType, &'a [u8])> {
        let (layout, values, texts): (&'a Layout, &'a [u8], &'a [String]) =
            (self.layout, self.values, self.texts);
        let (entry, storage) = layout.slot(key)?;
        let raw = match storage {
            Storage::Packed { offset, size } => &values[packed_range(offset, size)],
            Storage::Text(slot) => texts[slot].as_bytes(),
        };
        Some((entry.key_type.as_ref(), raw))
    }
}

/// Per-agent blackboard instance: values laid out from a [`BlackboardData`] schema, plus
/// change observers.
///
/// Fixed-size values share one packed buffer. String values live in per-component text slots
/// that are overwritten in place.
///
/// Observers run synchronously inside the mutating call, in registration order. While
/// notifications are paused, changed keys are queued once each (first-change order) and
/// delivered by [`resume_updates`](Self::resume_updates).
///
/// A write to an instance-synced key is applied to every sibling component before the write
/// returns, and the siblings' observers run as part of it even while they are paused.
pub struct BlackboardComponent {
    id: u64,
    layout: Option<Arc<Layout>>,
    state: SharedState,
    sync_group: SyncGroup,
    joined: bool,
}

impl Default for BlackboardComponent {
    fn default() -> Self {
        Self::new()
    }
}

impl BlackboardComponent {
    pub fn new() -> Self {
        Self {
            id: NEXT_COMPONENT_ID.fetch_add(1, Ordering::Relaxed),
            layout: None,
            state: Arc::new(Mutex::new(BoardState::new())),
            sync_group: SyncGroup::default(),
            joined: false,
        }
    }

    pub fn with_sync_group(mut self, group: SyncGroup) -> Self {
        self.sync_group = group;
        self
    }

    /// Convenience for `new()` followed by [`initialize`](Self::initialize).
    pub fn from_data(data: Arc<BlackboardData>) -> Result<Self> {
        let mut component = Self::new();
        component.initialize(data)?;
        Ok(component)
    }

    pub fn component_id(&self) -> u64 {
        self.id
    }

    /// Lays out the value storage for `data` and writes every key's initial value.
    ///
    /// Re-initializing with the schema already in use is a no-op. An invalid schema leaves
    /// the component without any schema.
    pub fn initialize(&mut self, data: Arc<BlackboardData>) -> Result<()> {
        if self
            .layout
            .as_ref()
            .is_some_and(|current| current.data.id() == data.id())
        {
            return Ok(());
        }

        self.leave_sync();

        if let Err(err) = data.validate() {
            tracing::error!(schema = %data.name(), error = %err, "refusing invalid blackboard schema");
            self.layout = None;
            self.state.lock().reset(None);
            return Err(err.into());
        }

        let layout = Arc::new(Layout::new(data.clone()));
        self.state.lock().reset(Some(Arc::clone(&layout)));
        tracing::debug!(
            component = self.id,
            schema = %data.name(),
            keys = data.num_keys(),
            bytes = layout.packed_size,
            texts = layout.texts,
            "blackboard initialized"
        );
        self.layout = Some(layout);

        if data.has_synced_keys() {
            self.join_sync();
        }
        Ok(())
    }

    pub fn has_valid_asset(&self) -> bool {
        self.layout.is_some()
    }

    pub fn blackboard_data(&self) -> Option<&Arc<BlackboardData>> {
        self.layout.as_ref().map(|layout| &layout.data)
    }

    /// True when this component's schema is `data` or one of its descendants.
    pub fn is_compatible_with(&self, data: &BlackboardData) -> bool {
        self.blackboard_data()
            .is_some_and(|current| current.is_child_of(data))
    }

    pub fn num_keys(&self) -> usize {
        self.layout.as_ref().map_or(0, |layout| layout.storage.len())
    }

    pub fn key_id(&self, name: &str) -> Option<KeyId> {
        self.blackboard_data().and_then(|data| data.key_id(name))
    }

    pub fn key_name(&self, key: KeyId) -> Option<&str> {
        self.entry(key).map(|entry| entry.name.as_str())
    }

    pub fn key_type(&self, key: KeyId) -> Option<&dyn KeyType> {
        self.entry(key).map(|entry| entry.key_type.as_ref())
    }

    pub fn key_kind(&self, key: KeyId) -> Option<KeyKind> {
        self.key_type(key).map(|key_type| key_type.kind())
    }

    pub fn is_key_instance_synced(&self, key: KeyId) -> bool {
        self.entry(key).is_some_and(|entry| entry.instance_synced)
    }

    /// Byte offset of the key's slot in the packed value buffer. `None` for text keys.
    pub fn value_offset(&self, key: KeyId) -> Option<usize> {
        match self.storage(key)? {
            Storage::Packed { offset, .. } => Some(offset),
            Storage::Text(_) => None,
        }
    }

    /// Size of the key's slot in the packed value buffer; zero for text keys.
    pub fn value_size(&self, key: KeyId) -> Option<usize> {
        match self.storage(key)? {
            Storage::Packed { size, .. } => Some(size),
            Storage::Text(_) => Some(0),
        }
    }

    /// Runs `f` against a read-only view of the current values.
    pub fn read<R>(&self, f: impl FnOnce(&BlackboardView<'_>) -> R) -> Option<R> {
        let state = self.state.lock();
        state.view().map(|view| f(&view))
    }

    /// Reads a key as `K`. Unknown keys and kind mismatches yield `K::invalid_value()`.
    pub fn get_value<K: TypedKey>(&self, key: KeyId) -> K::Value {
        self.read(|view| view.get_value::<K>(key))
            .unwrap_or_else(K::invalid_value)
    }

    /// Writes a key as `K`, notifying observers when the stored value changes.
    ///
    /// Returns `false` without touching anything for unknown keys and kind mismatches.
    pub fn set_value<K: TypedKey>(&mut self, key: KeyId, value: K::Value) -> bool {
        let Some((entry, storage)) = self.slot(key) else {
            return false;
        };
        if entry.key_type.kind() != K::KIND {
            tracing::trace!(key = %key, expected = ?entry.key_type.kind(), requested = ?K::KIND, "blackboard type mismatch");
            return false;
        }
        let synced = entry.instance_synced;

        let mirrored = {
            let mut state = self.state.lock();
            let changed = match storage {
                Storage::Packed { offset, size } => {
                    K::write(&mut state.values[packed_range(offset, size)], &value)
                }
                Storage::Text(slot) => {
                    K::text(&value).is_some_and(|text| set_text(&mut state.texts[slot], text))
                }
            };
            if !changed {
                return true;
            }
            state.notify(key);
            synced.then(|| state.raw(storage).to_vec())
        };
        if let Some(raw) = mirrored {
            self.propagate(key, &raw);
        }
        true
    }

    pub fn clear_value(&mut self, key: KeyId) -> bool {
        let Some((entry, storage)) = self.slot(key) else {
            return false;
        };
        let synced = entry.instance_synced;

        let mirrored = {
            let mut state = self.state.lock();
            let changed = match storage {
                Storage::Packed { offset, size } => entry
                    .key_type
                    .clear(&mut state.values[packed_range(offset, size)]),
                Storage::Text(slot) => set_text(&mut state.texts[slot], ""),
            };
            if !changed {
                return true;
            }
            state.notify(key);
            synced.then(|| state.raw(storage).to_vec())
        };
        if let Some(raw) = mirrored {
            self.propagate(key, &raw);
        }
        true
    }

    /// Location expressed by the key, for vector keys holding a valid position.
    pub fn location(&self, key: KeyId) -> Option<Vec3> {
        self.read(|view| view.location(key)).flatten()
    }

    pub fn test_basic_operation(&self, key: KeyId, op: BasicOp) -> bool {
        self.read(|view| view.test_basic_operation(key, op))
            .unwrap_or(false)
    }

    pub fn test_arithmetic_operation(
        &self,
        key: KeyId,
        op: ArithmeticOp,
        int_operand: i32,
        float_operand: f32,
    ) -> bool {
        self.read(|view| view.test_arithmetic_operation(key, op, int_operand, float_operand))
            .unwrap_or(false)
    }

    pub fn test_text_operation(&self, key: KeyId, op: TextOp, operand: &str) -> bool {
        self.read(|view| view.test_text_operation(key, op, operand))
            .unwrap_or(false)
    }

    /// Compares two keys of this component. `None` if either is unknown or the kinds differ.
    pub fn compare_key_values(&self, a: KeyId, b: KeyId) -> Option<KeyComparison> {
        self.read(|view| view.compare_key_values(a, b)).flatten()
    }

    /// Compares `key` here against the same key in `other`, which must share the schema.
    pub fn compare_with(&self, other: &BlackboardComponent, key: KeyId) -> Option<KeyComparison> {
        let (ours, theirs) = (self.blackboard_data()?, other.blackboard_data()?);
        if ours.id() != theirs.id() {
            return None;
        }
        let (_, other_storage) = other.slot(key)?;
        let theirs = other.state.lock().raw(other_storage).to_vec();
        let (entry, storage) = self.slot(key)?;
        let state = self.state.lock();
        Some(entry.key_type.compare(state.raw(storage), &theirs))
    }

    pub fn describe_key_value(&self, key: KeyId) -> Option<String> {
        self.read(|view| view.describe_key_value(key)).flatten()
    }

    /// `name: value` lines for every key, in key ID order.
    pub fn describe_values(&self) -> Vec<String> {
        self.read(|view| {
            view.blackboard_data()
                .iter_keys()
                .map(|(id, entry)| {
                    let value = view.describe_key_value(id).unwrap_or_default();
                    format!("{}: {}", entry.name, value)
                })
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn register_observer<F>(&mut self, key: KeyId, owner: ObserverOwner, callback: F) -> ObserverHandle
    where
        F: FnMut(&BlackboardView<'_>, KeyId) -> ObserverResult + Send + 'static,
    {
        let mut state = self.state.lock();
        let handle = ObserverHandle(NEXT_OBSERVER.fetch_add(1, Ordering::Relaxed));
        state.observers.entry(key).or_default().push(Observer {
            handle,
            owner,
            callback: Box::new(callback),
        });
        handle
    }

    pub fn unregister_observer(&mut self, key: KeyId, handle: ObserverHandle) -> bool {
        let mut state = self.state.lock();
        let Some(list) = state.observers.get_mut(&key) else {
            return false;
        };
        let before = list.len();
        list.retain(|observer| observer.handle != handle);
        let removed = list.len() != before;
        if list.is_empty() {
            state.observers.remove(&key);
        }
        removed
    }

    /// Removes every observer registered by `owner`, on any key. Returns how many were removed.
    pub fn unregister_observers_from(&mut self, owner: ObserverOwner) -> usize {
        let mut removed = 0;
        self.state.lock().observers.retain(|_, list| {
            let before = list.len();
            list.retain(|observer| observer.owner != owner);
            removed += before - list.len();
            !list.is_empty()
        });
        removed
    }

    pub fn num_observers(&self, key: KeyId) -> usize {
        self.state.lock().observers.get(&key).map_or(0, Vec::len)
    }

    pub fn pause_updates(&mut self) {
        self.state.lock().paused = true;
    }

    /// Re-enables notifications and delivers each key changed while paused once, in the order
    /// the keys first changed. Writes mirrored in from siblings are never held back.
    pub fn resume_updates(&mut self) {
        let mut state = self.state.lock();
        state.paused = false;
        for key in std::mem::take(&mut state.queued) {
            state.notify(key);
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.lock().paused
    }

    pub fn sync_group(&self) -> SyncGroup {
        self.sync_group
    }

    /// Moves the component to another sync group, re-seeding synced keys from the new group.
    pub fn set_sync_group(&mut self, group: SyncGroup) {
        if self.sync_group == group {
            return;
        }
        self.sync_group = group;
        if self.joined {
            self.leave_sync();
            self.join_sync();
        }
    }

    fn entry(&self, key: KeyId) -> Option<&KeyEntry> {
        self.blackboard_data().and_then(|data| data.key(key))
    }

    fn storage(&self, key: KeyId) -> Option<Storage> {
        self.slot(key).map(|(_, storage)| storage)
    }

    fn slot(&self, key: KeyId) -> Option<(&KeyEntry, Storage)> {
        self.layout.as_ref()?.slot(key)
    }

    fn propagate(&self, key: KeyId, raw: &[u8]) {
        let Some(data) = self.blackboard_data() else {
            return;
        };
        let siblings = sync::siblings(data.id(), self.id, self.sync_group);
        let mut changed = 0;
        for sibling in &siblings {
            if sibling.lock().apply_mirrored(key, raw) {
                changed += 1;
            }
        }
        tracing::trace!(
            component = self.id,
            key = %key,
            siblings = siblings.len(),
            changed,
            "mirrored synced key"
        );
    }

    fn join_sync(&mut self) {
        let Some(layout) = self.layout.clone() else {
            return;
        };
        let siblings = sync::join(layout.data.id(), self.id, self.sync_group, &self.state);
        self.joined = true;

        if let Some(source) = siblings.first() {
            let seed: Vec<(Storage, Vec<u8>)> = {
                let source = source.lock();
                layout
                    .data
                    .iter_keys()
                    .filter(|(_, entry)| entry.instance_synced)
                    .filter_map(|(id, _)| {
                        let (_, theirs) = source.layout.as_ref()?.slot(id)?;
                        Some((layout.storage[id.index()], source.raw(theirs).to_vec()))
                    })
                    .collect()
            };
            let mut state = self.state.lock();
            for (storage, raw) in seed {
                state.replace(storage, &raw);
            }
        }

        tracing::debug!(
            component = self.id,
            group = self.sync_group.0,
            siblings = siblings.len(),
            "joined blackboard sync"
        );
    }

    fn leave_sync(&mut self) {
        if std::mem::take(&mut self.joined) {
            if let Some(data) = self.blackboard_data() {
                sync::leave(data.id(), self.id);
            }
        }
    }
}

static NEXT_OBSERVER: AtomicU64 = AtomicU64::new(1);

impl Drop for BlackboardComponent {
    fn drop(&mut self) {
        self.leave_sync();
    }
}

impl fmt::Debug for BlackboardComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlackboardComponent")
            .field("id", &self.id)
            .field("schema", &self.blackboard_data().map(|data| data.name()))
            .field("sync_group", &self.sync_group)
            .field("joined", &self.joined)
            .finish_non_exhaustive()
    }
}
