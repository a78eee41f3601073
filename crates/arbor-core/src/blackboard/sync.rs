//! Registry of components that mirror instance-synced keys.
//!
//! Components are registered under their schema's id. A write to a synced key looks up the
//! live siblings and applies the new value to each of them, one lock at a time, so two agents
//! writing concurrently cannot deadlock.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Weak};

use parking_lot::Mutex;

use super::component::BoardState;

/// Components only mirror each other when their groups match.
///
/// The default group syncs with every other default-group component sharing the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SyncGroup(pub u32);

pub(crate) type SharedState = Arc<Mutex<BoardState>>;

struct Member {
    component: u64,
    group: SyncGroup,
    state: Weak<Mutex<BoardState>>,
}

static REGISTRY: LazyLock<Mutex<HashMap<u64, Vec<Member>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Registers a component under `schema` and returns the live siblings it should sync with.
pub(crate) fn join(schema: u64, component: u64, group: SyncGroup, state: &SharedState) -> Vec<SharedState> {
    let mut registry = REGISTRY.lock();
    let members = registry.entry(schema).or_default();
    members.retain(|member| member.state.strong_count() > 0);
    let siblings = live_siblings(members, component, group);
    members.push(Member {
        component,
        group,
        state: Arc::downgrade(state),
    });
    siblings
}

pub(crate) fn leave(schema: u64, component: u64) {
    let mut registry = REGISTRY.lock();
    if let Some(members) = registry.get_mut(&schema) {
        members.retain(|member| member.component != component && member.state.strong_count() > 0);
        if members.is_empty() {
            registry.remove(&schema);
        }
    }
}

/// Live siblings of `component` under `schema`. The registry lock is released before returning.
pub(crate) fn siblings(schema: u64, component: u64, group: SyncGroup) -> Vec<SharedState> {
    let registry = REGISTRY.lock();
    registry
        .get(&schema)
        .map(|members| live_siblings(members, component, group))
        .unwrap_or_default()
}

fn live_siblings(members: &[Member], component: u64, group: SyncGroup) -> Vec<SharedState> {
    members
        .iter()
        .filter(|member| member.component != component && member.group == group)
        .filter_map(|member| member.state.upgrade())
        .collect()
}
