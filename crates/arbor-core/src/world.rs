//! The host game as seen by behavior trees.

use core::fmt::Debug;
use core::hash::Hash;

/// Handle of the agent a behavior tree runs for.
///
/// Copied into every node call and used as a map key by hosts, so it must be cheap and
/// totally ordered. `stable_id` is what logs and trace events print.
pub trait AgentId: Copy + Ord + Hash + Debug + Send + 'static {
    fn stable_id(self) -> u64;
}

macro_rules! integer_agent_id {
    ($($ty:ty),*) => {
        $(impl AgentId for $ty {
            fn stable_id(self) -> u64 {
                self as u64
            }
        })*
    };
}

impl AgentId for u64 {
    fn stable_id(self) -> u64 {
        self
    }
}

integer_agent_id!(u32, usize);

/// World state decorators and services read while a tree is searched.
///
/// Game-specific queries live on the host's own type; subsystems such as navigation add
/// extension traits (`arbor_nav::NavWorldMut`).
pub trait WorldView {
    type Agent: AgentId;
}

/// Mutable world access handed to tasks and services.
pub trait WorldMut: WorldView {}
