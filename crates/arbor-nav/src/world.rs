use arbor_core::WorldMut;

use crate::PathFollowing;

pub trait NavWorldMut: WorldMut {
    /// The agent's path follower, or `None` when the agent cannot navigate.
    fn path_following(&mut self, agent: Self::Agent) -> Option<&mut dyn PathFollowing>;
}
