use std::fmt;

use arbor_bt::AiMessage;
use arbor_core::Vec3;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Message a path follower sends when a move request ends, keyed by the request id.
pub const MOVE_FINISHED: &str = "MoveFinished";

/// Identifies one accepted move request of a path follower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MoveRequestId(pub u32);

impl fmt::Display for MoveRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MoveRequest {
    pub goal: Vec3,
    /// Distance to `goal` at which the move counts as arrived.
    pub acceptance_radius: f32,
}

impl MoveRequest {
    pub fn new(goal: Vec3) -> Self {
        Self {
            goal,
            acceptance_radius: 0.0,
        }
    }

    pub fn with_acceptance_radius(mut self, radius: f32) -> Self {
        self.acceptance_radius = radius.max(0.0);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MoveRequestResult {
    Failed,
    AlreadyAtGoal,
    /// Accepted; a [`MOVE_FINISHED`] message with this id follows once the move ends.
    RequestSuccessful(MoveRequestId),
}

/// Path-following service of one agent.
///
/// Accepted requests end with a [`MOVE_FINISHED`] message (see [`move_finished`]) that the
/// game routes to the agent's behavior tree. Aborted requests send nothing.
pub trait PathFollowing {
    fn move_to(&mut self, request: &MoveRequest) -> MoveRequestResult;

    /// Stops `request_id` if it is still the active request.
    fn abort_move(&mut self, request_id: MoveRequestId) -> bool;

    fn current_request(&self) -> Option<MoveRequestId>;
}

/// Builds the completion message for `request_id`.
pub fn move_finished(request_id: MoveRequestId, success: bool) -> AiMessage {
    let message = AiMessage::new(MOVE_FINISHED).with_request_id(request_id.0);
    if success {
        message
    } else {
        message.failed()
    }
}
