use arbor_bt::AiMessage;
use arbor_core::Vec3;

use crate::following::{move_finished, MoveRequest, MoveRequestId, MoveRequestResult, PathFollowing};

#[derive(Debug, Clone, Copy)]
struct ActiveMove {
    id: MoveRequestId,
    goal: Vec3,
    acceptance_radius: f32,
}

/// Reference path follower moving in a straight line at constant speed.
///
/// Finished moves are queued as messages; drain them with
/// [`drain_finished`](Self::drain_finished) and hand them to the agent's behavior tree.
#[derive(Debug, Clone)]
pub struct StraightLineMover {
    position: Vec3,
    speed: f32,
    active: Option<ActiveMove>,
    next_request: u32,
    finished: Vec<AiMessage>,
}

impl StraightLineMover {
    pub fn new(position: Vec3, speed: f32) -> Self {
        Self {
            position,
            speed: speed.max(0.0),
            active: None,
            next_request: 1,
            finished: Vec::new(),
        }
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    pub fn is_moving(&self) -> bool {
        self.active.is_some()
    }

    /// Number of requests accepted so far.
    pub fn accepted_requests(&self) -> u32 {
        self.next_request - 1
    }

    /// Advances the active move by `dt` seconds.
    pub fn tick(&mut self, dt: f32) {
        let Some(active) = self.active else {
            return;
        };
        let to_goal = active.goal - self.position;
        let dist = to_goal.length();
        let step = self.speed * dt.max(0.0);
        if step >= dist {
            self.position = active.goal;
        } else {
            self.position = self.position + to_goal * (step / dist);
        }

        if self.position.distance(active.goal) <= active.acceptance_radius {
            self.active = None;
            tracing::trace!(request = %active.id, "move finished");
            self.finished.push(move_finished(active.id, true));
        }
    }

    pub fn drain_finished(&mut self) -> Vec<AiMessage> {
        std::mem::take(&mut self.finished)
    }
}

impl PathFollowing for StraightLineMover {
    fn move_to(&mut self, request: &MoveRequest) -> MoveRequestResult {
        if !request.goal.is_valid() {
            return MoveRequestResult::Failed;
        }
        if self.position.distance(request.goal) <= request.acceptance_radius {
            return MoveRequestResult::AlreadyAtGoal;
        }
        if let Some(previous) = self.active.take() {
            tracing::debug!(request = %previous.id, "move superseded");
            self.finished.push(move_finished(previous.id, false));
        }

        let id = MoveRequestId(self.next_request);
        self.next_request += 1;
        self.active = Some(ActiveMove {
            id,
            goal: request.goal,
            acceptance_radius: request.acceptance_radius,
        });
        MoveRequestResult::RequestSuccessful(id)
    }

    fn abort_move(&mut self, request_id: MoveRequestId) -> bool {
        match self.active {
            Some(active) if active.id == request_id => {
                self.active = None;
                true
            }
            _ => false,
        }
    }

    fn current_request(&self) -> Option<MoveRequestId> {
        self.active.map(|active| active.id)
    }
}
