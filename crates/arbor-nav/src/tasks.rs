use arbor_bt::{AbortResult, KeyResolver, NodeMemory, TaskContext, TaskNode, TaskResult, TreeError};
use arbor_core::{KeyId, KeyKind};

use crate::following::{MoveRequest, MoveRequestId, MoveRequestResult, MOVE_FINISHED};
use crate::world::NavWorldMut;

#[derive(Debug, Default)]
struct MoveToMemory {
    request: Option<MoveRequestId>,
}

/// Moves the agent to the location stored in a vector or object blackboard key.
///
/// Fails when the key holds no location, when the agent has no path follower, or when the
/// request is rejected. Succeeds immediately when the agent already stands at the goal;
/// otherwise waits for the matching [`MOVE_FINISHED`] message.
#[derive(Debug, Clone)]
pub struct MoveTo {
    goal_key_name: String,
    goal_key: Option<KeyId>,
    acceptance_radius: f32,
}

impl MoveTo {
    pub fn new(goal_key: impl Into<String>) -> Self {
        Self {
            goal_key_name: goal_key.into(),
            goal_key: None,
            acceptance_radius: 0.0,
        }
    }

    pub fn acceptance_radius(mut self, radius: f32) -> Self {
        self.acceptance_radius = radius.max(0.0);
        self
    }
}

impl<W: NavWorldMut + 'static> TaskNode<W> for MoveTo {
    fn execute(&self, ctx: &mut TaskContext<'_, W>) -> TaskResult {
        let Some(goal) = self.goal_key.and_then(|key| ctx.blackboard.location(key)) else {
            tracing::debug!(key = %self.goal_key_name, "move goal not set");
            return TaskResult::Failed;
        };
        let request = MoveRequest::new(goal).with_acceptance_radius(self.acceptance_radius);
        let agent = ctx.agent;
        let Some(nav) = ctx.world.path_following(agent) else {
            tracing::debug!(agent = ?agent, "agent has no path following");
            return TaskResult::Failed;
        };

        match nav.move_to(&request) {
            MoveRequestResult::Failed => TaskResult::Failed,
            MoveRequestResult::AlreadyAtGoal => TaskResult::Succeeded,
            MoveRequestResult::RequestSuccessful(id) => {
                if let Some(memory) = ctx.memory::<MoveToMemory>() {
                    memory.request = Some(id);
                }
                ctx.wait_for_message(MOVE_FINISHED, Some(id.0));
                TaskResult::InProgress
            }
        }
    }

    fn abort(&self, ctx: &mut TaskContext<'_, W>) -> AbortResult {
        let request = ctx
            .memory::<MoveToMemory>()
            .and_then(|memory| memory.request.take());
        if let Some(id) = request {
            let agent = ctx.agent;
            if let Some(nav) = ctx.world.path_following(agent) {
                nav.abort_move(id);
            }
        }
        AbortResult::Aborted
    }

    fn create_memory(&self) -> Option<NodeMemory> {
        Some(Box::new(MoveToMemory::default()))
    }

    fn resolve_keys(&mut self, keys: &KeyResolver<'_>) -> Result<(), TreeError> {
        let key = keys.key(&self.goal_key_name)?;
        match keys.key_kind(key) {
            Some(kind) if !matches!(kind, KeyKind::Vector | KeyKind::Object) => {
                Err(TreeError::UnsupportedKeyKind {
                    node: keys.node_name().to_string(),
                    key: self.goal_key_name.clone(),
                    kind,
                })
            }
            _ => {
                self.goal_key = Some(key);
                Ok(())
            }
        }
    }
}
