use std::sync::Arc;

use arbor_core::{Name, WorldMut};

use crate::node::{NodeMemory, NodeResult, TaskContext, TaskNode, TaskResult};
use crate::tree::BehaviorTree;

#[derive(Debug, Default)]
struct WaitMemory {
    remaining: f32,
}

/// Stays in progress for a fixed number of seconds, then succeeds.
#[derive(Debug, Clone, Copy)]
pub struct Wait {
    seconds: f32,
}

impl Wait {
    pub fn new(seconds: f32) -> Self {
        Self {
            seconds: seconds.max(0.0),
        }
    }
}

impl<W: WorldMut + 'static> TaskNode<W> for Wait {
    fn execute(&self, ctx: &mut TaskContext<'_, W>) -> TaskResult {
        if self.seconds <= 0.0 {
            return TaskResult::Succeeded;
        }
        if let Some(memory) = ctx.memory::<WaitMemory>() {
            memory.remaining = self.seconds;
        }
        TaskResult::InProgress
    }

    fn wants_tick(&self) -> bool {
        true
    }

    fn tick(&self, ctx: &mut TaskContext<'_, W>, dt: f32) {
        if ctx.is_aborting() {
            return;
        }
        let done = ctx.memory::<WaitMemory>().is_some_and(|memory| {
            memory.remaining -= dt;
            memory.remaining <= 0.0
        });
        if done {
            ctx.finish(NodeResult::Succeeded);
        }
    }

    fn create_memory(&self) -> Option<NodeMemory> {
        Some(Box::new(WaitMemory::default()))
    }
}

#[derive(Debug, Default)]
struct MessageTimeout {
    remaining: Option<f32>,
}

/// Waits for a named message; the message's success flag becomes the task result.
#[derive(Debug, Clone, Copy)]
pub struct WaitForMessage {
    message: Name,
    request_id: Option<u32>,
    timeout: Option<f32>,
}

impl WaitForMessage {
    pub fn new(message: impl Into<Name>) -> Self {
        Self {
            message: message.into(),
            request_id: None,
            timeout: None,
        }
    }

    pub fn with_request_id(mut self, request_id: u32) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Fails the task when no message arrived within `seconds`.
    pub fn with_timeout(mut self, seconds: f32) -> Self {
        self.timeout = Some(seconds.max(0.0));
        self
    }
}

impl<W: WorldMut + 'static> TaskNode<W> for WaitForMessage {
    fn execute(&self, ctx: &mut TaskContext<'_, W>) -> TaskResult {
        ctx.wait_for_message(self.message, self.request_id);
        if let Some(memory) = ctx.memory::<MessageTimeout>() {
            memory.remaining = self.timeout;
        }
        TaskResult::InProgress
    }

    fn wants_tick(&self) -> bool {
        self.timeout.is_some()
    }

    fn tick(&self, ctx: &mut TaskContext<'_, W>, dt: f32) {
        if ctx.is_aborting() {
            return;
        }
        let timed_out = ctx
            .memory::<MessageTimeout>()
            .and_then(|memory| memory.remaining.as_mut())
            .is_some_and(|remaining| {
                *remaining -= dt;
                *remaining <= 0.0
            });
        if timed_out {
            tracing::debug!(message = %self.message, "message wait timed out");
            ctx.finish(NodeResult::Failed);
        }
    }

    fn create_memory(&self) -> Option<NodeMemory> {
        Some(Box::new(MessageTimeout::default()))
    }
}

/// Finishes immediately with a fixed result.
#[derive(Debug, Clone, Copy)]
pub struct FinishWithResult {
    success: bool,
}

impl FinishWithResult {
    pub fn succeed() -> Self {
        Self { success: true }
    }

    pub fn fail() -> Self {
        Self { success: false }
    }
}

impl<W: WorldMut + 'static> TaskNode<W> for FinishWithResult {
    fn execute(&self, _ctx: &mut TaskContext<'_, W>) -> TaskResult {
        if self.success {
            TaskResult::Succeeded
        } else {
            TaskResult::Failed
        }
    }
}

/// Runs another tree as a subtree instance and finishes with its result.
pub struct RunBehavior<W: WorldMut + 'static> {
    tree: Arc<BehaviorTree<W>>,
}

impl<W: WorldMut + 'static> RunBehavior<W> {
    pub fn new(tree: Arc<BehaviorTree<W>>) -> Self {
        Self { tree }
    }
}

impl<W: WorldMut + 'static> TaskNode<W> for RunBehavior<W> {
    fn execute(&self, ctx: &mut TaskContext<'_, W>) -> TaskResult {
        ctx.push_subtree(Arc::clone(&self.tree));
        TaskResult::InProgress
    }
}

/// Runs the subtree injected for `tag` with
/// [`BehaviorTreeComponent::set_dynamic_subtree`](crate::BehaviorTreeComponent::set_dynamic_subtree),
/// falling back to a default tree. Fails when neither exists.
pub struct RunBehaviorDynamic<W: WorldMut + 'static> {
    tag: Name,
    default_tree: Option<Arc<BehaviorTree<W>>>,
}

impl<W: WorldMut + 'static> RunBehaviorDynamic<W> {
    pub fn new(tag: impl Into<Name>) -> Self {
        Self {
            tag: tag.into(),
            default_tree: None,
        }
    }

    pub fn with_default(mut self, tree: Arc<BehaviorTree<W>>) -> Self {
        self.default_tree = Some(tree);
        self
    }
}

impl<W: WorldMut + 'static> TaskNode<W> for RunBehaviorDynamic<W> {
    fn execute(&self, ctx: &mut TaskContext<'_, W>) -> TaskResult {
        let tree = ctx
            .dynamic_subtree(self.tag)
            .or_else(|| self.default_tree.clone());
        match tree {
            Some(tree) => {
                ctx.push_subtree(tree);
                TaskResult::InProgress
            }
            None => {
                tracing::debug!(tag = %self.tag, "no dynamic subtree injected");
                TaskResult::Failed
            }
        }
    }
}
