//! Node capability traits and the contexts the scheduler hands to them.
//!
//! Node values are immutable templates shared by every agent running a tree: every trait method
//! takes `&self`. Per-agent state lives in the node's memory slot ([`NodeMemory`]), which the
//! scheduler allocates for each tree instance and exposes through the contexts. Nodes never
//! call back into the scheduler directly; they queue commands on the context (finish, wait for
//! a message, push a subtree, observe a key, abort the branch) which the scheduler applies after
//! the call returns.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use arbor_core::{BlackboardComponent, KeyId, Name, WorldMut};

use crate::error::TreeError;
use crate::message::AiMessage;
use crate::scheduler::InstanceId;
use crate::tree::{BehaviorTree, KeyResolver};

/// Execution index of a node inside its tree. Lower ids run earlier and have higher priority.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-(node, tree instance) state.
pub type NodeMemory = Box<dyn Any + Send>;

/// What [`TaskNode::execute`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    Succeeded,
    Failed,
    InProgress,
}

/// What [`TaskNode::abort`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortResult {
    Aborted,
    InProgress,
}

/// Terminal outcome of a task or of a whole branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum NodeResult {
    Succeeded,
    Failed,
    Aborted,
}

impl NodeResult {
    pub fn from_success(success: bool) -> Self {
        if success {
            NodeResult::Succeeded
        } else {
            NodeResult::Failed
        }
    }

    pub(crate) fn code(self) -> i64 {
        match self {
            NodeResult::Succeeded => 1,
            NodeResult::Failed => 2,
            NodeResult::Aborted => 3,
        }
    }
}

/// Lifecycle of a task slot, as reported by
/// [`BehaviorTreeComponent::task_state`](crate::BehaviorTreeComponent::task_state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Inactive,
    Active,
    Aborting,
    Succeeded,
    Failed,
    Aborted,
}

impl From<NodeResult> for TaskState {
    fn from(result: NodeResult) -> Self {
        match result {
            NodeResult::Succeeded => TaskState::Succeeded,
            NodeResult::Failed => TaskState::Failed,
            NodeResult::Aborted => TaskState::Aborted,
        }
    }
}

/// Which active branches a decorator preempts when its condition flips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FlowAbortMode {
    #[default]
    None,
    /// Abort the guarded branch when the condition stops holding.
    SelfBranch,
    /// Abort lower-priority branches when the condition starts holding.
    LowerPriority,
    Both,
}

impl FlowAbortMode {
    pub fn aborts_self(self) -> bool {
        matches!(self, FlowAbortMode::SelfBranch | FlowAbortMode::Both)
    }

    pub fn aborts_lower_priority(self) -> bool {
        matches!(self, FlowAbortMode::LowerPriority | FlowAbortMode::Both)
    }

    /// Drops the lower-priority half, for composites that cannot honor it.
    pub(crate) fn without_lower_priority(self) -> Self {
        match self {
            FlowAbortMode::LowerPriority => FlowAbortMode::None,
            FlowAbortMode::Both => FlowAbortMode::SelfBranch,
            other => other,
        }
    }
}

/// How the previously considered child of a composite ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastChild {
    /// The composite is being entered.
    None,
    /// The child ran (or was aborted) and finished with `result`.
    Finished { index: usize, result: NodeResult },
    /// The child's decorators blocked it, so it never ran.
    Skipped { index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildSelection {
    Child(usize),
    Return(NodeResult),
}

/// Child-selection policy. Must be a pure function of its inputs so repeated searches agree.
pub trait CompositeNode: Send + Sync + 'static {
    fn next_child(&self, last: LastChild, num_children: usize) -> ChildSelection;

    /// Whether decorators on earlier children may preempt a later running child.
    fn allows_lower_priority_abort(&self) -> bool {
        true
    }
}

/// A leaf that does work.
pub trait TaskNode<W: WorldMut + 'static>: Send + Sync + 'static {
    fn execute(&self, ctx: &mut TaskContext<'_, W>) -> TaskResult;

    fn abort(&self, _ctx: &mut TaskContext<'_, W>) -> AbortResult {
        AbortResult::Aborted
    }

    fn wants_tick(&self) -> bool {
        false
    }

    fn tick(&self, _ctx: &mut TaskContext<'_, W>, _dt: f32) {}

    /// Called for every delivered message the task is waiting for.
    fn on_message(&self, ctx: &mut TaskContext<'_, W>, message: &AiMessage) {
        if ctx.is_aborting() {
            ctx.finish_abort();
        } else {
            ctx.finish(NodeResult::from_success(message.success));
        }
    }

    /// Called exactly once per execution, after the task reached a terminal state.
    fn on_task_finished(&self, _ctx: &mut TaskContext<'_, W>, _result: NodeResult) {}

    fn create_memory(&self) -> Option<NodeMemory> {
        None
    }

    /// Keep one memory object per (tree, node, agent) alive across repeated pushes of the tree
    /// instead of recreating it for each instance.
    fn creates_node_instance(&self) -> bool {
        false
    }

    fn resolve_keys(&mut self, _keys: &KeyResolver<'_>) -> Result<(), TreeError> {
        Ok(())
    }
}

/// A guard on one child of a composite.
pub trait DecoratorNode<W: WorldMut + 'static>: Send + Sync + 'static {
    fn calculate_raw_condition(&self, ctx: &ConditionContext<'_, W>) -> bool;

    fn on_become_relevant(&self, _ctx: &mut AuxContext<'_, W>) {}

    fn on_cease_relevant(&self, _ctx: &mut AuxContext<'_, W>) {}

    fn wants_tick(&self) -> bool {
        false
    }

    fn tick(&self, _ctx: &mut AuxContext<'_, W>, _dt: f32) {}

    fn create_memory(&self) -> Option<NodeMemory> {
        None
    }

    fn creates_node_instance(&self) -> bool {
        false
    }

    fn resolve_keys(&mut self, _keys: &KeyResolver<'_>) -> Result<(), TreeError> {
        Ok(())
    }
}

/// Background hook attached to a composite or task while its branch is active.
pub trait ServiceNode<W: WorldMut + 'static>: Send + Sync + 'static {
    fn on_become_relevant(&self, _ctx: &mut AuxContext<'_, W>) {}

    fn on_cease_relevant(&self, _ctx: &mut AuxContext<'_, W>) {}

    fn tick(&self, _ctx: &mut AuxContext<'_, W>, _dt: f32) {}

    fn create_memory(&self) -> Option<NodeMemory> {
        None
    }

    fn creates_node_instance(&self) -> bool {
        false
    }

    fn resolve_keys(&mut self, _keys: &KeyResolver<'_>) -> Result<(), TreeError> {
        Ok(())
    }
}

/// Identifies one execution of one task. Stale handles are ignored by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub instance: InstanceId,
    pub node: NodeId,
    pub(crate) serial: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Clock {
    pub(crate) tick: u64,
    pub(crate) dt: f32,
    pub(crate) now: f64,
}

pub(crate) enum NodeCommand<W: WorldMut + 'static> {
    Finish(NodeResult),
    FinishAbort,
    WaitForMessage { name: Name, request_id: Option<u32> },
    PushSubtree(Arc<BehaviorTree<W>>),
    ObserveKey(KeyId),
    AbortBranch,
}

pub(crate) type DynamicSubtrees<W> = HashMap<Name, Arc<BehaviorTree<W>>>;

/// Access handed to tasks.
pub struct TaskContext<'a, W: WorldMut + 'static> {
    pub agent: W::Agent,
    pub world: &'a mut W,
    pub blackboard: &'a mut BlackboardComponent,
    pub(crate) memory: &'a mut Option<NodeMemory>,
    pub(crate) handle: TaskHandle,
    pub(crate) aborting: bool,
    pub(crate) clock: Clock,
    pub(crate) dynamic: &'a DynamicSubtrees<W>,
    pub(crate) commands: &'a mut Vec<NodeCommand<W>>,
}

impl<'a, W: WorldMut + 'static> TaskContext<'a, W> {
    pub fn memory<T: Any>(&mut self) -> Option<&mut T> {
        self.memory
            .as_mut()
            .and_then(|memory| memory.downcast_mut::<T>())
    }

    pub fn handle(&self) -> TaskHandle {
        self.handle
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting
    }

    pub fn now(&self) -> f64 {
        self.clock.now
    }

    pub fn tick(&self) -> u64 {
        self.clock.tick
    }

    /// Completes a latent execution. Only the first finish of an execution counts.
    pub fn finish(&mut self, result: NodeResult) {
        self.commands.push(NodeCommand::Finish(result));
    }

    /// Acknowledges an abort that previously returned [`AbortResult::InProgress`].
    pub fn finish_abort(&mut self) {
        self.commands.push(NodeCommand::FinishAbort);
    }

    /// Wakes the task through [`TaskNode::on_message`] when a matching message arrives.
    pub fn wait_for_message(&mut self, name: impl Into<Name>, request_id: Option<u32>) {
        self.commands.push(NodeCommand::WaitForMessage {
            name: name.into(),
            request_id,
        });
    }

    /// Runs `tree` as a new instance on top of the stack. The task stays in progress until the
    /// subtree finishes; its result becomes the task's result.
    pub fn push_subtree(&mut self, tree: Arc<BehaviorTree<W>>) {
        self.commands.push(NodeCommand::PushSubtree(tree));
    }

    pub fn dynamic_subtree(&self, tag: Name) -> Option<Arc<BehaviorTree<W>>> {
        self.dynamic.get(&tag).cloned()
    }
}

/// Access handed to decorators and services while they are relevant.
pub struct AuxContext<'a, W: WorldMut + 'static> {
    pub agent: W::Agent,
    pub world: &'a mut W,
    pub blackboard: &'a mut BlackboardComponent,
    pub(crate) node: NodeId,
    pub(crate) memory: &'a mut Option<NodeMemory>,
    pub(crate) clock: Clock,
    pub(crate) commands: &'a mut Vec<NodeCommand<W>>,
}

impl<'a, W: WorldMut + 'static> AuxContext<'a, W> {
    pub fn memory<T: Any>(&mut self) -> Option<&mut T> {
        self.memory
            .as_mut()
            .and_then(|memory| memory.downcast_mut::<T>())
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn now(&self) -> f64 {
        self.clock.now
    }

    /// Re-evaluates this decorator whenever `key` changes, until it ceases to be relevant.
    pub fn observe_key(&mut self, key: KeyId) {
        self.commands.push(NodeCommand::ObserveKey(key));
    }

    /// Fails the branch this decorator guards.
    pub fn abort_branch(&mut self) {
        self.commands.push(NodeCommand::AbortBranch);
    }
}

/// Read-only view used while a search evaluates decorator conditions.
pub struct ConditionContext<'a, W: WorldMut + 'static> {
    pub agent: W::Agent,
    pub world: &'a W,
    pub blackboard: &'a BlackboardComponent,
    pub(crate) memory: Option<&'a (dyn Any + Send)>,
    pub(crate) clock: Clock,
}

impl<'a, W: WorldMut + 'static> ConditionContext<'a, W> {
    pub fn memory<T: Any>(&self) -> Option<&T> {
        self.memory.and_then(|memory| memory.downcast_ref::<T>())
    }

    pub fn now(&self) -> f64 {
        self.clock.now
    }
}
