//! Per-agent behavior tree execution.
//!
//! [`BehaviorTreeComponent`] owns an agent's blackboard and a stack of running tree instances.
//! Every change of the executing branch goes through the same pipeline:
//!
//! 1. something requests execution (a task finished, an observed key changed, a subtree was
//!    pushed, the root restarted);
//! 2. a search walks the tree from the requester's position, asking composites for their next
//!    child and evaluating the decorators guarding each candidate;
//! 3. the resulting path is diffed against the active one: tasks that fall out are aborted
//!    (possibly latently), auxiliary nodes leaving the path cease to be relevant, new ones
//!    become relevant, and finally the new leaf task executes.
//!
//! A search that selects the task already running changes nothing.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use arbor_core::{
    AgentId, BlackboardComponent, KeyId, Name, ObserverOwner, ObserverResult, TickContext,
    WorldMut,
};
use arbor_trace::{tags, TraceEvent, Tracer};
use parking_lot::Mutex;

use crate::config::SchedulerConfig;
use crate::error::TreeError;
use crate::message::{AiMessage, MessageWait};
use crate::node::{
    AbortResult, AuxContext, ChildSelection, Clock, ConditionContext, DynamicSubtrees,
    LastChild, NodeCommand, NodeId, NodeMemory, NodeResult, TaskContext, TaskHandle,
    TaskResult, TaskState,
};
use crate::tree::{BehaviorTree, NodeKind};

/// Identifies one pushed tree instance for as long as it stays on the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(u32);

impl InstanceId {
    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStatus {
    Stopped,
    Running,
    /// The root tree finished and `loop_root` is off.
    Finished(NodeResult),
}

#[derive(Debug, Clone, Copy)]
struct ActiveTask {
    node: NodeId,
    serial: u64,
    state: TaskState,
}

#[derive(Debug, Clone, Copy)]
struct ServiceTimer {
    remaining: f32,
    elapsed: f32,
}

struct TreeInstance<W: WorldMut + 'static> {
    id: InstanceId,
    tree: Arc<BehaviorTree<W>>,
    memory: Vec<Option<NodeMemory>>,
    /// Root composite down to the current leaf task. Empty before the first search.
    path: Vec<NodeId>,
    task: Option<ActiveTask>,
    /// Sorted.
    active_aux: Vec<NodeId>,
    service_timers: BTreeMap<NodeId, ServiceTimer>,
    task_states: BTreeMap<NodeId, TaskState>,
}

impl<W: WorldMut + 'static> TreeInstance<W> {
    fn position_of(&self, node: NodeId) -> Option<usize> {
        self.path.iter().position(|&step| step == node)
    }

    /// Child index through which the active path leaves `composite`.
    fn active_child_of(&self, composite: NodeId) -> Option<usize> {
        let position = self.position_of(composite)?;
        let next = *self.path.get(position + 1)?;
        self.tree.node(next).child_index
    }

    fn link_on_path(&self, composite: NodeId, child: usize) -> bool {
        self.active_child_of(composite) == Some(child)
    }

    fn prefix_through(&self, composite: NodeId) -> Option<Vec<NodeId>> {
        let position = self.position_of(composite)?;
        Some(self.path[..=position].to_vec())
    }

    fn is_aux_active(&self, node: NodeId) -> bool {
        self.active_aux.binary_search(&node).is_ok()
    }
}

#[derive(Debug, Clone, Copy)]
enum SearchStart {
    /// Fresh instance: search from its root.
    Enter(NodeId),
    /// Child `after_child` of `composite` ended; ask the composite what comes next.
    Continue {
        composite: NodeId,
        after_child: usize,
        result: NodeResult,
    },
    /// A higher-priority child of an active composite became eligible.
    Restart { composite: NodeId, child: usize },
}

#[derive(Debug, Clone, Copy)]
struct ExecutionRequest {
    instance: InstanceId,
    start: SearchStart,
    /// (stack index, requester). Lower is more important.
    priority: (usize, NodeId),
}

enum SearchOutcome {
    Found(Vec<NodeId>),
    InstanceFinished(NodeResult),
    NoChange,
}

enum Transition {
    Enter {
        instance: InstanceId,
        path: Vec<NodeId>,
    },
    Unwind {
        instance: InstanceId,
        result: NodeResult,
    },
}

impl Transition {
    fn instance(&self) -> InstanceId {
        match self {
            Transition::Enter { instance, .. } | Transition::Unwind { instance, .. } => *instance,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct KeyNotice {
    instance: InstanceId,
    node: NodeId,
}

fn observer_owner(instance: InstanceId, node: NodeId) -> ObserverOwner {
    ObserverOwner((u64::from(instance.0) << 32) | u64::from(node.0))
}

/// Runs behavior trees for one agent.
pub struct BehaviorTreeComponent<W: WorldMut + 'static> {
    agent: W::Agent,
    config: SchedulerConfig,
    blackboard: BlackboardComponent,
    instances: Vec<TreeInstance<W>>,
    next_instance: u32,
    next_serial: u64,
    /// Continuations that must run before anything else (task finished, subtree pushed).
    immediate: VecDeque<ExecutionRequest>,
    /// Requests from decorators, sorted by priority. At most one per requester.
    pending_requests: Vec<ExecutionRequest>,
    /// Transition waiting for a latent abort to resolve.
    pending_execution: Option<Transition>,
    restart_root: bool,
    notices: Arc<Mutex<Vec<KeyNotice>>>,
    message_waits: Vec<MessageWait>,
    posted_messages: Vec<AiMessage>,
    dynamic_subtrees: DynamicSubtrees<W>,
    node_pool: HashMap<(u64, NodeId), NodeMemory>,
    clock: Clock,
    status: TreeStatus,
    root_tree: Option<Arc<BehaviorTree<W>>>,
    tracer: Tracer,
    search_count: u64,
}

impl<W: WorldMut + 'static> BehaviorTreeComponent<W> {
    pub fn new(agent: W::Agent) -> Self {
        Self {
            agent,
            config: SchedulerConfig::default(),
            blackboard: BlackboardComponent::new(),
            instances: Vec::new(),
            next_instance: 0,
            next_serial: 1,
            immediate: VecDeque::new(),
            pending_requests: Vec::new(),
            pending_execution: None,
            restart_root: false,
            notices: Arc::new(Mutex::new(Vec::new())),
            message_waits: Vec::new(),
            posted_messages: Vec::new(),
            dynamic_subtrees: HashMap::new(),
            node_pool: HashMap::new(),
            clock: Clock::default(),
            status: TreeStatus::Stopped,
            root_tree: None,
            tracer: Tracer::new(),
            search_count: 0,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `blackboard` instead of a fresh component, e.g. one already joined to a sync group.
    pub fn with_blackboard(mut self, blackboard: BlackboardComponent) -> Self {
        self.blackboard = blackboard;
        self
    }

    pub fn agent(&self) -> W::Agent {
        self.agent
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn blackboard(&self) -> &BlackboardComponent {
        &self.blackboard
    }

    /// Writes made through this reference reach observing decorators on the next tick.
    pub fn blackboard_mut(&mut self) -> &mut BlackboardComponent {
        &mut self.blackboard
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }

    pub fn tree_status(&self) -> TreeStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == TreeStatus::Running
    }

    /// Number of searches performed since the component was created.
    pub fn search_count(&self) -> u64 {
        self.search_count
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Instance ids from the root instance up to the top of the stack.
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.iter().map(|instance| instance.id).collect()
    }

    pub fn root_tree(&self) -> Option<&Arc<BehaviorTree<W>>> {
        self.root_tree.as_ref()
    }

    /// Deepest task that is currently `Active` or `Aborting`.
    pub fn active_task(&self) -> Option<TaskHandle> {
        self.instances.iter().rev().find_map(|instance| {
            instance.task.map(|task| TaskHandle {
                instance: instance.id,
                node: task.node,
                serial: task.serial,
            })
        })
    }

    pub fn active_task_name(&self) -> Option<&str> {
        self.instances.iter().rev().find_map(|instance| {
            instance
                .task
                .and_then(|task| instance.tree.node_name(task.node))
        })
    }

    pub fn task_state(&self, instance: InstanceId, node: NodeId) -> TaskState {
        let Some(instance) = self.instances.iter().find(|entry| entry.id == instance) else {
            return TaskState::Inactive;
        };
        match instance.task {
            Some(task) if task.node == node => task.state,
            _ => instance
                .task_states
                .get(&node)
                .copied()
                .unwrap_or(TaskState::Inactive),
        }
    }

    pub fn active_path(&self, instance: InstanceId) -> Option<&[NodeId]> {
        self.instance(instance).map(|entry| entry.path.as_slice())
    }

    pub fn active_aux_nodes(&self, instance: InstanceId) -> Option<&[NodeId]> {
        self.instance(instance)
            .map(|entry| entry.active_aux.as_slice())
    }

    /// Registers the subtree that [`RunBehaviorDynamic`](crate::tasks::RunBehaviorDynamic)
    /// tasks with `tag` push from now on. Already running instances are left alone.
    pub fn set_dynamic_subtree(&mut self, tag: impl Into<Name>, tree: Arc<BehaviorTree<W>>) {
        let tag = tag.into();
        tracing::debug!(%tag, tree = tree.name(), "dynamic subtree injected");
        self.dynamic_subtrees.insert(tag, tree);
    }

    pub fn clear_dynamic_subtree(&mut self, tag: impl Into<Name>) -> bool {
        self.dynamic_subtrees.remove(&tag.into()).is_some()
    }

    /// Starts `tree` as the root instance, stopping whatever ran before.
    ///
    /// The first search happens on the next [`tick`](Self::tick). Fails without side effects
    /// when the tree's blackboard cannot be used with this agent's blackboard.
    pub fn start_tree(&mut self, world: &mut W, tree: Arc<BehaviorTree<W>>) -> Result<(), TreeError> {
        if let Some(data) = tree.blackboard_data() {
            if self.blackboard.has_valid_asset() && !self.blackboard.is_compatible_with(data) {
                tracing::warn!(tree = tree.name(), "refusing to start: incompatible blackboard");
                return Err(self.incompatible(&tree));
            }
        }
        if self.status != TreeStatus::Stopped || !self.instances.is_empty() {
            self.stop_tree(world);
        }
        if let Some(data) = tree.blackboard_data() {
            if !self.blackboard.has_valid_asset() {
                self.blackboard.initialize(Arc::clone(data)).inspect_err(|err| {
                    tracing::warn!(tree = tree.name(), error = %err, "refusing to start");
                })?;
            }
        }

        tracing::debug!(
            agent = self.agent.stable_id(),
            tree = tree.name(),
            "starting behavior tree"
        );
        self.root_tree = Some(Arc::clone(&tree));
        self.status = TreeStatus::Running;
        let root = tree.root();
        let instance = self.push_instance(tree);
        self.trace_event(TraceEvent::new(self.clock.tick, tags::TREE_START).at(instance.0, root.0));
        self.immediate.push_back(ExecutionRequest {
            instance,
            start: SearchStart::Enter(root),
            priority: (0, root),
        });
        Ok(())
    }

    /// Aborts every running task without waiting for latent aborts and drops all instances.
    pub fn stop_tree(&mut self, world: &mut W) {
        while let Some(top) = self.instances.len().checked_sub(1) {
            if !self.abort_task(world, top) {
                self.complete_abort(world, top);
            }
            self.pop_instance(world);
        }
        self.immediate.clear();
        self.pending_requests.clear();
        self.pending_execution = None;
        self.restart_root = false;
        self.notices.lock().clear();
        self.message_waits.clear();
        self.posted_messages.clear();
        if self.status != TreeStatus::Stopped {
            tracing::debug!(agent = self.agent.stable_id(), "behavior tree stopped");
            self.trace_event(TraceEvent::new(self.clock.tick, tags::TREE_STOP));
        }
        self.status = TreeStatus::Stopped;
    }

    pub fn restart_tree(&mut self, world: &mut W) -> Result<(), TreeError> {
        match self.root_tree.clone() {
            Some(tree) => self.start_tree(world, tree),
            None => Ok(()),
        }
    }

    /// One scheduler update: queued messages, searches for observed key changes, service and
    /// decorator ticks, task ticks, then any searches those produced.
    pub fn tick(&mut self, world: &mut W, ctx: &TickContext) {
        self.clock.tick = ctx.tick;
        self.clock.dt = ctx.dt_seconds;
        self.clock.now += f64::from(ctx.dt_seconds);
        if self.status != TreeStatus::Running {
            return;
        }

        for message in std::mem::take(&mut self.posted_messages) {
            self.handle_message(world, &message);
        }

        if std::mem::take(&mut self.restart_root) {
            if let Some(root) = self.instances.first() {
                let start = root.tree.root();
                self.immediate.push_back(ExecutionRequest {
                    instance: root.id,
                    start: SearchStart::Enter(start),
                    priority: (0, start),
                });
            }
        }

        self.process_requests(world);
        self.tick_aux(world, ctx.dt_seconds);
        self.tick_tasks(world, ctx.dt_seconds);
        self.process_requests(world);
    }

    /// Queues `message` for delivery at the start of the next tick.
    pub fn post_message(&mut self, message: AiMessage) {
        self.posted_messages.push(message);
    }

    /// Delivers `message` to every task waiting for it right away. Any branch change this
    /// causes is searched on the next tick.
    pub fn handle_message(&mut self, world: &mut W, message: &AiMessage) {
        let mut targets: Vec<(InstanceId, NodeId, u64)> = self
            .message_waits
            .iter()
            .filter(|wait| wait.matches(message))
            .map(|wait| (wait.instance, wait.node, wait.serial))
            .collect();
        targets.dedup();
        self.trace_event(
            TraceEvent::new(self.clock.tick, tags::MESSAGE)
                .with_value(message.request_id.map_or(-1, i64::from))
                .with_label(message.name.to_string()),
        );

        for (instance, node, serial) in targets {
            let Some(index) = self.index_of(instance) else {
                continue;
            };
            let Some(task) = self.current_task(index, node, serial) else {
                continue;
            };
            tracing::debug!(
                instance = instance.0,
                %node,
                message = %message.name,
                request_id = ?message.request_id,
                "delivering message"
            );
            let tree = Arc::clone(&self.instances[index].tree);
            let NodeKind::Task { logic, .. } = &tree.node(node).kind else {
                continue;
            };
            let mut commands = Vec::new();
            let aborting = task.state == TaskState::Aborting;
            logic.on_message(
                &mut self.task_context(world, index, node, serial, aborting, &mut commands),
                message,
            );
            self.apply_task_commands(world, index, node, serial, commands);
        }
    }

    /// Completes a latent task. Finishing an execution that already ended is logged and
    /// ignored; finishing an aborting task completes its abort.
    pub fn finish_latent_task(&mut self, world: &mut W, handle: TaskHandle, result: NodeResult) {
        match self.index_of(handle.instance) {
            Some(index) => self.finish_task(world, index, handle.node, handle.serial, result),
            None => tracing::warn!(
                instance = handle.instance.0,
                node = %handle.node,
                "finish for a task whose instance is gone ignored"
            ),
        }
    }

    pub fn finish_latent_abort(&mut self, world: &mut W, handle: TaskHandle) {
        match self.index_of(handle.instance) {
            Some(index) => self.finish_abort(world, index, handle.node, handle.serial),
            None => tracing::warn!(
                instance = handle.instance.0,
                node = %handle.node,
                "abort finish for a task whose instance is gone ignored"
            ),
        }
    }

    fn instance(&self, id: InstanceId) -> Option<&TreeInstance<W>> {
        self.instances.iter().find(|instance| instance.id == id)
    }

    fn index_of(&self, id: InstanceId) -> Option<usize> {
        self.instances.iter().position(|instance| instance.id == id)
    }

    fn incompatible(&self, tree: &BehaviorTree<W>) -> TreeError {
        TreeError::IncompatibleBlackboard {
            tree: tree.name().to_string(),
            expected: tree
                .blackboard_data()
                .map(|data| data.name().to_string())
                .unwrap_or_default(),
            actual: self
                .blackboard
                .blackboard_data()
                .map(|data| data.name().to_string())
                .unwrap_or_else(|| "<none>".to_string()),
        }
    }

    fn current_task(&self, index: usize, node: NodeId, serial: u64) -> Option<ActiveTask> {
        self.instances
            .get(index)
            .and_then(|instance| instance.task)
            .filter(|task| task.node == node && task.serial == serial)
    }

    fn task_context<'a>(
        &'a mut self,
        world: &'a mut W,
        index: usize,
        node: NodeId,
        serial: u64,
        aborting: bool,
        commands: &'a mut Vec<NodeCommand<W>>,
    ) -> TaskContext<'a, W> {
        let instance = &mut self.instances[index];
        TaskContext {
            agent: self.agent,
            world,
            blackboard: &mut self.blackboard,
            memory: &mut instance.memory[node.index()],
            handle: TaskHandle {
                instance: instance.id,
                node,
                serial,
            },
            aborting,
            clock: self.clock,
            dynamic: &self.dynamic_subtrees,
            commands,
        }
    }

    fn aux_context<'a>(
        &'a mut self,
        world: &'a mut W,
        index: usize,
        node: NodeId,
        commands: &'a mut Vec<NodeCommand<W>>,
    ) -> AuxContext<'a, W> {
        AuxContext {
            agent: self.agent,
            world,
            blackboard: &mut self.blackboard,
            node,
            memory: &mut self.instances[index].memory[node.index()],
            clock: self.clock,
            commands,
        }
    }

    fn decorator_passes(&self, world: &W, index: usize, node: NodeId) -> bool {
        let instance = &self.instances[index];
        let NodeKind::Decorator { logic, inverse, .. } = &instance.tree.node(node).kind else {
            return true;
        };
        let ctx = ConditionContext {
            agent: self.agent,
            world,
            blackboard: &self.blackboard,
            memory: instance.memory[node.index()].as_deref(),
            clock: self.clock,
        };
        logic.calculate_raw_condition(&ctx) != *inverse
    }

    fn trace_event(&mut self, event: TraceEvent) {
        if self.tracer.is_enabled() {
            self.tracer.emit(event);
        }
    }

    fn trace_node(&mut self, tag: &'static str, index: usize, node: NodeId, value: i64) {
        if !self.tracer.is_enabled() {
            return;
        }
        let instance = &self.instances[index];
        let label = instance.tree.node_name(node).unwrap_or_default().to_string();
        let event = TraceEvent::new(self.clock.tick, tag)
            .at(instance.id.0, node.0)
            .with_value(value)
            .with_label(label);
        self.tracer.emit(event);
    }

    fn request(&mut self, request: ExecutionRequest) {
        let (index, node) = request.priority;
        self.trace_node(tags::REQUEST, index, node, i64::from(node.0));
        match self
            .pending_requests
            .binary_search_by(|pending| pending.priority.cmp(&request.priority))
        {
            Ok(slot) => self.pending_requests[slot] = request,
            Err(slot) => self.pending_requests.insert(slot, request),
        }
    }

    fn process_requests(&mut self, world: &mut W) {
        let mut searches = 0;
        loop {
            if let Some(transition) = self.pending_execution.take() {
                if self.any_aborting() {
                    self.pending_execution = Some(transition);
                    return;
                }
                self.apply(world, transition);
                continue;
            }

            self.drain_notices(world);

            let (request, immediate) = match self.immediate.pop_front() {
                Some(request) => (request, true),
                None if self.pending_requests.is_empty() => return,
                None => (self.pending_requests.remove(0), false),
            };
            if searches >= self.config.max_searches_per_tick {
                tracing::warn!(
                    limit = self.config.max_searches_per_tick,
                    "search limit reached; continuing next tick"
                );
                if immediate {
                    self.immediate.push_front(request);
                } else {
                    self.pending_requests.insert(0, request);
                }
                return;
            }
            searches += 1;
            self.search_count += 1;

            let outcome = self.search(world, &request);
            let Some(index) = self.index_of(request.instance) else {
                continue;
            };
            match outcome {
                SearchOutcome::Found(path) => {
                    let leaf = path[path.len() - 1];
                    let unchanged = self.instances[index]
                        .task
                        .is_some_and(|task| task.node == leaf && task.state == TaskState::Active);
                    if unchanged {
                        continue;
                    }
                    self.trace_node(tags::SEARCH, index, leaf, path.len() as i64);
                    if !immediate {
                        self.supersede_pending(&request);
                    }
                    self.apply(
                        world,
                        Transition::Enter {
                            instance: request.instance,
                            path,
                        },
                    );
                }
                SearchOutcome::InstanceFinished(result) => {
                    let root = self.instances[index].tree.root();
                    self.trace_node(tags::SEARCH, index, root, result.code());
                    if !immediate {
                        self.supersede_pending(&request);
                    }
                    self.apply(
                        world,
                        Transition::Unwind {
                            instance: request.instance,
                            result,
                        },
                    );
                }
                SearchOutcome::NoChange => {
                    let (_, requester) = request.priority;
                    self.trace_node(tags::SEARCH_ROLLBACK, index, requester, 0);
                }
            }
        }
    }

    /// A branch change made for `winner` re-evaluates every decorator from its position
    /// onwards, so the lower-priority requests still queued are answered by it.
    fn supersede_pending(&mut self, winner: &ExecutionRequest) {
        for dropped in self.pending_requests.drain(..) {
            tracing::trace!(
                requester = %dropped.priority.1,
                winner = %winner.priority.1,
                "execution request superseded"
            );
        }
    }

    fn any_aborting(&self) -> bool {
        self.instances.iter().any(|instance| {
            instance
                .task
                .is_some_and(|task| task.state == TaskState::Aborting)
        })
    }

    fn drain_notices(&mut self, world: &W) {
        let notices = std::mem::take(&mut *self.notices.lock());
        for notice in notices {
            let Some(index) = self.index_of(notice.instance) else {
                continue;
            };
            let instance = &self.instances[index];
            if !instance.is_aux_active(notice.node) {
                continue;
            }
            let tree = Arc::clone(&instance.tree);
            let NodeKind::Decorator {
                abort_mode,
                composite,
                child_index,
                ..
            } = &tree.node(notice.node).kind
            else {
                continue;
            };
            let executing = instance.link_on_path(*composite, *child_index);
            let passes = self.decorator_passes(world, index, notice.node);

            let start = if executing && !passes && abort_mode.aborts_self() {
                SearchStart::Continue {
                    composite: *composite,
                    after_child: *child_index,
                    result: NodeResult::Failed,
                }
            } else if !executing && passes && abort_mode.aborts_lower_priority() {
                SearchStart::Restart {
                    composite: *composite,
                    child: *child_index,
                }
            } else {
                continue;
            };
            tracing::debug!(
                instance = notice.instance.0,
                decorator = tree.node_name(notice.node).unwrap_or_default(),
                passes,
                "decorator condition changed"
            );
            self.request(ExecutionRequest {
                instance: notice.instance,
                start,
                priority: (index, notice.node),
            });
        }
    }

    fn search(&self, world: &W, request: &ExecutionRequest) -> SearchOutcome {
        let Some(index) = self.index_of(request.instance) else {
            return SearchOutcome::NoChange;
        };
        let instance = &self.instances[index];
        let tree = &instance.tree;

        let mut forced_child = None;
        let mut search_end = None;
        let (mut path, mut composite, mut last) = match request.start {
            SearchStart::Enter(root) => {
                if !instance.path.is_empty() {
                    return SearchOutcome::NoChange;
                }
                (vec![root], root, LastChild::None)
            }
            SearchStart::Continue {
                composite,
                after_child,
                result,
            } => {
                if !instance.link_on_path(composite, after_child) {
                    return SearchOutcome::NoChange;
                }
                let Some(prefix) = instance.prefix_through(composite) else {
                    return SearchOutcome::NoChange;
                };
                let last = LastChild::Finished {
                    index: after_child,
                    result,
                };
                (prefix, composite, last)
            }
            SearchStart::Restart { composite, child } => {
                let Some(active) = instance.active_child_of(composite) else {
                    return SearchOutcome::NoChange;
                };
                if active <= child {
                    return SearchOutcome::NoChange;
                }
                let Some(prefix) = instance.prefix_through(composite) else {
                    return SearchOutcome::NoChange;
                };
                search_end = Some(tree.children(composite)[active].start());
                forced_child = Some(child);
                (prefix, composite, LastChild::None)
            }
        };

        let mut steps = 0;
        loop {
            steps += 1;
            if steps > self.config.max_search_steps {
                tracing::error!(
                    tree = tree.name(),
                    limit = self.config.max_search_steps,
                    "search step limit exceeded; rolling back"
                );
                return SearchOutcome::NoChange;
            }

            let children = tree.children(composite);
            let selection = match forced_child.take() {
                Some(child) => ChildSelection::Child(child),
                None => match &tree.node(composite).kind {
                    NodeKind::Composite { logic, .. } => logic.next_child(last, children.len()),
                    _ => return SearchOutcome::NoChange,
                },
            };

            match selection {
                ChildSelection::Child(child) => {
                    let Some(link) = children.get(child) else {
                        tracing::error!(
                            tree = tree.name(),
                            composite = tree.node_name(composite).unwrap_or_default(),
                            child,
                            "composite selected a child it does not have"
                        );
                        return SearchOutcome::NoChange;
                    };
                    if search_end.is_some_and(|end| link.start() >= end) {
                        return SearchOutcome::NoChange;
                    }
                    let allowed = link
                        .decorators
                        .iter()
                        .all(|&decorator| self.decorator_passes(world, index, decorator));
                    if !allowed {
                        last = LastChild::Skipped { index: child };
                        continue;
                    }
                    path.push(link.node);
                    match &tree.node(link.node).kind {
                        NodeKind::Task { .. } => return SearchOutcome::Found(path),
                        _ => {
                            composite = link.node;
                            last = LastChild::None;
                        }
                    }
                }
                ChildSelection::Return(result) => {
                    let node = tree.node(composite);
                    match (node.parent, node.child_index) {
                        (Some(parent), Some(child)) if path.len() > 1 => {
                            path.pop();
                            composite = parent;
                            last = LastChild::Finished {
                                index: child,
                                result,
                            };
                        }
                        _ if search_end.is_some() => return SearchOutcome::NoChange,
                        _ => return SearchOutcome::InstanceFinished(result),
                    }
                }
            }
        }
    }

    fn apply(&mut self, world: &mut W, transition: Transition) {
        let Some(target) = self.index_of(transition.instance()) else {
            return;
        };

        for index in (target..self.instances.len()).rev() {
            if !self.abort_task(world, index) {
                tracing::debug!(
                    instance = self.instances[index].id.0,
                    "waiting for latent abort before switching branch"
                );
                self.pending_execution = Some(transition);
                return;
            }
        }
        while self.instances.len() > target + 1 {
            self.pop_instance(world);
        }

        match transition {
            Transition::Enter { path, .. } => {
                let tree = Arc::clone(&self.instances[target].tree);
                let desired = tree.relevant_aux(&path);
                self.deactivate_aux_except(world, target, &desired);
                let leaf = path[path.len() - 1];
                self.instances[target].path = path;
                self.activate_aux(world, target, &desired);
                self.execute_task(world, target, leaf);
            }
            Transition::Unwind { result, .. } => {
                self.deactivate_aux_except(world, target, &[]);
                self.instances[target].path.clear();
                if target == 0 {
                    if self.config.loop_root {
                        self.restart_root = true;
                    } else {
                        self.status = TreeStatus::Finished(result);
                    }
                    tracing::debug!(
                        agent = self.agent.stable_id(),
                        ?result,
                        "root tree finished"
                    );
                    return;
                }
                self.pop_instance(world);
                let pusher = target - 1;
                if let Some(task) = self.instances[pusher].task {
                    self.finish_task(world, pusher, task.node, task.serial, result);
                }
            }
        }
    }

    fn deactivate_aux_except(&mut self, world: &mut W, index: usize, keep: &[NodeId]) {
        let leaving: Vec<NodeId> = self.instances[index]
            .active_aux
            .iter()
            .rev()
            .copied()
            .filter(|node| keep.binary_search(node).is_err())
            .collect();
        for node in leaving {
            self.deactivate_aux(world, index, node);
        }
    }

    fn activate_aux(&mut self, world: &mut W, index: usize, desired: &[NodeId]) {
        let tree = Arc::clone(&self.instances[index].tree);
        for &node in desired {
            let instance = &mut self.instances[index];
            let Err(slot) = instance.active_aux.binary_search(&node) else {
                continue;
            };
            instance.active_aux.insert(slot, node);
            self.trace_node(tags::AUX_ACTIVATE, index, node, 0);

            let mut commands = Vec::new();
            match &tree.node(node).kind {
                NodeKind::Decorator { logic, .. } => {
                    logic.on_become_relevant(&mut self.aux_context(world, index, node, &mut commands));
                }
                NodeKind::Service {
                    logic,
                    interval,
                    tick_on_activation,
                } => {
                    self.instances[index].service_timers.insert(
                        node,
                        ServiceTimer {
                            remaining: *interval,
                            elapsed: 0.0,
                        },
                    );
                    let mut ctx = self.aux_context(world, index, node, &mut commands);
                    logic.on_become_relevant(&mut ctx);
                    if *tick_on_activation {
                        logic.tick(&mut ctx, 0.0);
                    }
                }
                _ => {}
            }
            self.apply_aux_commands(index, node, commands);
        }
    }

    fn deactivate_aux(&mut self, world: &mut W, index: usize, node: NodeId) {
        let instance = &mut self.instances[index];
        let Ok(slot) = instance.active_aux.binary_search(&node) else {
            return;
        };
        instance.active_aux.remove(slot);
        instance.service_timers.remove(&node);
        let id = instance.id;
        let tree = Arc::clone(&instance.tree);

        let mut commands = Vec::new();
        match &tree.node(node).kind {
            NodeKind::Decorator { logic, .. } => {
                logic.on_cease_relevant(&mut self.aux_context(world, index, node, &mut commands));
            }
            NodeKind::Service { logic, .. } => {
                logic.on_cease_relevant(&mut self.aux_context(world, index, node, &mut commands));
            }
            _ => {}
        }
        self.blackboard
            .unregister_observers_from(observer_owner(id, node));
        self.trace_node(tags::AUX_DEACTIVATE, index, node, 0);
    }

    fn apply_aux_commands(&mut self, index: usize, node: NodeId, commands: Vec<NodeCommand<W>>) {
        let instance = self.instances[index].id;
        for command in commands {
            match command {
                NodeCommand::ObserveKey(key) => self.observe_key(instance, node, key),
                NodeCommand::AbortBranch => self.request_branch_abort(index, node),
                _ => tracing::warn!(%node, "task-only command from auxiliary node ignored"),
            }
        }
    }

    fn observe_key(&mut self, instance: InstanceId, node: NodeId, key: KeyId) {
        let notices = Arc::clone(&self.notices);
        self.blackboard
            .register_observer(key, observer_owner(instance, node), move |_, _| {
                notices.lock().push(KeyNotice { instance, node });
                ObserverResult::ContinueObserving
            });
    }

    fn request_branch_abort(&mut self, index: usize, node: NodeId) {
        let instance = &self.instances[index];
        let NodeKind::Decorator {
            composite,
            child_index,
            ..
        } = &instance.tree.node(node).kind
        else {
            tracing::warn!(%node, "only decorators can abort their branch");
            return;
        };
        if !instance.link_on_path(*composite, *child_index) {
            return;
        }
        let request = ExecutionRequest {
            instance: instance.id,
            start: SearchStart::Continue {
                composite: *composite,
                after_child: *child_index,
                result: NodeResult::Failed,
            },
            priority: (index, node),
        };
        self.request(request);
    }

    fn execute_task(&mut self, world: &mut W, index: usize, node: NodeId) {
        let serial = self.next_serial;
        self.next_serial += 1;
        let instance = &mut self.instances[index];
        instance.task = Some(ActiveTask {
            node,
            serial,
            state: TaskState::Active,
        });
        instance.task_states.insert(node, TaskState::Active);
        let tree = Arc::clone(&instance.tree);
        tracing::trace!(
            instance = instance.id.0,
            task = tree.node_name(node).unwrap_or_default(),
            "executing task"
        );
        self.trace_node(tags::TASK_EXECUTE, index, node, 0);

        let NodeKind::Task { logic, .. } = &tree.node(node).kind else {
            return;
        };
        let mut commands = Vec::new();
        let result =
            logic.execute(&mut self.task_context(world, index, node, serial, false, &mut commands));
        match result {
            TaskResult::Succeeded => {
                self.finish_task(world, index, node, serial, NodeResult::Succeeded)
            }
            TaskResult::Failed => self.finish_task(world, index, node, serial, NodeResult::Failed),
            TaskResult::InProgress => self.apply_task_commands(world, index, node, serial, commands),
        }
    }

    fn apply_task_commands(
        &mut self,
        world: &mut W,
        index: usize,
        node: NodeId,
        serial: u64,
        commands: Vec<NodeCommand<W>>,
    ) {
        for command in commands {
            if self.current_task(index, node, serial).is_none() {
                return;
            }
            match command {
                NodeCommand::Finish(result) => self.finish_task(world, index, node, serial, result),
                NodeCommand::FinishAbort => self.finish_abort(world, index, node, serial),
                NodeCommand::WaitForMessage { name, request_id } => {
                    self.message_waits.push(MessageWait {
                        instance: self.instances[index].id,
                        node,
                        serial,
                        name,
                        request_id,
                    });
                }
                NodeCommand::PushSubtree(tree) => {
                    self.push_subtree(world, index, node, serial, tree)
                }
                NodeCommand::ObserveKey(_) | NodeCommand::AbortBranch => {
                    tracing::warn!(%node, "auxiliary-only command from task ignored")
                }
            }
        }
    }

    /// Returns false while the abort is still in progress.
    fn abort_task(&mut self, world: &mut W, index: usize) -> bool {
        let Some(task) = self.instances[index].task else {
            return true;
        };
        if task.state == TaskState::Aborting {
            return false;
        }
        let instance = &mut self.instances[index];
        instance.task = Some(ActiveTask {
            state: TaskState::Aborting,
            ..task
        });
        instance.task_states.insert(task.node, TaskState::Aborting);
        let tree = Arc::clone(&instance.tree);
        self.trace_node(tags::TASK_ABORT, index, task.node, 0);

        let NodeKind::Task { logic, .. } = &tree.node(task.node).kind else {
            self.complete_abort(world, index);
            return true;
        };
        let mut commands = Vec::new();
        let result = logic.abort(&mut self.task_context(
            world,
            index,
            task.node,
            task.serial,
            true,
            &mut commands,
        ));
        match result {
            AbortResult::Aborted => {
                self.complete_abort(world, index);
                true
            }
            AbortResult::InProgress => {
                self.apply_task_commands(world, index, task.node, task.serial, commands);
                self.current_task(index, task.node, task.serial).is_none()
            }
        }
    }

    fn finish_task(
        &mut self,
        world: &mut W,
        index: usize,
        node: NodeId,
        serial: u64,
        result: NodeResult,
    ) {
        let Some(task) = self.current_task(index, node, serial) else {
            tracing::warn!(%node, serial, ?result, "finish for an inactive task execution ignored");
            return;
        };
        if task.state == TaskState::Aborting {
            self.complete_abort(world, index);
            return;
        }
        self.end_task(world, index, result);

        let instance = &self.instances[index];
        let tree_node = instance.tree.node(node);
        if let (Some(composite), Some(after_child)) = (tree_node.parent, tree_node.child_index) {
            self.immediate.push_back(ExecutionRequest {
                instance: instance.id,
                start: SearchStart::Continue {
                    composite,
                    after_child,
                    result,
                },
                priority: (index, node),
            });
        }
    }

    fn finish_abort(&mut self, world: &mut W, index: usize, node: NodeId, serial: u64) {
        match self.current_task(index, node, serial) {
            Some(task) if task.state == TaskState::Aborting => self.complete_abort(world, index),
            _ => tracing::warn!(%node, serial, "abort finish for a task that is not aborting ignored"),
        }
    }

    fn complete_abort(&mut self, world: &mut W, index: usize) {
        self.end_task(world, index, NodeResult::Aborted);
    }

    /// Clears the task slot, records the result and runs the task's completion callback.
    fn end_task(&mut self, world: &mut W, index: usize, result: NodeResult) {
        let instance = &mut self.instances[index];
        let Some(task) = instance.task.take() else {
            return;
        };
        instance.task_states.insert(task.node, result.into());
        let id = instance.id;
        let tree = Arc::clone(&instance.tree);
        self.message_waits
            .retain(|wait| !(wait.instance == id && wait.node == task.node));

        if let NodeKind::Task { logic, .. } = &tree.node(task.node).kind {
            let mut commands = Vec::new();
            logic.on_task_finished(
                &mut self.task_context(world, index, task.node, task.serial, false, &mut commands),
                result,
            );
        }
        tracing::trace!(
            instance = id.0,
            task = tree.node_name(task.node).unwrap_or_default(),
            ?result,
            "task finished"
        );
        self.trace_node(tags::TASK_FINISH, index, task.node, result.code());
    }

    fn push_subtree(
        &mut self,
        world: &mut W,
        index: usize,
        node: NodeId,
        serial: u64,
        tree: Arc<BehaviorTree<W>>,
    ) {
        if let Err(err) = self.check_push(index, &tree) {
            tracing::warn!(tree = tree.name(), error = %err, "subtree push refused");
            self.finish_task(world, index, node, serial, NodeResult::Failed);
            return;
        }
        let root = tree.root();
        let instance = self.push_instance(tree);
        self.immediate.push_back(ExecutionRequest {
            instance,
            start: SearchStart::Enter(root),
            priority: (index + 1, root),
        });
    }

    fn check_push(&self, index: usize, tree: &Arc<BehaviorTree<W>>) -> Result<(), TreeError> {
        if self.instances.len() >= self.config.max_instance_depth {
            return Err(TreeError::InstanceDepthExceeded {
                limit: self.config.max_instance_depth,
            });
        }
        if index + 1 != self.instances.len()
            || self
                .instances
                .iter()
                .any(|instance| Arc::ptr_eq(&instance.tree, tree))
        {
            return Err(TreeError::RecursiveSubtree {
                tree: tree.name().to_string(),
            });
        }
        if let Some(data) = tree.blackboard_data() {
            if !self.blackboard.is_compatible_with(data) {
                return Err(self.incompatible(tree));
            }
        }
        Ok(())
    }

    fn push_instance(&mut self, tree: Arc<BehaviorTree<W>>) -> InstanceId {
        let id = InstanceId(self.next_instance);
        self.next_instance += 1;
        let memory = tree
            .nodes()
            .map(|(node_id, node)| {
                if node.creates_node_instance() {
                    self.node_pool
                        .remove(&(tree.id(), node_id))
                        .or_else(|| node.create_memory())
                } else {
                    node.create_memory()
                }
            })
            .collect();
        tracing::debug!(instance = id.0, tree = tree.name(), "pushing tree instance");
        if self.tracer.is_enabled() {
            let event = TraceEvent::new(self.clock.tick, tags::INSTANCE_PUSH)
                .at(id.0, 0)
                .with_value(self.instances.len() as i64)
                .with_label(tree.name().to_string());
            self.tracer.emit(event);
        }
        self.instances.push(TreeInstance {
            id,
            tree,
            memory,
            path: Vec::new(),
            task: None,
            active_aux: Vec::new(),
            service_timers: BTreeMap::new(),
            task_states: BTreeMap::new(),
        });
        id
    }

    /// Pops the top instance. Its task must already have ended.
    fn pop_instance(&mut self, world: &mut W) {
        let Some(top) = self.instances.len().checked_sub(1) else {
            return;
        };
        self.deactivate_aux_except(world, top, &[]);
        let Some(mut instance) = self.instances.pop() else {
            return;
        };
        for (node_id, node) in instance.tree.nodes() {
            if node.creates_node_instance() {
                if let Some(memory) = instance.memory[node_id.index()].take() {
                    self.node_pool.insert((instance.tree.id(), node_id), memory);
                }
            }
        }
        let id = instance.id;
        self.message_waits.retain(|wait| wait.instance != id);
        tracing::debug!(instance = id.0, tree = instance.tree.name(), "popped tree instance");
        if self.tracer.is_enabled() {
            let event = TraceEvent::new(self.clock.tick, tags::INSTANCE_POP)
                .at(id.0, 0)
                .with_value(top as i64)
                .with_label(instance.tree.name().to_string());
            self.tracer.emit(event);
        }
    }

    fn tick_aux(&mut self, world: &mut W, dt: f32) {
        let active: Vec<(usize, InstanceId, NodeId)> = self
            .instances
            .iter()
            .enumerate()
            .flat_map(|(index, instance)| {
                instance
                    .active_aux
                    .iter()
                    .map(move |&node| (index, instance.id, node))
            })
            .collect();

        for (index, id, node) in active {
            let still_active = self
                .instances
                .get(index)
                .is_some_and(|instance| instance.id == id && instance.is_aux_active(node));
            if !still_active {
                continue;
            }
            let tree = Arc::clone(&self.instances[index].tree);
            let mut commands = Vec::new();
            match &tree.node(node).kind {
                NodeKind::Service { logic, interval, .. } => {
                    let Some(timer) = self.instances[index].service_timers.get_mut(&node) else {
                        continue;
                    };
                    timer.elapsed += dt;
                    timer.remaining -= dt;
                    if timer.remaining > 0.0 {
                        continue;
                    }
                    let elapsed = timer.elapsed;
                    timer.elapsed = 0.0;
                    timer.remaining = *interval;
                    logic.tick(&mut self.aux_context(world, index, node, &mut commands), elapsed);
                }
                NodeKind::Decorator { logic, .. } if logic.wants_tick() => {
                    logic.tick(&mut self.aux_context(world, index, node, &mut commands), dt);
                }
                _ => continue,
            }
            self.apply_aux_commands(index, node, commands);
        }
    }

    fn tick_tasks(&mut self, world: &mut W, dt: f32) {
        let active: Vec<(usize, ActiveTask)> = self
            .instances
            .iter()
            .enumerate()
            .filter_map(|(index, instance)| instance.task.map(|task| (index, task)))
            .collect();

        for (index, task) in active {
            let Some(current) = self.current_task(index, task.node, task.serial) else {
                continue;
            };
            let tree = Arc::clone(&self.instances[index].tree);
            let NodeKind::Task { logic, .. } = &tree.node(task.node).kind else {
                continue;
            };
            if !logic.wants_tick() {
                continue;
            }
            let mut commands = Vec::new();
            let aborting = current.state == TaskState::Aborting;
            logic.tick(
                &mut self.task_context(world, index, task.node, task.serial, aborting, &mut commands),
                dt,
            );
            self.apply_task_commands(world, index, task.node, task.serial, commands);
        }
    }
}

impl<W: WorldMut + 'static> fmt::Debug for BehaviorTreeComponent<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorTreeComponent")
            .field("agent", &self.agent)
            .field("status", &self.status)
            .field("instances", &self.instances.len())
            .field("active_task", &self.active_task_name())
            .field("search_count", &self.search_count)
            .finish()
    }
}
