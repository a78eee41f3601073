//! Immutable behavior tree assets and the builder used to declare them.
//!
//! A tree is declared as a nested [`NodeSpec`] and flattened by [`BehaviorTree::build`] into a
//! depth-first array. The array index of a node is its [`NodeId`]; a lower id always means
//! higher execution priority. For a composite the order is: the composite, its services, then
//! for each child the child's decorators followed by the child's subtree. A task is followed by
//! its own services.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbor_core::{BlackboardData, KeyId, KeyKind, TestOperation, WorldMut};

use crate::composites::{Selector, Sequence};
use crate::error::TreeError;
use crate::node::{
    CompositeNode, DecoratorNode, FlowAbortMode, NodeId, NodeMemory, ServiceNode, TaskNode,
};

static NEXT_TREE_ID: AtomicU64 = AtomicU64::new(1);

/// Name-to-key lookup handed to nodes while their tree is built.
pub struct KeyResolver<'a> {
    tree: &'a str,
    node: &'a str,
    data: Option<&'a BlackboardData>,
}

impl<'a> KeyResolver<'a> {
    pub fn tree_name(&self) -> &str {
        self.tree
    }

    pub fn node_name(&self) -> &str {
        self.node
    }

    pub fn blackboard(&self) -> Option<&BlackboardData> {
        self.data
    }

    pub fn key(&self, name: &str) -> Result<KeyId, TreeError> {
        let data = self.data.ok_or_else(|| TreeError::MissingBlackboard {
            node: self.node.to_string(),
            key: name.to_string(),
        })?;
        data.key_id(name).ok_or_else(|| TreeError::UnknownKey {
            node: self.node.to_string(),
            key: name.to_string(),
        })
    }

    /// Resolves `name` and checks that its type supports `operation` queries.
    pub fn key_with_operation(
        &self,
        name: &str,
        operation: TestOperation,
    ) -> Result<KeyId, TreeError> {
        let key = self.key(name)?;
        let actual = self
            .data
            .and_then(|data| data.key(key))
            .map(|entry| entry.key_type.test_operation())
            .unwrap_or(TestOperation::Basic);
        if actual != operation {
            return Err(TreeError::KeyQueryMismatch {
                node: self.node.to_string(),
                key: name.to_string(),
                expected: operation,
                actual,
            });
        }
        Ok(key)
    }

    pub fn key_kind(&self, key: KeyId) -> Option<KeyKind> {
        self.data.and_then(|data| data.key_kind(key))
    }
}

/// One guarded child of a composite.
#[derive(Debug, Clone)]
pub(crate) struct ChildLink {
    pub(crate) node: NodeId,
    pub(crate) decorators: Vec<NodeId>,
}

impl ChildLink {
    /// First node of the link in execution order: its first decorator, or the child itself.
    pub(crate) fn start(&self) -> NodeId {
        self.decorators.first().copied().unwrap_or(self.node)
    }
}

pub(crate) enum NodeKind<W: WorldMut + 'static> {
    Composite {
        logic: Box<dyn CompositeNode>,
        children: Vec<ChildLink>,
        services: Vec<NodeId>,
    },
    Task {
        logic: Box<dyn TaskNode<W>>,
        services: Vec<NodeId>,
    },
    Decorator {
        logic: Box<dyn DecoratorNode<W>>,
        abort_mode: FlowAbortMode,
        inverse: bool,
        composite: NodeId,
        child_index: usize,
    },
    Service {
        logic: Box<dyn ServiceNode<W>>,
        interval: f32,
        tick_on_activation: bool,
    },
}

pub(crate) struct TreeNode<W: WorldMut + 'static> {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeId>,
    /// Index among the parent composite's children; only set for composites and tasks.
    pub(crate) child_index: Option<usize>,
    pub(crate) depth: u16,
    pub(crate) kind: NodeKind<W>,
}

impl<W: WorldMut + 'static> TreeNode<W> {
    pub(crate) fn create_memory(&self) -> Option<NodeMemory> {
        match &self.kind {
            NodeKind::Composite { .. } => None,
            NodeKind::Task { logic, .. } => logic.create_memory(),
            NodeKind::Decorator { logic, .. } => logic.create_memory(),
            NodeKind::Service { logic, .. } => logic.create_memory(),
        }
    }

    pub(crate) fn creates_node_instance(&self) -> bool {
        match &self.kind {
            NodeKind::Composite { .. } => false,
            NodeKind::Task { logic, .. } => logic.creates_node_instance(),
            NodeKind::Decorator { logic, .. } => logic.creates_node_instance(),
            NodeKind::Service { logic, .. } => logic.creates_node_instance(),
        }
    }

    fn kind_label(&self) -> &'static str {
        match &self.kind {
            NodeKind::Composite { .. } => "composite",
            NodeKind::Task { .. } => "task",
            NodeKind::Decorator { .. } => "decorator",
            NodeKind::Service { .. } => "service",
        }
    }
}

/// Shared, immutable tree asset. Run it with a
/// [`BehaviorTreeComponent`](crate::BehaviorTreeComponent).
pub struct BehaviorTree<W: WorldMut + 'static> {
    id: u64,
    name: String,
    blackboard: Option<Arc<BlackboardData>>,
    nodes: Vec<TreeNode<W>>,
}

impl<W: WorldMut + 'static> BehaviorTree<W> {
    /// Validates and flattens `root`, then lets every node resolve its blackboard keys.
    pub fn build(
        name: impl Into<String>,
        blackboard: Option<Arc<BlackboardData>>,
        root: NodeSpec<W>,
    ) -> Result<Self, TreeError> {
        let name = name.into();
        if !root.is_composite() {
            return Err(TreeError::RootNotComposite {
                tree: name,
                node: root.name,
            });
        }
        if !root.decorators.is_empty() {
            return Err(TreeError::RootDecorators {
                tree: name,
                node: root.name,
            });
        }
        root.validate(&name)?;

        let mut nodes = Vec::new();
        flatten(root, None, None, 0, &mut nodes, &name);

        if let Some(data) = &blackboard {
            data.validate()?;
        }
        for node in &mut nodes {
            let resolver = KeyResolver {
                tree: &name,
                node: &node.name,
                data: blackboard.as_deref(),
            };
            match &mut node.kind {
                NodeKind::Composite { .. } => {}
                NodeKind::Task { logic, .. } => logic.resolve_keys(&resolver)?,
                NodeKind::Decorator { logic, .. } => logic.resolve_keys(&resolver)?,
                NodeKind::Service { logic, .. } => logic.resolve_keys(&resolver)?,
            }
        }

        tracing::debug!(tree = %name, nodes = nodes.len(), "built behavior tree");
        Ok(Self {
            id: NEXT_TREE_ID.fetch_add(1, Ordering::Relaxed),
            name,
            blackboard,
            nodes,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn blackboard_data(&self) -> Option<&Arc<BlackboardData>> {
        self.blackboard.as_ref()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// First node (in execution order) called `name`.
    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|node| node.name == name)
            .map(|index| NodeId(index as u32))
    }

    pub fn node_name(&self, node: NodeId) -> Option<&str> {
        self.nodes.get(node.index()).map(|node| node.name.as_str())
    }

    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        self.nodes.get(node.index()).and_then(|node| node.parent)
    }

    pub fn depth_of(&self, node: NodeId) -> Option<u16> {
        self.nodes.get(node.index()).map(|node| node.depth)
    }

    /// Abort mode a decorator ended up with after build-time adjustments.
    pub fn abort_mode_of(&self, node: NodeId) -> Option<FlowAbortMode> {
        match &self.nodes.get(node.index())?.kind {
            NodeKind::Decorator { abort_mode, .. } => Some(*abort_mode),
            _ => None,
        }
    }

    pub(crate) fn node(&self, node: NodeId) -> &TreeNode<W> {
        &self.nodes[node.index()]
    }

    pub(crate) fn nodes(&self) -> impl Iterator<Item = (NodeId, &TreeNode<W>)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index as u32), node))
    }

    pub(crate) fn children(&self, composite: NodeId) -> &[ChildLink] {
        match &self.node(composite).kind {
            NodeKind::Composite { children, .. } => children,
            _ => &[],
        }
    }

    /// Root-to-`node` chain of composites and the node itself.
    pub(crate) fn path_to(&self, node: NodeId) -> Vec<NodeId> {
        let mut path = vec![node];
        let mut current = node;
        while let Some(parent) = self.node(current).parent {
            path.push(parent);
            current = parent;
        }
        path.reverse();
        path
    }

    /// Decorators and services that must be active while `path` is the executing branch,
    /// sorted by execution index.
    ///
    /// That is every service along the path, every decorator guarding a link on the path, and
    /// the lower-priority-aborting decorators of earlier siblings of each link on the path.
    pub(crate) fn relevant_aux(&self, path: &[NodeId]) -> Vec<NodeId> {
        let mut aux = Vec::new();
        for (position, &node) in path.iter().enumerate() {
            match &self.node(node).kind {
                NodeKind::Composite {
                    children, services, ..
                } => {
                    aux.extend_from_slice(services);
                    let Some(next) = path.get(position + 1) else {
                        continue;
                    };
                    let Some(active) = self.node(*next).child_index else {
                        continue;
                    };
                    for link in &children[..active] {
                        aux.extend(link.decorators.iter().copied().filter(|&decorator| {
                            self.abort_mode_of(decorator)
                                .is_some_and(FlowAbortMode::aborts_lower_priority)
                        }));
                    }
                    aux.extend_from_slice(&children[active].decorators);
                }
                NodeKind::Task { services, .. } => aux.extend_from_slice(services),
                _ => {}
            }
        }
        aux.sort_unstable();
        aux
    }
}

impl<W: WorldMut + 'static> fmt::Debug for BehaviorTree<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorTree")
            .field("id", &self.id)
            .field("name", &self.name)
            .field(
                "blackboard",
                &self.blackboard.as_ref().map(|data| data.name().to_string()),
            )
            .field("nodes", &self.nodes.len())
            .finish()
    }
}

impl<W: WorldMut + 'static> fmt::Display for BehaviorTree<W> {
    /// One line per node, indented by depth.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, node) in self.nodes() {
            writeln!(
                f,
                "{:indent$}[{}] {} ({})",
                "",
                id,
                node.name,
                node.kind_label(),
                indent = node.depth as usize * 2
            )?;
        }
        Ok(())
    }
}

fn flatten<W: WorldMut + 'static>(
    spec: NodeSpec<W>,
    parent: Option<NodeId>,
    child_index: Option<usize>,
    depth: u16,
    nodes: &mut Vec<TreeNode<W>>,
    tree: &str,
) -> NodeId {
    let id = NodeId(nodes.len() as u32);
    let NodeSpec {
        name,
        kind,
        services,
        children,
        ..
    } = spec;

    match kind {
        SpecKind::Task(logic) => {
            nodes.push(TreeNode {
                name,
                parent,
                child_index,
                depth,
                kind: NodeKind::Task {
                    logic,
                    services: Vec::new(),
                },
            });
            let service_ids = push_services(services, id, depth + 1, nodes);
            if let NodeKind::Task { services, .. } = &mut nodes[id.index()].kind {
                *services = service_ids;
            }
        }
        SpecKind::Composite(logic) => {
            let allows_lower_priority = logic.allows_lower_priority_abort();
            nodes.push(TreeNode {
                name,
                parent,
                child_index,
                depth,
                kind: NodeKind::Composite {
                    logic,
                    children: Vec::new(),
                    services: Vec::new(),
                },
            });
            let service_ids = push_services(services, id, depth + 1, nodes);

            let mut links = Vec::with_capacity(children.len());
            for (index, mut child) in children.into_iter().enumerate() {
                let mut decorators = Vec::new();
                for decorator in std::mem::take(&mut child.decorators) {
                    let mut abort_mode = decorator.abort_mode;
                    if !allows_lower_priority && abort_mode.aborts_lower_priority() {
                        tracing::warn!(
                            tree,
                            decorator = %decorator.name,
                            "composite does not allow lower priority aborts; abort mode downgraded"
                        );
                        abort_mode = abort_mode.without_lower_priority();
                    }
                    decorators.push(NodeId(nodes.len() as u32));
                    nodes.push(TreeNode {
                        name: decorator.name,
                        parent: Some(id),
                        child_index: None,
                        depth: depth + 1,
                        kind: NodeKind::Decorator {
                            logic: decorator.logic,
                            abort_mode,
                            inverse: decorator.inverse,
                            composite: id,
                            child_index: index,
                        },
                    });
                }
                let node = flatten(child, Some(id), Some(index), depth + 1, nodes, tree);
                links.push(ChildLink { node, decorators });
            }

            if let NodeKind::Composite {
                children, services, ..
            } = &mut nodes[id.index()].kind
            {
                *children = links;
                *services = service_ids;
            }
        }
    }
    id
}

fn push_services<W: WorldMut + 'static>(
    services: Vec<ServiceSpec<W>>,
    owner: NodeId,
    depth: u16,
    nodes: &mut Vec<TreeNode<W>>,
) -> Vec<NodeId> {
    services
        .into_iter()
        .map(|service| {
            let id = NodeId(nodes.len() as u32);
            nodes.push(TreeNode {
                name: service.name,
                parent: Some(owner),
                child_index: None,
                depth,
                kind: NodeKind::Service {
                    logic: service.logic,
                    interval: service.interval,
                    tick_on_activation: service.tick_on_activation,
                },
            });
            id
        })
        .collect()
}

enum SpecKind<W: WorldMut + 'static> {
    Composite(Box<dyn CompositeNode>),
    Task(Box<dyn TaskNode<W>>),
}

/// Declarative description of a composite or task, with its decorators and services.
pub struct NodeSpec<W: WorldMut + 'static> {
    name: String,
    kind: SpecKind<W>,
    decorators: Vec<DecoratorSpec<W>>,
    services: Vec<ServiceSpec<W>>,
    children: Vec<NodeSpec<W>>,
}

impl<W: WorldMut + 'static> NodeSpec<W> {
    pub fn composite(name: impl Into<String>, logic: impl CompositeNode) -> Self {
        Self {
            name: name.into(),
            kind: SpecKind::Composite(Box::new(logic)),
            decorators: Vec::new(),
            services: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn selector(name: impl Into<String>) -> Self {
        Self::composite(name, Selector)
    }

    pub fn sequence(name: impl Into<String>) -> Self {
        Self::composite(name, Sequence)
    }

    pub fn task(name: impl Into<String>, logic: impl TaskNode<W>) -> Self {
        Self {
            name: name.into(),
            kind: SpecKind::Task(Box::new(logic)),
            decorators: Vec::new(),
            services: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn child(mut self, child: NodeSpec<W>) -> Self {
        self.children.push(child);
        self
    }

    pub fn decorator(mut self, decorator: DecoratorSpec<W>) -> Self {
        self.decorators.push(decorator);
        self
    }

    pub fn service(mut self, service: ServiceSpec<W>) -> Self {
        self.services.push(service);
        self
    }

    fn is_composite(&self) -> bool {
        matches!(self.kind, SpecKind::Composite(_))
    }

    fn validate(&self, tree: &str) -> Result<(), TreeError> {
        match &self.kind {
            SpecKind::Task(_) if !self.children.is_empty() => Err(TreeError::TaskWithChildren {
                tree: tree.to_string(),
                node: self.name.clone(),
            }),
            SpecKind::Composite(_) if self.children.is_empty() => {
                Err(TreeError::EmptyComposite {
                    tree: tree.to_string(),
                    node: self.name.clone(),
                })
            }
            _ => self
                .children
                .iter()
                .try_for_each(|child| child.validate(tree)),
        }
    }
}

/// A decorator attached to the node it is declared on.
pub struct DecoratorSpec<W: WorldMut + 'static> {
    name: String,
    logic: Box<dyn DecoratorNode<W>>,
    abort_mode: FlowAbortMode,
    inverse: bool,
}

impl<W: WorldMut + 'static> DecoratorSpec<W> {
    pub fn new(name: impl Into<String>, logic: impl DecoratorNode<W>) -> Self {
        Self {
            name: name.into(),
            logic: Box::new(logic),
            abort_mode: FlowAbortMode::None,
            inverse: false,
        }
    }

    pub fn abort_mode(mut self, abort_mode: FlowAbortMode) -> Self {
        self.abort_mode = abort_mode;
        self
    }

    /// Negates the decorator's raw condition.
    pub fn inverse(mut self) -> Self {
        self.inverse = true;
        self
    }
}

/// A service attached to the composite or task it is declared on.
pub struct ServiceSpec<W: WorldMut + 'static> {
    name: String,
    logic: Box<dyn ServiceNode<W>>,
    interval: f32,
    tick_on_activation: bool,
}

impl<W: WorldMut + 'static> ServiceSpec<W> {
    pub fn new(name: impl Into<String>, logic: impl ServiceNode<W>) -> Self {
        Self {
            name: name.into(),
            logic: Box::new(logic),
            interval: 0.5,
            tick_on_activation: false,
        }
    }

    /// Seconds between ticks. Zero ticks every scheduler tick.
    pub fn interval(mut self, seconds: f32) -> Self {
        self.interval = seconds.max(0.0);
        self
    }

    pub fn tick_on_activation(mut self) -> Self {
        self.tick_on_activation = true;
        self
    }
}
