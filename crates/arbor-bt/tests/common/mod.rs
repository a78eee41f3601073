#![allow(dead_code)]

use std::sync::Arc;

use arbor_bt::{
    AbortResult, BehaviorTree, BehaviorTreeComponent, NodeMemory, NodeResult, TaskContext,
    TaskNode, TaskResult,
};
use arbor_core::{TickContext, WorldMut, WorldView};
use tracing_subscriber::EnvFilter;

/// World that records every task callback in call order.
#[derive(Debug, Default)]
pub struct RecordingWorld {
    pub log: Vec<String>,
}

impl RecordingWorld {
    pub fn count(&self, entry: &str) -> usize {
        self.log.iter().filter(|line| *line == entry).count()
    }

    pub fn position(&self, entry: &str) -> Option<usize> {
        self.log.iter().position(|line| line == entry)
    }
}

impl WorldView for RecordingWorld {
    type Agent = u64;
}

impl WorldMut for RecordingWorld {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
    Latent,
    /// Latent, and aborting also takes until `finish_latent_abort`.
    LatentAbort,
}

#[derive(Debug, Clone, Copy)]
pub struct Record {
    name: &'static str,
    outcome: Outcome,
}

impl Record {
    pub fn succeed(name: &'static str) -> Self {
        Self {
            name,
            outcome: Outcome::Succeed,
        }
    }

    pub fn fail(name: &'static str) -> Self {
        Self {
            name,
            outcome: Outcome::Fail,
        }
    }

    pub fn latent(name: &'static str) -> Self {
        Self {
            name,
            outcome: Outcome::Latent,
        }
    }

    pub fn latent_abort(name: &'static str) -> Self {
        Self {
            name,
            outcome: Outcome::LatentAbort,
        }
    }
}

impl TaskNode<RecordingWorld> for Record {
    fn execute(&self, ctx: &mut TaskContext<'_, RecordingWorld>) -> TaskResult {
        ctx.world.log.push(format!("execute:{}", self.name));
        match self.outcome {
            Outcome::Succeed => TaskResult::Succeeded,
            Outcome::Fail => TaskResult::Failed,
            Outcome::Latent | Outcome::LatentAbort => TaskResult::InProgress,
        }
    }

    fn abort(&self, ctx: &mut TaskContext<'_, RecordingWorld>) -> AbortResult {
        ctx.world.log.push(format!("abort:{}", self.name));
        match self.outcome {
            Outcome::LatentAbort => AbortResult::InProgress,
            _ => AbortResult::Aborted,
        }
    }

    fn on_task_finished(&self, ctx: &mut TaskContext<'_, RecordingWorld>, result: NodeResult) {
        ctx.world.log.push(format!("finished:{}:{result:?}", self.name));
    }
}

/// Pushes a subtree, like `RunBehavior`, but records its completion callback.
pub struct Pusher {
    pub name: &'static str,
    pub tree: Arc<BehaviorTree<RecordingWorld>>,
}

impl TaskNode<RecordingWorld> for Pusher {
    fn execute(&self, ctx: &mut TaskContext<'_, RecordingWorld>) -> TaskResult {
        ctx.world.log.push(format!("execute:{}", self.name));
        ctx.push_subtree(Arc::clone(&self.tree));
        TaskResult::InProgress
    }

    fn on_task_finished(&self, ctx: &mut TaskContext<'_, RecordingWorld>, result: NodeResult) {
        ctx.world.log.push(format!("finished:{}:{result:?}", self.name));
    }
}

/// Counts its executions in its own memory and logs the running count.
pub struct Counter {
    pub name: &'static str,
    pub pooled: bool,
}

impl TaskNode<RecordingWorld> for Counter {
    fn execute(&self, ctx: &mut TaskContext<'_, RecordingWorld>) -> TaskResult {
        let count = match ctx.memory::<u32>() {
            Some(count) => {
                *count += 1;
                *count
            }
            None => 0,
        };
        ctx.world.log.push(format!("{}:{count}", self.name));
        TaskResult::Succeeded
    }

    fn create_memory(&self) -> Option<NodeMemory> {
        Some(Box::new(0u32))
    }

    fn creates_node_instance(&self) -> bool {
        self.pooled
    }
}

pub fn tick(component: &mut BehaviorTreeComponent<RecordingWorld>, world: &mut RecordingWorld, tick: u64) {
    component.tick(world, &TickContext::new(tick, 0.1));
}

pub fn run(
    component: &mut BehaviorTreeComponent<RecordingWorld>,
    world: &mut RecordingWorld,
    ticks: std::ops::Range<u64>,
) {
    for t in ticks {
        tick(component, world, t);
    }
}

/// Routes scheduler logs to the test output; filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn start(
    tree: BehaviorTree<RecordingWorld>,
    world: &mut RecordingWorld,
) -> (Arc<BehaviorTree<RecordingWorld>>, BehaviorTreeComponent<RecordingWorld>) {
    init_tracing();
    let tree = Arc::new(tree);
    let mut component = BehaviorTreeComponent::new(1);
    component.tracer_mut().record();
    component
        .start_tree(world, Arc::clone(&tree))
        .expect("tree starts");
    (tree, component)
}
