use std::sync::Arc;

use arbor_bt::{
    BehaviorTree, BehaviorTreeComponent, BlackboardDecorator, DecoratorSpec, FlowAbortMode,
    NodeResult, NodeSpec, TaskContext, TaskNode, TaskResult,
};
use arbor_core::blackboard::keys::IntKey;
use arbor_core::{ArithmeticOp, BlackboardData, KeyEntry, TickContext, WorldMut, WorldView};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

#[derive(Default)]
struct World;

impl WorldView for World {
    type Agent = u64;
}

impl WorldMut for World {}

struct Latent;

impl TaskNode<World> for Latent {
    fn execute(&self, _ctx: &mut TaskContext<'_, World>) -> TaskResult {
        TaskResult::InProgress
    }

    fn on_task_finished(&self, _ctx: &mut TaskContext<'_, World>, result: NodeResult) {
        black_box(result);
    }
}

const BRANCHES: i32 = 32;

/// A selector of `BRANCHES` guarded branches; branch `i` runs while `Level == i`.
fn guarded_selector() -> BehaviorTree<World> {
    let schema = Arc::new(BlackboardData::new("Bench").with_key(KeyEntry::new("Level", IntKey::default())));
    let mut root = NodeSpec::selector("Root");
    for i in 0..BRANCHES {
        root = root.child(
            NodeSpec::task(format!("Branch{i}"), Latent).decorator(
                DecoratorSpec::new(
                    format!("Level{i}"),
                    BlackboardDecorator::int("Level", ArithmeticOp::Equal, i),
                )
                .abort_mode(FlowAbortMode::Both),
            ),
        );
    }
    root = root.child(NodeSpec::task("Fallback", Latent));
    BehaviorTree::build("Bench", Some(schema), root).expect("bench tree builds")
}

fn bench_idle_tick(c: &mut Criterion) {
    let mut world = World;
    let mut bt = BehaviorTreeComponent::new(1);
    bt.start_tree(&mut world, Arc::new(guarded_selector()))
        .expect("bench tree starts");

    let mut ctx = TickContext::new(0, 0.1);
    c.bench_function("arbor-bt/tick(idle, branches=32)", |b| {
        b.iter(|| {
            bt.tick(&mut world, &ctx);
            black_box(bt.active_task());
            ctx = ctx.next();
        })
    });
}

fn bench_observed_switch(c: &mut Criterion) {
    let mut world = World;
    let mut bt = BehaviorTreeComponent::new(1);
    bt.start_tree(&mut world, Arc::new(guarded_selector()))
        .expect("bench tree starts");
    let level = bt.blackboard().key_id("Level").expect("bench key exists");

    let mut ctx = TickContext::new(0, 0.1);
    let mut value = 0;
    c.bench_function("arbor-bt/tick(key change, branches=32)", |b| {
        b.iter(|| {
            value = (value + 7) % BRANCHES;
            bt.blackboard_mut().set_value::<IntKey>(level, value);
            bt.tick(&mut world, &ctx);
            black_box(bt.active_task());
            ctx = ctx.next();
        })
    });
}

criterion_group!(benches, bench_idle_tick, bench_observed_switch);
criterion_main!(benches);
