use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_bt::{
    BehaviorTree, BehaviorTreeComponent, BlackboardDecorator, DecoratorSpec, FlowAbortMode,
    NodeSpec, TaskContext, TaskNode, TaskResult, TreeError,
};
use arbor_core::blackboard::keys::{BoolKey, IntKey, VectorKey};
use arbor_core::{BlackboardData, KeyEntry, TickContext, Vec3, WorldMut, WorldView};
use arbor_nav::{move_finished, MoveRequestId, MoveTo, NavWorldMut, PathFollowing, StraightLineMover};

const AGENT: u64 = 1;
const GOAL: Vec3 = Vec3::new(3.0, 4.0, 0.0);

#[derive(Default)]
struct NavWorld {
    movers: BTreeMap<u64, StraightLineMover>,
    log: Vec<String>,
}

impl NavWorld {
    fn with_mover(position: Vec3) -> Self {
        let mut world = Self::default();
        world.movers.insert(AGENT, StraightLineMover::new(position, 10.0));
        world
    }

    fn mover(&self) -> &StraightLineMover {
        &self.movers[&AGENT]
    }
}

impl WorldView for NavWorld {
    type Agent = u64;
}

impl WorldMut for NavWorld {}

impl NavWorldMut for NavWorld {
    fn path_following(&mut self, agent: u64) -> Option<&mut dyn PathFollowing> {
        self.movers
            .get_mut(&agent)
            .map(|mover| mover as &mut dyn PathFollowing)
    }
}

/// Latent task that only records that it ran.
struct Log(&'static str);

impl TaskNode<NavWorld> for Log {
    fn execute(&self, ctx: &mut TaskContext<'_, NavWorld>) -> TaskResult {
        ctx.world.log.push(format!("execute:{}", self.0));
        TaskResult::InProgress
    }
}

fn schema() -> Arc<BlackboardData> {
    Arc::new(
        BlackboardData::new("Mover")
            .with_key(KeyEntry::new("Goal", VectorKey))
            .with_key(KeyEntry::new("Alarm", BoolKey::default())),
    )
}

/// Travel to `Goal`; raising `Alarm` preempts the trip.
fn travel_tree() -> Arc<BehaviorTree<NavWorld>> {
    let tree = BehaviorTree::build(
        "Travel",
        Some(schema()),
        NodeSpec::selector("Root")
            .child(
                NodeSpec::task("Flee", Log("Flee")).decorator(
                    DecoratorSpec::new("Alarmed", BlackboardDecorator::is_set("Alarm"))
                        .abort_mode(FlowAbortMode::LowerPriority),
                ),
            )
            .child(
                NodeSpec::sequence("Trip")
                    .child(NodeSpec::task("MoveTo", MoveTo::new("Goal")))
                    .child(NodeSpec::task("Arrived", Log("Arrived"))),
            )
            .child(NodeSpec::task("Stranded", Log("Stranded"))),
    )
    .unwrap();
    Arc::new(tree)
}

fn start(world: &mut NavWorld, goal: Option<Vec3>) -> BehaviorTreeComponent<NavWorld> {
    let mut bt = BehaviorTreeComponent::new(AGENT);
    bt.start_tree(world, travel_tree()).unwrap();
    if let Some(goal) = goal {
        let key = bt.blackboard().key_id("Goal").unwrap();
        bt.blackboard_mut().set_value::<VectorKey>(key, goal);
    }
    bt
}

/// Moves every agent, forwards finished moves, then ticks the tree.
fn step(bt: &mut BehaviorTreeComponent<NavWorld>, world: &mut NavWorld, tick: u64) {
    let messages: Vec<_> = world
        .movers
        .values_mut()
        .flat_map(|mover| {
            mover.tick(0.1);
            mover.drain_finished()
        })
        .collect();
    for message in messages {
        bt.post_message(message);
    }
    bt.tick(world, &TickContext::new(tick, 0.1));
}

#[test]
fn move_succeeds_when_the_follower_reports_arrival() {
    let mut world = NavWorld::with_mover(Vec3::ZERO);
    let mut bt = start(&mut world, Some(GOAL));

    step(&mut bt, &mut world, 0);
    assert_eq!(bt.active_task_name(), Some("MoveTo"));
    assert!(world.mover().is_moving());

    for t in 1..10 {
        step(&mut bt, &mut world, t);
    }

    assert_eq!(world.log, vec!["execute:Arrived"]);
    assert!(world.mover().position().distance(GOAL) < 1e-4);
}

#[test]
fn agent_at_goal_succeeds_without_a_request() {
    let mut world = NavWorld::with_mover(GOAL);
    let mut bt = start(&mut world, Some(GOAL));

    step(&mut bt, &mut world, 0);

    assert_eq!(world.log, vec!["execute:Arrived"]);
    assert_eq!(world.mover().accepted_requests(), 0);
}

#[test]
fn missing_navigation_fails_the_move() {
    let mut world = NavWorld::default();
    let mut bt = start(&mut world, Some(GOAL));

    step(&mut bt, &mut world, 0);

    assert_eq!(world.log, vec!["execute:Stranded"]);
}

#[test]
fn unset_goal_fails_the_move() {
    let mut world = NavWorld::with_mover(Vec3::ZERO);
    let mut bt = start(&mut world, None);

    step(&mut bt, &mut world, 0);

    assert_eq!(world.log, vec!["execute:Stranded"]);
    assert!(!world.mover().is_moving());
}

#[test]
fn failed_move_message_fails_the_branch() {
    let mut world = NavWorld::with_mover(Vec3::ZERO);
    let mut bt = start(&mut world, Some(Vec3::new(100.0, 0.0, 0.0)));
    step(&mut bt, &mut world, 0);

    bt.handle_message(&mut world, &move_finished(MoveRequestId(1), false));
    step(&mut bt, &mut world, 1);

    assert_eq!(world.log, vec!["execute:Stranded"]);
}

#[test]
fn preempted_move_is_aborted_in_the_follower() {
    let mut world = NavWorld::with_mover(Vec3::ZERO);
    let mut bt = start(&mut world, Some(Vec3::new(100.0, 0.0, 0.0)));
    step(&mut bt, &mut world, 0);
    assert!(world.mover().is_moving());

    let alarm = bt.blackboard().key_id("Alarm").unwrap();
    bt.blackboard_mut().set_value::<BoolKey>(alarm, true);
    step(&mut bt, &mut world, 1);

    assert_eq!(bt.active_task_name(), Some("Flee"));
    assert!(!world.mover().is_moving());
    assert!(world.mover().current_request().is_none());
    assert_eq!(world.log, vec!["execute:Flee"]);
}

#[test]
fn goal_key_must_hold_a_location() {
    let data = Arc::new(BlackboardData::new("Wrong").with_key(KeyEntry::new("Goal", IntKey::default())));
    let err = BehaviorTree::<NavWorld>::build(
        "Wrong",
        Some(data),
        NodeSpec::sequence("Root").child(NodeSpec::task("MoveTo", MoveTo::new("Goal"))),
    )
    .unwrap_err();

    assert!(matches!(err, TreeError::UnsupportedKeyKind { key, .. } if key == "Goal"));
}
