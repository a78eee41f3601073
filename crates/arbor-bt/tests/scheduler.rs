mod common;

use std::sync::Arc;

use arbor_bt::{
    AiMessage, BehaviorTree, BehaviorTreeComponent, BlackboardDecorator, Condition,
    DecoratorSpec, FinishWithResult, FlowAbortMode, NodeResult, NodeSpec, SchedulerConfig,
    TaskState, TreeError, TreeStatus, WaitForMessage,
};
use arbor_core::blackboard::keys::{BoolKey, IntKey};
use arbor_core::{ArithmeticOp, BlackboardComponent, BlackboardData, KeyEntry};
use arbor_trace::tags;

use common::{run, start, tick, Record, RecordingWorld};

fn threat_schema() -> Arc<BlackboardData> {
    Arc::new(BlackboardData::new("Threat").with_key(KeyEntry::new("Threat", IntKey::default())))
}

/// Flee when the threat level rises above 5, otherwise patrol.
fn flee_or_patrol(flee_mode: FlowAbortMode, patrol: Record) -> BehaviorTree<RecordingWorld> {
    BehaviorTree::build(
        "FleeOrPatrol",
        Some(threat_schema()),
        NodeSpec::selector("Root")
            .child(
                NodeSpec::task("Flee", Record::latent("Flee")).decorator(
                    DecoratorSpec::new(
                        "Threatened",
                        BlackboardDecorator::int("Threat", ArithmeticOp::Greater, 5),
                    )
                    .abort_mode(flee_mode),
                ),
            )
            .child(
                NodeSpec::task("Patrol", patrol).decorator(
                    DecoratorSpec::new(
                        "Calm",
                        BlackboardDecorator::int("Threat", ArithmeticOp::LessOrEqual, 5),
                    )
                    .abort_mode(FlowAbortMode::SelfBranch),
                ),
            ),
    )
    .unwrap()
}

fn set_threat(bt: &mut BehaviorTreeComponent<RecordingWorld>, value: i32) {
    let key = bt.blackboard().key_id("Threat").unwrap();
    assert!(bt.blackboard_mut().set_value::<IntKey>(key, value));
}

#[test]
fn sequence_skips_child_blocked_by_decorator() {
    let mut world = RecordingWorld::default();
    let tree = BehaviorTree::build(
        "Guarded",
        None,
        NodeSpec::sequence("Root")
            .child(NodeSpec::task("TaskA", Record::succeed("A")).decorator(
                DecoratorSpec::new(
                    "Never",
                    Condition::new(|_: u64, _: &RecordingWorld, _: &BlackboardComponent| false),
                ),
            ))
            .child(NodeSpec::task("TaskB", Record::latent("B"))),
    )
    .unwrap();
    let (_tree, mut bt) = start(tree, &mut world);

    tick(&mut bt, &mut world, 0);
    assert_eq!(world.log, vec!["execute:B"]);
    assert_eq!(bt.active_task_name(), Some("TaskB"));

    run(&mut bt, &mut world, 1..5);
    assert_eq!(world.count("execute:A"), 0);
    assert_eq!(world.count("execute:B"), 1);
}

#[test]
fn matching_message_resolves_latent_task_without_search() {
    let mut world = RecordingWorld::default();
    let tree = BehaviorTree::build(
        "Move",
        None,
        NodeSpec::sequence("Root")
            .child(NodeSpec::task(
                "Move",
                WaitForMessage::new("MoveFinished").with_request_id(7),
            ))
            .child(NodeSpec::task("Next", Record::latent("Next"))),
    )
    .unwrap();
    let (_tree, mut bt) = start(tree, &mut world);
    tick(&mut bt, &mut world, 0);

    let handle = bt.active_task().unwrap();
    assert_eq!(bt.active_task_name(), Some("Move"));
    let searches = bt.search_count();

    bt.handle_message(&mut world, &AiMessage::new("MoveFinished").with_request_id(8));
    bt.handle_message(&mut world, &AiMessage::new("Arrived").with_request_id(7));
    assert_eq!(bt.task_state(handle.instance, handle.node), TaskState::Active);

    bt.handle_message(&mut world, &AiMessage::new("MoveFinished").with_request_id(7));
    assert_eq!(bt.task_state(handle.instance, handle.node), TaskState::Succeeded);
    assert_eq!(bt.search_count(), searches);
    assert!(world.log.is_empty());

    tick(&mut bt, &mut world, 1);
    assert_eq!(world.log, vec!["execute:Next"]);
}

#[test]
fn failed_message_fails_the_task_and_posted_messages_wait_for_tick() {
    let mut world = RecordingWorld::default();
    let tree = BehaviorTree::build(
        "Move",
        None,
        NodeSpec::selector("Root")
            .child(NodeSpec::task("Move", WaitForMessage::new("MoveFinished")))
            .child(NodeSpec::task("GiveUp", Record::latent("GiveUp"))),
    )
    .unwrap();
    let (tree, mut bt) = start(tree, &mut world);
    tick(&mut bt, &mut world, 0);
    let instance = bt.instance_ids()[0];
    let move_node = tree.find_node("Move").unwrap();

    bt.post_message(AiMessage::new("MoveFinished").with_request_id(3).failed());
    assert_eq!(bt.task_state(instance, move_node), TaskState::Active);

    tick(&mut bt, &mut world, 1);
    assert_eq!(bt.task_state(instance, move_node), TaskState::Failed);
    assert_eq!(world.log, vec!["execute:GiveUp"]);
}

#[test]
fn unchanged_conditions_do_not_restart_the_running_task() {
    let mut world = RecordingWorld::default();
    let (_tree, mut bt) = start(
        flee_or_patrol(FlowAbortMode::LowerPriority, Record::latent("Patrol")),
        &mut world,
    );
    tick(&mut bt, &mut world, 0);
    assert_eq!(bt.active_task_name(), Some("Patrol"));
    let searches = bt.search_count();

    for (t, threat) in (1..=5).enumerate() {
        set_threat(&mut bt, threat);
        tick(&mut bt, &mut world, t as u64 + 1);
    }

    assert_eq!(world.log, vec!["execute:Patrol"]);
    assert_eq!(bt.search_count(), searches);
    assert_eq!(bt.active_task_name(), Some("Patrol"));
}

#[test]
fn lower_priority_abort_preempts_running_branch() {
    let mut world = RecordingWorld::default();
    let (tree, mut bt) = start(
        flee_or_patrol(FlowAbortMode::LowerPriority, Record::latent("Patrol")),
        &mut world,
    );
    tick(&mut bt, &mut world, 0);

    set_threat(&mut bt, 9);
    tick(&mut bt, &mut world, 1);

    assert_eq!(
        world.log,
        vec![
            "execute:Patrol",
            "abort:Patrol",
            "finished:Patrol:Aborted",
            "execute:Flee"
        ]
    );
    assert_eq!(bt.active_task_name(), Some("Flee"));

    let flee = tree.find_node("Flee").unwrap().index() as u32;
    let patrol = tree.find_node("Patrol").unwrap().index() as u32;
    let log = bt.tracer().log().unwrap();
    let aborted = log.position(tags::TASK_ABORT, patrol).unwrap();
    let executed = log
        .events
        .iter()
        .rposition(|event| event.tag == tags::TASK_EXECUTE && event.node == flee)
        .unwrap();
    assert!(aborted < executed);
}

#[test]
fn lower_priority_decorator_is_inert_on_its_own_branch() {
    let mut world = RecordingWorld::default();
    let (_tree, mut bt) = start(
        flee_or_patrol(FlowAbortMode::LowerPriority, Record::latent("Patrol")),
        &mut world,
    );
    set_threat(&mut bt, 9);
    tick(&mut bt, &mut world, 0);
    assert_eq!(bt.active_task_name(), Some("Flee"));

    set_threat(&mut bt, 0);
    tick(&mut bt, &mut world, 1);
    assert_eq!(bt.active_task_name(), Some("Flee"));
    assert_eq!(world.count("abort:Flee"), 0);
}

#[test]
fn self_abort_fails_branch_when_condition_stops_holding() {
    let mut world = RecordingWorld::default();
    let (_tree, mut bt) = start(
        flee_or_patrol(FlowAbortMode::Both, Record::latent("Patrol")),
        &mut world,
    );
    set_threat(&mut bt, 9);
    tick(&mut bt, &mut world, 0);
    assert_eq!(bt.active_task_name(), Some("Flee"));

    set_threat(&mut bt, 2);
    tick(&mut bt, &mut world, 1);
    assert_eq!(
        world.log,
        vec![
            "execute:Flee",
            "abort:Flee",
            "finished:Flee:Aborted",
            "execute:Patrol"
        ]
    );

    set_threat(&mut bt, 7);
    tick(&mut bt, &mut world, 2);
    assert_eq!(bt.active_task_name(), Some("Flee"));
    assert_eq!(world.count("abort:Patrol"), 1);
}

#[test]
fn latent_abort_delays_the_new_branch() {
    let mut world = RecordingWorld::default();
    let (tree, mut bt) = start(
        flee_or_patrol(FlowAbortMode::LowerPriority, Record::latent_abort("Patrol")),
        &mut world,
    );
    tick(&mut bt, &mut world, 0);
    let instance = bt.instance_ids()[0];
    let patrol = tree.find_node("Patrol").unwrap();

    set_threat(&mut bt, 9);
    run(&mut bt, &mut world, 1..4);
    assert_eq!(bt.task_state(instance, patrol), TaskState::Aborting);
    assert_eq!(world.count("execute:Flee"), 0);
    assert_eq!(world.count("abort:Patrol"), 1);

    let handle = bt.active_task().unwrap();
    assert_eq!(handle.node, patrol);
    bt.finish_latent_abort(&mut world, handle);
    assert_eq!(bt.task_state(instance, patrol), TaskState::Aborted);

    tick(&mut bt, &mut world, 4);
    assert_eq!(world.count("execute:Flee"), 1);
    assert_eq!(bt.active_task_name(), Some("Flee"));
}

#[test]
fn finishing_an_aborting_task_completes_the_abort() {
    let mut world = RecordingWorld::default();
    let (_tree, mut bt) = start(
        flee_or_patrol(FlowAbortMode::LowerPriority, Record::latent_abort("Patrol")),
        &mut world,
    );
    tick(&mut bt, &mut world, 0);
    let handle = bt.active_task().unwrap();

    set_threat(&mut bt, 9);
    tick(&mut bt, &mut world, 1);
    bt.finish_latent_task(&mut world, handle, NodeResult::Succeeded);

    assert_eq!(world.count("finished:Patrol:Aborted"), 1);
    assert_eq!(world.count("finished:Patrol:Succeeded"), 0);
    tick(&mut bt, &mut world, 2);
    assert_eq!(bt.active_task_name(), Some("Flee"));
}

#[test]
fn second_finish_of_the_same_execution_is_ignored() {
    let mut world = RecordingWorld::default();
    let tree = BehaviorTree::build(
        "Work",
        None,
        NodeSpec::sequence("Root")
            .child(NodeSpec::task("Work", Record::latent("Work")))
            .child(NodeSpec::task("Next", Record::latent("Next"))),
    )
    .unwrap();
    let (_tree, mut bt) = start(tree, &mut world);
    tick(&mut bt, &mut world, 0);
    let handle = bt.active_task().unwrap();

    bt.finish_latent_task(&mut world, handle, NodeResult::Succeeded);
    bt.finish_latent_task(&mut world, handle, NodeResult::Failed);
    bt.finish_latent_abort(&mut world, handle);
    assert_eq!(bt.task_state(handle.instance, handle.node), TaskState::Succeeded);
    assert_eq!(world.count("finished:Work:Succeeded"), 1);
    assert_eq!(world.count("finished:Work:Failed"), 0);

    run(&mut bt, &mut world, 1..3);
    assert_eq!(world.count("execute:Next"), 1);
    assert_eq!(world.count("execute:Work"), 1);
}

#[test]
fn relevant_decorators_observe_keys_until_stop() {
    let mut world = RecordingWorld::default();
    let (tree, mut bt) = start(
        flee_or_patrol(FlowAbortMode::LowerPriority, Record::latent("Patrol")),
        &mut world,
    );
    tick(&mut bt, &mut world, 0);
    let threat = bt.blackboard().key_id("Threat").unwrap();
    let instance = bt.instance_ids()[0];

    let expected = vec![
        tree.find_node("Threatened").unwrap(),
        tree.find_node("Calm").unwrap(),
    ];
    assert_eq!(bt.active_aux_nodes(instance), Some(expected.as_slice()));
    assert_eq!(bt.blackboard().num_observers(threat), 2);

    bt.stop_tree(&mut world);
    assert_eq!(bt.blackboard().num_observers(threat), 0);
    assert_eq!(bt.tree_status(), TreeStatus::Stopped);
    assert_eq!(bt.instance_count(), 0);
    assert!(bt.active_task().is_none());
    assert_eq!(
        world.log,
        vec!["execute:Patrol", "abort:Patrol", "finished:Patrol:Aborted"]
    );

    tick(&mut bt, &mut world, 1);
    assert_eq!(world.log.len(), 3);
}

#[test]
fn root_tree_loops_by_default() {
    let mut world = RecordingWorld::default();
    let tree = BehaviorTree::build(
        "Loop",
        None,
        NodeSpec::sequence("Root").child(NodeSpec::task("Once", Record::succeed("Once"))),
    )
    .unwrap();
    let (_tree, mut bt) = start(tree, &mut world);

    run(&mut bt, &mut world, 0..3);
    assert_eq!(world.count("execute:Once"), 3);
    assert_eq!(bt.tree_status(), TreeStatus::Running);
}

#[test]
fn root_tree_finishes_when_looping_is_off() {
    let mut world = RecordingWorld::default();
    let tree = Arc::new(
        BehaviorTree::build(
            "Once",
            None,
            NodeSpec::sequence("Root")
                .child(NodeSpec::task("Done", FinishWithResult::succeed()))
                .child(NodeSpec::task("Fail", FinishWithResult::fail())),
        )
        .unwrap(),
    );
    let mut bt = BehaviorTreeComponent::new(1).with_config(SchedulerConfig {
        loop_root: false,
        ..SchedulerConfig::default()
    });
    bt.start_tree(&mut world, Arc::clone(&tree)).unwrap();

    run(&mut bt, &mut world, 0..3);
    assert_eq!(bt.tree_status(), TreeStatus::Finished(NodeResult::Failed));
    assert!(bt.active_task().is_none());

    bt.restart_tree(&mut world).unwrap();
    assert_eq!(bt.tree_status(), TreeStatus::Running);
}

#[test]
fn restart_tree_runs_from_the_root_again() {
    let mut world = RecordingWorld::default();
    let (_tree, mut bt) = start(
        flee_or_patrol(FlowAbortMode::LowerPriority, Record::latent("Patrol")),
        &mut world,
    );
    tick(&mut bt, &mut world, 0);
    bt.restart_tree(&mut world).unwrap();
    tick(&mut bt, &mut world, 1);

    assert_eq!(world.count("execute:Patrol"), 2);
    assert_eq!(world.count("abort:Patrol"), 1);
}

#[test]
fn start_refuses_an_incompatible_blackboard() {
    let mut world = RecordingWorld::default();
    let other = Arc::new(
        BlackboardData::new("Other").with_key(KeyEntry::new("Ammo", IntKey::default())),
    );
    let tree = Arc::new(flee_or_patrol(FlowAbortMode::None, Record::latent("Patrol")));

    let mut bt = BehaviorTreeComponent::new(1)
        .with_blackboard(BlackboardComponent::from_data(other).unwrap());
    let err = bt.start_tree(&mut world, tree).unwrap_err();

    assert!(matches!(err, TreeError::IncompatibleBlackboard { .. }));
    assert_eq!(bt.tree_status(), TreeStatus::Stopped);
}

#[test]
fn start_accepts_a_derived_blackboard() {
    let mut world = RecordingWorld::default();
    let tree = flee_or_patrol(FlowAbortMode::None, Record::latent("Patrol"));
    let base = Arc::clone(tree.blackboard_data().unwrap());
    let derived = Arc::new(
        BlackboardData::with_parent("Soldier", base).with_key(KeyEntry::new("Ammo", IntKey::default())),
    );

    let mut bt = BehaviorTreeComponent::new(1)
        .with_blackboard(BlackboardComponent::from_data(derived).unwrap());
    bt.start_tree(&mut world, Arc::new(tree)).unwrap();
    tick(&mut bt, &mut world, 0);

    assert_eq!(bt.active_task_name(), Some("Patrol"));
}

fn int_guard(name: &str, key: &str, op: ArithmeticOp, value: i32) -> DecoratorSpec<RecordingWorld> {
    DecoratorSpec::new(name, BlackboardDecorator::int(key, op, value))
}

#[test]
fn self_abort_survives_a_higher_priority_request_that_changes_nothing() {
    let mut world = RecordingWorld::default();
    let schema = Arc::new(
        BlackboardData::new("Guard")
            .with_key(KeyEntry::new("Alert", IntKey::default()))
            .with_key(KeyEntry::new("Ammo", IntKey::default()))
            .with_key(KeyEntry::new("Noise", IntKey::default())),
    );
    let tree = BehaviorTree::build(
        "Guard",
        Some(schema),
        NodeSpec::selector("Root")
            .child(
                NodeSpec::sequence("Engage")
                    .decorator(
                        int_guard("Alerted", "Alert", ArithmeticOp::Greater, 0)
                            .abort_mode(FlowAbortMode::LowerPriority),
                    )
                    .child(
                        NodeSpec::task("Shoot", Record::latent("Shoot"))
                            .decorator(int_guard("Armed", "Ammo", ArithmeticOp::Greater, 0)),
                    ),
            )
            .child(
                NodeSpec::task("Patrol", Record::latent("Patrol")).decorator(
                    int_guard("Quiet", "Noise", ArithmeticOp::LessOrEqual, 0)
                        .abort_mode(FlowAbortMode::SelfBranch),
                ),
            )
            .child(NodeSpec::task("Idle", Record::latent("Idle"))),
    )
    .unwrap();
    let (_tree, mut bt) = start(tree, &mut world);
    tick(&mut bt, &mut world, 0);
    assert_eq!(bt.active_task_name(), Some("Patrol"));

    // Both guards change in one batch. The alert restart finds nothing to run because
    // Shoot is blocked; the quiet guard's self abort must still go through.
    let blackboard = bt.blackboard_mut();
    let alert = blackboard.key_id("Alert").unwrap();
    let noise = blackboard.key_id("Noise").unwrap();
    blackboard.set_value::<IntKey>(alert, 1);
    blackboard.set_value::<IntKey>(noise, 1);
    run(&mut bt, &mut world, 1..5);

    assert_eq!(
        world.log,
        vec![
            "execute:Patrol",
            "abort:Patrol",
            "finished:Patrol:Aborted",
            "execute:Idle"
        ]
    );
    assert_eq!(bt.active_task_name(), Some("Idle"));
}

#[test]
fn synced_key_written_by_one_agent_reroutes_the_other() {
    let schema = Arc::new(
        BlackboardData::new("Watch").with_key(KeyEntry::new("Alarm", BoolKey::default()).synced()),
    );
    let tree = Arc::new(
        BehaviorTree::build(
            "Watch",
            Some(schema),
            NodeSpec::selector("Root")
                .child(
                    NodeSpec::task("Respond", Record::latent("Respond")).decorator(
                        DecoratorSpec::new("Alarmed", BlackboardDecorator::is_set("Alarm"))
                            .abort_mode(FlowAbortMode::Both),
                    ),
                )
                .child(NodeSpec::task("Guard", Record::latent("Guard"))),
        )
        .unwrap(),
    );
    let (mut world_a, mut world_b) = (RecordingWorld::default(), RecordingWorld::default());
    let mut a = BehaviorTreeComponent::new(1);
    let mut b = BehaviorTreeComponent::new(2);
    a.start_tree(&mut world_a, Arc::clone(&tree)).unwrap();
    b.start_tree(&mut world_b, Arc::clone(&tree)).unwrap();
    tick(&mut a, &mut world_a, 0);
    tick(&mut b, &mut world_b, 0);
    let alarm = a.blackboard().key_id("Alarm").unwrap();

    a.blackboard_mut().set_value::<BoolKey>(alarm, true);
    assert!(b.blackboard().get_value::<BoolKey>(alarm));
    tick(&mut a, &mut world_a, 1);
    tick(&mut b, &mut world_b, 1);
    assert_eq!(a.active_task_name(), Some("Respond"));
    assert_eq!(b.active_task_name(), Some("Respond"));

    // The all-clear comes from the agent that only ever received the alarm.
    b.blackboard_mut().set_value::<BoolKey>(alarm, false);
    assert!(!a.blackboard().get_value::<BoolKey>(alarm));
    tick(&mut a, &mut world_a, 2);
    tick(&mut b, &mut world_b, 2);

    for world in [&world_a, &world_b] {
        assert_eq!(
            world.log,
            vec![
                "execute:Guard",
                "abort:Guard",
                "finished:Guard:Aborted",
                "execute:Respond",
                "abort:Respond",
                "finished:Respond:Aborted",
                "execute:Guard"
            ]
        );
    }
}
