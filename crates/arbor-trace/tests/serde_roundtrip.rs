#![cfg(feature = "serde")]

use arbor_trace::{tags, TraceEvent, TraceLog};

#[test]
fn trace_log_json_roundtrip() {
    let log = TraceLog {
        events: vec![
            TraceEvent::new(1, tags::TREE_START),
            TraceEvent::new(1, tags::TASK_EXECUTE).at(0, 3).with_label("MoveTo"),
            TraceEvent::new(4, tags::TASK_FINISH).at(0, 3).with_value(1),
        ],
    };

    let json = serde_json::to_string(&log).expect("serialize");
    let roundtrip: TraceLog = serde_json::from_str(&json).expect("deserialize");
    assert_eq!(roundtrip, log);
}
