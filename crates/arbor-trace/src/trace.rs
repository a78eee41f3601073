#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;

/// Event tags emitted by the behavior tree scheduler.
pub mod tags {
    pub const SEARCH: &str = "bt.search";
    pub const SEARCH_ROLLBACK: &str = "bt.search.rollback";
    pub const REQUEST: &str = "bt.request";
    pub const TASK_EXECUTE: &str = "bt.task.execute";
    pub const TASK_ABORT: &str = "bt.task.abort";
    pub const TASK_FINISH: &str = "bt.task.finish";
    pub const AUX_ACTIVATE: &str = "bt.aux.activate";
    pub const AUX_DEACTIVATE: &str = "bt.aux.deactivate";
    pub const INSTANCE_PUSH: &str = "bt.instance.push";
    pub const INSTANCE_POP: &str = "bt.instance.pop";
    pub const MESSAGE: &str = "bt.message";
    pub const TREE_START: &str = "bt.tree.start";
    pub const TREE_STOP: &str = "bt.tree.stop";
}

/// One recorded scheduler step.
///
/// `instance` and `node` locate the event in the instance stack; `value` carries an
/// event-specific number (a task result code, a request priority, a search step count).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceEvent {
    pub tick: u64,
    pub tag: Cow<'static, str>,
    pub instance: u32,
    pub node: u32,
    pub value: i64,
    pub label: Option<Cow<'static, str>>,
}

impl TraceEvent {
    pub fn new(tick: u64, tag: impl Into<Cow<'static, str>>) -> Self {
        Self {
            tick,
            tag: tag.into(),
            instance: 0,
            node: 0,
            value: 0,
            label: None,
        }
    }

    pub fn at(mut self, instance: u32, node: u32) -> Self {
        self.instance = instance;
        self.node = node;
        self
    }

    pub fn with_value(mut self, value: i64) -> Self {
        self.value = value;
        self
    }

    pub fn with_label(mut self, label: impl Into<Cow<'static, str>>) -> Self {
        self.label = Some(label.into());
        self
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {}:{}",
            self.tick, self.tag, self.instance, self.node
        )?;
        if let Some(label) = &self.label {
            write!(f, " {label}")?;
        }
        if self.value != 0 {
            write!(f, " ={}", self.value)?;
        }
        Ok(())
    }
}

pub trait TraceSink {
    fn emit(&mut self, event: TraceEvent);
}

#[derive(Debug, Default)]
pub struct NullTraceSink;

impl TraceSink for NullTraceSink {
    fn emit(&mut self, _event: TraceEvent) {}
}

#[derive(Debug, Default)]
pub struct VecTraceSink {
    pub events: Vec<TraceEvent>,
}

impl TraceSink for VecTraceSink {
    fn emit(&mut self, event: TraceEvent) {
        self.events.push(event);
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TraceLog {
    pub events: Vec<TraceEvent>,
}

impl TraceLog {
    pub fn push(&mut self, event: TraceEvent) {
        self.events.push(event);
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn with_tag<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a TraceEvent> + 'a {
        self.events.iter().filter(move |event| event.tag == tag)
    }

    /// Position of the first event matching `tag` and `node`, if any.
    pub fn position(&self, tag: &str, node: u32) -> Option<usize> {
        self.events
            .iter()
            .position(|event| event.tag == tag && event.node == node)
    }
}

/// Destination for scheduler trace events: an optional in-memory log and an optional sink.
#[derive(Default)]
pub struct Tracer {
    log: Option<TraceLog>,
    sink: Option<Box<dyn TraceSink + Send>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts (or restarts) in-memory recording.
    pub fn record(&mut self) {
        self.log = Some(TraceLog::default());
    }

    pub fn set_sink(&mut self, sink: impl TraceSink + Send + 'static) {
        self.sink = Some(Box::new(sink));
    }

    pub fn clear_sink(&mut self) {
        self.sink = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.log.is_some() || self.sink.is_some()
    }

    pub fn log(&self) -> Option<&TraceLog> {
        self.log.as_ref()
    }

    pub fn take_log(&mut self) -> Option<TraceLog> {
        self.log.take()
    }

    pub fn emit(&mut self, event: TraceEvent) {
        tracing::trace!(
            tick = event.tick,
            tag = %event.tag,
            instance = event.instance,
            node = event.node,
            value = event.value,
            "bt trace"
        );
        match (&mut self.log, &mut self.sink) {
            (Some(log), Some(sink)) => {
                log.push(event.clone());
                sink.emit(event);
            }
            (Some(log), None) => log.push(event),
            (None, Some(sink)) => sink.emit(event),
            (None, None) => {}
        }
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("log", &self.log.as_ref().map(|log| log.events.len()))
            .field("sink", &self.sink.is_some())
            .finish()
    }
}
