use arbor_core::{
    ArithmeticOp, BasicOp, BlackboardComponent, KeyComparison, KeyId, TestOperation, TextOp,
    WorldMut,
};

use crate::error::TreeError;
use crate::node::{AuxContext, ConditionContext, DecoratorNode, NodeMemory};
use crate::tree::KeyResolver;

/// Test applied by a [`BlackboardDecorator`] to its key.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KeyQuery {
    Basic(BasicOp),
    /// Int keys compare against `int`, float keys against `float`.
    Arithmetic {
        op: ArithmeticOp,
        int: i32,
        float: f32,
    },
    Text {
        op: TextOp,
        operand: String,
    },
}

impl KeyQuery {
    pub fn operation(&self) -> TestOperation {
        match self {
            KeyQuery::Basic(_) => TestOperation::Basic,
            KeyQuery::Arithmetic { .. } => TestOperation::Arithmetic,
            KeyQuery::Text { .. } => TestOperation::Text,
        }
    }
}

/// Passes while a blackboard key satisfies a query; re-evaluated whenever the key changes.
#[derive(Debug, Clone)]
pub struct BlackboardDecorator {
    key_name: String,
    query: KeyQuery,
    key: Option<KeyId>,
}

impl BlackboardDecorator {
    pub fn new(key_name: impl Into<String>, query: KeyQuery) -> Self {
        Self {
            key_name: key_name.into(),
            query,
            key: None,
        }
    }

    pub fn is_set(key_name: impl Into<String>) -> Self {
        Self::new(key_name, KeyQuery::Basic(BasicOp::IsSet))
    }

    pub fn is_not_set(key_name: impl Into<String>) -> Self {
        Self::new(key_name, KeyQuery::Basic(BasicOp::IsNotSet))
    }

    pub fn int(key_name: impl Into<String>, op: ArithmeticOp, value: i32) -> Self {
        Self::new(
            key_name,
            KeyQuery::Arithmetic {
                op,
                int: value,
                float: value as f32,
            },
        )
    }

    pub fn float(key_name: impl Into<String>, op: ArithmeticOp, value: f32) -> Self {
        Self::new(
            key_name,
            KeyQuery::Arithmetic {
                op,
                int: value as i32,
                float: value,
            },
        )
    }

    pub fn text(key_name: impl Into<String>, op: TextOp, operand: impl Into<String>) -> Self {
        Self::new(
            key_name,
            KeyQuery::Text {
                op,
                operand: operand.into(),
            },
        )
    }

    pub fn key(&self) -> Option<KeyId> {
        self.key
    }

    fn test(&self, blackboard: &BlackboardComponent) -> bool {
        let Some(key) = self.key else {
            return false;
        };
        match &self.query {
            KeyQuery::Basic(op) => blackboard.test_basic_operation(key, *op),
            KeyQuery::Arithmetic { op, int, float } => {
                blackboard.test_arithmetic_operation(key, *op, *int, *float)
            }
            KeyQuery::Text { op, operand } => blackboard.test_text_operation(key, *op, operand),
        }
    }
}

impl<W: WorldMut + 'static> DecoratorNode<W> for BlackboardDecorator {
    fn calculate_raw_condition(&self, ctx: &ConditionContext<'_, W>) -> bool {
        self.test(ctx.blackboard)
    }

    fn on_become_relevant(&self, ctx: &mut AuxContext<'_, W>) {
        if let Some(key) = self.key {
            ctx.observe_key(key);
        }
    }

    fn resolve_keys(&mut self, keys: &KeyResolver<'_>) -> Result<(), TreeError> {
        self.key = Some(keys.key_with_operation(&self.key_name, self.query.operation())?);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KeyCompareOp {
    Equal,
    NotEqual,
}

/// Compares two keys of the same kind.
#[derive(Debug, Clone)]
pub struct CompareBlackboardKeys {
    names: (String, String),
    op: KeyCompareOp,
    keys: Option<(KeyId, KeyId)>,
}

impl CompareBlackboardKeys {
    pub fn new(a: impl Into<String>, b: impl Into<String>, op: KeyCompareOp) -> Self {
        Self {
            names: (a.into(), b.into()),
            op,
            keys: None,
        }
    }
}

impl<W: WorldMut + 'static> DecoratorNode<W> for CompareBlackboardKeys {
    fn calculate_raw_condition(&self, ctx: &ConditionContext<'_, W>) -> bool {
        let Some((a, b)) = self.keys else {
            return false;
        };
        let equal = ctx.blackboard.compare_key_values(a, b) == Some(KeyComparison::Equal);
        match self.op {
            KeyCompareOp::Equal => equal,
            KeyCompareOp::NotEqual => !equal,
        }
    }

    fn on_become_relevant(&self, ctx: &mut AuxContext<'_, W>) {
        if let Some((a, b)) = self.keys {
            ctx.observe_key(a);
            ctx.observe_key(b);
        }
    }

    fn resolve_keys(&mut self, keys: &KeyResolver<'_>) -> Result<(), TreeError> {
        let a = keys.key(&self.names.0)?;
        let b = keys.key(&self.names.1)?;
        let (a_kind, b_kind) = (keys.key_kind(a), keys.key_kind(b));
        if a_kind != b_kind {
            return Err(TreeError::KeyKindMismatch {
                node: keys.node_name().to_string(),
                a: self.names.0.clone(),
                a_kind: a_kind.ok_or_else(|| unknown(keys, &self.names.0))?,
                b: self.names.1.clone(),
                b_kind: b_kind.ok_or_else(|| unknown(keys, &self.names.1))?,
            });
        }
        self.keys = Some((a, b));
        Ok(())
    }
}

fn unknown(keys: &KeyResolver<'_>, key: &str) -> TreeError {
    TreeError::UnknownKey {
        node: keys.node_name().to_string(),
        key: key.to_string(),
    }
}

#[derive(Debug, Default)]
struct CooldownMemory {
    last_end: Option<f64>,
}

/// Blocks its branch for `seconds` after the branch stopped being active.
///
/// The condition is only checked by searches passing through the decorator; expiry alone does
/// not trigger a search.
#[derive(Debug, Clone, Copy)]
pub struct Cooldown {
    seconds: f64,
}

impl Cooldown {
    pub fn new(seconds: f32) -> Self {
        Self {
            seconds: f64::from(seconds.max(0.0)),
        }
    }
}

impl<W: WorldMut + 'static> DecoratorNode<W> for Cooldown {
    fn calculate_raw_condition(&self, ctx: &ConditionContext<'_, W>) -> bool {
        match ctx.memory::<CooldownMemory>().and_then(|memory| memory.last_end) {
            Some(last_end) => ctx.now() - last_end >= self.seconds,
            None => true,
        }
    }

    fn on_cease_relevant(&self, ctx: &mut AuxContext<'_, W>) {
        let now = ctx.now();
        if let Some(memory) = ctx.memory::<CooldownMemory>() {
            memory.last_end = Some(now);
        }
    }

    fn create_memory(&self) -> Option<NodeMemory> {
        Some(Box::new(CooldownMemory::default()))
    }
}

#[derive(Debug, Default)]
struct TimeLimitMemory {
    started: f64,
    expired: bool,
}

/// Fails its branch once it has been active for `seconds`.
#[derive(Debug, Clone, Copy)]
pub struct TimeLimit {
    seconds: f64,
}

impl TimeLimit {
    pub fn new(seconds: f32) -> Self {
        Self {
            seconds: f64::from(seconds.max(0.0)),
        }
    }
}

impl<W: WorldMut + 'static> DecoratorNode<W> for TimeLimit {
    fn calculate_raw_condition(&self, _ctx: &ConditionContext<'_, W>) -> bool {
        true
    }

    fn on_become_relevant(&self, ctx: &mut AuxContext<'_, W>) {
        let now = ctx.now();
        if let Some(memory) = ctx.memory::<TimeLimitMemory>() {
            memory.started = now;
            memory.expired = false;
        }
    }

    fn wants_tick(&self) -> bool {
        true
    }

    fn tick(&self, ctx: &mut AuxContext<'_, W>, _dt: f32) {
        let now = ctx.now();
        let limit = self.seconds;
        let expired = match ctx.memory::<TimeLimitMemory>() {
            Some(memory) if !memory.expired && now - memory.started >= limit => {
                memory.expired = true;
                true
            }
            _ => false,
        };
        if expired {
            tracing::debug!(node = %ctx.node(), limit, "time limit reached");
            ctx.abort_branch();
        }
    }

    fn create_memory(&self) -> Option<NodeMemory> {
        Some(Box::new(TimeLimitMemory::default()))
    }
}

/// Decorator backed by a closure, for conditions that live in game code.
pub struct Condition<F> {
    check: F,
    observed: Vec<String>,
    keys: Vec<KeyId>,
}

impl<F> Condition<F> {
    pub fn new(check: F) -> Self {
        Self {
            check,
            observed: Vec::new(),
            keys: Vec::new(),
        }
    }

    /// Re-evaluates the condition whenever `key_name` changes while the decorator is relevant.
    pub fn observe(mut self, key_name: impl Into<String>) -> Self {
        self.observed.push(key_name.into());
        self
    }
}

impl<W, F> DecoratorNode<W> for Condition<F>
where
    W: WorldMut + 'static,
    F: Fn(W::Agent, &W, &BlackboardComponent) -> bool + Send + Sync + 'static,
{
    fn calculate_raw_condition(&self, ctx: &ConditionContext<'_, W>) -> bool {
        (self.check)(ctx.agent, ctx.world, ctx.blackboard)
    }

    fn on_become_relevant(&self, ctx: &mut AuxContext<'_, W>) {
        for &key in &self.keys {
            ctx.observe_key(key);
        }
    }

    fn resolve_keys(&mut self, keys: &KeyResolver<'_>) -> Result<(), TreeError> {
        self.keys = self
            .observed
            .iter()
            .map(|name| keys.key(name))
            .collect::<Result<_, _>>()?;
        Ok(())
    }
}
