use arbor_core::{BlackboardComponent, WorldMut};

use crate::node::{AuxContext, ServiceNode};

/// Service backed by a closure receiving the time elapsed since its previous tick.
///
/// Typical use is refreshing blackboard values (distance to target, ammo count) while a
/// branch runs.
pub struct TickService<F> {
    on_tick: F,
}

impl<F> TickService<F> {
    pub fn new(on_tick: F) -> Self {
        Self { on_tick }
    }
}

impl<W, F> ServiceNode<W> for TickService<F>
where
    W: WorldMut + 'static,
    F: Fn(W::Agent, &mut W, &mut BlackboardComponent, f32) + Send + Sync + 'static,
{
    fn tick(&self, ctx: &mut AuxContext<'_, W>, elapsed: f32) {
        (self.on_tick)(ctx.agent, &mut *ctx.world, &mut *ctx.blackboard, elapsed);
    }
}
