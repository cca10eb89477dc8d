//! Listener registries for integrator notifications. We keep two explicit registries
//! (general step listeners; MD force/thermostat listeners) rather than filtering one
//! mixed list by type at dispatch, plus a third for hard-collision events.
//!
//! Listeners receive the box state mutably, so observers such as constraint enforcers
//! or periodic-boundary wrappers can act on it directly.

use crate::state::SimState;

/// Snapshot of the integrator's clock, passed to every notification.
#[derive(Clone, Copy, Debug)]
pub struct StepContext {
    pub step_count: u64,
    /// Simulated time in reduced units. Zero for Monte Carlo integrators.
    pub time: f64,
}

/// General integrator lifecycle notifications. Fired only on interval boundaries
/// (see `StepperCore::set_event_interval`), except `initialized`, which fires on
/// every `reset`.
pub trait StepListener {
    fn step_started(&mut self, _state: &mut SimState, _ctx: StepContext) {}
    fn step_finished(&mut self, _state: &mut SimState, _ctx: StepContext) {}
    fn initialized(&mut self, _state: &mut SimState, _ctx: StepContext) {}
}

/// MD-specific notifications, tied to the force-evaluation and thermostat points
/// inside a single MD step.
pub trait MdListener {
    /// Immediately before the potential provider runs.
    fn forces_precomputed(&mut self, _state: &mut SimState, _ctx: StepContext) {}
    /// Immediately after forces are available, before the closing half-kick.
    fn forces_computed(&mut self, _state: &mut SimState, _ctx: StepContext) {}
    /// Before a scheduled thermostat firing.
    fn pre_thermostat(&mut self, _state: &mut SimState, _ctx: StepContext) {}
}

/// Hard-potential collision notifications. `partner` is None for field/wall events.
pub trait CollisionListener {
    fn collision(
        &mut self,
        _particle: usize,
        _partner: Option<usize>,
        _virial: f64,
        _energy_change: f64,
    ) {
    }
}

/// Monte Carlo trial notifications, fired in initiated → accepted/rejected order.
pub trait TrialListener {
    fn trial_initiated(&mut self, _move_name: &str) {}
    fn trial_accepted(&mut self, _move_name: &str, _chi: f64) {}
    fn trial_rejected(&mut self, _move_name: &str, _chi: f64) {}
}

// Fire helpers take the listener list and the state as disjoint borrows, so callers
// can invoke them on their own fields without aliasing.

pub(crate) fn fire_step_started(
    listeners: &mut [Box<dyn StepListener>],
    state: &mut SimState,
    ctx: StepContext,
) {
    for l in listeners {
        l.step_started(state, ctx);
    }
}

pub(crate) fn fire_step_finished(
    listeners: &mut [Box<dyn StepListener>],
    state: &mut SimState,
    ctx: StepContext,
) {
    for l in listeners {
        l.step_finished(state, ctx);
    }
}

pub(crate) fn fire_initialized(
    listeners: &mut [Box<dyn StepListener>],
    state: &mut SimState,
    ctx: StepContext,
) {
    for l in listeners {
        l.initialized(state, ctx);
    }
}

pub(crate) fn fire_forces_precomputed(
    listeners: &mut [Box<dyn MdListener>],
    state: &mut SimState,
    ctx: StepContext,
) {
    for l in listeners {
        l.forces_precomputed(state, ctx);
    }
}

pub(crate) fn fire_forces_computed(
    listeners: &mut [Box<dyn MdListener>],
    state: &mut SimState,
    ctx: StepContext,
) {
    for l in listeners {
        l.forces_computed(state, ctx);
    }
}

pub(crate) fn fire_pre_thermostat(
    listeners: &mut [Box<dyn MdListener>],
    state: &mut SimState,
    ctx: StepContext,
) {
    for l in listeners {
        l.pre_thermostat(state, ctx);
    }
}
