//! Velocity-Verlet: the symmetric, time-reversible baseline for NVE/NVT dynamics.
//! Half-kick, drift, force recompute, half-kick.

use lin_alg::f64::Vec3;

use crate::{
    listener::{MdListener, StepContext, fire_forces_computed, fire_forces_precomputed},
    potential::{PotentialForce, PotentialResult},
    state::SimState,
};

/// One velocity-Verlet step. `forces` holds the forces from the previous step's
/// evaluation on entry, and the fresh evaluation on exit.
pub(crate) fn step_velocity_verlet(
    state: &mut SimState,
    forces: &mut [Vec3],
    pot: &mut dyn PotentialForce,
    dt: f64,
    md_listeners: &mut [Box<dyn MdListener>],
    ctx: StepContext,
) -> PotentialResult {
    let dt_half = 0.5 * dt;

    // First half-kick (v += f/m · dt/2) and drift (r += v · dt)
    for (i, p) in state.particles.iter_mut().enumerate() {
        if p.fixed {
            continue;
        }
        p.vel += forces[i] * (dt_half / p.mass);
        p.posit += p.vel * dt;
    }
    wrap_all(state);

    fire_forces_precomputed(md_listeners, state, ctx);
    let result = pot.compute_all(state, forces, true);
    fire_forces_computed(md_listeners, state, ctx);

    // Second half-kick using the forces calculated this step.
    for (i, p) in state.particles.iter_mut().enumerate() {
        if p.fixed {
            continue;
        }
        p.vel += forces[i] * (dt_half / p.mass);
    }

    result
}

pub(crate) fn wrap_all(state: &mut SimState) {
    let cell = state.cell;
    for p in &mut state.particles {
        if !p.fixed {
            p.posit = cell.wrap(p.posit);
        }
    }
}
