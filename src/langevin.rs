//! Stochastic propagators: Langevin dynamics in the BAOAB splitting, and
//! overdamped/Brownian dynamics.
//!
//! BAOAB: half-kick (B), half-drift (A), a full Ornstein-Uhlenbeck friction+noise
//! update (O), half-drift (A), force recompute, half-kick (B). At γ = 0 the O step is
//! the identity and the scheme reduces exactly to velocity-Verlet.

use lin_alg::f64::Vec3;
use rand::Rng;
use rand_distr::StandardNormal;

use crate::{
    ambient::BOLTZMANN_K,
    listener::{MdListener, StepContext, fire_forces_computed, fire_forces_precomputed},
    potential::{PotentialForce, PotentialResult},
    state::SimState,
    verlet::wrap_all,
};

/// Noise amplitude `1 − exp(−2x)`, with a 4-term Taylor expansion below this
/// threshold to avoid catastrophic cancellation at small γh.
const OU_TAYLOR_THRESHOLD: f64 = 1e-4;

/// `1 − exp(−2x)`, stable for small x.
fn one_minus_exp_neg2(x: f64) -> f64 {
    if x < OU_TAYLOR_THRESHOLD {
        // 2x − 2x² + (4/3)x³ − (2/3)x⁴
        let x2 = x * x;
        2. * x - 2. * x2 + (4. / 3.) * x2 * x - (2. / 3.) * x2 * x2
    } else {
        1. - (-2. * x).exp()
    }
}

/// One BAOAB step at friction `gamma` (1/time) and temperature `temp`.
pub(crate) fn step_langevin_baoab(
    state: &mut SimState,
    forces: &mut [Vec3],
    pot: &mut dyn PotentialForce,
    dt: f64,
    gamma: f64,
    temp: f64,
    md_listeners: &mut [Box<dyn MdListener>],
    ctx: StepContext,
) -> PotentialResult {
    let dt_half = 0.5 * dt;

    // B: half-kick
    for (i, p) in state.particles.iter_mut().enumerate() {
        if !p.fixed {
            p.vel += forces[i] * (dt_half / p.mass);
        }
    }

    // A: half-drift
    for p in &mut state.particles {
        if !p.fixed {
            p.posit += p.vel * dt_half;
        }
    }

    // O: exact OU update, v ← c₁ v + c₂ √(T/m) ξ. Skipped entirely at γ = 0 so the
    // zero-friction trajectory is bit-for-bit velocity-Verlet.
    if gamma > 0. {
        let c1 = (-gamma * dt).exp();
        let c2 = one_minus_exp_neg2(gamma * dt).sqrt();

        for p in &mut state.particles {
            if p.fixed {
                continue;
            }
            let sigma = (BOLTZMANN_K * temp / p.mass).sqrt();
            let nx: f64 = state.rng.sample(StandardNormal);
            let ny: f64 = state.rng.sample(StandardNormal);
            let nz: f64 = state.rng.sample(StandardNormal);

            p.vel.x = c1 * p.vel.x + c2 * sigma * nx;
            p.vel.y = c1 * p.vel.y + c2 * sigma * ny;
            p.vel.z = c1 * p.vel.z + c2 * sigma * nz;
        }
    }

    // A: second half-drift
    for p in &mut state.particles {
        if !p.fixed {
            p.posit += p.vel * dt_half;
        }
    }
    wrap_all(state);

    fire_forces_precomputed(md_listeners, state, ctx);
    let result = pot.compute_all(state, forces, true);
    fire_forces_computed(md_listeners, state, ctx);

    // B: final half-kick
    for (i, p) in state.particles.iter_mut().enumerate() {
        if !p.fixed {
            p.vel += forces[i] * (dt_half / p.mass);
        }
    }

    result
}

/// Noise discretization for the overdamped propagator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrownianScheme {
    /// Position-space noise only; velocities are not meaningful.
    EulerMaruyama,
    /// Velocity-coupled: the drift and noise pass through the velocity channel, so
    /// velocities remain inspectable between steps.
    Lm,
}

/// One overdamped step: positions drift by `h·F/m` plus thermal noise scaled by
/// `sqrt(2Th/m)`. There is no inertial velocity integration.
pub(crate) fn step_brownian(
    state: &mut SimState,
    forces: &mut [Vec3],
    pot: &mut dyn PotentialForce,
    dt: f64,
    temp: f64,
    scheme: BrownianScheme,
    md_listeners: &mut [Box<dyn MdListener>],
    ctx: StepContext,
) -> PotentialResult {
    match scheme {
        BrownianScheme::EulerMaruyama => {
            for (i, p) in state.particles.iter_mut().enumerate() {
                if p.fixed {
                    continue;
                }

                // A: deterministic drift down the force.
                p.posit += forces[i] * (dt / p.mass);

                // O: Euler-Maruyama noise.
                let amp = (2. * BOLTZMANN_K * temp * dt / p.mass).sqrt();
                let nx: f64 = state.rng.sample(StandardNormal);
                let ny: f64 = state.rng.sample(StandardNormal);
                let nz: f64 = state.rng.sample(StandardNormal);
                p.posit += Vec3::new(amp * nx, amp * ny, amp * nz);
            }
        }
        BrownianScheme::Lm => {
            for (i, p) in state.particles.iter_mut().enumerate() {
                if p.fixed {
                    continue;
                }

                // Drift and noise composed in the velocity channel, then one drift.
                let amp = (2. * BOLTZMANN_K * temp / (dt * p.mass)).sqrt();
                let nx: f64 = state.rng.sample(StandardNormal);
                let ny: f64 = state.rng.sample(StandardNormal);
                let nz: f64 = state.rng.sample(StandardNormal);

                p.vel = forces[i] * (1. / p.mass) + Vec3::new(amp * nx, amp * ny, amp * nz);
                p.posit += p.vel * dt;
            }
        }
    }
    wrap_all(state);

    fire_forces_precomputed(md_listeners, state, ctx);
    let result = pot.compute_all(state, forces, true);
    fire_forces_computed(md_listeners, state, ctx);
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taylor_branch_matches_exact() {
        // Just above and below the threshold the two branches must agree closely.
        for x in [5e-5, 9.9e-5, 1.1e-4, 5e-4] {
            let exact = 1. - (-2.0f64 * x).exp();
            let val = one_minus_exp_neg2(x);
            assert!((val - exact).abs() < 1e-14, "x = {x}");
        }
    }

    #[test]
    fn amplitude_zero_at_zero_friction() {
        assert_eq!(one_minus_exp_neg2(0.), 0.);
    }
}
