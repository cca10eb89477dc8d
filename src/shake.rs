//! SHAKE and RATTLE: iterative bond-length constraint satisfaction layered on a
//! velocity-Verlet step. SHAKE corrects positions along the pre-drift bond vectors
//! after the drift; RATTLE additionally enforces the derivative constraint (zero
//! relative velocity along each bond) with the same Gauss-Seidel sweep pattern.
//!
//! The sweeps re-visit only bonds touching an atom that moved in the previous sweep.
//! Hitting the iteration cap without convergence is a warning, not fatal; a
//! near-orthogonal new/old bond vector is a numerically-degenerate configuration and
//! is fatal.

use lin_alg::f64::Vec3;

use crate::{
    ambient::SimBox,
    listener::{MdListener, StepContext, fire_forces_computed, fire_forces_precomputed},
    potential::{PotentialForce, PotentialResult},
    state::{Particle, SimState},
    verlet::wrap_all,
};

const DEFAULT_TOL: f64 = 1.0e-8;
const DEFAULT_MAX_ITER: usize = 100;

/// Guard against tiny denominators in the constraint solve.
const EPS_DENOM: f64 = 1.0e-12;

/// A new bond vector nearly orthogonal to the pre-drift one means the constraint
/// solve has no leverage; the configuration is degenerate.
const ORTHOGONALITY_LIMIT: f64 = 0.1;

#[derive(Clone, Copy, Debug)]
pub struct BondConstraint {
    pub a: usize,
    pub b: usize,
    pub length: f64,
}

/// Result of one constraint relaxation.
#[derive(Clone, Copy, Debug)]
pub struct SweepOutcome {
    pub iterations: usize,
    pub converged: bool,
}

/// Constraint state for the SHAKE/RATTLE step variants: the bond list, tolerances,
/// and scratch reused across iterations (sized once per box attach).
pub struct ConstraintState {
    pub bonds: Vec<BondConstraint>,
    /// Relative tolerance on bond length² for the position sweep; absolute tolerance
    /// on dr·dv for the velocity sweep.
    pub tol: f64,
    pub max_iter: usize,
    /// Pre-drift bond vectors, captured each step.
    dr_old: Vec<Vec3>,
    moved: Vec<bool>,
    update: Vec<bool>,
}

impl ConstraintState {
    pub fn new(bonds: Vec<BondConstraint>) -> Self {
        Self {
            bonds,
            tol: DEFAULT_TOL,
            max_iter: DEFAULT_MAX_ITER,
            dr_old: Vec::new(),
            moved: Vec::new(),
            update: Vec::new(),
        }
    }

    fn resize_scratch(&mut self, n_particles: usize) {
        self.dr_old.resize(self.bonds.len(), Vec3::new_zero());
        self.moved.resize(n_particles, false);
        self.update.resize(n_particles, false);
    }
}

/// Iteratively adjust positions along the pre-drift bond directions until every
/// bond-length-squared constraint is satisfied within tolerance. Gauss-Seidel over
/// bonds, re-visiting only bonds touching an atom moved in the previous sweep.
pub(crate) fn shake_positions(
    particles: &mut [Particle],
    cell: &SimBox,
    bonds: &[BondConstraint],
    dr_old: &[Vec3],
    tol: f64,
    max_iter: usize,
    moved: &mut [bool],
    update: &mut [bool],
) -> SweepOutcome {
    for flag in moved.iter_mut() {
        *flag = false;
    }
    for bond in bonds {
        moved[bond.a] = true;
        moved[bond.b] = true;
    }

    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iter {
        iterations += 1;
        let mut any_moved = false;

        for (k, bond) in bonds.iter().enumerate() {
            if !moved[bond.a] && !moved[bond.b] {
                continue;
            }

            let len_sq = bond.length * bond.length;
            let (pa, pb) = crate::split2_mut(particles, bond.a, bond.b);

            let dr = cell.min_image(pa.posit - pb.posit);
            let diff = dr.magnitude_squared() - len_sq;
            if diff.abs() <= 2.0 * tol * len_sq {
                continue;
            }

            let dr_o = dr_old[k];
            let dot = dr.dot(dr_o);
            if dot / len_sq < ORTHOGONALITY_LIMIT {
                eprintln!(
                    "SHAKE degenerate bond ({}, {}): dr {:?}, dr_old {:?}, dot/len² = {:.4}",
                    bond.a,
                    bond.b,
                    dr,
                    dr_o,
                    dot / len_sq
                );
                panic!("SHAKE: new bond vector nearly orthogonal to reference");
            }

            let inv_mass_sum = pa.inv_mass() + pb.inv_mass();
            if inv_mass_sum == 0.0 {
                continue; // both ends fixed
            }

            // g = (r² − L²) / (2 · dr·dr_old · Σ 1/m)
            let g = diff / (2.0 * dot.max(EPS_DENOM) * inv_mass_sum);
            pa.posit -= dr_o * (g * pa.inv_mass());
            pb.posit += dr_o * (g * pb.inv_mass());

            update[bond.a] = true;
            update[bond.b] = true;
            any_moved = true;
        }

        if !any_moved {
            converged = true;
            break;
        }

        for i in 0..moved.len() {
            moved[i] = update[i];
            update[i] = false;
        }
    }

    if !converged {
        eprintln!("SHAKE did not converge within {max_iter} iterations; continuing with best estimate");
    }

    SweepOutcome {
        iterations,
        converged,
    }
}

/// The velocity half of RATTLE: project out relative velocity along each bond
/// direction, with the same sparse Gauss-Seidel pattern.
pub(crate) fn rattle_velocities(
    particles: &mut [Particle],
    cell: &SimBox,
    bonds: &[BondConstraint],
    tol: f64,
    max_iter: usize,
    moved: &mut [bool],
    update: &mut [bool],
) -> SweepOutcome {
    for flag in moved.iter_mut() {
        *flag = false;
    }
    for bond in bonds {
        moved[bond.a] = true;
        moved[bond.b] = true;
    }

    let mut iterations = 0;
    let mut converged = false;

    while iterations < max_iter {
        iterations += 1;
        let mut any_moved = false;

        for bond in bonds {
            if !moved[bond.a] && !moved[bond.b] {
                continue;
            }

            // Use the ideal length² in the denominator: SHAKE just ran, so the
            // measured value is equal within tolerance, but the ideal is exact.
            let len_sq = bond.length * bond.length;
            let (pa, pb) = crate::split2_mut(particles, bond.a, bond.b);

            let dr = cell.min_image(pa.posit - pb.posit);
            let dv = pa.vel - pb.vel;
            let v_dot_r = dr.dot(dv);
            if v_dot_r.abs() <= tol {
                continue;
            }

            let inv_mass_sum = pa.inv_mass() + pb.inv_mass();
            if inv_mass_sum == 0.0 {
                continue;
            }

            let g = v_dot_r / (len_sq * inv_mass_sum);
            pa.vel -= dr * (g * pa.inv_mass());
            pb.vel += dr * (g * pb.inv_mass());

            update[bond.a] = true;
            update[bond.b] = true;
            any_moved = true;
        }

        if !any_moved {
            converged = true;
            break;
        }

        for i in 0..moved.len() {
            moved[i] = update[i];
            update[i] = false;
        }
    }

    if !converged {
        eprintln!("RATTLE did not converge within {max_iter} iterations; continuing with best estimate");
    }

    SweepOutcome {
        iterations,
        converged,
    }
}

/// One constrained velocity-Verlet step. With `rattle`, the derivative constraint is
/// enforced after the closing half-kick as well.
pub(crate) fn step_constrained(
    algo: &mut ConstraintState,
    state: &mut SimState,
    forces: &mut [Vec3],
    pot: &mut dyn PotentialForce,
    dt: f64,
    rattle: bool,
    md_listeners: &mut [Box<dyn MdListener>],
    ctx: StepContext,
) -> PotentialResult {
    algo.resize_scratch(state.particles.len());
    let dt_half = 0.5 * dt;

    // Reference bond vectors before the drift.
    for (k, bond) in algo.bonds.iter().enumerate() {
        let dr = state.cell.min_image(
            state.particles[bond.a].posit - state.particles[bond.b].posit,
        );
        algo.dr_old[k] = dr;
    }

    // Unconstrained half-kick + drift.
    for (i, p) in state.particles.iter_mut().enumerate() {
        if p.fixed {
            continue;
        }
        p.vel += forces[i] * (dt_half / p.mass);
        p.posit += p.vel * dt;
    }

    shake_positions(
        &mut state.particles,
        &state.cell,
        &algo.bonds,
        &algo.dr_old,
        algo.tol,
        algo.max_iter,
        &mut algo.moved,
        &mut algo.update,
    );
    wrap_all(state);

    fire_forces_precomputed(md_listeners, state, ctx);
    let result = pot.compute_all(state, forces, true);
    fire_forces_computed(md_listeners, state, ctx);

    // Closing half-kick.
    for (i, p) in state.particles.iter_mut().enumerate() {
        if p.fixed {
            continue;
        }
        p.vel += forces[i] * (dt_half / p.mass);
    }

    if rattle {
        rattle_velocities(
            &mut state.particles,
            &state.cell,
            &algo.bonds,
            algo.tol,
            algo.max_iter,
            &mut algo.moved,
            &mut algo.update,
        );
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::SimBox;

    fn dimer(len: f64) -> (Vec<Particle>, Vec<BondConstraint>) {
        let mut a = Particle::new(Vec3::new(0., 0., 0.), 1.);
        let mut b = Particle::new(Vec3::new(len, 0., 0.), 1.);
        a.vel = Vec3::new(0.0, 0.3, 0.);
        b.vel = Vec3::new(0.0, -0.3, 0.);
        (
            vec![a, b],
            vec![BondConstraint {
                a: 0,
                b: 1,
                length: len,
            }],
        )
    }

    #[test]
    fn shake_restores_bond_length() {
        let (mut particles, bonds) = dimer(1.0);
        let cell = SimBox::new_cube(10.);

        let dr_old = vec![cell.min_image(particles[0].posit - particles[1].posit)];

        // Stretch the bond as a drift would.
        particles[1].posit = Vec3::new(1.3, 0.05, 0.);

        let mut moved = vec![false; 2];
        let mut update = vec![false; 2];
        let outcome = shake_positions(
            &mut particles,
            &cell,
            &bonds,
            &dr_old,
            1e-10,
            100,
            &mut moved,
            &mut update,
        );

        assert!(outcome.converged);
        let r = (particles[0].posit - particles[1].posit).magnitude();
        assert!((r - 1.0).abs() < 1e-6, "r = {r}");
    }

    #[test]
    fn rattle_zeroes_bond_rate() {
        let (mut particles, bonds) = dimer(1.0);
        let cell = SimBox::new_cube(10.);

        // Give the pair a stretching velocity.
        particles[0].vel = Vec3::new(-0.5, 0.1, 0.);
        particles[1].vel = Vec3::new(0.5, -0.1, 0.);

        let mut moved = vec![false; 2];
        let mut update = vec![false; 2];
        let outcome = rattle_velocities(
            &mut particles,
            &cell,
            &bonds,
            1e-12,
            100,
            &mut moved,
            &mut update,
        );

        assert!(outcome.converged);
        let dr = particles[0].posit - particles[1].posit;
        let dv = particles[0].vel - particles[1].vel;
        assert!(dr.dot(dv).abs() < 1e-10);
    }

    #[test]
    #[should_panic(expected = "orthogonal")]
    fn near_orthogonal_bond_is_fatal() {
        let (mut particles, bonds) = dimer(1.0);
        let cell = SimBox::new_cube(10.);

        // Reference along x, but the drifted bond points along y.
        let dr_old = vec![Vec3::new(1., 0., 0.)];
        particles[1].posit = Vec3::new(0., 1.4, 0.);

        let mut moved = vec![false; 2];
        let mut update = vec![false; 2];
        shake_positions(
            &mut particles,
            &cell,
            &bonds,
            &dr_old,
            1e-10,
            100,
            &mut moved,
            &mut update,
        );
    }
}
