//! The potential/force provider interfaces consumed by the integrators, plus a small
//! set of reference implementations used in tests and examples: Lennard-Jones,
//! harmonic bonds, hard spheres, square wells, and hard boundaries.
//!
//! Continuous potentials return per-particle forces plus energy/virial sums. Hard
//! potentials instead predict pairwise collision times and apply the instantaneous
//! "bump" at the collision instant. A discrete per-pair state (a small integer)
//! selects which branch of a multi-branch hard potential governs the pair, e.g.
//! inside/outside a square well.

use lin_alg::f64::Vec3;

use crate::{
    ambient::SimBox,
    state::{Particle, SimState},
};

/// Output sums of a full force evaluation.
#[derive(Clone, Copy, Debug, Default)]
pub struct PotentialResult {
    pub energy: f64,
    /// Σ r·f over pairs; feeds pressure measurement.
    pub virial: f64,
    /// Σ r² d²u/dr² over pairs; feeds the NPH feedback terms.
    pub hypervirial: f64,
}

/// A continuous potential-energy surface: fills per-particle forces and returns the
/// summed energy and (optionally) virials.
pub trait PotentialForce {
    fn compute_all(&mut self, state: &SimState, forces: &mut [Vec3], need_virial: bool)
    -> PotentialResult;

    /// Interaction energy of one particle with the rest of the system, used by
    /// Monte Carlo trial moves for O(move-cost) energy differences.
    fn particle_energy(&mut self, state: &SimState, i: usize) -> f64;

    /// Re-run the energy computation in a verbose/debug mode, printing whatever the
    /// implementation considers diagnostic. Called once before a configuration-overlap
    /// failure is propagated.
    fn compute_verbose(&mut self, state: &SimState, forces: &mut [Vec3]) -> PotentialResult {
        self.compute_all(state, forces, true)
    }
}

/// Result sums of a single hard-collision bump.
#[derive(Clone, Copy, Debug, Default)]
pub struct BumpResult {
    /// Impulsive virial contribution, J·dr.
    pub virial: f64,
    /// Change in potential energy (e.g. −ε on square-well capture).
    pub energy_change: f64,
}

/// A hard pair potential: predicts the next collision between two particles and
/// applies the velocity/state change at the collision instant.
pub trait HardPotential {
    /// Time from the caller's position epoch until the pair collides, or INFINITY if
    /// it never does under free flight. `dr = r_a − r_b` and `dv = v_a − v_b` are
    /// taken at the epoch; `false_time` projects the pair forward before solving, and
    /// is included in the returned time.
    fn collision_time(&self, dr: Vec3, dv: Vec3, state: i32, false_time: f64) -> f64;

    /// Apply the collision at contact. `dr` is the minimum-image displacement
    /// `r_a − r_b` at the collision instant. Updates velocities only; the caller
    /// handles position advancement. Returns the pair's new discrete state.
    fn bump(&self, a: &mut Particle, b: &mut Particle, dr: Vec3, state: i32, out: &mut BumpResult)
    -> i32;

    /// Pair energy at separation² `r_sq` under `state`; +INFINITY signals hard-core
    /// overlap. Used for the reset-time energy sum and overlap detection.
    fn energy(&self, r_sq: f64, state: i32) -> f64;

    /// The discrete state consistent with a separation² at setup time.
    fn initial_state(&self, r_sq: f64) -> i32;

    /// Outer interaction range; bounds neighbor cutoffs and the null-collision
    /// traversal estimate.
    fn range(&self) -> f64;
}

/// A hard one-body field (wall/boundary): collisions with partner index −1 in the
/// classic encoding, represented here as `Partner::Field`.
pub trait FieldHardPotential {
    fn collision_time(&self, p: &Particle, cell: &SimBox, false_time: f64) -> f64;
    fn bump(&self, p: &mut Particle, cell: &SimBox, out: &mut BumpResult);
}

// ---------------------------------------------------------------------------
// Continuous reference potentials
// ---------------------------------------------------------------------------

/// No interactions at all. Useful for thermostat and free-flight tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdealGas;

impl PotentialForce for IdealGas {
    fn compute_all(
        &mut self,
        _state: &SimState,
        forces: &mut [Vec3],
        _need_virial: bool,
    ) -> PotentialResult {
        for f in forces.iter_mut() {
            *f = Vec3::new_zero();
        }
        PotentialResult::default()
    }

    fn particle_energy(&mut self, _state: &SimState, _i: usize) -> f64 {
        0.
    }
}

/// 12-6 Lennard-Jones with a plain distance cutoff, evaluated over all pairs with
/// minimum-image displacements. O(N²); the reference implementation favors clarity
/// over neighbor-list bookkeeping.
#[derive(Clone, Copy, Debug)]
pub struct LennardJones {
    pub sigma: f64,
    pub epsilon: f64,
    pub cutoff: f64,
}

impl Default for LennardJones {
    fn default() -> Self {
        Self {
            sigma: 1.,
            epsilon: 1.,
            cutoff: 3.,
        }
    }
}

impl LennardJones {
    /// (energy, du/dr / r) at separation² r_sq.
    fn pair_terms(&self, r_sq: f64) -> (f64, f64) {
        let s2 = self.sigma * self.sigma / r_sq;
        let s6 = s2 * s2 * s2;
        let s12 = s6 * s6;

        let u = 4. * self.epsilon * (s12 - s6);
        // du/dr = -(24 ε / r)(2 s12 − s6); we return (du/dr)/r for direct vector use.
        let du_over_r = -24. * self.epsilon * (2. * s12 - s6) / r_sq;
        (u, du_over_r)
    }

    /// r² d²u/dr² at separation² r_sq.
    fn pair_hypervirial(&self, r_sq: f64) -> f64 {
        let s2 = self.sigma * self.sigma / r_sq;
        let s6 = s2 * s2 * s2;
        let s12 = s6 * s6;
        4. * self.epsilon * (156. * s12 - 42. * s6)
    }
}

impl PotentialForce for LennardJones {
    fn compute_all(
        &mut self,
        state: &SimState,
        forces: &mut [Vec3],
        need_virial: bool,
    ) -> PotentialResult {
        for f in forces.iter_mut() {
            *f = Vec3::new_zero();
        }

        let mut result = PotentialResult::default();
        let cutoff_sq = self.cutoff * self.cutoff;
        let ps = &state.particles;

        for i in 0..ps.len() {
            for j in (i + 1)..ps.len() {
                if ps[i].fixed && ps[j].fixed {
                    continue;
                }

                let dr = state.cell.min_image(ps[i].posit - ps[j].posit);
                let r_sq = dr.magnitude_squared();
                if r_sq >= cutoff_sq {
                    continue;
                }
                if r_sq == 0.0 {
                    // Coincident particles: an overlap, not a skippable pair.
                    result.energy = f64::INFINITY;
                    continue;
                }

                let (u, du_over_r) = self.pair_terms(r_sq);
                result.energy += u;

                // f_on_i = -du/dr · r̂ = -(du/dr)/r · dr
                let f = dr * (-du_over_r);
                forces[i] += f;
                forces[j] -= f;

                if need_virial {
                    result.virial += dr.dot(f);
                    result.hypervirial += self.pair_hypervirial(r_sq);
                }
            }
        }

        result
    }

    fn particle_energy(&mut self, state: &SimState, i: usize) -> f64 {
        let mut energy = 0.0;
        let cutoff_sq = self.cutoff * self.cutoff;
        let ps = &state.particles;

        for j in 0..ps.len() {
            if j == i {
                continue;
            }
            let dr = state.cell.min_image(ps[i].posit - ps[j].posit);
            let r_sq = dr.magnitude_squared();
            if r_sq >= cutoff_sq {
                continue;
            }
            if r_sq == 0.0 {
                return f64::INFINITY;
            }
            energy += self.pair_terms(r_sq).0;
        }

        energy
    }

    fn compute_verbose(&mut self, state: &SimState, forces: &mut [Vec3]) -> PotentialResult {
        let ps = &state.particles;
        for i in 0..ps.len() {
            for j in (i + 1)..ps.len() {
                let dr = state.cell.min_image(ps[i].posit - ps[j].posit);
                let r_sq = dr.magnitude_squared();
                if r_sq < self.sigma * self.sigma * 0.64 {
                    eprintln!(
                        "LJ near-overlap: pair ({i}, {j}), r = {:.4}, posits {:?} {:?}",
                        r_sq.sqrt(),
                        ps[i].posit,
                        ps[j].posit
                    );
                }
            }
        }
        self.compute_all(state, forces, true)
    }
}

/// Harmonic springs between fixed particle pairs: u = ½ k (r − r₀)².
#[derive(Clone, Debug)]
pub struct HarmonicBonds {
    pub pairs: Vec<(usize, usize)>,
    pub k: f64,
    pub r0: f64,
}

impl PotentialForce for HarmonicBonds {
    fn compute_all(
        &mut self,
        state: &SimState,
        forces: &mut [Vec3],
        need_virial: bool,
    ) -> PotentialResult {
        for f in forces.iter_mut() {
            *f = Vec3::new_zero();
        }

        let mut result = PotentialResult::default();
        let ps = &state.particles;

        for &(i, j) in &self.pairs {
            let dr = state.cell.min_image(ps[i].posit - ps[j].posit);
            let r = dr.magnitude();
            if r == 0.0 {
                continue;
            }

            let stretch = r - self.r0;
            result.energy += 0.5 * self.k * stretch * stretch;

            // f_on_i = -k (r - r0) r̂
            let f = dr * (-self.k * stretch / r);
            forces[i] += f;
            forces[j] -= f;

            if need_virial {
                result.virial += dr.dot(f);
                result.hypervirial += self.k * r * r;
            }
        }

        result
    }

    fn particle_energy(&mut self, state: &SimState, i: usize) -> f64 {
        let mut energy = 0.0;
        let ps = &state.particles;
        for &(a, b) in &self.pairs {
            if a != i && b != i {
                continue;
            }
            let dr = state.cell.min_image(ps[a].posit - ps[b].posit);
            let stretch = dr.magnitude() - self.r0;
            energy += 0.5 * self.k * stretch * stretch;
        }
        energy
    }
}

// ---------------------------------------------------------------------------
// Hard reference potentials
// ---------------------------------------------------------------------------

/// Quadratic contact solve: time until |dr + t dv| = `contact`, approaching branch.
/// Returns INFINITY when the pair never reaches contact.
fn time_to_contact_approaching(dr: Vec3, dv: Vec3, contact_sq: f64) -> f64 {
    let b = dr.dot(dv);
    if b >= 0.0 {
        return f64::INFINITY; // receding
    }
    let v_sq = dv.magnitude_squared();
    if v_sq == 0.0 {
        return f64::INFINITY;
    }
    let discr = b * b - v_sq * (dr.magnitude_squared() - contact_sq);
    if discr < 0.0 {
        return f64::INFINITY; // misses: impact parameter too large
    }
    (-b - discr.sqrt()) / v_sq
}

/// Time until |dr + t dv| = `contact` from the inside, outgoing branch. The pair is
/// assumed inside the shell, so the discriminant is positive.
fn time_to_contact_outgoing(dr: Vec3, dv: Vec3, contact_sq: f64) -> f64 {
    let b = dr.dot(dv);
    let v_sq = dv.magnitude_squared();
    if v_sq == 0.0 {
        return f64::INFINITY;
    }
    let discr = b * b - v_sq * (dr.magnitude_squared() - contact_sq);
    if discr < 0.0 {
        return f64::INFINITY;
    }
    (-b + discr.sqrt()) / v_sq
}

/// Hard spheres of a fixed diameter. Single-branch: the discrete state is unused.
#[derive(Clone, Copy, Debug)]
pub struct HardSphere {
    pub diameter: f64,
}

impl HardPotential for HardSphere {
    fn collision_time(&self, dr: Vec3, dv: Vec3, _state: i32, false_time: f64) -> f64 {
        let dr = dr + dv * false_time;
        let t = time_to_contact_approaching(dr, dv, self.diameter * self.diameter);
        false_time + t
    }

    fn bump(
        &self,
        a: &mut Particle,
        b: &mut Particle,
        dr: Vec3,
        state: i32,
        out: &mut BumpResult,
    ) -> i32 {
        let r_sq = dr.magnitude_squared();
        let dv = a.vel - b.vel;
        let b_dot = dr.dot(dv);

        // Elastic impulse along the line of centers.
        let reduced = 1.0 / (a.inv_mass() + b.inv_mass());
        let impulse = dr * (-2.0 * reduced * b_dot / r_sq);

        a.vel += impulse * a.inv_mass();
        b.vel -= impulse * b.inv_mass();

        out.virial = impulse.dot(dr);
        out.energy_change = 0.0;
        state
    }

    fn energy(&self, r_sq: f64, _state: i32) -> f64 {
        if r_sq < self.diameter * self.diameter {
            f64::INFINITY
        } else {
            0.
        }
    }

    fn initial_state(&self, _r_sq: f64) -> i32 {
        0
    }

    fn range(&self) -> f64 {
        self.diameter
    }
}

/// Square-well pair states.
pub const SQW_OUTSIDE: i32 = 0;
pub const SQW_INSIDE: i32 = 1;

/// Square well: hard core of diameter `core`, attractive well of depth `epsilon`
/// extending to `lambda * core`. Two discrete branches: outside the well, and
/// captured inside it. Well-edge events either capture, escape, or internally
/// reflect depending on the radial kinetic energy.
#[derive(Clone, Copy, Debug)]
pub struct SquareWell {
    pub core: f64,
    pub lambda: f64,
    pub epsilon: f64,
}

impl SquareWell {
    fn well_diameter(&self) -> f64 {
        self.core * self.lambda
    }
}

impl HardPotential for SquareWell {
    fn collision_time(&self, dr: Vec3, dv: Vec3, state: i32, false_time: f64) -> f64 {
        let dr = dr + dv * false_time;
        let well_sq = self.well_diameter() * self.well_diameter();
        let core_sq = self.core * self.core;

        let t = match state {
            SQW_OUTSIDE => time_to_contact_approaching(dr, dv, well_sq),
            SQW_INSIDE => {
                // Core collision first if the geometry allows; otherwise the pair
                // coasts to the well edge.
                let t_core = time_to_contact_approaching(dr, dv, core_sq);
                if t_core.is_finite() {
                    t_core
                } else {
                    time_to_contact_outgoing(dr, dv, well_sq)
                }
            }
            other => panic!("square well: unknown pair state {other}"),
        };

        false_time + t
    }

    fn bump(
        &self,
        a: &mut Particle,
        b: &mut Particle,
        dr: Vec3,
        state: i32,
        out: &mut BumpResult,
    ) -> i32 {
        let r_sq = dr.magnitude_squared();
        let dv = a.vel - b.vel;
        let b_dot = dr.dot(dv);
        let reduced = 1.0 / (a.inv_mass() + b.inv_mass());

        let core_sq = self.core * self.core;
        // Distinguish core hits from well-edge events by which contact we're at.
        let at_core = (r_sq - core_sq).abs() < (r_sq - self.well_diameter().powi(2)).abs();

        let (impulse, energy_change, new_state) = if state == SQW_INSIDE && at_core {
            // Elastic core bounce; stays captured.
            (dr * (-2.0 * reduced * b_dot / r_sq), 0.0, SQW_INSIDE)
        } else {
            // Well edge. Radial relative velocity b/r changes so that kinetic energy
            // absorbs or supplies ε.
            let b_over_r_sq = b_dot * b_dot / r_sq;

            if state == SQW_OUTSIDE {
                // Capture: falls into the well, gaining kinetic energy ε.
                let new_b = -(b_over_r_sq + 2.0 * self.epsilon / reduced).sqrt() * r_sq.sqrt();
                (
                    dr * (reduced * (new_b - b_dot) / r_sq),
                    -self.epsilon,
                    SQW_INSIDE,
                )
            } else if b_over_r_sq > 2.0 * self.epsilon / reduced {
                // Escape: enough outward radial kinetic energy to climb out.
                let new_b = (b_over_r_sq - 2.0 * self.epsilon / reduced).sqrt() * r_sq.sqrt();
                (
                    dr * (reduced * (new_b - b_dot) / r_sq),
                    self.epsilon,
                    SQW_OUTSIDE,
                )
            } else {
                // Not enough: internal reflection off the well edge.
                (dr * (-2.0 * reduced * b_dot / r_sq), 0.0, SQW_INSIDE)
            }
        };

        a.vel += impulse * a.inv_mass();
        b.vel -= impulse * b.inv_mass();

        out.virial = impulse.dot(dr);
        out.energy_change = energy_change;
        new_state
    }

    fn energy(&self, r_sq: f64, _state: i32) -> f64 {
        if r_sq < self.core * self.core {
            f64::INFINITY
        } else if r_sq < self.well_diameter() * self.well_diameter() {
            -self.epsilon
        } else {
            0.
        }
    }

    fn initial_state(&self, r_sq: f64) -> i32 {
        if r_sq < self.well_diameter() * self.well_diameter() {
            SQW_INSIDE
        } else {
            SQW_OUTSIDE
        }
    }

    fn range(&self) -> f64 {
        self.well_diameter()
    }
}

/// Hard container walls at the box bounds: particles reflect elastically off each
/// face instead of wrapping. For use with non-periodic scenarios.
#[derive(Clone, Copy, Debug)]
pub struct HardBoundary {
    /// Particle radius, so spheres contact the wall at surface rather than center.
    pub radius: f64,
}

impl FieldHardPotential for HardBoundary {
    fn collision_time(&self, p: &Particle, cell: &SimBox, false_time: f64) -> f64 {
        let posit = p.posit + p.vel * false_time;
        let mut t_min = f64::INFINITY;

        for dim in 0..3 {
            let (x, v, lo, hi) = match dim {
                0 => (posit.x, p.vel.x, cell.bounds_low.x, cell.bounds_high.x),
                1 => (posit.y, p.vel.y, cell.bounds_low.y, cell.bounds_high.y),
                _ => (posit.z, p.vel.z, cell.bounds_low.z, cell.bounds_high.z),
            };

            if v > 0.0 {
                let t = (hi - self.radius - x) / v;
                if t >= 0.0 {
                    t_min = t_min.min(t);
                }
            } else if v < 0.0 {
                let t = (lo + self.radius - x) / v;
                if t >= 0.0 {
                    t_min = t_min.min(t);
                }
            }
        }

        false_time + t_min
    }

    fn bump(&self, p: &mut Particle, cell: &SimBox, out: &mut BumpResult) {
        // Reflect the component for whichever face we're touching (nearest face wins).
        let mut best_dim = 0;
        let mut best_gap = f64::INFINITY;

        for dim in 0..3 {
            let (x, lo, hi) = match dim {
                0 => (p.posit.x, cell.bounds_low.x, cell.bounds_high.x),
                1 => (p.posit.y, cell.bounds_low.y, cell.bounds_high.y),
                _ => (p.posit.z, cell.bounds_low.z, cell.bounds_high.z),
            };
            let gap = (x - (lo + self.radius)).abs().min((hi - self.radius - x).abs());
            if gap < best_gap {
                best_gap = gap;
                best_dim = dim;
            }
        }

        let (v, dv) = match best_dim {
            0 => {
                let v = p.posit.x;
                p.vel.x = -p.vel.x;
                (v, 2.0 * p.mass * p.vel.x)
            }
            1 => {
                let v = p.posit.y;
                p.vel.y = -p.vel.y;
                (v, 2.0 * p.mass * p.vel.y)
            }
            _ => {
                let v = p.posit.z;
                p.vel.z = -p.vel.z;
                (v, 2.0 * p.mass * p.vel.z)
            }
        };

        out.virial = v * dv;
        out.energy_change = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Particle;

    #[test]
    fn hard_sphere_head_on_time() {
        // Two unit spheres 4 apart closing at relative speed 2: contact when the
        // gap (4 − 1) closes, at t = 1.5.
        let dr = Vec3::new(-4., 0., 0.); // r_a − r_b
        let dv = Vec3::new(2., 0., 0.); // closing
        let hs = HardSphere { diameter: 1. };
        let t = hs.collision_time(dr, dv, 0, 0.);
        assert!((t - 1.5).abs() < 1e-12, "t = {t}");
    }

    #[test]
    fn hard_sphere_bump_exchanges_equal_masses() {
        let hs = HardSphere { diameter: 1. };
        let mut a = Particle::new(Vec3::new(0., 0., 0.), 1.);
        let mut b = Particle::new(Vec3::new(1., 0., 0.), 1.);
        a.vel = Vec3::new(1., 0., 0.);
        b.vel = Vec3::new(-1., 0., 0.);

        let mut out = BumpResult::default();
        let rel = a.posit - b.posit;
        hs.bump(&mut a, &mut b, rel, 0, &mut out);

        assert!((a.vel.x - -1.0).abs() < 1e-12);
        assert!((b.vel.x - 1.0).abs() < 1e-12);
        assert!((out.energy_change).abs() < 1e-12);
    }

    #[test]
    fn square_well_capture_and_escape_conserve_energy() {
        let sw = SquareWell {
            core: 1.,
            lambda: 1.5,
            epsilon: 0.5,
        };

        let mut a = Particle::new(Vec3::new(0., 0., 0.), 1.);
        let mut b = Particle::new(Vec3::new(1.5, 0., 0.), 1.);
        a.vel = Vec3::new(0.3, 0., 0.);
        b.vel = Vec3::new(-0.3, 0., 0.);

        let ke_before = 0.5 * (a.vel.magnitude_squared() + b.vel.magnitude_squared());
        let mut out = BumpResult::default();
        let rel = a.posit - b.posit;
        let s = sw.bump(&mut a, &mut b, rel, SQW_OUTSIDE, &mut out);
        let ke_after = 0.5 * (a.vel.magnitude_squared() + b.vel.magnitude_squared());

        assert_eq!(s, SQW_INSIDE);
        assert!((out.energy_change - -0.5).abs() < 1e-12);
        // Total energy conserved: ΔKE = −ΔU
        assert!((ke_after - ke_before - 0.5).abs() < 1e-12);
    }

    #[test]
    fn square_well_slow_pair_reflects_internally() {
        let sw = SquareWell {
            core: 1.,
            lambda: 1.5,
            epsilon: 5.0,
        };

        // Separating slowly at the well edge: cannot pay ε, must reflect.
        let mut a = Particle::new(Vec3::new(0., 0., 0.), 1.);
        let mut b = Particle::new(Vec3::new(-1.5, 0., 0.), 1.);
        a.vel = Vec3::new(0.1, 0., 0.);
        b.vel = Vec3::new(-0.1, 0., 0.);

        let mut out = BumpResult::default();
        let rel = a.posit - b.posit;
        let s = sw.bump(&mut a, &mut b, rel, SQW_INSIDE, &mut out);

        assert_eq!(s, SQW_INSIDE);
        assert!(out.energy_change.abs() < 1e-12);
        // Now approaching each other again.
        assert!((a.vel - b.vel).dot(a.posit - b.posit) < 0.);
    }

    #[test]
    fn harmonic_bond_restores_toward_rest_length() {
        let particles = vec![
            Particle::new(Vec3::new(0., 0., 0.), 1.),
            Particle::new(Vec3::new(1.5, 0., 0.), 1.),
        ];
        let state = SimState::new(particles, SimBox::new_cube(20.), 1);
        let mut bonds = HarmonicBonds {
            pairs: vec![(0, 1)],
            k: 10.,
            r0: 1.,
        };
        let mut forces = vec![Vec3::new_zero(); 2];

        let result = bonds.compute_all(&state, &mut forces, true);

        // Stretched by 0.5: u = ½·10·0.25, force pulls the pair together.
        assert!((result.energy - 1.25).abs() < 1e-12);
        assert!(forces[0].x > 0. && forces[1].x < 0.);
        assert!((forces[0] + forces[1]).magnitude() < 1e-12);

        // Per-particle energy shows the full bond on both ends.
        assert!((bonds.particle_energy(&state, 0) - 1.25).abs() < 1e-12);
        assert!((bonds.particle_energy(&state, 1) - 1.25).abs() < 1e-12);
    }

    #[test]
    fn lj_forces_oppose_and_sum_to_zero() {
        let particles = vec![
            Particle::new(Vec3::new(0., 0., 0.), 1.),
            Particle::new(Vec3::new(1.0, 0., 0.), 1.),
        ];
        let state = SimState::new(particles, SimBox::new_cube(20.), 1);
        let mut lj = LennardJones::default();
        let mut forces = vec![Vec3::new_zero(); 2];

        lj.compute_all(&state, &mut forces, false);
        assert!((forces[0] + forces[1]).magnitude() < 1e-12);
        // At r < 2^(1/6) σ the pair is repulsive: force on particle 0 points -x.
        assert!(forces[0].x < 0.);
    }
}
