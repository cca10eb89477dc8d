//! Per-particle kinematic storage, and the per-box simulation state the integrators
//! operate on. Integrators own one `SimState` each; the potential/force provider stays
//! external and is passed into each step.

use lin_alg::f64::Vec3;
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use crate::ambient::{BOLTZMANN_K, SimBox};

/// A trimmed-down particle for use with the integrators. Positions and velocities are
/// mutated in place by the step algorithms; everything else is fixed at setup.
#[derive(Clone, Debug)]
pub struct Particle {
    /// Reduced length units.
    pub posit: Vec3,
    /// Reduced length / time units.
    pub vel: Vec3,
    pub mass: f64,
    /// Fixed (infinite-mass) particles exert forces on the system but are never moved
    /// by it, and are excluded from momentum and temperature bookkeeping.
    pub fixed: bool,
}

impl Default for Particle {
    fn default() -> Self {
        Self {
            posit: Vec3::new_zero(),
            vel: Vec3::new_zero(),
            mass: 1.,
            fixed: false,
        }
    }
}

impl Particle {
    pub fn new(posit: Vec3, mass: f64) -> Self {
        Self {
            posit,
            mass,
            ..Default::default()
        }
    }

    /// 0 for fixed particles, so impulse formulas treat them as immovable walls.
    pub fn inv_mass(&self) -> f64 {
        if self.fixed { 0. } else { 1. / self.mass }
    }
}

/// The kinematic state of one box: particles, periodic cell, and the random source
/// shared by every stochastic element operating on this box. The RNG is seedable so
/// trajectories are reproducible.
pub struct SimState {
    pub particles: Vec<Particle>,
    pub cell: SimBox,
    pub rng: StdRng,
}

impl SimState {
    pub fn new(particles: Vec<Particle>, cell: SimBox, seed: u64) -> Self {
        Self {
            particles,
            cell,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Number of particles that the integrator actually moves.
    pub fn num_mobile(&self) -> usize {
        self.particles.iter().filter(|p| !p.fixed).count()
    }

    /// Degrees of freedom for temperature bookkeeping: 3 per mobile particle.
    /// Constrained integrators subtract their constraint counts on top of this.
    pub fn dof(&self) -> usize {
        3 * self.num_mobile()
    }

    /// Total kinetic energy over mobile particles.
    pub fn kinetic_energy(&self) -> f64 {
        let mut result = 0.0;

        for p in &self.particles {
            if !p.fixed {
                result += 0.5 * p.mass * p.vel.magnitude_squared();
            }
        }

        result
    }

    /// Kinetic energy resolved per Cartesian dimension; used by per-dimension
    /// velocity rescaling.
    pub fn kinetic_energy_per_dim(&self) -> [f64; 3] {
        let mut result = [0.0; 3];

        for p in &self.particles {
            if p.fixed {
                continue;
            }
            result[0] += 0.5 * p.mass * p.vel.x * p.vel.x;
            result[1] += 0.5 * p.mass * p.vel.y * p.vel.y;
            result[2] += 0.5 * p.mass * p.vel.z * p.vel.z;
        }

        result
    }

    /// Instantaneous kinetic temperature, in energy units (k_B = 1).
    pub fn temperature(&self) -> f64 {
        let dof = self.dof();
        if dof == 0 {
            return 0.;
        }
        2.0 * self.kinetic_energy() / (dof as f64 * BOLTZMANN_K)
    }

    /// Draw every mobile particle's velocity fresh from the Maxwell-Boltzmann
    /// distribution at `temp`, optionally removing net drift afterward.
    pub fn assign_velocities(&mut self, temp: f64, zero_drift: bool) {
        for p in &mut self.particles {
            if p.fixed {
                continue;
            }

            let sigma = (BOLTZMANN_K * temp / p.mass).sqrt();
            let nx: f64 = self.rng.sample(StandardNormal);
            let ny: f64 = self.rng.sample(StandardNormal);
            let nz: f64 = self.rng.sample(StandardNormal);

            p.vel = Vec3::new(sigma * nx, sigma * ny, sigma * nz);
        }

        if zero_drift {
            crate::momentum::shift_momenta(&mut self.particles);
        }
    }

    /// Free-flight position advance; wraps each particle back into the cell.
    pub(crate) fn advance_free_flight(&mut self, dt: f64) {
        let cell = self.cell;
        for p in &mut self.particles {
            if p.fixed {
                continue;
            }
            p.posit = cell.wrap(p.posit + p.vel * dt);
        }
    }

    /// Positions snapshot, e.g. for the hybrid-MC thermostat's rollback state.
    pub(crate) fn save_positions(&self, out: &mut Vec<Vec3>) {
        out.clear();
        out.extend(self.particles.iter().map(|p| p.posit));
    }

    pub(crate) fn restore_positions(&mut self, saved: &[Vec3]) {
        assert_eq!(saved.len(), self.particles.len());
        for (p, r) in self.particles.iter_mut().zip(saved) {
            p.posit = *r;
        }
    }

    /// A non-finite position indicates an unrecoverable numerical blow-up, e.g. from
    /// an unstable time step. Fatal; never silently recovered.
    pub(crate) fn assert_positions_finite(&self, context: &str) {
        for (i, p) in self.particles.iter().enumerate() {
            let ok = p.posit.x.is_finite() && p.posit.y.is_finite() && p.posit.z.is_finite();
            if !ok {
                eprintln!(
                    "Non-finite position during {context}: particle {i}, posit {:?}, vel {:?}",
                    p.posit, p.vel
                );
                panic!("non-finite particle position; the simulation has diverged");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ambient::SimBox;

    fn small_state(n: usize) -> SimState {
        let particles = (0..n)
            .map(|i| Particle::new(Vec3::new(i as f64, 0., 0.), 1.))
            .collect();
        SimState::new(particles, SimBox::new_cube(20.), 7)
    }

    #[test]
    fn assigned_velocities_match_temperature() {
        let mut state = small_state(4_000);
        state.assign_velocities(1.5, false);

        // Sample mean of T converges as 1/sqrt(N); 4000 particles gives ~2% noise.
        let t = state.temperature();
        assert!((t - 1.5).abs() < 0.1, "T = {t}");
    }

    #[test]
    fn fixed_particles_excluded() {
        let mut state = small_state(10);
        state.particles[0].fixed = true;
        state.assign_velocities(2.0, false);

        assert_eq!(state.num_mobile(), 9);
        assert_eq!(state.dof(), 27);
        assert!(state.particles[0].vel.magnitude() < 1e-12);
    }
}
