//! The thermostat state machine coupling the MD integrators to a heat bath:
//! velocity scaling, the Andersen family, CSVR (Bussi) stochastic rescaling, and the
//! hybrid MC/MD thermostat that treats whole trajectory segments as Monte Carlo
//! trials.
//!
//! The simple variants are shared with the hard-collision integrator through
//! `apply_simple_thermostat`, which reports what it perturbed so that event-driven
//! callers can invalidate exactly the affected collision predictions.

use rand::Rng;
use rand_distr::{ChiSquared, Distribution, StandardNormal};

use lin_alg::f64::Vec3;

use crate::{
    ambient::BOLTZMANN_K,
    listener::fire_pre_thermostat,
    md::{MdIntegrator, recompute_potential_energy},
    mc::run_trial,
    momentum::{
        randomize_momenta, randomize_momentum, randomize_total_kinetic_energy, scale_momenta,
        shift_momenta,
    },
    potential::PotentialForce,
    state::SimState,
};

/// The thermostat kinds. `Csvr` is canonical sampling through velocity rescaling
/// (Bussi); the rest follow the classic velocity-scaling / Andersen taxonomy.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Thermostat {
    /// Shift net momentum to zero, then rescale per-dimension to the target.
    #[default]
    VelocityScaling,
    /// Periodic full-system momentum randomization.
    Andersen,
    /// Randomize one random particle's momentum per firing.
    AndersenSingle,
    /// Randomize the total kinetic energy from the Maxwell-Boltzmann chi-squared
    /// distribution, scaling velocities to match exactly.
    AndersenScaling,
    /// Exact OU update on the kinetic energy; gentle canonical coupling.
    /// `tau` is the relaxation time, in reduced time units.
    Csvr { tau: f64 },
    /// Treat each MD segment between firings as one Monte Carlo trial over
    /// configuration space; `mc_trials` companion MC steps run after each decision.
    HybridMc { mc_trials: u32 },
}

/// Mutable thermostat state: the firing countdown and the hybrid-MC reference
/// configuration and counters.
pub struct ThermostatState {
    pub countdown: u32,
    /// Rollback snapshot for hybrid MC.
    pub(crate) saved_posits: Vec<Vec3>,
    /// Saved potential energy matching `saved_posits`.
    pub(crate) saved_pe: f64,
    /// Total-energy baseline for the segment accept/reject test. NaN marks
    /// "uninitialized": no thermostat cycle has executed yet.
    pub(crate) saved_energy: f64,
    pub accepted: u64,
    pub rejected: u64,
}

impl ThermostatState {
    pub fn new(interval: u32) -> Self {
        assert!(interval > 0, "thermostat interval must be positive");
        Self {
            countdown: interval,
            saved_posits: Vec::new(),
            saved_pe: 0.,
            saved_energy: f64::NAN,
            accepted: 0,
            rejected: 0,
        }
    }
}

/// What a simple thermostat application did to the velocities, so event-driven
/// callers can invalidate the right collision predictions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ThermostatAction {
    ScaledAll,
    RandomizedAll,
    RandomizedOne(usize),
}

/// Apply one of the non-hybrid thermostats to a box. `dt_eff` is the simulated time
/// between firings (step size × thermostat interval), used by CSVR.
pub(crate) fn apply_simple_thermostat(
    kind: &Thermostat,
    state: &mut SimState,
    temp: f64,
    dt_eff: f64,
    zero_drift: bool,
) -> ThermostatAction {
    match kind {
        Thermostat::VelocityScaling => {
            shift_momenta(&mut state.particles);
            let particles = &mut state.particles;
            scale_momenta(particles, temp, &mut state.rng);
            ThermostatAction::ScaledAll
        }
        Thermostat::Andersen => {
            let particles = &mut state.particles;
            randomize_momenta(particles, temp, &mut state.rng);
            if zero_drift {
                shift_momenta(&mut state.particles);
            }
            ThermostatAction::RandomizedAll
        }
        Thermostat::AndersenSingle => {
            let n = state.particles.len();
            if state.num_mobile() == 0 {
                return ThermostatAction::ScaledAll;
            }
            let i = loop {
                let i = state.rng.random_range(0..n);
                if !state.particles[i].fixed {
                    break i;
                }
            };
            let particles = &mut state.particles;
            randomize_momentum(particles, i, temp, &mut state.rng);
            ThermostatAction::RandomizedOne(i)
        }
        Thermostat::AndersenScaling => {
            let particles = &mut state.particles;
            randomize_total_kinetic_energy(particles, temp, zero_drift, &mut state.rng);
            ThermostatAction::RandomizedAll
        }
        Thermostat::Csvr { tau } => {
            let lam = csvr_scale_factor(state, temp, dt_eff, *tau);
            for p in &mut state.particles {
                if !p.fixed {
                    p.vel *= lam;
                }
            }
            ThermostatAction::ScaledAll
        }
        Thermostat::HybridMc { .. } => {
            panic!("hybrid MC thermostat is only valid on the time-stepping MD integrator")
        }
    }
}

/// Canonical sampling through velocity rescaling (Bussi): the discrete-time exact
/// solution of the OU process on kinetic energy,
/// K' = K·c + K̄(1−c)(χ² + r²)/dof + 2r√(c(1−c)·K·K̄/dof).
/// Returns the velocity scale factor √(K'/K).
fn csvr_scale_factor(state: &mut SimState, temp: f64, dt: f64, tau: f64) -> f64 {
    let dof = state.dof().max(2) as f64;
    let ke = state.kinetic_energy();
    if ke <= 0. {
        return 1.;
    }

    let ke_bar = 0.5 * dof * BOLTZMANN_K * temp;
    let c = (-dt / tau).exp();

    let r: f64 = state.rng.sample(StandardNormal);
    let chi = ChiSquared::new(dof - 1.0)
        .expect("CSVR dof must exceed 1")
        .sample(&mut state.rng);

    let kprime = ke * c
        + ke_bar * (1.0 - c) * ((chi + r * r) / dof)
        + 2.0 * r * ((c * (1.0 - c) * ke * ke_bar / dof).sqrt());

    (kprime.max(0.) / ke).sqrt()
}

impl MdIntegrator {
    /// Thermostat dispatch, invoked when the firing countdown reaches zero (and
    /// out-of-schedule when the target temperature or isothermal flag changes).
    pub(crate) fn do_thermostat(&mut self, pot: &mut dyn PotentialForce) {
        let ctx = self.ctx();
        fire_pre_thermostat(&mut self.md_listeners, &mut self.state, ctx);

        // Whenever not isothermal, a forced firing initializes velocities by scaling,
        // regardless of the configured kind.
        if !self.cfg.isothermal || self.cfg.thermostat == Thermostat::VelocityScaling {
            shift_momenta(&mut self.state.particles);
            let particles = &mut self.state.particles;
            scale_momenta(particles, self.cfg.temp_target, &mut self.state.rng);
            self.kinetic_energy = self.state.kinetic_energy();
            return;
        }

        match self.cfg.thermostat.clone() {
            Thermostat::VelocityScaling => unreachable!("handled above"),
            Thermostat::Andersen
            | Thermostat::AndersenScaling
            | Thermostat::Csvr { .. } => {
                let dt_eff = self.cfg.dt * self.cfg.thermostat_interval as f64;
                apply_simple_thermostat(
                    &self.cfg.thermostat,
                    &mut self.state,
                    self.cfg.temp_target,
                    dt_eff,
                    self.cfg.zero_net_drift,
                );
                self.kinetic_energy = self.state.kinetic_energy();
            }
            Thermostat::AndersenSingle => {
                let state = &mut self.state;
                if state.num_mobile() == 0 {
                    return;
                }
                let n = state.particles.len();
                let i = loop {
                    let i = state.rng.random_range(0..n);
                    if !state.particles[i].fixed {
                        break i;
                    }
                };

                // Incremental kinetic-energy accounting: subtract the old
                // contribution, add the new, instead of recomputing globally.
                let p = &state.particles[i];
                let ke_old = 0.5 * p.mass * p.vel.magnitude_squared();

                let particles = &mut state.particles;
                randomize_momentum(particles, i, self.cfg.temp_target, &mut state.rng);

                let p = &state.particles[i];
                let ke_new = 0.5 * p.mass * p.vel.magnitude_squared();
                self.kinetic_energy += ke_new - ke_old;
            }
            Thermostat::HybridMc { mc_trials } => {
                self.do_thermostat_hybrid(pot, mc_trials);
            }
        }
    }

    /// Hybrid MC: the MD trajectory since the last firing is one Metropolis trial
    /// over configuration space, judged on total energy against the saved baseline.
    fn do_thermostat_hybrid(&mut self, pot: &mut dyn PotentialForce, mc_trials: u32) {
        let temp = self.cfg.temp_target;
        let pe_now = self.potential_energy;
        let ke_now = self.state.kinetic_energy();
        let mut positions_changed = false;

        if self.thermo.saved_energy.is_nan() {
            // First firing: the current configuration becomes the reference state.
            self.state.save_positions(&mut self.thermo.saved_posits);
            self.thermo.saved_pe = pe_now;
        } else {
            let energy_diff = (pe_now + ke_now) - self.thermo.saved_energy;
            let rejected = energy_diff > 0.
                && (-energy_diff / temp).exp() < self.state.rng.random::<f64>();

            if rejected {
                // Roll every position back to the snapshot. The saved energy drops
                // its kinetic contribution: momenta are re-randomized below anyway.
                self.state.restore_positions(&self.thermo.saved_posits);
                self.potential_energy = self.thermo.saved_pe;
                self.thermo.rejected += 1;
                positions_changed = true;
            } else {
                self.state.save_positions(&mut self.thermo.saved_posits);
                self.thermo.saved_pe = pe_now;
                self.thermo.accepted += 1;
            }
        }

        // Companion MC segment on the now-current configuration. Its moves maintain
        // their own energy bookkeeping, so the cache is resynchronized afterward.
        if mc_trials > 0 {
            if let Some(mut moves) = self.hybrid_moves.take() {
                for _ in 0..mc_trials {
                    run_trial(
                        &mut moves,
                        &mut self.state,
                        pot,
                        temp,
                        &mut self.potential_energy,
                        &mut [],
                    );
                }
                self.hybrid_moves = Some(moves);

                let result = recompute_potential_energy(
                    &self.state,
                    pot,
                    &mut self.forces,
                    &self.cfg.diagnostics,
                )
                .expect("configuration overlap after hybrid MC segment");
                self.potential_energy = result.energy;
                self.last_result = result;

                // The next MD segment starts here; rollback targets this
                // configuration.
                self.state.save_positions(&mut self.thermo.saved_posits);
                self.thermo.saved_pe = self.potential_energy;
                positions_changed = true;
            }
        }

        if positions_changed {
            // Forces are stale for the restored/mutated configuration.
            let result = recompute_potential_energy(
                &self.state,
                pot,
                &mut self.forces,
                &self.cfg.diagnostics,
            )
            .expect("configuration overlap after hybrid rollback");
            self.potential_energy = result.energy;
            self.last_result = result;
        }

        // Momenta are always re-randomized, accept or reject.
        {
            let particles = &mut self.state.particles;
            randomize_momenta(particles, temp, &mut self.state.rng);
        }
        if self.cfg.zero_net_drift {
            shift_momenta(&mut self.state.particles);
        }

        let fresh_ke = self.state.kinetic_energy();
        self.kinetic_energy = fresh_ke;
        self.thermo.saved_energy = self.potential_energy + fresh_ke;
    }

    /// Lifetime accepted/(accepted+rejected) ratio of hybrid-MC segment trials.
    pub fn hybrid_acceptance_ratio(&self) -> f64 {
        let total = self.thermo.accepted + self.thermo.rejected;
        if total == 0 {
            0.
        } else {
            self.thermo.accepted as f64 / total as f64
        }
    }

    /// Reset the hybrid trial counters, independent of the thermostat itself.
    pub fn reset_hybrid_statistics(&mut self) {
        self.thermo.accepted = 0;
        self.thermo.rejected = 0;
    }
}
