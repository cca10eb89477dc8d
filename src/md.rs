//! The time-stepping MD integrator: step orchestration over the tagged step-algorithm
//! variants, energy caches, center-of-mass drift control, thermostat scheduling, and
//! snapshot recording.

use lin_alg::f64::Vec3;

use crate::{
    Diagnostics, OverlapError,
    gear::{GearNphState, GearState, step_gear4, step_gear4_nph},
    integrator::StepperCore,
    langevin::{BrownianScheme, step_brownian, step_langevin_baoab},
    listener::{
        MdListener, StepContext, StepListener, fire_initialized, fire_step_finished,
        fire_step_started,
    },
    mc::MoveSet,
    momentum::{shift_momenta, zero_angular_momentum},
    potential::{PotentialForce, PotentialResult},
    rigid::RigidState,
    shake::{ConstraintState, step_constrained},
    snapshot::{Snapshot, SnapshotHandler, snapshot_due},
    state::SimState,
    thermostat::{Thermostat, ThermostatState},
    verlet::step_velocity_verlet,
};

/// Steps between linear center-of-mass drift removals, when enabled.
pub const COM_REMOVAL_RATIO_LINEAR: u64 = 10;
pub const COM_REMOVAL_RATIO_ANGULAR: u64 = 20;

/// The closed set of deterministic step algorithms, each carrying its own scratch
/// state and dispatched through one `step` seam.
pub enum StepAlgorithm {
    VelocityVerlet,
    Gear4(GearState),
    Gear4Nph(GearNphState),
    /// BAOAB splitting; `gamma` is friction in 1/time. Zero friction degenerates
    /// exactly to velocity-Verlet.
    Langevin { gamma: f64 },
    /// Overdamped dynamics; no inertial velocity integration.
    Brownian { scheme: BrownianScheme },
    /// Velocity-Verlet with SHAKE position constraints.
    Shake(ConstraintState),
    /// SHAKE positions plus the RATTLE velocity sweep.
    Rattle(ConstraintState),
    /// Rigid molecules with iterative rotational integration.
    Rigid(RigidState),
}

impl Default for StepAlgorithm {
    fn default() -> Self {
        Self::VelocityVerlet
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MdConfig {
    /// Step size, reduced time units.
    pub dt: f64,
    /// Target temperature, energy units (k_B = 1).
    pub temp_target: f64,
    /// When false the thermostat never fires on schedule and the run samples NVE
    /// (or NPH, for the Gear NPH variant).
    pub isothermal: bool,
    pub thermostat: Thermostat,
    /// MD steps between thermostat firings.
    pub thermostat_interval: u32,
    /// Remove net momentum introduced by thermostat randomization.
    pub zero_net_drift: bool,
    /// Zero linear/angular COM drift every this many steps; None disables.
    pub com_removal_ratio_linear: Option<u64>,
    pub com_removal_ratio_angular: Option<u64>,
    pub snapshot_handlers: Vec<SnapshotHandler>,
    pub diagnostics: Diagnostics,
}

impl Default for MdConfig {
    fn default() -> Self {
        Self {
            dt: 0.005,
            temp_target: 1.,
            isothermal: false,
            thermostat: Default::default(),
            thermostat_interval: 100,
            zero_net_drift: true,
            com_removal_ratio_linear: Some(COM_REMOVAL_RATIO_LINEAR),
            com_removal_ratio_angular: Some(COM_REMOVAL_RATIO_ANGULAR),
            snapshot_handlers: Vec::new(),
            diagnostics: Default::default(),
        }
    }
}

/// Recompute the box potential energy through a full force evaluation. Positive
/// infinity means hard-core overlap: the energy is recomputed once more in verbose
/// mode for diagnostics, then the distinguished overlap failure is returned for the
/// caller to handle (fatal; not retried internally).
pub(crate) fn recompute_potential_energy(
    state: &SimState,
    pot: &mut dyn PotentialForce,
    forces: &mut Vec<Vec3>,
    diagnostics: &Diagnostics,
) -> Result<PotentialResult, OverlapError> {
    forces.resize(state.particles.len(), Vec3::new_zero());
    let result = pot.compute_all(state, forces, true);

    if result.energy.is_infinite() && result.energy > 0. {
        if diagnostics.verbose {
            eprintln!("Configuration overlap detected; re-running energy computation verbosely");
        }
        pot.compute_verbose(state, forces);
        return Err(OverlapError::new(
            "configuration overlap: potential energy is infinite",
        ));
    }

    Ok(result)
}

/// The MD integrator for one box.
pub struct MdIntegrator {
    pub core: StepperCore,
    pub cfg: MdConfig,
    pub state: SimState,
    pub(crate) algo: StepAlgorithm,
    pub(crate) thermo: ThermostatState,
    /// Updated by reset and by each step's force recomputation.
    pub potential_energy: f64,
    pub kinetic_energy: f64,
    /// Virial/hypervirial sums from the last force evaluation.
    pub last_result: PotentialResult,
    pub(crate) forces: Vec<Vec3>,
    pub(crate) time: f64,
    pub snapshots: Vec<Snapshot>,
    pub step_listeners: Vec<Box<dyn StepListener>>,
    pub md_listeners: Vec<Box<dyn MdListener>>,
    /// Trial moves for the hybrid-MC thermostat's companion segment.
    pub hybrid_moves: Option<MoveSet>,
}

impl MdIntegrator {
    pub fn new(state: SimState, cfg: MdConfig, algo: StepAlgorithm) -> Self {
        let thermo = ThermostatState::new(cfg.thermostat_interval);
        Self {
            core: StepperCore::new(),
            cfg,
            state,
            algo,
            thermo,
            potential_energy: 0.,
            kinetic_energy: 0.,
            last_result: Default::default(),
            forces: Vec::new(),
            time: 0.,
            snapshots: Vec::new(),
            step_listeners: Vec::new(),
            md_listeners: Vec::new(),
            hybrid_moves: None,
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub(crate) fn ctx(&self) -> StepContext {
        StepContext {
            step_count: self.core.step_count,
            time: self.time,
        }
    }

    /// One step of length `cfg.dt`. This method orchestrates the dynamics at each
    /// time step; the configured algorithm variant does the numerical work.
    pub fn do_step(&mut self, pot: &mut dyn PotentialForce) {
        assert!(
            self.core.is_initialized(),
            "MdIntegrator::reset must run before stepping"
        );

        let at_interval = self.core.begin_step();
        let ctx = self.ctx();
        if at_interval {
            fire_step_started(&mut self.step_listeners, &mut self.state, ctx);
        }

        let dt = self.cfg.dt;
        let result = match &mut self.algo {
            StepAlgorithm::VelocityVerlet => step_velocity_verlet(
                &mut self.state,
                &mut self.forces,
                pot,
                dt,
                &mut self.md_listeners,
                ctx,
            ),
            StepAlgorithm::Gear4(gear) => step_gear4(
                gear,
                &mut self.state,
                &mut self.forces,
                pot,
                dt,
                &mut self.md_listeners,
                ctx,
            ),
            StepAlgorithm::Gear4Nph(nph) => step_gear4_nph(
                nph,
                &mut self.state,
                &mut self.forces,
                pot,
                dt,
                self.cfg.temp_target,
                &mut self.md_listeners,
                ctx,
            ),
            StepAlgorithm::Langevin { gamma } => step_langevin_baoab(
                &mut self.state,
                &mut self.forces,
                pot,
                dt,
                *gamma,
                self.cfg.temp_target,
                &mut self.md_listeners,
                ctx,
            ),
            StepAlgorithm::Brownian { scheme } => step_brownian(
                &mut self.state,
                &mut self.forces,
                pot,
                dt,
                self.cfg.temp_target,
                *scheme,
                &mut self.md_listeners,
                ctx,
            ),
            StepAlgorithm::Shake(constraints) => step_constrained(
                constraints,
                &mut self.state,
                &mut self.forces,
                pot,
                dt,
                false,
                &mut self.md_listeners,
                ctx,
            ),
            StepAlgorithm::Rattle(constraints) => step_constrained(
                constraints,
                &mut self.state,
                &mut self.forces,
                pot,
                dt,
                true,
                &mut self.md_listeners,
                ctx,
            ),
            StepAlgorithm::Rigid(rigid) => crate::rigid::step_rigid(
                rigid,
                &mut self.state,
                &mut self.forces,
                pot,
                dt,
                &mut self.md_listeners,
                ctx,
            ),
        };

        self.state.assert_positions_finite("MD step");
        self.potential_energy = result.energy;
        self.last_result = result;
        self.time += dt;

        if let Some(ratio) = self.cfg.com_removal_ratio_linear {
            if self.core.step_count.is_multiple_of(ratio) {
                shift_momenta(&mut self.state.particles);
            }
        }
        if let Some(ratio) = self.cfg.com_removal_ratio_angular {
            if self.core.step_count.is_multiple_of(ratio) {
                zero_angular_momentum(&mut self.state.particles);
            }
        }

        self.kinetic_energy = self.state.kinetic_energy();

        if self.cfg.isothermal {
            self.thermo.countdown -= 1;
            if self.thermo.countdown == 0 {
                self.thermo.countdown = self.cfg.thermostat_interval;
                // Maintains the kinetic-energy cache itself (incrementally, for the
                // single-particle variant).
                self.do_thermostat(pot);
            }
        }

        self.record_snapshots();

        if let Some(interval) = self.cfg.diagnostics.print_interval {
            if self.core.step_count.is_multiple_of(interval) {
                self.print_ambient_data();
            }
        }

        if at_interval {
            let ctx = self.ctx();
            fire_step_finished(&mut self.step_listeners, &mut self.state, ctx);
        }
        self.core.end_step(at_interval);
    }

    /// Print ambient parameters, as a sanity check.
    fn print_ambient_data(&self) {
        println!(
            "Step {}: T = {:.4}  K = {:.4}  U = {:.4}  E = {:.4}",
            self.core.step_count,
            self.state.temperature(),
            self.kinetic_energy,
            self.potential_energy,
            self.total_energy(),
        );
    }

    fn record_snapshots(&mut self) {
        if snapshot_due(&self.cfg.snapshot_handlers, self.core.step_count) {
            self.snapshots.push(Snapshot::take(
                &self.state,
                self.time,
                self.kinetic_energy,
                self.potential_energy,
            ));
        }
    }

    /// Recompute forces and the potential-energy cache (failing on configuration
    /// overlap) and fire the initialized notification. Subsequent algorithm state
    /// (Gear chains, etc.) re-primes on the next step.
    pub fn reset(&mut self, pot: &mut dyn PotentialForce) -> Result<(), OverlapError> {
        self.core.begin_reset();

        let result = recompute_potential_energy(
            &self.state,
            pot,
            &mut self.forces,
            &self.cfg.diagnostics,
        )?;
        self.potential_energy = result.energy;
        self.last_result = result;
        self.kinetic_energy = self.state.kinetic_energy();

        match &mut self.algo {
            StepAlgorithm::Gear4(gear) => gear.invalidate(),
            StepAlgorithm::Gear4Nph(nph) => nph.invalidate(),
            _ => {}
        }

        if let Some(moves) = &mut self.hybrid_moves {
            moves.renormalize();
        }

        let ctx = self.ctx();
        fire_initialized(&mut self.step_listeners, &mut self.state, ctx);
        Ok(())
    }

    /// Hook after restoring a checkpoint: rebuild forces and caches from the restored
    /// kinematic state.
    pub fn post_restore(&mut self, pot: &mut dyn PotentialForce) -> Result<(), OverlapError> {
        self.reset(pot)
    }

    /// Changing the target while initialized forces an out-of-schedule thermostat
    /// firing on the next step, so sampling continues at the new temperature rather
    /// than waiting out a full interval.
    pub fn set_temperature(&mut self, temp: f64) {
        self.cfg.temp_target = temp;
        if self.core.is_initialized() && self.cfg.isothermal {
            self.thermo.countdown = 1;
        }
    }

    /// Enabling thermostatting mid-run likewise fires immediately.
    pub fn set_isothermal(&mut self, isothermal: bool) {
        self.cfg.isothermal = isothermal;
        if isothermal && self.core.is_initialized() {
            self.thermo.countdown = 1;
        }
    }

    /// Total energy, from the cached kinetic and potential values.
    pub fn total_energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }
}

#[cfg(test)]
mod tests {
    use lin_alg::f64::Vec3;

    use super::*;
    use crate::{
        ambient::SimBox,
        potential::IdealGas,
        state::{Particle, SimState},
    };

    fn free_state(n: usize) -> SimState {
        let particles = (0..n)
            .map(|i| {
                let mut p = Particle::new(Vec3::new(i as f64 * 1.5, 0., 0.), 1.);
                p.vel = Vec3::new(0.1, 0.05 * i as f64, 0.);
                p
            })
            .collect();
        SimState::new(particles, SimBox::new_cube(40.), 13)
    }

    #[test]
    #[should_panic(expected = "reset")]
    fn stepping_before_reset_panics() {
        let mut md = MdIntegrator::new(free_state(2), MdConfig::default(), StepAlgorithm::default());
        let mut pot = IdealGas;
        md.do_step(&mut pot);
    }

    #[test]
    fn free_flight_advances_positions() {
        let mut cfg = MdConfig::default();
        cfg.com_removal_ratio_linear = None;
        cfg.com_removal_ratio_angular = None;

        let mut md = MdIntegrator::new(free_state(3), cfg, StepAlgorithm::default());
        let mut pot = IdealGas;
        md.reset(&mut pot).unwrap();

        let x0 = md.state.particles[0].posit.x;
        for _ in 0..10 {
            md.do_step(&mut pot);
        }
        let x1 = md.state.particles[0].posit.x;

        assert!((x1 - x0 - 0.1 * 0.005 * 10.).abs() < 1e-12);
        assert_eq!(md.core.step_count, 10);
        assert!((md.time() - 0.05).abs() < 1e-12);
    }

    #[test]
    fn temperature_change_forces_refire() {
        let mut cfg = MdConfig::default();
        cfg.isothermal = true;
        cfg.thermostat_interval = 50;

        let mut md = MdIntegrator::new(free_state(8), cfg, StepAlgorithm::default());
        let mut pot = IdealGas;
        md.reset(&mut pot).unwrap();
        md.do_step(&mut pot);

        md.set_temperature(2.0);
        assert_eq!(md.thermo.countdown, 1);
    }
}
