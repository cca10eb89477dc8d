//! See the [https://github.com/David-OConnor/kinetics/blob/main/README.md](Readme) for a general
//! overview. The textual information here is informal, and aimed at code maintenance; not
//! library use.
//!
//! This crate contains the integrator subsystem of a molecular simulation engine: it advances
//! particle positions and velocities under classical interatomic potentials (molecular
//! dynamics), performs Metropolis Monte Carlo sampling, or schedules exact discrete collision
//! events for hard potentials.
//!
//! ## A broad list of components:
//! - Event-driven hard-potential dynamics: per-particle collision prediction over a finite
//!   horizon, a binned event queue, exact "bump" execution with cascading invalidation
//! - Time-stepping MD: velocity-Verlet, Gear 4th-order predictor-corrector (NVE and NPH),
//!   Langevin BAOAB, Brownian/overdamped propagators, SHAKE/RATTLE constrained dynamics,
//!   rigid-body rotational integration
//! - A thermostat state machine: velocity scaling, the Andersen family, CSVR (Bussi), and
//!   hybrid MC/MD sampling over whole trajectory segments
//! - A Metropolis Monte Carlo trial engine with weighted move sets
//! - Multi-integrator managers: parallel tempering and Gibbs-ensemble exchange moves
//! - Cutoff neighbor lists, momentum/drift utilities, snapshot recording, plain-text
//!   checkpointing of the step counters
//!
//! Base units: reduced (Lennard-Jones-style) units with k_B = 1; temperature is measured in
//! energy units. Positions, velocities, and masses are f64 throughout; integrator correctness
//! is a precision game, so we don't mix in f32 the way a force pipeline might.
//!
//! The potential/force layer is a collaborator, not part of this crate's core: continuous
//! potentials implement [`PotentialForce`], hard potentials implement [`HardPotential`] /
//! [`FieldHardPotential`]. Reference implementations (Lennard-Jones, hard spheres, square
//! well, harmonic bonds, hard walls) live in [`potential`] and double as the test fixtures.
//!
//! Execution is single-threaded and synchronous: `do_step` runs to completion, long loops
//! (collision recomputation, constraint iteration) are bounded, and one integrator owns one
//! box's state at a time.

mod ambient;
mod event_queue;
mod gear;
mod hard;
mod integrator;
mod langevin;
mod listener;
mod manager;
mod mc;
mod md;
mod momentum;
mod neighbors;
pub mod potential;
mod rigid;
mod shake;
mod snapshot;
mod state;
mod thermostat;
mod verlet;

#[cfg(test)]
mod tests;

pub use ambient::{BOLTZMANN_K, SimBox, SimBoxInit, measure_pressure};
pub use gear::{GearNphState, GearState};
pub use hard::{HardConfig, HardIntegrator, HardPotentials, Partner};
pub use integrator::StepperCore;
pub use langevin::BrownianScheme;
pub use listener::{CollisionListener, MdListener, StepContext, StepListener, TrialListener};
pub use manager::{
    ExchangeEntry, ExchangeMove, ExchangeMoveSet, ExchangeVolume, IntegratorManager, ManagedBox,
    ManagerConfig, SwapConfigurations, TransferParticle,
};
pub use mc::{
    ChangeVolume, DisplaceParticle, McConfig, McIntegrator, McMove, MoveEntry, MoveSet,
    TrialOutcome,
};
pub use md::{MdConfig, MdIntegrator, StepAlgorithm};
pub use momentum::{
    net_momentum, randomize_momenta, randomize_momentum, randomize_total_kinetic_energy,
    scale_momenta, shift_momenta, zero_angular_momentum,
};
pub use neighbors::NeighborTable;
pub use potential::{
    BumpResult, FieldHardPotential, HardPotential, PotentialForce, PotentialResult,
};
pub use rigid::{RigidMolecule, RigidOrientation, RigidState};
pub use shake::{BondConstraint, ConstraintState, SweepOutcome};
pub use snapshot::{Snapshot, SnapshotHandler};
#[cfg(feature = "encode")]
pub use snapshot::{load_snapshots, save_snapshots};
pub use state::{Particle, SimState};
pub use thermostat::{Thermostat, ThermostatState};

/// Configuration-overlap failure: the potential energy is positive infinity at reset
/// time, i.e. hard cores intersect. Fatal to the caller; the energy computation is
/// re-run once in verbose mode for diagnostics before this propagates.
#[derive(Clone, Debug)]
pub struct OverlapError {
    pub descrip: String,
}

impl OverlapError {
    pub fn new(descrip: &str) -> Self {
        Self {
            descrip: descrip.to_owned(),
        }
    }
}

impl std::fmt::Display for OverlapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.descrip)
    }
}

impl std::error::Error for OverlapError {}

/// Diagnostics configuration, passed in at construction; replaces any notion of a
/// global debug flag. Disabled by default.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Diagnostics {
    /// Print extra context on failures (offending pairs, vectors, state tokens).
    pub verbose: bool,
    /// Print ambient data (temperature, energy, pressure inputs) every this many
    /// steps. None disables.
    pub print_interval: Option<u64>,
}

/// Mutable aliasing helper: two distinct mutable references into one slice.
pub(crate) fn split2_mut<T>(v: &mut [T], i: usize, j: usize) -> (&mut T, &mut T) {
    assert!(i != j);

    let (low, high) = if i < j { (i, j) } else { (j, i) };
    let (left, right) = v.split_at_mut(high);
    let (a, b) = (&mut left[low], &mut right[0]);
    if i < j { (a, b) } else { (b, a) }
}

#[cfg(test)]
mod lib_tests {
    use super::*;

    #[test]
    fn split2_order_follows_arguments() {
        let mut v = vec![10, 20, 30];
        {
            let (a, b) = split2_mut(&mut v, 2, 0);
            assert_eq!(*a, 30);
            assert_eq!(*b, 10);
        }
        let (a, b) = split2_mut(&mut v, 0, 2);
        assert_eq!(*a, 10);
        assert_eq!(*b, 30);
    }
}
