//! Crate-level property tests: energy conservation and step-size scaling, integrator
//! equivalences, thermostat targets, Monte Carlo acceptance statistics, constraint
//! satisfaction, and checkpoint behavior.

use std::{cell::RefCell, io, rc::Rc};

use approx::assert_relative_eq;
use lin_alg::f64::Vec3;

use crate::{
    ambient::SimBox,
    langevin::BrownianScheme,
    manager::{IntegratorManager, ManagedBox, ManagerConfig, SwapConfigurations},
    mc::{McConfig, McIntegrator, McMove, MoveSet, run_trial},
    md::{MdConfig, MdIntegrator, StepAlgorithm},
    potential::{IdealGas, LennardJones, PotentialForce},
    rigid::{RigidMolecule, RigidOrientation, RigidState},
    shake::{BondConstraint, ConstraintState},
    snapshot::SnapshotHandler,
    state::{Particle, SimState},
    thermostat::Thermostat,
    listener::{StepContext, StepListener},
};

/// A small bound Lennard-Jones cluster: 8 particles on a cube near the pair minimum,
/// with low thermal velocities so it stays bound and inside the cutoff.
fn lj_cluster(seed: u64) -> SimState {
    let spacing = 1.12;
    let mut particles = Vec::new();
    for ix in 0..2 {
        for iy in 0..2 {
            for iz in 0..2 {
                particles.push(Particle::new(
                    Vec3::new(
                        ix as f64 * spacing,
                        iy as f64 * spacing,
                        iz as f64 * spacing,
                    ),
                    1.,
                ));
            }
        }
    }

    let mut state = SimState::new(particles, SimBox::new_cube(24.), seed);
    state.assign_velocities(0.05, true);
    state
}

fn lj_wide() -> LennardJones {
    LennardJones {
        sigma: 1.,
        epsilon: 1.,
        cutoff: 8.,
    }
}

fn nve_config(dt: f64) -> MdConfig {
    MdConfig {
        dt,
        isothermal: false,
        com_removal_ratio_linear: None,
        com_removal_ratio_angular: None,
        ..Default::default()
    }
}

/// Max |E(t) − E(0)| over a fixed simulated time, at the given step size.
fn energy_drift(algo_for: impl Fn() -> StepAlgorithm, dt: f64, total_time: f64) -> f64 {
    let mut md = MdIntegrator::new(lj_cluster(42), nve_config(dt), algo_for());
    let mut pot = lj_wide();
    md.reset(&mut pot).unwrap();

    let e0 = md.total_energy();
    let steps = (total_time / dt).round() as usize;
    let mut max_dev: f64 = 0.;
    for _ in 0..steps {
        md.do_step(&mut pot);
        max_dev = max_dev.max((md.total_energy() - e0).abs());
    }
    max_dev
}

#[test]
fn verlet_nve_energy_error_shrinks_quadratically() {
    let err = energy_drift(|| StepAlgorithm::VelocityVerlet, 0.01, 1.0);
    let err_half = energy_drift(|| StepAlgorithm::VelocityVerlet, 0.005, 1.0);

    assert!(err < 1e-2, "energy drift too large: {err}");
    // O(h²): halving h should quarter the error; allow generous slack.
    assert!(
        err_half < 0.6 * err,
        "expected quadratic shrink, got {err} → {err_half}"
    );
}

#[test]
fn gear4_nve_energy_error_shrinks() {
    let err = energy_drift(|| StepAlgorithm::Gear4(crate::gear::GearState::new()), 0.02, 1.0);
    let err_half = energy_drift(|| StepAlgorithm::Gear4(crate::gear::GearState::new()), 0.01, 1.0);

    assert!(err < 5e-2, "energy drift too large: {err}");
    assert!(
        err_half < 0.7 * err,
        "expected at least quadratic shrink, got {err} → {err_half}"
    );
}

#[test]
fn zero_friction_langevin_matches_verlet() {
    let mut verlet = MdIntegrator::new(lj_cluster(7), nve_config(0.005), StepAlgorithm::VelocityVerlet);
    let mut langevin = MdIntegrator::new(
        lj_cluster(7),
        nve_config(0.005),
        StepAlgorithm::Langevin { gamma: 0. },
    );

    let mut pot = lj_wide();
    verlet.reset(&mut pot).unwrap();
    langevin.reset(&mut pot).unwrap();

    for _ in 0..50 {
        verlet.do_step(&mut pot);
        langevin.do_step(&mut pot);
    }

    for (a, b) in verlet
        .state
        .particles
        .iter()
        .zip(langevin.state.particles.iter())
    {
        assert!(
            (a.posit - b.posit).magnitude() < 1e-12,
            "trajectories diverged: {:?} vs {:?}",
            a.posit,
            b.posit
        );
        assert!((a.vel - b.vel).magnitude() < 1e-12);
    }
}

fn ideal_gas_state(n: usize, seed: u64) -> SimState {
    let particles = (0..n)
        .map(|i| {
            Particle::new(
                Vec3::new(
                    (i % 10) as f64 * 1.9 - 9.,
                    ((i / 10) % 10) as f64 * 1.9 - 9.,
                    (i / 100) as f64 * 1.9 - 9.,
                ),
                1.,
            )
        })
        .collect();
    let mut state = SimState::new(particles, SimBox::new_cube(20.), seed);
    state.assign_velocities(1.0, false);
    state
}

#[test]
fn andersen_scaling_drives_temperature_to_target() {
    let cfg = MdConfig {
        dt: 0.005,
        temp_target: 1.5,
        isothermal: true,
        thermostat: Thermostat::AndersenScaling,
        thermostat_interval: 1,
        com_removal_ratio_linear: None,
        com_removal_ratio_angular: None,
        ..Default::default()
    };

    let mut md = MdIntegrator::new(ideal_gas_state(100, 3), cfg, StepAlgorithm::VelocityVerlet);
    let mut pot = IdealGas;
    md.reset(&mut pot).unwrap();

    let mut sum = 0.;
    let samples = 400;
    for _ in 0..samples {
        md.do_step(&mut pot);
        sum += md.state.temperature();
    }
    let mean = sum / samples as f64;

    // Zero-drift scaling spends 3 degrees of freedom: expect (N−1)/N of target.
    assert!(
        (mean - 1.5).abs() < 0.1,
        "mean temperature {mean}, target 1.5"
    );
}

#[test]
fn velocity_scaling_hits_target_exactly_per_dimension() {
    let cfg = MdConfig {
        dt: 0.005,
        temp_target: 2.0,
        isothermal: true,
        thermostat: Thermostat::VelocityScaling,
        thermostat_interval: 5,
        com_removal_ratio_linear: None,
        com_removal_ratio_angular: None,
        ..Default::default()
    };

    let mut md = MdIntegrator::new(ideal_gas_state(60, 4), cfg, StepAlgorithm::VelocityVerlet);
    let mut pot = IdealGas;
    md.reset(&mut pot).unwrap();

    for _ in 0..5 {
        md.do_step(&mut pot);
    }

    // Free flight between firings: the temperature set at the firing persists.
    assert_relative_eq!(md.state.temperature(), 2.0, epsilon = 1e-9);
}

// ---------------------------------------------------------------------------
// Monte Carlo acceptance
// ---------------------------------------------------------------------------

/// Trial move with a fixed Metropolis ratio; proposes always, does nothing.
struct FixedChiMove {
    chi: f64,
}

impl McMove for FixedChiMove {
    fn name(&self) -> &'static str {
        "fixed-chi"
    }
    fn attempt(&mut self, _state: &mut SimState, _pot: &mut dyn PotentialForce) -> bool {
        true
    }
    fn chi(&mut self, _temperature: f64) -> f64 {
        self.chi
    }
    fn accept(&mut self, _state: &mut SimState) {}
    fn reject(&mut self, _state: &mut SimState) {}
    fn energy_change(&self) -> f64 {
        0.
    }
}

fn acceptance_frequency(chi: f64, trials: usize) -> f64 {
    let mut state = ideal_gas_state(1, 99);
    let mut pot = IdealGas;
    let mut moves = MoveSet::new();
    moves.add(Box::new(FixedChiMove { chi }), 1.);

    let mut pe = 0.;
    let mut accepted = 0usize;
    for _ in 0..trials {
        if run_trial(&mut moves, &mut state, &mut pot, 1.0, &mut pe, &mut [])
            == crate::mc::TrialOutcome::Accepted
        {
            accepted += 1;
        }
    }
    accepted as f64 / trials as f64
}

#[test]
fn chi_one_always_accepts_chi_zero_always_rejects() {
    assert_eq!(acceptance_frequency(1.0, 500), 1.0);
    assert_eq!(acceptance_frequency(0.0, 500), 0.0);
    // chi > 1 also always accepts.
    assert_eq!(acceptance_frequency(3.0, 500), 1.0);
}

#[test]
fn fractional_chi_converges_to_chi() {
    let freq = acceptance_frequency(0.35, 20_000);
    assert!(
        (freq - 0.35).abs() < 0.02,
        "long-run acceptance {freq}, expected 0.35"
    );
}

#[test]
fn displacement_in_ideal_gas_always_accepts() {
    let mut mc = McIntegrator::new(ideal_gas_state(20, 5), McConfig::default());
    mc.moves.add(Box::new(crate::mc::DisplaceParticle::new(0.3)), 1.);

    let mut pot = IdealGas;
    mc.reset(&mut pot).unwrap();
    for _ in 0..200 {
        mc.do_step(&mut pot);
    }

    let entry = &mc.moves.entries[0];
    assert_eq!(entry.attempts, 200);
    assert_eq!(entry.accepted, 200);
}

#[test]
fn empty_box_displacement_refuses() {
    let mut mc = McIntegrator::new(
        SimState::new(Vec::new(), SimBox::new_cube(10.), 1),
        McConfig::default(),
    );
    mc.moves.add(Box::new(crate::mc::DisplaceParticle::new(0.3)), 1.);

    let mut pot = IdealGas;
    mc.reset(&mut pot).unwrap();
    mc.do_step(&mut pot);

    // A refusal consumes no attempt.
    assert_eq!(mc.moves.entries[0].attempts, 0);
}

// ---------------------------------------------------------------------------
// Constraints
// ---------------------------------------------------------------------------

#[test]
fn rattle_keeps_bond_lengths_under_forces() {
    // A constrained trimer chain, with LJ repulsion acting across it.
    let mut particles = vec![
        Particle::new(Vec3::new(0., 0., 0.), 1.),
        Particle::new(Vec3::new(1., 0., 0.), 1.),
        Particle::new(Vec3::new(2., 0., 0.), 1.),
    ];
    particles[0].vel = Vec3::new(0., 0.2, 0.);
    particles[2].vel = Vec3::new(0., -0.2, 0.);

    let state = SimState::new(particles, SimBox::new_cube(20.), 8);
    let bonds = vec![
        BondConstraint {
            a: 0,
            b: 1,
            length: 1.,
        },
        BondConstraint {
            a: 1,
            b: 2,
            length: 1.,
        },
    ];

    let cfg = MdConfig {
        dt: 0.002,
        com_removal_ratio_linear: None,
        com_removal_ratio_angular: None,
        ..Default::default()
    };
    let mut md = MdIntegrator::new(state, cfg, StepAlgorithm::Rattle(ConstraintState::new(bonds)));
    let mut pot = lj_wide();
    md.reset(&mut pot).unwrap();

    for _ in 0..200 {
        md.do_step(&mut pot);
    }

    for (a, b) in [(0usize, 1usize), (1, 2)] {
        let r = (md.state.particles[a].posit - md.state.particles[b].posit).magnitude();
        assert!((r - 1.).abs() < 1e-4, "bond ({a},{b}) length {r}");
    }

    // RATTLE also zeroes the bond-direction relative velocity.
    let dr = md.state.particles[0].posit - md.state.particles[1].posit;
    let dv = md.state.particles[0].vel - md.state.particles[1].vel;
    assert!(dr.dot(dv).abs() < 1e-8);
}

// ---------------------------------------------------------------------------
// Rigid bodies
// ---------------------------------------------------------------------------

#[test]
fn torque_free_rigid_dimer_keeps_shape_and_momentum() {
    let mut particles = vec![
        Particle::new(Vec3::new(-0.5, 0., 0.), 1.),
        Particle::new(Vec3::new(0.5, 0., 0.), 1.),
    ];
    particles[0].vel = Vec3::new(0.1, 0.3, 0.);
    particles[1].vel = Vec3::new(0.1, -0.3, 0.);

    let state = SimState::new(particles, SimBox::new_cube(50.), 9);

    let mol = RigidMolecule {
        atoms: vec![0, 1],
        body_coords: vec![Vec3::new(-0.5, 0., 0.), Vec3::new(0.5, 0., 0.)],
        orientation: Some(RigidOrientation {
            axes: [
                Vec3::new(1., 0., 0.),
                Vec3::new(0., 1., 0.),
                Vec3::new(0., 0., 1.),
            ],
            // Dumbbell: negligible moment about its own axis, ½ m d² about the rest.
            inertia_body: Vec3::new(1e-9, 0.5, 0.5),
            ang_mom: Vec3::new(0., 0., 0.3),
        }),
    };

    let cfg = MdConfig {
        dt: 0.002,
        com_removal_ratio_linear: None,
        com_removal_ratio_angular: None,
        ..Default::default()
    };
    let mut md = MdIntegrator::new(state, cfg, StepAlgorithm::Rigid(RigidState::new(vec![mol])));
    let mut pot = IdealGas;
    md.reset(&mut pot).unwrap();

    for _ in 0..500 {
        md.do_step(&mut pot);
    }

    // Shape preserved.
    let r = (md.state.particles[0].posit - md.state.particles[1].posit).magnitude();
    assert_relative_eq!(r, 1.0, epsilon = 1e-9);

    // COM drifted linearly with the (torque-free) initial momentum.
    let com = (md.state.particles[0].posit + md.state.particles[1].posit) * 0.5;
    let expected = Vec3::new(0.1, 0., 0.) * (500. * 0.002);
    assert!((com - expected).magnitude() < 1e-6, "com {com:?}");

    if let StepAlgorithm::Rigid(rigid) = &md.algo {
        let orient = rigid.molecules[0].orientation.as_ref().unwrap();
        assert!((orient.ang_mom - Vec3::new(0., 0., 0.3)).magnitude() < 1e-9);
    } else {
        unreachable!();
    }
}

// ---------------------------------------------------------------------------
// Brownian
// ---------------------------------------------------------------------------

#[test]
fn brownian_diffuses_at_temperature() {
    let cfg = MdConfig {
        dt: 0.01,
        temp_target: 1.,
        com_removal_ratio_linear: None,
        com_removal_ratio_angular: None,
        ..Default::default()
    };
    let mut md = MdIntegrator::new(
        ideal_gas_state(50, 12),
        cfg,
        StepAlgorithm::Brownian {
            scheme: BrownianScheme::EulerMaruyama,
        },
    );
    let mut pot = IdealGas;
    md.reset(&mut pot).unwrap();

    let start: Vec<Vec3> = md.state.particles.iter().map(|p| p.posit).collect();
    for _ in 0..100 {
        md.do_step(&mut pot);
    }

    // ⟨Δr²⟩ = 6 T t / m (γ folded into the time unit). t = 1 → expect ≈ 6.
    let mut msd = 0.;
    for (p, r0) in md.state.particles.iter().zip(&start) {
        msd += md.state.cell.min_image(p.posit - *r0).magnitude_squared();
    }
    msd /= md.state.particles.len() as f64;
    assert!(msd > 2.0 && msd < 12.0, "msd {msd}");
}

// ---------------------------------------------------------------------------
// Hybrid MC thermostat
// ---------------------------------------------------------------------------

#[test]
fn hybrid_mc_counts_segment_trials() {
    let cfg = MdConfig {
        dt: 0.005,
        temp_target: 1.,
        isothermal: true,
        thermostat: Thermostat::HybridMc { mc_trials: 0 },
        thermostat_interval: 10,
        com_removal_ratio_linear: None,
        com_removal_ratio_angular: None,
        ..Default::default()
    };

    let mut md = MdIntegrator::new(lj_cluster(21), cfg, StepAlgorithm::VelocityVerlet);
    let mut pot = lj_wide();
    md.reset(&mut pot).unwrap();

    for _ in 0..100 {
        md.do_step(&mut pot);
    }

    // 10 firings: the first initializes the reference, the rest decide.
    let decided = md.thermo.accepted + md.thermo.rejected;
    assert_eq!(decided, 9);

    md.reset_hybrid_statistics();
    assert_eq!(md.thermo.accepted + md.thermo.rejected, 0);
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FireRecorder {
    fired_at: Rc<RefCell<Vec<u64>>>,
}

impl StepListener for FireRecorder {
    fn step_finished(&mut self, _state: &mut SimState, ctx: StepContext) {
        self.fired_at.borrow_mut().push(ctx.step_count);
    }
}

#[test]
fn checkpoint_restore_reproduces_listener_schedule() {
    let make = |seed| {
        let mut md = MdIntegrator::new(
            ideal_gas_state(5, seed),
            nve_config(0.005),
            StepAlgorithm::VelocityVerlet,
        );
        md.core.set_event_interval(3);
        md
    };

    let mut pot = IdealGas;

    // Uninterrupted run.
    let mut a = make(1);
    let a_fires = Rc::new(RefCell::new(Vec::new()));
    a.step_listeners.push(Box::new(FireRecorder {
        fired_at: Rc::clone(&a_fires),
    }));
    a.reset(&mut pot).unwrap();
    for _ in 0..20 {
        a.do_step(&mut pot);
    }

    // Interrupted at step 7, checkpointed, restored into a fresh integrator.
    let mut b1 = make(1);
    b1.reset(&mut pot).unwrap();
    for _ in 0..7 {
        b1.do_step(&mut pot);
    }
    let mut checkpoint: Vec<u8> = Vec::new();
    b1.core.write_checkpoint(&mut checkpoint).unwrap();

    let mut b2 = make(1);
    let b_fires = Rc::new(RefCell::new(Vec::new()));
    b2.step_listeners.push(Box::new(FireRecorder {
        fired_at: Rc::clone(&b_fires),
    }));
    b2.core
        .read_checkpoint(&mut io::BufReader::new(&checkpoint[..]))
        .unwrap();
    b2.post_restore(&mut pot).unwrap();
    for _ in 0..13 {
        b2.do_step(&mut pot);
    }

    let a_after_7: Vec<u64> = a_fires.borrow().iter().copied().filter(|&s| s > 7).collect();
    assert_eq!(*b_fires.borrow(), a_after_7);
}

// ---------------------------------------------------------------------------
// Managers
// ---------------------------------------------------------------------------

fn mc_box(temp: f64, seed: u64) -> ManagedBox {
    let mut mc = McIntegrator::new(
        ideal_gas_state(10, seed),
        McConfig {
            temperature: temp,
            ..Default::default()
        },
    );
    mc.moves.add(Box::new(crate::mc::DisplaceParticle::new(0.2)), 1.);
    ManagedBox::Mc {
        integrator: mc,
        potential: Box::new(IdealGas),
    }
}

#[test]
fn manager_steps_all_boxes_and_swaps() {
    let cfg = ManagerConfig {
        temperature: 1.,
        global_move_interval: 2., // exchange roughly every other step
        seed: 6,
        ..Default::default()
    };
    let mut manager = IntegratorManager::new(cfg, vec![mc_box(1.0, 1), mc_box(2.0, 2)]);
    manager
        .exchange_moves
        .add(Box::new(SwapConfigurations::new(0, 1)), 1.);

    manager.reset().unwrap();
    for _ in 0..100 {
        manager.do_step();
    }

    let entry = &manager.exchange_moves.entries[0];
    // Ideal gas: both energies are 0, chi = 1, every trialed swap accepts.
    assert!(entry.attempts > 10, "attempts {}", entry.attempts);
    assert_eq!(entry.attempts, entry.accepted);

    // Steps that weren't exchanges stepped both sub-integrators.
    let sub_steps = match &manager.boxes[0] {
        ManagedBox::Mc { integrator, .. } => integrator.core.step_count,
        _ => unreachable!(),
    };
    assert_eq!(sub_steps + entry.attempts, 100);
}

#[test]
fn manager_reset_collects_first_overlap_but_resets_all() {
    // Box 1 has two coincident particles: LJ reports infinite energy.
    let good = {
        let mut mc = McIntegrator::new(ideal_gas_state(4, 3), McConfig::default());
        mc.moves.add(Box::new(crate::mc::DisplaceParticle::new(0.2)), 1.);
        ManagedBox::Mc {
            integrator: mc,
            potential: Box::new(lj_wide()),
        }
    };
    let bad = {
        let particles = vec![
            Particle::new(Vec3::new(0., 0., 0.), 1.),
            Particle::new(Vec3::new(0., 0., 0.), 1.),
        ];
        let mc = McIntegrator::new(
            SimState::new(particles, SimBox::new_cube(10.), 4),
            McConfig::default(),
        );
        ManagedBox::Mc {
            integrator: mc,
            potential: Box::new(lj_wide()),
        }
    };

    let mut manager = IntegratorManager::new(ManagerConfig::default(), vec![good, bad]);
    assert!(manager.reset().is_err());

    // The healthy box still completed its reset.
    match &manager.boxes[0] {
        ManagedBox::Mc { integrator, .. } => assert!(integrator.core.is_initialized()),
        _ => unreachable!(),
    }
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

#[test]
fn snapshots_record_on_ratio() {
    let cfg = MdConfig {
        dt: 0.005,
        snapshot_handlers: vec![SnapshotHandler { ratio: 5 }],
        com_removal_ratio_linear: None,
        com_removal_ratio_angular: None,
        ..Default::default()
    };
    let mut md = MdIntegrator::new(ideal_gas_state(6, 17), cfg, StepAlgorithm::VelocityVerlet);
    let mut pot = IdealGas;
    md.reset(&mut pot).unwrap();

    for _ in 0..20 {
        md.do_step(&mut pot);
    }

    assert_eq!(md.snapshots.len(), 4);
    assert!(md.snapshots[0].posits.len() == 6);
    assert!((md.snapshots[3].time - 0.1).abs() < 1e-12);
}
