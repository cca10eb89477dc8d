//! The event-driven hard-potential integrator: per-particle next-collision
//! prediction over a finite look-ahead horizon, a binned event queue, exact
//! collision execution ("bumps") with cascading invalidation, and free-flight
//! advancement between the fixed-size steps.
//!
//! Particle positions always correspond to the start of the current step. Collision
//! predictions made mid-step pass the elapsed "false time" so the pair is projected
//! forward before solving; executing a bump advances the two particles to the
//! collision instant, applies the impulse, then rewinds them along their *new*
//! velocities, restoring the step-start epoch. The end-of-step free flight then
//! lands every particle exactly where the event sequence says it should be.
//!
//! Each particle owns the prediction for pairs in which it has the lower index
//! ("up" collisions). Perturbing a particle therefore invalidates its own up
//! prediction and, via a reverse scan over down-neighbors, any lower-indexed
//! particle whose scheduled event referenced it.

use std::collections::HashMap;

use lin_alg::f64::Vec3;

use crate::{
    Diagnostics, OverlapError,
    event_queue::EventQueue,
    integrator::StepperCore,
    listener::{
        CollisionListener, StepContext, StepListener, fire_initialized, fire_step_finished,
        fire_step_started,
    },
    neighbors::NeighborTable,
    potential::{BumpResult, FieldHardPotential, HardPotential},
    snapshot::{Snapshot, SnapshotHandler, snapshot_due},
    state::SimState,
    thermostat::{Thermostat, ThermostatAction, ThermostatState, apply_simple_thermostat},
};

/// The hard potentials governing one box: the general pair potential, an optional
/// separate potential for bonded pairs, and an optional one-body field (walls).
pub struct HardPotentials {
    pub pair: Box<dyn HardPotential>,
    pub bonded: Option<Box<dyn HardPotential>>,
    pub field: Option<Box<dyn FieldHardPotential>>,
}

impl HardPotentials {
    pub fn pair_only(pair: Box<dyn HardPotential>) -> Self {
        Self {
            pair,
            bonded: None,
            field: None,
        }
    }

    fn max_range(&self) -> f64 {
        let mut range = self.pair.range();
        if let Some(b) = &self.bonded {
            range = range.max(b.range());
        }
        range
    }
}

/// What a particle's next scheduled event is against.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Partner {
    /// A real particle (always a higher index: the lower index owns the pair).
    Atom(usize),
    /// A one-body field/wall collision.
    Field,
    /// No real collision before the horizon: a synthetic re-evaluation point.
    Horizon,
}

/// One particle's scheduled next event.
#[derive(Clone, Copy, Debug)]
struct CollisionEvent {
    /// Relative to the horizon start.
    time: f64,
    partner: Partner,
    /// Discrete pair state the prediction was made under.
    state: i32,
    /// Pair displacement at the prediction epoch.
    dr: Vec3,
}

impl CollisionEvent {
    fn none() -> Self {
        Self {
            time: f64::INFINITY,
            partner: Partner::Horizon,
            state: 0,
            dr: Vec3::new_zero(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct HardConfig {
    /// Fixed step size; events inside each step window execute exactly.
    pub dt: f64,
    pub temp_target: f64,
    pub isothermal: bool,
    pub thermostat: Thermostat,
    pub thermostat_interval: u32,
    pub zero_net_drift: bool,
    /// Steps per collision horizon (t_max = horizon_steps × dt).
    pub horizon_steps: u32,
    /// Grow the horizon when realized events per window fall far below expectation.
    pub adaptive_horizon: bool,
    /// Null-collision traversal fraction. Empirically tuned policy default; not a
    /// physical constant.
    pub null_collision_factor: f64,
    /// Initial bucket count for the event queue.
    pub n_buckets: usize,
    /// Bucket occupancy beyond which the queue rebalances.
    pub bucket_occupancy_limit: u32,
    pub neighbor_skin: f64,
    pub snapshot_handlers: Vec<SnapshotHandler>,
    pub diagnostics: Diagnostics,
}

impl Default for HardConfig {
    fn default() -> Self {
        Self {
            dt: 0.05,
            temp_target: 1.,
            isothermal: false,
            thermostat: Default::default(),
            thermostat_interval: 100,
            zero_net_drift: true,
            horizon_steps: 20,
            adaptive_horizon: true,
            null_collision_factor: 0.25,
            n_buckets: 64,
            bucket_occupancy_limit: 16,
            neighbor_skin: 1.0,
            snapshot_handlers: Vec::new(),
            diagnostics: Default::default(),
        }
    }
}

/// Event-driven integrator for hard potentials.
pub struct HardIntegrator {
    pub core: StepperCore,
    pub cfg: HardConfig,
    pub state: SimState,
    pub neighbors: NeighborTable,
    events: Vec<CollisionEvent>,
    queue: EventQueue,
    /// Discrete states of non-bonded pairs currently away from their default branch,
    /// keyed by (low, high) index.
    pair_states: HashMap<(usize, usize), i32>,
    /// Bonded topology: per-particle (partner, discrete state). Bonds don't change
    /// with the spatial neighbor list.
    bond_table: Vec<Vec<(usize, i32)>>,
    /// Steps consumed of the current horizon.
    steps_into_horizon: u32,
    collisions_this_horizon: u64,
    pub collision_count: u64,
    /// Σ J·dr over executed bumps; feeds pressure measurement.
    pub collision_virial_sum: f64,
    pub potential_energy: f64,
    pub kinetic_energy: f64,
    pub(crate) thermo: ThermostatState,
    pub(crate) time: f64,
    pub snapshots: Vec<Snapshot>,
    pub step_listeners: Vec<Box<dyn StepListener>>,
    pub collision_listeners: Vec<Box<dyn CollisionListener>>,
}

impl HardIntegrator {
    /// `interaction_range` should be the largest `range()` of the governing
    /// potentials; it sets the neighbor cutoff.
    pub fn new(state: SimState, cfg: HardConfig, interaction_range: f64) -> Self {
        let n = state.particles.len();
        let horizon = (cfg.horizon_steps as f64 * cfg.dt).max(cfg.dt);
        let queue = EventQueue::new(n, cfg.n_buckets, horizon, cfg.bucket_occupancy_limit);
        let neighbors = NeighborTable::new(interaction_range, cfg.neighbor_skin);
        let thermo = ThermostatState::new(cfg.thermostat_interval);

        Self {
            core: StepperCore::new(),
            cfg,
            state,
            neighbors,
            events: vec![CollisionEvent::none(); n],
            queue,
            pair_states: HashMap::new(),
            bond_table: vec![Vec::new(); n],
            steps_into_horizon: 0,
            collisions_this_horizon: 0,
            collision_count: 0,
            collision_virial_sum: 0.,
            potential_energy: 0.,
            kinetic_energy: 0.,
            thermo,
            time: 0.,
            snapshots: Vec::new(),
            step_listeners: Vec::new(),
            collision_listeners: Vec::new(),
        }
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    fn ctx(&self) -> StepContext {
        StepContext {
            step_count: self.core.step_count,
            time: self.time,
        }
    }

    /// Register a bonded pair with its initial discrete state. Bonded pairs are
    /// governed by the bonded potential and tracked independently of the spatial
    /// neighbor lists.
    pub fn add_bond(&mut self, a: usize, b: usize, state: i32) {
        assert!(a != b);
        self.bond_table[a].push((b, state));
        self.bond_table[b].push((a, state));
    }

    fn bond_state(&self, a: usize, b: usize) -> Option<i32> {
        self.bond_table[a]
            .iter()
            .find(|(j, _)| *j == b)
            .map(|(_, s)| *s)
    }

    fn set_bond_state(&mut self, a: usize, b: usize, state: i32) {
        for entry in &mut self.bond_table[a] {
            if entry.0 == b {
                entry.1 = state;
            }
        }
        for entry in &mut self.bond_table[b] {
            if entry.0 == a {
                entry.1 = state;
            }
        }
    }

    fn pair_state(&self, i: usize, j: usize) -> i32 {
        let key = (i.min(j), i.max(j));
        self.pair_states.get(&key).copied().unwrap_or(0)
    }

    fn set_pair_state(&mut self, i: usize, j: usize, state: i32) {
        let key = (i.min(j), i.max(j));
        if state == 0 {
            self.pair_states.remove(&key);
        } else {
            self.pair_states.insert(key, state);
        }
    }

    fn window_start(&self) -> f64 {
        self.steps_into_horizon as f64 * self.cfg.dt
    }

    fn horizon(&self) -> f64 {
        self.cfg.horizon_steps as f64 * self.cfg.dt
    }

    /// Diagnostic dump for a corrupt prediction, then the fatal throw. A negative
    /// collision time means logic/state corruption, never a physical condition.
    fn fatal_negative_time(&self, i: usize, partner: Partner, t: f64, false_time: f64) -> ! {
        let p = &self.state.particles[i];
        eprintln!(
            "Negative collision time: particle {i}, partner {partner:?}, t = {t}, false_time = {false_time}"
        );
        eprintln!("  posit {:?}, vel {:?}", p.posit, p.vel);
        eprintln!(
            "  scheduled event: dr {:?}, state {}",
            self.events[i].dr, self.events[i].state
        );
        if let Partner::Atom(j) = partner {
            let q = &self.state.particles[j];
            eprintln!("  partner posit {:?}, vel {:?}", q.posit, q.vel);
        }
        panic!("negative collision time; collision state is corrupt");
    }

    /// Predict particle `i`'s next event: earliest collision against up-neighbors
    /// (and bonded partners with higher index), then the field. If nothing real
    /// lands before the horizon, a synthetic null collision forces periodic
    /// re-evaluation so fast-moving or low-density particles are not missed.
    fn schedule_up(&mut self, i: usize, false_time: f64, pots: &HardPotentials) {
        let mut best = CollisionEvent::none();

        let pi_posit = self.state.particles[i].posit;
        let pi_vel = self.state.particles[i].vel;

        for &j in &self.neighbors.up[i] {
            if self.bond_state(i, j).is_some() {
                continue; // governed by the bonded potential below
            }

            let state = self.pair_state(i, j);
            let dr = self
                .state
                .cell
                .min_image(pi_posit - self.state.particles[j].posit);
            let dv = pi_vel - self.state.particles[j].vel;

            let t = pots.pair.collision_time(dr, dv, state, false_time);
            if t < best.time {
                best = CollisionEvent {
                    time: t,
                    partner: Partner::Atom(j),
                    state,
                    dr,
                };
            }
        }

        if let Some(bonded) = &pots.bonded {
            for &(j, state) in &self.bond_table[i] {
                if j < i {
                    continue; // owned by the lower index
                }
                let dr = self
                    .state
                    .cell
                    .min_image(pi_posit - self.state.particles[j].posit);
                let dv = pi_vel - self.state.particles[j].vel;

                let t = bonded.collision_time(dr, dv, state, false_time);
                if t < best.time {
                    best = CollisionEvent {
                        time: t,
                        partner: Partner::Atom(j),
                        state,
                        dr,
                    };
                }
            }
        }

        if let Some(field) = &pots.field {
            let t = field.collision_time(&self.state.particles[i], &self.state.cell, false_time);
            if t < best.time {
                best = CollisionEvent {
                    time: t,
                    partner: Partner::Field,
                    state: 0,
                    dr: Vec3::new_zero(),
                };
            }
        }

        if best.time.is_finite() && best.time < false_time - 1e-9 {
            self.fatal_negative_time(i, best.partner, best.time, false_time);
        }

        let window = self.window_start();
        let horizon_remaining = self.horizon() - window;

        if best.time >= horizon_remaining {
            // Null collision: a fraction of the free traversal across the box. Not a
            // real event; on execution the particle is simply re-examined.
            let speed = pi_vel.magnitude();
            let traversal = (self.state.cell.min_extent() - pots.max_range()).max(
                0.1 * self.state.cell.min_extent(),
            );
            let t_null = if speed > 1e-12 {
                false_time + self.cfg.null_collision_factor * traversal / speed
            } else {
                horizon_remaining
            };

            best = CollisionEvent {
                time: t_null.min(horizon_remaining),
                partner: Partner::Horizon,
                state: 0,
                dr: Vec3::new_zero(),
            };
        }

        self.events[i] = best;
        self.queue.insert(i, window + best.time);
    }

    /// Backward half of the invalidation: lower-indexed particles whose scheduled
    /// event referenced `i` must re-predict, and ones that didn't may now collide
    /// with `i` earlier than their scheduled event.
    fn rescan_down(&mut self, i: usize, false_time: f64, pots: &HardPotentials) {
        let window = self.window_start();

        // Collect candidates first: down-neighbors plus bonded partners below i.
        let mut candidates: Vec<usize> = self.neighbors.down[i].clone();
        for &(j, _) in &self.bond_table[i] {
            if j < i && !candidates.contains(&j) {
                candidates.push(j);
            }
        }

        for k in candidates {
            if self.events[k].partner == Partner::Atom(i) {
                self.schedule_up(k, false_time, pots);
                continue;
            }

            let bonded_state = self.bond_state(k, i);
            let (pot, state): (&dyn HardPotential, i32) = match (&pots.bonded, bonded_state) {
                (Some(b), Some(s)) => (b.as_ref(), s),
                _ => (pots.pair.as_ref(), self.pair_state(k, i)),
            };

            let dr = self
                .state
                .cell
                .min_image(self.state.particles[k].posit - self.state.particles[i].posit);
            let dv = self.state.particles[k].vel - self.state.particles[i].vel;
            let t = pot.collision_time(dr, dv, state, false_time);

            if t.is_finite() && t < false_time - 1e-9 {
                self.fatal_negative_time(k, Partner::Atom(i), t, false_time);
            }

            if window + t < self.queue.scheduled_time(k) {
                self.events[k] = CollisionEvent {
                    time: t,
                    partner: Partner::Atom(i),
                    state,
                    dr,
                };
                self.queue.insert(k, window + t);
            }
        }
    }

    fn invalidate_particle(&mut self, i: usize, false_time: f64, pots: &HardPotentials) {
        self.schedule_up(i, false_time, pots);
        self.rescan_down(i, false_time, pots);
    }

    /// Full recomputation: a new horizon, every particle re-predicted from scratch.
    pub(crate) fn compute_all_collisions(&mut self, pots: &HardPotentials) {
        let n = self.state.particles.len();
        self.steps_into_horizon = 0;
        self.collisions_this_horizon = 0;
        self.events.resize(n, CollisionEvent::none());
        self.queue.reset(n, self.horizon());

        for i in 0..n {
            self.schedule_up(i, 0., pots);
        }
    }

    /// Execute one pair bump at `tc` after the step start: advance the pair to the
    /// collision instant, apply the impulse and state transition, rewind along the
    /// new velocities.
    fn execute_pair_bump(&mut self, i: usize, j: usize, tc: f64, pots: &HardPotentials) {
        let bonded_state = self.bond_state(i, j);
        let state_old = self.events[i].state;

        let cell = self.state.cell;
        let (a, b) = crate::split2_mut(&mut self.state.particles, i, j);

        a.posit += a.vel * tc;
        b.posit += b.vel * tc;
        let dr = cell.min_image(a.posit - b.posit);

        let mut out = BumpResult::default();
        let new_state = match (&pots.bonded, bonded_state) {
            (Some(bonded), Some(_)) => bonded.bump(a, b, dr, state_old, &mut out),
            _ => pots.pair.bump(a, b, dr, state_old, &mut out),
        };

        a.posit -= a.vel * tc;
        b.posit -= b.vel * tc;

        if bonded_state.is_some() {
            self.set_bond_state(i, j, new_state);
        } else {
            self.set_pair_state(i, j, new_state);
        }

        self.potential_energy += out.energy_change;
        self.collision_virial_sum += out.virial;
        self.collision_count += 1;
        self.collisions_this_horizon += 1;

        for l in &mut self.collision_listeners {
            l.collision(i, Some(j), out.virial, out.energy_change);
        }
    }

    fn execute_field_bump(&mut self, i: usize, tc: f64, pots: &HardPotentials) {
        let Some(field) = &pots.field else {
            panic!("field collision scheduled without a field potential");
        };

        let cell = self.state.cell;
        let p = &mut self.state.particles[i];
        p.posit += p.vel * tc;

        let mut out = BumpResult::default();
        field.bump(p, &cell, &mut out);

        p.posit -= p.vel * tc;

        self.potential_energy += out.energy_change;
        self.collision_virial_sum += out.virial;
        self.collision_count += 1;
        self.collisions_this_horizon += 1;

        for l in &mut self.collision_listeners {
            l.collision(i, None, out.virial, out.energy_change);
        }
    }

    /// One fixed-size step: execute every scheduled event inside the step window in
    /// time order, then free-flight-advance all positions by dt (the events already
    /// captured every interaction), then thermostat and horizon bookkeeping.
    pub fn do_step(&mut self, pots: &HardPotentials) {
        assert!(
            self.core.is_initialized(),
            "HardIntegrator::reset must run before stepping"
        );

        let at_interval = self.core.begin_step();
        let ctx = self.ctx();
        if at_interval {
            fire_step_started(&mut self.step_listeners, &mut self.state, ctx);
        }

        let dt = self.cfg.dt;
        let window_start = self.window_start();
        let window_end = window_start + dt;

        while let Some((i, t)) = self.queue.peek_min() {
            if t >= window_end {
                break;
            }
            let tc = t - window_start;
            if tc < -1e-9 {
                self.fatal_negative_time(i, self.events[i].partner, t, window_start);
            }
            let tc = tc.max(0.);

            self.queue.remove(i);
            match self.events[i].partner {
                Partner::Horizon => {
                    // Synthetic event: just re-examine this particle.
                    self.schedule_up(i, tc, pots);
                }
                Partner::Field => {
                    self.execute_field_bump(i, tc, pots);
                    self.invalidate_particle(i, tc, pots);
                }
                Partner::Atom(j) => {
                    self.execute_pair_bump(i, j, tc, pots);
                    self.invalidate_particle(i, tc, pots);
                    self.invalidate_particle(j, tc, pots);
                }
            }
        }

        // Pure kinematic advance across the step.
        self.state.advance_free_flight(dt);
        self.state.assert_positions_finite("hard step");
        self.time += dt;
        self.steps_into_horizon += 1;

        // Structural changes force recomputation regardless of the horizon countdown.
        self.neighbors.update_max_displacement(&self.state);
        if self.neighbors.rebuild_if_needed(&self.state) {
            self.compute_all_collisions(pots);
        } else if self.steps_into_horizon >= self.cfg.horizon_steps {
            self.maybe_grow_horizon();
            self.compute_all_collisions(pots);
        }

        self.kinetic_energy = self.state.kinetic_energy();

        if self.cfg.isothermal {
            self.thermo.countdown -= 1;
            if self.thermo.countdown == 0 {
                self.thermo.countdown = self.cfg.thermostat_interval;
                self.apply_thermostat(pots);
            }
        }

        if snapshot_due(&self.cfg.snapshot_handlers, self.core.step_count) {
            self.snapshots.push(Snapshot::take(
                &self.state,
                self.time,
                self.kinetic_energy,
                self.potential_energy,
            ));
        }

        if let Some(interval) = self.cfg.diagnostics.print_interval {
            if self.core.step_count.is_multiple_of(interval) {
                println!(
                    "Step {}: T = {:.4}  U = {:.4}  P = {:.4}  collisions = {}",
                    self.core.step_count,
                    self.state.temperature(),
                    self.potential_energy,
                    self.measured_pressure(),
                    self.collision_count,
                );
            }
        }

        if at_interval {
            let ctx = self.ctx();
            fire_step_finished(&mut self.step_listeners, &mut self.state, ctx);
        }
        self.core.end_step(at_interval);
    }

    /// If the horizon produced far fewer events than one per few particles, take
    /// fewer, larger recomputation passes.
    fn maybe_grow_horizon(&mut self) {
        if !self.cfg.adaptive_horizon {
            return;
        }
        let expectation = (self.state.particles.len() as u64 / 4).max(1);
        if self.collisions_this_horizon < expectation {
            self.cfg.horizon_steps = (self.cfg.horizon_steps * 2).min(1024);
        }
    }

    /// Thermostat for the event-driven integrator. Momentum changes invalidate
    /// collision predictions: a single-particle randomization invalidates locally,
    /// anything touching every velocity forces a full recomputation.
    fn apply_thermostat(&mut self, pots: &HardPotentials) {
        let dt_eff = self.cfg.dt * self.cfg.thermostat_interval as f64;
        let action = apply_simple_thermostat(
            &self.cfg.thermostat,
            &mut self.state,
            self.cfg.temp_target,
            dt_eff,
            self.cfg.zero_net_drift,
        );
        self.kinetic_energy = self.state.kinetic_energy();

        match action {
            ThermostatAction::RandomizedOne(i) => {
                let ft = 0.; // between steps; positions are at the epoch
                self.invalidate_particle(i, ft, pots);
            }
            ThermostatAction::ScaledAll | ThermostatAction::RandomizedAll => {
                self.compute_all_collisions(pots);
            }
        }
    }

    /// Sum the pair potential energy and detect hard-core overlap. `report` controls
    /// the diagnostic print: reset-time overlap is reported, trial-state probes stay
    /// quiet.
    fn compute_potential_energy(
        &mut self,
        pots: &HardPotentials,
        report: bool,
    ) -> Result<f64, OverlapError> {
        let mut energy = 0.0;
        let mut overlap: Option<(usize, usize, f64)> = None;

        for i in 0..self.state.particles.len() {
            for &j in &self.neighbors.up[i] {
                if self.bond_state(i, j).is_some() {
                    continue;
                }
                let dr = self
                    .state
                    .cell
                    .min_image(self.state.particles[i].posit - self.state.particles[j].posit);
                let r_sq = dr.magnitude_squared();
                let u = pots.pair.energy(r_sq, self.pair_state(i, j));
                if u.is_infinite() && overlap.is_none() {
                    overlap = Some((i, j, r_sq.sqrt()));
                }
                energy += u;
            }

            for &(j, state) in &self.bond_table[i] {
                if j < i {
                    continue;
                }
                if let Some(bonded) = &pots.bonded {
                    let dr = self
                        .state
                        .cell
                        .min_image(self.state.particles[i].posit - self.state.particles[j].posit);
                    let r_sq = dr.magnitude_squared();
                    let u = bonded.energy(r_sq, state);
                    if u.is_infinite() && overlap.is_none() {
                        overlap = Some((i, j, r_sq.sqrt()));
                    }
                    energy += u;
                }
            }
        }

        if let Some((i, j, r)) = overlap {
            if report {
                eprintln!("Hard-core overlap at reset: pair ({i}, {j}), r = {r:.6}");
                if self.cfg.diagnostics.verbose {
                    eprintln!(
                        "  posits {:?} {:?}",
                        self.state.particles[i].posit, self.state.particles[j].posit
                    );
                }
            }
            return Err(OverlapError::new(
                "configuration overlap: hard cores intersect",
            ));
        }

        Ok(energy)
    }

    /// Rebuild neighbor lists, seed discrete pair states from the geometry, compute
    /// the potential energy (failing on overlap), and schedule every collision.
    pub fn reset(&mut self, pots: &HardPotentials) -> Result<(), OverlapError> {
        self.core.begin_reset();

        // Particle count may have changed (insertion/removal, exchange moves).
        let n = self.state.particles.len();
        self.events.resize(n, CollisionEvent::none());
        self.bond_table.resize(n, Vec::new());

        self.neighbors.rebuild(&self.state);

        // Seed non-default discrete states, e.g. pairs sitting inside a square well.
        self.pair_states.clear();
        for i in 0..self.state.particles.len() {
            for &j in &self.neighbors.up[i] {
                if self.bond_state(i, j).is_some() {
                    continue;
                }
                let dr = self
                    .state
                    .cell
                    .min_image(self.state.particles[i].posit - self.state.particles[j].posit);
                let state = pots.pair.initial_state(dr.magnitude_squared());
                if state != 0 {
                    self.pair_states.insert((i, j), state);
                }
            }
        }

        self.potential_energy = self.compute_potential_energy(pots, true)?;
        self.kinetic_energy = self.state.kinetic_energy();
        self.compute_all_collisions(pots);

        let ctx = self.ctx();
        fire_initialized(&mut self.step_listeners, &mut self.state, ctx);
        Ok(())
    }

    /// Hook after restoring a checkpoint: collision tables are not serialized, so
    /// everything is recomputed from the restored kinematic state.
    pub fn post_restore(&mut self, pots: &HardPotentials) -> Result<(), OverlapError> {
        self.reset(pots)
    }

    /// Potential energy of the current (possibly trial) configuration, +INFINITY on
    /// hard-core overlap. Used by exchange moves to evaluate trial states without
    /// treating overlap as a failure.
    pub(crate) fn trial_potential_energy(&mut self, pots: &HardPotentials) -> f64 {
        let n = self.state.particles.len();
        self.events.resize(n, CollisionEvent::none());
        self.bond_table.resize(n, Vec::new());
        self.neighbors.rebuild(&self.state);
        match self.compute_potential_energy(pots, false) {
            Ok(e) => e,
            Err(_) => f64::INFINITY,
        }
    }

    /// External notification that the structure changed (particle insertion/removal,
    /// neighbor rebuild by another collaborator): everything is recomputed.
    pub fn structure_changed(&mut self, pots: &HardPotentials) {
        let n = self.state.particles.len();
        self.events.resize(n, CollisionEvent::none());
        self.bond_table.resize(n, Vec::new());
        self.neighbors.rebuild(&self.state);
        self.compute_all_collisions(pots);
    }

    /// External notification that one particle's momentum changed: only its own
    /// prediction and its downstream dependents are recomputed.
    pub fn particle_perturbed(&mut self, i: usize, pots: &HardPotentials) {
        self.invalidate_particle(i, 0., pots);
    }

    pub fn set_temperature(&mut self, temp: f64) {
        self.cfg.temp_target = temp;
        if self.core.is_initialized() && self.cfg.isothermal {
            self.thermo.countdown = 1;
        }
    }

    pub fn set_isothermal(&mut self, isothermal: bool) {
        self.cfg.isothermal = isothermal;
        if isothermal && self.core.is_initialized() {
            self.thermo.countdown = 1;
        }
    }

    pub fn total_energy(&self) -> f64 {
        self.kinetic_energy + self.potential_energy
    }

    /// Time-averaged pressure from the impulsive virial route:
    /// P V = N k T + Σ J·dr / (3 t).
    pub fn measured_pressure(&self) -> f64 {
        if self.time == 0. {
            return 0.;
        }
        let n = self.state.num_mobile() as f64;
        let v = self.state.cell.volume();
        (n * crate::ambient::BOLTZMANN_K * self.state.temperature()
            + self.collision_virial_sum / (3. * self.time))
            / v
    }

    /// The scheduled next-event partner for a particle; exposed for tests and
    /// diagnostics.
    pub fn next_partner(&self, i: usize) -> Partner {
        self.events[i].partner
    }
}

#[cfg(test)]
mod tests {
    use lin_alg::f64::Vec3;

    use super::*;
    use crate::{
        ambient::SimBox,
        potential::{HardSphere, SquareWell},
        state::{Particle, SimState},
    };

    fn head_on_pair(separation: f64, speed: f64) -> SimState {
        let mut a = Particle::new(Vec3::new(-separation / 2., 0., 0.), 1.);
        let mut b = Particle::new(Vec3::new(separation / 2., 0., 0.), 1.);
        a.vel = Vec3::new(speed, 0., 0.);
        b.vel = Vec3::new(-speed, 0., 0.);
        SimState::new(vec![a, b], SimBox::new_cube(20.), 2)
    }

    fn hard_sphere_pots(diameter: f64) -> HardPotentials {
        HardPotentials::pair_only(Box::new(HardSphere { diameter }))
    }

    #[test]
    fn head_on_spheres_collide_at_predicted_time_and_exchange() {
        // D = 4, d = 1, v = 0.5 each: collision at (D − d)/(2v) = 3.
        let state = head_on_pair(4., 0.5);
        let pots = hard_sphere_pots(1.);

        let mut cfg = HardConfig::default();
        cfg.dt = 0.1;
        cfg.horizon_steps = 100;
        // Wide skin: the pair is listed as neighbors from the start, so the
        // prediction exists at reset.
        cfg.neighbor_skin = 20.;

        let mut hard = HardIntegrator::new(state, cfg, 1.);
        hard.reset(&pots).unwrap();

        // Scheduled event: particle 0 against particle 1 at t = 3.
        assert_eq!(hard.next_partner(0), Partner::Atom(1));
        let t = hard.queue.scheduled_time(0);
        assert!((t - 3.0).abs() < 1e-9, "t = {t}");

        // Step past the collision: equal masses in 1-D exchange velocities.
        for _ in 0..31 {
            hard.do_step(&pots);
        }
        assert_eq!(hard.collision_count, 1);
        assert!((hard.state.particles[0].vel.x - -0.5).abs() < 1e-9);
        assert!((hard.state.particles[1].vel.x - 0.5).abs() < 1e-9);

        // No immediate self-re-collision: the next events exclude the resolved
        // partner (both now recede).
        assert_ne!(hard.next_partner(0), Partner::Atom(1));
    }

    #[test]
    fn energy_conserved_through_collisions() {
        let state = head_on_pair(4., 0.5);
        let pots = hard_sphere_pots(1.);
        let mut hard = HardIntegrator::new(state, HardConfig::default(), 1.);
        hard.reset(&pots).unwrap();

        let e0 = hard.state.kinetic_energy();
        for _ in 0..200 {
            hard.do_step(&pots);
        }
        let e1 = hard.state.kinetic_energy();
        assert!((e1 - e0).abs() < 1e-9, "ΔE = {}", e1 - e0);
    }

    #[test]
    fn overlapping_cores_fail_reset() {
        let state = head_on_pair(0.5, 0.1); // separation below the diameter
        let pots = hard_sphere_pots(1.);
        let mut hard = HardIntegrator::new(state, HardConfig::default(), 1.);
        assert!(hard.reset(&pots).is_err());
    }

    #[test]
    fn wall_collision_reflects_particle() {
        // One sphere heading for the +x wall of a hard container.
        let mut p = Particle::new(Vec3::new(0., 0., 0.), 1.);
        p.vel = Vec3::new(1., 0., 0.);
        let state = SimState::new(vec![p], SimBox::new_cube(10.), 3);

        let pots = HardPotentials {
            pair: Box::new(HardSphere { diameter: 1. }),
            bonded: None,
            field: Some(Box::new(crate::potential::HardBoundary { radius: 0.5 })),
        };

        let mut cfg = HardConfig::default();
        cfg.dt = 0.1;
        cfg.horizon_steps = 100;
        let mut hard = HardIntegrator::new(state, cfg, 1.);
        hard.reset(&pots).unwrap();

        // Wall contact at x = 4.5, i.e. t = 4.5.
        assert_eq!(hard.next_partner(0), Partner::Field);

        for _ in 0..50 {
            hard.do_step(&pots);
        }
        assert_eq!(hard.collision_count, 1);
        assert!((hard.state.particles[0].vel.x - -1.0).abs() < 1e-9);
    }

    #[test]
    fn square_well_capture_tracked_in_pair_state() {
        let state = head_on_pair(4., 0.25);
        let sw = SquareWell {
            core: 1.,
            lambda: 1.5,
            epsilon: 0.1,
        };
        let pots = HardPotentials::pair_only(Box::new(sw));

        let mut cfg = HardConfig::default();
        cfg.dt = 0.1;
        let mut hard = HardIntegrator::new(state, cfg, sw.core * sw.lambda);
        hard.reset(&pots).unwrap();

        let u0 = hard.potential_energy;
        assert_eq!(u0, 0.);

        // Run until the well-edge capture happens: gap to the well edge is
        // (4 − 1.5)/ (2·0.25) = 5 time units.
        for _ in 0..60 {
            hard.do_step(&pots);
        }
        assert!(hard.collision_count >= 1);
        assert_eq!(hard.pair_state(0, 1), crate::potential::SQW_INSIDE);
        assert!((hard.potential_energy - -0.1).abs() < 1e-12);
    }
}
