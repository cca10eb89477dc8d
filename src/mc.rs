//! The Metropolis Monte Carlo trial engine: a weighted move set, the
//! trial/accept/reject protocol, and reference trial moves.
//!
//! Each step selects one move with probability proportional to its configured
//! frequency, asks it to propose a trial (which it may refuse outright, e.g. an
//! atom-displacement move in an empty box), and applies the acceptance rule to
//! `chi = bias × exp(−ΔE/T)`: `chi ≥ 1` always accepts, `chi == 0` always rejects
//! without drawing (guarding the bias factor against log-domain errors), otherwise
//! accept iff a fresh uniform draw is below `chi`.
//!
//! On acceptance the box potential-energy cache is incremented by the move's reported
//! energy change, never recomputed from scratch, keeping a trial at O(move cost).

use lin_alg::f64::Vec3;
use rand::{Rng, rngs::StdRng};

use crate::{
    Diagnostics, OverlapError,
    integrator::StepperCore,
    listener::{StepContext, StepListener, TrialListener, fire_initialized, fire_step_finished, fire_step_started},
    md::recompute_potential_energy,
    potential::PotentialForce,
    state::SimState,
};

/// A Monte Carlo trial move. The protocol per trial is:
/// `attempt` (may refuse) → `chi` → `accept` or `reject` (rollback).
pub trait McMove {
    fn name(&self) -> &'static str;

    /// Propose and tentatively apply a trial. Returns false if the move declines
    /// (no eligible particles, etc.); a refusal is a normal outcome, not an error,
    /// and consumes no acceptance draw.
    fn attempt(&mut self, state: &mut SimState, pot: &mut dyn PotentialForce) -> bool;

    /// The Metropolis ratio for the pending trial, including any bias factor.
    fn chi(&mut self, temperature: f64) -> f64;

    /// Commit the pending trial.
    fn accept(&mut self, state: &mut SimState);

    /// Roll the pending trial back.
    fn reject(&mut self, state: &mut SimState);

    /// Potential-energy change of the accepted trial, used to update the box cache.
    fn energy_change(&self) -> f64;
}

/// One registered move with its selection weight and acceptance bookkeeping.
pub struct MoveEntry {
    pub mv: Box<dyn McMove>,
    /// Relative selection frequency; renormalized against the set total on reset.
    pub frequency: f64,
    pub attempts: u64,
    pub accepted: u64,
}

impl MoveEntry {
    pub fn acceptance_ratio(&self) -> f64 {
        if self.attempts == 0 {
            0.
        } else {
            self.accepted as f64 / self.attempts as f64
        }
    }
}

/// A weighted set of trial moves.
#[derive(Default)]
pub struct MoveSet {
    pub entries: Vec<MoveEntry>,
    total_frequency: f64,
}

impl MoveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mv: Box<dyn McMove>, frequency: f64) {
        assert!(frequency > 0., "move frequency must be positive");
        self.entries.push(MoveEntry {
            mv,
            frequency,
            attempts: 0,
            accepted: 0,
        });
        self.total_frequency += frequency;
    }

    /// Re-sum frequencies; called on integrator reset so externally-mutated
    /// frequencies take effect.
    pub fn renormalize(&mut self) {
        self.total_frequency = self.entries.iter().map(|e| e.frequency).sum();
    }

    /// Pick a move index with probability proportional to frequency.
    pub(crate) fn select(&self, rng: &mut StdRng) -> Option<usize> {
        if self.entries.is_empty() || self.total_frequency <= 0. {
            return None;
        }

        let mut draw = rng.random::<f64>() * self.total_frequency;
        for (i, e) in self.entries.iter().enumerate() {
            draw -= e.frequency;
            if draw <= 0. {
                return Some(i);
            }
        }
        Some(self.entries.len() - 1)
    }
}

/// Outcome of one trial cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrialOutcome {
    /// The set is empty; nothing was attempted.
    NoMove,
    /// The selected move declined to propose.
    Refused,
    Accepted,
    Rejected,
}

/// One full trial: selection, proposal, acceptance test, bookkeeping, notifications.
/// Shared by `McIntegrator`, the hybrid-MC thermostat segment, and the
/// multi-integrator managers.
pub(crate) fn run_trial(
    moves: &mut MoveSet,
    state: &mut SimState,
    pot: &mut dyn PotentialForce,
    temperature: f64,
    potential_energy: &mut f64,
    listeners: &mut [Box<dyn TrialListener>],
) -> TrialOutcome {
    let Some(idx) = moves.select(&mut state.rng) else {
        return TrialOutcome::NoMove;
    };

    let entry = &mut moves.entries[idx];
    if !entry.mv.attempt(state, pot) {
        return TrialOutcome::Refused;
    }

    for l in listeners.iter_mut() {
        l.trial_initiated(entry.mv.name());
    }

    entry.attempts += 1;
    let chi = entry.mv.chi(temperature);

    // chi == 0 short-circuits without a random draw; chi >= 1 always accepts.
    let accepted = if chi >= 1.0 {
        true
    } else if chi == 0.0 {
        false
    } else {
        state.rng.random::<f64>() < chi
    };

    if accepted {
        entry.mv.accept(state);
        entry.accepted += 1;
        *potential_energy += entry.mv.energy_change();
        for l in listeners.iter_mut() {
            l.trial_accepted(entry.mv.name(), chi);
        }
        TrialOutcome::Accepted
    } else {
        entry.mv.reject(state);
        for l in listeners.iter_mut() {
            l.trial_rejected(entry.mv.name(), chi);
        }
        TrialOutcome::Rejected
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct McConfig {
    /// Energy units (k_B = 1).
    pub temperature: f64,
    pub diagnostics: Diagnostics,
}

impl Default for McConfig {
    fn default() -> Self {
        Self {
            temperature: 1.,
            diagnostics: Default::default(),
        }
    }
}

/// The Metropolis Monte Carlo integrator for one box.
pub struct McIntegrator {
    pub core: StepperCore,
    pub cfg: McConfig,
    pub state: SimState,
    pub moves: MoveSet,
    /// Cached; recomputed on reset, incremented on accepted trials.
    pub potential_energy: f64,
    pub step_listeners: Vec<Box<dyn StepListener>>,
    pub trial_listeners: Vec<Box<dyn TrialListener>>,
    forces_scratch: Vec<Vec3>,
}

impl McIntegrator {
    pub fn new(state: SimState, cfg: McConfig) -> Self {
        Self {
            core: StepperCore::new(),
            cfg,
            state,
            moves: MoveSet::new(),
            potential_energy: 0.,
            step_listeners: Vec::new(),
            trial_listeners: Vec::new(),
            forces_scratch: Vec::new(),
        }
    }

    fn ctx(&self) -> StepContext {
        StepContext {
            step_count: self.core.step_count,
            time: 0.,
        }
    }

    /// One Monte Carlo trial, wrapped in the common step lifecycle.
    pub fn do_step(&mut self, pot: &mut dyn PotentialForce) {
        assert!(
            self.core.is_initialized(),
            "McIntegrator::reset must run before stepping"
        );

        let at_interval = self.core.begin_step();
        let ctx = self.ctx();
        if at_interval {
            fire_step_started(&mut self.step_listeners, &mut self.state, ctx);
        }

        run_trial(
            &mut self.moves,
            &mut self.state,
            pot,
            self.cfg.temperature,
            &mut self.potential_energy,
            &mut self.trial_listeners,
        );

        if at_interval {
            let ctx = self.ctx();
            fire_step_finished(&mut self.step_listeners, &mut self.state, ctx);
        }
        self.core.end_step(at_interval);
    }

    /// Recompute the cached potential energy (failing on configuration overlap),
    /// renormalize move weights, and fire the initialized notification.
    pub fn reset(&mut self, pot: &mut dyn PotentialForce) -> Result<(), OverlapError> {
        self.core.begin_reset();

        let result = recompute_potential_energy(
            &self.state,
            pot,
            &mut self.forces_scratch,
            &self.cfg.diagnostics,
        )?;
        self.potential_energy = result.energy;

        self.moves.renormalize();

        let ctx = self.ctx();
        fire_initialized(&mut self.step_listeners, &mut self.state, ctx);
        Ok(())
    }

    /// Hook after restoring a checkpoint: the checkpoint holds only counters, so the
    /// energy cache must be rebuilt from the restored kinematic state.
    pub fn post_restore(&mut self, pot: &mut dyn PotentialForce) -> Result<(), OverlapError> {
        self.reset(pot)
    }

    pub fn set_temperature(&mut self, temperature: f64) {
        self.cfg.temperature = temperature;
    }
}

// ---------------------------------------------------------------------------
// Reference moves
// ---------------------------------------------------------------------------

struct DisplacementTrial {
    index: usize,
    old_posit: Vec3,
    delta_u: f64,
}

/// Uniform random displacement of one random mobile particle within a cube of
/// half-edge `max_step`.
pub struct DisplaceParticle {
    pub max_step: f64,
    trial: Option<DisplacementTrial>,
    last_delta_u: f64,
}

impl DisplaceParticle {
    pub fn new(max_step: f64) -> Self {
        Self {
            max_step,
            trial: None,
            last_delta_u: 0.,
        }
    }
}

impl McMove for DisplaceParticle {
    fn name(&self) -> &'static str {
        "displace-particle"
    }

    fn attempt(&mut self, state: &mut SimState, pot: &mut dyn PotentialForce) -> bool {
        let n = state.particles.len();
        if n == 0 || state.num_mobile() == 0 {
            return false;
        }

        // Rejection-sample a mobile particle; mobile particles exist per the check above.
        let index = loop {
            let i = state.rng.random_range(0..n);
            if !state.particles[i].fixed {
                break i;
            }
        };

        let u_old = pot.particle_energy(state, index);
        let old_posit = state.particles[index].posit;

        let s = self.max_step;
        let delta = Vec3::new(
            state.rng.random_range(-s..s),
            state.rng.random_range(-s..s),
            state.rng.random_range(-s..s),
        );
        state.particles[index].posit = state.cell.wrap(old_posit + delta);

        let u_new = pot.particle_energy(state, index);

        self.last_delta_u = u_new - u_old;
        self.trial = Some(DisplacementTrial {
            index,
            old_posit,
            delta_u: self.last_delta_u,
        });
        true
    }

    fn chi(&mut self, temperature: f64) -> f64 {
        let trial = self.trial.as_ref().expect("chi without a pending trial");
        if trial.delta_u.is_infinite() && trial.delta_u > 0. {
            return 0.;
        }
        (-trial.delta_u / temperature).exp()
    }

    fn accept(&mut self, _state: &mut SimState) {
        // Position was already applied during attempt; nothing further.
        self.trial = None;
    }

    fn reject(&mut self, state: &mut SimState) {
        let trial = self.trial.take().expect("reject without a pending trial");
        state.particles[trial.index].posit = trial.old_posit;
    }

    fn energy_change(&self) -> f64 {
        self.last_delta_u
    }
}

struct VolumeTrial {
    old_posits: Vec<Vec3>,
    old_cell: crate::ambient::SimBox,
    old_u: f64,
    new_u: f64,
    ln_v_ratio: f64,
    delta_v: f64,
}

/// Isotropic volume change, sampled uniformly in ln V, with particle coordinates
/// scaled affinely about the box center. For NPT sampling at `pressure`.
pub struct ChangeVolume {
    pub pressure: f64,
    pub max_ln_v_step: f64,
    trial: Option<VolumeTrial>,
    last_delta_u: f64,
    forces_scratch: Vec<Vec3>,
}

impl ChangeVolume {
    pub fn new(pressure: f64, max_ln_v_step: f64) -> Self {
        Self {
            pressure,
            max_ln_v_step,
            trial: None,
            last_delta_u: 0.,
            forces_scratch: Vec::new(),
        }
    }
}

impl McMove for ChangeVolume {
    fn name(&self) -> &'static str {
        "change-volume"
    }

    fn attempt(&mut self, state: &mut SimState, pot: &mut dyn PotentialForce) -> bool {
        if state.particles.is_empty() {
            return false;
        }

        self.forces_scratch
            .resize(state.particles.len(), Vec3::new_zero());
        let old_u = pot
            .compute_all(state, &mut self.forces_scratch, false)
            .energy;

        let mut old_posits = Vec::with_capacity(state.particles.len());
        state.save_positions(&mut old_posits);
        let old_cell = state.cell;
        let old_v = old_cell.volume();

        let s = self.max_ln_v_step;
        let ln_ratio = state.rng.random_range(-s..s);
        let lambda = (ln_ratio / 3.0).exp();

        let center = state.cell.center();
        state.cell.scale_isotropic(lambda);
        for p in &mut state.particles {
            p.posit = center + (p.posit - center) * lambda;
        }

        let new_u = pot
            .compute_all(state, &mut self.forces_scratch, false)
            .energy;

        self.last_delta_u = new_u - old_u;
        self.trial = Some(VolumeTrial {
            old_posits,
            old_cell,
            old_u,
            new_u,
            ln_v_ratio: ln_ratio,
            delta_v: old_v * (ln_ratio.exp() - 1.0),
        });
        true
    }

    fn chi(&mut self, temperature: f64) -> f64 {
        let trial = self.trial.as_ref().expect("chi without a pending trial");
        let delta_u = trial.new_u - trial.old_u;
        if delta_u.is_infinite() && delta_u > 0. {
            return 0.;
        }

        // N+1 from sampling uniformly in ln V.
        let n = trial.old_posits.len() as f64;
        let bias = ((n + 1.0) * trial.ln_v_ratio).exp();
        bias * (-(delta_u + self.pressure * trial.delta_v) / temperature).exp()
    }

    fn accept(&mut self, _state: &mut SimState) {
        self.trial = None;
    }

    fn reject(&mut self, state: &mut SimState) {
        let trial = self.trial.take().expect("reject without a pending trial");
        state.cell = trial.old_cell;
        state.restore_positions(&trial.old_posits);
    }

    fn energy_change(&self) -> f64 {
        self.last_delta_u
    }
}
