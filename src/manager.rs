//! Multi-integrator managers: parallel tempering, Gibbs-ensemble, and general
//! replica management. A manager drives an ordered list of sub-integrators, each
//! owning its own box and ensemble, plus a weighted set of *exchange* moves
//! (configuration swaps, volume exchange, particle transfer) trialed at the
//! manager's own temperature.
//!
//! Each step, with probability `1/global_move_interval`, exactly one exchange-move
//! Metropolis trial runs; otherwise every sub-integrator steps once.

use lin_alg::f64::Vec3;
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{
    Diagnostics, OverlapError,
    hard::{HardIntegrator, HardPotentials},
    integrator::StepperCore,
    listener::TrialListener,
    mc::McIntegrator,
    md::{MdIntegrator, recompute_potential_energy},
    potential::PotentialForce,
    state::SimState,
};

/// One managed box: a sub-integrator bundled with the potential that governs it.
pub enum ManagedBox {
    Md {
        integrator: MdIntegrator,
        potential: Box<dyn PotentialForce>,
    },
    Mc {
        integrator: McIntegrator,
        potential: Box<dyn PotentialForce>,
    },
    Hard {
        integrator: HardIntegrator,
        potentials: HardPotentials,
    },
}

impl ManagedBox {
    pub fn do_step(&mut self) {
        match self {
            Self::Md {
                integrator,
                potential,
            } => integrator.do_step(potential.as_mut()),
            Self::Mc {
                integrator,
                potential,
            } => integrator.do_step(potential.as_mut()),
            Self::Hard {
                integrator,
                potentials,
            } => integrator.do_step(potentials),
        }
    }

    pub fn reset(&mut self) -> Result<(), OverlapError> {
        match self {
            Self::Md {
                integrator,
                potential,
            } => integrator.reset(potential.as_mut()),
            Self::Mc {
                integrator,
                potential,
            } => integrator.reset(potential.as_mut()),
            Self::Hard {
                integrator,
                potentials,
            } => integrator.reset(potentials),
        }
    }

    pub fn state(&self) -> &SimState {
        match self {
            Self::Md { integrator, .. } => &integrator.state,
            Self::Mc { integrator, .. } => &integrator.state,
            Self::Hard { integrator, .. } => &integrator.state,
        }
    }

    pub fn state_mut(&mut self) -> &mut SimState {
        match self {
            Self::Md { integrator, .. } => &mut integrator.state,
            Self::Mc { integrator, .. } => &mut integrator.state,
            Self::Hard { integrator, .. } => &mut integrator.state,
        }
    }

    pub fn temperature(&self) -> f64 {
        match self {
            Self::Md { integrator, .. } => integrator.cfg.temp_target,
            Self::Mc { integrator, .. } => integrator.cfg.temperature,
            Self::Hard { integrator, .. } => integrator.cfg.temp_target,
        }
    }

    pub fn set_temperature(&mut self, temp: f64) {
        match self {
            Self::Md { integrator, .. } => integrator.set_temperature(temp),
            Self::Mc { integrator, .. } => integrator.set_temperature(temp),
            Self::Hard { integrator, .. } => integrator.set_temperature(temp),
        }
    }

    pub fn potential_energy(&self) -> f64 {
        match self {
            Self::Md { integrator, .. } => integrator.potential_energy,
            Self::Mc { integrator, .. } => integrator.potential_energy,
            Self::Hard { integrator, .. } => integrator.potential_energy,
        }
    }

    /// Recompute the potential energy of the current (possibly trial)
    /// configuration, +INFINITY on overlap. Used by exchange moves.
    pub fn trial_potential_energy(&mut self) -> f64 {
        match self {
            Self::Md {
                integrator,
                potential,
            } => {
                let mut scratch = Vec::new();
                match recompute_potential_energy(
                    &integrator.state,
                    potential.as_mut(),
                    &mut scratch,
                    &Diagnostics::default(),
                ) {
                    Ok(r) => r.energy,
                    Err(_) => f64::INFINITY,
                }
            }
            Self::Mc {
                integrator,
                potential,
            } => {
                let mut scratch = Vec::new();
                match recompute_potential_energy(
                    &integrator.state,
                    potential.as_mut(),
                    &mut scratch,
                    &Diagnostics::default(),
                ) {
                    Ok(r) => r.energy,
                    Err(_) => f64::INFINITY,
                }
            }
            Self::Hard {
                integrator,
                potentials,
            } => integrator.trial_potential_energy(potentials),
        }
    }
}

/// An exchange trial move over the manager's boxes. Protocol mirrors `McMove`:
/// attempt (may refuse) → chi → accept/reject.
pub trait ExchangeMove {
    fn name(&self) -> &'static str;
    fn attempt(&mut self, boxes: &mut [ManagedBox], rng: &mut StdRng) -> bool;
    fn chi(&mut self, temperature: f64) -> f64;
    fn accept(&mut self, boxes: &mut [ManagedBox]);
    fn reject(&mut self, boxes: &mut [ManagedBox]);
}

pub struct ExchangeEntry {
    pub mv: Box<dyn ExchangeMove>,
    pub frequency: f64,
    pub attempts: u64,
    pub accepted: u64,
}

/// Weighted set of exchange moves; selection and bookkeeping mirror the
/// per-box Monte Carlo move set.
#[derive(Default)]
pub struct ExchangeMoveSet {
    pub entries: Vec<ExchangeEntry>,
    total_frequency: f64,
}

impl ExchangeMoveSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, mv: Box<dyn ExchangeMove>, frequency: f64) {
        assert!(frequency > 0.);
        self.entries.push(ExchangeEntry {
            mv,
            frequency,
            attempts: 0,
            accepted: 0,
        });
        self.total_frequency += frequency;
    }

    pub fn renormalize(&mut self) {
        self.total_frequency = self.entries.iter().map(|e| e.frequency).sum();
    }

    fn select(&self, rng: &mut StdRng) -> Option<usize> {
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

#[derive(Clone, Debug, PartialEq)]
pub struct ManagerConfig {
    /// Temperature at which exchange trials are judged.
    pub temperature: f64,
    /// An exchange trial replaces a sweep with probability 1/this.
    pub global_move_interval: f64,
    pub seed: u64,
    pub diagnostics: Diagnostics,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.,
            global_move_interval: 100.,
            seed: 0,
            diagnostics: Default::default(),
        }
    }
}

/// Orchestrates a set of sub-integrators plus global exchange moves.
pub struct IntegratorManager {
    pub core: StepperCore,
    pub cfg: ManagerConfig,
    pub boxes: Vec<ManagedBox>,
    pub exchange_moves: ExchangeMoveSet,
    pub trial_listeners: Vec<Box<dyn TrialListener>>,
    rng: StdRng,
}

impl IntegratorManager {
    pub fn new(cfg: ManagerConfig, boxes: Vec<ManagedBox>) -> Self {
        let rng = StdRng::seed_from_u64(cfg.seed);
        Self {
            core: StepperCore::new(),
            cfg,
            boxes,
            exchange_moves: ExchangeMoveSet::new(),
            trial_listeners: Vec::new(),
            rng,
        }
    }

    /// With probability `1/global_move_interval` perform exactly one exchange trial;
    /// otherwise step every sub-integrator once, in order.
    pub fn do_step(&mut self) {
        let at_interval = self.core.begin_step();

        let do_exchange = !self.exchange_moves.entries.is_empty()
            && self.rng.random::<f64>() < 1.0 / self.cfg.global_move_interval;

        if do_exchange {
            self.run_exchange_trial();
        } else {
            for b in &mut self.boxes {
                b.do_step();
            }
        }

        self.core.end_step(at_interval);
    }

    fn run_exchange_trial(&mut self) {
        let Some(idx) = self.exchange_moves.select(&mut self.rng) else {
            return;
        };

        let entry = &mut self.exchange_moves.entries[idx];
        if !entry.mv.attempt(&mut self.boxes, &mut self.rng) {
            return;
        }

        for l in &mut self.trial_listeners {
            l.trial_initiated(entry.mv.name());
        }

        entry.attempts += 1;
        let chi = entry.mv.chi(self.cfg.temperature);

        let accepted = if chi >= 1.0 {
            true
        } else if chi == 0.0 {
            false
        } else {
            self.rng.random::<f64>() < chi
        };

        if accepted {
            entry.mv.accept(&mut self.boxes);
            entry.accepted += 1;
            for l in &mut self.trial_listeners {
                l.trial_accepted(entry.mv.name(), chi);
            }
        } else {
            entry.mv.reject(&mut self.boxes);
            for l in &mut self.trial_listeners {
                l.trial_rejected(entry.mv.name(), chi);
            }
        }
    }

    /// Cascade reset to every sub-integrator. Every box gets its chance to reset;
    /// only the first overlap failure encountered is re-thrown.
    pub fn reset(&mut self) -> Result<(), OverlapError> {
        self.core.begin_reset();
        self.exchange_moves.renormalize();

        let mut first_failure: Option<OverlapError> = None;
        for b in &mut self.boxes {
            if let Err(e) = b.reset() {
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Exchange moves
// ---------------------------------------------------------------------------

struct SwapPending {
    energy_a: f64,
    energy_b: f64,
    temp_a: f64,
    temp_b: f64,
}

/// Parallel-tempering swap: exchange the configurations of two replicas held at
/// different temperatures, accepted with exp[(β_a − β_b)(E_a − E_b)]. The replicas
/// must share box geometry and particle count.
pub struct SwapConfigurations {
    pub box_a: usize,
    pub box_b: usize,
    pending: Option<SwapPending>,
}

impl SwapConfigurations {
    pub fn new(box_a: usize, box_b: usize) -> Self {
        Self {
            box_a,
            box_b,
            pending: None,
        }
    }
}

impl ExchangeMove for SwapConfigurations {
    fn name(&self) -> &'static str {
        "swap-configurations"
    }

    fn attempt(&mut self, boxes: &mut [ManagedBox], _rng: &mut StdRng) -> bool {
        if self.box_a == self.box_b || self.box_a >= boxes.len() || self.box_b >= boxes.len() {
            return false;
        }

        let (sa, sb) = (boxes[self.box_a].state(), boxes[self.box_b].state());
        if sa.particles.len() != sb.particles.len() {
            return false;
        }
        if (sa.cell.extent - sb.cell.extent).magnitude() > 1e-9 {
            return false; // replicas must share geometry
        }

        self.pending = Some(SwapPending {
            energy_a: boxes[self.box_a].potential_energy(),
            energy_b: boxes[self.box_b].potential_energy(),
            temp_a: boxes[self.box_a].temperature(),
            temp_b: boxes[self.box_b].temperature(),
        });
        true
    }

    fn chi(&mut self, _temperature: f64) -> f64 {
        let p = self.pending.as_ref().expect("chi without a pending trial");
        let beta_a = 1.0 / p.temp_a;
        let beta_b = 1.0 / p.temp_b;
        ((beta_a - beta_b) * (p.energy_a - p.energy_b)).exp()
    }

    fn accept(&mut self, boxes: &mut [ManagedBox]) {
        let p = self.pending.take().expect("accept without a pending trial");

        // Swap positions; rescale velocities to each replica's own temperature so
        // kinetic sampling continues canonically.
        let scale_into_a = (p.temp_a / p.temp_b).sqrt();
        let scale_into_b = (p.temp_b / p.temp_a).sqrt();

        let (low, high, a_is_low) = if self.box_a < self.box_b {
            (self.box_a, self.box_b, true)
        } else {
            (self.box_b, self.box_a, false)
        };
        let (left, right) = boxes.split_at_mut(high);
        let box_low = &mut left[low];
        let box_high = &mut right[0];

        let (sa, sb) = if a_is_low {
            (box_low.state_mut(), box_high.state_mut())
        } else {
            // box_a is the higher index
            (box_high.state_mut(), box_low.state_mut())
        };

        for (pa, pb) in sa.particles.iter_mut().zip(sb.particles.iter_mut()) {
            std::mem::swap(&mut pa.posit, &mut pb.posit);
            std::mem::swap(&mut pa.vel, &mut pb.vel);
            pa.vel *= scale_into_a;
            pb.vel *= scale_into_b;
        }

        // Forces and collision tables now describe the other configuration.
        boxes[self.box_a]
            .reset()
            .expect("overlap after configuration swap");
        boxes[self.box_b]
            .reset()
            .expect("overlap after configuration swap");
    }

    fn reject(&mut self, _boxes: &mut [ManagedBox]) {
        self.pending = None;
    }
}

struct VolumePending {
    posits_a: Vec<Vec3>,
    posits_b: Vec<Vec3>,
    cell_a: crate::ambient::SimBox,
    cell_b: crate::ambient::SimBox,
    delta_u: f64,
    bias_ln: f64,
}

/// Gibbs-ensemble volume exchange: one box grows, the other shrinks by the same
/// amount, sampled uniformly in ln(V_a/V_b).
pub struct ExchangeVolume {
    pub box_a: usize,
    pub box_b: usize,
    pub max_ln_step: f64,
    pending: Option<VolumePending>,
}

impl ExchangeVolume {
    pub fn new(box_a: usize, box_b: usize, max_ln_step: f64) -> Self {
        Self {
            box_a,
            box_b,
            max_ln_step,
            pending: None,
        }
    }

    fn scale_box(mb: &mut ManagedBox, lambda: f64) {
        let state = mb.state_mut();
        let center = state.cell.center();
        state.cell.scale_isotropic(lambda);
        for p in &mut state.particles {
            p.posit = center + (p.posit - center) * lambda;
        }
    }
}

impl ExchangeMove for ExchangeVolume {
    fn name(&self) -> &'static str {
        "exchange-volume"
    }

    fn attempt(&mut self, boxes: &mut [ManagedBox], rng: &mut StdRng) -> bool {
        if self.box_a == self.box_b || self.box_a >= boxes.len() || self.box_b >= boxes.len() {
            return false;
        }

        let u_a_old = boxes[self.box_a].potential_energy();
        let u_b_old = boxes[self.box_b].potential_energy();

        let mut posits_a = Vec::new();
        let mut posits_b = Vec::new();
        boxes[self.box_a].state().save_positions(&mut posits_a);
        boxes[self.box_b].state().save_positions(&mut posits_b);
        let cell_a = boxes[self.box_a].state().cell;
        let cell_b = boxes[self.box_b].state().cell;

        let v_a = cell_a.volume();
        let v_b = cell_b.volume();
        let v_total = v_a + v_b;

        // Random walk in ln(Va/Vb), total volume conserved.
        let delta = rng.random_range(-self.max_ln_step..self.max_ln_step);
        let ratio_new = (v_a / v_b).ln() + delta;
        let v_a_new = v_total * ratio_new.exp() / (1.0 + ratio_new.exp());
        let v_b_new = v_total - v_a_new;

        Self::scale_box(&mut boxes[self.box_a], (v_a_new / v_a).cbrt());
        Self::scale_box(&mut boxes[self.box_b], (v_b_new / v_b).cbrt());

        let u_a_new = boxes[self.box_a].trial_potential_energy();
        let u_b_new = boxes[self.box_b].trial_potential_energy();

        let n_a = boxes[self.box_a].state().particles.len() as f64;
        let n_b = boxes[self.box_b].state().particles.len() as f64;
        let bias_ln =
            (n_a + 1.0) * (v_a_new / v_a).ln() + (n_b + 1.0) * (v_b_new / v_b).ln();

        self.pending = Some(VolumePending {
            posits_a,
            posits_b,
            cell_a,
            cell_b,
            delta_u: (u_a_new - u_a_old) + (u_b_new - u_b_old),
            bias_ln,
        });
        true
    }

    fn chi(&mut self, temperature: f64) -> f64 {
        let p = self.pending.as_ref().expect("chi without a pending trial");
        if p.delta_u.is_infinite() && p.delta_u > 0. {
            return 0.;
        }
        (p.bias_ln - p.delta_u / temperature).exp()
    }

    fn accept(&mut self, boxes: &mut [ManagedBox]) {
        self.pending = None;
        boxes[self.box_a]
            .reset()
            .expect("overlap accepted in volume exchange");
        boxes[self.box_b]
            .reset()
            .expect("overlap accepted in volume exchange");
    }

    fn reject(&mut self, boxes: &mut [ManagedBox]) {
        let p = self.pending.take().expect("reject without a pending trial");

        {
            let state = boxes[self.box_a].state_mut();
            state.cell = p.cell_a;
            state.restore_positions(&p.posits_a);
        }
        {
            let state = boxes[self.box_b].state_mut();
            state.cell = p.cell_b;
            state.restore_positions(&p.posits_b);
        }

        // Neighbor/collision tables were disturbed by the trial probes.
        boxes[self.box_a]
            .reset()
            .expect("overlap restoring volume exchange");
        boxes[self.box_b]
            .reset()
            .expect("overlap restoring volume exchange");
    }
}

struct TransferPending {
    particle: crate::state::Particle,
    from_index: usize,
    delta_u: f64,
    bias: f64,
}

/// Gibbs-ensemble particle transfer: remove a random particle from one box, insert
/// it at a uniformly random position in the other.
pub struct TransferParticle {
    pub from: usize,
    pub to: usize,
    pending: Option<TransferPending>,
}

impl TransferParticle {
    pub fn new(from: usize, to: usize) -> Self {
        Self {
            from,
            to,
            pending: None,
        }
    }
}

impl ExchangeMove for TransferParticle {
    fn name(&self) -> &'static str {
        "transfer-particle"
    }

    fn attempt(&mut self, boxes: &mut [ManagedBox], rng: &mut StdRng) -> bool {
        if self.from == self.to || self.from >= boxes.len() || self.to >= boxes.len() {
            return false;
        }
        let n_from = boxes[self.from].state().particles.len();
        if n_from == 0 {
            return false;
        }

        let u_from_old = boxes[self.from].potential_energy();
        let u_to_old = boxes[self.to].potential_energy();

        let idx = rng.random_range(0..n_from);
        let mut particle = boxes[self.from].state_mut().particles.remove(idx);
        // Keep the original for rollback; the inserted copy gets a fresh position.
        let original = particle.clone();

        // Uniform insertion point in the destination box.
        let cell = boxes[self.to].state().cell;
        particle.posit = Vec3::new(
            rng.random_range(cell.bounds_low.x..cell.bounds_high.x),
            rng.random_range(cell.bounds_low.y..cell.bounds_high.y),
            rng.random_range(cell.bounds_low.z..cell.bounds_high.z),
        );
        boxes[self.to].state_mut().particles.push(particle);

        let u_from_new = boxes[self.from].trial_potential_energy();
        let u_to_new = boxes[self.to].trial_potential_energy();

        let v_from = boxes[self.from].state().cell.volume();
        let v_to = cell.volume();
        let n_to_new = boxes[self.to].state().particles.len() as f64;

        // (N_from · V_to) / ((N_to + 1) · V_from)
        let bias = (n_from as f64 * v_to) / (n_to_new * v_from);

        self.pending = Some(TransferPending {
            particle: original,
            from_index: idx,
            delta_u: (u_from_new - u_from_old) + (u_to_new - u_to_old),
            bias,
        });
        true
    }

    fn chi(&mut self, temperature: f64) -> f64 {
        let p = self.pending.as_ref().expect("chi without a pending trial");
        if p.delta_u.is_infinite() && p.delta_u > 0. {
            return 0.;
        }
        p.bias * (-p.delta_u / temperature).exp()
    }

    fn accept(&mut self, boxes: &mut [ManagedBox]) {
        self.pending = None;
        boxes[self.from]
            .reset()
            .expect("overlap accepted in particle transfer");
        boxes[self.to]
            .reset()
            .expect("overlap accepted in particle transfer");
    }

    fn reject(&mut self, boxes: &mut [ManagedBox]) {
        let p = self.pending.take().expect("reject without a pending trial");

        // Undo the insertion and put the particle back where it came from.
        boxes[self.to].state_mut().particles.pop();
        boxes[self.from]
            .state_mut()
            .particles
            .insert(p.from_index, p.particle);

        boxes[self.from]
            .reset()
            .expect("overlap restoring particle transfer");
        boxes[self.to]
            .reset()
            .expect("overlap restoring particle transfer");
    }
}
