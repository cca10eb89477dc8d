//! Gear 4th-order predictor-corrector integration.
//!
//! Positions and velocities are each advanced as a first-order chain in 5-value
//! Nordsieck (scaled-derivative) form: the position chain is driven by the corrected
//! velocity, the velocity chain by the computed acceleration. Each particle stores
//! three extra scaled derivative levels per chain, in parallel arrays sized once per
//! box attach. The corrector applies the classic 5-value first-order Gear
//! coefficients to the predictor-corrector difference, giving 5th-order local
//! truncation.
//!
//! The NPH variant evolves a scalar volume state with the same scheme, coupling
//! pressure/enthalpy feedback terms (`chi`, `zeta`) computed from the instantaneous
//! virial and hypervirial sums.

use lin_alg::f64::Vec3;

use crate::{
    ambient::measure_pressure,
    listener::{MdListener, StepContext, fire_forces_computed, fire_forces_precomputed},
    potential::{PotentialForce, PotentialResult},
    state::SimState,
    verlet::wrap_all,
};

// 5-value first-order Gear corrector coefficients.
const GEAR_C0: f64 = 251. / 720.;
const GEAR_C2: f64 = 11. / 12.;
const GEAR_C3: f64 = 1. / 3.;
const GEAR_C4: f64 = 1. / 24.;

/// Per-particle scaled-derivative storage for one first-order Gear chain: y1 = h·y′,
/// y2 = (h²/2)·y″, and so on.
#[derive(Default)]
struct GearChain {
    d1: Vec<Vec3>,
    d2: Vec<Vec3>,
    d3: Vec<Vec3>,
    d4: Vec<Vec3>,
}

impl GearChain {
    fn resize(&mut self, n: usize) {
        self.d1.resize(n, Vec3::new_zero());
        self.d2.resize(n, Vec3::new_zero());
        self.d3.resize(n, Vec3::new_zero());
        self.d4.resize(n, Vec3::new_zero());
    }

    /// Taylor predictor through the stored derivative levels.
    fn predict(&mut self, i: usize) -> Vec3 {
        let advance = self.d1[i] + self.d2[i] + self.d3[i] + self.d4[i];
        self.d1[i] += self.d2[i] * 2. + self.d3[i] * 3. + self.d4[i] * 4.;
        self.d2[i] += self.d3[i] * 3. + self.d4[i] * 6.;
        self.d3[i] += self.d4[i] * 4.;
        advance
    }

    /// Correct against the actual scaled rate `h·y′`; returns the correction applied
    /// to the value level (C0·Δ).
    fn correct(&mut self, i: usize, scaled_rate: Vec3) -> Vec3 {
        let delta = scaled_rate - self.d1[i];
        self.d1[i] = scaled_rate;
        self.d2[i] += delta * GEAR_C2;
        self.d3[i] += delta * GEAR_C3;
        self.d4[i] += delta * GEAR_C4;
        delta * GEAR_C0
    }
}

/// NVE Gear4 state: one chain each for positions and velocities.
#[derive(Default)]
pub struct GearState {
    pos_chain: GearChain,
    vel_chain: GearChain,
    primed: bool,
}

impl GearState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the chains from the current kinematics and forces. Called on reset and
    /// whenever the particle count changes.
    fn prime(&mut self, state: &SimState, forces: &[Vec3], dt: f64) {
        let n = state.particles.len();
        self.pos_chain.resize(n);
        self.vel_chain.resize(n);

        for (i, p) in state.particles.iter().enumerate() {
            self.pos_chain.d1[i] = p.vel * dt;
            self.pos_chain.d2[i] = Vec3::new_zero();
            self.pos_chain.d3[i] = Vec3::new_zero();
            self.pos_chain.d4[i] = Vec3::new_zero();

            self.vel_chain.d1[i] = forces[i] * (dt / p.mass);
            self.vel_chain.d2[i] = Vec3::new_zero();
            self.vel_chain.d3[i] = Vec3::new_zero();
            self.vel_chain.d4[i] = Vec3::new_zero();
        }
        self.primed = true;
    }

    pub(crate) fn invalidate(&mut self) {
        self.primed = false;
    }
}

pub(crate) fn step_gear4(
    algo: &mut GearState,
    state: &mut SimState,
    forces: &mut [Vec3],
    pot: &mut dyn PotentialForce,
    dt: f64,
    md_listeners: &mut [Box<dyn MdListener>],
    ctx: StepContext,
) -> PotentialResult {
    if !algo.primed || algo.pos_chain.d1.len() != state.particles.len() {
        algo.prime(state, forces, dt);
    }

    // Predictor for both chains.
    for (i, p) in state.particles.iter_mut().enumerate() {
        if p.fixed {
            continue;
        }
        p.posit += algo.pos_chain.predict(i);
        p.vel += algo.vel_chain.predict(i);
    }

    fire_forces_precomputed(md_listeners, state, ctx);
    let result = pot.compute_all(state, forces, true);
    fire_forces_computed(md_listeners, state, ctx);

    // Corrector: velocities against the computed acceleration, then positions
    // against the corrected velocity.
    for (i, p) in state.particles.iter_mut().enumerate() {
        if p.fixed {
            continue;
        }

        let accel_scaled = forces[i] * (dt / p.mass);
        p.vel += algo.vel_chain.correct(i, accel_scaled);

        let vel_scaled = p.vel * dt;
        p.posit += algo.pos_chain.correct(i, vel_scaled);
    }
    wrap_all(state);

    result
}

/// Gear4 NPH/NPT state: particle chains plus a scalar volume chain and the
/// `chi`/`zeta` feedback multipliers.
pub struct GearNphState {
    pos_chain: GearChain,
    vel_chain: GearChain,
    vol: [f64; 4], // scaled volume derivatives, d1..d4
    primed: bool,

    pub pressure_target: f64,
    /// Pressure relaxation time.
    pub tau_pressure: f64,
    /// Temperature (isothermal) or enthalpy (adiabatic) relaxation time.
    pub tau_temp: f64,
    /// Isothermal (NPT) vs adiabatic (NPH) sampling.
    isothermal_mode: bool,
    /// Adiabatic mode regulates toward this enthalpy; captured from the instantaneous
    /// value at the first force evaluation after switching modes.
    enthalpy_target: f64,

    chi: f64,
    zeta: f64,
}

impl GearNphState {
    pub fn new(pressure_target: f64) -> Self {
        Self {
            pos_chain: GearChain::default(),
            vel_chain: GearChain::default(),
            vol: [0.; 4],
            primed: false,
            pressure_target,
            tau_pressure: 10.,
            tau_temp: 10.,
            isothermal_mode: false,
            enthalpy_target: f64::NAN,
            chi: 0.,
            zeta: 0.,
        }
    }

    /// Toggle between isothermal (NPT) and adiabatic (NPH) sampling. Switching to
    /// adiabatic captures the *current* enthalpy as the new target at the next force
    /// evaluation.
    pub fn set_isothermal_mode(&mut self, isothermal: bool) {
        self.isothermal_mode = isothermal;
        if !isothermal {
            self.enthalpy_target = f64::NAN;
        }
    }

    pub fn isothermal_mode(&self) -> bool {
        self.isothermal_mode
    }

    pub(crate) fn invalidate(&mut self) {
        self.primed = false;
    }

    fn prime(&mut self, state: &SimState, forces: &[Vec3], dt: f64) {
        let n = state.particles.len();
        self.pos_chain.resize(n);
        self.vel_chain.resize(n);

        for (i, p) in state.particles.iter().enumerate() {
            self.pos_chain.d1[i] = p.vel * dt;
            self.pos_chain.d2[i] = Vec3::new_zero();
            self.pos_chain.d3[i] = Vec3::new_zero();
            self.pos_chain.d4[i] = Vec3::new_zero();

            self.vel_chain.d1[i] = forces[i] * (dt / p.mass);
            self.vel_chain.d2[i] = Vec3::new_zero();
            self.vel_chain.d3[i] = Vec3::new_zero();
            self.vel_chain.d4[i] = Vec3::new_zero();
        }

        self.vol = [0.; 4];
        self.chi = 0.;
        self.zeta = 0.;
        self.primed = true;
    }

    /// Feedback rates from the instantaneous measurements. `chi` regulates
    /// temperature (isothermal) or enthalpy (adiabatic); `zeta` regulates pressure.
    fn update_feedback(&mut self, state: &SimState, result: &PotentialResult, temp_target: f64) {
        let kinetic = state.kinetic_energy();
        let volume = state.cell.volume();
        let p_inst = measure_pressure(kinetic, &state.cell, result.virial);

        // Pressure feedback, scaled by the stiffness 2K + X (hypervirial).
        let stiffness = (2. * kinetic + result.hypervirial).abs().max(1e-12);
        self.zeta = (p_inst - self.pressure_target) * volume / (stiffness * self.tau_pressure);

        if self.isothermal_mode {
            let t_inst = state.temperature();
            let t_ref = temp_target.max(1e-12);
            self.chi = (t_inst - temp_target) / (t_ref * self.tau_temp);
        } else {
            let h_inst = result.energy + kinetic + self.pressure_target * volume;
            if self.enthalpy_target.is_nan() {
                self.enthalpy_target = h_inst;
            }
            let scale = (2. * kinetic).max(1e-12);
            self.chi = (h_inst - self.enthalpy_target) / (scale * self.tau_temp);
        }
    }
}

pub(crate) fn step_gear4_nph(
    algo: &mut GearNphState,
    state: &mut SimState,
    forces: &mut [Vec3],
    pot: &mut dyn PotentialForce,
    dt: f64,
    temp_target: f64,
    md_listeners: &mut [Box<dyn MdListener>],
    ctx: StepContext,
) -> PotentialResult {
    if !algo.primed || algo.pos_chain.d1.len() != state.particles.len() {
        algo.prime(state, forces, dt);
    }

    // Predictor: particle chains.
    for (i, p) in state.particles.iter_mut().enumerate() {
        if p.fixed {
            continue;
        }
        p.posit += algo.pos_chain.predict(i);
        p.vel += algo.vel_chain.predict(i);
    }

    // Predictor: volume chain.
    let vol_old = state.cell.volume();
    let vol_advance = algo.vol[0] + algo.vol[1] + algo.vol[2] + algo.vol[3];
    algo.vol[0] += 2. * algo.vol[1] + 3. * algo.vol[2] + 4. * algo.vol[3];
    algo.vol[1] += 3. * algo.vol[2] + 6. * algo.vol[3];
    algo.vol[2] += 4. * algo.vol[3];
    let vol_predicted = (vol_old + vol_advance).max(1e-12);
    apply_volume(state, vol_old, vol_predicted);

    fire_forces_precomputed(md_listeners, state, ctx);
    let result = pot.compute_all(state, forces, true);
    fire_forces_computed(md_listeners, state, ctx);

    algo.update_feedback(state, &result, temp_target);

    // Corrector: velocities against a − (χ+ζ)v, then positions against v.
    let damp = algo.chi + algo.zeta;
    for (i, p) in state.particles.iter_mut().enumerate() {
        if p.fixed {
            continue;
        }

        let rate = (forces[i] * (1. / p.mass) - p.vel * damp) * dt;
        p.vel += algo.vel_chain.correct(i, rate);

        let vel_scaled = p.vel * dt;
        p.posit += algo.pos_chain.correct(i, vel_scaled);
    }

    // Corrector: volume against dV/dt = 3 ζ V.
    let vol_mid = state.cell.volume();
    let vol_rate = 3. * algo.zeta * vol_mid * dt;
    let delta = vol_rate - algo.vol[0];
    algo.vol[0] = vol_rate;
    algo.vol[1] += delta * GEAR_C2;
    algo.vol[2] += delta * GEAR_C3;
    algo.vol[3] += delta * GEAR_C4;
    let vol_corrected = (vol_mid + delta * GEAR_C0).max(1e-12);
    apply_volume(state, vol_mid, vol_corrected);

    wrap_all(state);
    result
}

/// Rescale the cell from `vol_old` to `vol_new`, dilating particle coordinates
/// affinely about the box center.
fn apply_volume(state: &mut SimState, vol_old: f64, vol_new: f64) {
    if (vol_new - vol_old).abs() < 1e-15 * vol_old.abs() {
        return;
    }
    let lambda = (vol_new / vol_old).cbrt();
    let center = state.cell.center();
    state.cell.scale_isotropic(lambda);

    for p in &mut state.particles {
        if !p.fixed {
            p.posit = center + (p.posit - center) * lambda;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gear_chain_predicts_constant_rate_exactly() {
        // With only d1 set, the chain advances linearly and corrections vanish when
        // the actual rate equals d1.
        let mut chain = GearChain::default();
        chain.resize(1);
        chain.d1[0] = Vec3::new(0.1, 0., 0.);

        let advance = chain.predict(0);
        assert!((advance.x - 0.1).abs() < 1e-15);

        let corr = chain.correct(0, Vec3::new(0.1, 0., 0.));
        assert!(corr.magnitude() < 1e-15);
    }

    #[test]
    fn nph_mode_toggle_clears_enthalpy_target() {
        let mut nph = GearNphState::new(1.0);
        nph.enthalpy_target = 5.;
        nph.set_isothermal_mode(true);
        assert!(nph.isothermal_mode());

        nph.set_isothermal_mode(false);
        assert!(nph.enthalpy_target.is_nan());
    }
}
