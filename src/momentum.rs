//! Momentum utilities shared by the MD integrators and thermostats: net-drift removal,
//! per-dimension velocity rescaling, and Maxwell-Boltzmann momentum randomization.
//! These are free functions over the particle slice, so every integrator variant and
//! the thermostat dispatch can reuse them without a shared superclass.

use lin_alg::f64::Vec3;
use rand::{Rng, rngs::StdRng};
use rand_distr::{ChiSquared, Distribution, StandardNormal};

use crate::ambient::BOLTZMANN_K;
use crate::state::Particle;

/// Bounded retry count when a dimension's kinetic energy is exactly zero but the
/// target is not; guards against dividing by zero on degenerate states without
/// risking an infinite loop.
const SCALE_RERANDOMIZE_RETRIES: usize = 10;

/// Remove center-of-mass drift: subtract the mass-weighted mean velocity so the net
/// momentum over mobile particles is zero.
pub fn shift_momenta(particles: &mut [Particle]) {
    let mut m_sum = 0.0;
    let mut p_sum = Vec3::new_zero(); // Σ m v

    for p in particles.iter() {
        if p.fixed {
            continue;
        }
        m_sum += p.mass;
        p_sum += p.vel * p.mass;
    }
    if m_sum <= 0.0 {
        return;
    }

    let v_cm = p_sum / m_sum;
    for p in particles.iter_mut() {
        if !p.fixed {
            p.vel -= v_cm;
        }
    }
}

/// Net momentum over mobile particles; diagnostic companion to `shift_momenta`.
pub fn net_momentum(particles: &[Particle]) -> Vec3 {
    let mut p_sum = Vec3::new_zero();
    for p in particles {
        if !p.fixed {
            p_sum += p.vel * p.mass;
        }
    }
    p_sum
}

/// Rescale velocities so the instantaneous kinetic temperature matches `temp` in each
/// Cartesian dimension separately. A dimension with exactly zero kinetic energy but a
/// non-zero target is re-randomized from scratch (bounded retries) rather than
/// dividing by zero.
pub fn scale_momenta(particles: &mut [Particle], temp: f64, rng: &mut StdRng) {
    let n_mobile = particles.iter().filter(|p| !p.fixed).count();
    if n_mobile == 0 {
        return;
    }

    for dim in 0..3 {
        let mut scaled = false;

        for _ in 0..SCALE_RERANDOMIZE_RETRIES {
            let mut ke_dim = 0.0;
            for p in particles.iter() {
                if !p.fixed {
                    let v = component(p.vel, dim);
                    ke_dim += 0.5 * p.mass * v * v;
                }
            }

            // Target: (1/2) N k T per dimension.
            let ke_target = 0.5 * n_mobile as f64 * BOLTZMANN_K * temp;

            if ke_dim > 0.0 {
                let s = (ke_target / ke_dim).sqrt();
                for p in particles.iter_mut() {
                    if !p.fixed {
                        let scaled_v = component(p.vel, dim) * s;
                        set_component(&mut p.vel, dim, scaled_v);
                    }
                }
                scaled = true;
                break;
            }

            if ke_target == 0.0 {
                scaled = true;
                break;
            }

            // Degenerate: every velocity component in this dimension is zero.
            // Re-draw the dimension and try again.
            for p in particles.iter_mut() {
                if !p.fixed {
                    let sigma = (BOLTZMANN_K * temp / p.mass).sqrt();
                    let n: f64 = rng.sample(StandardNormal);
                    set_component(&mut p.vel, dim, sigma * n);
                }
            }
        }

        if !scaled {
            eprintln!("Velocity rescale: dimension {dim} stayed at zero kinetic energy");
        }
    }
}

/// Draw every mobile particle's momentum fresh from Maxwell-Boltzmann at `temp`,
/// independently per particle and Cartesian component.
pub fn randomize_momenta(particles: &mut [Particle], temp: f64, rng: &mut StdRng) {
    for p in particles.iter_mut() {
        if p.fixed {
            continue;
        }
        let sigma = (BOLTZMANN_K * temp / p.mass).sqrt();
        let nx: f64 = rng.sample(StandardNormal);
        let ny: f64 = rng.sample(StandardNormal);
        let nz: f64 = rng.sample(StandardNormal);
        p.vel = Vec3::new(sigma * nx, sigma * ny, sigma * nz);
    }
}

/// Resample one particle's momentum. The caller picks the index (it must not be a
/// fixed particle) and is responsible for any incremental kinetic-energy adjustment.
pub fn randomize_momentum(particles: &mut [Particle], i: usize, temp: f64, rng: &mut StdRng) {
    let p = &mut particles[i];
    debug_assert!(!p.fixed);

    let sigma = (BOLTZMANN_K * temp / p.mass).sqrt();
    let nx: f64 = rng.sample(StandardNormal);
    let ny: f64 = rng.sample(StandardNormal);
    let nz: f64 = rng.sample(StandardNormal);
    p.vel = Vec3::new(sigma * nx, sigma * ny, sigma * nz);
}

/// Andersen total-KE scaling: draw per-dimension kinetic energies from the
/// Maxwell-Boltzmann chi-squared distribution, then scale current velocities so the
/// instantaneous values match the draws exactly (not merely on average). Scaling is
/// performed about zero drift; unless `no_drift`, a fresh center-of-mass velocity is
/// then drawn for the system as a whole.
pub fn randomize_total_kinetic_energy(
    particles: &mut [Particle],
    temp: f64,
    no_drift: bool,
    rng: &mut StdRng,
) {
    let mut m_sum = 0.0;
    let mut n_mobile = 0usize;
    for p in particles.iter() {
        if !p.fixed {
            m_sum += p.mass;
            n_mobile += 1;
        }
    }
    if n_mobile == 0 {
        return;
    }

    shift_momenta(particles);

    // One internal degree of freedom per dimension is consumed by the zeroed drift.
    let dof_per_dim = (n_mobile - 1).max(1) as f64;
    let chi2 = ChiSquared::new(dof_per_dim).expect("chi-squared dof must be positive");

    for dim in 0..3 {
        let mut ke_dim = 0.0;
        for p in particles.iter() {
            if !p.fixed {
                let v = component(p.vel, dim);
                ke_dim += 0.5 * p.mass * v * v;
            }
        }

        // K_target = (kT/2) χ²_{dof}
        let ke_target = 0.5 * BOLTZMANN_K * temp * chi2.sample(rng);

        if ke_dim > 0.0 {
            let s = (ke_target / ke_dim).sqrt();
            for p in particles.iter_mut() {
                if !p.fixed {
                    let scaled_v = component(p.vel, dim) * s;
                    set_component(&mut p.vel, dim, scaled_v);
                }
            }
        } else if ke_target > 0.0 {
            // Nothing to scale; seed the dimension directly, then rescale to the draw.
            for p in particles.iter_mut() {
                if !p.fixed {
                    let sigma = (BOLTZMANN_K * temp / p.mass).sqrt();
                    let n: f64 = rng.sample(StandardNormal);
                    set_component(&mut p.vel, dim, sigma * n);
                }
            }
            let mut ke_new = 0.0;
            for p in particles.iter() {
                if !p.fixed {
                    let v = component(p.vel, dim);
                    ke_new += 0.5 * p.mass * v * v;
                }
            }
            if ke_new > 0.0 {
                let s = (ke_target / ke_new).sqrt();
                for p in particles.iter_mut() {
                    if !p.fixed {
                        let scaled_v = component(p.vel, dim) * s;
                        set_component(&mut p.vel, dim, scaled_v);
                    }
                }
            }
        }
    }

    if !no_drift {
        // Center-of-mass velocity for the whole system, Maxwell-Boltzmann at the
        // total mass.
        let sigma = (BOLTZMANN_K * temp / m_sum).sqrt();
        let nx: f64 = rng.sample(StandardNormal);
        let ny: f64 = rng.sample(StandardNormal);
        let nz: f64 = rng.sample(StandardNormal);
        let v_drift = Vec3::new(sigma * nx, sigma * ny, sigma * nz);
        for p in particles.iter_mut() {
            if !p.fixed {
                p.vel += v_drift;
            }
        }
    }
}

/// Remove rigid-body rotation about the center of mass: compute ω from I ω = L, then
/// set v' = v − ω × (r − r_cm). Cleans up any translation introduced by roundoff
/// afterward.
pub fn zero_angular_momentum(particles: &mut [Particle]) {
    let mut m_sum = 0.0;
    let mut m_r_sum = Vec3::new_zero();
    for p in particles.iter() {
        if p.fixed {
            continue;
        }
        m_sum += p.mass;
        m_r_sum += p.posit * p.mass;
    }
    if m_sum <= 0.0 {
        return;
    }
    let r_cm = m_r_sum / m_sum;

    // Inertia tensor and angular momentum about r_cm
    let mut i_xx = 0.0;
    let mut i_xy = 0.0;
    let mut i_xz = 0.0;
    let mut i_yy = 0.0;
    let mut i_yz = 0.0;
    let mut i_zz = 0.0;
    let mut ang = Vec3::new_zero();

    for p in particles.iter() {
        if p.fixed {
            continue;
        }
        let m = p.mass;
        let r = p.posit - r_cm;
        ang += r.cross(p.vel) * m;

        let r2 = r.magnitude_squared();
        i_xx += m * (r2 - r.x * r.x);
        i_yy += m * (r2 - r.y * r.y);
        i_zz += m * (r2 - r.z * r.z);
        i_xy -= m * r.x * r.y;
        i_xz -= m * r.x * r.z;
        i_yz -= m * r.y * r.z;
    }

    // Tiny Tikhonov term for degenerate (e.g. collinear) configurations.
    let eps = 1.0e-9;
    let omega = match crate::rigid::solve_symmetric3(
        i_xx + eps,
        i_yy + eps,
        i_zz + eps,
        i_xy,
        i_xz,
        i_yz,
        ang,
    ) {
        Some(w) => w,
        None => return,
    };

    if !omega.x.is_finite() || !omega.y.is_finite() || !omega.z.is_finite() {
        return;
    }
    if omega.magnitude_squared() < 1e-18 {
        return;
    }

    for p in particles.iter_mut() {
        if p.fixed {
            continue;
        }
        let r = p.posit - r_cm;
        p.vel -= omega.cross(r);
    }

    shift_momenta(particles);
}

fn component(v: Vec3, dim: usize) -> f64 {
    match dim {
        0 => v.x,
        1 => v.y,
        _ => v.z,
    }
}

fn set_component(v: &mut Vec3, dim: usize, value: f64) {
    match dim {
        0 => v.x = value,
        1 => v.y = value,
        _ => v.z = value,
    }
}

#[cfg(test)]
mod tests {
    use lin_alg::f64::Vec3;
    use rand::SeedableRng;

    use super::*;

    fn particles(n: usize) -> Vec<Particle> {
        (0..n)
            .map(|i| {
                let mut p = Particle::new(Vec3::new(i as f64, (i % 3) as f64, 0.), 1. + i as f64 * 0.1);
                p.vel = Vec3::new(0.1 * i as f64, -0.2, 0.05 * i as f64);
                p
            })
            .collect()
    }

    #[test]
    fn shift_momenta_zeroes_net_momentum() {
        let mut ps = particles(17);
        shift_momenta(&mut ps);
        let p = net_momentum(&ps);
        assert!(p.magnitude() < 1e-10, "residual momentum {p:?}");
    }

    #[test]
    fn scale_momenta_hits_target_per_dimension() {
        let mut ps = particles(50);
        let mut rng = StdRng::seed_from_u64(3);
        scale_momenta(&mut ps, 2.0, &mut rng);

        let n = ps.len() as f64;
        for dim in 0..3 {
            let mut ke = 0.0;
            for p in &ps {
                let v = component(p.vel, dim);
                ke += 0.5 * p.mass * v * v;
            }
            let t_dim = 2.0 * ke / n;
            assert!((t_dim - 2.0).abs() < 1e-9, "dim {dim}: T = {t_dim}");
        }
    }

    #[test]
    fn scale_momenta_rerandomizes_zero_dimension() {
        let mut ps = particles(10);
        for p in &mut ps {
            p.vel.z = 0.;
        }
        let mut rng = StdRng::seed_from_u64(4);
        scale_momenta(&mut ps, 1.0, &mut rng);

        let mut ke_z = 0.0;
        for p in &ps {
            ke_z += 0.5 * p.mass * p.vel.z * p.vel.z;
        }
        assert!(ke_z > 0.0);
    }

    #[test]
    fn zero_angular_momentum_removes_rotation() {
        let mut ps = particles(20);
        zero_angular_momentum(&mut ps);

        let mut m_sum = 0.0;
        let mut m_r = Vec3::new_zero();
        for p in &ps {
            m_sum += p.mass;
            m_r += p.posit * p.mass;
        }
        let r_cm = m_r / m_sum;

        let mut ang = Vec3::new_zero();
        for p in &ps {
            ang += (p.posit - r_cm).cross(p.vel) * p.mass;
        }
        assert!(ang.magnitude() < 1e-8, "residual L {ang:?}");
    }

    #[test]
    fn total_ke_randomization_zero_drift() {
        let mut ps = particles(40);
        let mut rng = StdRng::seed_from_u64(5);
        randomize_total_kinetic_energy(&mut ps, 1.3, true, &mut rng);
        assert!(net_momentum(&ps).magnitude() < 1e-9);
    }
}
