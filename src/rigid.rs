//! Rigid-molecule integration: linear center-of-mass motion via half-kick/drift, and
//! rotational motion via an iterative implicit-midpoint update of the angular
//! momentum / orientation pair. The body-frame angular-velocity/momentum relation
//! depends on the orientation at the half-step, so the midpoint angular velocity is
//! found by fixed-point iteration.
//!
//! Molecules without orientation state fall back to free-particle velocity-Verlet for
//! their member atoms.

use lin_alg::f64::Vec3;

use crate::{
    listener::{MdListener, StepContext, fire_forces_computed, fire_forces_precomputed},
    potential::{PotentialForce, PotentialResult},
    state::SimState,
    verlet::wrap_all,
};

const DEFAULT_MAX_ITER: usize = 20;
const DEFAULT_TOL: f64 = 1.0e-10;

/// Orientation and angular state of one rigid molecule: the body axes expressed in
/// the lab frame, the principal (body-frame) moments of inertia, and the lab-frame
/// angular momentum.
#[derive(Clone, Debug)]
pub struct RigidOrientation {
    /// Orthonormal body axes in lab coordinates.
    pub axes: [Vec3; 3],
    /// Principal moments of inertia about the body axes.
    pub inertia_body: Vec3,
    /// Angular momentum, lab frame.
    pub ang_mom: Vec3,
}

/// One rigid molecule: member particle indices, their body-frame coordinates
/// relative to the center of mass, and optional orientation state.
#[derive(Clone, Debug)]
pub struct RigidMolecule {
    pub atoms: Vec<usize>,
    /// Member positions in the body frame. Indexed parallel to `atoms`.
    pub body_coords: Vec<Vec3>,
    /// None means the molecule is integrated as free particles.
    pub orientation: Option<RigidOrientation>,
}

/// Step state for the rigid-body integrator.
pub struct RigidState {
    pub molecules: Vec<RigidMolecule>,
    pub max_iter: usize,
    /// Relative tolerance on the change of the implied angular velocity between
    /// fixed-point iterations.
    pub tol: f64,
}

impl RigidState {
    pub fn new(molecules: Vec<RigidMolecule>) -> Self {
        Self {
            molecules,
            max_iter: DEFAULT_MAX_ITER,
            tol: DEFAULT_TOL,
        }
    }
}

/// Solve I · x = b for a 3×3 symmetric matrix given its six unique elements.
/// Returns None when the matrix is singular (practically: no rotation this step).
pub(crate) fn solve_symmetric3(
    ixx: f64,
    iyy: f64,
    izz: f64,
    ixy: f64,
    ixz: f64,
    iyz: f64,
    b: Vec3,
) -> Option<Vec3> {
    let det = ixx * (iyy * izz - iyz * iyz) - ixy * (ixy * izz - iyz * ixz)
        + ixz * (ixy * iyz - iyy * ixz);

    const TOL: f64 = 1.0e-12;
    if det.abs() < TOL {
        return None;
    }

    let inv_det = 1.0 / det;

    let inv00 = (iyy * izz - iyz * iyz) * inv_det;
    let inv01 = (ixz * iyz - ixy * izz) * inv_det;
    let inv02 = (ixy * iyz - ixz * iyy) * inv_det;
    let inv11 = (ixx * izz - ixz * ixz) * inv_det;
    let inv12 = (ixz * ixy - ixx * iyz) * inv_det;
    let inv22 = (ixx * iyy - ixy * ixy) * inv_det;

    Some(Vec3::new(
        inv00 * b.x + inv01 * b.y + inv02 * b.z,
        inv01 * b.x + inv11 * b.y + inv12 * b.z,
        inv02 * b.x + inv12 * b.y + inv22 * b.z,
    ))
}

/// Rotate vector r by angle θ = |ω| dt about axis n = ω/|ω|, with a series fallback
/// for tiny θ to avoid precision loss.
pub(crate) fn rodrigues_rotate(r: Vec3, omega: Vec3, dt: f64) -> Vec3 {
    let omega_dt = omega * dt;
    let theta = omega_dt.magnitude();

    if theta < 1e-12 {
        let wxr = omega_dt.cross(r);
        return r + wxr + omega_dt.cross(wxr) * 0.5;
    }

    let n = omega_dt / theta;
    let c = theta.cos();
    let s = theta.sin();

    r * c + n.cross(r) * s + n * (n.dot(r)) * (1.0 - c)
}

/// Angular velocity implied by an orientation and lab-frame angular momentum:
/// ω = A · I_body⁻¹ · Aᵀ · L, with A the body→lab axes.
fn angular_velocity(axes: &[Vec3; 3], inertia_body: Vec3, ang_mom: Vec3) -> Vec3 {
    let l_body = Vec3::new(
        axes[0].dot(ang_mom),
        axes[1].dot(ang_mom),
        axes[2].dot(ang_mom),
    );
    let w_body = Vec3::new(
        l_body.x / inertia_body.x,
        l_body.y / inertia_body.y,
        l_body.z / inertia_body.z,
    );
    axes[0] * w_body.x + axes[1] * w_body.y + axes[2] * w_body.z
}

/// Re-orthonormalize drifted axes (Gram-Schmidt); rotation composition accumulates
/// roundoff over long runs.
fn orthonormalize(axes: &mut [Vec3; 3]) {
    axes[0] = axes[0].to_normalized();
    axes[1] = (axes[1] - axes[0] * axes[0].dot(axes[1])).to_normalized();
    axes[2] = axes[0].cross(axes[1]);
}

struct MoleculeForces {
    force: Vec3,
    torque: Vec3,
    com: Vec3,
    mass: f64,
}

/// Net force, torque about the center of mass, COM, and total mass of a molecule.
/// The COM is accumulated relative to an anchor atom through minimum images, so a
/// molecule straddling the periodic boundary stays coherent.
fn gather_molecule_forces(mol: &RigidMolecule, state: &SimState, forces: &[Vec3]) -> MoleculeForces {
    let anchor = state.particles[mol.atoms[0]].posit;
    let mut mass = 0.0;
    let mut com_rel = Vec3::new_zero();
    for &i in &mol.atoms {
        let p = &state.particles[i];
        mass += p.mass;
        com_rel += state.cell.min_image(p.posit - anchor) * p.mass;
    }
    let com = anchor + com_rel / mass;

    let mut force = Vec3::new_zero();
    let mut torque = Vec3::new_zero();
    for &i in &mol.atoms {
        force += forces[i];
        let r = state.cell.min_image(state.particles[i].posit - com);
        torque += r.cross(forces[i]);
    }

    MoleculeForces {
        force,
        torque,
        com,
        mass,
    }
}

/// Iterative implicit-midpoint estimate of the midpoint angular velocity: the
/// half-step angular momentum is fixed, but the orientation it acts through is
/// itself advancing, so we iterate (bounded, with a tolerance on the relative change
/// of ω) until self-consistent.
fn midpoint_angular_velocity(
    orient: &RigidOrientation,
    l_half: Vec3,
    dt: f64,
    max_iter: usize,
    tol: f64,
) -> Vec3 {
    let mut omega = angular_velocity(&orient.axes, orient.inertia_body, l_half);
    let mut converged = false;

    for _ in 0..max_iter {
        // Orientation rotated to the half-step under the current ω estimate.
        let mid_axes = [
            rodrigues_rotate(orient.axes[0], omega, 0.5 * dt),
            rodrigues_rotate(orient.axes[1], omega, 0.5 * dt),
            rodrigues_rotate(orient.axes[2], omega, 0.5 * dt),
        ];
        let omega_new = angular_velocity(&mid_axes, orient.inertia_body, l_half);

        let diff = (omega_new - omega).magnitude();
        let scale = omega_new.magnitude().max(1e-30);
        omega = omega_new;

        if diff / scale < tol {
            converged = true;
            break;
        }
    }

    if !converged {
        eprintln!("Rigid-body midpoint iteration hit the cap; continuing with best estimate");
    }
    omega
}

/// Reconstruct member positions and velocities from the molecule frame.
fn place_members(mol: &RigidMolecule, state: &mut SimState, com: Vec3, v_com: Vec3, omega: Vec3) {
    let Some(orient) = &mol.orientation else {
        return;
    };

    for (k, &i) in mol.atoms.iter().enumerate() {
        let body = mol.body_coords[k];
        let r_rel =
            orient.axes[0] * body.x + orient.axes[1] * body.y + orient.axes[2] * body.z;

        let p = &mut state.particles[i];
        p.posit = com + r_rel;
        p.vel = v_com + omega.cross(r_rel);
    }
}

/// One rigid-body step: standard half-kick/drift for the linear motion, iterative
/// implicit midpoint for the rotation. Molecules without orientation state take
/// plain velocity-Verlet on their member atoms.
pub(crate) fn step_rigid(
    algo: &mut RigidState,
    state: &mut SimState,
    forces: &mut [Vec3],
    pot: &mut dyn PotentialForce,
    dt: f64,
    md_listeners: &mut [Box<dyn MdListener>],
    ctx: StepContext,
) -> PotentialResult {
    let dt_half = 0.5 * dt;

    // First half: kick momenta (linear and angular), drift COM, rotate.
    let mut com_vels: Vec<Vec3> = Vec::with_capacity(algo.molecules.len());

    for mol in &mut algo.molecules {
        let gathered = gather_molecule_forces(mol, state, forces);

        match &mut mol.orientation {
            Some(orient) => {
                // COM velocity from member velocities.
                let mut v_com = Vec3::new_zero();
                for &i in &mol.atoms {
                    let p = &state.particles[i];
                    v_com += p.vel * p.mass;
                }
                v_com /= gathered.mass;

                // Linear half-kick + drift.
                let v_new = v_com + gathered.force * (dt_half / gathered.mass);
                let com_new = gathered.com + v_new * dt;

                // Angular: predict L at the half-step from the torque, then iterate
                // the orientation-dependent ω.
                let l_half = orient.ang_mom + gathered.torque * dt_half;
                let omega = midpoint_angular_velocity(orient, l_half, dt, algo.max_iter, algo.tol);

                for axis in &mut orient.axes {
                    *axis = rodrigues_rotate(*axis, omega, dt);
                }
                orthonormalize(&mut orient.axes);
                orient.ang_mom = l_half;

                com_vels.push(v_new);
                place_members(mol, state, com_new, v_new, omega);
            }
            None => {
                // Non-rotating fallback: free-particle half-kick + drift.
                for &i in &mol.atoms {
                    let p = &mut state.particles[i];
                    if p.fixed {
                        continue;
                    }
                    p.vel += forces[i] * (dt_half / p.mass);
                    p.posit += p.vel * dt;
                }
                com_vels.push(Vec3::new_zero());
            }
        }
    }
    wrap_all(state);

    fire_forces_precomputed(md_listeners, state, ctx);
    let result = pot.compute_all(state, forces, true);
    fire_forces_computed(md_listeners, state, ctx);

    // Second half: closing kicks with the fresh forces/torques.
    for (m, mol) in algo.molecules.iter_mut().enumerate() {
        let gathered = gather_molecule_forces(mol, state, forces);

        match &mut mol.orientation {
            Some(orient) => {
                let v_new = com_vels[m] + gathered.force * (dt_half / gathered.mass);
                orient.ang_mom += gathered.torque * dt_half;

                let omega = angular_velocity(&orient.axes, orient.inertia_body, orient.ang_mom);
                place_members(mol, state, gathered.com, v_new, omega);
            }
            None => {
                for &i in &mol.atoms {
                    let p = &mut state.particles[i];
                    if p.fixed {
                        continue;
                    }
                    p.vel += forces[i] * (dt_half / p.mass);
                }
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solve_symmetric_identity() {
        let b = Vec3::new(1., 2., 3.);
        let x = solve_symmetric3(1., 1., 1., 0., 0., 0., b).unwrap();
        assert!((x - b).magnitude() < 1e-12);
    }

    #[test]
    fn rodrigues_quarter_turn() {
        let r = Vec3::new(1., 0., 0.);
        let omega = Vec3::new(0., 0., std::f64::consts::FRAC_PI_2);
        let rotated = rodrigues_rotate(r, omega, 1.0);
        assert!((rotated - Vec3::new(0., 1., 0.)).magnitude() < 1e-12);
    }

    #[test]
    fn principal_axis_spin_is_a_fixed_point() {
        // Spin about a principal axis: rotating the axes about ω leaves the
        // body-frame angular momentum unchanged, so the iteration lands exactly
        // on ω = L / I₃.
        let orient = RigidOrientation {
            axes: [
                Vec3::new(1., 0., 0.),
                Vec3::new(0., 1., 0.),
                Vec3::new(0., 0., 1.),
            ],
            inertia_body: Vec3::new(1., 1., 2.),
            ang_mom: Vec3::new(0., 0., 0.8),
        };

        let omega = midpoint_angular_velocity(&orient, orient.ang_mom, 0.01, 20, 1e-12);
        assert!((omega - Vec3::new(0., 0., 0.4)).magnitude() < 1e-12);
    }
}
