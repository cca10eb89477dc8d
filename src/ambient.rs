//! The simulation box: a rectangular prism which wraps at each face, indefinitely.
//! We use the concept of a "minimum image" to find the closest copy of an item to a
//! given site, among all tiled boxes.
//!
//! Note: All integrator and thermostat math in this crate is f64.

use lin_alg::f64::Vec3;

use crate::state::Particle;

/// Boltzmann constant in reduced simulation units. Temperature is measured in energy
/// units throughout; we keep the named constant so unit-bearing formulas read normally.
pub const BOLTZMANN_K: f64 = 1.0;

/// How the box dimensions are established at construction.
#[derive(Debug, Clone, PartialEq)]
pub enum SimBoxInit {
    /// Distance from the box edge to the outermost particle, at init.
    Pad(f64),
    /// Coordinate boundaries, at opposite corners.
    Fixed((Vec3, Vec3)),
}

impl Default for SimBoxInit {
    fn default() -> Self {
        Self::Pad(3.)
    }
}

/// The periodic cell containing the particles of one box/ensemble.
#[derive(Clone, Copy, Default, PartialEq, Debug)]
pub struct SimBox {
    pub bounds_low: Vec3,
    pub bounds_high: Vec3,
    pub extent: Vec3,
}

impl SimBox {
    /// Set up to surround all particles with a pad, or with fixed dimensions.
    pub fn new(particles: &[Particle], box_type: &SimBoxInit) -> Self {
        match box_type {
            SimBoxInit::Pad(pad) => {
                let mut min = Vec3::new(f64::INFINITY, f64::INFINITY, f64::INFINITY);
                let mut max = Vec3::new(f64::NEG_INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
                for p in particles {
                    min = min.min(p.posit);
                    max = max.max(p.posit);
                }

                let bounds_low = min - Vec3::new(*pad, *pad, *pad);
                let bounds_high = max + Vec3::new(*pad, *pad, *pad);

                Self {
                    bounds_low,
                    bounds_high,
                    extent: bounds_high - bounds_low,
                }
            }
            SimBoxInit::Fixed((bounds_low, bounds_high)) => {
                let bounds_low: Vec3 = *bounds_low;
                let bounds_high: Vec3 = *bounds_high;
                Self {
                    bounds_low,
                    bounds_high,
                    extent: bounds_high - bounds_low,
                }
            }
        }
    }

    /// A cube of edge length `edge`, centered on the origin.
    pub fn new_cube(edge: f64) -> Self {
        let half = 0.5 * edge;
        let corner = Vec3::new(half, half, half);
        Self {
            bounds_low: corner * -1.,
            bounds_high: corner,
            extent: corner * 2.,
        }
    }

    /// Wrap an absolute coordinate back into the unit cell (orthorhombic).
    pub fn wrap(&self, p: Vec3) -> Vec3 {
        let ext = &self.extent;

        assert!(
            ext.x > 0.0 && ext.y > 0.0 && ext.z > 0.0,
            "SimBox edges must be > 0 (lo={:?}, hi={:?})",
            self.bounds_low,
            self.bounds_high
        );

        // rem_euclid keeps the value in [0, ext)
        Vec3::new(
            (p.x - self.bounds_low.x).rem_euclid(ext.x) + self.bounds_low.x,
            (p.y - self.bounds_low.y).rem_euclid(ext.y) + self.bounds_low.y,
            (p.z - self.bounds_low.z).rem_euclid(ext.z) + self.bounds_low.z,
        )
    }

    /// Minimum-image displacement vector: maps a displacement to the closest
    /// periodic image, so distance measurements use the shortest separation.
    pub fn min_image(&self, dv: Vec3) -> Vec3 {
        let ext = &self.extent;
        debug_assert!(ext.x > 0.0 && ext.y > 0.0 && ext.z > 0.0);

        Vec3::new(
            dv.x - (dv.x / ext.x).round() * ext.x,
            dv.y - (dv.y / ext.y).round() * ext.y,
            dv.z - (dv.z / ext.z).round() * ext.z,
        )
    }

    pub fn volume(&self) -> f64 {
        self.extent.x.abs() * self.extent.y.abs() * self.extent.z.abs()
    }

    pub fn center(&self) -> Vec3 {
        (self.bounds_low + self.bounds_high) * 0.5
    }

    /// The shortest edge; bounds the distance a particle can travel before it must
    /// re-examine its surroundings.
    pub fn min_extent(&self) -> f64 {
        self.extent.x.min(self.extent.y).min(self.extent.z)
    }

    /// Rescale the box about its center. `lambda` scales *lengths*, not volume.
    /// Used by the NPH integrator and volume-exchange Monte Carlo moves.
    pub fn scale_isotropic(&mut self, lambda: f64) {
        // Treat non-finite or tiny λ as a no-op.
        let lam = if lambda.is_finite() && lambda.abs() > 1.0e-12 {
            lambda
        } else {
            1.0
        };

        let c = self.center();
        let lo = c + (self.bounds_low - c) * lam;
        let hi = c + (self.bounds_high - c) * lam;

        // Enforce low <= high per component
        self.bounds_low = Vec3::new(lo.x.min(hi.x), lo.y.min(hi.y), lo.z.min(hi.z));
        self.bounds_high = Vec3::new(lo.x.max(hi.x), lo.y.max(hi.y), lo.z.max(hi.z));
        self.extent = self.bounds_high - self.bounds_low;

        debug_assert!({
            let ext = &self.extent;
            ext.x > 0.0 && ext.y > 0.0 && ext.z > 0.0
        });
    }
}

/// Instantaneous pressure from the virial route: P = (2K + W) / (3V).
pub fn measure_pressure(kinetic_energy: f64, simbox: &SimBox, virial_total: f64) -> f64 {
    let v = simbox.volume();
    (2.0 * kinetic_energy + virial_total) / (3.0 * v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_stays_in_bounds() {
        let cell = SimBox::new_cube(4.);
        let p = cell.wrap(Vec3::new(5.3, -7.1, 0.2));
        for v in [p.x, p.y, p.z] {
            assert!(v >= -2.0 && v < 2.0);
        }
    }

    #[test]
    fn min_image_shortest() {
        let cell = SimBox::new_cube(10.);
        let dv = cell.min_image(Vec3::new(9., 0., 0.));
        assert!((dv.x - -1.0).abs() < 1e-12);
    }

    #[test]
    fn scale_preserves_center() {
        let mut cell = SimBox::new_cube(10.);
        let c0 = cell.center();
        cell.scale_isotropic(1.1);
        let c1 = cell.center();
        assert!((c0 - c1).magnitude() < 1e-12);
        assert!((cell.volume() - 10f64.powi(3) * 1.1f64.powi(3)).abs() < 1e-9);
    }
}
