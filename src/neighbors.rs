//! Cutoff-based neighbor lists, split into "up" (higher-index) and "down"
//! (lower-index) halves. The collision scheduler predicts each particle's next
//! collision against its up-neighbors, and walks down-neighbors when invalidating
//! predictions that referenced a just-perturbed particle.
//!
//! Rebuilds are triggered by accumulated displacement: if any particle moved more
//! than half the skin since the last rebuild, pairs may have entered the cutoff
//! unseen, so the lists are rebuilt.

use lin_alg::f64::Vec3;

use crate::state::SimState;

#[derive(Default)]
pub struct NeighborTable {
    /// For each particle, neighbors with a higher index, within cutoff + skin.
    pub up: Vec<Vec<usize>>,
    /// For each particle, neighbors with a lower index.
    pub down: Vec<Vec<usize>>,
    /// Reference positions at the last rebuild.
    ref_posits: Vec<Vec3>,
    cutoff: f64,
    skin: f64,
    half_skin_sq: f64,
    max_displacement_sq: f64,
    pub rebuild_count: usize,
}

impl NeighborTable {
    pub fn new(cutoff: f64, skin: f64) -> Self {
        Self {
            cutoff,
            skin,
            half_skin_sq: (skin * 0.5) * (skin * 0.5),
            ..Default::default()
        }
    }

    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Track the largest displacement since the last rebuild. Call once per step.
    pub fn update_max_displacement(&mut self, state: &SimState) {
        for (i, p) in state.particles.iter().enumerate() {
            if p.fixed {
                continue;
            }
            let dv = state.cell.min_image(p.posit - self.ref_posits[i]);
            self.max_displacement_sq = self.max_displacement_sq.max(dv.magnitude_squared());
        }
    }

    pub fn needs_rebuild(&self) -> bool {
        self.max_displacement_sq >= self.half_skin_sq
    }

    /// Rebuild both half-lists from scratch. The skin widens the capture radius so
    /// lists stay valid across several steps.
    pub fn rebuild(&mut self, state: &SimState) {
        let n = state.particles.len();
        let reach = self.cutoff + self.skin;
        let reach_sq = reach * reach;

        // Build the up half, counting degrees for the down half as we go.
        let mut up: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut down_deg = vec![0usize; n];

        for i in 0..n {
            let pi = state.particles[i].posit;
            for j in (i + 1)..n {
                let d = state.cell.min_image(pi - state.particles[j].posit);
                if d.magnitude_squared() < reach_sq {
                    up[i].push(j);
                    down_deg[j] += 1;
                }
            }
        }

        let mut down: Vec<Vec<usize>> = (0..n).map(|i| Vec::with_capacity(down_deg[i])).collect();
        for (i, ups) in up.iter().enumerate() {
            for &j in ups {
                down[j].push(i);
            }
        }

        self.up = up;
        self.down = down;

        self.ref_posits.clear();
        self.ref_posits
            .extend(state.particles.iter().map(|p| p.posit));
        self.max_displacement_sq = 0.0;
        self.rebuild_count += 1;
    }

    /// Rebuild if displacement warrants it. Returns true when a rebuild happened, so
    /// the collision scheduler can invalidate its predictions.
    pub fn rebuild_if_needed(&mut self, state: &SimState) -> bool {
        if self.up.len() != state.particles.len() || self.needs_rebuild() {
            self.rebuild(state);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use lin_alg::f64::Vec3;

    use super::*;
    use crate::{ambient::SimBox, state::Particle};

    fn line_state(n: usize, spacing: f64) -> SimState {
        let particles = (0..n)
            .map(|i| Particle::new(Vec3::new(i as f64 * spacing, 0., 0.), 1.))
            .collect();
        SimState::new(particles, SimBox::new_cube(n as f64 * spacing), 11)
    }

    #[test]
    fn up_down_are_mirrors() {
        let state = line_state(6, 1.0);
        let mut table = NeighborTable::new(1.5, 0.5);
        table.rebuild(&state);

        for (i, ups) in table.up.iter().enumerate() {
            for &j in ups {
                assert!(j > i);
                assert!(table.down[j].contains(&i));
            }
        }
    }

    #[test]
    fn rebuild_triggers_on_displacement() {
        let mut state = line_state(4, 2.0);
        let mut table = NeighborTable::new(1.5, 1.0);
        table.rebuild(&state);

        assert!(!table.rebuild_if_needed(&state));

        // Move one particle more than half the skin.
        state.particles[1].posit += Vec3::new(0.6, 0., 0.);
        table.update_max_displacement(&state);
        assert!(table.rebuild_if_needed(&state));
    }

    #[test]
    fn periodic_wraparound_pairs_found() {
        // First and last particle are adjacent through the boundary.
        let state = line_state(8, 1.0);
        let mut table = NeighborTable::new(1.2, 0.2);
        table.rebuild(&state);

        assert!(table.up[0].contains(&7));
    }
}
