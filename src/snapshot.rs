//! Snapshots (trajectory frames) of integrator runs: positions, velocities, and the
//! energy bookkeeping at a step. A set of these represents the output of a run and
//! can be played back or analyzed offline.

#[cfg(feature = "encode")]
use std::{
    fs::File,
    io::{self, Read, Write},
    path::Path,
};

#[cfg(feature = "encode")]
use bincode::{Decode, Encode};
use lin_alg::f64::Vec3;

use crate::state::SimState;

/// When and how often to record. Multiple handlers with different ratios may be
/// attached to one integrator.
#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Debug, PartialEq)]
pub struct SnapshotHandler {
    /// Record every this many steps.
    pub ratio: u64,
}

impl Default for SnapshotHandler {
    fn default() -> Self {
        Self { ratio: 1 }
    }
}

/// One recorded frame.
#[cfg_attr(feature = "encode", derive(Encode, Decode))]
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Simulated time, in reduced units.
    pub time: f64,
    pub posits: Vec<Vec3>,
    pub velocities: Vec<Vec3>,
    pub energy_kinetic: f64,
    pub energy_potential: f64,
    /// Instantaneous kinetic temperature, energy units.
    pub temperature: f64,
}

impl Snapshot {
    pub fn take(state: &SimState, time: f64, energy_kinetic: f64, energy_potential: f64) -> Self {
        Self {
            time,
            posits: state.particles.iter().map(|p| p.posit).collect(),
            velocities: state.particles.iter().map(|p| p.vel).collect(),
            energy_kinetic,
            energy_potential,
            temperature: state.temperature(),
        }
    }

    pub fn total_energy(&self) -> f64 {
        self.energy_kinetic + self.energy_potential
    }
}

/// True when any handler's ratio divides the step count; the caller then records one
/// frame regardless of how many handlers matched.
pub(crate) fn snapshot_due(handlers: &[SnapshotHandler], step_count: u64) -> bool {
    handlers
        .iter()
        .any(|h| h.ratio != 0 && step_count.is_multiple_of(h.ratio))
}

#[cfg(feature = "encode")]
pub fn save_snapshots(snapshots: &[Snapshot], path: &Path) -> io::Result<()> {
    let config = bincode::config::standard();
    let bytes = bincode::encode_to_vec(snapshots, config)
        .map_err(|e| io::Error::other(format!("Error encoding snapshots: {e}")))?;

    let mut file = File::create(path)?;
    file.write_all(&bytes)?;
    Ok(())
}

#[cfg(feature = "encode")]
pub fn load_snapshots(path: &Path) -> io::Result<Vec<Snapshot>> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;

    let config = bincode::config::standard();
    let (snapshots, _) = bincode::decode_from_slice(&bytes, config)
        .map_err(|e| io::Error::other(format!("Error decoding snapshots: {e}")))?;
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_on_any_handler() {
        let handlers = vec![SnapshotHandler { ratio: 4 }, SnapshotHandler { ratio: 6 }];
        assert!(snapshot_due(&handlers, 4));
        assert!(snapshot_due(&handlers, 6));
        assert!(snapshot_due(&handlers, 12));
        assert!(!snapshot_due(&handlers, 5));
    }
}
