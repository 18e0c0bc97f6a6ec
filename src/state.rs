// src/state.rs
//
// Simulation state snapshots.
//
// A state is built through `StateBuilder` and becomes immutable once fixed
// (`Arc<SimState>`). The only thing that may still change afterwards is the
// derived-data map, which is write-once per key.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, SimError};
use crate::grid::Mesh;
use crate::vec3::normalize;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// Derived-data keys written by the evolver. Kernel keys are prefixed by the
/// kernel instance name, see `ExchangeKernel::max_angle_key`.
pub mod keys {
    pub const MAX_DM_DT: &str = "Max dm/dt";
    pub const DE_DT: &str = "dE/dt";
    pub const DELTA_E: &str = "Delta E";
    pub const PE_PT: &str = "pE/pt";
    pub const TIMESTEP_LOWER_BOUND: &str = "Timestep lower bound";
    pub const MAX_SPIN_ANGLE: &str = "Max Spin Angle";
    pub const STAGE_MAX_SPIN_ANGLE: &str = "Stage Max Spin Angle";
    pub const RUN_MAX_SPIN_ANGLE: &str = "Run Max Spin Angle";
}

/// Named scalars attached to a fixed state.
#[derive(Debug, Default)]
pub struct DerivedData {
    values: Mutex<BTreeMap<String, f64>>,
}

impl DerivedData {
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.lock().get(key).copied()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    /// Set `key` once. Re-setting the identical value is a no-op; a different
    /// value is a programming error.
    pub fn set(&self, key: &str, value: f64) -> Result<()> {
        let mut values = self.values.lock();
        match values.get(key) {
            Some(&existing) if existing == value || (existing.is_nan() && value.is_nan()) => {
                Ok(())
            }
            Some(&existing) => Err(SimError::DerivedDataConflict {
                key: key.to_string(),
                existing,
                new: value,
            }),
            None => {
                values.insert(key.to_string(), value);
                Ok(())
            }
        }
    }

    /// Set only if absent; returns the value now stored.
    pub fn get_or_set(&self, key: &str, value: f64) -> f64 {
        *self.values.lock().entry(key.to_string()).or_insert(value)
    }

    pub fn snapshot(&self) -> BTreeMap<String, f64> {
        self.values.lock().clone()
    }
}

/// Sublattice role of a state.
#[derive(Clone)]
pub enum Lattice {
    /// Ordinary single-lattice simulation.
    Single,
    /// Sublattice 1 of a two-lattice simulation, coupled to `partner`.
    First { partner: Arc<SimState> },
    /// Sublattice 2 of a two-lattice simulation, coupled to `partner`.
    Second { partner: Arc<SimState> },
}

impl Lattice {
    pub fn partner(&self) -> Option<&Arc<SimState>> {
        match self {
            Lattice::Single => None,
            Lattice::First { partner } | Lattice::Second { partner } => Some(partner),
        }
    }
}

impl fmt::Debug for Lattice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lattice::Single => write!(f, "Single"),
            Lattice::First { partner } => write!(f, "First(partner={})", partner.id()),
            Lattice::Second { partner } => write!(f, "Second(partner={})", partner.id()),
        }
    }
}

/// Fixed (read-only) simulation state.
#[derive(Debug)]
pub struct SimState {
    id: u64,
    previous_id: Option<u64>,
    mesh: Arc<dyn Mesh>,
    spin: Vec<[f64; 3]>,
    ms: Arc<Vec<f64>>,
    ms_inverse: Arc<Vec<f64>>,
    iteration_count: u64,
    stage_number: u32,
    stage_iteration_count: u64,
    stage_start_time: f64,
    stage_elapsed_time: f64,
    last_timestep: f64,
    lattice: Lattice,
    derived: DerivedData,
}

impl SimState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn previous_id(&self) -> Option<u64> {
        self.previous_id
    }

    pub fn mesh(&self) -> &Arc<dyn Mesh> {
        &self.mesh
    }

    pub fn spin(&self) -> &[[f64; 3]] {
        &self.spin
    }

    pub fn ms(&self) -> &[f64] {
        &self.ms
    }

    pub fn ms_inverse(&self) -> &[f64] {
        &self.ms_inverse
    }

    pub fn iteration_count(&self) -> u64 {
        self.iteration_count
    }

    pub fn stage_number(&self) -> u32 {
        self.stage_number
    }

    pub fn stage_iteration_count(&self) -> u64 {
        self.stage_iteration_count
    }

    pub fn stage_start_time(&self) -> f64 {
        self.stage_start_time
    }

    pub fn stage_elapsed_time(&self) -> f64 {
        self.stage_elapsed_time
    }

    pub fn total_time(&self) -> f64 {
        self.stage_start_time + self.stage_elapsed_time
    }

    pub fn last_timestep(&self) -> f64 {
        self.last_timestep
    }

    pub fn lattice(&self) -> &Lattice {
        &self.lattice
    }

    pub fn derived(&self) -> &DerivedData {
        &self.derived
    }

    pub fn n_cells(&self) -> usize {
        self.spin.len()
    }
}

/// State under write-construction.
pub struct StateBuilder {
    previous_id: Option<u64>,
    mesh: Arc<dyn Mesh>,
    pub spin: Vec<[f64; 3]>,
    ms: Arc<Vec<f64>>,
    ms_inverse: Arc<Vec<f64>>,
    pub iteration_count: u64,
    pub stage_number: u32,
    pub stage_iteration_count: u64,
    pub stage_start_time: f64,
    pub stage_elapsed_time: f64,
    pub last_timestep: f64,
    pub lattice: Lattice,
}

impl StateBuilder {
    /// Fresh initial state, all spins along +z.
    /// `ms` holds the saturation magnetisation per cell (A/m); 0 marks vacuum.
    pub fn initial(mesh: Arc<dyn Mesh>, ms: Vec<f64>) -> Self {
        let n = mesh.n_cells();
        let ms_inverse: Vec<f64> = ms
            .iter()
            .map(|&m| if m == 0.0 { 0.0 } else { 1.0 / m })
            .collect();
        Self {
            previous_id: None,
            mesh,
            spin: vec![[0.0, 0.0, 1.0]; n],
            ms: Arc::new(ms),
            ms_inverse: Arc::new(ms_inverse),
            iteration_count: 0,
            stage_number: 0,
            stage_iteration_count: 0,
            stage_start_time: 0.0,
            stage_elapsed_time: 0.0,
            last_timestep: 0.0,
            lattice: Lattice::Single,
        }
    }

    /// Uniform Ms over every cell.
    pub fn uniform(mesh: Arc<dyn Mesh>, ms: f64) -> Self {
        let n = mesh.n_cells();
        Self::initial(mesh, vec![ms; n])
    }

    /// Successor of `prev`: same mesh, Ms and lattice role, counters copied.
    /// The caller advances counters and spins.
    pub fn successor(prev: &SimState) -> Self {
        Self {
            previous_id: Some(prev.id),
            mesh: Arc::clone(&prev.mesh),
            spin: prev.spin.clone(),
            ms: Arc::clone(&prev.ms),
            ms_inverse: Arc::clone(&prev.ms_inverse),
            iteration_count: prev.iteration_count,
            stage_number: prev.stage_number,
            stage_iteration_count: prev.stage_iteration_count,
            stage_start_time: prev.stage_start_time,
            stage_elapsed_time: prev.stage_elapsed_time,
            last_timestep: prev.last_timestep,
            lattice: prev.lattice.clone(),
        }
    }

    pub fn mesh(&self) -> &Arc<dyn Mesh> {
        &self.mesh
    }

    pub fn with_lattice(mut self, lattice: Lattice) -> Self {
        self.lattice = lattice;
        self
    }

    /// Set all cells to the same direction (normalised).
    pub fn set_uniform(&mut self, mx: f64, my: f64, mz: f64) {
        let v = normalize([mx, my, mz]);
        for cell in &mut self.spin {
            *cell = v;
        }
    }

    /// 180° Bloch wall along x: m rotates in the x-z plane.
    ///
    /// - `x0`   : wall centre (metres)
    /// - `width`: characteristic wall width
    pub fn init_bloch_wall(&mut self, x0: f64, width: f64) {
        for idx in 0..self.spin.len() {
            let x = self.mesh.center(idx)[0];
            let u = (x - x0) / width;
            let mz = u.tanh();
            let mx = 1.0 / u.cosh();
            self.spin[idx] = normalize([mx, 0.0, mz]);
        }
    }

    /// Validate sizes and freeze.
    pub fn fix(self) -> Result<Arc<SimState>> {
        let n = self.mesh.n_cells();
        if self.spin.len() != n || self.ms.len() != n {
            return Err(SimError::Consistency(format!(
                "state size mismatch: mesh has {} cells, spin {}, Ms {}",
                n,
                self.spin.len(),
                self.ms.len()
            )));
        }
        if let Some(partner) = self.lattice.partner() {
            if partner.mesh.id() != self.mesh.id() {
                return Err(SimError::Consistency(format!(
                    "sublattice partner uses mesh {} but this state uses mesh {}",
                    partner.mesh.id(),
                    self.mesh.id()
                )));
            }
        }
        Ok(Arc::new(SimState {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            previous_id: self.previous_id,
            mesh: self.mesh,
            spin: self.spin,
            ms: self.ms,
            ms_inverse: self.ms_inverse,
            iteration_count: self.iteration_count,
            stage_number: self.stage_number,
            stage_iteration_count: self.stage_iteration_count,
            stage_start_time: self.stage_start_time,
            stage_elapsed_time: self.stage_elapsed_time,
            last_timestep: self.last_timestep,
            lattice: self.lattice,
            derived: DerivedData::default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid3D;

    #[test]
    fn derived_data_is_write_once() {
        let d = DerivedData::default();
        d.set("x", 1.0).unwrap();
        d.set("x", 1.0).unwrap();
        let err = d.set("x", 2.0).unwrap_err();
        assert!(matches!(err, SimError::DerivedDataConflict { .. }));
        assert_eq!(d.get("x"), Some(1.0));
        assert_eq!(d.get_or_set("x", 5.0), 1.0);
        assert_eq!(d.get_or_set("y", 5.0), 5.0);
    }

    #[test]
    fn successor_links_previous_and_gets_new_id() {
        let mesh: Arc<dyn Mesh> = Arc::new(Grid3D::new(3, 1, 1, 1.0, 1.0, 1.0));
        let s0 = StateBuilder::uniform(mesh, 8e5).fix().unwrap();
        let mut b = StateBuilder::successor(&s0);
        b.iteration_count += 1;
        let s1 = b.fix().unwrap();
        assert_ne!(s0.id(), s1.id());
        assert_eq!(s1.previous_id(), Some(s0.id()));
        assert_eq!(s1.iteration_count(), 1);
        assert_eq!(s1.mesh().id(), s0.mesh().id());
    }

    #[test]
    fn vacuum_cells_have_zero_inverse() {
        let mesh: Arc<dyn Mesh> = Arc::new(Grid3D::new(2, 1, 1, 1.0, 1.0, 1.0));
        let s = StateBuilder::initial(mesh, vec![0.0, 2.0]).fix().unwrap();
        assert_eq!(s.ms_inverse(), &[0.0, 0.5]);
    }

    #[test]
    fn bloch_wall_has_opposite_mz_at_edges_and_unit_norm() {
        let nx = 64;
        let mesh: Arc<dyn Mesh> = Arc::new(Grid3D::new(nx, 1, 1, 1.0, 1.0, 1.0));
        let mut b = StateBuilder::uniform(mesh, 1.0);
        b.init_bloch_wall(0.5 * nx as f64, 5.0);
        let s = b.fix().unwrap();

        let left = s.spin()[0];
        let right = s.spin()[nx - 1];
        assert!(left[2] * right[2] < 0.0);
        for v in s.spin() {
            let norm = (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mesh: Arc<dyn Mesh> = Arc::new(Grid3D::new(2, 1, 1, 1.0, 1.0, 1.0));
        let mut b = StateBuilder::uniform(mesh, 1.0);
        b.spin.pop();
        assert!(matches!(b.fix(), Err(SimError::Consistency(_))));
    }
}
