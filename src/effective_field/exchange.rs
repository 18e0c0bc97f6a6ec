// src/effective_field/exchange.rs
//
// Six-neighbour exchange on a rectangular mesh.
//
// For cell i with 1/Ms_i != 0:
//   sum_i = Σ_j  (-1/h_axis²) · A(r_i, r_j) · (m_j - m_i)        (j: ±x, ±y, ±z)
//   e_i   = m_i · sum_i                                          (J/m^3)
//   H_i   = (-2/μ0) · (1/Ms_i) · sum_i                           (A/m)
//   T_i   = m_i × H_i
// Neighbours wrap on periodic axes and are omitted at open boundaries;
// vacuum neighbours (1/Ms = 0) contribute nothing.
//
// Two-lattice states additionally couple on-site to their partner sublattice
// through the cross-lattice table: sum_i += -(A12(r_i, r_i)/h_min²)·(m'_i - m_i).
//
// Evaluation is split into contiguous chunks run on the rayon pool. Chunks
// only read the state; the one shared mutable thing is the region map, which
// `RegionCache` rebuilds once per mesh/atlas change.

use std::f64::consts::PI;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use crate::atlas::Atlas;
use crate::coefficients::{CoefficientKind, CoefficientMatrix, ExchangeCoefficients};
use crate::effective_field::{EnergyEval, EnergyTerm};
use crate::error::{Result, SimError};
use crate::grid::Mesh;
use crate::params::{EPS, MU0};
use crate::region_cache::RegionCache;
use crate::state::{keys, Lattice, SimState};
use crate::vec3::{add, add_scaled, cross, dot, mag_sq, scale, sub};

const DEFAULT_CHUNK: usize = 4096;

/// Per-chunk reduction data.
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeStats {
    /// max |m_j - m_i|² over evaluated neighbour pairs.
    pub max_dot: f64,
    /// Σ e_i over the range (J/m^3, not volume weighted).
    pub energy_sum: f64,
}

/// Full-state exchange output.
#[derive(Debug, Clone)]
pub struct ExchangeOutput {
    pub energy: Vec<f64>,
    pub field: Vec<[f64; 3]>,
    pub torque: Vec<[f64; 3]>,
    pub total_energy: f64,
    pub max_dot: f64,
    /// Max spin angle (deg) for this state.
    pub max_angle: f64,
}

/// Mutable output slices for one range.
pub struct RangeOut<'a> {
    pub energy: &'a mut [f64],
    pub field: &'a mut [[f64; 3]],
    pub torque: &'a mut [[f64; 3]],
}

/// Self/cross tables and partner selected by the state's lattice role.
struct LatticeView<'a> {
    own: &'a CoefficientMatrix,
    partner: Option<(&'a SimState, &'a CoefficientMatrix)>,
}

pub struct ExchangeKernel {
    name: String,
    atlas: Arc<dyn Atlas>,
    coefficients: ExchangeCoefficients,
    regions: RegionCache,
    chunk: usize,
    volume_checked_mesh: AtomicU64,
}

impl ExchangeKernel {
    /// Fails with `NonUniformVolume` if `mesh` cells differ in volume.
    pub fn new(
        name: impl Into<String>,
        atlas: Arc<dyn Atlas>,
        coefficients: ExchangeCoefficients,
        mesh: &dyn Mesh,
    ) -> Result<Self> {
        let regions = atlas.region_count();
        let tables = [
            ("lattice 1", Some(&coefficients.lattice1)),
            ("lattice 2", coefficients.lattice2.as_ref()),
            ("cross-lattice", coefficients.cross.as_ref()),
        ];
        for (channel, table) in tables {
            if let Some(m) = table.filter(|m| m.size() != regions) {
                return Err(SimError::Config(format!(
                    "{} coefficient table covers {} regions but atlas \"{}\" has {}",
                    channel,
                    m.size(),
                    atlas.name(),
                    regions
                )));
            }
        }
        check_uniform_volume(mesh)?;
        Ok(Self {
            name: name.into(),
            atlas,
            coefficients,
            regions: RegionCache::new(),
            chunk: DEFAULT_CHUNK,
            volume_checked_mesh: AtomicU64::new(mesh.id()),
        })
    }

    /// Cells per parallel work item.
    pub fn with_chunk_size(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    pub fn coefficients(&self) -> &ExchangeCoefficients {
        &self.coefficients
    }

    pub fn region_cache(&self) -> &RegionCache {
        &self.regions
    }

    pub fn max_angle_key(&self) -> String {
        format!("{}:{}", self.name, keys::MAX_SPIN_ANGLE)
    }

    pub fn stage_max_angle_key(&self) -> String {
        format!("{}:{}", self.name, keys::STAGE_MAX_SPIN_ANGLE)
    }

    pub fn run_max_angle_key(&self) -> String {
        format!("{}:{}", self.name, keys::RUN_MAX_SPIN_ANGLE)
    }

    fn lattice_view<'a>(&'a self, state: &'a SimState) -> Result<LatticeView<'a>> {
        let cross_table = |partner: &'a Arc<SimState>| {
            self.coefficients
                .cross
                .as_ref()
                .map(|m| (partner.as_ref(), m))
        };
        match state.lattice() {
            Lattice::Single => Ok(LatticeView {
                own: &self.coefficients.lattice1,
                partner: None,
            }),
            Lattice::First { partner } => Ok(LatticeView {
                own: &self.coefficients.lattice1,
                partner: cross_table(partner),
            }),
            Lattice::Second { partner } => {
                let own = self.coefficients.lattice2.as_ref().ok_or_else(|| {
                    SimError::Config(format!(
                        "exchange \"{}\": lattice-2 state but no lattice-2 coefficients",
                        self.name
                    ))
                })?;
                Ok(LatticeView {
                    own,
                    partner: cross_table(partner),
                })
            }
        }
    }

    /// Pair coefficient as an exchange stiffness (J/m).
    #[inline]
    fn stiffness(&self, raw: f64, ms_i: f64, ms_j: f64) -> f64 {
        match self.coefficients.kind {
            CoefficientKind::A => raw,
            CoefficientKind::Lex => 0.5 * MU0 * raw * raw * ms_i * ms_j,
        }
    }

    fn ensure_volume_checked(&self, mesh: &dyn Mesh) -> Result<()> {
        let id = mesh.id();
        if self.volume_checked_mesh.load(Ordering::Acquire) != id {
            check_uniform_volume(mesh)?;
            self.volume_checked_mesh.store(id, Ordering::Release);
        }
        Ok(())
    }

    /// Evaluate cells `range` of `state` into `out` (slices of range length).
    /// Safe to call concurrently on disjoint ranges of the same state.
    pub fn evaluate_range(
        &self,
        state: &SimState,
        range: Range<usize>,
        out: RangeOut<'_>,
    ) -> Result<RangeStats> {
        let n = state.n_cells();
        if range.end > n || range.start > range.end {
            return Err(SimError::Consistency(format!(
                "invalid cell range {:?} for {} cells",
                range, n
            )));
        }
        let len = range.end - range.start;
        if out.energy.len() != len || out.field.len() != len || out.torque.len() != len {
            return Err(SimError::Consistency(
                "exchange output slices do not match range length".to_string(),
            ));
        }
        if len == 0 {
            return Ok(RangeStats::default());
        }

        let mesh = state.mesh().as_ref();
        let regions = self
            .regions
            .regions(mesh, self.atlas.as_ref(), self.coefficients.region_count())?;
        let view = self.lattice_view(state)?;

        let [nx, ny, nz] = mesh.dims();
        let dims = [nx, ny, nz];
        let strides = [1, nx, nx * ny];
        let periodic = mesh.periodic();
        let h = mesh.edge_lengths();
        let wgt = [-1.0 / (h[0] * h[0]), -1.0 / (h[1] * h[1]), -1.0 / (h[2] * h[2])];
        let h_min = h[0].min(h[1]).min(h[2]);
        let cross_wgt = -1.0 / (h_min * h_min);
        let hcoef = -2.0 / MU0;

        let spin = state.spin();
        let ms = state.ms();
        let ms_inv = state.ms_inverse();

        let mut stats = RangeStats::default();

        for (k, i) in range.enumerate() {
            let msi_inv = ms_inv[i];
            if msi_inv == 0.0 {
                out.energy[k] = 0.0;
                out.field[k] = [0.0; 3];
                out.torque[k] = [0.0; 3];
                continue;
            }

            let base = spin[i];
            let row = view.own.row(regions[i]);
            let (x, y, z) = mesh.coords(i);
            let coord = [x, y, z];
            let mut sum = [0.0; 3];

            for axis in 0..3 {
                for dir in [-1i8, 1] {
                    let j = match neighbour(i, coord[axis], dims[axis], strides[axis], periodic[axis], dir) {
                        Some(j) => j,
                        None => continue,
                    };
                    if ms_inv[j] == 0.0 {
                        continue;
                    }
                    let a = self.stiffness(row[regions[j]], ms[i], ms[j]);
                    if a == 0.0 {
                        continue;
                    }
                    let diff = sub(spin[j], base);
                    let d2 = mag_sq(diff);
                    if d2 > stats.max_dot {
                        stats.max_dot = d2;
                    }
                    sum = add_scaled(sum, a * wgt[axis], diff);
                }
            }

            if let Some((partner, table)) = view.partner {
                let p_ms = partner.ms()[i];
                if partner.ms_inverse()[i] != 0.0 {
                    let a12 = self.stiffness(table.get(regions[i], regions[i]), ms[i], p_ms);
                    if a12 != 0.0 {
                        let diff = sub(partner.spin()[i], base);
                        sum = add_scaled(sum, a12 * cross_wgt, diff);
                    }
                }
            }

            let ei = dot(base, sum);
            let field = scale(hcoef * msi_inv, sum);
            stats.energy_sum += ei;
            out.energy[k] = ei;
            out.field[k] = field;
            out.torque[k] = cross(base, field);
        }

        Ok(stats)
    }

    /// Evaluate the whole state on the rayon pool and attach the max-angle
    /// derived data.
    pub fn evaluate(&self, state: &SimState, previous: Option<&SimState>) -> Result<ExchangeOutput> {
        let mesh = state.mesh().as_ref();
        self.ensure_volume_checked(mesh)?;

        let n = state.n_cells();
        let mut energy = vec![0.0; n];
        let mut field = vec![[0.0; 3]; n];
        let mut torque = vec![[0.0; 3]; n];
        let chunk = self.chunk;

        let stats: Vec<RangeStats> = energy
            .par_chunks_mut(chunk)
            .zip(field.par_chunks_mut(chunk))
            .zip(torque.par_chunks_mut(chunk))
            .enumerate()
            .map(|(c, ((e, f), t))| {
                let start = c * chunk;
                let range = start..start + e.len();
                self.evaluate_range(
                    state,
                    range,
                    RangeOut {
                        energy: e,
                        field: f,
                        torque: t,
                    },
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let max_dot = stats.iter().fold(0.0_f64, |acc, s| acc.max(s.max_dot));
        let energy_sum: f64 = stats.iter().map(|s| s.energy_sum).sum();
        let total_energy = if n > 0 { energy_sum * mesh.volume(0) } else { 0.0 };
        let max_angle = self.finalize(state, previous, max_dot)?;

        Ok(ExchangeOutput {
            energy,
            field,
            torque,
            total_energy,
            max_dot,
            max_angle,
        })
    }

    /// Reduce the chunk maxima into max/stage/run spin angle (deg) on `state`.
    ///
    /// If the max angle is already on the state it must agree with the new
    /// value; stage and run values are only added when absent.
    pub fn finalize(&self, state: &SimState, previous: Option<&SimState>, max_dot: f64) -> Result<f64> {
        let maxang = max_angle_from_dot(max_dot);
        let derived = state.derived();

        let msa = self.max_angle_key();
        match derived.get(&msa) {
            Some(orig) => {
                // Angles come from asin of a small difference; compare in
                // cos space, where nearly parallel spins are well conditioned.
                let diff = (orig - maxang) * (PI / 180.0);
                let mut sum = (orig + maxang) * (PI / 180.0);
                if sum > PI {
                    sum = 2.0 * PI - sum;
                }
                if (diff * sum).abs() > 8.0 * EPS {
                    return Err(SimError::Consistency(format!(
                        "exchange \"{}\" max spin angle set to two different values; orig val={:.17e}, new val={:.17e}",
                        self.name, orig, maxang
                    )));
                }
                debug!(
                    "exchange \"{}\": max spin angle recomputed for state {}",
                    self.name,
                    state.id()
                );
            }
            None => derived.set(&msa, maxang)?,
        }

        let smsa = self.stage_max_angle_key();
        let rmsa = self.run_max_angle_key();
        let mut stage_maxang = -1.0_f64;
        let mut run_maxang = -1.0_f64;
        if let Some(old) = previous.filter(|p| Some(p.id()) == state.previous_id()) {
            if old.stage_number() != state.stage_number() {
                stage_maxang = 0.0;
            } else if let Some(v) = old.derived().get(&smsa) {
                stage_maxang = v;
            }
            if let Some(v) = old.derived().get(&rmsa) {
                run_maxang = v;
            }
        }
        stage_maxang = stage_maxang.max(maxang);
        run_maxang = run_maxang.max(maxang);
        derived.get_or_set(&smsa, stage_maxang);
        derived.get_or_set(&rmsa, run_maxang);

        Ok(maxang)
    }
}

impl EnergyTerm for ExchangeKernel {
    fn name(&self) -> &str {
        &self.name
    }

    fn accumulate(
        &self,
        state: &SimState,
        previous: Option<&SimState>,
        acc: &mut EnergyEval,
    ) -> Result<()> {
        let out = self.evaluate(state, previous)?;
        for i in 0..acc.n_cells() {
            acc.energy[i] += out.energy[i];
            acc.field[i] = add(acc.field[i], out.field[i]);
            acc.mxh[i] = add(acc.mxh[i], out.torque[i]);
        }
        acc.total_energy += out.total_energy;
        Ok(())
    }
}

/// 2·asin(|Δm|/2) in degrees; 180 once the argument saturates.
#[inline]
pub fn max_angle_from_dot(max_dot: f64) -> f64 {
    let arg = 0.5 * max_dot.sqrt();
    if arg >= 1.0 {
        180.0
    } else {
        arg.asin() * (360.0 / PI)
    }
}

/// Neighbour of flat index `i` one step along an axis in direction `dir`,
/// wrapping when periodic. None at an open boundary.
#[inline]
fn neighbour(i: usize, c: usize, dim: usize, stride: usize, periodic: bool, dir: i8) -> Option<usize> {
    if dir < 0 {
        if c > 0 {
            Some(i - stride)
        } else if periodic && dim > 1 {
            Some(i + (dim - 1) * stride)
        } else {
            None
        }
    } else if c + 1 < dim {
        Some(i + stride)
    } else if periodic && dim > 1 {
        Some(i - (dim - 1) * stride)
    } else {
        None
    }
}

/// All cells must share one volume.
pub fn check_uniform_volume(mesh: &dyn Mesh) -> Result<()> {
    let n = mesh.n_cells();
    if n == 0 {
        return Ok(());
    }
    let expected = mesh.volume(0);
    for index in 1..n {
        let volume = mesh.volume(index);
        if volume != expected {
            return Err(SimError::NonUniformVolume {
                index,
                volume,
                expected,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{BoxAtlas, Shape};
    use crate::coefficients::ChannelSpec;
    use crate::grid::Grid3D;
    use crate::state::StateBuilder;

    fn kernel_for(mesh: &dyn Mesh, a: f64) -> ExchangeKernel {
        let atlas: Arc<dyn Atlas> = Arc::new(BoxAtlas::uniform("world", "bulk"));
        let m = CoefficientMatrix::from_spec("A1", &ChannelSpec::uniform(a), atlas.as_ref()).unwrap();
        ExchangeKernel::new(
            "exchange",
            atlas,
            ExchangeCoefficients::single(CoefficientKind::A, m),
            mesh,
        )
        .unwrap()
    }

    #[test]
    fn aligned_chain_has_zero_output() {
        let grid = Grid3D::new(3, 1, 1, 1e-9, 1e-9, 1e-9);
        let kernel = kernel_for(&grid, 1.3e-11);
        let state = StateBuilder::uniform(Arc::new(grid), 8e5).fix().unwrap();
        let out = kernel.evaluate(&state, None).unwrap();
        for i in 0..3 {
            assert_eq!(out.energy[i], 0.0);
            assert_eq!(out.field[i], [0.0; 3]);
            assert_eq!(out.torque[i], [0.0; 3]);
        }
        assert_eq!(out.max_angle, 0.0);
    }

    #[test]
    fn antiparallel_pair_matches_closed_form() {
        let grid = Grid3D::new(2, 1, 1, 1.0, 1.0, 1.0);
        let a = 1e-12;
        let ms = 8e5;
        let kernel = kernel_for(&grid, a);
        let mut b = StateBuilder::uniform(Arc::new(grid), ms);
        b.spin[1] = [0.0, 0.0, -1.0];
        let state = b.fix().unwrap();
        let out = kernel.evaluate(&state, None).unwrap();

        // sum_0 = -A (m1 - m0) = (0, 0, 2A); e = m0·sum = 2A.
        assert!((out.energy[0] - 2.0 * a).abs() < 1e-24);
        assert!((out.energy[1] - 2.0 * a).abs() < 1e-24);
        let hz = -2.0 / MU0 / ms * 2.0 * a;
        assert!((out.field[0][2] - hz).abs() < 1e-12 * hz.abs());
        assert!((out.field[1][2] + hz).abs() < 1e-12 * hz.abs());
        assert_eq!(out.torque[0], [0.0; 3]);
        assert!((out.max_angle - 180.0).abs() < 1e-12);
    }

    #[test]
    fn periodic_axis_wraps() {
        let open = Grid3D::new(3, 1, 1, 1.0, 1.0, 1.0);
        let wrapped = open.with_periodic(true, false, false);
        let spins = vec![[0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]];

        let k_open = kernel_for(&open, 1.0);
        let mut b = StateBuilder::uniform(Arc::new(open), 1.0);
        b.spin = spins.clone();
        let s_open = b.fix().unwrap();
        let e_open = k_open.evaluate(&s_open, None).unwrap();

        let k_wrap = kernel_for(&wrapped, 1.0);
        let mut b = StateBuilder::uniform(Arc::new(wrapped), 1.0);
        b.spin = spins;
        let s_wrap = b.fix().unwrap();
        let e_wrap = k_wrap.evaluate(&s_wrap, None).unwrap();

        // Cells 0 and 2 are parallel, so the extra wrapped pair adds nothing.
        assert_eq!(e_open.energy[0], e_wrap.energy[0]);
        assert_eq!(e_open.energy[1], e_wrap.energy[1]);

        // Flip cell 2: only the periodic grid couples it to cell 0.
        let mut b = StateBuilder::successor(&s_wrap);
        b.spin[2] = [0.0, 0.0, -1.0];
        let s_flip = b.fix().unwrap();
        let e_flip = k_wrap.evaluate(&s_flip, None).unwrap();
        // cell 0: neighbours 1 (x) and 2 (wrapped, antiparallel)
        // sum = -1*((1,0,-1)) - 1*((0,0,-2)) = (-1, 0, 3); e = 3
        assert!((e_flip.energy[0] - 3.0).abs() < 1e-12);
    }

    #[test]
    fn vacuum_cells_are_skipped() {
        let grid = Grid3D::new(3, 1, 1, 1.0, 1.0, 1.0);
        let kernel = kernel_for(&grid, 1.0);
        let mut b = StateBuilder::initial(Arc::new(grid), vec![1.0, 0.0, 1.0]);
        b.spin[1] = [1.0, 0.0, 0.0];
        let state = b.fix().unwrap();
        let out = kernel.evaluate(&state, None).unwrap();
        assert_eq!(out.energy, vec![0.0, 0.0, 0.0]);
        assert_eq!(out.field[1], [0.0; 3]);
    }

    #[test]
    fn chunked_evaluation_matches_single_chunk() {
        let grid = Grid3D::new(5, 4, 3, 2e-9, 2e-9, 3e-9);
        let mut b = StateBuilder::uniform(Arc::new(grid), 8e5);
        b.init_bloch_wall(5e-9, 2e-9);
        let state = b.fix().unwrap();

        let whole = kernel_for(&grid, 1.3e-11).with_chunk_size(usize::MAX);
        let split = kernel_for(&grid, 1.3e-11).with_chunk_size(7);
        let a = whole.evaluate(&state, None).unwrap();
        let b = split.evaluate(&state, None).unwrap();
        assert_eq!(a.energy, b.energy);
        assert_eq!(a.field, b.field);
        assert_eq!(a.max_dot, b.max_dot);
        assert!((a.total_energy - b.total_energy).abs() <= 1e-12 * a.total_energy.abs());
        assert_eq!(split.region_cache().rebuild_count(), 1);
    }

    #[test]
    fn max_angle_recompute_must_agree() {
        let grid = Grid3D::new(2, 1, 1, 1.0, 1.0, 1.0);
        let kernel = kernel_for(&grid, 1.0);
        let mut b = StateBuilder::uniform(Arc::new(grid), 1.0);
        b.spin[1] = [1.0, 0.0, 0.0];
        let state = b.fix().unwrap();

        kernel.evaluate(&state, None).unwrap();
        kernel.evaluate(&state, None).unwrap();
        assert!((state.derived().get(&kernel.max_angle_key()).unwrap() - 90.0).abs() < 1e-9);

        let err = kernel.finalize(&state, None, 0.0).unwrap_err();
        assert!(matches!(err, SimError::Consistency(_)));
    }

    #[test]
    fn stage_angle_resets_on_new_stage() {
        let grid = Grid3D::new(2, 1, 1, 1.0, 1.0, 1.0);
        let kernel = kernel_for(&grid, 1.0);
        let mut b = StateBuilder::uniform(Arc::new(grid), 1.0);
        b.spin[1] = [1.0, 0.0, 0.0];
        let s0 = b.fix().unwrap();
        kernel.evaluate(&s0, None).unwrap();

        let mut b = StateBuilder::successor(&s0);
        b.spin[1] = [0.0, 0.0, 1.0];
        b.stage_number += 1;
        let s1 = b.fix().unwrap();
        kernel.evaluate(&s1, Some(&s0)).unwrap();

        assert_eq!(s1.derived().get(&kernel.stage_max_angle_key()), Some(0.0));
        let run = s1.derived().get(&kernel.run_max_angle_key()).unwrap();
        assert!((run - 90.0).abs() < 1e-9);
    }

    #[derive(Debug)]
    struct GradedMesh(Grid3D);

    impl Mesh for GradedMesh {
        fn id(&self) -> u64 {
            self.0.id()
        }
        fn dims(&self) -> [usize; 3] {
            self.0.dims()
        }
        fn edge_lengths(&self) -> [f64; 3] {
            self.0.edge_lengths()
        }
        fn periodic(&self) -> [bool; 3] {
            self.0.periodic()
        }
        fn volume(&self, idx: usize) -> f64 {
            1.0 + idx as f64
        }
        fn center(&self, idx: usize) -> [f64; 3] {
            self.0.center(idx)
        }
    }

    #[test]
    fn non_uniform_volume_is_fatal() {
        let mesh = GradedMesh(Grid3D::new(3, 1, 1, 1.0, 1.0, 1.0));
        let atlas: Arc<dyn Atlas> = Arc::new(BoxAtlas::uniform("world", "bulk"));
        let m = CoefficientMatrix::filled(1, 1.0);
        let err = ExchangeKernel::new(
            "exchange",
            atlas,
            ExchangeCoefficients::single(CoefficientKind::A, m),
            &mesh,
        )
        .err()
        .unwrap();
        assert!(matches!(err, SimError::NonUniformVolume { index: 1, .. }));
    }

    /// Different geometry under an existing identity token.
    #[derive(Debug)]
    struct Impostor(Grid3D, u64);

    impl Mesh for Impostor {
        fn id(&self) -> u64 {
            self.1
        }
        fn dims(&self) -> [usize; 3] {
            self.0.dims()
        }
        fn edge_lengths(&self) -> [f64; 3] {
            self.0.edge_lengths()
        }
        fn periodic(&self) -> [bool; 3] {
            self.0.periodic()
        }
        fn volume(&self, idx: usize) -> f64 {
            self.0.volume(idx)
        }
        fn center(&self, idx: usize) -> [f64; 3] {
            self.0.center(idx)
        }
    }

    #[test]
    fn resized_mesh_with_reused_id_errors_instead_of_panicking() {
        let grid = Grid3D::new(4, 1, 1, 1.0, 1.0, 1.0);
        let kernel = kernel_for(&grid, 1.0);
        let state = StateBuilder::uniform(Arc::new(grid), 1.0).fix().unwrap();
        kernel.evaluate(&state, None).unwrap();

        let wider: Arc<dyn Mesh> = Arc::new(Impostor(Grid3D::new(8, 1, 1, 1.0, 1.0, 1.0), grid.id()));
        let mut b = StateBuilder::uniform(wider, 1.0);
        b.spin[7] = [1.0, 0.0, 0.0];
        let state = b.fix().unwrap();
        assert!(matches!(kernel.evaluate(&state, None), Err(SimError::Consistency(_))));
    }

    #[test]
    fn cross_lattice_couples_partner() {
        let grid = Grid3D::new(1, 1, 1, 1.0, 1.0, 1.0);
        let atlas: Arc<dyn Atlas> = Arc::new(BoxAtlas::uniform("world", "bulk"));
        let coefs = ExchangeCoefficients {
            kind: CoefficientKind::A,
            lattice1: CoefficientMatrix::filled(1, 1.0),
            lattice2: Some(CoefficientMatrix::filled(1, 1.0)),
            cross: Some(CoefficientMatrix::filled(1, 0.5)),
        };
        let kernel = ExchangeKernel::new("ex2", atlas, coefs, &grid).unwrap();
        let mesh: Arc<dyn Mesh> = Arc::new(grid);

        let mut b2 = StateBuilder::uniform(Arc::clone(&mesh), 1.0);
        b2.set_uniform(1.0, 0.0, 0.0);
        let lat2 = b2.fix().unwrap();
        let lat1 = StateBuilder::uniform(mesh, 1.0)
            .with_lattice(Lattice::First {
                partner: Arc::clone(&lat2),
            })
            .fix()
            .unwrap();

        let out = kernel.evaluate(&lat1, None).unwrap();
        // sum = -0.5 * ((1,0,0) - (0,0,1)) = (-0.5, 0, 0.5); e = 0.5
        assert!((out.energy[0] - 0.5).abs() < 1e-15);
        assert!(out.torque[0][1].abs() > 0.0);

        // Second-lattice state with no lattice-2 table is a config error.
        let single = ExchangeKernel::new(
            "ex1",
            Arc::new(BoxAtlas::uniform("w", "b")),
            ExchangeCoefficients::single(CoefficientKind::A, CoefficientMatrix::filled(1, 1.0)),
            &grid,
        )
        .unwrap();
        let lat2b = StateBuilder::successor(&lat1)
            .with_lattice(Lattice::Second { partner: lat1 })
            .fix()
            .unwrap();
        assert!(matches!(single.evaluate(&lat2b, None), Err(SimError::Config(_))));
    }

    #[test]
    fn every_table_must_cover_the_atlas() {
        let grid = Grid3D::new(2, 1, 1, 1.0, 1.0, 1.0);
        let atlas: Arc<dyn Atlas> = Arc::new(
            BoxAtlas::new("two")
                .with_region(
                    "left",
                    Shape::Box {
                        min: [0.0; 3],
                        max: [1.0, 1.0, 1.0],
                    },
                )
                .with_region("right", Shape::Everywhere),
        );
        let full = || CoefficientMatrix::filled(2, 1.0);

        let short_lattice2 = ExchangeCoefficients {
            kind: CoefficientKind::A,
            lattice1: full(),
            lattice2: Some(CoefficientMatrix::filled(1, 1.0)),
            cross: Some(full()),
        };
        let err = ExchangeKernel::new("ex", Arc::clone(&atlas), short_lattice2, &grid)
            .err()
            .unwrap();
        assert!(matches!(&err, SimError::Config(msg) if msg.contains("lattice 2")), "{}", err);

        let short_cross = ExchangeCoefficients {
            kind: CoefficientKind::A,
            lattice1: full(),
            lattice2: Some(full()),
            cross: Some(CoefficientMatrix::filled(1, 1.0)),
        };
        let err = ExchangeKernel::new("ex", Arc::clone(&atlas), short_cross, &grid)
            .err()
            .unwrap();
        assert!(matches!(&err, SimError::Config(msg) if msg.contains("cross-lattice")), "{}", err);

        let ok = ExchangeCoefficients {
            kind: CoefficientKind::A,
            lattice1: full(),
            lattice2: Some(full()),
            cross: Some(full()),
        };
        assert!(ExchangeKernel::new("ex", atlas, ok, &grid).is_ok());
    }

    #[test]
    fn lex_coefficients_convert_to_stiffness() {
        let grid = Grid3D::new(2, 1, 1, 1.0, 1.0, 1.0);
        let atlas: Arc<dyn Atlas> = Arc::new(BoxAtlas::uniform("world", "bulk"));
        let lex = 5e-9;
        let ms = 8e5;
        let kernel = ExchangeKernel::new(
            "lex",
            atlas,
            ExchangeCoefficients::single(CoefficientKind::Lex, CoefficientMatrix::filled(1, lex)),
            &grid,
        )
        .unwrap();
        let mut b = StateBuilder::uniform(Arc::new(grid), ms);
        b.spin[1] = [0.0, 0.0, -1.0];
        let state = b.fix().unwrap();
        let out = kernel.evaluate(&state, None).unwrap();
        let a = 0.5 * MU0 * lex * lex * ms * ms;
        assert!((out.energy[0] - 2.0 * a).abs() < 1e-9 * a);
    }

    #[test]
    fn neighbour_wraps_only_when_periodic() {
        assert_eq!(neighbour(0, 0, 4, 1, false, -1), None);
        assert_eq!(neighbour(0, 0, 4, 1, true, -1), Some(3));
        assert_eq!(neighbour(3, 3, 4, 1, true, 1), Some(0));
        assert_eq!(neighbour(3, 3, 4, 1, false, 1), None);
        assert_eq!(neighbour(0, 0, 1, 1, true, 1), None);
        assert_eq!(neighbour(5, 1, 3, 4, false, 1), Some(9));
    }
}
