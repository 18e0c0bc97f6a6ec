// src/grid.rs

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_GRID_ID: AtomicU64 = AtomicU64::new(1);

/// Geometry queries the solver needs from a mesh.
///
/// `id()` is an identity token: two meshes with the same id are guaranteed to
/// have the same geometry, so caches keyed by it stay valid.
pub trait Mesh: Send + Sync + fmt::Debug {
    fn id(&self) -> u64;
    fn dims(&self) -> [usize; 3];
    fn edge_lengths(&self) -> [f64; 3];
    fn periodic(&self) -> [bool; 3];
    fn volume(&self, idx: usize) -> f64;
    fn center(&self, idx: usize) -> [f64; 3];

    fn n_cells(&self) -> usize {
        let [nx, ny, nz] = self.dims();
        nx * ny * nz
    }

    /// Flat index -> (i, j, k), x fastest.
    fn coords(&self, idx: usize) -> (usize, usize, usize) {
        let [nx, ny, _] = self.dims();
        let i = idx % nx;
        let j = (idx / nx) % ny;
        let k = idx / (nx * ny);
        (i, j, k)
    }
}

/// Uniform rectangular finite-difference grid, optionally periodic per axis.
///
/// Geometry is fixed at construction; copies share the identity token.
#[derive(Debug, Clone, Copy)]
pub struct Grid3D {
    nx: usize,
    ny: usize,
    nz: usize,
    dx: f64,
    dy: f64,
    dz: f64,
    periodic: [bool; 3],
    id: u64,
}

impl Grid3D {
    /// Create a new open-boundary grid with nx × ny × nz cells.
    pub fn new(nx: usize, ny: usize, nz: usize, dx: f64, dy: f64, dz: f64) -> Self {
        Self {
            nx,
            ny,
            nz,
            dx,
            dy,
            dz,
            periodic: [false; 3],
            id: NEXT_GRID_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Same grid with periodic flags set. Gets a fresh identity token, since
    /// neighbour topology changed.
    pub fn with_periodic(self, px: bool, py: bool, pz: bool) -> Self {
        Self {
            periodic: [px, py, pz],
            id: NEXT_GRID_ID.fetch_add(1, Ordering::Relaxed),
            ..self
        }
    }

    /// Convert (i, j, k) indices to a flat index.
    #[inline]
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        debug_assert!(i < self.nx && j < self.ny && k < self.nz);
        (k * self.ny + j) * self.nx + i
    }

    #[inline]
    pub fn cell_volume(&self) -> f64 {
        self.dx * self.dy * self.dz
    }

    pub fn nx(&self) -> usize {
        self.nx
    }

    pub fn ny(&self) -> usize {
        self.ny
    }

    pub fn nz(&self) -> usize {
        self.nz
    }

    pub fn dx(&self) -> f64 {
        self.dx
    }

    pub fn dy(&self) -> f64 {
        self.dy
    }

    pub fn dz(&self) -> f64 {
        self.dz
    }
}

impl Mesh for Grid3D {
    fn id(&self) -> u64 {
        self.id
    }

    fn dims(&self) -> [usize; 3] {
        [self.nx, self.ny, self.nz]
    }

    fn edge_lengths(&self) -> [f64; 3] {
        [self.dx, self.dy, self.dz]
    }

    fn periodic(&self) -> [bool; 3] {
        self.periodic
    }

    fn volume(&self, _idx: usize) -> f64 {
        self.cell_volume()
    }

    /// Cell centre, origin at the grid corner.
    fn center(&self, idx: usize) -> [f64; 3] {
        let (i, j, k) = self.coords(idx);
        [
            (i as f64 + 0.5) * self.dx,
            (j as f64 + 0.5) * self.dy,
            (k as f64 + 0.5) * self.dz,
        ]
    }
}
