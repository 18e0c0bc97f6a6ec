// src/region_cache.rs
//
// Lazily rebuilt per-cell region map, shared by concurrent kernel workers.
//
// The map is valid for one (mesh id, atlas version) pair. When a worker finds
// it stale, the first one to notice rebuilds it while the others wait on a
// condition variable. After the rebuild the rebuilder wakes one waiter; each
// woken waiter re-checks validity and wakes the next one, so waiters are
// released one at a time. A failed rebuild leaves a sticky error that every
// waiting and later caller receives until `clear_error` is called.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::atlas::Atlas;
use crate::error::{Result, SimError};
use crate::grid::Mesh;

#[derive(Debug, Default)]
struct Inner {
    mesh_id: Option<u64>,
    atlas_version: u64,
    regions: Arc<Vec<usize>>,
    rebuilding: bool,
    waiting: usize,
    error: Option<String>,
}

impl Inner {
    #[inline]
    fn is_valid(&self, mesh_id: u64, atlas_version: u64) -> bool {
        self.mesh_id == Some(mesh_id) && self.atlas_version == atlas_version
    }
}

#[derive(Debug, Default)]
pub struct RegionCache {
    inner: Mutex<Inner>,
    ready: Condvar,
    rebuilds: AtomicUsize,
}

impl RegionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rebuilds executed so far (successful or not).
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::Acquire)
    }

    /// Force a rebuild on next access.
    pub fn invalidate(&self) {
        self.inner.lock().mesh_id = None;
    }

    /// Drop a sticky rebuild error and invalidate the map.
    pub fn clear_error(&self) {
        let mut g = self.inner.lock();
        g.error = None;
        g.mesh_id = None;
    }

    /// Sticky error, if a rebuild failed.
    pub fn error(&self) -> Option<String> {
        self.inner.lock().error.clone()
    }

    /// Region id per cell for `mesh`, rebuilding if stale.
    ///
    /// `region_limit` is the number of regions the coefficient tables were
    /// sized for; a classification outside it fails the rebuild.
    pub fn regions(
        &self,
        mesh: &dyn Mesh,
        atlas: &dyn Atlas,
        region_limit: usize,
    ) -> Result<Arc<Vec<usize>>> {
        let mesh_id = mesh.id();
        let mut g = self.inner.lock();
        loop {
            if let Some(msg) = g.error.clone() {
                self.release_next(&g);
                return Err(SimError::RegionRebuild(msg));
            }
            if g.is_valid(mesh_id, atlas.version()) {
                let regions = Arc::clone(&g.regions);
                self.release_next(&g);
                if regions.len() != mesh.n_cells() {
                    return Err(SimError::Consistency(format!(
                        "mesh {} has {} cells but its region map has {}",
                        mesh_id,
                        mesh.n_cells(),
                        regions.len()
                    )));
                }
                return Ok(regions);
            }
            if g.rebuilding {
                g.waiting += 1;
                self.ready.wait(&mut g);
                g.waiting -= 1;
                continue;
            }

            // This worker rebuilds. Drop the lock while classifying so
            // arriving workers can queue up on the condition variable.
            g.rebuilding = true;
            let version = atlas.version();
            let built = MutexGuard::unlocked(&mut g, || build_region_map(mesh, atlas, region_limit));
            g.rebuilding = false;
            self.rebuilds.fetch_add(1, Ordering::AcqRel);

            match built {
                Ok(map) => {
                    debug!(
                        "region map rebuilt for mesh {} (atlas \"{}\" v{}, {} cells)",
                        mesh_id,
                        atlas.name(),
                        version,
                        map.len()
                    );
                    g.mesh_id = Some(mesh_id);
                    g.atlas_version = version;
                    g.regions = Arc::new(map);
                    // Loop around: returns the fresh map and releases a waiter.
                }
                Err(msg) => {
                    g.error = Some(msg.clone());
                    self.release_next(&g);
                    return Err(SimError::RegionRebuild(msg));
                }
            }
        }
    }

    #[inline]
    fn release_next(&self, g: &Inner) {
        if g.waiting > 0 {
            self.ready.notify_one();
        }
    }
}

fn build_region_map(
    mesh: &dyn Mesh,
    atlas: &dyn Atlas,
    region_limit: usize,
) -> std::result::Result<Vec<usize>, String> {
    let n = mesh.n_cells();
    let mut map = Vec::with_capacity(n);
    for idx in 0..n {
        let c = mesh.center(idx);
        match atlas.region_at(c) {
            Some(r) if r < region_limit => map.push(r),
            Some(r) => {
                return Err(format!(
                    "cell {} maps to region {} of atlas \"{}\", but coefficient tables only cover {} regions",
                    idx,
                    r,
                    atlas.name(),
                    region_limit
                ))
            }
            None => {
                return Err(format!(
                    "mesh {} has points outside atlas \"{}\" (cell {} at [{:e}, {:e}, {:e}])",
                    mesh.id(),
                    atlas.name(),
                    idx,
                    c[0],
                    c[1],
                    c[2]
                ))
            }
        }
    }
    Ok(map)
}
