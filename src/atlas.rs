// src/atlas.rs
//
// Region classification for grid cells.
//
// An atlas maps a point (cell centre, metres) to a named material region.
// The exchange kernel only needs the lookup and a version token that changes
// whenever the classification changes, so its cached region map can tell
// when it went stale.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

pub trait Atlas: Send + Sync + fmt::Debug {
    /// Instance name used in error messages.
    fn name(&self) -> &str;

    /// Region names, indexed by region id.
    fn region_names(&self) -> Vec<String>;

    fn region_count(&self) -> usize {
        self.region_names().len()
    }

    fn region_id(&self, name: &str) -> Option<usize> {
        self.region_names().iter().position(|n| n == name)
    }

    /// Region id containing `point`, or None if the point is outside the atlas.
    fn region_at(&self, point: [f64; 3]) -> Option<usize>;

    /// Bumped whenever the classification changes.
    fn version(&self) -> u64;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Shape {
    /// Matches every point.
    Everywhere,
    /// Closed axis-aligned box [min, max].
    Box { min: [f64; 3], max: [f64; 3] },
}

impl Shape {
    #[inline]
    fn contains(&self, p: [f64; 3]) -> bool {
        match *self {
            Shape::Everywhere => true,
            Shape::Box { min, max } => (0..3).all(|a| p[a] >= min[a] && p[a] <= max[a]),
        }
    }
}

#[derive(Debug, Clone)]
struct Region {
    name: String,
    shape: Shape,
}

/// Ordered list of named shapes; the first region containing a point wins.
#[derive(Debug)]
pub struct BoxAtlas {
    name: String,
    regions: RwLock<Vec<Region>>,
    version: AtomicU64,
}

impl BoxAtlas {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            regions: RwLock::new(Vec::new()),
            version: AtomicU64::new(1),
        }
    }

    /// Single region covering all space.
    pub fn uniform(name: impl Into<String>, region: impl Into<String>) -> Self {
        let atlas = Self::new(name);
        atlas.push_region(region, Shape::Everywhere);
        atlas
    }

    /// Builder-style `push_region`.
    pub fn with_region(self, region: impl Into<String>, shape: Shape) -> Self {
        self.push_region(region, shape);
        self
    }

    /// Append a region. Appending changes classification, so the version moves.
    pub fn push_region(&self, region: impl Into<String>, shape: Shape) {
        self.regions.write().push(Region {
            name: region.into(),
            shape,
        });
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Replace the shape of an existing region. Returns false if unknown.
    pub fn reshape_region(&self, region: &str, shape: Shape) -> bool {
        let mut regions = self.regions.write();
        match regions.iter_mut().find(|r| r.name == region) {
            Some(r) => {
                r.shape = shape;
                self.version.fetch_add(1, Ordering::AcqRel);
                true
            }
            None => false,
        }
    }
}

impl Atlas for BoxAtlas {
    fn name(&self) -> &str {
        &self.name
    }

    fn region_names(&self) -> Vec<String> {
        self.regions.read().iter().map(|r| r.name.clone()).collect()
    }

    fn region_at(&self, point: [f64; 3]) -> Option<usize> {
        self.regions.read().iter().position(|r| r.shape.contains(point))
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_region_wins() {
        let atlas = BoxAtlas::new("world")
            .with_region(
                "left",
                Shape::Box {
                    min: [0.0, 0.0, 0.0],
                    max: [1.0, 1.0, 1.0],
                },
            )
            .with_region("rest", Shape::Everywhere);

        assert_eq!(atlas.region_count(), 2);
        assert_eq!(atlas.region_id("rest"), Some(1));
        assert_eq!(atlas.region_id("nope"), None);
        assert_eq!(atlas.region_at([0.5, 0.5, 0.5]), Some(0));
        assert_eq!(atlas.region_at([1.5, 0.5, 0.5]), Some(1));
    }

    #[test]
    fn reshaping_bumps_version() {
        let atlas = BoxAtlas::new("a").with_region(
            "r",
            Shape::Box {
                min: [0.0; 3],
                max: [1.0; 3],
            },
        );
        let v0 = atlas.version();
        assert_eq!(atlas.region_at([2.0, 0.5, 0.5]), None);
        assert!(atlas.reshape_region("r", Shape::Everywhere));
        assert!(atlas.version() > v0);
        assert_eq!(atlas.region_at([2.0, 0.5, 0.5]), Some(0));
        assert!(!atlas.reshape_region("missing", Shape::Everywhere));
    }
}
