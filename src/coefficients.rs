// src/coefficients.rs
//
// Region-pair exchange coefficient tables.
//
// Each interaction channel (lattice 1, lattice 2, cross-lattice) is a
// symmetric matrix indexed by region id, filled from a default value plus
// sparse overrides given as a flat token list:
//     [region_a, region_b, value, region_a, region_b, value, ...]

use serde::{Deserialize, Serialize};

use crate::atlas::Atlas;
use crate::error::{Result, SimError};

/// How the coefficient values are to be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoefficientKind {
    /// Exchange stiffness A (J/m).
    A,
    /// Exchange length lex (m); converted per cell with A = μ0 Ms² lex² / 2.
    Lex,
}

/// One channel's configuration: default + flat override list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    #[serde(default)]
    pub default: f64,
    #[serde(default)]
    pub pairs: Vec<String>,
}

impl ChannelSpec {
    pub fn uniform(default: f64) -> Self {
        Self {
            default,
            pairs: Vec::new(),
        }
    }

    pub fn with_pair(mut self, a: &str, b: &str, value: f64) -> Self {
        self.pairs.push(a.to_string());
        self.pairs.push(b.to_string());
        self.pairs.push(format!("{:e}", value));
        self
    }
}

/// Symmetric region-pair matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientMatrix {
    size: usize,
    data: Vec<f64>,
}

impl CoefficientMatrix {
    pub fn filled(size: usize, value: f64) -> Self {
        Self {
            size,
            data: vec![value; size * size],
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn get(&self, a: usize, b: usize) -> f64 {
        self.data[a * self.size + b]
    }

    /// Row for region `a`, indexable by neighbour region.
    #[inline]
    pub fn row(&self, a: usize) -> &[f64] {
        &self.data[a * self.size..(a + 1) * self.size]
    }

    /// Sets both (a, b) and (b, a).
    pub fn set_pair(&mut self, a: usize, b: usize, value: f64) {
        self.data[a * self.size + b] = value;
        self.data[b * self.size + a] = value;
    }

    pub fn is_symmetric(&self) -> bool {
        (0..self.size).all(|a| (0..a).all(|b| self.get(a, b) == self.get(b, a)))
    }

    /// Build from a channel spec, resolving region names through `atlas`.
    /// `channel` names the channel in error messages (e.g. "A1").
    pub fn from_spec(channel: &str, spec: &ChannelSpec, atlas: &dyn Atlas) -> Result<Self> {
        let size = atlas.region_count();
        if size < 1 {
            return Err(SimError::Config(format!(
                "atlas \"{}\" must contain at least one region",
                atlas.name()
            )));
        }
        if !spec.default.is_finite() {
            return Err(SimError::Config(format!(
                "default value for {} is not finite: {}",
                channel, spec.default
            )));
        }
        if spec.pairs.len() % 3 != 0 {
            return Err(SimError::Config(format!(
                "number of elements in {} sub-list must be divisible by 3 (actual sub-list size: {})",
                channel,
                spec.pairs.len()
            )));
        }

        let mut m = Self::filled(size, spec.default);
        for (entry, triple) in spec.pairs.chunks(3).enumerate() {
            let a = lookup_region(channel, entry, &triple[0], atlas)?;
            let b = lookup_region(channel, entry, &triple[1], atlas)?;
            let value: f64 = triple[2].trim().parse().map_err(|_| {
                SimError::Config(format!(
                    "third entry in {}[{}] sub-list, \"{}\", is not a valid floating point number",
                    channel, entry, triple[2]
                ))
            })?;
            if !value.is_finite() {
                return Err(SimError::Config(format!(
                    "third entry in {}[{}] sub-list is not finite: {}",
                    channel, entry, value
                )));
            }
            m.set_pair(a, b, value);
        }
        Ok(m)
    }
}

fn lookup_region(channel: &str, entry: usize, name: &str, atlas: &dyn Atlas) -> Result<usize> {
    atlas.region_id(name).ok_or_else(|| SimError::UnknownRegion {
        channel: channel.to_string(),
        entry,
        name: name.to_string(),
        known: atlas.region_names().join(", "),
    })
}

/// All coefficient channels for one exchange kernel.
#[derive(Debug, Clone)]
pub struct ExchangeCoefficients {
    pub kind: CoefficientKind,
    pub lattice1: CoefficientMatrix,
    pub lattice2: Option<CoefficientMatrix>,
    pub cross: Option<CoefficientMatrix>,
}

impl ExchangeCoefficients {
    /// Single-lattice coefficients.
    pub fn single(kind: CoefficientKind, lattice1: CoefficientMatrix) -> Self {
        Self {
            kind,
            lattice1,
            lattice2: None,
            cross: None,
        }
    }

    pub fn region_count(&self) -> usize {
        self.lattice1.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{BoxAtlas, Shape};

    fn two_region_atlas() -> BoxAtlas {
        BoxAtlas::new("atlas")
            .with_region(
                "core",
                Shape::Box {
                    min: [0.0; 3],
                    max: [1.0; 3],
                },
            )
            .with_region("shell", Shape::Everywhere)
    }

    #[test]
    fn overrides_are_symmetric() {
        let atlas = two_region_atlas();
        let spec = ChannelSpec::uniform(1e-11).with_pair("shell", "core", 3e-12);
        let m = CoefficientMatrix::from_spec("A1", &spec, &atlas).unwrap();
        assert!(m.is_symmetric());
        assert_eq!(m.get(0, 1), 3e-12);
        assert_eq!(m.get(1, 0), 3e-12);
        assert_eq!(m.get(0, 0), 1e-11);
        assert_eq!(m.row(1), &[3e-12, 1e-11]);
    }

    #[test]
    fn list_length_must_be_multiple_of_three() {
        let atlas = two_region_atlas();
        let spec = ChannelSpec {
            default: 0.0,
            pairs: vec!["core".into(), "shell".into()],
        };
        let err = CoefficientMatrix::from_spec("A1", &spec, &atlas).unwrap_err();
        assert!(err.to_string().contains("divisible by 3"), "{}", err);
    }

    #[test]
    fn unknown_region_lists_known_regions() {
        let atlas = two_region_atlas();
        let spec = ChannelSpec::uniform(0.0).with_pair("core", "mantle", 1.0);
        match CoefficientMatrix::from_spec("A1", &spec, &atlas) {
            Err(SimError::UnknownRegion {
                entry, name, known, ..
            }) => {
                assert_eq!(entry, 0);
                assert_eq!(name, "mantle");
                assert!(known.contains("core") && known.contains("shell"));
            }
            other => panic!("expected UnknownRegion, got {:?}", other),
        }
    }

    #[test]
    fn bad_number_is_reported() {
        let atlas = two_region_atlas();
        let spec = ChannelSpec {
            default: 0.0,
            pairs: vec!["core".into(), "core".into(), "1e-12x".into()],
        };
        let err = CoefficientMatrix::from_spec("lex2", &spec, &atlas).unwrap_err();
        assert!(err.to_string().contains("1e-12x"));
    }
}
