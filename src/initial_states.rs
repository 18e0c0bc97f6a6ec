// src/initial_states.rs
//
// Initial magnetization generators, applied to a `StateBuilder`.
//
// Vacuum cells (Ms = 0) keep whatever direction they get; nothing reads them.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::state::StateBuilder;
use crate::vec3::normalize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InitialState {
    /// Uniform direction (normalised).
    Uniform { direction: [f64; 3] },
    /// Uniform plus a small random tilt of up to `tilt` per component,
    /// to break symmetry.
    UniformWithTilt {
        direction: [f64; 3],
        tilt: f64,
        seed: u64,
    },
    /// Random directions, roughly uniform on the sphere.
    Random { seed: u64 },
    /// 180° Bloch wall along x, centred at `center` (m) with width `width` (m).
    BlochWall { center: f64, width: f64 },
    /// `core` inside a sphere of `radius` around `center`, `outer` elsewhere.
    ReversedCore {
        center: [f64; 3],
        radius: f64,
        outer: [f64; 3],
        core: [f64; 3],
    },
}

impl Default for InitialState {
    fn default() -> Self {
        InitialState::Uniform {
            direction: [0.0, 0.0, 1.0],
        }
    }
}

impl InitialState {
    pub fn apply(&self, b: &mut StateBuilder) {
        match *self {
            InitialState::Uniform { direction } => {
                b.set_uniform(direction[0], direction[1], direction[2]);
            }
            InitialState::UniformWithTilt {
                direction,
                tilt,
                seed,
            } => {
                let base = normalize(direction);
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                for v in &mut b.spin {
                    let d = [
                        tilt * (rng.random::<f64>() * 2.0 - 1.0),
                        tilt * (rng.random::<f64>() * 2.0 - 1.0),
                        tilt * (rng.random::<f64>() * 2.0 - 1.0),
                    ];
                    *v = normalize([base[0] + d[0], base[1] + d[1], base[2] + d[2]]);
                }
            }
            InitialState::Random { seed } => {
                let mut rng = ChaCha8Rng::seed_from_u64(seed);
                for v in &mut b.spin {
                    let x = rng.random::<f64>() * 2.0 - 1.0;
                    let y = rng.random::<f64>() * 2.0 - 1.0;
                    let z = rng.random::<f64>() * 2.0 - 1.0;
                    *v = normalize([x, y, z]);
                }
            }
            InitialState::BlochWall { center, width } => b.init_bloch_wall(center, width),
            InitialState::ReversedCore {
                center,
                radius,
                outer,
                core,
            } => {
                let r2 = radius * radius;
                let outer = normalize(outer);
                let core = normalize(core);
                let mesh = std::sync::Arc::clone(b.mesh());
                for (idx, v) in b.spin.iter_mut().enumerate() {
                    let c = mesh.center(idx);
                    let d2: f64 = (0..3).map(|a| (c[a] - center[a]).powi(2)).sum();
                    *v = if d2 <= r2 { core } else { outer };
                }
            }
        }
    }
}
