// src/thermal.rs
//
// Per-cell LLB coefficients at one temperature: damping split, gyromagnetic
// ratio, noise variance and the noise-induced drift constant. Recomputed when
// the mesh, atlas classification or temperature changes.

use std::sync::Arc;

use log::debug;

use crate::atlas::Atlas;
use crate::equilibrium::{curie_temperature, longitudinal_susceptibility, solve_equilibrium_polarization};
use crate::error::{Result, SimError};
use crate::grid::Mesh;
use crate::params::{KB, MU0};
use crate::region_cache::RegionCache;
use crate::state::SimState;

/// Residual tolerance for the equilibrium polarization.
pub const EQUILIBRIUM_TOLERANCE: f64 = 1e-4;

/// How the gyromagnetic ratio was given.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GammaSpec {
    /// Landau-Lifshitz form, used as is.
    LandauLifshitz(f64),
    /// Gilbert form; converted per cell as γ_G / (1 + λ²).
    Gilbert(f64),
}

/// Material inputs for the thermal coefficients.
#[derive(Debug, Clone)]
pub struct ThermalInputs {
    /// Base damping λ per atlas region.
    pub alpha_by_region: Vec<f64>,
    pub gamma: GammaSpec,
    pub allow_signed_gamma: bool,
    /// Mean-field exchange coupling J (J). None disables the T_c split.
    pub curie_coupling: Option<f64>,
}

/// Coefficients for every cell of one mesh at one temperature.
#[derive(Debug, Clone)]
pub struct ThermalParameterSet {
    pub mesh_id: u64,
    pub temperature: f64,
    pub lambda: Vec<f64>,
    pub alpha_perp: Vec<f64>,
    pub alpha_par: Vec<f64>,
    pub gamma: Vec<f64>,
    /// 2 k_B T α⊥ / ((1 + α⊥²) μ0 |γ| V); divide by Ms·Δt for the variance.
    pub var_const: Vec<f64>,
    /// -var_const γ² (1 + α⊥²); divide by Ms for the drift coefficient.
    pub drift_const: Vec<f64>,
    pub tc: Vec<f64>,
    pub m_e: Vec<f64>,
    pub chi_l: Vec<f64>,
}

impl ThermalParameterSet {
    pub fn n_cells(&self) -> usize {
        self.lambda.len()
    }

    /// Per-cell noise standard deviation for correlation time `dt`.
    /// Vacuum cells and T = 0 give 0.
    pub fn noise_sigmas(&self, state: &SimState, dt: f64) -> Vec<f64> {
        state
            .ms()
            .iter()
            .zip(&self.var_const)
            .map(|(&ms, &v)| {
                if ms == 0.0 || v == 0.0 {
                    0.0
                } else {
                    (v / (ms * dt)).sqrt()
                }
            })
            .collect()
    }
}

pub struct ThermalParameterCache {
    inputs: ThermalInputs,
    atlas: Arc<dyn Atlas>,
    regions: RegionCache,
    current: Option<(u64, Arc<ThermalParameterSet>)>,
    recomputes: usize,
}

impl ThermalParameterCache {
    pub fn new(inputs: ThermalInputs, atlas: Arc<dyn Atlas>) -> Result<Self> {
        if inputs.alpha_by_region.len() != atlas.region_count() {
            return Err(SimError::Config(format!(
                "damping given for {} regions but atlas \"{}\" has {}",
                inputs.alpha_by_region.len(),
                atlas.name(),
                atlas.region_count()
            )));
        }
        if let Some(j) = inputs.curie_coupling {
            if !(j.is_finite() && j > 0.0) {
                return Err(SimError::Config(format!(
                    "curie_coupling must be positive and finite, got {}",
                    j
                )));
            }
        }
        Ok(Self {
            inputs,
            atlas,
            regions: RegionCache::new(),
            current: None,
            recomputes: 0,
        })
    }

    pub fn recompute_count(&self) -> usize {
        self.recomputes
    }

    pub fn current(&self) -> Option<&Arc<ThermalParameterSet>> {
        self.current.as_ref().map(|(_, set)| set)
    }

    /// Coefficients for `state`'s mesh at `temperature` (K, sign ignored).
    pub fn get(&mut self, state: &SimState, temperature: f64) -> Result<Arc<ThermalParameterSet>> {
        let temperature = temperature.abs();
        let mesh = state.mesh().as_ref();
        let version = self.atlas.version();
        if let Some((v, set)) = &self.current {
            if set.mesh_id == mesh.id() && *v == version && set.temperature == temperature {
                return Ok(Arc::clone(set));
            }
        }

        let set = Arc::new(self.compute(mesh, state.ms(), temperature)?);
        self.recomputes += 1;
        debug!(
            "thermal parameters recomputed for mesh {} at T={} K ({} cells)",
            mesh.id(),
            temperature,
            set.n_cells()
        );
        self.current = Some((version, Arc::clone(&set)));
        Ok(set)
    }

    fn compute(&self, mesh: &dyn Mesh, ms: &[f64], temperature: f64) -> Result<ThermalParameterSet> {
        let regions = self.regions.regions(
            mesh,
            self.atlas.as_ref(),
            self.inputs.alpha_by_region.len(),
        )?;
        let n = mesh.n_cells();
        let kb_t = KB * temperature;

        let mut set = ThermalParameterSet {
            mesh_id: mesh.id(),
            temperature,
            lambda: Vec::with_capacity(n),
            alpha_perp: Vec::with_capacity(n),
            alpha_par: Vec::with_capacity(n),
            gamma: Vec::with_capacity(n),
            var_const: Vec::with_capacity(n),
            drift_const: Vec::with_capacity(n),
            tc: Vec::with_capacity(n),
            m_e: Vec::with_capacity(n),
            chi_l: Vec::with_capacity(n),
        };

        // m_e depends only on (J, T), which are uniform.
        let (tc, m_e) = match self.inputs.curie_coupling {
            Some(j) => (
                curie_temperature(j),
                solve_equilibrium_polarization(j, temperature, EQUILIBRIUM_TOLERANCE)?,
            ),
            None => (f64::INFINITY, 1.0),
        };

        for i in 0..n {
            let lambda = self.inputs.alpha_by_region[regions[i]];
            let mut gamma = match self.inputs.gamma {
                GammaSpec::LandauLifshitz(g) => g,
                GammaSpec::Gilbert(g) => g / (1.0 + lambda * lambda),
            };
            if !self.inputs.allow_signed_gamma {
                gamma = gamma.abs();
            }

            let (alpha_perp, alpha_par) = match self.inputs.curie_coupling {
                Some(_) => {
                    let par = 2.0 * lambda * temperature / (3.0 * tc);
                    if temperature < tc {
                        (lambda * (1.0 - temperature / (3.0 * tc)), par)
                    } else {
                        (par, par)
                    }
                }
                None => (lambda, lambda),
            };

            let vol = mesh.volume(i);
            let var_const = 2.0 * kb_t * alpha_perp
                / ((1.0 + alpha_perp * alpha_perp) * MU0 * gamma.abs() * vol);
            let drift_const = -var_const * gamma * gamma * (1.0 + alpha_perp * alpha_perp);
            let chi_l = match self.inputs.curie_coupling {
                Some(j) => longitudinal_susceptibility(j, temperature, ms[i] * vol, m_e),
                None => 0.0,
            };

            set.lambda.push(lambda);
            set.alpha_perp.push(alpha_perp);
            set.alpha_par.push(alpha_par);
            set.gamma.push(gamma);
            set.var_const.push(var_const);
            set.drift_const.push(drift_const);
            set.tc.push(tc);
            set.m_e.push(m_e);
            set.chi_l.push(chi_l);
        }
        Ok(set)
    }
}
