// src/config.rs
//
// Run configuration, read from and written to JSON.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::atlas::{Atlas, BoxAtlas, Shape};
use crate::coefficients::{ChannelSpec, CoefficientKind, CoefficientMatrix, ExchangeCoefficients};
use crate::effective_field::zeeman::ZeemanConfig;
use crate::error::{Result, SimError};
use crate::grid::{Grid3D, Mesh};
use crate::initial_states::InitialState;
use crate::params::GAMMA_LL_DEFAULT;
use crate::temperature::{Constant, ScheduleConfig, TemperatureSchedule};
use crate::thermal::{GammaSpec, ThermalInputs};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub geometry: GeometryConfig,
    #[serde(default)]
    pub atlas: AtlasConfig,
    pub material: MaterialConfig,
    #[serde(default)]
    pub initial: InitialState,
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub evolver: EvolverConfig,
    #[serde(default)]
    pub zeeman: Option<ZeemanConfig>,
    #[serde(default)]
    pub run: Option<RunInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeometryConfig {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
    #[serde(default)]
    pub periodic: [bool; 3],
}

impl GeometryConfig {
    pub fn build(&self) -> Result<Grid3D> {
        if self.nx == 0 || self.ny == 0 || self.nz == 0 {
            return Err(SimError::Config(format!(
                "grid dimensions must be positive, got {}x{}x{}",
                self.nx, self.ny, self.nz
            )));
        }
        for (axis, h) in [("dx", self.dx), ("dy", self.dy), ("dz", self.dz)] {
            if !(h.is_finite() && h > 0.0) {
                return Err(SimError::Config(format!(
                    "cell size {} must be positive and finite, got {}",
                    axis, h
                )));
            }
        }
        let [px, py, pz] = self.periodic;
        Ok(Grid3D::new(self.nx, self.ny, self.nz, self.dx, self.dy, self.dz)
            .with_periodic(px, py, pz))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionConfig {
    pub name: String,
    /// Box corners (m); omit both for an everywhere region.
    #[serde(default)]
    pub min: Option<[f64; 3]>,
    #[serde(default)]
    pub max: Option<[f64; 3]>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtlasConfig {
    pub name: String,
    /// Checked in order; the first containing region wins.
    #[serde(default)]
    pub regions: Vec<RegionConfig>,
}

impl Default for AtlasConfig {
    fn default() -> Self {
        Self {
            name: "atlas".to_string(),
            regions: Vec::new(),
        }
    }
}

impl AtlasConfig {
    /// An empty region list gives a single everywhere region "bulk".
    pub fn build(&self) -> Result<BoxAtlas> {
        if self.regions.is_empty() {
            return Ok(BoxAtlas::uniform(self.name.clone(), "bulk"));
        }
        let atlas = BoxAtlas::new(self.name.clone());
        for r in &self.regions {
            if atlas.region_id(&r.name).is_some() {
                return Err(SimError::Config(format!(
                    "atlas \"{}\": duplicate region \"{}\"",
                    self.name, r.name
                )));
            }
            let shape = match (r.min, r.max) {
                (None, None) => Shape::Everywhere,
                (Some(min), Some(max)) => {
                    if (0..3).any(|a| !(min[a] <= max[a])) {
                        return Err(SimError::Config(format!(
                            "region \"{}\": min {:?} is not below max {:?}",
                            r.name, min, max
                        )));
                    }
                    Shape::Box { min, max }
                }
                _ => {
                    return Err(SimError::Config(format!(
                        "region \"{}\": give both min and max, or neither",
                        r.name
                    )))
                }
            };
            atlas.push_region(r.name.clone(), shape);
        }
        Ok(atlas)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialConfig {
    /// Saturation magnetisation (A/m); 0 marks vacuum.
    pub ms: f64,
    #[serde(default)]
    pub ms_regions: BTreeMap<String, f64>,
}

impl MaterialConfig {
    pub fn ms_per_cell(&self, mesh: &dyn Mesh, atlas: &dyn Atlas) -> Result<Vec<f64>> {
        let by_region = per_region("ms", self.ms, &self.ms_regions, atlas)?;
        if let Some(bad) = by_region.iter().find(|v| **v < 0.0) {
            return Err(SimError::Config(format!("ms must be non-negative, got {}", bad)));
        }
        (0..mesh.n_cells())
            .map(|i| {
                let c = mesh.center(i);
                atlas.region_at(c).map(|r| by_region[r]).ok_or_else(|| {
                    SimError::Config(format!(
                        "cell {} at {:?} lies outside atlas \"{}\"",
                        i,
                        c,
                        atlas.name()
                    ))
                })
            })
            .collect()
    }
}

/// Exchange coefficients, given as stiffness A (J/m) or exchange length
/// lex (m). Channel 1 is required; 2 and the cross channel 12 are for
/// two-lattice runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(rename = "A1", default, skip_serializing_if = "Option::is_none")]
    pub a1: Option<ChannelSpec>,
    #[serde(rename = "A2", default, skip_serializing_if = "Option::is_none")]
    pub a2: Option<ChannelSpec>,
    #[serde(rename = "A12", default, skip_serializing_if = "Option::is_none")]
    pub a12: Option<ChannelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lex1: Option<ChannelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lex2: Option<ChannelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lex12: Option<ChannelSpec>,
}

impl ExchangeConfig {
    pub fn kind(&self) -> Result<CoefficientKind> {
        let has_a = self.a1.is_some() || self.a2.is_some() || self.a12.is_some();
        let has_lex = self.lex1.is_some() || self.lex2.is_some() || self.lex12.is_some();
        match (has_a, has_lex) {
            (true, true) => Err(SimError::Config(
                "exchange: cannot specify both A and lex coefficients".to_string(),
            )),
            (false, false) => Err(SimError::Config(
                "exchange: one of A1 or lex1 is required".to_string(),
            )),
            (true, false) => Ok(CoefficientKind::A),
            (false, true) => Ok(CoefficientKind::Lex),
        }
    }

    pub fn resolve(&self, atlas: &dyn Atlas) -> Result<ExchangeCoefficients> {
        let kind = self.kind()?;
        let (names, channels) = match kind {
            CoefficientKind::A => (["A1", "A2", "A12"], [&self.a1, &self.a2, &self.a12]),
            CoefficientKind::Lex => (["lex1", "lex2", "lex12"], [&self.lex1, &self.lex2, &self.lex12]),
        };
        let lattice1 = match channels[0] {
            Some(spec) => CoefficientMatrix::from_spec(names[0], spec, atlas)?,
            None => {
                return Err(SimError::Config(format!(
                    "exchange: {} is required",
                    names[0]
                )))
            }
        };
        let lattice2 = channels[1]
            .as_ref()
            .map(|spec| CoefficientMatrix::from_spec(names[1], spec, atlas))
            .transpose()?;
        let cross = channels[2]
            .as_ref()
            .map(|spec| CoefficientMatrix::from_spec(names[2], spec, atlas))
            .transpose()?;
        if cross.is_some() && lattice2.is_none() {
            return Err(SimError::Config(format!(
                "exchange: {} given without {}",
                names[2], names[1]
            )));
        }
        Ok(ExchangeCoefficients {
            kind,
            lattice1,
            lattice2,
            cross,
        })
    }
}

/// Thermal evolver settings. Angles in degrees, rates in deg/ns, times in s.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolverConfig {
    pub fixed_timestep: f64,
    pub min_timestep: Option<f64>,
    pub max_timestep: Option<f64>,
    /// Non-positive disables.
    pub error_rate: f64,
    pub absolute_step_error: f64,
    pub relative_step_error: f64,
    pub step_headroom: f64,
    pub start_dm: f64,
    pub temperature: Option<f64>,
    pub temperature_schedule: Option<ScheduleConfig>,
    pub ito_calculus: bool,
    pub uniform_seed: Option<u64>,
    pub do_precess: bool,
    pub alpha: f64,
    pub alpha_regions: BTreeMap<String, f64>,
    pub gamma_ll: Option<f64>,
    pub gamma_g: Option<f64>,
    pub allow_signed_gamma: bool,
    pub curie_coupling: Option<f64>,
    pub fixed_spins: Vec<usize>,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            fixed_timestep: 1e-16,
            min_timestep: None,
            max_timestep: None,
            error_rate: -1.0,
            absolute_step_error: 0.2,
            relative_step_error: 0.2,
            step_headroom: 0.85,
            start_dm: 0.01,
            temperature: None,
            temperature_schedule: None,
            ito_calculus: false,
            uniform_seed: None,
            do_precess: true,
            alpha: 0.5,
            alpha_regions: BTreeMap::new(),
            gamma_ll: None,
            gamma_g: None,
            allow_signed_gamma: false,
            curie_coupling: None,
            fixed_spins: Vec::new(),
        }
    }
}

pub const DEFAULT_TEMPERATURE: f64 = 300.0;

impl EvolverConfig {
    /// Checks that do not need the mesh or atlas.
    pub fn validate(&self) -> Result<()> {
        if !(self.fixed_timestep.is_finite() && self.fixed_timestep > 0.0) {
            return Err(SimError::Config(format!(
                "fixed_timestep must be positive, got {}",
                self.fixed_timestep
            )));
        }
        if !(self.step_headroom > 0.0 && self.step_headroom <= 1.0) {
            return Err(SimError::Config(format!(
                "step_headroom must be in (0, 1], got {}",
                self.step_headroom
            )));
        }
        if !(self.start_dm.is_finite() && self.start_dm > 0.0) {
            return Err(SimError::Config(format!(
                "start_dm must be positive, got {}",
                self.start_dm
            )));
        }
        if self.temperature.is_some() && self.temperature_schedule.is_some() {
            return Err(SimError::Config(
                "cannot specify both temperature and temperature_schedule".to_string(),
            ));
        }
        if let Some(t) = self.temperature {
            if !t.is_finite() {
                return Err(SimError::Config(format!("temperature is not finite: {}", t)));
            }
        }
        if self.gamma_ll.is_some() && self.gamma_g.is_some() {
            return Err(SimError::Config(
                "both gamma_G and gamma_LL specified".to_string(),
            ));
        }
        for (name, g) in [("gamma_LL", self.gamma_ll), ("gamma_G", self.gamma_g)] {
            if let Some(g) = g {
                if !g.is_finite() || g == 0.0 {
                    return Err(SimError::Config(format!(
                        "{} must be finite and non-zero, got {}",
                        name, g
                    )));
                }
            }
        }
        if let Some(lo) = self.min_timestep {
            if !(lo.is_finite() && lo >= 0.0) {
                return Err(SimError::Config(format!(
                    "min_timestep must be finite and non-negative, got {}",
                    lo
                )));
            }
        }
        if let (Some(lo), Some(hi)) = (self.min_timestep, self.max_timestep) {
            if lo > hi {
                return Err(SimError::Config(format!(
                    "min_timestep {} exceeds max_timestep {}",
                    lo, hi
                )));
            }
        }
        if let Some(hi) = self.max_timestep {
            if !(hi > 0.0) {
                return Err(SimError::Config(format!(
                    "max_timestep must be positive, got {}",
                    hi
                )));
            }
        }
        Ok(())
    }

    pub fn schedule(&self) -> Result<Box<dyn TemperatureSchedule>> {
        match &self.temperature_schedule {
            Some(s) => s.build(),
            None => Ok(Box::new(Constant(self.temperature.unwrap_or(DEFAULT_TEMPERATURE)))),
        }
    }

    pub fn gamma_spec(&self) -> GammaSpec {
        match (self.gamma_ll, self.gamma_g) {
            (_, Some(g)) => GammaSpec::Gilbert(g),
            (Some(g), None) => GammaSpec::LandauLifshitz(g),
            (None, None) => GammaSpec::LandauLifshitz(GAMMA_LL_DEFAULT),
        }
    }

    pub fn thermal_inputs(&self, atlas: &dyn Atlas) -> Result<ThermalInputs> {
        Ok(ThermalInputs {
            alpha_by_region: per_region("alpha", self.alpha, &self.alpha_regions, atlas)?,
            gamma: self.gamma_spec(),
            allow_signed_gamma: self.allow_signed_gamma,
            curie_coupling: self.curie_coupling,
        })
    }
}

/// Provenance recorded alongside the config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: String,
    #[serde(default)]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub timestamp_utc: Option<String>,
}

/// Default value per region with named overrides.
fn per_region(
    what: &str,
    default: f64,
    overrides: &BTreeMap<String, f64>,
    atlas: &dyn Atlas,
) -> Result<Vec<f64>> {
    if !default.is_finite() {
        return Err(SimError::Config(format!("{} is not finite: {}", what, default)));
    }
    let mut values = vec![default; atlas.region_count()];
    for (entry, (name, &v)) in overrides.iter().enumerate() {
        let r = atlas.region_id(name).ok_or_else(|| SimError::UnknownRegion {
            channel: what.to_string(),
            entry,
            name: name.clone(),
            known: atlas.region_names().join(", "),
        })?;
        if !v.is_finite() {
            return Err(SimError::Config(format!(
                "{} for region \"{}\" is not finite: {}",
                what, name, v
            )));
        }
        values[r] = v;
    }
    Ok(values)
}

impl RunConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.evolver.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn write_to_dir(&self, out_dir: &Path) -> Result<()> {
        let path = out_dir.join("config.json");
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    /// Mesh, atlas and initial state Ms for this run.
    pub fn build_geometry(&self) -> Result<(Arc<dyn Mesh>, Arc<dyn Atlas>, Vec<f64>)> {
        let mesh: Arc<dyn Mesh> = Arc::new(self.geometry.build()?);
        let atlas: Arc<dyn Atlas> = Arc::new(self.atlas.build()?);
        let ms = self.material.ms_per_cell(mesh.as_ref(), atlas.as_ref())?;
        Ok((mesh, atlas, ms))
    }
}
