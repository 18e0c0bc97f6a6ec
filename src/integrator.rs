// src/integrator.rs
//
// Adaptive-step stochastic Landau-Lifshitz-Bloch evolver (Euler scheme).
//
// One `step` proposes a trial state from the cached dm/dt of the current
// state, evaluates energy and dm/dt at the trial state, and accepts or
// rejects it against three error controls plus an energy-consistency bound:
//
//   error          = ½ · max_i |dm/dt_old(i) - dm/dt_new(i)|
//   working error  = min(1.25·error/headroom, error_rate, abs_err/h, rel_err·max|dm/dt|)
//   energy bound   ΔE ≤ ½(pE/pt_old + pE/pt_new)·h + max(ε|E|, 2·sqrt(var ΔE))
//
// Forced steps (raised to min_timestep or the timestep lower bound) are
// always accepted. The stochastic field for a given iteration is sampled once,
// so a rejected trial retried from the same state sees the same noise.

use std::sync::Arc;

use log::{info, trace, warn};

use crate::atlas::Atlas;
use crate::config::{EvolverConfig, RunConfig};
use crate::effective_field::exchange::ExchangeKernel;
use crate::effective_field::zeeman::ZeemanTerm;
use crate::effective_field::{evaluate_terms, EnergyEval, EnergyTerm};
use crate::error::{Result, SimError};
use crate::noise::{GaussianSampler, NoiseField};
use crate::params::{deg_per_ns_to_rad_per_s, deg_to_rad, rad_per_s_to_deg_per_ns, EPS, MU0};
use crate::state::{keys, SimState, StateBuilder};
use crate::temperature::TemperatureSchedule;
use crate::thermal::{ThermalParameterCache, ThermalParameterSet};
use crate::vec3::{add, cross, mag_sq, normalize, scale, sub};

pub const MAX_STEP_INCREASE: f64 = 1.25;
pub const MAX_STEP_DECREASE: f64 = 0.5;

/// Default step bounds at zero temperature.
const ZERO_T_MIN_TIMESTEP: f64 = 0.0;
const ZERO_T_MAX_TIMESTEP: f64 = 1e-10;

/// Step-size control in SI units (s, rad, rad/s).
#[derive(Debug, Clone, PartialEq)]
pub struct StepControl {
    /// Noise correlation time; also the timestep lower bound at T > 0.
    pub fixed_timestep: f64,
    pub min_timestep: f64,
    pub max_timestep: f64,
    pub error_rate: Option<f64>,
    pub absolute_step_error: Option<f64>,
    pub relative_step_error: Option<f64>,
    pub step_headroom: f64,
    pub start_dm: f64,
    pub ito_calculus: bool,
    pub do_precess: bool,
}

impl StepControl {
    /// Unit conversion and temperature-dependent step bounds.
    /// `initial_temperature` decides the min/max defaults.
    pub fn from_config(cfg: &EvolverConfig, initial_temperature: f64) -> Result<Self> {
        cfg.validate()?;
        let (def_min, def_max) = if initial_temperature == 0.0 {
            (ZERO_T_MIN_TIMESTEP, ZERO_T_MAX_TIMESTEP)
        } else {
            (cfg.fixed_timestep, cfg.fixed_timestep)
        };
        let min_timestep = cfg.min_timestep.unwrap_or(def_min);
        let max_timestep = cfg.max_timestep.unwrap_or(def_max);
        if min_timestep > max_timestep {
            return Err(SimError::Config(format!(
                "min_timestep {} exceeds max_timestep {}",
                min_timestep, max_timestep
            )));
        }
        let enabled = |v: f64| if v > 0.0 { Some(v) } else { None };
        Ok(Self {
            fixed_timestep: cfg.fixed_timestep,
            min_timestep,
            max_timestep,
            error_rate: enabled(cfg.error_rate).map(deg_per_ns_to_rad_per_s),
            absolute_step_error: enabled(cfg.absolute_step_error).map(deg_to_rad),
            relative_step_error: enabled(cfg.relative_step_error),
            step_headroom: cfg.step_headroom,
            start_dm: deg_to_rad(cfg.start_dm),
            ito_calculus: cfg.ito_calculus,
            do_precess: cfg.do_precess,
        })
    }
}

/// Phase of the step currently in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    Idle,
    Propose,
    Evaluate,
    Accept,
    Reject,
}

impl StepPhase {
    fn can_enter(self, next: StepPhase) -> bool {
        use StepPhase::*;
        matches!(
            (self, next),
            (Idle, Propose)
                | (Propose, Evaluate)
                | (Evaluate, Accept)
                | (Evaluate, Reject)
                | (Accept, Idle)
                | (Reject, Idle)
        )
    }
}

#[derive(Debug, Clone)]
pub enum StepOutcome {
    Accepted {
        state: Arc<SimState>,
        next_timestep: f64,
    },
    Rejected {
        next_timestep: f64,
    },
}

impl StepOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, StepOutcome::Accepted { .. })
    }

    pub fn next_timestep(&self) -> f64 {
        match *self {
            StepOutcome::Accepted { next_timestep, .. } | StepOutcome::Rejected { next_timestep } => {
                next_timestep
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepStats {
    pub accepted: usize,
    pub rejected: usize,
    pub forced: usize,
}

/// dm/dt and its reductions for one state.
#[derive(Debug, Clone)]
struct DmDt {
    dm_dt: Vec<[f64; 3]>,
    max_dm_dt: f64,
    de_dt: f64,
    timestep_lower_bound: f64,
}

/// Energy and dm/dt of the state the next step starts from.
#[derive(Debug, Clone)]
struct CurrentCache {
    state_id: u64,
    energy: Vec<f64>,
    dm_dt: Vec<[f64; 3]>,
}

pub struct LlbEvolver {
    control: StepControl,
    terms: Vec<Box<dyn EnergyTerm>>,
    thermal: ThermalParameterCache,
    schedule: Box<dyn TemperatureSchedule>,
    sampler: GaussianSampler,
    noise: NoiseField,
    fixed_spins: Vec<usize>,
    temperature: f64,
    temperature_stage: Option<u32>,
    phase: StepPhase,
    next_timestep: f64,
    cache: Option<CurrentCache>,
    /// Last accepted or stage-ending state, for kernels that carry history.
    predecessor: Option<Arc<SimState>>,
    stats: StepStats,
}

impl LlbEvolver {
    pub fn new(
        control: StepControl,
        terms: Vec<Box<dyn EnergyTerm>>,
        thermal: ThermalParameterCache,
        schedule: Box<dyn TemperatureSchedule>,
        seed: Option<u64>,
        fixed_spins: Vec<usize>,
    ) -> Self {
        let temperature = schedule.temperature(0, 0.0).abs();
        Self {
            control,
            terms,
            thermal,
            schedule,
            sampler: GaussianSampler::new(seed),
            noise: NoiseField::new(),
            fixed_spins,
            temperature,
            temperature_stage: None,
            phase: StepPhase::Idle,
            next_timestep: 0.0,
            cache: None,
            predecessor: None,
            stats: StepStats::default(),
        }
    }

    /// Evolver for `cfg` with the given energy terms.
    pub fn from_config(
        cfg: &EvolverConfig,
        terms: Vec<Box<dyn EnergyTerm>>,
        atlas: Arc<dyn Atlas>,
    ) -> Result<Self> {
        cfg.validate()?;
        let schedule = cfg.schedule()?;
        let control = StepControl::from_config(cfg, schedule.temperature(0, 0.0).abs())?;
        let thermal = ThermalParameterCache::new(cfg.thermal_inputs(atlas.as_ref())?, atlas)?;
        Ok(Self::new(
            control,
            terms,
            thermal,
            schedule,
            cfg.uniform_seed,
            cfg.fixed_spins.clone(),
        ))
    }

    /// Evolver plus initial state for a full run configuration. Energy terms
    /// are the exchange kernel, then the Zeeman term if configured.
    pub fn from_run_config(cfg: &RunConfig) -> Result<(Self, Arc<SimState>)> {
        let (mesh, atlas, ms) = cfg.build_geometry()?;
        let coefficients = cfg.exchange.resolve(atlas.as_ref())?;
        let mut terms: Vec<Box<dyn EnergyTerm>> = vec![Box::new(ExchangeKernel::new(
            "exchange",
            Arc::clone(&atlas),
            coefficients,
            mesh.as_ref(),
        )?)];
        if let Some(z) = &cfg.zeeman {
            terms.push(Box::new(ZeemanTerm::from_config("zeeman", z)));
        }
        let evolver = Self::from_config(&cfg.evolver, terms, atlas)?;

        let mut b = StateBuilder::initial(mesh, ms);
        cfg.initial.apply(&mut b);
        Ok((evolver, b.fix()?))
    }

    pub fn control(&self) -> &StepControl {
        &self.control
    }

    pub fn phase(&self) -> StepPhase {
        self.phase
    }

    pub fn stats(&self) -> StepStats {
        self.stats
    }

    pub fn temperature(&self) -> f64 {
        self.temperature
    }

    pub fn noise_refresh_count(&self) -> usize {
        self.noise.refresh_count()
    }

    /// Suggested size of the next step; 0 lets the evolver pick from start_dm.
    pub fn timestep_hint(&self) -> f64 {
        self.next_timestep
    }

    pub fn set_timestep_hint(&mut self, h: f64) {
        self.next_timestep = if h.is_finite() && h > 0.0 { h } else { 0.0 };
    }

    /// Reseed the noise generator and drop the sampled field.
    pub fn reseed(&mut self, seed: Option<u64>) {
        self.sampler.reseed(seed);
        self.noise.invalidate();
    }

    fn enter(&mut self, next: StepPhase) -> Result<()> {
        if !self.phase.can_enter(next) {
            return Err(SimError::Consistency(format!(
                "invalid step phase transition {:?} -> {:?}",
                self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Attempt one step from `current`.
    pub fn step(&mut self, current: &Arc<SimState>) -> Result<StepOutcome> {
        self.enter(StepPhase::Propose)?;
        let result = self.try_step(current);
        self.phase = StepPhase::Idle;
        result
    }

    /// Successor of `state` that starts the next stage.
    pub fn advance_stage(&mut self, state: &Arc<SimState>) -> Result<Arc<SimState>> {
        let mut b = StateBuilder::successor(state);
        b.stage_number = state.stage_number() + 1;
        b.stage_iteration_count = 0;
        b.stage_start_time = state.stage_start_time() + state.stage_elapsed_time();
        b.stage_elapsed_time = 0.0;
        let next = b.fix()?;
        self.predecessor = Some(Arc::clone(state));
        Ok(next)
    }

    /// `Max dm/dt` of `state` in deg/ns, computing it if needed.
    pub fn reported_max_dm_dt_deg_per_ns(&mut self, state: &Arc<SimState>) -> Result<f64> {
        if let Some(v) = state.derived().get(keys::MAX_DM_DT) {
            return Ok(rad_per_s_to_deg_per_ns(v));
        }
        self.refresh_temperature(state);
        self.ensure_current(state)?;
        let v = state.derived().get(keys::MAX_DM_DT).ok_or_else(|| {
            SimError::Consistency(format!("Max dm/dt missing on state {}", state.id()))
        })?;
        Ok(rad_per_s_to_deg_per_ns(v))
    }

    fn refresh_temperature(&mut self, state: &SimState) {
        let stage = state.stage_number();
        if self.temperature_stage == Some(stage) && !self.schedule.varies_within_stage() {
            return;
        }
        let t = self.schedule.temperature(stage, state.total_time()).abs();
        if self.temperature_stage != Some(stage) {
            info!("stage {}: temperature {} K", stage, t);
        } else if t != self.temperature {
            trace!("temperature {} K at t={:e} s", t, state.total_time());
        }
        if t != self.temperature {
            // Sampled noise is scaled for the old temperature.
            self.noise.invalidate();
        }
        self.temperature = t;
        self.temperature_stage = Some(stage);
    }

    fn try_step(&mut self, current: &Arc<SimState>) -> Result<StepOutcome> {
        self.refresh_temperature(current);
        self.ensure_current(current)?;

        let derived = current.derived();
        let fetch = |key: &str| {
            derived.get(key).ok_or_else(|| {
                SimError::Consistency(format!(
                    "invalid data cache: \"{}\" missing on state {}",
                    key,
                    current.id()
                ))
            })
        };
        let max_dm_dt = fetch(keys::MAX_DM_DT)?;
        let pe_pt = fetch(keys::PE_PT)?;
        let timestep_lower_bound = fetch(keys::TIMESTEP_LOWER_BOUND)?;
        fetch(keys::DE_DT)?;
        fetch(keys::DELTA_E)?;

        let cache = match self.cache.take() {
            Some(c) if c.state_id == current.id() => c,
            _ => {
                return Err(SimError::Consistency(format!(
                    "invalid data cache for state {}",
                    current.id()
                )))
            }
        };

        // Propose.
        let c = &self.control;
        let mut stepsize = self.next_timestep;
        if stepsize <= 0.0 {
            let cap = (f64::MAX / 4.0).sqrt();
            stepsize = if c.start_dm < cap * max_dm_dt {
                c.start_dm / max_dm_dt
            } else {
                cap
            };
        }
        let mut forced = false;
        if stepsize < c.min_timestep {
            stepsize = c.min_timestep;
            forced = true;
        }
        if stepsize > c.max_timestep {
            stepsize = c.max_timestep;
        }
        if stepsize < timestep_lower_bound {
            warn!(
                "step {:e} s below lower bound {:e} s; forcing",
                stepsize, timestep_lower_bound
            );
            stepsize = timestep_lower_bound;
            forced = true;
        }

        let mut b = StateBuilder::successor(current);
        b.iteration_count = current.iteration_count() + 1;
        b.stage_iteration_count = current.stage_iteration_count() + 1;
        b.stage_elapsed_time = current.stage_elapsed_time() + stepsize;
        b.last_timestep = stepsize;
        for (i, m) in current.spin().iter().enumerate() {
            let mut d = scale(stepsize, cache.dm_dt[i]);
            let adj = 0.5 * mag_sq(d);
            d = scale(1.0 / (1.0 + adj), sub(d, scale(adj, *m)));
            b.spin[i] = normalize(add(*m, d));
        }
        let next = b.fix()?;

        // Evaluate.
        self.enter(StepPhase::Evaluate)?;
        let eval = evaluate_terms(&self.terms, &next, Some(current.as_ref()))?;
        let mesh = next.mesh();

        let mut delta_e = 0.0;
        let mut var_de = 0.0;
        let mut total_e = 0.0;
        for i in 0..next.n_cells() {
            let vol = mesh.volume(i);
            let e = cache.energy[i];
            let new_e = eval.energy[i];
            total_e += e * vol;
            delta_e += (new_e - e) * vol;
            var_de += (new_e * new_e + e * e) * vol * vol;
        }
        var_de *= 256.0 * EPS * EPS / 3.0;

        let thermal = self.thermal.get(&next, self.temperature)?;
        let new = self.compute_dm_dt(&next, &eval, &thermal)?;

        let max_error = cache
            .dm_dt
            .iter()
            .zip(&new.dm_dt)
            .map(|(a, b)| mag_sq(sub(*a, *b)))
            .fold(0.0_f64, f64::max)
            .sqrt()
            / 2.0;

        let max_allowed_de = 0.5 * (pe_pt + eval.pe_pt) * stepsize
            + (EPS * total_e.abs()).max(2.0 * var_de.sqrt());

        let c = self.control.clone();
        let mut working = MAX_STEP_INCREASE * max_error / c.step_headroom;
        if let Some(rate) = c.error_rate {
            if working > rate {
                working = rate;
            }
        }
        if let Some(abs_err) = c.absolute_step_error {
            if stepsize * working > abs_err {
                working = abs_err / stepsize;
            }
        }
        if let Some(rel) = c.relative_step_error {
            if working > rel * max_dm_dt {
                working = rel * max_dm_dt;
            }
        }

        if !forced {
            let mut factor = 1.0;
            if max_error > working {
                factor = c.step_headroom * working / max_error;
            } else if delta_e > max_allowed_de {
                factor = 0.5;
            }
            if factor < 1.0 {
                self.enter(StepPhase::Reject)?;
                let next_timestep = factor.max(MAX_STEP_DECREASE) * stepsize;
                self.next_timestep = next_timestep;
                self.cache = Some(cache);
                self.stats.rejected += 1;
                trace!(
                    "reject h={:e} s: error={:e} working={:e} dE={:e} allowed={:e}",
                    stepsize,
                    max_error,
                    working,
                    delta_e,
                    max_allowed_de
                );
                return Ok(StepOutcome::Rejected { next_timestep });
            }
        }

        self.enter(StepPhase::Accept)?;
        let mut factor = MAX_STEP_INCREASE;
        if factor * max_error > c.step_headroom * working {
            factor = c.step_headroom * working / max_error;
        }
        let next_timestep = factor.max(MAX_STEP_DECREASE) * stepsize;

        let nd = next.derived();
        nd.set(keys::TIMESTEP_LOWER_BOUND, new.timestep_lower_bound)?;
        nd.set(keys::MAX_DM_DT, new.max_dm_dt)?;
        nd.set(keys::DE_DT, new.de_dt)?;
        nd.set(keys::DELTA_E, delta_e)?;
        nd.set(keys::PE_PT, eval.pe_pt)?;

        self.next_timestep = next_timestep;
        self.cache = Some(CurrentCache {
            state_id: next.id(),
            energy: eval.energy,
            dm_dt: new.dm_dt,
        });
        self.predecessor = Some(Arc::clone(&next));
        self.stats.accepted += 1;
        if forced {
            self.stats.forced += 1;
        }
        trace!(
            "accept h={:e} s{}: error={:e} dE={:e}, next h={:e} s",
            stepsize,
            if forced { " (forced)" } else { "" },
            max_error,
            delta_e,
            next_timestep
        );
        Ok(StepOutcome::Accepted {
            state: next,
            next_timestep,
        })
    }

    /// Make the energy/dm-dt cache describe `state`, attaching any missing
    /// derived data.
    fn ensure_current(&mut self, state: &Arc<SimState>) -> Result<()> {
        if matches!(&self.cache, Some(c) if c.state_id == state.id()) {
            return Ok(());
        }
        self.cache = None;

        let previous = self
            .predecessor
            .as_deref()
            .filter(|p| state.previous_id() == Some(p.id()));
        let eval = evaluate_terms(&self.terms, state, previous)?;
        let thermal = self.thermal.get(state, self.temperature)?;
        let dm = self.compute_dm_dt(state, &eval, &thermal)?;

        let d = state.derived();
        d.get_or_set(keys::PE_PT, eval.pe_pt);
        d.get_or_set(keys::MAX_DM_DT, dm.max_dm_dt);
        d.get_or_set(keys::DE_DT, dm.de_dt);
        d.get_or_set(keys::TIMESTEP_LOWER_BOUND, dm.timestep_lower_bound);
        if !d.contains(keys::DELTA_E) {
            if state.previous_id().is_some() && state.stage_iteration_count() > 0 {
                return Err(SimError::Consistency(format!(
                    "can't derive Delta E from single state {}",
                    state.id()
                )));
            }
            d.set(keys::DELTA_E, 0.0)?;
        }

        self.cache = Some(CurrentCache {
            state_id: state.id(),
            energy: eval.energy,
            dm_dt: dm.dm_dt,
        });
        Ok(())
    }

    /// Stochastic LLB right-hand side:
    ///   dm/dt = -|γ| m×(H + h)                      (if precessing)
    ///           - |α⊥||γ| m×(m×(H + h))
    ///           + (drift/Ms) m                      (Stratonovich only)
    fn compute_dm_dt(
        &mut self,
        state: &SimState,
        eval: &EnergyEval,
        thermal: &ThermalParameterSet,
    ) -> Result<DmDt> {
        let n = state.n_cells();
        let mesh = state.mesh();
        let ms = state.ms();
        let spin = state.spin();
        let c = &self.control;

        let sigmas = thermal.noise_sigmas(state, c.fixed_timestep);
        let noise = self
            .noise
            .refresh(state.iteration_count(), mesh.id(), &sigmas, &mut self.sampler);

        let mut dm_dt = vec![[0.0; 3]; n];
        for i in 0..n {
            if ms[i] == 0.0 {
                continue;
            }
            let m = spin[i];
            let g = thermal.gamma[i].abs();
            let a = thermal.alpha_perp[i].abs();

            let det = scale(-g, eval.mxh[i]);
            let fluct = scale(-g, cross(m, noise[i]));
            let mut d = if c.do_precess { add(det, fluct) } else { [0.0; 3] };
            d = add(d, scale(-a, cross(det, m)));
            d = add(d, scale(-a, cross(fluct, m)));
            if !c.ito_calculus {
                d = add(d, scale(thermal.drift_const[i] / ms[i], m));
            }
            dm_dt[i] = d;
        }

        for &i in &self.fixed_spins {
            match dm_dt.get_mut(i) {
                Some(d) => *d = [0.0; 3],
                None => {
                    return Err(SimError::Config(format!(
                        "fixed spin index {} outside mesh of {} cells",
                        i, n
                    )))
                }
            }
        }

        let mut max_sq = 0.0;
        let mut max_index = 0;
        let mut de_dt_sum = 0.0;
        for i in 0..n {
            let sq = mag_sq(dm_dt[i]);
            if sq > 0.0 {
                de_dt_sum += -MU0
                    * (thermal.gamma[i] * thermal.alpha_perp[i]).abs()
                    * mag_sq(eval.mxh[i])
                    * ms[i]
                    * mesh.volume(i);
                if sq > max_sq {
                    max_sq = sq;
                    max_index = i;
                }
            }
        }
        let max_dm_dt = max_sq.sqrt();

        let timestep_lower_bound = if self.temperature == 0.0 {
            zero_t_lower_bound(spin[max_index], dm_dt[max_index], max_dm_dt)
        } else {
            c.fixed_timestep
        };

        Ok(DmDt {
            dm_dt,
            max_dm_dt,
            de_dt: de_dt_sum + eval.pe_pt,
            timestep_lower_bound,
        })
    }
}

/// Smallest step that still changes the fastest-moving spin in floating
/// point: ε · min_c |m_c / (dm/dt)_c| over components that matter.
fn zero_t_lower_bound(m: [f64; 3], d: [f64; 3], max_dm_dt: f64) -> f64 {
    if max_dm_dt == 0.0 {
        return 0.0;
    }
    let mut min_ratio = f64::MAX / 2.0;
    for k in 0..3 {
        if d[k].abs() >= 1.0 || min_ratio * d[k].abs() > m[k].abs() {
            min_ratio = (m[k] / d[k]).abs();
        }
    }
    min_ratio * EPS
}
