// src/temperature.rs
//
// Temperature sources for the thermal evolver.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SimError};

pub trait TemperatureSchedule: Send + Sync + std::fmt::Debug {
    /// Temperature (K) at a point in the run.
    fn temperature(&self, stage: u32, total_time: f64) -> f64;

    /// True if the value can change without a stage change.
    fn varies_within_stage(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Constant(pub f64);

impl TemperatureSchedule for Constant {
    fn temperature(&self, _stage: u32, _total_time: f64) -> f64 {
        self.0
    }
}

/// One value per stage; the last value holds for all later stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Staged {
    values: Vec<f64>,
}

impl Staged {
    pub fn new(values: Vec<f64>) -> Result<Self> {
        if values.is_empty() {
            return Err(SimError::Config(
                "staged temperature schedule needs at least one value".to_string(),
            ));
        }
        if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
            return Err(SimError::Config(format!(
                "staged temperature schedule contains non-finite value {}",
                bad
            )));
        }
        Ok(Self { values })
    }
}

impl TemperatureSchedule for Staged {
    fn temperature(&self, stage: u32, _total_time: f64) -> f64 {
        let i = (stage as usize).min(self.values.len() - 1);
        self.values[i]
    }
}

/// Piecewise-linear T(t) through (time, temperature) points, clamped at
/// both ends.
#[derive(Debug, Clone, PartialEq)]
pub struct Table {
    points: Vec<(f64, f64)>,
}

impl Table {
    pub fn new(points: Vec<(f64, f64)>) -> Result<Self> {
        if points.is_empty() {
            return Err(SimError::Config(
                "temperature table needs at least one point".to_string(),
            ));
        }
        for (k, &(t, temp)) in points.iter().enumerate() {
            if !t.is_finite() || !temp.is_finite() {
                return Err(SimError::Config(format!(
                    "temperature table point {} is not finite: ({}, {})",
                    k, t, temp
                )));
            }
            if k > 0 && t <= points[k - 1].0 {
                return Err(SimError::Config(format!(
                    "temperature table times must increase (point {} at t={} after t={})",
                    k,
                    t,
                    points[k - 1].0
                )));
            }
        }
        Ok(Self { points })
    }
}

impl TemperatureSchedule for Table {
    fn temperature(&self, _stage: u32, total_time: f64) -> f64 {
        let pts = &self.points;
        let first = pts[0];
        let last = pts[pts.len() - 1];
        if total_time <= first.0 {
            return first.1;
        }
        if total_time >= last.0 {
            return last.1;
        }
        let k = pts.partition_point(|&(t, _)| t <= total_time);
        let (t0, v0) = pts[k - 1];
        let (t1, v1) = pts[k];
        v0 + (v1 - v0) * (total_time - t0) / (t1 - t0)
    }

    fn varies_within_stage(&self) -> bool {
        self.points.len() > 1
    }
}

/// Serialized form of a non-constant schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleConfig {
    Staged { values: Vec<f64> },
    Table { points: Vec<(f64, f64)> },
}

impl ScheduleConfig {
    pub fn build(&self) -> Result<Box<dyn TemperatureSchedule>> {
        Ok(match self {
            ScheduleConfig::Staged { values } => Box::new(Staged::new(values.clone())?),
            ScheduleConfig::Table { points } => Box::new(Table::new(points.clone())?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn staged_holds_last_value() {
        let s = Staged::new(vec![10.0, 20.0]).unwrap();
        assert_eq!(s.temperature(0, 5.0), 10.0);
        assert_eq!(s.temperature(1, 0.0), 20.0);
        assert_eq!(s.temperature(7, 0.0), 20.0);
        assert!(!s.varies_within_stage());
        assert!(Staged::new(vec![]).is_err());
    }

    #[test]
    fn table_interpolates_and_clamps() {
        let t = Table::new(vec![(0.0, 0.0), (1e-9, 100.0), (2e-9, 100.0)]).unwrap();
        assert_eq!(t.temperature(0, -1.0), 0.0);
        assert!((t.temperature(0, 0.25e-9) - 25.0).abs() < 1e-9);
        assert_eq!(t.temperature(0, 1.5e-9), 100.0);
        assert_eq!(t.temperature(3, 9e-9), 100.0);
        assert!(t.varies_within_stage());
    }

    #[test]
    fn table_rejects_unsorted_times() {
        let err = Table::new(vec![(1.0, 0.0), (0.5, 1.0)]).unwrap_err();
        assert!(err.to_string().contains("must increase"));
    }

    #[test]
    fn schedule_config_round_trips_through_json() {
        let cfg: ScheduleConfig =
            serde_json::from_str(r#"{"kind":"staged","values":[300.0,0.0]}"#).unwrap();
        let s = cfg.build().unwrap();
        assert_eq!(s.temperature(1, 0.0), 0.0);
    }
}
