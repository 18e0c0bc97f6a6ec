// src/effective_field/zeeman.rs

use serde::{Deserialize, Serialize};

use crate::effective_field::{EnergyEval, EnergyTerm};
use crate::error::Result;
use crate::params::MU0;
use crate::state::SimState;
use crate::vec3::{add, add_scaled, cross, dot};

/// Uniform applied field H(t) = h0 + rate * t (A/m).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZeemanConfig {
    pub field: [f64; 3],
    #[serde(default)]
    pub rate: [f64; 3],
}

#[derive(Debug, Clone)]
pub struct ZeemanTerm {
    name: String,
    h0: [f64; 3],
    rate: [f64; 3],
}

impl ZeemanTerm {
    pub fn new(name: impl Into<String>, h0: [f64; 3]) -> Self {
        Self {
            name: name.into(),
            h0,
            rate: [0.0; 3],
        }
    }

    pub fn from_config(name: impl Into<String>, cfg: &ZeemanConfig) -> Self {
        Self {
            name: name.into(),
            h0: cfg.field,
            rate: cfg.rate,
        }
    }

    #[inline]
    pub fn field_at(&self, t: f64) -> [f64; 3] {
        add_scaled(self.h0, t, self.rate)
    }
}

impl EnergyTerm for ZeemanTerm {
    fn name(&self) -> &str {
        &self.name
    }

    /// e = -μ0 Ms m·H, pE/pt = -μ0 Σ Ms V m·dH/dt.
    fn accumulate(
        &self,
        state: &SimState,
        _previous: Option<&SimState>,
        acc: &mut EnergyEval,
    ) -> Result<()> {
        let h = self.field_at(state.total_time());
        let mesh = state.mesh();
        let ms = state.ms();
        let mut total = 0.0;
        let mut pe_pt = 0.0;

        for (i, &m) in state.spin().iter().enumerate() {
            if ms[i] == 0.0 {
                continue;
            }
            let vol = mesh.volume(i);
            let e = -MU0 * ms[i] * dot(m, h);
            acc.energy[i] += e;
            acc.field[i] = add(acc.field[i], h);
            acc.mxh[i] = add(acc.mxh[i], cross(m, h));
            total += e * vol;
            pe_pt += -MU0 * ms[i] * vol * dot(m, self.rate);
        }

        acc.total_energy += total;
        acc.pe_pt += pe_pt;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effective_field::evaluate_terms;
    use crate::grid::{Grid3D, Mesh};
    use crate::state::StateBuilder;
    use std::sync::Arc;

    #[test]
    fn aligned_spin_has_negative_energy_and_no_torque() {
        let mesh: Arc<dyn Mesh> = Arc::new(Grid3D::new(2, 1, 1, 1e-9, 1e-9, 1e-9));
        let state = StateBuilder::initial(mesh, vec![8e5, 0.0]).fix().unwrap();
        let terms: Vec<Box<dyn EnergyTerm>> =
            vec![Box::new(ZeemanTerm::new("zeeman", [0.0, 0.0, 1e4]))];
        let out = evaluate_terms(&terms, &state, None).unwrap();

        let expected = -MU0 * 8e5 * 1e4;
        assert!((out.energy[0] - expected).abs() < 1e-9 * expected.abs());
        assert_eq!(out.energy[1], 0.0);
        assert_eq!(out.mxh[0], [0.0, 0.0, 0.0]);
        assert!((out.total_energy - expected * 1e-27).abs() < 1e-12 * expected.abs() * 1e-27);
        assert_eq!(out.pe_pt, 0.0);
    }

    #[test]
    fn ramped_field_reports_power() {
        let mesh: Arc<dyn Mesh> = Arc::new(Grid3D::new(1, 1, 1, 1.0, 1.0, 1.0));
        let state = StateBuilder::uniform(mesh, 1.0).fix().unwrap();
        let term = ZeemanTerm::from_config(
            "z",
            &ZeemanConfig {
                field: [0.0; 3],
                rate: [0.0, 0.0, 2.0],
            },
        );
        let mut acc = EnergyEval::zeros(1);
        term.accumulate(&state, None, &mut acc).unwrap();
        assert!((acc.pe_pt + MU0 * 2.0).abs() < 1e-18);
    }
}
