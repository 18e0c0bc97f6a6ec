// src/effective_field/mod.rs
//
// Energy terms and their accumulation into one effective field H (A/m).
//
// Each term adds its energy density (J/m^3), field, torque m × H and
// explicit time derivative of the energy pE/pt (J/s) into an `EnergyEval`.

pub mod exchange;
pub mod zeeman;

use crate::error::{Result, SimError};
use crate::state::SimState;

/// Summed output of all energy terms for one state.
#[derive(Debug, Clone)]
pub struct EnergyEval {
    /// Energy density per cell (J/m^3).
    pub energy: Vec<f64>,
    /// Effective field per cell (A/m).
    pub field: Vec<[f64; 3]>,
    /// m × H per cell (A/m).
    pub mxh: Vec<[f64; 3]>,
    /// Total energy (J).
    pub total_energy: f64,
    /// Explicit time derivative of the energy (J/s).
    pub pe_pt: f64,
}

impl EnergyEval {
    pub fn zeros(n: usize) -> Self {
        Self {
            energy: vec![0.0; n],
            field: vec![[0.0; 3]; n],
            mxh: vec![[0.0; 3]; n],
            total_energy: 0.0,
            pe_pt: 0.0,
        }
    }

    pub fn n_cells(&self) -> usize {
        self.energy.len()
    }
}

pub trait EnergyTerm: Send + Sync {
    fn name(&self) -> &str;

    /// Add this term's contribution for `state` into `acc`.
    /// `previous` is the state `state` was stepped from, if still around.
    fn accumulate(
        &self,
        state: &SimState,
        previous: Option<&SimState>,
        acc: &mut EnergyEval,
    ) -> Result<()>;
}

/// Evaluate all terms and sum them.
pub fn evaluate_terms(
    terms: &[Box<dyn EnergyTerm>],
    state: &SimState,
    previous: Option<&SimState>,
) -> Result<EnergyEval> {
    let mut acc = EnergyEval::zeros(state.n_cells());
    for term in terms {
        term.accumulate(state, previous, &mut acc)?;
    }
    if !acc.total_energy.is_finite() {
        return Err(SimError::Consistency(format!(
            "non-finite total energy {} for state {}",
            acc.total_energy,
            state.id()
        )));
    }
    Ok(acc)
}
