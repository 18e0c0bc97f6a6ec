// src/equilibrium.rs
//
// Mean-field equilibrium of a classical spin with exchange coupling J:
//     m_e = L(J m_e / (k_B T)),   L(x) = coth x - 1/x
// Writing x = J m_e / (k_B T) and A = k_B T / J this is L(x) = A x, which
// has a non-zero root only for 0 < A < 1/3 (i.e. T < T_c = J / (3 k_B)).

use crate::error::{Result, SimError};
use crate::params::{KB, MU0};

pub const MAX_NEWTON_ITERATIONS: usize = 200;

const SERIES_CUTOFF: f64 = 1e-2;

/// Langevin function coth(x) - 1/x.
pub fn langevin(x: f64) -> f64 {
    if x.abs() < SERIES_CUTOFF {
        let x2 = x * x;
        x * (1.0 / 3.0 - x2 / 45.0 + 2.0 * x2 * x2 / 945.0)
    } else {
        1.0 / x.tanh() - 1.0 / x
    }
}

/// dL/dx = 1/x² - 1/sinh² x.
pub fn langevin_deriv(x: f64) -> f64 {
    if x.abs() < SERIES_CUTOFF {
        let x2 = x * x;
        1.0 / 3.0 - x2 / 15.0 + 2.0 * x2 * x2 / 189.0
    } else {
        let s = x.sinh();
        1.0 / (x * x) - 1.0 / (s * s)
    }
}

pub fn curie_temperature(j: f64) -> f64 {
    j / (3.0 * KB)
}

/// Equilibrium spin polarization m_e in [0, 1).
///
/// Returns exactly 0 in the paramagnetic regime (A ≤ 0 or A ≥ 1/3) and for
/// non-finite A. Newton iteration on L(x) - A x from x0 = 1/A stops once the
/// residual is below `tol`.
pub fn solve_equilibrium_polarization(j: f64, temperature: f64, tol: f64) -> Result<f64> {
    let a = KB * temperature / j;
    if !a.is_finite() || a <= 0.0 || a >= 1.0 / 3.0 {
        return Ok(0.0);
    }
    let tol = tol.abs();

    let mut x = 1.0 / a;
    let mut y = langevin(x) - a * x;
    let mut iterations = 0;
    while y.abs() >= tol {
        if iterations == MAX_NEWTON_ITERATIONS {
            return Err(SimError::Convergence(format!(
                "equilibrium polarization did not converge in {} iterations (J={:e}, T={}, A={}, residual={:e})",
                MAX_NEWTON_ITERATIONS, j, temperature, a, y
            )));
        }
        let dy = langevin_deriv(x) - a;
        if dy == 0.0 {
            return Err(SimError::Convergence(format!(
                "zero Newton derivative at x={} (J={:e}, T={}, A={})",
                x, j, temperature, a
            )));
        }
        x -= y / dy;
        if !x.is_finite() {
            return Err(SimError::Convergence(format!(
                "non-finite Newton iterate (J={:e}, T={}, A={})",
                j, temperature, a
            )));
        }
        y = langevin(x) - a * x;
        iterations += 1;
    }
    Ok(a * x)
}

/// Longitudinal susceptibility χ_l for moment `mu` (A·m²) at polarization
/// `m_e`. Paramagnetic regime: μ0 μ / J.
pub fn longitudinal_susceptibility(j: f64, temperature: f64, mu: f64, m_e: f64) -> f64 {
    let kb_t = KB * temperature;
    let a = kb_t / j;
    if !a.is_finite() || a <= 0.0 || a >= 1.0 / 3.0 {
        return MU0 * mu / j;
    }
    let beta = 1.0 / kb_t;
    let dl = langevin_deriv(j * m_e * beta);
    MU0 * mu * beta * dl / (1.0 - beta * j * dl)
}
