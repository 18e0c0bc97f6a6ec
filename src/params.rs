// src/params.rs

use std::f64::consts::PI;

/// Vacuum permeability (T·m/A).
pub const MU0: f64 = 4.0 * PI * 1e-7;

/// Boltzmann constant (J/K), same value the thermal evolver has always used.
pub const KB: f64 = 1.38062e-23;

/// Default Landau-Lifshitz gyromagnetic ratio (m/(A·s)).
pub const GAMMA_LL_DEFAULT: f64 = 2.211e5;

/// Machine epsilon shorthand used by the step controller.
pub const EPS: f64 = f64::EPSILON;

#[inline]
pub fn deg_to_rad(deg: f64) -> f64 {
    deg * PI / 180.0
}

/// deg/ns -> rad/s
#[inline]
pub fn deg_per_ns_to_rad_per_s(rate: f64) -> f64 {
    rate * PI * 1e9 / 180.0
}

/// rad/s -> deg/ns
#[inline]
pub fn rad_per_s_to_deg_per_ns(rate: f64) -> f64 {
    rate * 180e-9 / PI
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_conversions_invert() {
        let r = 123.5;
        let back = rad_per_s_to_deg_per_ns(deg_per_ns_to_rad_per_s(r));
        assert!((back - r).abs() < 1e-12);
        assert!((deg_to_rad(180.0) - PI).abs() < 1e-15);
    }
}
