use crate::parameter::{ParameterDomain, ParameterSpec};
use crate::profile::geometry::{self, NGEOMETRY, elliptical_radius};
use crate::profile::{ProfileTrait, WindowStats};

use macro_const::macro_const;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

macro_const! {
    const DOC: &str = r#"
Sersic profile

Radial brightness law for galaxies:

$$
I(r) = I_e \exp\left\{-b_n\left[\left(\frac{r}{R_e}\right)^{1/n} - 1\right]\right\},
$$

where $r$ is the elliptical radius, $R_e$ is the half-light radius, $I_e$ is the surface
brightness at $R_e$ and $b_n$ is chosen so that $R_e$ encloses half of the total flux.

- Parameters: `x`, `y`, `q`, `pa`, `n`, `re`, `ie`
"#;
}

const SPECS: [ParameterSpec; NGEOMETRY + 3] = [
    geometry::X,
    geometry::Y,
    geometry::Q,
    geometry::PA,
    ParameterSpec {
        name: "n",
        domain: ParameterDomain::StrictlyPositive,
        default: 2.0,
        lower: 0.36,
        upper: 8.0,
        description: "Sersic index",
    },
    ParameterSpec {
        name: "re",
        domain: ParameterDomain::StrictlyPositive,
        default: 1.0,
        lower: 1e-6,
        upper: f64::INFINITY,
        description: "half-light radius",
    },
    ParameterSpec {
        name: "ie",
        domain: ParameterDomain::Positive,
        default: 1.0,
        lower: 0.0,
        upper: f64::INFINITY,
        description: "surface brightness at the half-light radius",
    },
];

#[doc = DOC!()]
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct Sersic {}

impl Sersic {
    pub fn new() -> Self {
        Self {}
    }

    pub fn doc() -> &'static str {
        DOC
    }

    /// Ciotti & Bertin (1999) asymptotic expansion of the half-light constant
    pub fn b_n(n: f64) -> f64 {
        2.0 * n - 1.0 / 3.0 + 4.0 / (405.0 * n) + 46.0 / (25515.0 * n.powi(2))
            + 131.0 / (1148175.0 * n.powi(3))
            - 2194697.0 / (30690717750.0 * n.powi(4))
    }
}

impl ProfileTrait for Sersic {
    fn kind(&self) -> &'static str {
        "sersic"
    }

    fn parameter_specs(&self) -> &'static [ParameterSpec] {
        &SPECS
    }

    fn brightness(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let (n, re, ie) = (params[4], params[5], params[6]);
        let r = elliptical_radius(x, y, params);
        ie * f64::exp(-Self::b_n(n) * ((r / re).powf(n.recip()) - 1.0))
    }

    fn initial_guess(&self, stats: &WindowStats, params: &mut [f64], fixed: &[bool]) {
        geometry::guess_geometry(stats, params, fixed);
        if !fixed[5] {
            params[5] = 1.18 * stats.sigma;
        }
        if !fixed[6] {
            params[6] = stats.peak * f64::exp(-Self::b_n(params[4]));
        }
    }

    fn amplitude_index(&self) -> Option<usize> {
        Some(6)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;

    #[test]
    fn b_n_known_values() {
        // exponential disk and de Vaucouleurs profile
        assert_relative_eq!(Sersic::b_n(1.0), 1.678, epsilon = 1e-3);
        assert_relative_eq!(Sersic::b_n(4.0), 7.669, epsilon = 1e-3);
    }

    #[test]
    fn brightness_at_effective_radius() {
        let params = [0.0, 0.0, 1.0, 0.0, 3.0, 2.0, 5.0];
        assert_relative_eq!(Sersic::new().brightness(2.0, 0.0, &params), 5.0, epsilon = 1e-12);
        assert!(Sersic::new().brightness(0.0, 0.0, &params) > 5.0);
        assert!(Sersic::new().brightness(4.0, 0.0, &params) < 5.0);
    }

    #[test]
    fn guess_keeps_fixed_values() {
        let stats = WindowStats {
            background: 0.0,
            peak: 100.0,
            flux: 1000.0,
            centroid: (5.0, 6.0),
            sigma: 2.0,
            axis_ratio: 0.5,
            position_angle: 1.0,
        };
        let mut params = [0.0, 0.0, 0.9, 0.0, 4.0, 1.0, 1.0];
        let fixed = [false, false, true, false, true, false, false];
        Sersic::new().initial_guess(&stats, &mut params, &fixed);
        assert_eq!(params[..4], [5.0, 6.0, 0.9, 1.0]);
        assert_eq!(params[4], 4.0);
        assert_relative_eq!(params[5], 2.36);
        assert_relative_eq!(params[6], 100.0 * f64::exp(-Sersic::b_n(4.0)));
    }
}
