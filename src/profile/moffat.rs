use crate::parameter::{ParameterDomain, ParameterSpec};
use crate::profile::geometry::{self, NGEOMETRY, elliptical_radius};
use crate::profile::{ProfileTrait, WindowStats};

use macro_const::macro_const;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

macro_const! {
    const DOC: &str = r#"
Moffat profile

Radial brightness law commonly used for stellar PSFs:

$$
I(r) = \frac{I_0}{\left[1 + (r / R_d)^2\right]^n},
$$

where $r$ is the elliptical radius, $R_d$ is the core width and $n$ controls the wings.
When the profile is used as a PSF its amplitude $I_0$ is irrelevant because the rendered
kernel is renormalized, so `i0` is usually locked.

- Parameters: `x`, `y`, `q`, `pa`, `n`, `rd`, `i0`
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
        lower: 0.1,
        upper: 10.0,
        description: "Moffat power index",
    },
    ParameterSpec {
        name: "rd",
        domain: ParameterDomain::StrictlyPositive,
        default: 1.0,
        lower: 1e-6,
        upper: f64::INFINITY,
        description: "core width",
    },
    ParameterSpec {
        name: "i0",
        domain: ParameterDomain::Positive,
        default: 1.0,
        lower: 0.0,
        upper: f64::INFINITY,
        description: "central surface brightness",
    },
];

#[doc = DOC!()]
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct Moffat {}

impl Moffat {
    pub fn new() -> Self {
        Self {}
    }

    pub fn doc() -> &'static str {
        DOC
    }

    /// Full width at half maximum along the major axis
    pub fn fwhm(rd: f64, n: f64) -> f64 {
        2.0 * rd * (2.0f64.powf(n.recip()) - 1.0).sqrt()
    }
}

impl ProfileTrait for Moffat {
    fn kind(&self) -> &'static str {
        "moffat"
    }

    fn parameter_specs(&self) -> &'static [ParameterSpec] {
        &SPECS
    }

    fn brightness(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let (n, rd, i0) = (params[4], params[5], params[6]);
        let r = elliptical_radius(x, y, params);
        i0 * (1.0 + (r / rd).powi(2)).powf(-n)
    }

    fn initial_guess(&self, stats: &WindowStats, params: &mut [f64], fixed: &[bool]) {
        geometry::guess_geometry(stats, params, fixed);
        if !fixed[5] {
            params[5] = stats.sigma;
        }
        if !fixed[6] {
            params[6] = stats.peak;
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
    fn half_maximum_at_half_fwhm() {
        let (n, rd) = (2.5, 1.7);
        let params = [0.0, 0.0, 1.0, 0.0, n, rd, 3.0];
        let half_width = 0.5 * Moffat::fwhm(rd, n);
        assert_relative_eq!(
            Moffat::new().brightness(half_width, 0.0, &params),
            1.5,
            epsilon = 1e-12
        );
    }

    #[test]
    fn peak_is_i0() {
        let params = [2.0, 3.0, 0.5, 1.0, 3.0, 1.0, 7.0];
        assert_relative_eq!(Moffat::new().brightness(2.0, 3.0, &params), 7.0);
    }
}
