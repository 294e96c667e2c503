use crate::parameter::{ParameterDomain, ParameterSpec};
use crate::profile::geometry::{self, NGEOMETRY, elliptical_radius};
use crate::profile::{ProfileTrait, WindowStats};

use macro_const::macro_const;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::TAU;

macro_const! {
    const DOC: &str = r#"
Gaussian profile

Elliptical Gaussian normalized to its total flux:

$$
I(r) = \frac{F}{2\pi\sigma^2 q} \exp\left(-\frac{r^2}{2\sigma^2}\right),
$$

where $r$ is the elliptical radius and $\sigma$ is the major-axis standard deviation.

- Parameters: `x`, `y`, `q`, `pa`, `sigma`, `flux`
"#;
}

const SPECS: [ParameterSpec; NGEOMETRY + 2] = [
    geometry::X,
    geometry::Y,
    geometry::Q,
    geometry::PA,
    ParameterSpec {
        name: "sigma",
        domain: ParameterDomain::StrictlyPositive,
        default: 1.0,
        lower: 1e-6,
        upper: f64::INFINITY,
        description: "major-axis standard deviation",
    },
    ParameterSpec {
        name: "flux",
        domain: ParameterDomain::Positive,
        default: 1.0,
        lower: 0.0,
        upper: f64::INFINITY,
        description: "total flux",
    },
];

#[doc = DOC!()]
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct Gaussian {}

impl Gaussian {
    pub fn new() -> Self {
        Self {}
    }

    pub fn doc() -> &'static str {
        DOC
    }
}

impl ProfileTrait for Gaussian {
    fn kind(&self) -> &'static str {
        "gaussian"
    }

    fn parameter_specs(&self) -> &'static [ParameterSpec] {
        &SPECS
    }

    fn brightness(&self, x: f64, y: f64, params: &[f64]) -> f64 {
        let (q, sigma, flux) = (params[2], params[4], params[5]);
        let r = elliptical_radius(x, y, params);
        flux / (TAU * sigma * sigma * q) * f64::exp(-0.5 * (r / sigma).powi(2))
    }

    fn initial_guess(&self, stats: &WindowStats, params: &mut [f64], fixed: &[bool]) {
        geometry::guess_geometry(stats, params, fixed);
        if !fixed[4] {
            params[4] = stats.sigma;
        }
        if !fixed[5] {
            params[5] = stats.flux;
        }
    }

    fn amplitude_index(&self) -> Option<usize> {
        Some(5)
    }
}
