use crate::parameter::{ParameterDomain, ParameterSpec};
use crate::profile::{ProfileTrait, WindowStats};

use macro_const::macro_const;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

macro_const! {
    const DOC: &str = r#"
Flat sky

Constant background surface brightness over the model window.

- Parameters: `sky`
"#;
}

const SPECS: [ParameterSpec; 1] = [ParameterSpec {
    name: "sky",
    domain: ParameterDomain::Real,
    default: 0.0,
    lower: f64::NEG_INFINITY,
    upper: f64::INFINITY,
    description: "background surface brightness",
}];

#[doc = DOC!()]
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct FlatSky {}

impl FlatSky {
    pub fn new() -> Self {
        Self {}
    }

    pub fn doc() -> &'static str {
        DOC
    }
}

impl ProfileTrait for FlatSky {
    fn kind(&self) -> &'static str {
        "flat_sky"
    }

    fn parameter_specs(&self) -> &'static [ParameterSpec] {
        &SPECS
    }

    #[inline]
    fn brightness(&self, _x: f64, _y: f64, params: &[f64]) -> f64 {
        params[0]
    }

    fn initial_guess(&self, stats: &WindowStats, params: &mut [f64], fixed: &[bool]) {
        if !fixed[0] {
            params[0] = stats.background;
        }
    }
}
