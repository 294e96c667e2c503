//! Parametric light distributions
//!
//! Every profile is a surface brightness law `I(x, y; θ)` in physical coordinates. Most of
//! them share the elliptical geometry parameters `x`, `y`, `q`, `pa` declared by
//! [geometry::GEOMETRY_SPECS] in front of the profile-specific ones. A rendered pixel is the
//! mean brightness over the pixel multiplied by the pixel area, the mean is approximated by an
//! `oversample × oversample` grid of samples.

use crate::parameter::ParameterSpec;

use enum_dispatch::enum_dispatch;
use itertools::iproduct;
use ndarray::Array2;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

mod flat_sky;
pub use flat_sky::FlatSky;

mod gaussian;
pub use gaussian::Gaussian;

pub mod geometry;

mod moffat;
pub use moffat::Moffat;

mod sersic;
pub use sersic::Sersic;

mod stats;
pub use stats::WindowStats;

#[enum_dispatch]
pub trait ProfileTrait {
    /// Kind tag, e.g. `"sersic"`
    fn kind(&self) -> &'static str;

    /// Parameter declarations, the order defines the layout of `params` slices
    fn parameter_specs(&self) -> &'static [ParameterSpec];

    /// Surface brightness at physical coordinates `(x, y)`
    fn brightness(&self, x: f64, y: f64, params: &[f64]) -> f64;

    /// Fill `params[i]` with a starting guess unless `fixed[i]` is set
    ///
    /// Values of fixed parameters are the current ones and may be used to derive the rest.
    fn initial_guess(&self, stats: &WindowStats, params: &mut [f64], fixed: &[bool]);

    /// Index of the parameter scaling the whole profile linearly, if any
    ///
    /// It has no effect on a normalized PSF kernel.
    fn amplitude_index(&self) -> Option<usize> {
        None
    }
}

/// All available profile kinds
#[enum_dispatch(ProfileTrait)]
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Profile {
    Sersic(Sersic),
    Moffat(Moffat),
    Gaussian(Gaussian),
    FlatSky(FlatSky),
}

impl Profile {
    pub fn sersic() -> Self {
        Sersic::new().into()
    }

    pub fn moffat() -> Self {
        Moffat::new().into()
    }

    pub fn gaussian() -> Self {
        Gaussian::new().into()
    }

    pub fn flat_sky() -> Self {
        FlatSky::new().into()
    }

    pub fn doc(&self) -> &'static str {
        match self {
            Self::Sersic(_) => Sersic::doc(),
            Self::Moffat(_) => Moffat::doc(),
            Self::Gaussian(_) => Gaussian::doc(),
            Self::FlatSky(_) => FlatSky::doc(),
        }
    }

    /// Render the profile on a grid of `shape` pixels whose top-left pixel has index `origin`
    ///
    /// `origin` may be negative or lie outside the image, profiles are analytic and PSF
    /// convolution needs a margin around the window.
    pub fn render(
        &self,
        params: &[f64],
        origin: (isize, isize),
        shape: (usize, usize),
        pixel_scale: f64,
        oversample: usize,
    ) -> Array2<f64> {
        let oversample = oversample.max(1);
        let step = (oversample as f64).recip();
        let offsets: Vec<f64> = (0..oversample).map(|k| (k as f64 + 0.5) * step).collect();
        let norm = pixel_scale * pixel_scale / (oversample * oversample) as f64;
        Array2::from_shape_fn(shape, |(i, j)| {
            let row = (origin.0 + i as isize) as f64;
            let col = (origin.1 + j as isize) as f64;
            let sum: f64 = iproduct!(offsets.iter(), offsets.iter())
                .map(|(dy, dx)| {
                    self.brightness((col + dx) * pixel_scale, (row + dy) * pixel_scale, params)
                })
                .sum();
            sum * norm
        })
    }
}

impl FromStr for Profile {
    type Err = String;

    /// Accepts both short tags and the long `"<kind> profile"` spelling
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let tag = lower
            .strip_suffix("profile")
            .unwrap_or(lower.as_str())
            .trim()
            .trim_end_matches(['-', '_', ' '])
            .replace([' ', '-'], "_");
        match tag.as_str() {
            "sersic" | "sersic_like" => Ok(Self::sersic()),
            "moffat" => Ok(Self::moffat()),
            "gaussian" => Ok(Self::gaussian()),
            "flat_sky" | "sky" => Ok(Self::flat_sky()),
            _ => Err(format!("unknown profile kind: {}", s)),
        }
    }
}
