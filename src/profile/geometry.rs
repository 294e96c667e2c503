//! Elliptical geometry shared by the radial profiles

use crate::parameter::{ParameterDomain, ParameterSpec};
use crate::profile::WindowStats;

use std::f64::consts::PI;

pub const X: ParameterSpec = ParameterSpec {
    name: "x",
    domain: ParameterDomain::Real,
    default: 0.0,
    lower: f64::NEG_INFINITY,
    upper: f64::INFINITY,
    description: "centre abscissa in physical units",
};

pub const Y: ParameterSpec = ParameterSpec {
    name: "y",
    domain: ParameterDomain::Real,
    default: 0.0,
    lower: f64::NEG_INFINITY,
    upper: f64::INFINITY,
    description: "centre ordinate in physical units",
};

pub const Q: ParameterSpec = ParameterSpec {
    name: "q",
    domain: ParameterDomain::UnitInterval,
    default: 0.9,
    lower: 0.01,
    upper: 1.0,
    description: "minor to major axis ratio",
};

pub const PA: ParameterSpec = ParameterSpec {
    name: "pa",
    domain: ParameterDomain::Angle,
    default: 0.0,
    lower: 0.0,
    upper: PI,
    description: "position angle of the major axis, radians counter-clockwise from +x",
};

/// Number of leading geometry parameters: `x`, `y`, `q`, `pa`
pub const NGEOMETRY: usize = 4;

/// Elliptical radius of `(x, y)` for the geometry stored in `params[..4]`
#[inline]
pub fn elliptical_radius(x: f64, y: f64, params: &[f64]) -> f64 {
    let (dx, dy) = (x - params[0], y - params[1]);
    let (sin, cos) = params[3].sin_cos();
    let major = dx * cos + dy * sin;
    let minor = (-dx * sin + dy * cos) / params[2];
    major.hypot(minor)
}

pub(super) fn guess_geometry(stats: &WindowStats, params: &mut [f64], fixed: &[bool]) {
    let guesses = [
        stats.centroid.0,
        stats.centroid.1,
        stats.axis_ratio,
        stats.position_angle,
    ];
    for ((param, &is_fixed), guess) in params.iter_mut().zip(fixed).zip(guesses) {
        if !is_fixed {
            *param = guess;
        }
    }
}
