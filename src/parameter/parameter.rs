use crate::error::ModelError;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Value domain of a parameter
///
/// Domain restrictions are enforced through bounds only: rendering never wraps or folds
/// parameter values. Two parameters may be bound by an equality constraint only when their
/// domains are the same.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ParameterDomain {
    /// Any real number
    Real,
    /// Non-negative number, e.g. an intensity
    Positive,
    /// Number bounded away from zero, e.g. a radius or a profile index
    StrictlyPositive,
    /// Axis ratio, `(0, 1]`
    UnitInterval,
    /// Position angle in radians, one half-turn `[0, π]` because ellipses are symmetric
    Angle,
}

impl ParameterDomain {
    /// Widest closed bounds allowed by the domain, open ends are replaced by the smallest
    /// positive normal number
    pub fn natural_bounds(&self) -> (f64, f64) {
        match self {
            Self::Real => (f64::NEG_INFINITY, f64::INFINITY),
            Self::Positive => (0.0, f64::INFINITY),
            Self::StrictlyPositive => (f64::MIN_POSITIVE, f64::INFINITY),
            Self::UnitInterval => (f64::MIN_POSITIVE, 1.0),
            Self::Angle => (0.0, PI),
        }
    }
}

/// What [Parameter::set] does with a value outside of the bounds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum BoundsPolicy {
    /// Fail with [ModelError::OutOfBounds] and keep the old value
    #[default]
    Reject,
    /// Store the nearest bound instead
    Clamp,
}

/// Static description of a parameter declared by a [crate::Profile]
///
/// `lower` and `upper` delimit the range where the profile is well defined, user bounds may
/// narrow it but never widen it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub domain: ParameterDomain,
    pub default: f64,
    pub lower: f64,
    pub upper: f64,
    pub description: &'static str,
}

/// User-supplied initial state of a parameter
///
/// Everything is optional: missing values are derived by [crate::Session::initialize] and
/// missing bounds are taken from the profile.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ParameterInit {
    pub value: Option<f64>,
    pub lower: Option<f64>,
    pub upper: Option<f64>,
    #[serde(default)]
    pub locked: bool,
}

impl ParameterInit {
    pub fn value(value: f64) -> Self {
        Self {
            value: Some(value),
            ..Self::default()
        }
    }

    /// Fixed value excluded from the fit
    pub fn fixed(value: f64) -> Self {
        Self::value(value).locked()
    }

    pub fn locked(mut self) -> Self {
        self.locked = true;
        self
    }

    pub fn bounds(mut self, lower: f64, upper: f64) -> Self {
        self.lower = Some(lower);
        self.upper = Some(upper);
        self
    }
}

impl From<f64> for ParameterInit {
    fn from(value: f64) -> Self {
        Self::value(value)
    }
}

/// Current state of a model parameter
#[derive(Clone, Debug, PartialEq)]
pub struct Parameter {
    value: f64,
    lower: f64,
    upper: f64,
    limits: (f64, f64),
    locked: bool,
    domain: ParameterDomain,
    explicit: bool,
    uncertainty: Option<f64>,
}

impl Parameter {
    pub(crate) fn from_spec(
        spec: &ParameterSpec,
        init: Option<&ParameterInit>,
        qualified_name: impl Fn() -> String,
    ) -> Result<Self, ModelError> {
        let init = init.copied().unwrap_or_default();
        let (natural_lower, natural_upper) = spec.domain.natural_bounds();
        let limits = (spec.lower.max(natural_lower), spec.upper.min(natural_upper));
        let (lower, upper) = intersect(
            init.lower.unwrap_or(limits.0),
            init.upper.unwrap_or(limits.1),
            limits,
            &qualified_name,
        )?;
        let mut parameter = Self {
            value: spec.default.clamp(lower, upper),
            lower,
            upper,
            limits,
            locked: init.locked,
            domain: spec.domain,
            explicit: false,
            uncertainty: None,
        };
        if let Some(value) = init.value {
            parameter.check(value, &qualified_name)?;
            parameter.value = value;
            parameter.explicit = true;
        }
        Ok(parameter)
    }

    #[inline]
    pub fn value(&self) -> f64 {
        self.value
    }

    #[inline]
    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    #[inline]
    pub fn domain(&self) -> ParameterDomain {
        self.domain
    }

    /// Whether the value was given by the user rather than guessed or defaulted
    #[inline]
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// One-sigma uncertainty from the last [crate::FitResult::update_uncertainty] call
    #[inline]
    pub fn uncertainty(&self) -> Option<f64> {
        self.uncertainty
    }

    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    fn check(&self, value: f64, name: impl Fn() -> String) -> Result<(), ModelError> {
        if self.contains(value) {
            Ok(())
        } else {
            Err(ModelError::OutOfBounds {
                parameter: name(),
                value,
                lower: self.lower,
                upper: self.upper,
            })
        }
    }

    /// Assign a user value, returns the value actually stored
    pub(crate) fn set(
        &mut self,
        value: f64,
        policy: BoundsPolicy,
        name: impl Fn() -> String,
    ) -> Result<f64, ModelError> {
        let value = match policy {
            BoundsPolicy::Clamp if !value.is_nan() => value.clamp(self.lower, self.upper),
            _ => {
                self.check(value, name)?;
                value
            }
        };
        self.value = value;
        self.explicit = true;
        self.uncertainty = None;
        Ok(value)
    }

    /// Store an initial guess without marking the parameter as user-defined
    pub(crate) fn guess(&mut self, value: f64) {
        if value.is_finite() {
            self.value = value.clamp(self.lower, self.upper);
        }
    }

    /// Store an optimizer value, it is always projected onto the bounds
    #[inline]
    pub(crate) fn assign(&mut self, value: f64) {
        self.value = value.clamp(self.lower, self.upper);
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub(crate) fn set_bounds(
        &mut self,
        lower: f64,
        upper: f64,
        name: impl Fn() -> String,
    ) -> Result<(), ModelError> {
        let (lower, upper) = intersect(lower, upper, self.limits, name)?;
        self.lower = lower;
        self.upper = upper;
        self.value = self.value.clamp(lower, upper);
        Ok(())
    }

    pub(crate) fn set_uncertainty(&mut self, sigma: Option<f64>) {
        self.uncertainty = sigma;
    }
}

/// Clip user bounds to `limits`, failing if nothing is left
fn intersect(
    lower: f64,
    upper: f64,
    limits: (f64, f64),
    name: impl Fn() -> String,
) -> Result<(f64, f64), ModelError> {
    let lower = lower.max(limits.0);
    let upper = upper.min(limits.1);
    if lower.is_nan() || upper.is_nan() || lower > upper {
        return Err(ModelError::InvalidBounds {
            parameter: name(),
            lower,
            upper,
        });
    }
    Ok((lower, upper))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: ParameterSpec = ParameterSpec {
        name: "q",
        domain: ParameterDomain::UnitInterval,
        default: 0.7,
        lower: 0.05,
        upper: 1.0,
        description: "axis ratio",
    };

    fn name() -> String {
        "galaxy:q".to_owned()
    }

    #[test]
    fn default_from_spec() {
        let p = Parameter::from_spec(&SPEC, None, name).unwrap();
        assert_eq!(p.value(), 0.7);
        assert_eq!(p.bounds(), (0.05, 1.0));
        assert!(!p.is_explicit());
        assert!(!p.is_locked());
    }

    #[test]
    fn user_bounds_are_intersected_with_limits() {
        let init = ParameterInit::value(0.5).bounds(-1.0, 2.0);
        let p = Parameter::from_spec(&SPEC, Some(&init), name).unwrap();
        assert_eq!(p.bounds(), (0.05, 1.0));
        assert!(p.is_explicit());
    }

    #[test]
    fn zero_axis_ratio_is_unreachable() {
        let spec = ParameterSpec {
            lower: 0.0,
            ..SPEC
        };
        let mut p = Parameter::from_spec(&spec, None, name).unwrap();
        assert_eq!(p.bounds(), (f64::MIN_POSITIVE, 1.0));
        p.set_bounds(0.0, 1.0, name).unwrap();
        assert!(p.bounds().0 > 0.0);
        assert!(matches!(
            p.set(0.0, BoundsPolicy::Reject, name),
            Err(ModelError::OutOfBounds { .. })
        ));
        assert!(p.set(0.0, BoundsPolicy::Clamp, name).unwrap() > 0.0);
    }

    #[test]
    fn bounds_cannot_be_widened() {
        let mut p = Parameter::from_spec(&SPEC, None, name).unwrap();
        p.set_bounds(0.0, 0.5, name).unwrap();
        assert_eq!(p.bounds(), (0.05, 0.5));
        p.set_bounds(-2.0, 2.0, name).unwrap();
        assert_eq!(p.bounds(), (0.05, 1.0));
        assert!(matches!(
            p.set_bounds(2.0, 3.0, name),
            Err(ModelError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn initial_value_out_of_bounds() {
        let init = ParameterInit::value(1.5);
        assert!(matches!(
            Parameter::from_spec(&SPEC, Some(&init), name),
            Err(ModelError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn empty_bounds() {
        let init = ParameterInit::default().bounds(0.8, 0.2);
        assert!(matches!(
            Parameter::from_spec(&SPEC, Some(&init), name),
            Err(ModelError::InvalidBounds { .. })
        ));
    }

    #[test]
    fn set_round_trip_and_reject() {
        let mut p = Parameter::from_spec(&SPEC, None, name).unwrap();
        for &value in &[0.05, 0.123456789, 1.0] {
            assert_eq!(p.set(value, BoundsPolicy::Reject, name).unwrap(), value);
            assert_eq!(p.value(), value);
        }
        let before = p.value();
        let err = p.set(1.01, BoundsPolicy::Reject, name).unwrap_err();
        assert_eq!(
            err,
            ModelError::OutOfBounds {
                parameter: "galaxy:q".to_owned(),
                value: 1.01,
                lower: 0.05,
                upper: 1.0,
            }
        );
        assert_eq!(p.value(), before);
    }

    #[test]
    fn set_clamp() {
        let mut p = Parameter::from_spec(&SPEC, None, name).unwrap();
        assert_eq!(p.set(3.0, BoundsPolicy::Clamp, name).unwrap(), 1.0);
        assert_eq!(p.set(-3.0, BoundsPolicy::Clamp, name).unwrap(), 0.05);
        assert!(p.set(f64::NAN, BoundsPolicy::Clamp, name).is_err());
        assert_eq!(p.value(), 0.05);
    }

    #[test]
    fn guess_is_clamped_and_not_explicit() {
        let mut p = Parameter::from_spec(&SPEC, None, name).unwrap();
        p.guess(10.0);
        assert_eq!(p.value(), 1.0);
        p.guess(f64::NAN);
        assert_eq!(p.value(), 1.0);
        assert!(!p.is_explicit());
    }

    #[test]
    fn angle_domain_is_half_turn() {
        assert_eq!(ParameterDomain::Angle.natural_bounds(), (0.0, PI));
    }

    #[test]
    fn strictly_positive_domain_excludes_zero() {
        let (lower, upper) = ParameterDomain::StrictlyPositive.natural_bounds();
        assert!(lower > 0.0);
        assert_eq!(upper, f64::INFINITY);
    }
}
