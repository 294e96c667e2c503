use crate::error::FitError;
use crate::fit::{FitResult, FitRun};
use crate::model::ModelId;
use crate::session::Session;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Levenberg–Marquardt least-squares options
///
/// The loss is the sum of squared weighted residuals `(model - data) / sigma` over all pixels
/// with positive variance. Every iteration builds a finite-difference Jacobian of the
/// residuals, solves the damped normal equations `(JᵀJ + λ diag JᵀJ) δ = -Jᵀr` and accepts the
/// bounds-projected step if it decreases the loss. A rejected step multiplies `λ` by
/// `lambda_increase` and is retried at most `max_rejected_steps` times, an accepted one
/// multiplies it by `lambda_decrease`.
///
/// The fit converges when either the relative loss improvement is below `relative_tolerance`
/// or the relative step norm is below `step_tolerance` for `patience` consecutive iterations,
/// or when no step improves the loss right after such an iteration. If no step improves the
/// loss otherwise the fit fails by immobility.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename = "LevenbergMarquardt", default)]
pub struct LevenbergMarquardt {
    pub max_iterations: usize,
    pub relative_tolerance: f64,
    pub step_tolerance: f64,
    pub patience: usize,
    pub initial_lambda: f64,
    pub lambda_increase: f64,
    pub lambda_decrease: f64,
    pub max_rejected_steps: usize,
    /// Relative finite-difference step, multiplied by `max(|x|, 1)`
    pub derivative_step: f64,
    /// 0 is silent, 1 logs the terminal status, 2 logs every iteration
    pub verbosity: u8,
}

impl LevenbergMarquardt {
    #[inline]
    pub fn default_max_iterations() -> usize {
        100
    }

    #[inline]
    pub fn default_relative_tolerance() -> f64 {
        1e-8
    }

    #[inline]
    pub fn default_step_tolerance() -> f64 {
        1e-8
    }

    #[inline]
    pub fn default_patience() -> usize {
        2
    }

    #[inline]
    pub fn default_initial_lambda() -> f64 {
        1e-3
    }

    #[inline]
    pub fn default_lambda_increase() -> f64 {
        10.0
    }

    #[inline]
    pub fn default_lambda_decrease() -> f64 {
        0.1
    }

    #[inline]
    pub fn default_max_rejected_steps() -> usize {
        10
    }

    #[inline]
    pub fn default_derivative_step() -> f64 {
        1e-6
    }

    #[inline]
    pub fn default_verbosity() -> u8 {
        0
    }

    pub(crate) fn validate(&self) -> Result<(), FitError> {
        let positive = |x: f64| x.is_finite() && x > 0.0;
        if !(self.relative_tolerance >= 0.0 && self.step_tolerance >= 0.0) {
            return Err(FitError::InvalidOptions("tolerances must be non-negative"));
        }
        if self.patience == 0 {
            return Err(FitError::InvalidOptions("patience must be positive"));
        }
        if !positive(self.initial_lambda) {
            return Err(FitError::InvalidOptions("initial_lambda must be positive"));
        }
        if !(self.lambda_increase.is_finite() && self.lambda_increase > 1.0) {
            return Err(FitError::InvalidOptions("lambda_increase must exceed 1"));
        }
        if !(self.lambda_decrease > 0.0 && self.lambda_decrease <= 1.0) {
            return Err(FitError::InvalidOptions("lambda_decrease must be in (0, 1]"));
        }
        if !positive(self.derivative_step) {
            return Err(FitError::InvalidOptions("derivative_step must be positive"));
        }
        Ok(())
    }

    /// Initialize the tree rooted at `root` and prepare a stepping fit
    ///
    /// Starting values are guessed only for components that were never initialized, so a
    /// second fit continues from the values of the first one. Call [Session::initialize] to
    /// start over from the target moments.
    ///
    /// The session stays borrowed by the returned [FitRun], structural and parameter
    /// mutations fail until it is finished or dropped.
    pub fn start<'a>(
        &self,
        session: &'a mut Session,
        root: ModelId,
    ) -> Result<FitRun<'a>, FitError> {
        FitRun::new(self.clone(), session, root)
    }

    /// Run a fit to completion
    pub fn fit(&self, session: &mut Session, root: ModelId) -> Result<FitResult, FitError> {
        Ok(self.start(session, root)?.finish())
    }
}

impl Default for LevenbergMarquardt {
    fn default() -> Self {
        Self {
            max_iterations: Self::default_max_iterations(),
            relative_tolerance: Self::default_relative_tolerance(),
            step_tolerance: Self::default_step_tolerance(),
            patience: Self::default_patience(),
            initial_lambda: Self::default_initial_lambda(),
            lambda_increase: Self::default_lambda_increase(),
            lambda_decrease: Self::default_lambda_decrease(),
            max_rejected_steps: Self::default_max_rejected_steps(),
            derivative_step: Self::default_derivative_step(),
            verbosity: Self::default_verbosity(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let lm: LevenbergMarquardt =
            serde_json::from_str(r#"{"max_iterations": 5, "verbosity": 2}"#).unwrap();
        assert_eq!(
            lm,
            LevenbergMarquardt {
                max_iterations: 5,
                verbosity: 2,
                ..Default::default()
            }
        );
        let json = serde_json::to_string(&lm).unwrap();
        assert_eq!(serde_json::from_str::<LevenbergMarquardt>(&json).unwrap(), lm);
    }

    #[test]
    fn invalid_options() {
        let lm = LevenbergMarquardt {
            lambda_increase: 0.5,
            ..Default::default()
        };
        assert!(matches!(lm.validate(), Err(FitError::InvalidOptions(_))));
        assert!(LevenbergMarquardt::default().validate().is_ok());
    }
}
