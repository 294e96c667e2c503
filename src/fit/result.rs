use crate::constraint::{FreeVector, ParamKey, ParameterStore};
use crate::error::FitError;
use crate::fit::problem::Problem;
use crate::model::ModelId;
use crate::session::Session;

use nalgebra::DMatrix;
use std::fmt;

/// Terminal status of a fit
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FitStatus {
    /// Tolerances were met for the configured number of consecutive iterations
    Converged,
    /// No step decreasing the loss was found even with the largest damping
    ///
    /// Parameters are left at the best point found, which may still be acceptable: a fit
    /// started at the exact optimum ends this way.
    FailedByImmobility,
    /// The loss or the model became non-finite
    FailedByDivergence,
    MaxIterationsReached,
}

impl FitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Converged)
    }

    pub fn message(&self) -> &'static str {
        match self {
            Self::Converged => "success: loss improvement and step are below tolerances",
            Self::FailedByImmobility => {
                "fail: could not find a step improving the loss (failure by immobility), \
                 the parameters may still be acceptable"
            }
            Self::FailedByDivergence => "fail: loss became non-finite",
            Self::MaxIterationsReached => "fail: maximum number of iterations reached",
        }
    }
}

impl fmt::Display for FitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Stage of a [crate::FitRun]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FitState {
    Initialized,
    Iterating,
    Finished(FitStatus),
}

/// Outcome of a finished fit
#[derive(Clone, Debug)]
pub struct FitResult {
    pub status: FitStatus,
    pub message: String,
    pub root: ModelId,
    /// Representative parameter of every free slot
    pub parameters: Vec<ParamKey>,
    /// Qualified names of `parameters`
    pub names: Vec<String>,
    /// Final free vector, already written to the session
    pub x: Vec<f64>,
    pub loss: f64,
    pub initial_loss: f64,
    /// `loss / (npixels - nfree)`
    pub reduced_chi2: f64,
    pub iterations: usize,
    /// Number of pixels with positive variance
    pub npixels: usize,
    pub(crate) free: FreeVector,
    pub(crate) derivative_step: f64,
    covariance: Option<DMatrix<f64>>,
}

impl FitResult {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session: &Session,
        status: FitStatus,
        root: ModelId,
        free: FreeVector,
        x: Vec<f64>,
        loss: f64,
        initial_loss: f64,
        iterations: usize,
        npixels: usize,
        derivative_step: f64,
    ) -> Self {
        let parameters: Vec<_> = free.keys().collect();
        let names = parameters
            .iter()
            .map(|&key| session.qualified_name(key))
            .collect();
        let dof = npixels.saturating_sub(x.len()).max(1);
        Self {
            status,
            message: status.message().to_owned(),
            root,
            parameters,
            names,
            x,
            loss,
            initial_loss,
            reduced_chi2: loss / dof as f64,
            iterations,
            npixels,
            free,
            derivative_step,
            covariance: None,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Covariance of the free vector from the last [FitResult::update_uncertainty] call
    pub fn covariance(&self) -> Option<&DMatrix<f64>> {
        self.covariance.as_ref()
    }

    /// One-sigma uncertainties of the free vector
    pub fn uncertainties(&self) -> Option<Vec<f64>> {
        self.covariance
            .as_ref()
            .map(|c| c.diagonal().iter().map(|v| v.sqrt()).collect())
    }

    /// Estimate the covariance `(JᵀJ)⁻¹` of the weighted residuals at the final point
    ///
    /// The fitted values are written to the session again, uncertainties are stored on every
    /// member of every free slot.
    pub fn update_uncertainty(&mut self, session: &mut Session) -> Result<&DMatrix<f64>, FitError> {
        if session.is_fit_active() {
            return Err(FitError::NotFinished);
        }
        session.model(self.root)?;
        session.check_free_vector(&self.free)?;
        let problem = Problem::new(session, self.root, self.free.clone(), self.derivative_step);
        let residuals = problem
            .residuals(session, &self.x)
            .ok_or(FitError::SingularCovariance)?;
        let jacobian = problem
            .jacobian(session, &self.x, &residuals)
            .ok_or(FitError::SingularCovariance)?;
        let covariance = jacobian
            .tr_mul(&jacobian)
            .cholesky()
            .ok_or(FitError::SingularCovariance)?
            .inverse();
        if covariance.diagonal().iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
            return Err(FitError::SingularCovariance);
        }
        for (i, sigma) in covariance.diagonal().iter().enumerate() {
            for &key in self.free.members(i) {
                session.parameter_mut(key).set_uncertainty(Some(sigma.sqrt()));
            }
        }
        Ok(self.covariance.insert(covariance))
    }
}
