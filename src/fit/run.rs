use crate::error::FitError;
use crate::fit::problem::Problem;
use crate::fit::{FitResult, FitState, FitStatus, LevenbergMarquardt};
use crate::model::ModelId;
use crate::session::Session;

use nalgebra::{DMatrix, DVector};

/// Levenberg–Marquardt fit in progress
///
/// Created by [LevenbergMarquardt::start]. Each [FitRun::step] performs one iteration, the run
/// may be inspected between steps. The session is marked busy until the run is dropped, so
/// structural and parameter mutations made through [FitRun::session_mut] fail with
/// [crate::ModelError::InvalidState].
pub struct FitRun<'a> {
    session: &'a mut Session,
    options: LevenbergMarquardt,
    root: ModelId,
    problem: Problem,
    x: Vec<f64>,
    residuals: DVector<f64>,
    loss: f64,
    initial_loss: f64,
    lambda: f64,
    iteration: usize,
    small_steps: usize,
    npixels: usize,
    state: FitState,
}

impl<'a> FitRun<'a> {
    pub(crate) fn new(
        options: LevenbergMarquardt,
        session: &'a mut Session,
        root: ModelId,
    ) -> Result<Self, FitError> {
        options.validate()?;
        session.initialize_pending(root)?;
        let free = session.free_vector(root)?;
        if free.is_empty() {
            return Err(FitError::NoFreeParameters(session.name(root)?.to_owned()));
        }
        let target = session.target();
        let npixels = target.count_informative(&target.full_window());
        if npixels <= free.len() {
            return Err(FitError::TooFewPixels {
                pixels: npixels,
                parameters: free.len(),
            });
        }
        let x = free.gather(session);
        let problem = Problem::new(session, root, free, options.derivative_step);
        if options.verbosity >= 1 {
            log::info!(
                "fitting {}: {} free parameters, {} pixels",
                session.name(root)?,
                x.len(),
                npixels,
            );
        }

        let initial = problem.residuals(session, &x);
        session.set_fit_active(true);
        let mut run = Self {
            session,
            lambda: options.initial_lambda,
            options,
            root,
            problem,
            residuals: DVector::zeros(0),
            loss: f64::NAN,
            initial_loss: f64::NAN,
            x,
            iteration: 0,
            small_steps: 0,
            npixels,
            state: FitState::Initialized,
        };
        match initial {
            Some(residuals) => {
                run.loss = residuals.norm_squared();
                run.initial_loss = run.loss;
                run.residuals = residuals;
            }
            None => {
                run.conclude(FitStatus::FailedByDivergence);
            }
        }
        Ok(run)
    }

    #[inline]
    pub fn state(&self) -> FitState {
        self.state
    }

    #[inline]
    pub fn session(&self) -> &Session {
        self.session
    }

    /// Mutable access to the busy session, all mutating operations fail until the run ends
    #[inline]
    pub fn session_mut(&mut self) -> &mut Session {
        self.session
    }

    /// Current best free vector
    #[inline]
    pub fn x(&self) -> &[f64] {
        &self.x
    }

    #[inline]
    pub fn loss(&self) -> f64 {
        self.loss
    }

    #[inline]
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    #[inline]
    pub fn lambda(&self) -> f64 {
        self.lambda
    }

    fn conclude(&mut self, status: FitStatus) -> FitStatus {
        self.problem.free().scatter(&self.x, self.session);
        self.state = FitState::Finished(status);
        if self.options.verbosity >= 1 {
            match status {
                FitStatus::FailedByDivergence => {
                    log::warn!("iteration {}: {}", self.iteration, status)
                }
                _ => log::info!(
                    "iteration {}: {}, loss = {:.6e}",
                    self.iteration,
                    status,
                    self.loss
                ),
            }
        }
        status
    }

    /// Perform one iteration, returns the status once the run is finished
    pub fn step(&mut self) -> Option<FitStatus> {
        if let FitState::Finished(status) = self.state {
            return Some(status);
        }
        if self.iteration >= self.options.max_iterations {
            return Some(self.conclude(FitStatus::MaxIterationsReached));
        }
        self.state = FitState::Iterating;
        self.iteration += 1;

        let Some(jacobian) = self
            .problem
            .jacobian(self.session, &self.x, &self.residuals)
        else {
            return Some(self.conclude(FitStatus::FailedByDivergence));
        };
        let jtj = jacobian.tr_mul(&jacobian);
        let gradient = jacobian.tr_mul(&self.residuals);

        let trials = self.options.max_rejected_steps + 1;
        let mut non_finite = 0;
        for _ in 0..trials {
            let Some(trial) = self.trial_point(&jtj, &gradient) else {
                self.lambda *= self.options.lambda_increase;
                continue;
            };
            let Some(residuals) = self.problem.residuals(self.session, &trial) else {
                non_finite += 1;
                self.lambda *= self.options.lambda_increase;
                continue;
            };
            let loss = residuals.norm_squared();
            if loss >= self.loss {
                if self.options.verbosity >= 2 {
                    log::debug!(
                        "iteration {}: rejected step, loss = {:.6e}, lambda = {:.3e}",
                        self.iteration,
                        loss,
                        self.lambda
                    );
                }
                self.lambda *= self.options.lambda_increase;
                continue;
            }

            let improvement = (self.loss - loss) / self.loss;
            let step_norm = trial
                .iter()
                .zip(&self.x)
                .map(|(a, b)| (a - b).powi(2))
                .sum::<f64>()
                .sqrt();
            let x_norm = self.x.iter().map(|a| a * a).sum::<f64>().sqrt();
            let relative_step = step_norm / x_norm.max(f64::MIN_POSITIVE);
            if self.options.verbosity >= 2 {
                log::debug!(
                    "iteration {}: accepted step, loss = {:.6e}, relative improvement = {:.3e}, \
                     relative step = {:.3e}, lambda = {:.3e}",
                    self.iteration,
                    loss,
                    improvement,
                    relative_step,
                    self.lambda
                );
            }
            self.x = trial;
            self.residuals = residuals;
            self.loss = loss;
            self.lambda = (self.lambda * self.options.lambda_decrease).max(f64::MIN_POSITIVE);

            if improvement < self.options.relative_tolerance
                || relative_step < self.options.step_tolerance
            {
                self.small_steps += 1;
            } else {
                self.small_steps = 0;
            }
            if self.small_steps >= self.options.patience {
                return Some(self.conclude(FitStatus::Converged));
            }
            // trial evaluations leave their values in the session
            self.problem.free().scatter(&self.x, self.session);
            return None;
        }
        // the previous accepted step was already below tolerance, nothing is left to improve
        let status = if non_finite == trials {
            FitStatus::FailedByDivergence
        } else if self.small_steps > 0 {
            FitStatus::Converged
        } else {
            FitStatus::FailedByImmobility
        };
        Some(self.conclude(status))
    }

    /// Solve the damped normal equations and project the step onto the bounds
    fn trial_point(&self, jtj: &DMatrix<f64>, gradient: &DVector<f64>) -> Option<Vec<f64>> {
        let floor = 1e-9 * jtj.diagonal().max().max(f64::MIN_POSITIVE);
        let mut damped = jtj.clone();
        for i in 0..damped.nrows() {
            damped[(i, i)] += self.lambda * jtj[(i, i)].max(floor);
        }
        let delta = damped.cholesky()?.solve(gradient);
        let mut trial: Vec<f64> = self.x.iter().zip(delta.iter()).map(|(x, d)| x - d).collect();
        self.problem.project(&mut trial);
        trial.iter().all(|v| v.is_finite()).then_some(trial)
    }

    /// Iterate until a terminal status and collect the result
    pub fn finish(mut self) -> FitResult {
        let status = loop {
            if let Some(status) = self.step() {
                break status;
            }
        };
        FitResult::new(
            self.session,
            status,
            self.root,
            self.problem.free().clone(),
            self.x.clone(),
            self.loss,
            self.initial_loss,
            self.iteration,
            self.npixels,
            self.options.derivative_step,
        )
    }
}

impl Drop for FitRun<'_> {
    fn drop(&mut self) {
        self.session.set_fit_active(false);
    }
}
