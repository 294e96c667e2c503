use crate::constraint::FreeVector;
use crate::model::ModelId;
use crate::session::Session;

use nalgebra::{DMatrix, DVector};
use ndarray::{Array2, Zip};

/// Weighted residuals of a model tree as a function of its free vector
#[derive(Clone, Debug)]
pub(crate) struct Problem {
    root: ModelId,
    free: FreeVector,
    bounds: Vec<(f64, f64)>,
    data: Array2<f64>,
    inverse_sigma: Array2<f64>,
    derivative_step: f64,
}

impl Problem {
    pub(crate) fn new(
        session: &Session,
        root: ModelId,
        free: FreeVector,
        derivative_step: f64,
    ) -> Self {
        let target = session.target();
        Self {
            root,
            bounds: free.bounds(session),
            free,
            data: target.data().to_owned(),
            inverse_sigma: target.inverse_sigma(),
            derivative_step,
        }
    }

    #[inline]
    pub(crate) fn free(&self) -> &FreeVector {
        &self.free
    }

    pub(crate) fn project(&self, x: &mut [f64]) {
        for (value, &(lower, upper)) in x.iter_mut().zip(&self.bounds) {
            *value = value.clamp(lower, upper);
        }
    }

    /// Scatter `x` into the session and return flattened weighted residuals
    ///
    /// `None` means the model cannot be rendered at `x` or some residual is not finite.
    pub(crate) fn residuals(&self, session: &mut Session, x: &[f64]) -> Option<DVector<f64>> {
        self.free.scatter(x, session);
        let model = session.render_model(self.root).ok()?;
        let mut residuals = Vec::with_capacity(model.len());
        Zip::from(&model)
            .and(&self.data)
            .and(&self.inverse_sigma)
            .for_each(|&m, &d, &w| residuals.push(if w > 0.0 { (m - d) * w } else { 0.0 }));
        residuals
            .iter()
            .all(|r| r.is_finite())
            .then(|| DVector::from_vec(residuals))
    }

    /// One-sided finite-difference Jacobian at `x`, `r0` are the residuals at `x`
    ///
    /// Every parameter is shifted towards the farther bound. The session is left at `x`.
    pub(crate) fn jacobian(
        &self,
        session: &mut Session,
        x: &[f64],
        r0: &DVector<f64>,
    ) -> Option<DMatrix<f64>> {
        let mut jacobian = DMatrix::zeros(r0.len(), x.len());
        let mut shifted = x.to_vec();
        for (k, &(lower, upper)) in self.bounds.iter().enumerate() {
            let h = self.derivative_step * x[k].abs().max(1.0);
            let (room_up, room_down) = (upper - x[k], x[k] - lower);
            let step = if room_up >= room_down {
                h.min(room_up)
            } else {
                -h.min(room_down)
            };
            if step == 0.0 {
                continue;
            }
            shifted[k] = x[k] + step;
            let r = self.residuals(session, &shifted);
            shifted[k] = x[k];
            let r = r?;
            jacobian.set_column(k, &((r - r0) / step));
        }
        self.free.scatter(x, session);
        Some(jacobian)
    }
}
