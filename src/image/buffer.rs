use crate::error::ImageError;
use crate::image::Window;
use crate::psf::PsfKernel;

use ndarray::{Array2, ArrayView2, Zip};

/// Observed or synthetic image together with its per-pixel variance
///
/// `data` and `variance` always have the same shape and every variance value is finite and
/// non-negative. Pixels with zero variance carry no information and are masked out of the
/// fit. Physical coordinates of the pixel `(row, col)` centre are
/// `((col + 0.5) * pixel_scale, (row + 0.5) * pixel_scale)`.
#[derive(Clone, Debug)]
pub struct ImageBuffer {
    data: Array2<f64>,
    variance: Array2<f64>,
    pixel_scale: f64,
    psf: Option<PsfKernel>,
}

impl ImageBuffer {
    pub fn new(
        data: Array2<f64>,
        variance: Array2<f64>,
        pixel_scale: f64,
    ) -> Result<Self, ImageError> {
        if !(pixel_scale.is_finite() && pixel_scale > 0.0) {
            return Err(ImageError::InvalidPixelScale(pixel_scale));
        }
        check_shape("variance", data.dim(), variance.dim())?;
        check_variance(&variance.view())?;
        Ok(Self {
            data,
            variance,
            pixel_scale,
            psf: None,
        })
    }

    /// Image with the same variance in every pixel
    pub fn with_uniform_variance(
        data: Array2<f64>,
        variance: f64,
        pixel_scale: f64,
    ) -> Result<Self, ImageError> {
        let variance = Array2::from_elem(data.dim(), variance);
        Self::new(data, variance, pixel_scale)
    }

    /// Blank image of the given shape, handy as a canvas for synthetic experiments
    pub fn zeros(
        shape: (usize, usize),
        variance: f64,
        pixel_scale: f64,
    ) -> Result<Self, ImageError> {
        Self::with_uniform_variance(Array2::zeros(shape), variance, pixel_scale)
    }

    /// Attach a fixed PSF kernel describing the blur of this observation
    pub fn with_psf(mut self, psf: PsfKernel) -> Self {
        self.psf = Some(psf);
        self
    }

    #[inline]
    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }

    #[inline]
    pub fn variance(&self) -> ArrayView2<'_, f64> {
        self.variance.view()
    }

    #[inline]
    pub fn pixel_scale(&self) -> f64 {
        self.pixel_scale
    }

    #[inline]
    pub fn psf(&self) -> Option<&PsfKernel> {
        self.psf.as_ref()
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        self.data.dim()
    }

    #[inline]
    pub fn full_window(&self) -> Window {
        Window::full(self.shape())
    }

    #[inline]
    pub fn pixel_area(&self) -> f64 {
        self.pixel_scale * self.pixel_scale
    }

    /// Replace pixel values, e.g. to inject a synthetic signal
    pub fn set_data(&mut self, data: Array2<f64>) -> Result<(), ImageError> {
        check_shape("data", self.data.dim(), data.dim())?;
        self.data = data;
        Ok(())
    }

    pub fn set_variance(&mut self, variance: Array2<f64>) -> Result<(), ImageError> {
        check_shape("variance", self.data.dim(), variance.dim())?;
        check_variance(&variance.view())?;
        self.variance = variance;
        Ok(())
    }

    pub(crate) fn data_mut(&mut self) -> &mut Array2<f64> {
        &mut self.data
    }

    /// Physical coordinates of a pixel centre
    #[inline]
    pub fn pixel_center(&self, row: f64, col: f64) -> (f64, f64) {
        (
            (col + 0.5) * self.pixel_scale,
            (row + 0.5) * self.pixel_scale,
        )
    }

    /// Number of pixels inside the window which are used by the fit
    pub fn count_informative(&self, window: &Window) -> usize {
        window.view(&self.variance).iter().filter(|&&v| v > 0.0).count()
    }

    /// Inverse standard deviation per pixel, zero for masked pixels
    pub fn inverse_sigma(&self) -> Array2<f64> {
        self.variance
            .mapv(|v| if v > 0.0 { v.sqrt().recip() } else { 0.0 })
    }

    /// Sum of squared weighted residuals of a full-frame model image
    pub fn chi2(&self, model: &ArrayView2<f64>) -> f64 {
        Zip::from(model)
            .and(&self.data)
            .and(&self.variance)
            .fold(0.0, |acc, &m, &d, &v| {
                if v > 0.0 {
                    acc + (m - d).powi(2) / v
                } else {
                    acc
                }
            })
    }
}

fn check_shape(
    what: &'static str,
    expected: (usize, usize),
    actual: (usize, usize),
) -> Result<(), ImageError> {
    if expected != actual {
        return Err(ImageError::ShapeMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

fn check_variance(variance: &ArrayView2<f64>) -> Result<(), ImageError> {
    match variance
        .indexed_iter()
        .find(|(_, v)| !(v.is_finite() && **v >= 0.0))
    {
        Some(((row, col), &value)) => Err(ImageError::InvalidVariance { row, col, value }),
        None => Ok(()),
    }
}
