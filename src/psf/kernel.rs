use crate::error::ImageError;
use crate::profile::{Profile, ProfileTrait};

use ndarray::{Array2, ArrayView2};

/// Fixed PSF kernel with odd dimensions normalized to unit sum
#[derive(Clone, Debug, PartialEq)]
pub struct PsfKernel {
    kernel: Array2<f64>,
}

impl PsfKernel {
    /// Normalize `kernel` by its sum
    ///
    /// Kernel dimensions must be odd so that the central pixel is well defined, values must be
    /// finite and the sum must be positive.
    pub fn new(kernel: Array2<f64>) -> Result<Self, ImageError> {
        let (rows, cols) = kernel.dim();
        if rows == 0 || cols == 0 {
            return Err(ImageError::InvalidKernel("kernel is empty"));
        }
        if rows % 2 == 0 || cols % 2 == 0 {
            return Err(ImageError::InvalidKernel("kernel dimensions must be odd"));
        }
        normalize(kernel).map(|kernel| Self { kernel })
    }

    /// Circular Gaussian kernel, `sigma` is in pixels
    pub fn gaussian(size: usize, sigma: f64) -> Result<Self, ImageError> {
        if !(sigma.is_finite() && sigma > 0.0) {
            return Err(ImageError::InvalidKernel("sigma must be positive"));
        }
        let center = (size / 2) as f64;
        Self::new(Array2::from_shape_fn((size, size), |(i, j)| {
            let (dy, dx) = (i as f64 - center, j as f64 - center);
            f64::exp(-0.5 * (dx * dx + dy * dy) / (sigma * sigma))
        }))
    }

    /// Render a profile on a `size × size` grid and normalize it
    ///
    /// Profile coordinates are physical, the grid has the given pixel scale and its top-left
    /// pixel corner is at the origin.
    pub fn from_profile(
        profile: &Profile,
        params: &[f64],
        size: usize,
        pixel_scale: f64,
        oversample: usize,
    ) -> Result<Self, ImageError> {
        debug_assert_eq!(params.len(), profile.parameter_specs().len());
        Self::new(profile.render(params, (0, 0), (size, size), pixel_scale, oversample))
    }

    #[inline]
    pub fn view(&self) -> ArrayView2<'_, f64> {
        self.kernel.view()
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        self.kernel.dim()
    }

    /// Number of pixels between the central pixel and the kernel edge along each axis
    #[inline]
    pub fn half_size(&self) -> (usize, usize) {
        let (rows, cols) = self.shape();
        (rows / 2, cols / 2)
    }

    pub fn into_inner(self) -> Array2<f64> {
        self.kernel
    }
}

fn normalize(mut kernel: Array2<f64>) -> Result<Array2<f64>, ImageError> {
    if kernel.iter().any(|x| !x.is_finite()) {
        return Err(ImageError::InvalidKernel("kernel values must be finite"));
    }
    let sum = kernel.sum();
    if !(sum > 0.0) {
        return Err(ImageError::InvalidKernel("kernel sum must be positive"));
    }
    kernel.mapv_inplace(|x| x / sum);
    Ok(kernel)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn normalized_to_unit_sum() {
        let kernel = PsfKernel::new(array![[1.0, 2.0, 1.0], [2.0, 4.0, 2.0], [1.0, 2.0, 1.0]])
            .unwrap();
        assert_relative_eq!(kernel.view().sum(), 1.0);
        assert_relative_eq!(kernel.view()[[1, 1]], 0.25);
    }

    #[test]
    fn even_kernel_is_rejected() {
        assert!(matches!(
            PsfKernel::new(Array2::ones((2, 3))),
            Err(ImageError::InvalidKernel(_))
        ));
    }

    #[test]
    fn zero_kernel_is_rejected() {
        assert!(PsfKernel::new(Array2::zeros((3, 3))).is_err());
    }

    #[test]
    fn gaussian_is_symmetric() {
        let kernel = PsfKernel::gaussian(7, 1.2).unwrap();
        let view = kernel.view();
        assert_eq!(kernel.half_size(), (3, 3));
        assert_relative_eq!(view.sum(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(view[[0, 3]], view[[6, 3]]);
        assert_relative_eq!(view[[3, 0]], view[[3, 6]]);
        assert!(view[[3, 3]] > view[[2, 3]]);
    }

    #[test]
    fn moffat_profile_kernel() {
        let params = [5.5, 5.5, 1.0, 0.0, 3.0, 1.5, 123.0];
        let kernel = PsfKernel::from_profile(&Profile::moffat(), &params, 11, 1.0, 1).unwrap();
        assert_relative_eq!(kernel.view().sum(), 1.0, epsilon = 1e-12);
        let view = kernel.view();
        assert_eq!(
            ndarray_stats::QuantileExt::argmax(&view).unwrap(),
            (5, 5)
        );
    }
}
