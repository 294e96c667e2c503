//! Helpers for synthetic experiments

use crate::image::ImageBuffer;

use ndarray::Zip;
use rand::Rng;
use rand_distr::StandardNormal;

/// Add independent `N(0, variance)` noise to every pixel
///
/// Pixels with zero variance are left as is.
pub fn add_gaussian_noise<R: Rng + ?Sized>(image: &mut ImageBuffer, rng: &mut R) {
    let variance = image.variance().to_owned();
    Zip::from(image.data_mut())
        .and(&variance)
        .for_each(|d, &v| {
            if v > 0.0 {
                let z: f64 = rng.sample(StandardNormal);
                *d += v.sqrt() * z;
            }
        });
}
