use crate::image::{ImageBuffer, Window};

use ndarray::Zip;
use ndarray_stats::QuantileExt;
use std::f64::consts::PI;

/// Summary of the target pixels inside a model window, used to guess initial parameters
///
/// Brightness-like quantities are surface brightness (per unit physical area), lengths are in
/// physical units.
#[derive(Clone, Debug, PartialEq)]
pub struct WindowStats {
    /// Median pixel brightness, taken as the local background
    pub background: f64,
    /// Maximum background-subtracted brightness
    pub peak: f64,
    /// Sum of positive background-subtracted pixel fluxes
    pub flux: f64,
    /// Flux-weighted centre
    pub centroid: (f64, f64),
    /// Square root of the largest eigenvalue of the second moments
    pub sigma: f64,
    pub axis_ratio: f64,
    pub position_angle: f64,
}

impl WindowStats {
    pub fn from_image(image: &ImageBuffer, window: &Window) -> Self {
        let full_data = image.data();
        let full_variance = image.variance();
        let data = window.view(&full_data);
        let variance = window.view(&full_variance);
        let area = image.pixel_area();

        let mut values: Vec<f64> = Zip::from(&data)
            .and(&variance)
            .fold(Vec::with_capacity(data.len()), |mut acc, &d, &v| {
                if v > 0.0 && d.is_finite() {
                    acc.push(d);
                }
                acc
            });
        values.sort_unstable_by(f64::total_cmp);
        let background = median_sorted(&values);

        let excess = data.mapv(|d| if d.is_finite() { d - background } else { 0.0 });
        let peak = (*excess.max_skipnan()).max(0.0);

        let (mut sum_w, mut sum_x, mut sum_y) = (0.0, 0.0, 0.0);
        for ((i, j), &w) in excess.indexed_iter() {
            if w > 0.0 {
                let (x, y) =
                    image.pixel_center((window.row + i) as f64, (window.col + j) as f64);
                sum_w += w;
                sum_x += w * x;
                sum_y += w * y;
            }
        }
        let centroid = if sum_w > 0.0 {
            (sum_x / sum_w, sum_y / sum_w)
        } else {
            let (row, col) = window.center_pixel();
            image.pixel_center(row as f64, col as f64)
        };

        let (mut mxx, mut myy, mut mxy) = (0.0, 0.0, 0.0);
        for ((i, j), &w) in excess.indexed_iter() {
            if w > 0.0 {
                let (x, y) =
                    image.pixel_center((window.row + i) as f64, (window.col + j) as f64);
                let (dx, dy) = (x - centroid.0, y - centroid.1);
                mxx += w * dx * dx;
                myy += w * dy * dy;
                mxy += w * dx * dy;
            }
        }
        let (sigma, axis_ratio, position_angle) = if sum_w > 0.0 {
            ellipse_from_moments(mxx / sum_w, myy / sum_w, mxy / sum_w)
        } else {
            (image.pixel_scale(), 1.0, 0.0)
        };

        Self {
            background: background / area,
            peak: peak / area,
            flux: sum_w,
            centroid,
            sigma: sigma.max(0.5 * image.pixel_scale()),
            axis_ratio,
            position_angle,
        }
    }
}

fn median_sorted(values: &[f64]) -> f64 {
    match values.len() {
        0 => 0.0,
        n if n % 2 == 1 => values[n / 2],
        n => 0.5 * (values[n / 2 - 1] + values[n / 2]),
    }
}

/// Semi-major scale, axis ratio and position angle in `[0, π)` of the second moments
fn ellipse_from_moments(mxx: f64, myy: f64, mxy: f64) -> (f64, f64, f64) {
    let mean = 0.5 * (mxx + myy);
    let diff = (0.5 * (mxx - myy)).hypot(mxy);
    let major = (mean + diff).max(0.0);
    let minor = (mean - diff).max(0.0);
    if major <= 0.0 {
        return (0.0, 1.0, 0.0);
    }
    let q = (minor / major).sqrt().clamp(0.05, 1.0);
    let pa = (0.5 * f64::atan2(2.0 * mxy, mxx - myy)).rem_euclid(PI);
    (major.sqrt(), q, pa)
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use ndarray::Array2;

    #[test]
    fn median() {
        assert_eq!(median_sorted(&[]), 0.0);
        assert_eq!(median_sorted(&[1.0, 2.0, 10.0]), 2.0);
        assert_eq!(median_sorted(&[1.0, 2.0, 4.0, 10.0]), 3.0);
    }

    #[test]
    fn elongated_blob() {
        let theta: f64 = 0.6;
        let (sin, cos) = theta.sin_cos();
        let data = Array2::from_shape_fn((41, 41), |(i, j)| {
            let (dx, dy) = (j as f64 + 0.5 - 20.0, i as f64 + 0.5 - 22.0);
            let u = dx * cos + dy * sin;
            let v = -dx * sin + dy * cos;
            5.0 + 100.0 * (-0.5 * (u * u / 9.0 + v * v / 2.25)).exp()
        });
        let image = ImageBuffer::with_uniform_variance(data, 1.0, 1.0).unwrap();
        let stats = WindowStats::from_image(&image, &image.full_window());
        assert_abs_diff_eq!(stats.background, 5.0, epsilon = 1e-6);
        assert_abs_diff_eq!(stats.peak, 100.0, epsilon = 5.0);
        assert_abs_diff_eq!(stats.centroid.0, 20.0, epsilon = 1e-3);
        assert_abs_diff_eq!(stats.centroid.1, 22.0, epsilon = 1e-3);
        assert_abs_diff_eq!(stats.sigma, 3.0, epsilon = 0.05);
        assert_abs_diff_eq!(stats.axis_ratio, 0.5, epsilon = 0.02);
        assert_abs_diff_eq!(stats.position_angle, theta, epsilon = 0.01);
    }

    #[test]
    fn flat_window_falls_back_to_centre() {
        let image = ImageBuffer::with_uniform_variance(Array2::ones((5, 7)), 1.0, 2.0).unwrap();
        let stats = WindowStats::from_image(&image, &image.full_window());
        assert_eq!(stats.peak, 0.0);
        assert_eq!(stats.centroid, (7.0, 5.0));
        assert_eq!(stats.axis_ratio, 1.0);
    }
}
