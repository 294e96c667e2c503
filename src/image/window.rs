use crate::error::ImageError;

use ndarray::{ArrayBase, ArrayView2, ArrayViewMut2, Data, DataMut, Ix2, s};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Rectangle of pixel indices a model is evaluated over
///
/// `row` and `col` are the indices of the top-left pixel, `rows` and `cols` are the window
/// shape. Windows are always expressed in the frame of the target image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Window {
    pub row: usize,
    pub col: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Window {
    pub fn new(row: usize, col: usize, rows: usize, cols: usize) -> Result<Self, ImageError> {
        if rows == 0 || cols == 0 {
            return Err(ImageError::EmptyWindow);
        }
        Ok(Self {
            row,
            col,
            rows,
            cols,
        })
    }

    /// Window covering a whole image of the given shape
    pub fn full(shape: (usize, usize)) -> Self {
        Self {
            row: 0,
            col: 0,
            rows: shape.0,
            cols: shape.1,
        }
    }

    /// Square window of `2 * half_size + 1` pixels centred at the given pixel, cropped to the
    /// image shape
    pub fn around(
        center: (usize, usize),
        half_size: usize,
        shape: (usize, usize),
    ) -> Result<Self, ImageError> {
        let row = center.0.saturating_sub(half_size);
        let col = center.1.saturating_sub(half_size);
        let row_end = usize::min(center.0 + half_size + 1, shape.0);
        let col_end = usize::min(center.1 + half_size + 1, shape.1);
        if row >= row_end || col >= col_end {
            return Err(ImageError::WindowOutOfBounds {
                window: Self {
                    row,
                    col,
                    rows: 2 * half_size + 1,
                    cols: 2 * half_size + 1,
                },
                shape,
            });
        }
        Self::new(row, col, row_end - row, col_end - col)
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fits_into(&self, shape: (usize, usize)) -> bool {
        self.row + self.rows <= shape.0 && self.col + self.cols <= shape.1
    }

    pub fn check_fits_into(&self, shape: (usize, usize)) -> Result<(), ImageError> {
        if self.is_empty() {
            return Err(ImageError::EmptyWindow);
        }
        if !self.fits_into(shape) {
            return Err(ImageError::WindowOutOfBounds {
                window: *self,
                shape,
            });
        }
        Ok(())
    }

    pub fn view<'a, S>(&self, image: &'a ArrayBase<S, Ix2>) -> ArrayView2<'a, f64>
    where
        S: Data<Elem = f64>,
    {
        image.slice(s![
            self.row..self.row + self.rows,
            self.col..self.col + self.cols
        ])
    }

    pub fn view_mut<'a, S>(&self, image: &'a mut ArrayBase<S, Ix2>) -> ArrayViewMut2<'a, f64>
    where
        S: DataMut<Elem = f64>,
    {
        image.slice_mut(s![
            self.row..self.row + self.rows,
            self.col..self.col + self.cols
        ])
    }

    /// Index of the central pixel, rounded towards the top-left corner for even sizes
    pub fn center_pixel(&self) -> (usize, usize) {
        (self.row + (self.rows - 1) / 2, self.col + (self.cols - 1) / 2)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}..{}, {}..{}]",
            self.row,
            self.row + self.rows,
            self.col,
            self.col + self.cols
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ndarray::Array2;

    #[test]
    fn empty_window_is_rejected() {
        assert_eq!(Window::new(0, 0, 0, 3), Err(ImageError::EmptyWindow));
    }

    #[test]
    fn around_crops_to_image() {
        let window = Window::around((1, 8), 3, (10, 10)).unwrap();
        assert_eq!(window, Window::new(0, 5, 5, 5).unwrap());
        assert!(window.fits_into((10, 10)));
    }

    #[test]
    fn out_of_image_window() {
        let window = Window::new(5, 5, 6, 2).unwrap();
        assert!(matches!(
            window.check_fits_into((10, 10)),
            Err(ImageError::WindowOutOfBounds { .. })
        ));
    }

    #[test]
    fn view_selects_window_pixels() {
        let image = Array2::from_shape_fn((4, 5), |(i, j)| (10 * i + j) as f64);
        let window = Window::new(1, 2, 2, 3).unwrap();
        let view = window.view(&image);
        assert_eq!(view.dim(), (2, 3));
        assert_eq!(view[[0, 0]], 12.0);
        assert_eq!(view[[1, 2]], 24.0);
    }
}
