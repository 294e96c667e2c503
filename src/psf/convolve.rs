use crate::psf::PsfKernel;

use ndarray::{Array2, ArrayView2, Zip, s};

/// Convolve an image with a kernel, the output has the image shape
///
/// Pixels outside of the image are treated as zeros, so flux which the kernel spreads beyond
/// the image edges is lost.
pub fn convolve(image: &ArrayView2<f64>, kernel: &PsfKernel) -> Array2<f64> {
    let (rows, cols) = image.dim();
    let (half_rows, half_cols) = kernel.half_size();
    let mut padded = Array2::zeros((rows + 2 * half_rows, cols + 2 * half_cols));
    padded
        .slice_mut(s![half_rows..half_rows + rows, half_cols..half_cols + cols])
        .assign(image);
    convolve_valid(&padded.view(), kernel)
}

/// Convolve keeping only positions where the kernel fully overlaps the input
///
/// The output is smaller than `padded` by the kernel size minus one along each axis. This is
/// how components are blurred: they are rendered with a margin of the kernel half-size and
/// the margin is consumed by the convolution.
pub fn convolve_valid(padded: &ArrayView2<f64>, kernel: &PsfKernel) -> Array2<f64> {
    let (rows, cols) = padded.dim();
    let (k_rows, k_cols) = kernel.shape();
    let out_shape = (
        (rows + 1).saturating_sub(k_rows),
        (cols + 1).saturating_sub(k_cols),
    );
    let flipped = kernel.view().slice_move(s![..;-1, ..;-1]);
    let mut output = Array2::zeros(out_shape);
    if output.is_empty() {
        return output;
    }
    Zip::from(&mut output)
        .and(padded.windows((k_rows, k_cols)))
        .for_each(|out, window| {
            *out = Zip::from(&window)
                .and(&flipped)
                .fold(0.0, |acc, &x, &k| acc + x * k);
        });
    output
}
