//! PSF kernels and convolution
//!
//! A component blurred by a PSF is rendered over its window padded by the kernel half-size,
//! then convolved in "valid" mode, so the result has exactly the window shape and no zero
//! padding leaks into the window. Flux spread outside of the window is dropped. The same path
//! is taken for synthetic images and for fitting.

mod convolve;
pub use convolve::{convolve, convolve_valid};

mod kernel;
pub use kernel::PsfKernel;

use crate::model::ModelId;

/// Where a component takes its PSF from
#[derive(Clone, Debug, PartialEq)]
pub enum PsfSource {
    /// Fixed kernel owned by the component
    Kernel(PsfKernel),
    /// Kernel attached to the target [crate::ImageBuffer]
    Target,
    /// PSF model rendered and renormalized before every convolution
    Model(ModelId),
}

impl From<PsfKernel> for PsfSource {
    fn from(kernel: PsfKernel) -> Self {
        Self::Kernel(kernel)
    }
}

impl From<ModelId> for PsfSource {
    fn from(id: ModelId) -> Self {
        Self::Model(id)
    }
}
