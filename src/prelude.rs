pub use crate::fit::{FitResult, FitStatus, LevenbergMarquardt};
pub use crate::image::{ImageBuffer, Window};
pub use crate::model::{ComponentOptions, ModelId};
pub use crate::parameter::{BoundsPolicy, ParameterInit};
pub use crate::profile::{Profile, ProfileTrait};
pub use crate::psf::{PsfKernel, PsfSource};
pub use crate::session::Session;
