#![doc = include_str!("../README.md")]


pub mod constraint;
pub use constraint::{ConstraintGraph, FreeVector, ParamKey};

mod error;
pub use error::{FitError, ImageError, ModelError};

pub mod fit;
pub use fit::{FitResult, FitRun, FitState, FitStatus, LevenbergMarquardt};

pub mod image;
pub use image::{ImageBuffer, Window};

pub mod model;
pub use model::{Component, ComponentOptions, ComponentRole, GroupModel, ModelId, ModelNode};

pub mod parameter;
pub use parameter::{
    BoundsPolicy, Parameter, ParameterDomain, ParameterInit, ParameterPath, ParameterSpec,
    ParameterTable,
};

pub mod prelude;

pub mod profile;
pub use profile::{FlatSky, Gaussian, Moffat, Profile, ProfileTrait, Sersic, WindowStats};

pub mod psf;
pub use psf::{PsfKernel, PsfSource};

mod session;
pub use session::Session;

pub mod synthetic;

pub use nalgebra;
pub use ndarray;
