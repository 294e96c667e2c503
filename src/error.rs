use crate::parameter::ParameterDomain;

/// Error returned when an [crate::ImageBuffer] or a [crate::Window] is malformed
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ImageError {
    #[error("{what} shape {actual:?} differs from the data shape {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("variance at pixel ({row}, {col}) is {value}, it must be finite and non-negative")]
    InvalidVariance { row: usize, col: usize, value: f64 },

    #[error("pixel scale must be positive and finite, got {0}")]
    InvalidPixelScale(f64),

    #[error("invalid PSF kernel: {0}")]
    InvalidKernel(&'static str),

    #[error("window {window} does not fit into an image of shape {shape:?}")]
    WindowOutOfBounds {
        window: crate::Window,
        shape: (usize, usize),
    },

    #[error("window must contain at least one pixel")]
    EmptyWindow,
}

/// Error returned from structural and parameter operations of a [crate::Session]
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ModelError {
    #[error("value {value} of parameter {parameter} is outside of [{lower}, {upper}]")]
    OutOfBounds {
        parameter: String,
        value: f64,
        lower: f64,
        upper: f64,
    },

    #[error("cannot constrain {left} ({left_domain:?}) to {right} ({right_domain:?}): {reason}")]
    TypeMismatch {
        left: String,
        left_domain: ParameterDomain,
        right: String,
        right_domain: ParameterDomain,
        reason: &'static str,
    },

    #[error("{0} while a fit is in progress")]
    InvalidState(&'static str),

    #[error("model {0} does not exist")]
    UnknownModel(String),

    #[error("model {model} has no parameter {parameter}")]
    UnknownParameter { model: String, parameter: String },

    #[error("a model named {0} already exists")]
    DuplicateName(String),

    #[error("bounds [{lower}, {upper}] of parameter {parameter} are empty or invalid")]
    InvalidBounds {
        parameter: String,
        lower: f64,
        upper: f64,
    },

    #[error("model {model} already belongs to group {group}")]
    AlreadyGrouped { model: String, group: String },

    #[error("model {model} cannot be used that way: {reason}")]
    InvalidUsage { model: String, reason: &'static str },

    #[error("free vector has {expected} slots, got {actual} values")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("invalid parameter path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error(transparent)]
    Image(#[from] ImageError),
}

/// Error returned when a fit cannot be started or a fit result cannot be post-processed
///
/// Numerical trouble during iterations is not an error, see [crate::FitStatus]
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FitError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model {0} has no free parameters to fit")]
    NoFreeParameters(String),

    #[error("{pixels} usable pixels are not enough to fit {parameters} free parameters")]
    TooFewPixels { pixels: usize, parameters: usize },

    #[error("covariance matrix is singular, some parameters are not constrained by the data")]
    SingularCovariance,

    #[error("the fit is still in progress")]
    NotFinished,

    #[error("invalid fit options: {0}")]
    InvalidOptions(&'static str),
}
