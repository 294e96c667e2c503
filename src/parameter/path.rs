use crate::error::ModelError;

use std::fmt;
use std::str::FromStr;

/// Qualified parameter name like `"galaxy:psf:n"`
///
/// All segments but the last are model names, each one must be reachable from the previous
/// one either as a group member or as the PSF model of a component. The last segment is the
/// parameter name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParameterPath {
    models: Vec<String>,
    parameter: String,
}

impl ParameterPath {
    pub fn new<I, S>(models: I, parameter: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            models: models.into_iter().map(Into::into).collect(),
            parameter: parameter.into(),
        }
    }

    #[inline]
    pub fn models(&self) -> &[String] {
        &self.models
    }

    #[inline]
    pub fn parameter(&self) -> &str {
        &self.parameter
    }
}

impl FromStr for ParameterPath {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| ModelError::InvalidPath {
            path: s.to_owned(),
            reason,
        };
        let mut segments: Vec<_> = s.split(':').map(str::trim).collect();
        if segments.iter().any(|segment| segment.is_empty()) {
            return Err(invalid("empty segment"));
        }
        let parameter = segments.pop().ok_or_else(|| invalid("empty path"))?;
        Ok(Self::new(segments, parameter))
    }
}

impl fmt::Display for ParameterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for model in &self.models {
            write!(f, "{}:", model)?;
        }
        write!(f, "{}", self.parameter)
    }
}
