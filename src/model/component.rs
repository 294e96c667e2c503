use crate::image::Window;
use crate::model::ModelId;
use crate::parameter::{BoundsPolicy, ParameterTable};
use crate::profile::{Profile, ProfileTrait};
use crate::psf::PsfSource;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Construction options of a component
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ComponentOptions {
    /// Pixel region to render, the whole target if `None`
    #[serde(default)]
    pub window: Option<Window>,
    /// Number of brightness samples per pixel side
    #[serde(default = "ComponentOptions::default_oversample")]
    pub oversample: usize,
    #[serde(default)]
    pub bounds_policy: BoundsPolicy,
    #[serde(skip)]
    pub psf: Option<PsfSource>,
}

impl ComponentOptions {
    #[inline]
    pub fn default_oversample() -> usize {
        1
    }

    pub fn window(mut self, window: Window) -> Self {
        self.window = Some(window);
        self
    }

    pub fn oversample(mut self, oversample: usize) -> Self {
        self.oversample = oversample;
        self
    }

    pub fn bounds_policy(mut self, bounds_policy: BoundsPolicy) -> Self {
        self.bounds_policy = bounds_policy;
        self
    }

    pub fn psf(mut self, psf: impl Into<PsfSource>) -> Self {
        self.psf = Some(psf.into());
        self
    }
}

impl Default for ComponentOptions {
    fn default() -> Self {
        Self {
            window: None,
            oversample: Self::default_oversample(),
            bounds_policy: BoundsPolicy::default(),
            psf: None,
        }
    }
}

/// Where a component is rendered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComponentRole {
    /// Contributes to the target image over its window
    Image,
    /// Rendered on its own odd `size × size` grid and only used as a PSF kernel
    Psf { size: usize },
}

/// Single parametric light distribution
#[derive(Clone, Debug)]
pub struct Component {
    pub(crate) name: String,
    pub(crate) profile: Profile,
    pub(crate) parameters: ParameterTable,
    pub(crate) window: Window,
    pub(crate) psf: Option<PsfSource>,
    pub(crate) oversample: usize,
    pub(crate) bounds_policy: BoundsPolicy,
    pub(crate) role: ComponentRole,
    pub(crate) group: Option<ModelId>,
    /// Set once starting values were guessed from the target
    pub(crate) initialized: bool,
}

impl Component {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    #[inline]
    pub fn kind(&self) -> &'static str {
        self.profile.kind()
    }

    #[inline]
    pub fn parameters(&self) -> &ParameterTable {
        &self.parameters
    }

    #[inline]
    pub fn window(&self) -> Window {
        self.window
    }

    #[inline]
    pub fn psf(&self) -> Option<&PsfSource> {
        self.psf.as_ref()
    }

    #[inline]
    pub fn oversample(&self) -> usize {
        self.oversample
    }

    #[inline]
    pub fn bounds_policy(&self) -> BoundsPolicy {
        self.bounds_policy
    }

    #[inline]
    pub fn role(&self) -> ComponentRole {
        self.role
    }

    #[inline]
    pub fn is_psf_model(&self) -> bool {
        matches!(self.role, ComponentRole::Psf { .. })
    }

    /// Group this component is a member of
    #[inline]
    pub fn group(&self) -> Option<ModelId> {
        self.group
    }

    /// Whether starting values were already derived from the target
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }
}
