use crate::model::ModelId;

/// Additive composite of other models over the shared target
///
/// Member order is kept stable, it defines the order of free parameters and the order of
/// summation, the rendered image doesn't depend on it otherwise.
#[derive(Clone, Debug)]
pub struct GroupModel {
    pub(crate) name: String,
    pub(crate) members: Vec<ModelId>,
    pub(crate) group: Option<ModelId>,
}

impl GroupModel {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn members(&self) -> &[ModelId] {
        &self.members
    }

    #[inline]
    pub fn group(&self) -> Option<ModelId> {
        self.group
    }
}
