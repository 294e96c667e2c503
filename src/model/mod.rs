mod component;
pub use component::{Component, ComponentOptions, ComponentRole};

mod group;
pub use group::GroupModel;

use std::fmt;

/// Handle of a model inside a [crate::Session]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub(crate) usize);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Node of the model tree
#[derive(Clone, Debug)]
pub enum ModelNode {
    Component(Component),
    Group(GroupModel),
}

impl ModelNode {
    pub fn name(&self) -> &str {
        match self {
            Self::Component(c) => c.name(),
            Self::Group(g) => g.name(),
        }
    }

    /// Group this node is a member of
    pub fn group(&self) -> Option<ModelId> {
        match self {
            Self::Component(c) => c.group,
            Self::Group(g) => g.group,
        }
    }

    pub(crate) fn set_group(&mut self, group: Option<ModelId>) {
        match self {
            Self::Component(c) => c.group = group,
            Self::Group(g) => g.group = group,
        }
    }

    pub fn as_component(&self) -> Option<&Component> {
        match self {
            Self::Component(c) => Some(c),
            Self::Group(_) => None,
        }
    }

    pub fn as_group(&self) -> Option<&GroupModel> {
        match self {
            Self::Component(_) => None,
            Self::Group(g) => Some(g),
        }
    }
}
