use crate::constraint::{ConstraintGraph, FreeVector, ParamKey, ParameterStore};
use crate::error::{ImageError, ModelError};
use crate::image::{ImageBuffer, Window};
use crate::model::{Component, ComponentOptions, ComponentRole, GroupModel, ModelId, ModelNode};
use crate::parameter::{BoundsPolicy, Parameter, ParameterInit, ParameterPath, ParameterTable};
use crate::profile::{Profile, ProfileTrait, WindowStats};
use crate::psf::{PsfKernel, PsfSource, convolve_valid};

use ndarray::Array2;
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet};

/// Arena owning a target image, the models describing it and the constraints between them
///
/// Models are addressed by [ModelId] handles or by their unique names. While a
/// [crate::FitRun] borrows the session every mutating operation fails with
/// [ModelError::InvalidState].
#[derive(Clone, Debug)]
pub struct Session {
    target: ImageBuffer,
    nodes: Vec<Option<ModelNode>>,
    names: BTreeMap<String, ModelId>,
    constraints: ConstraintGraph,
    fit_active: bool,
}

impl Session {
    pub fn new(target: ImageBuffer) -> Self {
        Self {
            target,
            nodes: vec![],
            names: BTreeMap::new(),
            constraints: ConstraintGraph::new(),
            fit_active: false,
        }
    }

    #[inline]
    pub fn target(&self) -> &ImageBuffer {
        &self.target
    }

    /// Replace the target image
    ///
    /// Every component window must fit into the new image, and it must carry a PSF kernel if
    /// some component is blurred by the target PSF. Parameters are kept, call
    /// [Session::initialize] to guess them again from the new pixels.
    pub fn set_target(&mut self, target: ImageBuffer) -> Result<(), ModelError> {
        self.ensure_idle("cannot modify the target image")?;
        for (_, node) in self.models() {
            let Some(component) = node.as_component() else {
                continue;
            };
            if component.is_psf_model() {
                continue;
            }
            component.window.check_fits_into(target.shape())?;
            if matches!(component.psf, Some(PsfSource::Target)) && target.psf().is_none() {
                return Err(ModelError::InvalidUsage {
                    model: component.name.clone(),
                    reason: "the target image has no PSF kernel",
                });
            }
        }
        self.target = target;
        Ok(())
    }

    /// Replace target pixel values keeping its shape, variance and PSF
    pub fn set_target_data(&mut self, data: Array2<f64>) -> Result<(), ModelError> {
        self.ensure_idle("cannot modify the target image")?;
        Ok(self.target.set_data(data)?)
    }

    pub fn set_target_variance(&mut self, variance: Array2<f64>) -> Result<(), ModelError> {
        self.ensure_idle("cannot modify the target image")?;
        Ok(self.target.set_variance(variance)?)
    }

    #[inline]
    pub fn constraints(&self) -> &ConstraintGraph {
        &self.constraints
    }

    /// Whether a [crate::FitRun] currently owns the session
    #[inline]
    pub fn is_fit_active(&self) -> bool {
        self.fit_active
    }

    pub(crate) fn set_fit_active(&mut self, active: bool) {
        self.fit_active = active;
    }

    fn ensure_idle(&self, what: &'static str) -> Result<(), ModelError> {
        if self.fit_active {
            Err(ModelError::InvalidState(what))
        } else {
            Ok(())
        }
    }

    pub fn model(&self, id: ModelId) -> Result<&ModelNode, ModelError> {
        self.nodes
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or_else(|| ModelError::UnknownModel(id.to_string()))
    }

    fn node_mut(&mut self, id: ModelId) -> Result<&mut ModelNode, ModelError> {
        self.nodes
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| ModelError::UnknownModel(id.to_string()))
    }

    pub fn component(&self, id: ModelId) -> Result<&Component, ModelError> {
        match self.model(id)? {
            ModelNode::Component(c) => Ok(c),
            ModelNode::Group(g) => Err(ModelError::InvalidUsage {
                model: g.name.clone(),
                reason: "a group model has no parameters of its own",
            }),
        }
    }

    fn component_mut(&mut self, id: ModelId) -> Result<&mut Component, ModelError> {
        match self.node_mut(id)? {
            ModelNode::Component(c) => Ok(c),
            ModelNode::Group(g) => Err(ModelError::InvalidUsage {
                model: g.name.clone(),
                reason: "a group model has no parameters of its own",
            }),
        }
    }

    pub fn group(&self, id: ModelId) -> Result<&GroupModel, ModelError> {
        match self.model(id)? {
            ModelNode::Group(g) => Ok(g),
            ModelNode::Component(c) => Err(ModelError::InvalidUsage {
                model: c.name.clone(),
                reason: "not a group model",
            }),
        }
    }

    fn group_mut(&mut self, id: ModelId) -> Result<&mut GroupModel, ModelError> {
        match self.node_mut(id)? {
            ModelNode::Group(g) => Ok(g),
            ModelNode::Component(c) => Err(ModelError::InvalidUsage {
                model: c.name.clone(),
                reason: "not a group model",
            }),
        }
    }

    /// Find a model by its name
    pub fn id(&self, name: &str) -> Result<ModelId, ModelError> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownModel(name.to_owned()))
    }

    pub fn name(&self, id: ModelId) -> Result<&str, ModelError> {
        self.model(id).map(ModelNode::name)
    }

    /// All live models in creation order
    pub fn models(&self) -> impl Iterator<Item = (ModelId, &ModelNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, node)| node.as_ref().map(|node| (ModelId(i), node)))
    }

    fn register(&mut self, node: ModelNode) -> ModelId {
        let id = ModelId(self.nodes.len());
        self.names.insert(node.name().to_owned(), id);
        self.nodes.push(Some(node));
        id
    }

    fn check_new_name(&self, name: &str) -> Result<(), ModelError> {
        if name.is_empty() || name.contains(':') {
            return Err(ModelError::InvalidPath {
                path: name.to_owned(),
                reason: "model names must be non-empty and must not contain ':'",
            });
        }
        if self.names.contains_key(name) {
            return Err(ModelError::DuplicateName(name.to_owned()));
        }
        Ok(())
    }

    fn collect_inits<I, S, P>(parameters: I) -> BTreeMap<String, ParameterInit>
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<ParameterInit>,
    {
        parameters
            .into_iter()
            .map(|(name, init)| (name.into(), init.into()))
            .collect()
    }

    fn check_psf_source(&self, model: &str, psf: &PsfSource) -> Result<(), ModelError> {
        let invalid = |reason| ModelError::InvalidUsage {
            model: model.to_owned(),
            reason,
        };
        match psf {
            PsfSource::Kernel(_) => Ok(()),
            PsfSource::Target if self.target.psf().is_some() => Ok(()),
            PsfSource::Target => Err(invalid("the target image has no PSF kernel")),
            PsfSource::Model(id) if self.component(*id)?.is_psf_model() => Ok(()),
            PsfSource::Model(_) => Err(invalid("PSF source must be a PSF model")),
        }
    }

    /// Create a component rendered onto the target image
    ///
    /// `parameters` lists initial states by parameter name, all other parameters start from the
    /// profile defaults and are guessed by [Session::initialize].
    pub fn create_model<I, S, P>(
        &mut self,
        name: impl Into<String>,
        profile: Profile,
        parameters: I,
        options: ComponentOptions,
    ) -> Result<ModelId, ModelError>
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<ParameterInit>,
    {
        self.ensure_idle("cannot create models")?;
        let name = name.into();
        self.check_new_name(&name)?;
        let window = options
            .window
            .unwrap_or_else(|| self.target.full_window());
        window.check_fits_into(self.target.shape())?;
        if options.oversample == 0 {
            return Err(ModelError::InvalidUsage {
                model: name,
                reason: "oversampling factor must be positive",
            });
        }
        if let Some(psf) = &options.psf {
            self.check_psf_source(&name, psf)?;
        }
        let parameters = ParameterTable::new(
            &name,
            profile.parameter_specs(),
            &Self::collect_inits(parameters),
        )?;
        let component = Component {
            name,
            profile,
            parameters,
            window,
            psf: options.psf,
            oversample: options.oversample,
            bounds_policy: options.bounds_policy,
            role: ComponentRole::Image,
            group: None,
            initialized: false,
        };
        Ok(self.register(ModelNode::Component(component)))
    }

    /// Create a PSF model rendered on its own odd `size × size` grid
    ///
    /// The grid shares the target pixel scale. Unless given explicitly the centre is placed in
    /// the middle of the central pixel. Centre and amplitude are locked on creation, the kernel
    /// is normalized anyway and a free centre would be degenerate with the positions of the
    /// blurred components. Use [Session::set_locked] to release them.
    pub fn create_psf_model<I, S, P>(
        &mut self,
        name: impl Into<String>,
        profile: Profile,
        size: usize,
        parameters: I,
    ) -> Result<ModelId, ModelError>
    where
        I: IntoIterator<Item = (S, P)>,
        S: Into<String>,
        P: Into<ParameterInit>,
    {
        self.ensure_idle("cannot create models")?;
        let name = name.into();
        self.check_new_name(&name)?;
        if size % 2 == 0 {
            return Err(ImageError::InvalidKernel("PSF model size must be odd").into());
        }
        let mut parameters = ParameterTable::new(
            &name,
            profile.parameter_specs(),
            &Self::collect_inits(parameters),
        )?;
        let center = 0.5 * size as f64 * self.target.pixel_scale();
        for coordinate in ["x", "y"] {
            if let Some(p) = parameters.get_mut(coordinate) {
                if !p.is_explicit() {
                    p.guess(center);
                }
                p.set_locked(true);
            }
        }
        if let Some(i) = profile.amplitude_index() {
            parameters.by_index_mut(i).set_locked(true);
        }
        let component = Component {
            name,
            profile,
            parameters,
            window: Window::full((size, size)),
            psf: None,
            oversample: ComponentOptions::default_oversample(),
            bounds_policy: BoundsPolicy::default(),
            role: ComponentRole::Psf { size },
            group: None,
            initialized: false,
        };
        Ok(self.register(ModelNode::Component(component)))
    }

    /// Create a group summing `members` over the target
    pub fn create_group_model(
        &mut self,
        name: impl Into<String>,
        members: &[ModelId],
    ) -> Result<ModelId, ModelError> {
        self.ensure_idle("cannot create models")?;
        let name = name.into();
        self.check_new_name(&name)?;
        for (i, &member) in members.iter().enumerate() {
            self.check_new_member(&name, member)?;
            if members[..i].contains(&member) {
                return Err(ModelError::InvalidUsage {
                    model: self.name(member)?.to_owned(),
                    reason: "listed twice in the same group",
                });
            }
        }
        let id = self.register(ModelNode::Group(GroupModel {
            name,
            members: members.to_vec(),
            group: None,
        }));
        for &member in members {
            self.node_mut(member)?.set_group(Some(id));
        }
        Ok(id)
    }

    fn check_new_member(&self, group_name: &str, member: ModelId) -> Result<(), ModelError> {
        let node = self.model(member)?;
        if let ModelNode::Component(c) = node {
            if c.is_psf_model() {
                return Err(ModelError::InvalidUsage {
                    model: c.name.clone(),
                    reason: "PSF models are not summed into images",
                });
            }
        }
        if let Some(group) = node.group() {
            return Err(ModelError::AlreadyGrouped {
                model: node.name().to_owned(),
                group: self.name(group).unwrap_or(group_name).to_owned(),
            });
        }
        Ok(())
    }

    pub fn add_member(&mut self, group: ModelId, member: ModelId) -> Result<(), ModelError> {
        self.ensure_idle("cannot change group membership")?;
        let group_name = self.group(group)?.name.clone();
        self.check_new_member(&group_name, member)?;
        let mut ancestor = Some(group);
        while let Some(id) = ancestor {
            if id == member {
                return Err(ModelError::InvalidUsage {
                    model: group_name,
                    reason: "group cannot contain itself",
                });
            }
            ancestor = self.model(id)?.group();
        }
        self.group_mut(group)?.members.push(member);
        self.node_mut(member)?.set_group(Some(group));
        Ok(())
    }

    pub fn remove_member(&mut self, group: ModelId, member: ModelId) -> Result<(), ModelError> {
        self.ensure_idle("cannot change group membership")?;
        let g = self.group_mut(group)?;
        let Some(position) = g.members.iter().position(|&m| m == member) else {
            return Err(ModelError::InvalidUsage {
                model: g.name.clone(),
                reason: "model is not a member of this group",
            });
        };
        g.members.remove(position);
        self.node_mut(member)?.set_group(None);
        Ok(())
    }

    /// Delete a model, its constraints and its group membership
    ///
    /// Members of a removed group become top-level models. A PSF model referenced by a
    /// component cannot be removed.
    pub fn remove_model(&mut self, id: ModelId) -> Result<(), ModelError> {
        self.ensure_idle("cannot remove models")?;
        let node = self.model(id)?;
        let name = node.name().to_owned();
        let in_use = self.models().any(|(_, other)| {
            matches!(
                other.as_component().and_then(Component::psf),
                Some(PsfSource::Model(psf)) if *psf == id
            )
        });
        if in_use {
            return Err(ModelError::InvalidUsage {
                model: name,
                reason: "model is used as a PSF",
            });
        }
        if let Some(group) = node.group() {
            self.group_mut(group)?.members.retain(|&m| m != id);
        }
        if let Some(ModelNode::Group(g)) = self.nodes[id.0].take() {
            for member in g.members {
                self.node_mut(member)?.set_group(None);
            }
        }
        self.constraints.release_model(id);
        self.names.remove(&name);
        Ok(())
    }

    /// Key of a named parameter of a component
    pub fn key(&self, id: ModelId, parameter: &str) -> Result<ParamKey, ModelError> {
        let component = self.component(id)?;
        component
            .parameters
            .index_of(parameter)
            .map(|index| ParamKey::new(id, index))
            .ok_or_else(|| ModelError::UnknownParameter {
                model: component.name.clone(),
                parameter: parameter.to_owned(),
            })
    }

    /// `"model:parameter"` name of a key
    pub fn qualified_name(&self, key: ParamKey) -> String {
        match self.component(key.model) {
            Ok(c) => format!("{}:{}", c.name, c.parameters.name(key.index)),
            Err(_) => format!("{}:{}", key.model, key.index),
        }
    }

    /// Parameter behind a key, fails if its model was removed
    pub fn parameter_by_key(&self, key: ParamKey) -> Result<&Parameter, ModelError> {
        let component = self.component(key.model)?;
        if key.index >= component.parameters.len() {
            return Err(ModelError::UnknownParameter {
                model: component.name.clone(),
                parameter: key.index.to_string(),
            });
        }
        Ok(component.parameters.by_index(key.index))
    }

    pub fn parameter(&self, id: ModelId, name: &str) -> Result<&Parameter, ModelError> {
        let key = self.key(id, name)?;
        Ok(ParameterStore::parameter(self, key))
    }

    pub fn get_parameter(&self, id: ModelId, name: &str) -> Result<f64, ModelError> {
        self.parameter(id, name).map(Parameter::value)
    }

    /// Set a parameter value according to the component [BoundsPolicy]
    ///
    /// The value is propagated to every parameter constrained to be equal, the stored value is
    /// returned.
    pub fn set_parameter(
        &mut self,
        id: ModelId,
        name: &str,
        value: f64,
    ) -> Result<f64, ModelError> {
        self.ensure_idle("cannot set parameters")?;
        let key = self.key(id, name)?;
        self.set_key(key, value)
    }

    fn set_key(&mut self, key: ParamKey, value: f64) -> Result<f64, ModelError> {
        let policy = self.component(key.model)?.bounds_policy;
        let qualified = self.qualified_name(key);
        let stored = self
            .parameter_mut(key)
            .set(value, policy, || qualified.clone())?;
        for member in self.constraints.members(key) {
            if member != key {
                self.parameter_mut(member)
                    .set(stored, BoundsPolicy::Clamp, String::new)?;
            }
        }
        Ok(stored)
    }

    /// Lock or unlock a parameter together with all parameters constrained to it
    pub fn set_locked(&mut self, id: ModelId, name: &str, locked: bool) -> Result<(), ModelError> {
        self.ensure_idle("cannot lock parameters")?;
        let key = self.key(id, name)?;
        for member in self.constraints.members(key) {
            self.parameter_mut(member).set_locked(locked);
        }
        Ok(())
    }

    /// Replace bounds of a parameter and of all parameters constrained to it
    pub fn set_bounds(
        &mut self,
        id: ModelId,
        name: &str,
        lower: f64,
        upper: f64,
    ) -> Result<(), ModelError> {
        self.ensure_idle("cannot change bounds")?;
        let key = self.key(id, name)?;
        let qualified = self.qualified_name(key);
        let mut checked = ParameterStore::parameter(self, key).clone();
        checked.set_bounds(lower, upper, || qualified.clone())?;
        let (lower, upper) = checked.bounds();
        for member in self.constraints.members(key) {
            self.parameter_mut(member)
                .set_bounds(lower, upper, String::new)?;
        }
        Ok(())
    }

    /// Constrain two parameters to share one value
    ///
    /// Both equality groups are merged. Members receive the intersection of all bounds and a
    /// common value, the value of `a` unless only `b` was set explicitly. If any member is
    /// locked the whole group becomes locked.
    pub fn declare_equal(
        &mut self,
        a: ModelId,
        parameter_a: &str,
        b: ModelId,
        parameter_b: &str,
    ) -> Result<(), ModelError> {
        self.ensure_idle("cannot declare constraints")?;
        let key_a = self.key(a, parameter_a)?;
        let key_b = self.key(b, parameter_b)?;
        let mismatch = |reason| ModelError::TypeMismatch {
            left: self.qualified_name(key_a),
            left_domain: ParameterStore::parameter(self, key_a).domain(),
            right: self.qualified_name(key_b),
            right_domain: ParameterStore::parameter(self, key_b).domain(),
            reason,
        };
        let (pa, pb) = (
            ParameterStore::parameter(self, key_a),
            ParameterStore::parameter(self, key_b),
        );
        if pa.domain() != pb.domain() {
            return Err(mismatch("parameter domains differ"));
        }
        if self.constraints.are_equal(key_a, key_b) {
            return Ok(());
        }

        let mut members = self.constraints.members(key_a);
        members.extend(self.constraints.members(key_b));
        let (mut lower, mut upper) = (f64::NEG_INFINITY, f64::INFINITY);
        let mut locked = false;
        for &member in &members {
            let p = ParameterStore::parameter(self, member);
            let (l, u) = p.bounds();
            lower = lower.max(l);
            upper = upper.min(u);
            locked |= p.is_locked();
        }
        if lower > upper {
            return Err(mismatch("parameter bounds do not overlap"));
        }
        let source = if !pa.is_explicit() && pb.is_explicit() {
            pb
        } else {
            pa
        };
        let value = source.value().clamp(lower, upper);

        self.constraints.declare_equal(key_a, key_b);
        for member in members {
            let p = self.parameter_mut(member);
            p.set_bounds(lower, upper, String::new)?;
            p.assign(value);
            p.set_locked(locked);
        }
        Ok(())
    }

    /// Detach a parameter from its equality group, returns `false` if it was unconstrained
    pub fn release_constraint(&mut self, id: ModelId, name: &str) -> Result<bool, ModelError> {
        self.ensure_idle("cannot release constraints")?;
        let key = self.key(id, name)?;
        Ok(self.constraints.release(key))
    }

    /// Resolve a qualified path like `"scene:galaxy:psf:n"`
    ///
    /// The first segment names any model of the session, the following ones walk down through
    /// group members and component PSF models.
    pub fn lookup(&self, path: &str) -> Result<ParamKey, ModelError> {
        let parsed: ParameterPath = path.parse()?;
        let Some((first, rest)) = parsed.models().split_first() else {
            return Err(ModelError::InvalidPath {
                path: path.to_owned(),
                reason: "path must start with a model name",
            });
        };
        let root = self.id(first)?;
        self.walk(root, rest, parsed.parameter(), path)
    }

    /// Resolve a path relative to `root`, e.g. `"psf:n"` or just `"n"`
    pub fn lookup_from(&self, root: ModelId, path: &str) -> Result<ParamKey, ModelError> {
        let parsed: ParameterPath = path.parse()?;
        self.walk(root, parsed.models(), parsed.parameter(), path)
    }

    fn walk(
        &self,
        mut current: ModelId,
        models: &[String],
        parameter: &str,
        path: &str,
    ) -> Result<ParamKey, ModelError> {
        for name in models {
            current = self.child(current, name).ok_or_else(|| ModelError::InvalidPath {
                path: path.to_owned(),
                reason: "segment is neither a group member nor a PSF model of the previous one",
            })?;
        }
        self.key(current, parameter)
    }

    fn child(&self, parent: ModelId, name: &str) -> Option<ModelId> {
        match self.model(parent).ok()? {
            ModelNode::Group(g) => g
                .members
                .iter()
                .copied()
                .find(|&m| self.name(m).is_ok_and(|n| n == name)),
            ModelNode::Component(c) => match c.psf {
                Some(PsfSource::Model(psf)) if self.name(psf).is_ok_and(|n| n == name) => {
                    Some(psf)
                }
                _ => None,
            },
        }
    }

    pub fn get(&self, path: &str) -> Result<f64, ModelError> {
        let key = self.lookup(path)?;
        Ok(ParameterStore::parameter(self, key).value())
    }

    pub fn set(&mut self, path: &str, value: f64) -> Result<f64, ModelError> {
        self.ensure_idle("cannot set parameters")?;
        let key = self.lookup(path)?;
        self.set_key(key, value)
    }

    /// Components of the tree rooted at `root` in member order, then the PSF models they use
    pub fn tree_components(&self, root: ModelId) -> Result<Vec<ModelId>, ModelError> {
        let mut components = vec![];
        self.collect_components(root, &mut components)?;
        let mut psf_models = vec![];
        for &id in &components {
            if let Some(PsfSource::Model(psf)) = self.component(id)?.psf {
                if !psf_models.contains(&psf) && !components.contains(&psf) {
                    psf_models.push(psf);
                }
            }
        }
        components.extend(psf_models);
        Ok(components)
    }

    fn collect_components(&self, id: ModelId, out: &mut Vec<ModelId>) -> Result<(), ModelError> {
        match self.model(id)? {
            ModelNode::Component(_) => out.push(id),
            ModelNode::Group(g) => {
                for &member in &g.members {
                    self.collect_components(member, out)?;
                }
            }
        }
        Ok(())
    }

    /// Every parameter of the tree in traversal order
    pub fn tree_keys(&self, root: ModelId) -> Result<Vec<ParamKey>, ModelError> {
        Ok(self
            .tree_components(root)?
            .into_iter()
            .filter_map(|id| self.component(id).ok().map(|c| (id, c.parameters.len())))
            .flat_map(|(id, len)| (0..len).map(move |index| ParamKey::new(id, index)))
            .collect())
    }

    /// Deduplicated free parameters of the tree rooted at `root`
    pub fn free_vector(&self, root: ModelId) -> Result<FreeVector, ModelError> {
        let keys = self.tree_keys(root)?;
        Ok(self.constraints.resolve_free_vector(&keys, self))
    }

    /// Fail if some member of `free` belongs to a removed model
    pub fn check_free_vector(&self, free: &FreeVector) -> Result<(), ModelError> {
        for i in 0..free.len() {
            for &key in free.members(i) {
                self.parameter_by_key(key)?;
            }
        }
        Ok(())
    }

    /// Current value of every slot of `free`
    pub fn gather(&self, free: &FreeVector) -> Result<Vec<f64>, ModelError> {
        self.check_free_vector(free)?;
        Ok(free.gather(self))
    }

    /// Write one value per slot to every member of the slot, projected onto the shared bounds
    pub fn scatter(&mut self, free: &FreeVector, values: &[f64]) -> Result<(), ModelError> {
        self.ensure_idle("cannot set parameters")?;
        self.check_free_vector(free)?;
        if values.len() != free.len() {
            return Err(ModelError::LengthMismatch {
                expected: free.len(),
                actual: values.len(),
            });
        }
        free.scatter(values, self);
        Ok(())
    }

    /// Derive starting values of the tree from the target image
    ///
    /// Locked parameters and parameters set by the user are kept, as well as parameters tied
    /// to an explicitly set one. Afterwards every equality group takes the value of its first
    /// member in traversal order.
    pub fn initialize(&mut self, root: ModelId) -> Result<(), ModelError> {
        self.ensure_idle("cannot initialize models")?;
        self.guess_tree(root, true)
    }

    /// Guess only components that were never initialized, fitted values are kept
    pub(crate) fn initialize_pending(&mut self, root: ModelId) -> Result<(), ModelError> {
        self.ensure_idle("cannot initialize models")?;
        self.guess_tree(root, false)
    }

    fn guess_tree(&mut self, root: ModelId, force: bool) -> Result<(), ModelError> {
        let components = self.tree_components(root)?;
        let mut settled = BTreeSet::new();
        if !force {
            for &id in &components {
                if self.component(id)?.initialized {
                    settled.insert(id);
                }
            }
        }
        for &id in &components {
            let component = self.component(id)?;
            if component.is_psf_model() || settled.contains(&id) {
                continue;
            }
            let stats = WindowStats::from_image(&self.target, &component.window);
            let mut values = component.parameters.values();
            let fixed: Vec<bool> = (0..values.len())
                .map(|index| {
                    self.constraints
                        .members(ParamKey::new(id, index))
                        .into_iter()
                        .any(|key| {
                            let p = ParameterStore::parameter(self, key);
                            p.is_locked() || p.is_explicit() || settled.contains(&key.model)
                        })
                })
                .collect();
            component
                .profile
                .initial_guess(&stats, &mut values, &fixed);
            log::debug!("initial guess of {}: {:?}", component.name, values);
            let component = self.component_mut(id)?;
            for (index, value) in values.into_iter().enumerate() {
                if !fixed[index] {
                    component.parameters.by_index_mut(index).guess(value);
                }
            }
            component.initialized = true;
        }
        let keys = self.tree_keys(root)?;
        let groups: Vec<_> = self.constraints.groups().map(<[_]>::to_vec).collect();
        for group in groups {
            let Some(&first) = keys
                .iter()
                .find(|&key| group.contains(key) && settled.contains(&key.model))
                .or_else(|| keys.iter().find(|&key| group.contains(key)))
            else {
                continue;
            };
            let value = ParameterStore::parameter(self, first).value();
            for key in group {
                self.parameter_mut(key).assign(value);
            }
        }
        Ok(())
    }

    /// Normalized kernel of a PSF model at its current parameters
    pub fn psf_kernel(&self, id: ModelId) -> Result<PsfKernel, ModelError> {
        let component = self.component(id)?;
        let ComponentRole::Psf { size } = component.role else {
            return Err(ModelError::InvalidUsage {
                model: component.name.clone(),
                reason: "not a PSF model",
            });
        };
        Ok(PsfKernel::from_profile(
            &component.profile,
            &component.parameters.values(),
            size,
            self.target.pixel_scale(),
            component.oversample,
        )?)
    }

    /// Image of a component over its window, blurred by its PSF if it has one
    pub fn render_window(&self, id: ModelId) -> Result<Array2<f64>, ModelError> {
        let component = self.component(id)?;
        if component.is_psf_model() {
            return self.psf_kernel(id).map(PsfKernel::into_inner);
        }
        let params = component.parameters.values();
        let scale = self.target.pixel_scale();
        let window = component.window;
        let origin = (window.row as isize, window.col as isize);
        let kernel: Option<Cow<PsfKernel>> = match &component.psf {
            None => None,
            Some(PsfSource::Kernel(kernel)) => Some(Cow::Borrowed(kernel)),
            Some(PsfSource::Target) => Some(Cow::Borrowed(self.target.psf().ok_or_else(
                || ModelError::InvalidUsage {
                    model: component.name.clone(),
                    reason: "the target image has no PSF kernel",
                },
            )?)),
            Some(PsfSource::Model(psf)) => Some(Cow::Owned(self.psf_kernel(*psf)?)),
        };
        let Some(kernel) = kernel else {
            return Ok(component.profile.render(
                &params,
                origin,
                window.shape(),
                scale,
                component.oversample,
            ));
        };
        let (half_rows, half_cols) = kernel.half_size();
        let padded = component.profile.render(
            &params,
            (origin.0 - half_rows as isize, origin.1 - half_cols as isize),
            (window.rows + 2 * half_rows, window.cols + 2 * half_cols),
            scale,
            component.oversample,
        );
        Ok(convolve_valid(&padded.view(), &kernel))
    }

    /// Full-frame image of a model
    ///
    /// PSF models are returned as their normalized `size × size` kernel.
    pub fn render_model(&self, id: ModelId) -> Result<Array2<f64>, ModelError> {
        if let ModelNode::Component(c) = self.model(id)? {
            if c.is_psf_model() {
                return self.render_window(id);
            }
        }
        let mut image = Array2::zeros(self.target.shape());
        self.render_into(id, &mut image)?;
        Ok(image)
    }

    fn render_into(&self, id: ModelId, image: &mut Array2<f64>) -> Result<(), ModelError> {
        match self.model(id)? {
            ModelNode::Component(c) => {
                if !c.is_psf_model() {
                    let window_image = self.render_window(id)?;
                    let mut view = c.window.view_mut(image);
                    view += &window_image;
                }
            }
            ModelNode::Group(g) => {
                for &member in &g.members {
                    self.render_into(member, image)?;
                }
            }
        }
        Ok(())
    }

    /// Sum of squared weighted residuals of the model against the target
    pub fn chi2(&self, id: ModelId) -> Result<f64, ModelError> {
        let model = self.render_model(id)?;
        Ok(self.target.chi2(&model.view()))
    }
}

impl ParameterStore for Session {
    fn parameter(&self, key: ParamKey) -> &Parameter {
        match &self.nodes[key.model.0] {
            Some(ModelNode::Component(c)) => c.parameters.by_index(key.index),
            _ => panic!("parameter key {:?} points to a missing component", key),
        }
    }

    fn parameter_mut(&mut self, key: ParamKey) -> &mut Parameter {
        match &mut self.nodes[key.model.0] {
            Some(ModelNode::Component(c)) => c.parameters.by_index_mut(key.index),
            _ => panic!("parameter key {:?} points to a missing component", key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::*;

    use approx::assert_relative_eq;

    fn session() -> Session {
        Session::new(ImageBuffer::zeros((32, 32), 1.0, 0.5).unwrap())
    }

    const NO_PARAMETERS: [(&str, f64); 0] = [];

    #[test]
    fn duplicate_and_invalid_names() {
        let mut s = session();
        s.create_model("sky", Profile::flat_sky(), NO_PARAMETERS, Default::default())
            .unwrap();
        assert_eq!(
            s.create_model("sky", Profile::flat_sky(), NO_PARAMETERS, Default::default()),
            Err(ModelError::DuplicateName("sky".to_owned()))
        );
        assert!(matches!(
            s.create_model("a:b", Profile::flat_sky(), NO_PARAMETERS, Default::default()),
            Err(ModelError::InvalidPath { .. })
        ));
    }

    #[test]
    fn window_must_fit() {
        let mut s = session();
        let options = ComponentOptions::default().window(Window::new(20, 20, 16, 4).unwrap());
        assert!(matches!(
            s.create_model("g", Profile::gaussian(), NO_PARAMETERS, options),
            Err(ModelError::Image(ImageError::WindowOutOfBounds { .. }))
        ));
    }

    #[test]
    fn unknown_parameter_name() {
        let mut s = session();
        assert_eq!(
            s.create_model("g", Profile::gaussian(), [("re", 1.0)], Default::default()),
            Err(ModelError::UnknownParameter {
                model: "g".to_owned(),
                parameter: "re".to_owned(),
            })
        );
    }

    #[test]
    fn parameter_round_trip_and_policies() {
        let mut s = session();
        let reject = s
            .create_model("a", Profile::sersic(), NO_PARAMETERS, Default::default())
            .unwrap();
        let clamp = s
            .create_model(
                "b",
                Profile::sersic(),
                NO_PARAMETERS,
                ComponentOptions::default().bounds_policy(BoundsPolicy::Clamp),
            )
            .unwrap();
        for &value in &[0.36, 1.234567890123, 8.0] {
            s.set_parameter(reject, "n", value).unwrap();
            assert_eq!(s.get_parameter(reject, "n").unwrap(), value);
        }
        assert!(matches!(
            s.set_parameter(reject, "n", 9.0),
            Err(ModelError::OutOfBounds { .. })
        ));
        assert_eq!(s.get_parameter(reject, "n").unwrap(), 8.0);
        assert_eq!(s.set_parameter(clamp, "n", 9.0).unwrap(), 8.0);
        assert_eq!(s.set_parameter(clamp, "n", 0.1).unwrap(), 0.36);
    }

    #[test]
    fn declare_equal_checks_domains_and_bounds() {
        let mut s = session();
        let a = s
            .create_model("a", Profile::sersic(), [("n", 3.0)], Default::default())
            .unwrap();
        let b = s
            .create_model("b", Profile::moffat(), NO_PARAMETERS, Default::default())
            .unwrap();
        assert!(matches!(
            s.declare_equal(a, "q", b, "x"),
            Err(ModelError::TypeMismatch { .. })
        ));
        s.set_bounds(a, "re", 0.1, 5.0).unwrap();
        s.set_bounds(b, "rd", 10.0, 20.0).unwrap();
        assert!(matches!(
            s.declare_equal(a, "re", b, "rd"),
            Err(ModelError::TypeMismatch {
                reason: "parameter bounds do not overlap",
                ..
            })
        ));

        s.declare_equal(a, "n", b, "n").unwrap();
        assert_eq!(s.get_parameter(b, "n").unwrap(), 3.0);
        assert_eq!(s.parameter(b, "n").unwrap().bounds(), (0.36, 8.0));
        s.set_parameter(b, "n", 1.5).unwrap();
        assert_eq!(s.get_parameter(a, "n").unwrap(), 1.5);
        assert!(s.release_constraint(a, "n").unwrap());
        s.set_parameter(b, "n", 2.5).unwrap();
        assert_eq!(s.get_parameter(a, "n").unwrap(), 1.5);
    }

    #[test]
    fn qualified_lookup() {
        let mut s = session();
        let psf = s
            .create_psf_model("psf", Profile::moffat(), 7, [("n", 2.5)])
            .unwrap();
        let galaxy = s
            .create_model(
                "galaxy",
                Profile::sersic(),
                NO_PARAMETERS,
                ComponentOptions::default().psf(psf),
            )
            .unwrap();
        let sky = s
            .create_model("sky", Profile::flat_sky(), NO_PARAMETERS, Default::default())
            .unwrap();
        let scene = s.create_group_model("scene", &[galaxy, sky]).unwrap();

        assert_eq!(s.get("scene:galaxy:psf:n").unwrap(), 2.5);
        assert_eq!(s.lookup("psf:n").unwrap(), s.key(psf, "n").unwrap());
        assert_eq!(
            s.lookup_from(galaxy, "psf:n").unwrap(),
            s.key(psf, "n").unwrap()
        );
        assert_eq!(s.lookup_from(scene, "sky:sky").unwrap(), s.key(sky, "sky").unwrap());
        s.set("scene:galaxy:n", 4.0).unwrap();
        assert_eq!(s.get_parameter(galaxy, "n").unwrap(), 4.0);

        assert!(matches!(
            s.lookup("scene:psf:n"),
            Err(ModelError::InvalidPath { .. })
        ));
        assert!(matches!(
            s.lookup("scene:galaxy:psf:nn"),
            Err(ModelError::UnknownParameter { .. })
        ));
        assert!(matches!(s.lookup("n"), Err(ModelError::InvalidPath { .. })));
    }

    #[test]
    fn psf_model_is_centered_and_normalized() {
        let mut s = session();
        let psf = s
            .create_psf_model("psf", Profile::moffat(), 9, [("rd", 1.0)])
            .unwrap();
        assert_eq!(s.get_parameter(psf, "x").unwrap(), 2.25);
        assert!(s.parameter(psf, "i0").unwrap().is_locked());
        assert!(!s.parameter(psf, "n").unwrap().is_locked());
        let kernel = s.render_model(psf).unwrap();
        assert_eq!(kernel.dim(), (9, 9));
        assert_relative_eq!(kernel.sum(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(kernel[[4, 3]], kernel[[4, 5]], epsilon = 1e-12);
        assert!(matches!(
            s.create_psf_model("even", Profile::moffat(), 8, NO_PARAMETERS),
            Err(ModelError::Image(ImageError::InvalidKernel(_)))
        ));
    }

    #[test]
    fn group_is_sum_of_members() {
        let mut s = session();
        let a = s
            .create_model(
                "a",
                Profile::gaussian(),
                [("x", 4.0), ("y", 4.0), ("sigma", 1.0), ("flux", 10.0)],
                Default::default(),
            )
            .unwrap();
        let b = s
            .create_model(
                "b",
                Profile::gaussian(),
                [("x", 10.0), ("y", 8.0), ("sigma", 1.5), ("flux", 20.0)],
                ComponentOptions::default().window(Window::new(8, 12, 20, 16).unwrap()),
            )
            .unwrap();
        let group = s.create_group_model("ab", &[a, b]).unwrap();
        let sum = s.render_model(a).unwrap() + s.render_model(b).unwrap();
        assert_eq!(s.render_model(group).unwrap(), sum);
        assert_eq!(s.render_window(b).unwrap().dim(), (20, 16));
    }

    #[test]
    fn delta_psf_does_not_change_the_image() {
        let mut s = session();
        let params = [("x", 8.0), ("y", 7.0), ("re", 2.0), ("ie", 1.0)];
        let plain = s
            .create_model("plain", Profile::sersic(), params, Default::default())
            .unwrap();
        let delta = PsfKernel::new(delta_kernel(5)).unwrap();
        let blurred = s
            .create_model(
                "blurred",
                Profile::sersic(),
                params,
                ComponentOptions::default().psf(delta),
            )
            .unwrap();
        ndarray::Zip::from(&s.render_model(plain).unwrap())
            .and(&s.render_model(blurred).unwrap())
            .for_each(|&a, &b| assert_relative_eq!(a, b, max_relative = 1e-12));
    }

    #[test]
    fn target_psf_must_exist() {
        let mut s = session();
        assert!(matches!(
            s.create_model(
                "g",
                Profile::gaussian(),
                NO_PARAMETERS,
                ComponentOptions::default().psf(PsfSource::Target),
            ),
            Err(ModelError::InvalidUsage { .. })
        ));
    }

    #[test]
    fn group_membership_rules() {
        let mut s = session();
        let a = s
            .create_model("a", Profile::gaussian(), NO_PARAMETERS, Default::default())
            .unwrap();
        let psf = s
            .create_psf_model("psf", Profile::gaussian(), 5, NO_PARAMETERS)
            .unwrap();
        let outer = s.create_group_model("outer", &[a]).unwrap();
        let inner = s.create_group_model("inner", &[]).unwrap();
        assert!(matches!(
            s.add_member(inner, a),
            Err(ModelError::AlreadyGrouped { .. })
        ));
        assert!(matches!(
            s.add_member(inner, psf),
            Err(ModelError::InvalidUsage { .. })
        ));
        s.add_member(outer, inner).unwrap();
        assert!(matches!(
            s.add_member(inner, outer),
            Err(ModelError::InvalidUsage { .. })
        ));
        s.remove_member(outer, a).unwrap();
        s.add_member(inner, a).unwrap();
        assert_eq!(s.tree_components(outer).unwrap(), vec![a]);
    }

    #[test]
    fn remove_model_cleans_up() {
        let mut s = session();
        let psf = s
            .create_psf_model("psf", Profile::moffat(), 5, NO_PARAMETERS)
            .unwrap();
        let a = s
            .create_model(
                "a",
                Profile::moffat(),
                NO_PARAMETERS,
                ComponentOptions::default().psf(psf),
            )
            .unwrap();
        let b = s
            .create_model("b", Profile::moffat(), NO_PARAMETERS, Default::default())
            .unwrap();
        let group = s.create_group_model("g", &[a, b]).unwrap();
        s.declare_equal(a, "n", b, "n").unwrap();

        assert!(matches!(
            s.remove_model(psf),
            Err(ModelError::InvalidUsage { .. })
        ));
        s.remove_model(a).unwrap();
        assert!(s.constraints().is_empty());
        assert_eq!(s.group(group).unwrap().members(), &[b]);
        assert!(matches!(s.id("a"), Err(ModelError::UnknownModel(_))));
        s.remove_model(psf).unwrap();
        s.remove_model(group).unwrap();
        assert_eq!(s.model(b).unwrap().group(), None);
        assert_eq!(s.models().count(), 1);
    }

    #[test]
    fn initialize_keeps_explicit_and_locked_values() {
        let mut s = Session::new(gaussian_blob_image((40, 40), (20.0, 16.0), 2.0, 1000.0, 0.1));
        let g = s
            .create_model(
                "g",
                Profile::gaussian(),
                [("q", ParameterInit::fixed(1.0))],
                Default::default(),
            )
            .unwrap();
        let sky = s
            .create_model("sky", Profile::flat_sky(), [("sky", 0.5)], Default::default())
            .unwrap();
        let scene = s.create_group_model("scene", &[g, sky]).unwrap();
        s.initialize(scene).unwrap();
        assert_relative_eq!(s.get_parameter(g, "x").unwrap(), 20.0, epsilon = 0.05);
        assert_relative_eq!(s.get_parameter(g, "y").unwrap(), 16.0, epsilon = 0.05);
        assert_relative_eq!(s.get_parameter(g, "sigma").unwrap(), 2.0, max_relative = 0.1);
        assert_eq!(s.get_parameter(g, "q").unwrap(), 1.0);
        assert_eq!(s.get_parameter(sky, "sky").unwrap(), 0.5);
    }

    #[test]
    fn target_replacement_keeps_windows_valid() {
        let mut s = Session::new(ImageBuffer::zeros((20, 20), 1.0, 1.0).unwrap());
        let g = s
            .create_model(
                "g",
                Profile::gaussian(),
                [("x", 10.0), ("y", 10.0), ("sigma", 2.0), ("flux", 5.0)],
                Default::default(),
            )
            .unwrap();
        let smaller = ImageBuffer::zeros((10, 10), 1.0, 1.0).unwrap();
        assert!(matches!(
            s.set_target(smaller),
            Err(ModelError::Image(ImageError::WindowOutOfBounds { .. }))
        ));
        assert!(s.set_target_data(Array2::zeros((10, 10))).is_err());
        assert_eq!(s.target().shape(), (20, 20));
        assert_eq!(s.render_model(g).unwrap().dim(), (20, 20));

        let corner = s
            .create_model(
                "corner",
                Profile::gaussian(),
                NO_PARAMETERS,
                ComponentOptions::default().window(Window::new(0, 0, 8, 8).unwrap()),
            )
            .unwrap();
        s.remove_model(g).unwrap();
        s.set_target(ImageBuffer::zeros((10, 10), 1.0, 1.0).unwrap())
            .unwrap();
        assert_eq!(s.render_model(corner).unwrap().dim(), (10, 10));
    }

    #[test]
    fn target_psf_is_required_by_blurred_components() {
        let target = ImageBuffer::zeros((16, 16), 1.0, 1.0)
            .unwrap()
            .with_psf(PsfKernel::new(delta_kernel(3)).unwrap());
        let mut s = Session::new(target);
        s.create_model(
            "g",
            Profile::gaussian(),
            NO_PARAMETERS,
            ComponentOptions::default().psf(PsfSource::Target),
        )
        .unwrap();
        assert!(matches!(
            s.set_target(ImageBuffer::zeros((16, 16), 1.0, 1.0).unwrap()),
            Err(ModelError::InvalidUsage { .. })
        ));
        assert!(s.target().psf().is_some());
    }

    #[test]
    fn degenerate_shapes_are_out_of_reach() {
        let mut s = session();
        let g = s
            .create_model(
                "g",
                Profile::sersic(),
                [("x", 16.0), ("y", 16.0), ("re", 3.0), ("ie", 1.0)],
                Default::default(),
            )
            .unwrap();
        s.set_bounds(g, "q", 0.0, 1.0).unwrap();
        assert!(s.parameter(g, "q").unwrap().bounds().0 > 0.0);
        assert!(matches!(
            s.set_parameter(g, "q", 0.0),
            Err(ModelError::OutOfBounds { .. })
        ));
        s.set_bounds(g, "re", 0.0, 10.0).unwrap();
        assert!(matches!(
            s.set_parameter(g, "re", 0.0),
            Err(ModelError::OutOfBounds { .. })
        ));
        assert!(matches!(
            s.set_bounds(g, "n", 0.0, 0.2),
            Err(ModelError::InvalidBounds { .. })
        ));
        let lowest_q = s.parameter(g, "q").unwrap().bounds().0;
        s.set_parameter(g, "q", lowest_q).unwrap();
        assert!(s.render_model(g).unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn stale_free_vector_is_rejected() {
        let mut s = session();
        let a = s
            .create_model("a", Profile::gaussian(), NO_PARAMETERS, Default::default())
            .unwrap();
        let free = s.free_vector(a).unwrap();
        let values = s.gather(&free).unwrap();
        assert!(matches!(
            s.scatter(&free, &values[1..]),
            Err(ModelError::LengthMismatch { .. })
        ));
        s.scatter(&free, &values).unwrap();
        s.remove_model(a).unwrap();
        assert!(matches!(s.gather(&free), Err(ModelError::UnknownModel(_))));
        assert!(matches!(
            s.scatter(&free, &values),
            Err(ModelError::UnknownModel(_))
        ));
    }

    #[test]
    fn mutations_fail_while_fit_is_active() {
        let mut s = session();
        let a = s
            .create_model("a", Profile::gaussian(), NO_PARAMETERS, Default::default())
            .unwrap();
        s.set_fit_active(true);
        assert!(matches!(
            s.set_parameter(a, "x", 1.0),
            Err(ModelError::InvalidState(_))
        ));
        assert!(matches!(
            s.create_group_model("g", &[a]),
            Err(ModelError::InvalidState(_))
        ));
        assert!(matches!(s.remove_model(a), Err(ModelError::InvalidState(_))));
        assert!(matches!(
            s.set_target_data(Array2::zeros((32, 32))),
            Err(ModelError::InvalidState(_))
        ));
        assert_eq!(s.get_parameter(a, "x").unwrap(), 0.0);
    }
}
