//! Equality constraints between parameters
//!
//! Constrained parameters form disjoint groups: declaring `a = b` merges the groups of `a` and
//! `b`, so equality is transitive. Every member of a group keeps its own [Parameter] storage and
//! the graph only records the partition. The optimizer sees one free slot per group, the slot
//! value is written back to every member, which keeps the members equal at all times.

use crate::model::ModelId;
use crate::parameter::Parameter;

use std::collections::{BTreeMap, BTreeSet};

/// Address of a single parameter inside a [crate::Session]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParamKey {
    pub model: ModelId,
    /// Position in the model's [crate::ParameterTable]
    pub index: usize,
}

impl ParamKey {
    pub fn new(model: ModelId, index: usize) -> Self {
        Self { model, index }
    }
}

/// Read and write access to parameter storage by key
pub(crate) trait ParameterStore {
    fn parameter(&self, key: ParamKey) -> &Parameter;

    fn parameter_mut(&mut self, key: ParamKey) -> &mut Parameter;
}

/// Partition of constrained parameters into equality groups
///
/// Unconstrained parameters are not stored, they are implicit singleton groups.
#[derive(Clone, Debug, Default)]
pub struct ConstraintGraph {
    groups: BTreeMap<usize, Vec<ParamKey>>,
    membership: BTreeMap<ParamKey, usize>,
    next_group: usize,
}

impl ConstraintGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of non-trivial groups
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn is_constrained(&self, key: ParamKey) -> bool {
        self.membership.contains_key(&key)
    }

    pub fn are_equal(&self, a: ParamKey, b: ParamKey) -> bool {
        a == b
            || matches!(
                (self.membership.get(&a), self.membership.get(&b)),
                (Some(x), Some(y)) if x == y
            )
    }

    /// All parameters tied to `key` including itself, in the order they joined the group
    pub fn members(&self, key: ParamKey) -> Vec<ParamKey> {
        match self.membership.get(&key) {
            Some(group) => self.groups[group].clone(),
            None => vec![key],
        }
    }

    /// Iterate over all non-trivial groups
    pub fn groups(&self) -> impl Iterator<Item = &[ParamKey]> {
        self.groups.values().map(Vec::as_slice)
    }

    /// Merge the groups of `a` and `b`, returns `false` if they are already equal
    ///
    /// The smaller group is moved into the larger one. Member order of the larger group is
    /// preserved and the moved members are appended.
    pub fn declare_equal(&mut self, a: ParamKey, b: ParamKey) -> bool {
        if self.are_equal(a, b) {
            return false;
        }
        let ga = self.group_or_insert(a);
        let gb = self.group_or_insert(b);
        let (keep, moved) = if self.groups[&ga].len() >= self.groups[&gb].len() {
            (ga, gb)
        } else {
            (gb, ga)
        };
        let moved_members = self.groups.remove(&moved).unwrap_or_default();
        for &key in &moved_members {
            self.membership.insert(key, keep);
        }
        if let Some(members) = self.groups.get_mut(&keep) {
            members.extend(moved_members);
        }
        true
    }

    fn group_or_insert(&mut self, key: ParamKey) -> usize {
        if let Some(&group) = self.membership.get(&key) {
            return group;
        }
        let group = self.next_group;
        self.next_group += 1;
        self.groups.insert(group, vec![key]);
        self.membership.insert(key, group);
        group
    }

    /// Detach `key` from its group, returns `false` if it wasn't constrained
    ///
    /// The remaining members stay equal to each other.
    pub fn release(&mut self, key: ParamKey) -> bool {
        let Some(group) = self.membership.remove(&key) else {
            return false;
        };
        let Some(members) = self.groups.get_mut(&group) else {
            return true;
        };
        members.retain(|&k| k != key);
        if members.len() < 2 {
            for k in members.drain(..) {
                self.membership.remove(&k);
            }
            self.groups.remove(&group);
        }
        true
    }

    /// Release every parameter of `model`
    pub fn release_model(&mut self, model: ModelId) {
        let keys: Vec<_> = self
            .membership
            .keys()
            .filter(|key| key.model == model)
            .copied()
            .collect();
        for key in keys {
            self.release(key);
        }
    }

    /// Collapse `keys` into free slots
    ///
    /// `keys` is the traversal order of a model tree. Each slot is represented by the first of
    /// its members met in that order. Slots whose representative is locked are skipped, locking
    /// is shared by all members of a group. Members outside of `keys` still belong to the slot
    /// and receive its value on [FreeVector::scatter].
    pub(crate) fn resolve_free_vector(
        &self,
        keys: &[ParamKey],
        store: &impl ParameterStore,
    ) -> FreeVector {
        let mut seen = BTreeSet::new();
        let mut slots = vec![];
        for &key in keys {
            if let Some(&group) = self.membership.get(&key) {
                if !seen.insert(group) {
                    continue;
                }
            }
            let members = self.members(key);
            if members
                .iter()
                .any(|&member| store.parameter(member).is_locked())
            {
                continue;
            }
            let mut ordered = Vec::with_capacity(members.len());
            ordered.push(key);
            ordered.extend(members.into_iter().filter(|&member| member != key));
            slots.push(ordered);
        }
        FreeVector { slots }
    }
}

/// Ordered, deduplicated list of free parameters of a fit
#[derive(Clone, Debug, PartialEq)]
pub struct FreeVector {
    slots: Vec<Vec<ParamKey>>,
}

impl FreeVector {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Representative of every slot
    pub fn keys(&self) -> impl Iterator<Item = ParamKey> + '_ {
        self.slots.iter().map(|slot| slot[0])
    }

    /// All members sharing slot `i`, the representative first
    pub fn members(&self, i: usize) -> &[ParamKey] {
        &self.slots[i]
    }

    pub(crate) fn gather(&self, store: &impl ParameterStore) -> Vec<f64> {
        self.keys().map(|key| store.parameter(key).value()).collect()
    }

    /// Bounds of every slot, constrained members share them
    pub(crate) fn bounds(&self, store: &impl ParameterStore) -> Vec<(f64, f64)> {
        self.keys().map(|key| store.parameter(key).bounds()).collect()
    }

    /// Write `values` to every member of every slot, projecting them onto the bounds
    pub(crate) fn scatter(&self, values: &[f64], store: &mut impl ParameterStore) {
        assert_eq!(values.len(), self.slots.len(), "free vector length mismatch");
        for (slot, &value) in self.slots.iter().zip(values) {
            for &key in slot {
                store.parameter_mut(key).assign(value);
            }
        }
    }
}
