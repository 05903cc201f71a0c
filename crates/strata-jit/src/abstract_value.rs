//! Proven facts about one value.

use std::fmt;

use strata_ir::{FrozenValue, SpeculatedType, StructureId, StructureRegistry, StructureSet};

/// Structures a cell value may have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructureAbstractValue {
    /// Any structure.
    Top,
    /// One of these structures.
    Known(StructureSet),
}

impl StructureAbstractValue {
    /// Exactly one structure.
    pub fn singleton(id: StructureId) -> Self {
        Self::Known(StructureSet::singleton(id))
    }

    /// Any structure is possible.
    pub fn is_top(&self) -> bool {
        matches!(self, Self::Top)
    }

    /// Every possible structure is in `set`.
    pub fn is_subset_of(&self, set: &StructureSet) -> bool {
        match self {
            Self::Top => false,
            Self::Known(known) => known.is_subset_of(set),
        }
    }

    /// The only possible structure.
    pub fn only(&self) -> Option<StructureId> {
        match self {
            Self::Top => None,
            Self::Known(known) => known.only(),
        }
    }

    /// Union, widening past `limit` structures. Returns whether it changed.
    pub fn merge(&mut self, other: &Self, limit: usize) -> bool {
        match (&mut *self, other) {
            (Self::Top, _) => false,
            (_, Self::Top) => {
                *self = Self::Top;
                true
            }
            (Self::Known(mine), Self::Known(theirs)) => {
                let changed = mine.merge(theirs);
                if mine.len() > limit {
                    *self = Self::Top;
                    return true;
                }
                changed
            }
        }
    }

    /// Intersect with `set`.
    pub fn filter(&mut self, set: &StructureSet) {
        match self {
            Self::Top => *self = Self::Known(set.clone()),
            Self::Known(known) => {
                known.filter(set);
            }
        }
    }

    /// No structure is possible.
    pub fn is_clear(&self) -> bool {
        matches!(self, Self::Known(known) if known.is_empty())
    }
}

/// Type, structures and constant value a node is proven to have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbstractValue {
    /// Possible types.
    pub ty: SpeculatedType,
    /// Possible structures of the cell part of `ty`.
    pub structures: StructureAbstractValue,
    /// Known value.
    pub value: Option<FrozenValue>,
}

impl Default for AbstractValue {
    fn default() -> Self {
        Self::bottom()
    }
}

impl AbstractValue {
    /// No value at all: the producer has not executed on any path seen so far.
    pub fn bottom() -> Self {
        Self {
            ty: SpeculatedType::NONE,
            structures: StructureAbstractValue::Known(StructureSet::new()),
            value: None,
        }
    }

    /// Any value.
    pub fn top() -> Self {
        Self::from_type(SpeculatedType::FULL_TOP)
    }

    /// Any value of type `ty`.
    pub fn from_type(ty: SpeculatedType) -> Self {
        Self {
            ty,
            structures: StructureAbstractValue::Top,
            value: None,
        }
    }

    /// Cell of type `ty` with a known structure.
    pub fn with_structure(ty: SpeculatedType, structure: StructureId) -> Self {
        Self {
            ty,
            structures: StructureAbstractValue::singleton(structure),
            value: None,
        }
    }

    /// A known constant.
    pub fn constant(value: FrozenValue, registry: &StructureRegistry) -> Self {
        let ty = value.speculated_type(registry);
        let structures = match &value {
            FrozenValue::Cell(cell) => StructureAbstractValue::singleton(cell.structure),
            _ => StructureAbstractValue::Top,
        };
        Self {
            ty,
            structures,
            value: Some(value),
        }
    }

    /// Nothing can reach here.
    pub fn is_bottom(&self) -> bool {
        self.ty.is_empty()
    }

    /// Proven to be of a type in `mask`.
    pub fn is_type(&self, mask: SpeculatedType) -> bool {
        self.ty.is_subset_of(mask)
    }

    /// Proven not to be of any type in `mask`.
    pub fn is_not_type(&self, mask: SpeculatedType) -> bool {
        !self.ty.overlaps(mask)
    }

    /// Known int32 value.
    pub fn as_int32(&self) -> Option<i32> {
        self.value.as_ref().and_then(FrozenValue::as_int32)
    }

    /// Known truthiness.
    pub fn as_truthiness(&self) -> Option<bool> {
        if let Some(truthy) = self.value.as_ref().and_then(FrozenValue::to_boolean) {
            return Some(truthy);
        }
        if self.ty.is_other() {
            return Some(false);
        }
        None
    }

    /// Merge a predecessor's fact. Returns whether `self` changed.
    pub fn merge(&mut self, other: &Self, structure_limit: usize) -> bool {
        if other.is_bottom() {
            return false;
        }
        if self.is_bottom() {
            *self = other.clone();
            return true;
        }
        let mut changed = false;
        let ty = self.ty | other.ty;
        if ty != self.ty {
            self.ty = ty;
            changed = true;
        }
        changed |= self.structures.merge(&other.structures, structure_limit);
        if self.value.is_some() && self.value != other.value {
            self.value = None;
            changed = true;
        }
        changed
    }

    /// Narrow to `mask`. Returns `false` on contradiction.
    pub fn filter(&mut self, mask: SpeculatedType) -> bool {
        self.ty &= mask;
        if let Some(value) = &self.value {
            let compatible = match value {
                FrozenValue::Cell(_) => self.ty.overlaps(SpeculatedType::CELL),
                other => constant_type_without_heap(other).overlaps(mask),
            };
            if !compatible {
                self.value = None;
                self.ty = SpeculatedType::NONE;
            }
        }
        if !self.ty.overlaps(SpeculatedType::CELL) {
            self.structures = StructureAbstractValue::Top;
        }
        !self.is_bottom()
    }

    /// Narrow to cells with a structure in `set`. Returns `false` on
    /// contradiction.
    pub fn filter_structures(&mut self, set: &StructureSet) -> bool {
        self.ty &= SpeculatedType::CELL;
        self.structures.filter(set);
        if self.structures.is_clear() {
            self.ty = SpeculatedType::NONE;
        }
        !self.is_bottom()
    }

    /// Narrow to exactly `value`. Returns `false` on contradiction.
    pub fn filter_value(&mut self, value: &FrozenValue, registry: &StructureRegistry) -> bool {
        if let Some(known) = &self.value {
            if known != value {
                self.ty = SpeculatedType::NONE;
                return false;
            }
        }
        let constant = Self::constant(value.clone(), registry);
        self.ty &= constant.ty;
        if self.is_bottom() {
            return false;
        }
        if let StructureAbstractValue::Known(set) = &constant.structures {
            if !self.filter_structures(set) {
                return false;
            }
        }
        self.value = Some(value.clone());
        true
    }

    /// Forget structures: something may have transitioned the cell.
    pub fn clobber_structures(&mut self) {
        if self.ty.overlaps(SpeculatedType::CELL) {
            self.structures = StructureAbstractValue::Top;
        }
    }
}

fn constant_type_without_heap(value: &FrozenValue) -> SpeculatedType {
    value.speculated_type(&StructureRegistry::new())
}

impl fmt::Display for AbstractValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.ty)?;
        if let StructureAbstractValue::Known(set) = &self.structures {
            if self.ty.overlaps(SpeculatedType::CELL) {
                let ids: Vec<String> = set.iter().map(|id| id.0.to_string()).collect();
                write!(f, ", structures [{}]", ids.join(", "))?;
            }
        }
        if let Some(value) = &self.value {
            write!(f, ", {value:?}")?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_drops_disagreeing_constants() {
        let registry = StructureRegistry::new();
        let mut a = AbstractValue::constant(FrozenValue::Int32(1), &registry);
        let b = AbstractValue::constant(FrozenValue::Int32(2), &registry);
        assert!(a.merge(&b, 8));
        assert_eq!(a.value, None);
        assert!(a.is_type(SpeculatedType::INT32));
    }

    #[test]
    fn merge_with_bottom_copies() {
        let registry = StructureRegistry::new();
        let mut a = AbstractValue::bottom();
        let b = AbstractValue::constant(FrozenValue::Boolean(true), &registry);
        assert!(a.merge(&b, 8));
        assert_eq!(a, b);
        assert!(!a.merge(&AbstractValue::bottom(), 8));
    }

    #[test]
    fn structure_sets_widen_past_limit() {
        let mut a = AbstractValue::with_structure(SpeculatedType::FINAL_OBJECT, StructureId(1));
        let b = AbstractValue::with_structure(SpeculatedType::FINAL_OBJECT, StructureId(2));
        let c = AbstractValue::with_structure(SpeculatedType::FINAL_OBJECT, StructureId(3));
        a.merge(&b, 2);
        assert!(!a.structures.is_top());
        a.merge(&c, 2);
        assert!(a.structures.is_top());
    }

    #[test]
    fn filtering_to_a_disjoint_type_is_a_contradiction() {
        let mut v = AbstractValue::from_type(SpeculatedType::INT32);
        assert!(!v.filter(SpeculatedType::CELL));
        assert!(v.is_bottom());
    }

    #[test]
    fn filtering_a_constant_keeps_it_when_compatible() {
        let registry = StructureRegistry::new();
        let mut v = AbstractValue::constant(FrozenValue::Int32(42), &registry);
        assert!(v.filter(SpeculatedType::BYTECODE_NUMBER));
        assert_eq!(v.as_int32(), Some(42));
    }

    #[test]
    fn structure_filter_narrows_and_detects_contradiction() {
        let mut v = AbstractValue::from_type(SpeculatedType::OBJECT);
        assert!(v.filter_structures(&StructureSet::from_ids([StructureId(1), StructureId(2)])));
        assert!(v.structures.is_subset_of(&StructureSet::from_ids([
            StructureId(1),
            StructureId(2)
        ])));
        assert!(!v.filter_structures(&StructureSet::singleton(StructureId(3))));
    }

    #[test]
    fn clobbering_forgets_structures() {
        let mut v = AbstractValue::with_structure(SpeculatedType::FINAL_OBJECT, StructureId(4));
        v.clobber_structures();
        assert!(v.structures.is_top());
    }
}
