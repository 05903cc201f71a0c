//! Structures (shapes) as seen by the compiler.
//!
//! The graph carries a frozen snapshot of every structure it mentions. The
//! lowering embeds structure ids directly into emitted code, which is why the
//! scheduler must not let a collector run while a lowering pass is active.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::operand::IdentifierIndex;

/// Small integer id of a structure in the shape registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct StructureId(pub u32);

impl StructureId {
    /// Create a structure id.
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id value.
    #[inline]
    pub const fn index(self) -> u32 {
        self.0
    }
}

/// Property offsets below this live inline in the cell; the rest live in the
/// out-of-line part of the butterfly.
pub const FIRST_OUT_OF_LINE_OFFSET: u32 = 100;

/// Element kind of a typed array view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypedArrayType {
    /// Signed 8-bit.
    Int8,
    /// Signed 16-bit.
    Int16,
    /// Signed 32-bit.
    Int32,
    /// Unsigned 8-bit.
    Uint8,
    /// Unsigned 8-bit, clamped on store.
    Uint8Clamped,
    /// Unsigned 16-bit.
    Uint16,
    /// Unsigned 32-bit.
    Uint32,
    /// 32-bit float.
    Float32,
    /// 64-bit float.
    Float64,
}

impl TypedArrayType {
    /// Size of one element in bytes.
    pub const fn element_size(self) -> u32 {
        match self {
            Self::Int8 | Self::Uint8 | Self::Uint8Clamped => 1,
            Self::Int16 | Self::Uint16 => 2,
            Self::Int32 | Self::Uint32 | Self::Float32 => 4,
            Self::Float64 => 8,
        }
    }

    /// Element is a float.
    pub const fn is_float(self) -> bool {
        matches!(self, Self::Float32 | Self::Float64)
    }

    /// Element is a signed integer.
    pub const fn is_signed(self) -> bool {
        matches!(self, Self::Int8 | Self::Int16 | Self::Int32)
    }

    const fn tag_index(self) -> u8 {
        match self {
            Self::Int8 => 0,
            Self::Int16 => 1,
            Self::Int32 => 2,
            Self::Uint8 => 3,
            Self::Uint8Clamped => 4,
            Self::Uint16 => 5,
            Self::Uint32 => 6,
            Self::Float32 => 7,
            Self::Float64 => 8,
        }
    }

    const ALL: [Self; 9] = [
        Self::Int8,
        Self::Int16,
        Self::Int32,
        Self::Uint8,
        Self::Uint8Clamped,
        Self::Uint16,
        Self::Uint32,
        Self::Float32,
        Self::Float64,
    ];
}

/// Kind of heap cell, stored as the type-tag byte of the cell header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CellType {
    /// Unclassified non-object cell.
    CellOther,
    /// String.
    String,
    /// Symbol.
    Symbol,
    /// Structure metadata cell.
    Structure,
    /// Function executable.
    Executable,
    /// Scope symbol table.
    SymbolTable,
    /// Plain object.
    FinalObject,
    /// Other object.
    ObjectOther,
    /// Function object.
    Function,
    /// Array.
    Array,
    /// Unmapped arguments object.
    DirectArguments,
    /// Arguments object aliasing a scope.
    ScopedArguments,
    /// Arguments object copied out of the frame.
    ClonedArguments,
    /// `String` wrapper.
    StringObject,
    /// Lexical environment record.
    Activation,
    /// The global object.
    GlobalObject,
    /// Typed array view.
    TypedArray(TypedArrayType),
}

/// Tag values at or above this one are objects.
pub const FIRST_OBJECT_TYPE_TAG: u8 = 0x10;

/// Tag of the first typed array kind; the kinds follow contiguously.
pub const FIRST_TYPED_ARRAY_TYPE_TAG: u8 = 0x20;

impl CellType {
    /// Type-tag byte stored in the cell header.
    pub const fn tag(self) -> u8 {
        match self {
            Self::CellOther => 0x00,
            Self::String => 0x01,
            Self::Symbol => 0x02,
            Self::Structure => 0x03,
            Self::Executable => 0x04,
            Self::SymbolTable => 0x05,
            Self::FinalObject => 0x10,
            Self::ObjectOther => 0x11,
            Self::Function => 0x12,
            Self::Array => 0x13,
            Self::DirectArguments => 0x14,
            Self::ScopedArguments => 0x15,
            Self::ClonedArguments => 0x16,
            Self::StringObject => 0x17,
            Self::Activation => 0x18,
            Self::GlobalObject => 0x19,
            Self::TypedArray(kind) => FIRST_TYPED_ARRAY_TYPE_TAG + kind.tag_index(),
        }
    }

    /// Decode a type-tag byte.
    pub fn from_tag(tag: u8) -> Option<Self> {
        let cell_type = match tag {
            0x00 => Self::CellOther,
            0x01 => Self::String,
            0x02 => Self::Symbol,
            0x03 => Self::Structure,
            0x04 => Self::Executable,
            0x05 => Self::SymbolTable,
            0x10 => Self::FinalObject,
            0x11 => Self::ObjectOther,
            0x12 => Self::Function,
            0x13 => Self::Array,
            0x14 => Self::DirectArguments,
            0x15 => Self::ScopedArguments,
            0x16 => Self::ClonedArguments,
            0x17 => Self::StringObject,
            0x18 => Self::Activation,
            0x19 => Self::GlobalObject,
            t if t >= FIRST_TYPED_ARRAY_TYPE_TAG => {
                let kind = TypedArrayType::ALL.get((t - FIRST_TYPED_ARRAY_TYPE_TAG) as usize)?;
                Self::TypedArray(*kind)
            }
            _ => return None,
        };
        Some(cell_type)
    }

    /// Cell is an object.
    pub const fn is_object(self) -> bool {
        self.tag() >= FIRST_OBJECT_TYPE_TAG
    }
}

/// Shape of a cell's indexed storage, stored as the indexing byte of the
/// cell header (`shape | IS_ARRAY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexingType(pub u8);

impl IndexingType {
    /// Bit set when the cell is an `Array`.
    pub const IS_ARRAY: u8 = 0x01;
    /// Mask selecting the shape bits.
    pub const SHAPE_MASK: u8 = 0x0e;
    /// No indexed storage.
    pub const NO_INDEXING: u8 = 0x00;
    /// Boxed int32 elements.
    pub const INT32_SHAPE: u8 = 0x02;
    /// Raw double elements.
    pub const DOUBLE_SHAPE: u8 = 0x04;
    /// Boxed value elements.
    pub const CONTIGUOUS_SHAPE: u8 = 0x06;
    /// Sparse array storage.
    pub const ARRAY_STORAGE_SHAPE: u8 = 0x08;

    /// Create an indexing byte.
    pub const fn new(shape: u8, is_array: bool) -> Self {
        Self(shape | if is_array { Self::IS_ARRAY } else { 0 })
    }

    /// Shape bits.
    pub const fn shape(self) -> u8 {
        self.0 & Self::SHAPE_MASK
    }

    /// Cell is an array.
    pub const fn is_array(self) -> bool {
        self.0 & Self::IS_ARRAY != 0
    }
}

/// Type-info flags carried by a structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TypeInfoFlags(pub u8);

impl TypeInfoFlags {
    /// `instanceof` may use the default prototype walk.
    pub const IMPLEMENTS_DEFAULT_HAS_INSTANCE: u8 = 0x01;
    /// Object compares equal to `undefined` in loose equality.
    pub const MASQUERADES_AS_UNDEFINED: u8 = 0x02;
    /// `this` conversion must call into the runtime.
    pub const OVERRIDES_TO_THIS: u8 = 0x04;

    /// Flag bit is set.
    pub const fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }
}

/// Slot of a named property, counting inline slots first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PropertyOffset(pub u32);

impl PropertyOffset {
    /// Create a property offset.
    #[inline]
    pub const fn new(offset: u32) -> Self {
        Self(offset)
    }

    /// Slot lives inline in the cell.
    #[inline]
    pub const fn is_inline(self) -> bool {
        self.0 < FIRST_OUT_OF_LINE_OFFSET
    }

    /// Index into the out-of-line storage (only valid when not inline).
    #[inline]
    pub const fn out_of_line_index(self) -> u32 {
        self.0 - FIRST_OUT_OF_LINE_OFFSET
    }
}

/// Named property entry of a structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyEntry {
    /// Property name.
    pub identifier: IdentifierIndex,
    /// Where the value lives.
    pub offset: PropertyOffset,
}

/// Frozen structure metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    /// Registry id.
    pub id: StructureId,
    /// Cell kind of every cell using this structure.
    pub cell_type: CellType,
    /// Indexing byte of every cell using this structure.
    pub indexing: IndexingType,
    /// Type-info flags.
    pub flags: TypeInfoFlags,
    /// Number of inline property slots.
    pub inline_capacity: u32,
    /// Named properties.
    pub properties: Vec<PropertyEntry>,
}

impl Structure {
    /// Create a structure without properties.
    pub fn new(id: StructureId, cell_type: CellType) -> Self {
        Self {
            id,
            cell_type,
            indexing: IndexingType::new(IndexingType::NO_INDEXING, false),
            flags: TypeInfoFlags::default(),
            inline_capacity: 0,
            properties: Vec::new(),
        }
    }

    /// Look up a property slot.
    pub fn offset_of(&self, identifier: IdentifierIndex) -> Option<PropertyOffset> {
        self.properties
            .iter()
            .find(|entry| entry.identifier == identifier)
            .map(|entry| entry.offset)
    }

    /// Number of out-of-line slots in use.
    pub fn out_of_line_size(&self) -> u32 {
        self.properties
            .iter()
            .filter(|entry| !entry.offset.is_inline())
            .count() as u32
    }
}

/// Snapshot of the shape registry, keyed by [`StructureId`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StructureRegistry {
    structures: Vec<Option<Structure>>,
}

impl StructureRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a structure.
    pub fn insert(&mut self, structure: Structure) {
        let index = structure.id.index() as usize;
        if self.structures.len() <= index {
            self.structures.resize(index + 1, None);
        }
        self.structures[index] = Some(structure);
    }

    /// Look up a structure.
    pub fn get(&self, id: StructureId) -> Option<&Structure> {
        self.structures.get(id.index() as usize)?.as_ref()
    }

    /// Iterate over registered structures.
    pub fn iter(&self) -> impl Iterator<Item = &Structure> {
        self.structures.iter().flatten()
    }
}

/// Small, sorted set of structure ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StructureSet {
    ids: SmallVec<[StructureId; 4]>,
}

impl StructureSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set with exactly one structure.
    pub fn singleton(id: StructureId) -> Self {
        let mut ids = SmallVec::new();
        ids.push(id);
        Self { ids }
    }

    /// Set holding every id in `ids`.
    pub fn from_ids(ids: impl IntoIterator<Item = StructureId>) -> Self {
        let mut set = Self::new();
        for id in ids {
            set.insert(id);
        }
        set
    }

    /// Add an id, keeping the set sorted.
    pub fn insert(&mut self, id: StructureId) -> bool {
        match self.ids.binary_search(&id) {
            Ok(_) => false,
            Err(position) => {
                self.ids.insert(position, id);
                true
            }
        }
    }

    /// Set contains `id`.
    pub fn contains(&self, id: StructureId) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Set has no ids.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// The single id, when the set has exactly one.
    pub fn only(&self) -> Option<StructureId> {
        if self.ids.len() == 1 { Some(self.ids[0]) } else { None }
    }

    /// Iterate ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = StructureId> + '_ {
        self.ids.iter().copied()
    }

    /// Union in place; returns whether anything changed.
    pub fn merge(&mut self, other: &Self) -> bool {
        let mut changed = false;
        for id in other.iter() {
            changed |= self.insert(id);
        }
        changed
    }

    /// Intersection in place; returns whether anything changed.
    pub fn filter(&mut self, other: &Self) -> bool {
        let before = self.ids.len();
        self.ids.retain(|id| other.contains(*id));
        before != self.ids.len()
    }

    /// Every id is also in `other`.
    pub fn is_subset_of(&self, other: &Self) -> bool {
        self.iter().all(|id| other.contains(id))
    }
}

impl FromIterator<StructureId> for StructureSet {
    fn from_iter<T: IntoIterator<Item = StructureId>>(iter: T) -> Self {
        Self::from_ids(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_type_tags_round_trip() {
        let kinds = [
            CellType::String,
            CellType::FinalObject,
            CellType::Array,
            CellType::TypedArray(TypedArrayType::Float64),
            CellType::TypedArray(TypedArrayType::Int8),
            CellType::GlobalObject,
        ];
        for kind in kinds {
            assert_eq!(CellType::from_tag(kind.tag()), Some(kind));
        }
        assert!(CellType::Array.is_object());
        assert!(!CellType::String.is_object());
        assert_eq!(CellType::from_tag(0x0f), None);
    }

    #[test]
    fn structure_set_stays_sorted() {
        let mut set = StructureSet::from_ids([StructureId(7), StructureId(2), StructureId(5)]);
        assert_eq!(set.iter().map(|s| s.0).collect::<Vec<_>>(), vec![2, 5, 7]);
        assert!(!set.insert(StructureId(5)));
        let other = StructureSet::from_ids([StructureId(5), StructureId(9)]);
        assert!(set.filter(&other));
        assert_eq!(set.only(), Some(StructureId(5)));
        assert!(set.is_subset_of(&other));
    }

    #[test]
    fn property_offsets_split_inline_and_out_of_line() {
        assert!(PropertyOffset(3).is_inline());
        let ool = PropertyOffset(FIRST_OUT_OF_LINE_OFFSET + 2);
        assert!(!ool.is_inline());
        assert_eq!(ool.out_of_line_index(), 2);
    }
}
