//! Heap object layout seen by lowered code.
//!
//! Lowering never hard-codes byte offsets; it asks an [`ObjectLayout`] for
//! them. [`DefaultObjectLayout`] describes the heap used by the runtime in
//! `strata-exec` and by the test fixtures:
//!
//! ```text
//! cell header
//!   +0  u32 structure id
//!   +4  u8  indexing type
//!   +5  u8  cell type tag
//!   +6  u8  type-info flags
//!   +7  u8  gc mark
//!   +8  ptr butterfly / string impl / typed array vector
//!   +16 ... per-kind fields
//!
//! butterfly (pointer targets element 0)
//!   -16-8i  out-of-line property i
//!   -8      u32 public length
//!   -4      u32 vector length
//!   +8i     element i
//! ```

use std::fmt;

use strata_ir::structure::FIRST_OBJECT_TYPE_TAG;
use strata_ir::{CellType, PropertyOffset};

/// Fields whose offsets lowering needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldKind {
    /// `u32` structure id in the cell header.
    StructureId,
    /// `u8` indexing type in the cell header.
    IndexingType,
    /// `u8` cell type tag in the cell header.
    CellType,
    /// `u8` type-info flags in the cell header.
    TypeInfoFlags,
    /// `u8` gc mark in the cell header.
    GcMark,
    /// Butterfly pointer of an object.
    Butterfly,
    /// First inline property slot of an object.
    InlineStorage,
    /// `u32` public length, relative to the butterfly.
    PublicLength,
    /// `u32` vector length, relative to the butterfly.
    VectorLength,
    /// String implementation pointer of a string cell (null for ropes).
    StringImpl,
    /// `u32` flags of a string implementation.
    StringImplFlags,
    /// `u32` length of a string implementation.
    StringImplLength,
    /// Character data pointer of a string implementation.
    StringImplData,
    /// Element vector of a typed array.
    TypedArrayVector,
    /// `u32` length of a typed array.
    TypedArrayLength,
    /// Parent scope of a scope.
    ScopeNext,
    /// Symbol table of an activation.
    ActivationSymbolTable,
    /// First variable slot of an activation.
    ActivationVariables,
    /// Scope of a function.
    FunctionScope,
    /// Executable of a function.
    FunctionExecutable,
    /// `u32` length of a direct arguments object.
    DirectArgumentsLength,
    /// Callee of a direct arguments object.
    DirectArgumentsCallee,
    /// Mapped-arguments override pointer of a direct arguments object.
    DirectArgumentsMapped,
    /// First argument slot of a direct arguments object.
    DirectArgumentsStorage,
    /// Wrapped primitive of a `String` object.
    StringObjectValue,
}

/// String implementation flag bits.
pub mod string_flags {
    /// Characters are one byte each.
    pub const IS_8BIT: u32 = 0x1;
    /// Implementation is interned.
    pub const IS_ATOMIC: u32 = 0x2;
}

/// Offsets and tags of a target object model.
pub trait ObjectLayout: Send + Sync + fmt::Debug {
    /// Byte offset of a field.
    fn field_offset(&self, kind: FieldKind) -> i32;

    /// Byte offset of the cell type tag.
    fn tag_offset(&self) -> i32 {
        self.field_offset(FieldKind::CellType)
    }

    /// Tag byte carried by cells of `cell_type`.
    fn type_of(&self, cell_type: CellType) -> u8 {
        cell_type.tag()
    }

    /// Cell type tags at or above this one belong to objects.
    fn first_object_tag(&self) -> u8 {
        FIRST_OBJECT_TYPE_TAG
    }

    /// Byte offset of a named property, relative to the cell for inline
    /// slots and to the butterfly for out-of-line slots.
    fn property_offset(&self, offset: PropertyOffset) -> i32 {
        if offset.is_inline() {
            self.field_offset(FieldKind::InlineStorage) + 8 * offset.0 as i32
        } else {
            -16 - 8 * offset.out_of_line_index() as i32
        }
    }

    /// Byte offset of closure variable `index` in an activation.
    fn closure_var_offset(&self, index: u32) -> i32 {
        self.field_offset(FieldKind::ActivationVariables) + 8 * index as i32
    }

    /// Byte offset of argument `index` in a direct arguments object.
    fn direct_argument_offset(&self, index: u32) -> i32 {
        self.field_offset(FieldKind::DirectArgumentsStorage) + 8 * index as i32
    }

    /// Size in bytes of an object with `inline_capacity` inline slots.
    fn object_size(&self, inline_capacity: u32) -> u32 {
        self.field_offset(FieldKind::InlineStorage) as u32 + 8 * inline_capacity
    }

    /// Bytes before element 0 of a butterfly with `out_of_line` property slots.
    fn butterfly_preamble(&self, out_of_line: u32) -> u32 {
        8 + 8 * out_of_line
    }
}

/// Layout of the reference heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultObjectLayout;

impl ObjectLayout for DefaultObjectLayout {
    fn field_offset(&self, kind: FieldKind) -> i32 {
        match kind {
            FieldKind::StructureId => 0,
            FieldKind::IndexingType => 4,
            FieldKind::CellType => 5,
            FieldKind::TypeInfoFlags => 6,
            FieldKind::GcMark => 7,
            FieldKind::Butterfly
            | FieldKind::StringImpl
            | FieldKind::TypedArrayVector
            | FieldKind::StringObjectValue => 8,
            FieldKind::InlineStorage => 16,
            FieldKind::PublicLength => -8,
            FieldKind::VectorLength => -4,
            FieldKind::StringImplLength => 4,
            FieldKind::StringImplData => 8,
            FieldKind::StringImplFlags => 16,
            FieldKind::TypedArrayLength => 16,
            FieldKind::ScopeNext => 16,
            FieldKind::ActivationSymbolTable => 24,
            FieldKind::ActivationVariables => 32,
            FieldKind::FunctionScope => 16,
            FieldKind::FunctionExecutable => 24,
            FieldKind::DirectArgumentsLength => 16,
            FieldKind::DirectArgumentsCallee => 24,
            FieldKind::DirectArgumentsMapped => 32,
            FieldKind::DirectArgumentsStorage => 40,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ir::structure::FIRST_OUT_OF_LINE_OFFSET;

    #[test]
    fn property_offsets_split_inline_and_out_of_line() {
        let layout = DefaultObjectLayout;
        assert_eq!(layout.property_offset(PropertyOffset(0)), 16);
        assert_eq!(layout.property_offset(PropertyOffset(2)), 32);
        assert_eq!(
            layout.property_offset(PropertyOffset(FIRST_OUT_OF_LINE_OFFSET)),
            -16
        );
        assert_eq!(
            layout.property_offset(PropertyOffset(FIRST_OUT_OF_LINE_OFFSET + 1)),
            -24
        );
    }

    #[test]
    fn tag_is_cell_type_byte() {
        let layout = DefaultObjectLayout;
        assert_eq!(layout.tag_offset(), 5);
        assert_eq!(layout.type_of(CellType::String), CellType::String.tag());
    }
}
