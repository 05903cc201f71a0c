//! Speculated type lattice.
//!
//! A [`SpeculatedType`] is a bitmask over disjoint leaf kinds. The abstract
//! state tracks one per live node, and every [`UseKind`](crate::UseKind)
//! maps to the mask its check guarantees. A check is redundant exactly when
//! the proven mask is a subset of the required mask.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use serde::{Deserialize, Serialize};

use crate::structure::{CellType, TypedArrayType};

/// Bitmask of possible runtime kinds for a value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SpeculatedType(pub u64);

impl SpeculatedType {
    // ==================== Empty ====================
    /// No value at all (unreachable).
    pub const NONE: Self = Self(0);

    // ==================== Objects ====================
    /// Plain object.
    pub const FINAL_OBJECT: Self = Self(0x0000_0001);
    /// Array object.
    pub const ARRAY: Self = Self(0x0000_0002);
    /// Callable object.
    pub const FUNCTION: Self = Self(0x0000_0004);
    /// `Int8Array`.
    pub const INT8_ARRAY: Self = Self(0x0000_0008);
    /// `Int16Array`.
    pub const INT16_ARRAY: Self = Self(0x0000_0010);
    /// `Int32Array`.
    pub const INT32_ARRAY: Self = Self(0x0000_0020);
    /// `Uint8Array`.
    pub const UINT8_ARRAY: Self = Self(0x0000_0040);
    /// `Uint8ClampedArray`.
    pub const UINT8_CLAMPED_ARRAY: Self = Self(0x0000_0080);
    /// `Uint16Array`.
    pub const UINT16_ARRAY: Self = Self(0x0000_0100);
    /// `Uint32Array`.
    pub const UINT32_ARRAY: Self = Self(0x0000_0200);
    /// `Float32Array`.
    pub const FLOAT32_ARRAY: Self = Self(0x0000_0400);
    /// `Float64Array`.
    pub const FLOAT64_ARRAY: Self = Self(0x0000_0800);
    /// Any typed array view.
    pub const TYPED_ARRAY_VIEW: Self = Self(0x0000_0ff8);
    /// Unmapped arguments object backed by the frame.
    pub const DIRECT_ARGUMENTS: Self = Self(0x0000_1000);
    /// Arguments object aliasing a scope.
    pub const SCOPED_ARGUMENTS: Self = Self(0x0000_2000);
    /// `String` wrapper object.
    pub const STRING_OBJECT: Self = Self(0x0000_4000);
    /// Any other object.
    pub const OBJECT_OTHER: Self = Self(0x0000_8000);
    /// Any object.
    pub const OBJECT: Self = Self(0x0000_ffff);

    // ==================== Non-object cells ====================
    /// String whose implementation is interned (atomic).
    pub const STRING_IDENT: Self = Self(0x0001_0000);
    /// String that is not known to be interned.
    pub const STRING_VAR: Self = Self(0x0002_0000);
    /// Any string.
    pub const STRING: Self = Self(0x0003_0000);
    /// Symbol.
    pub const SYMBOL: Self = Self(0x0004_0000);
    /// Any other non-object cell.
    pub const CELL_OTHER: Self = Self(0x0008_0000);
    /// Any heap cell.
    pub const CELL: Self = Self(0x000f_ffff);

    // ==================== Numbers ====================
    /// Int32 that is 0 or 1.
    pub const BOOL_INT32: Self = Self(0x0010_0000);
    /// Int32 outside {0, 1}.
    pub const NON_BOOL_INT32: Self = Self(0x0020_0000);
    /// Any int32.
    pub const INT32: Self = Self(0x0030_0000);
    /// Integer that needs more than 32 but at most 52 bits.
    pub const INT52: Self = Self(0x0040_0000);
    /// Any machine integer (int32 or int52).
    pub const MACHINE_INT: Self = Self(0x0070_0000);
    /// Double holding an int52-representable integer.
    pub const INT52_AS_DOUBLE: Self = Self(0x0080_0000);
    /// Double that is not an integer.
    pub const NON_INT_AS_DOUBLE: Self = Self(0x0100_0000);
    /// Any non-NaN double.
    pub const DOUBLE_REAL: Self = Self(0x0180_0000);
    /// The canonical NaN.
    pub const DOUBLE_PURE_NAN: Self = Self(0x0200_0000);
    /// NaN with a non-canonical payload.
    pub const DOUBLE_IMPURE_NAN: Self = Self(0x0400_0000);
    /// Any NaN.
    pub const DOUBLE_NAN: Self = Self(0x0600_0000);
    /// Double that can be boxed without purification.
    pub const BYTECODE_DOUBLE: Self = Self(0x0380_0000);
    /// Any double including impure NaNs.
    pub const FULL_DOUBLE: Self = Self(0x0780_0000);
    /// Real number in any machine representation.
    pub const BYTECODE_REAL_NUMBER: Self = Self(0x01b0_0000);
    /// Number as seen by the unoptimized tier.
    pub const BYTECODE_NUMBER: Self = Self(0x03b0_0000);
    /// Number in any representation.
    pub const FULL_NUMBER: Self = Self(0x07f0_0000);

    // ==================== Misc ====================
    /// `true` or `false`.
    pub const BOOLEAN: Self = Self(0x1000_0000);
    /// `null` or `undefined`.
    pub const OTHER: Self = Self(0x2000_0000);
    /// Boolean, null or undefined.
    pub const MISC: Self = Self(0x3000_0000);

    // ==================== Tops ====================
    /// Anything the heap can hold.
    pub const HEAP_TOP: Self = Self(0x33bf_ffff);
    /// The empty (hole / TDZ) value.
    pub const EMPTY: Self = Self(0x4000_0000);
    /// Anything the unoptimized tier can observe.
    pub const BYTECODE_TOP: Self = Self(0x73bf_ffff);
    /// Everything, including non-bytecode number representations.
    pub const FULL_TOP: Self = Self(0x77ff_ffff);

    /// Raw mask bits.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// No kind is possible.
    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Every kind in `self` is also in `other`.
    #[inline]
    pub const fn is_subset_of(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    /// At least one kind is shared.
    #[inline]
    pub const fn overlaps(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// Union of both masks.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Intersection of both masks.
    #[inline]
    pub const fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Kinds of `self` not in `other`.
    #[inline]
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Value is known to be an int32.
    pub const fn is_int32(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::INT32)
    }

    /// Value is known to be a machine integer (int32 or int52).
    pub const fn is_machine_int(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::MACHINE_INT)
    }

    /// Value is known to be a double.
    pub const fn is_double(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::FULL_DOUBLE)
    }

    /// Value is known to be a number.
    pub const fn is_number(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::FULL_NUMBER)
    }

    /// Value is known to be a boolean.
    pub const fn is_boolean(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::BOOLEAN)
    }

    /// Value is known to be a heap cell.
    pub const fn is_cell(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::CELL)
    }

    /// Value is known to be an object.
    pub const fn is_object(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::OBJECT)
    }

    /// Value is known to be a string.
    pub const fn is_string(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::STRING)
    }

    /// Value is known to be `null` or `undefined`.
    pub const fn is_other(self) -> bool {
        !self.is_empty() && self.is_subset_of(Self::OTHER)
    }

    /// Value may be a NaN whose payload must be purified before boxing.
    pub const fn could_be_impure_nan(self) -> bool {
        self.overlaps(Self::DOUBLE_IMPURE_NAN)
    }

    /// Type implied by a cell's type tag.
    pub fn from_cell_type(cell_type: CellType) -> Self {
        match cell_type {
            CellType::FinalObject => Self::FINAL_OBJECT,
            CellType::Array => Self::ARRAY,
            CellType::Function => Self::FUNCTION,
            CellType::TypedArray(kind) => Self::from_typed_array(kind),
            CellType::DirectArguments => Self::DIRECT_ARGUMENTS,
            CellType::ScopedArguments => Self::SCOPED_ARGUMENTS,
            CellType::StringObject => Self::STRING_OBJECT,
            CellType::ClonedArguments
            | CellType::Activation
            | CellType::GlobalObject
            | CellType::ObjectOther => Self::OBJECT_OTHER,
            CellType::String => Self::STRING,
            CellType::Symbol => Self::SYMBOL,
            CellType::Structure | CellType::Executable | CellType::SymbolTable | CellType::CellOther => {
                Self::CELL_OTHER
            }
        }
    }

    /// Type of a typed array view of the given element kind.
    pub fn from_typed_array(kind: TypedArrayType) -> Self {
        match kind {
            TypedArrayType::Int8 => Self::INT8_ARRAY,
            TypedArrayType::Int16 => Self::INT16_ARRAY,
            TypedArrayType::Int32 => Self::INT32_ARRAY,
            TypedArrayType::Uint8 => Self::UINT8_ARRAY,
            TypedArrayType::Uint8Clamped => Self::UINT8_CLAMPED_ARRAY,
            TypedArrayType::Uint16 => Self::UINT16_ARRAY,
            TypedArrayType::Uint32 => Self::UINT32_ARRAY,
            TypedArrayType::Float32 => Self::FLOAT32_ARRAY,
            TypedArrayType::Float64 => Self::FLOAT64_ARRAY,
        }
    }

    /// Type of a double value, split the same way the lattice splits doubles.
    pub fn from_double(value: f64) -> Self {
        if value.is_nan() {
            if value.to_bits() == crate::constant::PURE_NAN_BITS {
                return Self::DOUBLE_PURE_NAN;
            }
            return Self::DOUBLE_IMPURE_NAN;
        }
        if value.fract() == 0.0 && value.abs() < (1u64 << 51) as f64 {
            return Self::INT52_AS_DOUBLE;
        }
        Self::NON_INT_AS_DOUBLE
    }

    /// Type of an int32 value.
    pub fn from_int32(value: i32) -> Self {
        if value == 0 || value == 1 {
            Self::BOOL_INT32
        } else {
            Self::NON_BOOL_INT32
        }
    }
}

impl BitOr for SpeculatedType {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for SpeculatedType {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for SpeculatedType {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.intersect(rhs)
    }
}

impl BitAndAssign for SpeculatedType {
    fn bitand_assign(&mut self, rhs: Self) {
        self.0 &= rhs.0;
    }
}

impl Not for SpeculatedType {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0 & Self::FULL_TOP.0)
    }
}

const NAMED_LEAVES: &[(SpeculatedType, &str)] = &[
    (SpeculatedType::FINAL_OBJECT, "Final"),
    (SpeculatedType::ARRAY, "Array"),
    (SpeculatedType::FUNCTION, "Function"),
    (SpeculatedType::INT8_ARRAY, "Int8Array"),
    (SpeculatedType::INT16_ARRAY, "Int16Array"),
    (SpeculatedType::INT32_ARRAY, "Int32Array"),
    (SpeculatedType::UINT8_ARRAY, "Uint8Array"),
    (SpeculatedType::UINT8_CLAMPED_ARRAY, "Uint8ClampedArray"),
    (SpeculatedType::UINT16_ARRAY, "Uint16Array"),
    (SpeculatedType::UINT32_ARRAY, "Uint32Array"),
    (SpeculatedType::FLOAT32_ARRAY, "Float32Array"),
    (SpeculatedType::FLOAT64_ARRAY, "Float64Array"),
    (SpeculatedType::DIRECT_ARGUMENTS, "DirectArguments"),
    (SpeculatedType::SCOPED_ARGUMENTS, "ScopedArguments"),
    (SpeculatedType::STRING_OBJECT, "StringObject"),
    (SpeculatedType::OBJECT_OTHER, "ObjectOther"),
    (SpeculatedType::STRING_IDENT, "StringIdent"),
    (SpeculatedType::STRING_VAR, "StringVar"),
    (SpeculatedType::SYMBOL, "Symbol"),
    (SpeculatedType::CELL_OTHER, "CellOther"),
    (SpeculatedType::BOOL_INT32, "BoolInt32"),
    (SpeculatedType::NON_BOOL_INT32, "NonBoolInt32"),
    (SpeculatedType::INT52, "Int52"),
    (SpeculatedType::INT52_AS_DOUBLE, "Int52AsDouble"),
    (SpeculatedType::NON_INT_AS_DOUBLE, "NonIntAsDouble"),
    (SpeculatedType::DOUBLE_PURE_NAN, "DoublePureNaN"),
    (SpeculatedType::DOUBLE_IMPURE_NAN, "DoubleImpureNaN"),
    (SpeculatedType::BOOLEAN, "Bool"),
    (SpeculatedType::OTHER, "Other"),
    (SpeculatedType::EMPTY, "Empty"),
];

impl fmt::Debug for SpeculatedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for SpeculatedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("None");
        }
        if *self == Self::FULL_TOP {
            return f.write_str("Top");
        }
        if *self == Self::HEAP_TOP {
            return f.write_str("HeapTop");
        }
        let mut first = true;
        for (leaf, name) in NAMED_LEAVES {
            if self.overlaps(*leaf) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_masks_are_unions_of_leaves() {
        assert_eq!(
            SpeculatedType::INT32,
            SpeculatedType::BOOL_INT32 | SpeculatedType::NON_BOOL_INT32
        );
        assert_eq!(
            SpeculatedType::FULL_DOUBLE,
            SpeculatedType::DOUBLE_REAL | SpeculatedType::DOUBLE_NAN
        );
        assert_eq!(
            SpeculatedType::BYTECODE_NUMBER,
            SpeculatedType::INT32 | SpeculatedType::BYTECODE_DOUBLE
        );
        assert_eq!(
            SpeculatedType::HEAP_TOP,
            SpeculatedType::CELL | SpeculatedType::BYTECODE_NUMBER | SpeculatedType::MISC
        );
        assert_eq!(
            SpeculatedType::BYTECODE_TOP,
            SpeculatedType::HEAP_TOP | SpeculatedType::EMPTY
        );
        assert_eq!(
            SpeculatedType::FULL_TOP,
            SpeculatedType::BYTECODE_TOP | SpeculatedType::INT52 | SpeculatedType::DOUBLE_IMPURE_NAN
        );
    }

    #[test]
    fn complement_stays_inside_the_lattice() {
        assert_eq!(
            !SpeculatedType::HEAP_TOP,
            SpeculatedType::INT52 | SpeculatedType::DOUBLE_IMPURE_NAN | SpeculatedType::EMPTY
        );
        assert_eq!(!SpeculatedType::FULL_TOP, SpeculatedType::NONE);
        assert_eq!(
            SpeculatedType::BYTECODE_TOP.without(SpeculatedType::HEAP_TOP),
            SpeculatedType::EMPTY
        );
    }

    #[test]
    fn subset_queries() {
        assert!(SpeculatedType::BOOL_INT32.is_subset_of(SpeculatedType::INT32));
        assert!(!SpeculatedType::INT52.is_subset_of(SpeculatedType::INT32));
        assert!(SpeculatedType::INT32.is_int32());
        assert!(!SpeculatedType::NONE.is_int32());
        assert!((SpeculatedType::ARRAY | SpeculatedType::FUNCTION).is_object());
        assert!(!(SpeculatedType::ARRAY | SpeculatedType::OTHER).is_object());
    }

    #[test]
    fn doubles_split_by_integrality_and_nan() {
        assert_eq!(SpeculatedType::from_double(3.0), SpeculatedType::INT52_AS_DOUBLE);
        assert_eq!(SpeculatedType::from_double(0.5), SpeculatedType::NON_INT_AS_DOUBLE);
        assert_eq!(SpeculatedType::from_double(f64::NAN), SpeculatedType::DOUBLE_PURE_NAN);
        let impure = f64::from_bits(0x7ff8_0000_0000_0001);
        assert_eq!(SpeculatedType::from_double(impure), SpeculatedType::DOUBLE_IMPURE_NAN);
    }

    #[test]
    fn display_lists_leaves() {
        assert_eq!(SpeculatedType::INT32.to_string(), "BoolInt32|NonBoolInt32");
        assert_eq!(SpeculatedType::NONE.to_string(), "None");
        assert_eq!(SpeculatedType::FULL_TOP.to_string(), "Top");
    }
}
