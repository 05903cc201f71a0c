//! Compile-time constants embedded in the graph

use serde::{Deserialize, Serialize};

use crate::speculated_type::SpeculatedType;
use crate::structure::{CellType, StructureId, StructureRegistry};

/// Bit pattern of the canonical ("pure") NaN.
pub const PURE_NAN_BITS: u64 = 0x7ff8_0000_0000_0000;

/// A heap cell the producer of the graph froze into a constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellConstant {
    /// Address of the cell.
    pub address: u64,
    /// Structure of the cell at freeze time.
    pub structure: StructureId,
    /// String contents when the cell is a string.
    pub string: Option<StringConstant>,
}

/// Contents of a constant string cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringConstant {
    /// Characters of the string.
    pub text: String,
    /// Address of the interned string implementation, if interned.
    pub interned_impl: Option<u64>,
}

/// A value known at compile time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrozenValue {
    /// The empty value (holes, uninitialized bindings).
    Empty,
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// `true` / `false`
    Boolean(bool),
    /// Int32 number.
    Int32(i32),
    /// Double number, stored as raw bits so equality is bit-identical.
    Double(u64),
    /// Heap cell.
    Cell(CellConstant),
}

impl FrozenValue {
    /// Double constant.
    pub fn double(value: f64) -> Self {
        Self::Double(value.to_bits())
    }

    /// Numeric value if the constant is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Int32(v) => Some(*v as f64),
            Self::Double(bits) => Some(f64::from_bits(*bits)),
            _ => None,
        }
    }

    /// Int32 value if the constant is an int32, or a double that is exactly
    /// an int32 other than -0.
    pub fn as_int32(&self) -> Option<i32> {
        match self {
            Self::Int32(v) => Some(*v),
            Self::Double(bits) => {
                let value = f64::from_bits(*bits);
                let truncated = value as i32;
                if truncated as f64 == value && !(value == 0.0 && value.is_sign_negative()) {
                    Some(truncated)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Boolean value if the constant is a boolean.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Cell payload if the constant is a cell.
    pub fn as_cell(&self) -> Option<&CellConstant> {
        match self {
            Self::Cell(cell) => Some(cell),
            _ => None,
        }
    }

    /// Truthiness for constants whose truthiness does not need the heap.
    pub fn to_boolean(&self) -> Option<bool> {
        match self {
            Self::Empty => None,
            Self::Undefined | Self::Null => Some(false),
            Self::Boolean(b) => Some(*b),
            Self::Int32(v) => Some(*v != 0),
            Self::Double(bits) => {
                let value = f64::from_bits(*bits);
                Some(!(value == 0.0 || value.is_nan()))
            }
            Self::Cell(cell) => cell.string.as_ref().map(|s| !s.text.is_empty()),
        }
    }

    /// Type of the constant.
    pub fn speculated_type(&self, registry: &StructureRegistry) -> SpeculatedType {
        match self {
            Self::Empty => SpeculatedType::EMPTY,
            Self::Undefined | Self::Null => SpeculatedType::OTHER,
            Self::Boolean(_) => SpeculatedType::BOOLEAN,
            Self::Int32(v) => SpeculatedType::from_int32(*v),
            Self::Double(bits) => SpeculatedType::from_double(f64::from_bits(*bits)),
            Self::Cell(cell) => {
                if let Some(string) = &cell.string {
                    return if string.interned_impl.is_some() {
                        SpeculatedType::STRING_IDENT
                    } else {
                        SpeculatedType::STRING_VAR
                    };
                }
                registry
                    .get(cell.structure)
                    .map(|s| match s.cell_type {
                        CellType::String => SpeculatedType::STRING_VAR,
                        other => SpeculatedType::from_cell_type(other),
                    })
                    .unwrap_or(SpeculatedType::CELL)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_view_rejects_negative_zero_and_fractions() {
        assert_eq!(FrozenValue::double(4.0).as_int32(), Some(4));
        assert_eq!(FrozenValue::double(-0.0).as_int32(), None);
        assert_eq!(FrozenValue::double(1.5).as_int32(), None);
        assert_eq!(FrozenValue::Int32(-3).as_int32(), Some(-3));
    }

    #[test]
    fn double_equality_is_bitwise() {
        assert_ne!(FrozenValue::double(0.0), FrozenValue::double(-0.0));
        assert_eq!(FrozenValue::double(f64::NAN), FrozenValue::double(f64::NAN));
    }

    #[test]
    fn string_constants_split_on_interning() {
        let registry = StructureRegistry::new();
        let ident = FrozenValue::Cell(CellConstant {
            address: 0x1000,
            structure: StructureId(1),
            string: Some(StringConstant {
                text: "x".into(),
                interned_impl: Some(0x2000),
            }),
        });
        assert_eq!(ident.speculated_type(&registry), SpeculatedType::STRING_IDENT);
        assert_eq!(FrozenValue::Null.speculated_type(&registry), SpeculatedType::OTHER);
    }
}
