//! Use kinds: what a consumer requires of each input edge.

use serde::{Deserialize, Serialize};

use crate::speculated_type::SpeculatedType;

/// Requirement an edge places on the value flowing through it.
///
/// Kinds prefixed `Known` are proven by the producer of the graph and never
/// emit a check. The `*Rep` kinds consume a value already produced in an
/// unboxed machine representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UseKind {
    /// Any boxed value.
    Untyped,
    /// Must be an int32.
    Int32,
    /// Proven int32.
    KnownInt32,
    /// Int52 machine representation.
    Int52Rep,
    /// Must be an int32 or an integral double that fits in 52 bits.
    MachineInt,
    /// Must be a number.
    Number,
    /// Must be a number other than NaN.
    RealNumber,
    /// Double machine representation.
    DoubleRep,
    /// Double machine representation, not NaN.
    DoubleRepReal,
    /// Double machine representation holding an int52-representable integer.
    DoubleRepMachineInt,
    /// Must be a boolean.
    Boolean,
    /// Proven boolean.
    KnownBoolean,
    /// Must be a heap cell.
    Cell,
    /// Proven heap cell.
    KnownCell,
    /// Must be an object.
    Object,
    /// Must be a callable object.
    Function,
    /// Must be a plain object.
    FinalObject,
    /// Must be an object, `null` or `undefined`.
    ObjectOrOther,
    /// Must be a string.
    String,
    /// Proven string.
    KnownString,
    /// Must be an interned string.
    StringIdent,
    /// Must be a `String` wrapper object.
    StringObject,
    /// Must be a string or a `String` wrapper object.
    StringOrStringObject,
    /// Must not be a non-interned string.
    NotStringVar,
    /// Must not be a cell.
    NotCell,
    /// Must be `null` or `undefined`.
    Other,
    /// Must be a boolean, `null` or `undefined`.
    Misc,
}

/// Machine representation an edge consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Representation {
    /// 32-bit integer.
    Int32,
    /// 52-bit integer.
    Int52,
    /// 64-bit float.
    Double,
    /// 0/1 in 32 bits.
    Boolean,
    /// Boxed 64-bit word.
    JsValue,
}

impl UseKind {
    /// Types the check for this kind lets through.
    pub fn type_filter(self) -> SpeculatedType {
        match self {
            Self::Untyped => SpeculatedType::FULL_TOP,
            Self::Int32 | Self::KnownInt32 => SpeculatedType::INT32,
            Self::Int52Rep | Self::MachineInt => SpeculatedType::MACHINE_INT,
            Self::Number => SpeculatedType::BYTECODE_NUMBER,
            Self::RealNumber => SpeculatedType::BYTECODE_REAL_NUMBER,
            Self::DoubleRep => SpeculatedType::FULL_DOUBLE,
            Self::DoubleRepReal => SpeculatedType::DOUBLE_REAL,
            Self::DoubleRepMachineInt => SpeculatedType::INT52_AS_DOUBLE,
            Self::Boolean | Self::KnownBoolean => SpeculatedType::BOOLEAN,
            Self::Cell | Self::KnownCell => SpeculatedType::CELL,
            Self::Object => SpeculatedType::OBJECT,
            Self::Function => SpeculatedType::FUNCTION,
            Self::FinalObject => SpeculatedType::FINAL_OBJECT,
            Self::ObjectOrOther => SpeculatedType::OBJECT | SpeculatedType::OTHER,
            Self::String | Self::KnownString => SpeculatedType::STRING,
            Self::StringIdent => SpeculatedType::STRING_IDENT,
            Self::StringObject => SpeculatedType::STRING_OBJECT,
            Self::StringOrStringObject => SpeculatedType::STRING | SpeculatedType::STRING_OBJECT,
            Self::NotStringVar => !SpeculatedType::STRING_VAR,
            Self::NotCell => !SpeculatedType::CELL,
            Self::Other => SpeculatedType::OTHER,
            Self::Misc => SpeculatedType::MISC,
        }
    }

    /// The producer already proved this edge; no check is ever emitted.
    pub const fn is_proven(self) -> bool {
        matches!(
            self,
            Self::Untyped
                | Self::KnownInt32
                | Self::KnownBoolean
                | Self::KnownCell
                | Self::KnownString
                | Self::Int52Rep
                | Self::DoubleRep
        )
    }

    /// Representation the consumer reads the value in.
    pub const fn representation(self) -> Representation {
        match self {
            Self::Int32 | Self::KnownInt32 => Representation::Int32,
            Self::Int52Rep => Representation::Int52,
            Self::DoubleRep | Self::DoubleRepReal | Self::DoubleRepMachineInt => {
                Representation::Double
            }
            Self::Boolean | Self::KnownBoolean => Representation::Boolean,
            _ => Representation::JsValue,
        }
    }

    /// Kind consumes a double machine value.
    pub const fn is_double_rep(self) -> bool {
        matches!(
            self,
            Self::DoubleRep | Self::DoubleRepReal | Self::DoubleRepMachineInt
        )
    }

    /// Kind guarantees a cell.
    pub const fn is_cell(self) -> bool {
        matches!(
            self,
            Self::Cell
                | Self::KnownCell
                | Self::Object
                | Self::Function
                | Self::FinalObject
                | Self::String
                | Self::KnownString
                | Self::StringIdent
                | Self::StringObject
                | Self::StringOrStringObject
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_kinds_share_filters_with_checked_kinds() {
        assert_eq!(UseKind::Int32.type_filter(), UseKind::KnownInt32.type_filter());
        assert_eq!(UseKind::Cell.type_filter(), UseKind::KnownCell.type_filter());
        assert!(UseKind::KnownInt32.is_proven());
        assert!(!UseKind::Int32.is_proven());
    }

    #[test]
    fn negative_filters_exclude_their_kind() {
        assert!(!UseKind::NotCell.type_filter().overlaps(SpeculatedType::CELL));
        assert!(UseKind::NotStringVar.type_filter().overlaps(SpeculatedType::STRING_IDENT));
        assert!(!UseKind::NotStringVar.type_filter().overlaps(SpeculatedType::STRING_VAR));
    }

    #[test]
    fn representations() {
        assert_eq!(UseKind::DoubleRepReal.representation(), Representation::Double);
        assert_eq!(UseKind::Object.representation(), Representation::JsValue);
        assert_eq!(UseKind::KnownBoolean.representation(), Representation::Boolean);
    }
}
