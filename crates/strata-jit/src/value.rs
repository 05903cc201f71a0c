//! Boxed value encoding.
//!
//! Every boxed value is a 64-bit word. The top 16 bits select the kind:
//!
//! ```text
//!   0xFFFF:xxxx:iiii:iiii   int32 (payload zero-extended under the tag)
//!   0x0001..0xFFFE:*        double, stored as raw bits + 2^48
//!   0x0000:pppp:pppp:pppp   cell pointer (low tag bits clear) or misc
//! ```
//!
//! Misc values live below the pointer range with bit 1 set:
//! `null = 0x02`, `false = 0x06`, `true = 0x07`, `undefined = 0x0a`.
//! The empty value (holes, uninitialized bindings) is `0x0`.

use strata_ir::{FrozenValue, PURE_NAN_BITS};

// ---------------------------------------------------------------------------
// Tag constants
// ---------------------------------------------------------------------------

/// Tag bits shared by every number; all set means int32.
pub const TAG_TYPE_NUMBER: u64 = 0xFFFF_0000_0000_0000;

/// Added to the raw bits of a double when boxing.
pub const DOUBLE_ENCODE_OFFSET: u64 = 1 << 48;

/// Set for every misc value.
pub const TAG_BIT_TYPE_OTHER: u64 = 0x2;

/// Set for booleans.
pub const TAG_BIT_BOOL: u64 = 0x4;

/// Set for `undefined`.
pub const TAG_BIT_UNDEFINED: u64 = 0x8;

/// A word is a cell iff none of these bits are set.
pub const TAG_MASK: u64 = TAG_TYPE_NUMBER | TAG_BIT_TYPE_OTHER;

/// The empty value.
pub const VALUE_EMPTY: u64 = 0x0;

/// Marker for deleted slots; never visible to user code.
pub const VALUE_DELETED: u64 = 0x4;

/// `null`
pub const VALUE_NULL: u64 = TAG_BIT_TYPE_OTHER;

/// `undefined`
pub const VALUE_UNDEFINED: u64 = TAG_BIT_TYPE_OTHER | TAG_BIT_UNDEFINED;

/// `false`
pub const VALUE_FALSE: u64 = TAG_BIT_TYPE_OTHER | TAG_BIT_BOOL;

/// `true`
pub const VALUE_TRUE: u64 = VALUE_FALSE | 1;

/// Shift applied to int52 values held in the shifted representation.
pub const INT52_SHIFT: u32 = 12;

/// Largest int52 value.
pub const INT52_MAX: i64 = (1 << 51) - 1;

/// Smallest int52 value.
pub const INT52_MIN: i64 = -(1 << 51);

/// Doubles at or above this bit pattern would collide with the int32 tag
/// once the encode offset is added.
pub const IMPURE_NAN_THRESHOLD: u64 = 0xFFFE_0000_0000_0000;

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

/// Word is a boxed int32.
#[inline]
pub const fn is_int32(bits: u64) -> bool {
    bits & TAG_TYPE_NUMBER == TAG_TYPE_NUMBER
}

/// Word is a boxed number (int32 or double).
#[inline]
pub const fn is_number(bits: u64) -> bool {
    bits & TAG_TYPE_NUMBER != 0
}

/// Word is a boxed double.
#[inline]
pub const fn is_double(bits: u64) -> bool {
    is_number(bits) && !is_int32(bits)
}

/// Word is a cell pointer (or the empty value).
#[inline]
pub const fn is_cell(bits: u64) -> bool {
    bits & TAG_MASK == 0
}

/// Word is `true` or `false`.
#[inline]
pub const fn is_boolean(bits: u64) -> bool {
    bits & !1 == VALUE_FALSE
}

/// Word is `null` or `undefined`.
#[inline]
pub const fn is_other(bits: u64) -> bool {
    bits & !TAG_BIT_UNDEFINED == VALUE_NULL
}

/// Word is a boolean, `null` or `undefined`.
#[inline]
pub const fn is_misc(bits: u64) -> bool {
    is_boolean(bits) || is_other(bits)
}

/// Double bit pattern that must be purified before boxing.
#[inline]
pub const fn is_impure_nan(bits: u64) -> bool {
    bits >= IMPURE_NAN_THRESHOLD
}

// ---------------------------------------------------------------------------
// Boxing
// ---------------------------------------------------------------------------

/// Box an int32.
#[inline]
pub const fn box_int32(value: i32) -> u64 {
    TAG_TYPE_NUMBER | value as u32 as u64
}

/// Unbox an int32 (the word must satisfy [`is_int32`]).
#[inline]
pub const fn unbox_int32(bits: u64) -> i32 {
    bits as u32 as i32
}

/// Replace any NaN whose encoding would collide with another kind by the
/// canonical NaN.
#[inline]
pub fn purify_nan(value: f64) -> f64 {
    if is_impure_nan(value.to_bits()) {
        f64::from_bits(PURE_NAN_BITS)
    } else {
        value
    }
}

/// Box a double, purifying colliding NaNs.
#[inline]
pub fn box_double(value: f64) -> u64 {
    purify_nan(value)
        .to_bits()
        .wrapping_add(DOUBLE_ENCODE_OFFSET)
}

/// Unbox a double (the word must satisfy [`is_double`]).
#[inline]
pub fn unbox_double(bits: u64) -> f64 {
    f64::from_bits(bits.wrapping_sub(DOUBLE_ENCODE_OFFSET))
}

/// Box a boolean.
#[inline]
pub const fn box_boolean(value: bool) -> u64 {
    VALUE_FALSE | value as u64
}

/// Unbox a boolean (the word must satisfy [`is_boolean`]).
#[inline]
pub const fn unbox_boolean(bits: u64) -> bool {
    bits & 1 != 0
}

/// Box a number, choosing int32 when the value is an int32 other than -0.
pub fn box_number(value: f64) -> u64 {
    let truncated = value as i32;
    if truncated as f64 == value && !(value == 0.0 && value.is_sign_negative()) {
        box_int32(truncated)
    } else {
        box_double(value)
    }
}

/// Box an int52: int32 when it fits, double otherwise.
pub fn box_int52(value: i64) -> u64 {
    match i32::try_from(value) {
        Ok(small) => box_int32(small),
        Err(_) => box_double(value as f64),
    }
}

/// Value fits the int52 range.
#[inline]
pub const fn is_int52(value: i64) -> bool {
    value >= INT52_MIN && value <= INT52_MAX
}

/// Double holds an integer in int52 range (excluding -0).
pub fn double_as_int52(value: f64) -> Option<i64> {
    let truncated = value as i64;
    if truncated as f64 == value
        && is_int52(truncated)
        && !(value == 0.0 && value.is_sign_negative())
    {
        Some(truncated)
    } else {
        None
    }
}

/// Number value of a boxed int32 or double.
pub fn as_number(bits: u64) -> Option<f64> {
    if is_int32(bits) {
        Some(unbox_int32(bits) as f64)
    } else if is_number(bits) {
        Some(unbox_double(bits))
    } else {
        None
    }
}

/// Box a compile-time constant.
pub fn box_frozen(value: &FrozenValue) -> u64 {
    match value {
        FrozenValue::Empty => VALUE_EMPTY,
        FrozenValue::Undefined => VALUE_UNDEFINED,
        FrozenValue::Null => VALUE_NULL,
        FrozenValue::Boolean(b) => box_boolean(*b),
        FrozenValue::Int32(v) => box_int32(*v),
        FrozenValue::Double(bits) => box_double(f64::from_bits(*bits)),
        FrozenValue::Cell(cell) => cell.address,
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// A boxed word decoded into its kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    /// Empty value.
    Empty,
    /// Int32.
    Int32(i32),
    /// Double.
    Double(f64),
    /// Boolean.
    Boolean(bool),
    /// `null`
    Null,
    /// `undefined`
    Undefined,
    /// Cell pointer.
    Cell(u64),
    /// Not a valid boxed value.
    Invalid(u64),
}

/// Decode a boxed word.
pub fn decode(bits: u64) -> Decoded {
    if is_int32(bits) {
        Decoded::Int32(unbox_int32(bits))
    } else if is_number(bits) {
        Decoded::Double(unbox_double(bits))
    } else if bits == VALUE_EMPTY {
        Decoded::Empty
    } else if is_cell(bits) {
        Decoded::Cell(bits)
    } else if is_boolean(bits) {
        Decoded::Boolean(unbox_boolean(bits))
    } else if bits == VALUE_NULL {
        Decoded::Null
    } else if bits == VALUE_UNDEFINED {
        Decoded::Undefined
    } else {
        Decoded::Invalid(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int32_boxing_roundtrip() {
        for v in [0, 1, -1, 42, i32::MIN, i32::MAX] {
            let boxed = box_int32(v);
            assert!(is_int32(boxed));
            assert!(!is_cell(boxed));
            assert_eq!(unbox_int32(boxed), v);
        }
    }

    #[test]
    fn misc_values_are_disjoint() {
        assert!(is_other(VALUE_NULL) && is_other(VALUE_UNDEFINED));
        assert!(is_boolean(VALUE_TRUE) && is_boolean(VALUE_FALSE));
        assert!(!is_boolean(VALUE_NULL));
        assert!(!is_other(VALUE_TRUE));
        for bits in [VALUE_NULL, VALUE_UNDEFINED, VALUE_TRUE, VALUE_FALSE] {
            assert!(!is_cell(bits));
            assert!(!is_number(bits));
        }
    }

    #[test]
    fn impure_nan_is_purified() {
        let impure = f64::from_bits(0xFFFF_0000_0000_0001);
        assert!(impure.is_nan());
        let boxed = box_double(impure);
        assert!(is_double(boxed));
        assert_eq!(unbox_double(boxed).to_bits(), PURE_NAN_BITS);
    }

    #[test]
    fn int52_boxing_prefers_int32() {
        assert_eq!(box_int52(7), box_int32(7));
        let big = 1i64 << 40;
        assert_eq!(as_number(box_int52(big)), Some(big as f64));
    }

    #[test]
    fn number_boxing_keeps_negative_zero_as_double() {
        assert!(is_double(box_number(-0.0)));
        assert!(is_int32(box_number(3.0)));
        assert!(is_double(box_number(3.5)));
    }

    #[test]
    fn decode_classifies() {
        assert_eq!(decode(box_int32(-5)), Decoded::Int32(-5));
        assert_eq!(decode(VALUE_UNDEFINED), Decoded::Undefined);
        assert_eq!(decode(0x1000), Decoded::Cell(0x1000));
        assert_eq!(decode(box_double(1.5)), Decoded::Double(1.5));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_int32_roundtrip(v in any::<i32>()) {
                let boxed = box_int32(v);
                prop_assert!(is_int32(boxed));
                prop_assert!(!is_double(boxed) && !is_cell(boxed) && !is_misc(boxed));
                prop_assert_eq!(unbox_int32(boxed), v);
            }

            #[test]
            fn prop_double_roundtrip(bits in any::<u64>()) {
                let value = f64::from_bits(bits);
                let boxed = box_double(value);
                prop_assert!(is_double(boxed));
                prop_assert!(!is_cell(boxed) && !is_misc(boxed));
                let back = unbox_double(boxed);
                if is_impure_nan(bits) {
                    prop_assert_eq!(back.to_bits(), PURE_NAN_BITS);
                } else {
                    prop_assert_eq!(back.to_bits(), bits);
                }
            }

            #[test]
            fn prop_pure_nans_keep_their_payload(payload in 1u64..(1 << 51), negative in any::<bool>()) {
                let sign = if negative { 1u64 << 63 } else { 0 };
                let bits = sign | 0x7FF8_0000_0000_0000 | payload;
                prop_assume!(!is_impure_nan(bits));
                let back = unbox_double(box_double(f64::from_bits(bits)));
                prop_assert_eq!(back.to_bits(), bits);
            }

            #[test]
            fn prop_cells_are_not_numbers(address in 1u64..(1 << 44)) {
                let cell = address << 4;
                prop_assert!(is_cell(cell));
                prop_assert!(!is_number(cell) && !is_misc(cell));
                prop_assert_eq!(decode(cell), Decoded::Cell(cell));
            }

            #[test]
            fn prop_box_number_preserves_value(value in any::<f64>().prop_filter("not NaN", |v| !v.is_nan())) {
                let boxed = box_number(value);
                prop_assert_eq!(as_number(boxed).map(f64::to_bits), Some(value.to_bits()));
            }
        }
    }
}
