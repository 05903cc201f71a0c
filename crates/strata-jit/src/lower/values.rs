//! Value representations and the conversions between them.

use rustc_hash::FxHashMap;
use strata_ir::{
    ArithMode, BlockIndex, Dominators, Edge, FrozenValue, Node, NodeId, NodeResult, Op,
    SpeculatedType, UseKind,
};

use super::LowerCx;
use crate::exit::ExitKind;
use crate::helpers::HelperKind;
use crate::lir::{BranchWeight, FloatCC, IntCC, Type, Value};
use crate::value::{
    DOUBLE_ENCODE_OFFSET, INT52_SHIFT, TAG_TYPE_NUMBER, VALUE_FALSE, VALUE_NULL, VALUE_TRUE,
    box_frozen,
};

/// Representation a lowered value is held in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Repr {
    /// `I32`.
    Int32,
    /// `I64` int52 shifted left by [`INT52_SHIFT`].
    Int52,
    /// `I64` int52, not shifted.
    StrictInt52,
    /// `F64`.
    Double,
    /// `I32` 0/1.
    Boolean,
    /// `I64` boxed value.
    JsValue,
    /// `I64` storage pointer.
    Storage,
}

/// Values already computed for graph nodes, with the block that defined them.
#[derive(Debug, Default)]
pub struct LoweredValues {
    map: FxHashMap<(NodeId, Repr), (Value, BlockIndex)>,
}

impl LoweredValues {
    /// Record a value.
    pub fn insert(&mut self, node: NodeId, repr: Repr, value: Value, block: BlockIndex) {
        self.map.insert((node, repr), (value, block));
    }

    /// Value usable from `block`: one defined in a dominator.
    pub fn get(&self, node: NodeId, repr: Repr, block: BlockIndex, dominators: &Dominators) -> Option<Value> {
        self.map
            .get(&(node, repr))
            .filter(|(_, defined)| dominators.dominates(*defined, block))
            .map(|(value, _)| *value)
    }

    /// Node has been lowered in some representation.
    pub fn has_any(&self, node: NodeId) -> bool {
        self.map.keys().any(|(id, _)| *id == node)
    }
}

/// Constant value of a constant node.
pub(crate) enum ConstantValue<'g> {
    Js(&'g FrozenValue),
    Double(f64),
    Int52(i64),
}

pub(crate) fn constant_of(node: &Node) -> Option<ConstantValue<'_>> {
    match &node.op {
        Op::JsConstant(value) => Some(ConstantValue::Js(value)),
        Op::DoubleConstant(bits) => Some(ConstantValue::Double(f64::from_bits(*bits))),
        Op::Int52Constant(value) => Some(ConstantValue::Int52(*value)),
        _ => None,
    }
}

impl LowerCx<'_> {
    fn missing(&self, edge: Edge, repr: Repr) -> ! {
        self.crash(format_args!(
            "{} requested as {repr:?} but never produced in that representation",
            edge.node
        ))
    }

    /// Value of an int32 edge, speculating if it is boxed.
    pub(crate) fn lower_int32(&mut self, edge: Edge) -> Value {
        let id = edge.node;
        if let Some(value) = self.cached(id, Repr::Int32) {
            return value;
        }
        let graph = self.graph;
        if let Some(constant) = constant_of(graph.node(id)) {
            return match constant {
                ConstantValue::Js(FrozenValue::Int32(value)) => self.b.i32(*value),
                _ => {
                    // The check can never pass.
                    self.terminate(ExitKind::BadType);
                    self.b.i32(0)
                }
            };
        }
        if self.cached(id, Repr::JsValue).is_none() {
            self.missing(edge, Repr::Int32);
        }
        let boxed = self.boxed(id);
        self.speculate_int32(id, boxed);
        let value = self.b.trunc(boxed);
        self.set_value(id, Repr::Int32, value);
        value
    }

    /// Value of an int52 edge, unshifted.
    pub(crate) fn lower_strict_int52(&mut self, edge: Edge) -> Value {
        let id = edge.node;
        if let Some(value) = self.cached(id, Repr::StrictInt52) {
            return value;
        }
        if let Some(shifted) = self.cached(id, Repr::Int52) {
            let value = self.b.sshr_imm(shifted, INT52_SHIFT as i64);
            self.set_value(id, Repr::StrictInt52, value);
            return value;
        }
        let graph = self.graph;
        match constant_of(graph.node(id)) {
            Some(ConstantValue::Int52(value)) => self.b.i64(value),
            Some(ConstantValue::Js(FrozenValue::Int32(value))) => self.b.i64(*value as i64),
            _ => {
                if let Some(narrow) = self.cached(id, Repr::Int32) {
                    return self.b.sext(narrow);
                }
                self.missing(edge, Repr::StrictInt52)
            }
        }
    }

    /// Value of an int52 edge, shifted.
    pub(crate) fn lower_int52(&mut self, edge: Edge) -> Value {
        if let Some(value) = self.cached(edge.node, Repr::Int52) {
            return value;
        }
        let strict = self.lower_strict_int52(edge);
        let value = self.b.shl_imm(strict, INT52_SHIFT as i64);
        self.set_value(edge.node, Repr::Int52, value);
        value
    }

    /// Value of a double edge, checking the refinement the edge demands.
    pub(crate) fn lower_double(&mut self, edge: Edge) -> Value {
        let id = edge.node;
        let graph = self.graph;
        let value = if let Some(value) = self.cached(id, Repr::Double) {
            value
        } else {
            match constant_of(graph.node(id)) {
                Some(ConstantValue::Double(value)) => self.b.f64(value),
                Some(ConstantValue::Int52(value)) => self.b.f64(value as f64),
                Some(ConstantValue::Js(constant)) => match constant.as_number() {
                    Some(number) => self.b.f64(number),
                    None => self.missing(edge, Repr::Double),
                },
                None => {
                    if let Some(narrow) = self.cached(id, Repr::Int32) {
                        self.b.int_to_double(true, narrow)
                    } else {
                        self.missing(edge, Repr::Double)
                    }
                }
            }
        };
        match edge.use_kind {
            UseKind::DoubleRepReal => {
                self.type_check(id, SpeculatedType::DOUBLE_REAL, ExitKind::BadType, None, |cx| {
                    cx.b.fcmp(FloatCC::Unordered, value, value)
                });
            }
            UseKind::DoubleRepMachineInt => {
                self.type_check(id, SpeculatedType::INT52_AS_DOUBLE, ExitKind::BadType, None, |cx| {
                    double_is_not_int52(cx, value)
                });
            }
            _ => {}
        }
        value
    }

    /// Value of a boolean edge.
    pub(crate) fn lower_boolean(&mut self, edge: Edge) -> Value {
        let id = edge.node;
        if let Some(value) = self.cached(id, Repr::Boolean) {
            return value;
        }
        let graph = self.graph;
        if let Some(ConstantValue::Js(constant)) = constant_of(graph.node(id)) {
            return match constant {
                FrozenValue::Boolean(value) => self.b.i32(*value as i32),
                _ => {
                    self.terminate(ExitKind::BadType);
                    self.b.i32(0)
                }
            };
        }
        if self.cached(id, Repr::JsValue).is_none() {
            self.missing(edge, Repr::Boolean);
        }
        let boxed = self.boxed(id);
        self.type_check(id, SpeculatedType::BOOLEAN, ExitKind::BadType, Some(boxed), |cx| {
            let is = cx.is_boolean(boxed);
            cx.b.icmp_imm(IntCC::Eq, is, 0)
        });
        let value = self.b.icmp_imm(IntCC::Eq, boxed, VALUE_TRUE as i64);
        self.set_value(id, Repr::Boolean, value);
        value
    }

    /// Boxed value of an edge after the check its use kind demands.
    pub(crate) fn lower_js_value(&mut self, edge: Edge) -> Value {
        let value = self.boxed(edge.node);
        self.speculate_edge(edge, value);
        value
    }

    /// Boxed value of a cell edge.
    pub(crate) fn lower_cell(&mut self, edge: Edge) -> Value {
        if !edge.use_kind.is_cell() {
            self.crash(format_args!("{} used as a cell through {:?}", edge.node, edge.use_kind));
        }
        self.lower_js_value(edge)
    }

    /// Storage pointer of an edge.
    pub(crate) fn lower_storage(&mut self, edge: Edge) -> Value {
        match self.cached(edge.node, Repr::Storage) {
            Some(value) => value,
            None => self.missing(edge, Repr::Storage),
        }
    }

    /// Storage pointer if the edge produced one, otherwise the boxed cell.
    pub(crate) fn lower_storage_or_cell(&mut self, edge: Edge) -> Value {
        if self.graph.node(edge.node).result == NodeResult::Storage {
            self.lower_storage(edge)
        } else {
            self.lower_js_value(edge)
        }
    }

    /// Box whatever representation `id` has, without speculation.
    pub(crate) fn boxed(&mut self, id: NodeId) -> Value {
        if let Some(value) = self.cached(id, Repr::JsValue) {
            return value;
        }
        let graph = self.graph;
        let value = if let Some(constant) = constant_of(graph.node(id)) {
            let bits = match constant {
                ConstantValue::Js(value) => box_frozen(value),
                ConstantValue::Double(value) => crate::value::box_number(value),
                ConstantValue::Int52(value) => crate::value::box_int52(value),
            };
            self.b.i64(bits as i64)
        } else if let Some(value) = self.cached(id, Repr::Int32) {
            self.box_int32(value)
        } else if let Some(value) = self.cached(id, Repr::Boolean) {
            self.box_boolean(value)
        } else if let Some(value) = self.cached(id, Repr::Double) {
            let impure = self.state.for_node(id).ty.could_be_impure_nan();
            self.box_double(value, impure)
        } else if self.cached(id, Repr::StrictInt52).is_some() || self.cached(id, Repr::Int52).is_some() {
            let strict = self.lower_strict_int52(Edge::untyped(id));
            self.box_strict_int52(id, strict)
        } else {
            self.crash(format_args!("{id} has no value to box"))
        };
        self.set_value(id, Repr::JsValue, value);
        value
    }

    pub(crate) fn box_int32(&mut self, value: Value) -> Value {
        let wide = self.b.zext(value);
        self.b.or_imm(wide, TAG_TYPE_NUMBER as i64)
    }

    pub(crate) fn box_boolean(&mut self, value: Value) -> Value {
        let wide = self.b.zext(value);
        self.b.or_imm(wide, VALUE_FALSE as i64)
    }

    pub(crate) fn box_double(&mut self, value: Value, could_be_impure_nan: bool) -> Value {
        let bits = self.b.bitcast_to_int(value);
        let bits = if could_be_impure_nan {
            let nan = self.b.fcmp(FloatCC::Unordered, value, value);
            let pure = self.b.i64(strata_ir::PURE_NAN_BITS as i64);
            self.b.select(nan, pure, bits)
        } else {
            bits
        };
        self.b.add_imm(bits, DOUBLE_ENCODE_OFFSET as i64)
    }

    /// Unbox a value known to be a double.
    pub(crate) fn unbox_double(&mut self, boxed: Value) -> Value {
        let bits = self.b.add_imm(boxed, DOUBLE_ENCODE_OFFSET.wrapping_neg() as i64);
        self.b.bitcast_to_double(bits)
    }

    /// Box an int52: a pure conversion when it is proven to fit in an int32,
    /// otherwise the helper picks the int32 or double encoding.
    pub(crate) fn box_strict_int52(&mut self, id: NodeId, strict: Value) -> Value {
        if self.state.for_node(id).is_type(SpeculatedType::INT32) {
            let narrow = self.b.trunc(strict);
            return self.box_int32(narrow);
        }
        self.call_helper(HelperKind::BoxInt52, &[strict])
    }

    /// Unboxed number of a boxed value proven to be a number.
    pub(crate) fn unbox_number(&mut self, id: NodeId, boxed: Value) -> Value {
        let ty = self.state.for_node(id).ty;
        if ty.is_subset_of(SpeculatedType::INT32) {
            let narrow = self.b.trunc(boxed);
            return self.b.int_to_double(true, narrow);
        }
        if !ty.overlaps(SpeculatedType::INT32) {
            return self.unbox_double(boxed);
        }
        let is_int = self.is_int32(boxed);
        self.diamond(
            Type::F64,
            is_int,
            BranchWeight::Normal,
            |cx| {
                let narrow = cx.b.trunc(boxed);
                cx.b.int_to_double(true, narrow)
            },
            |cx| cx.unbox_double(boxed),
        )
    }
}

/// `I32` 1 when the double is not an integer in int52 range (or is -0).
pub(crate) fn double_is_not_int52(cx: &mut LowerCx<'_>, value: Value) -> Value {
    let integer = cx.b.double_to_int(Type::I64, value);
    let back = cx.b.int_to_double(true, integer);
    let lossy = cx.b.fcmp(FloatCC::Ne, back, value);
    let biased = cx.b.add_imm(integer, -crate::value::INT52_MIN);
    let out_of_range = cx.b.icmp_imm(IntCC::Ugt, biased, crate::value::INT52_MAX - crate::value::INT52_MIN);
    let zero = cx.b.icmp_imm(IntCC::Eq, integer, 0);
    let bits = cx.b.bitcast_to_int(value);
    let negative = cx.b.icmp_imm(IntCC::Slt, bits, 0);
    let negative_zero = cx.b.and(zero, negative);
    let bad = cx.b.or(lossy, out_of_range);
    cx.b.or(bad, negative_zero)
}

// ---- plumbing ----

/// `Identity`: alias the child.
pub(crate) fn identity(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = match node.result {
        NodeResult::Int32 => cx.lower_int32(edge),
        NodeResult::Int52 => cx.lower_strict_int52(edge),
        NodeResult::Double => cx.lower_double(edge),
        NodeResult::Boolean => cx.lower_boolean(edge),
        NodeResult::Storage => cx.lower_storage(edge),
        NodeResult::Cell | NodeResult::JsValue => cx.lower_js_value(edge),
        NodeResult::None => return,
    };
    cx.set_result(id, value);
}

/// `Check` and `Phantom`: perform the checks of every typed edge.
pub(crate) fn discharge_edges(cx: &mut LowerCx<'_>, node: &Node) {
    for edge in super::edges(node) {
        if edge.use_kind == UseKind::Untyped || edge.use_kind.is_proven() {
            continue;
        }
        if !cx.values.has_any(edge.node) && constant_of(cx.graph.node(edge.node)).is_none() {
            // Exit-only nodes are never computed.
            continue;
        }
        match edge.use_kind {
            UseKind::Int32 if cx.cached(edge.node, Repr::Int32).is_some() => {}
            UseKind::Int52Rep => {
                cx.lower_strict_int52(edge);
            }
            UseKind::DoubleRep | UseKind::DoubleRepReal | UseKind::DoubleRepMachineInt => {
                cx.lower_double(edge);
            }
            UseKind::Boolean if cx.cached(edge.node, Repr::Boolean).is_some() => {}
            _ => {
                cx.lower_js_value(edge);
            }
        }
    }
}

// ---- representation changes ----

/// `DoubleRep`: unbox a number (or `NotCell` value) to a double.
pub(crate) fn double_rep(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = match edge.use_kind {
        UseKind::Int52Rep => {
            let strict = cx.lower_strict_int52(edge);
            cx.b.int_to_double(true, strict)
        }
        UseKind::Int32 | UseKind::KnownInt32 if cx.cached(edge.node, Repr::Int32).is_some() => {
            let narrow = cx.lower_int32(edge);
            cx.b.int_to_double(true, narrow)
        }
        UseKind::NotCell => {
            let boxed = cx.lower_js_value(edge);
            not_cell_to_double(cx, edge.node, boxed)
        }
        UseKind::Number | UseKind::RealNumber | UseKind::Int32 | UseKind::KnownInt32 => {
            let boxed = cx.lower_js_value(edge);
            cx.unbox_number(edge.node, boxed)
        }
        other => cx.crash(format_args!("DoubleRep through {other:?}")),
    };
    cx.set_result(id, value);
}

/// ToNumber of a value that is not a cell: numbers unbox, `true` is 1,
/// `false` and `null` are 0, `undefined` is NaN.
fn not_cell_to_double(cx: &mut LowerCx<'_>, id: NodeId, boxed: Value) -> Value {
    if cx.state.for_node(id).is_type(SpeculatedType::BYTECODE_NUMBER) {
        return cx.unbox_number(id, boxed);
    }
    let is_number = cx.is_number(boxed);
    cx.diamond(
        Type::F64,
        is_number,
        BranchWeight::Normal,
        |cx| cx.unbox_number(id, boxed),
        |cx| {
            let is_true = cx.b.icmp_imm(IntCC::Eq, boxed, VALUE_TRUE as i64);
            let is_false = cx.b.icmp_imm(IntCC::Eq, boxed, VALUE_FALSE as i64);
            let is_null = cx.b.icmp_imm(IntCC::Eq, boxed, VALUE_NULL as i64);
            let zeroish = cx.b.or(is_false, is_null);
            let one = cx.b.f64(1.0);
            let zero = cx.b.f64(0.0);
            let nan = cx.b.f64(f64::NAN);
            let otherwise = cx.b.select(zeroish, zero, nan);
            cx.b.select(is_true, one, otherwise)
        },
    )
}

/// `ValueRep`: box an unboxed number.
pub(crate) fn value_rep(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = match edge.use_kind {
        UseKind::DoubleRep | UseKind::DoubleRepReal | UseKind::DoubleRepMachineInt => {
            let double = cx.lower_double(edge);
            let impure = cx.state.for_node(edge.node).ty.could_be_impure_nan();
            cx.box_double(double, impure)
        }
        UseKind::Int52Rep => {
            let strict = cx.lower_strict_int52(edge);
            cx.box_strict_int52(edge.node, strict)
        }
        UseKind::Int32 | UseKind::KnownInt32 => {
            let narrow = cx.lower_int32(edge);
            cx.box_int32(narrow)
        }
        UseKind::Boolean | UseKind::KnownBoolean => {
            let flag = cx.lower_boolean(edge);
            cx.box_boolean(flag)
        }
        other => cx.crash(format_args!("ValueRep through {other:?}")),
    };
    cx.set_result(id, value);
}

/// `Int52Rep`: produce a strict int52.
pub(crate) fn int52_rep(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = match edge.use_kind {
        UseKind::Int32 | UseKind::KnownInt32 => {
            let narrow = cx.lower_int32(edge);
            cx.b.sext(narrow)
        }
        UseKind::DoubleRepMachineInt => {
            let double = cx.lower_double(edge);
            cx.b.double_to_int(Type::I64, double)
        }
        UseKind::MachineInt => {
            let boxed = cx.lower_js_value(edge);
            boxed_to_int52(cx, edge.node, boxed)
        }
        other => cx.crash(format_args!("Int52Rep through {other:?}")),
    };
    cx.set_result(id, value);
}

fn boxed_to_int52(cx: &mut LowerCx<'_>, id: NodeId, boxed: Value) -> Value {
    if cx.state.for_node(id).is_type(SpeculatedType::INT32) {
        let narrow = cx.b.trunc(boxed);
        return cx.b.sext(narrow);
    }
    let is_int = cx.is_int32(boxed);
    cx.diamond(
        Type::I64,
        is_int,
        BranchWeight::Normal,
        |cx| {
            let narrow = cx.b.trunc(boxed);
            cx.b.sext(narrow)
        },
        |cx| {
            let double = cx.unbox_double(boxed);
            let bits = cx.b.bitcast_to_int(double);
            let converted = cx.call_helper(HelperKind::ConvertDoubleToInt52, &[bits]);
            let not_int52 = cx.b.icmp_imm(IntCC::Eq, converted, crate::helpers::NOT_INT52);
            cx.speculate(ExitKind::BadType, Some(boxed), not_int52);
            converted
        },
    )
}

/// `BooleanToNumber`.
pub(crate) fn boolean_to_number(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    match edge.use_kind {
        UseKind::Boolean | UseKind::KnownBoolean => {
            let flag = cx.lower_boolean(edge);
            match node.result {
                NodeResult::Int32 => cx.set_result(id, flag),
                _ => {
                    let boxed = cx.box_int32(flag);
                    cx.set_result(id, boxed);
                }
            }
        }
        _ => {
            let boxed = cx.lower_js_value(edge);
            let is_bool = cx.is_boolean(boxed);
            let bit = cx.b.and_imm(boxed, 1);
            let number = cx.b.or_imm(bit, TAG_TYPE_NUMBER as i64);
            let value = cx.b.select(is_bool, number, boxed);
            cx.set_result(id, value);
        }
    }
}

/// `DoubleAsInt32`: speculate that a double is an exact int32.
pub(crate) fn double_as_int32(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArithMode) {
    let double = cx.lower_double(node.child1());
    let value = double_to_int32_exact(cx, double, mode.should_check_negative_zero());
    cx.set_result(id, value);
}

/// Convert a double that must be an exact int32, exiting otherwise.
pub(crate) fn double_to_int32_exact(cx: &mut LowerCx<'_>, double: Value, check_negative_zero: bool) -> Value {
    let narrow = cx.b.double_to_int(Type::I32, double);
    let back = cx.b.int_to_double(true, narrow);
    let lossy = cx.b.fcmp(FloatCC::Ne, back, double);
    cx.speculate(ExitKind::Overflow, None, lossy);
    if check_negative_zero {
        let zero = cx.b.icmp_imm(IntCC::Eq, narrow, 0);
        let bits = cx.b.bitcast_to_int(double);
        let sign = cx.b.icmp_imm(IntCC::Slt, bits, 0);
        let negative_zero = cx.b.and(zero, sign);
        cx.speculate(ExitKind::NegativeZero, None, negative_zero);
    }
    narrow
}

/// `ValueToInt32`: JS ToInt32.
pub(crate) fn value_to_int32(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = match edge.use_kind {
        UseKind::Int32 | UseKind::KnownInt32 => cx.lower_int32(edge),
        UseKind::Int52Rep => {
            let strict = cx.lower_strict_int52(edge);
            cx.b.trunc(strict)
        }
        UseKind::DoubleRep | UseKind::DoubleRepReal | UseKind::DoubleRepMachineInt => {
            let double = cx.lower_double(edge);
            double_to_int32_wrapping(cx, double)
        }
        UseKind::Number | UseKind::NotCell => {
            let boxed = cx.lower_js_value(edge);
            if cx.state.for_node(edge.node).is_type(SpeculatedType::INT32) {
                cx.b.trunc(boxed)
            } else {
                let is_int = cx.is_int32(boxed);
                cx.diamond(
                    Type::I32,
                    is_int,
                    BranchWeight::Normal,
                    |cx| cx.b.trunc(boxed),
                    |cx| {
                        let double = not_cell_to_double(cx, edge.node, boxed);
                        double_to_int32_wrapping(cx, double)
                    },
                )
            }
        }
        _ => {
            let boxed = cx.lower_js_value(edge);
            let result = cx.call_helper(HelperKind::ToInt32, &[boxed]);
            cx.b.trunc(result)
        }
    };
    cx.set_result(id, value);
}

/// JS ToInt32 of a double: truncate in range, otherwise ask the runtime.
pub(crate) fn double_to_int32_wrapping(cx: &mut LowerCx<'_>, double: Value) -> Value {
    let low = cx.b.f64(-2147483648.0);
    let high = cx.b.f64(2147483648.0);
    let above = cx.b.fcmp(FloatCC::Ge, double, low);
    let below = cx.b.fcmp(FloatCC::Lt, double, high);
    let in_range = cx.b.and(above, below);
    cx.diamond(
        Type::I32,
        in_range,
        BranchWeight::NotTakenRare,
        |cx| cx.b.double_to_int(Type::I32, double),
        |cx| {
            let bits = cx.b.bitcast_to_int(double);
            let result = cx.call_helper(HelperKind::DoubleToInt32, &[bits]);
            cx.b.trunc(result)
        },
    )
}

/// `UInt32ToNumber`.
pub(crate) fn uint32_to_number(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArithMode) {
    let narrow = cx.lower_int32(node.child1());
    let value = match node.result {
        NodeResult::Int32 => {
            if mode.should_check_overflow() {
                let negative = cx.b.icmp_imm(IntCC::Slt, narrow, 0);
                cx.speculate(ExitKind::Overflow, None, negative);
            }
            narrow
        }
        NodeResult::Int52 => cx.b.zext(narrow),
        NodeResult::Double => cx.b.int_to_double(false, narrow),
        _ => {
            let double = cx.b.int_to_double(false, narrow);
            cx.box_double(double, false)
        }
    };
    cx.set_result(id, value);
}


#[cfg(test)]
mod tests {
    use crate::config::LoweringOptions;
    use crate::lir::eval::EvalOutcome;
    use crate::testing;
    use crate::value::{box_double, box_int32};
    use strata_ir::{ArithMode, Edge, GraphBuilder, NodeResult, Op, UseKind};

    /// `return (x >>> 0) + 1` with the unsigned value kept as an int52.
    fn uint32_plus_one() -> strata_ir::Graph {
        let mut b = GraphBuilder::new("uint32_plus_one", 2, 0);
        let entry = b.entry();
        let x = testing::get_argument(&mut b, entry, 1);
        let unsigned = b.add(
            entry,
            Op::UInt32ToNumber(ArithMode::CheckOverflow),
            [Edge::new(x, UseKind::Int32)],
            NodeResult::Int52,
        );
        let one = b.add(entry, Op::Int52Constant(1), [], NodeResult::Int52);
        let sum = b.add(
            entry,
            Op::ArithAdd(ArithMode::CheckOverflow),
            [Edge::new(unsigned, UseKind::Int52Rep), Edge::new(one, UseKind::Int52Rep)],
            NodeResult::Int52,
        );
        let boxed = b.add(entry, Op::ValueRep, [Edge::new(sum, UseKind::Int52Rep)], NodeResult::JsValue);
        b.add(entry, Op::Return, [Edge::untyped(boxed)], NodeResult::None);
        b.build().expect("valid graph")
    }

    #[test]
    fn unsigned_int52_feeds_int52_arithmetic() {
        let lowered = testing::lower_default(&uint32_plus_one(), &LoweringOptions::default());
        assert_eq!(lowered.stats.unreachable_blocks, 0);
        assert_eq!(testing::run(&lowered, &[box_int32(5)]), EvalOutcome::Returned(box_int32(6)));
        assert_eq!(
            testing::run(&lowered, &[box_int32(-1)]),
            EvalOutcome::Returned(box_double(4_294_967_296.0))
        );
    }
}
