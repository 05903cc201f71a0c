//! Comparisons, truthiness and type queries.

use strata_ir::{CellType, Edge, Node, NodeId, Op, SpeculatedType, TypeInfoFlags, UseKind};

use super::LowerCx;
use crate::helpers::HelperKind;
use crate::lir::{BranchWeight, FloatCC, IntCC, Type, Value};
use crate::object_layout::FieldKind;
use crate::value::{VALUE_NULL, VALUE_TRUE, VALUE_UNDEFINED};

fn both(node: &Node, kind: UseKind) -> bool {
    node.child1().use_kind == kind && node.child2().use_kind == kind
}

fn both_in(node: &Node, kinds: &[UseKind]) -> bool {
    kinds.contains(&node.child1().use_kind) && kinds.contains(&node.child2().use_kind)
}

const INT32_KINDS: &[UseKind] = &[UseKind::Int32, UseKind::KnownInt32];
const DOUBLE_KINDS: &[UseKind] = &[UseKind::DoubleRep, UseKind::DoubleRepReal, UseKind::DoubleRepMachineInt];
const BOOLEAN_KINDS: &[UseKind] = &[UseKind::Boolean, UseKind::KnownBoolean];
const OBJECT_KINDS: &[UseKind] = &[UseKind::Object, UseKind::Function, UseKind::FinalObject];

/// `<`, `<=`, `>` and `>=`.
pub(crate) fn relational(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let (int_cc, float_cc, helper) = match node.op {
        Op::CompareLess => (IntCC::Slt, FloatCC::Lt, HelperKind::CompareLess),
        Op::CompareLessEq => (IntCC::Sle, FloatCC::Le, HelperKind::CompareLessEq),
        Op::CompareGreater => (IntCC::Sgt, FloatCC::Gt, HelperKind::CompareGreater),
        _ => (IntCC::Sge, FloatCC::Ge, HelperKind::CompareGreaterEq),
    };
    let result = if both_in(node, INT32_KINDS) {
        let lhs = cx.lower_int32(node.child1());
        let rhs = cx.lower_int32(node.child2());
        cx.b.icmp(int_cc, lhs, rhs)
    } else if both(node, UseKind::Int52Rep) {
        let lhs = cx.lower_strict_int52(node.child1());
        let rhs = cx.lower_strict_int52(node.child2());
        cx.b.icmp(int_cc, lhs, rhs)
    } else if both_in(node, DOUBLE_KINDS) {
        let lhs = cx.lower_double(node.child1());
        let rhs = cx.lower_double(node.child2());
        cx.b.fcmp(float_cc, lhs, rhs)
    } else {
        let lhs = cx.lower_js_value(node.child1());
        let rhs = cx.lower_js_value(node.child2());
        let result = cx.call_helper(helper, &[lhs, rhs]);
        cx.b.trunc(result)
    };
    cx.set_result(id, result);
}

/// `==` and `===`.
pub(crate) fn equality(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let strict = matches!(node.op, Op::CompareStrictEq);
    let (left, right) = (node.child1(), node.child2());
    let result = if both_in(node, INT32_KINDS) {
        let lhs = cx.lower_int32(left);
        let rhs = cx.lower_int32(right);
        cx.b.icmp(IntCC::Eq, lhs, rhs)
    } else if both(node, UseKind::Int52Rep) {
        let lhs = cx.lower_strict_int52(left);
        let rhs = cx.lower_strict_int52(right);
        cx.b.icmp(IntCC::Eq, lhs, rhs)
    } else if both_in(node, DOUBLE_KINDS) {
        let lhs = cx.lower_double(left);
        let rhs = cx.lower_double(right);
        cx.b.fcmp(FloatCC::Eq, lhs, rhs)
    } else if both_in(node, BOOLEAN_KINDS) {
        let lhs = cx.lower_boolean(left);
        let rhs = cx.lower_boolean(right);
        cx.b.icmp(IntCC::Eq, lhs, rhs)
    } else if both(node, UseKind::StringIdent) {
        // Identifiers are atomized: equal contents share one impl.
        let lhs = cx.lower_js_value(left);
        let rhs = cx.lower_js_value(right);
        let offset = cx.layout.field_offset(FieldKind::StringImpl);
        let lhs = cx.b.load64(lhs, offset);
        let rhs = cx.b.load64(rhs, offset);
        cx.b.icmp(IntCC::Eq, lhs, rhs)
    } else if both_in(node, &[UseKind::String, UseKind::KnownString, UseKind::StringIdent]) {
        let lhs = cx.lower_js_value(left);
        let rhs = cx.lower_js_value(right);
        let same = cx.b.icmp(IntCC::Eq, lhs, rhs);
        cx.diamond(
            Type::I32,
            same,
            BranchWeight::Normal,
            |cx| cx.b.i32(1),
            |cx| {
                let result = cx.call_helper(HelperKind::StringEq, &[lhs, rhs]);
                cx.b.trunc(result)
            },
        )
    } else if both_in(node, OBJECT_KINDS) || (strict && identity_comparable(left, right)) {
        let lhs = cx.lower_js_value(left);
        let rhs = cx.lower_js_value(right);
        cx.b.icmp(IntCC::Eq, lhs, rhs)
    } else {
        let lhs = cx.lower_js_value(left);
        let rhs = cx.lower_js_value(right);
        let helper = if strict {
            HelperKind::CompareStrictEq
        } else {
            HelperKind::CompareEq
        };
        let result = cx.call_helper(helper, &[lhs, rhs]);
        cx.b.trunc(result)
    };
    cx.set_result(id, result);
}

/// Strict equality against one of these sides is a bit comparison.
fn identity_comparable(left: Edge, right: Edge) -> bool {
    let exact = |kind: UseKind| {
        matches!(
            kind,
            UseKind::Object
                | UseKind::Function
                | UseKind::FinalObject
                | UseKind::Misc
                | UseKind::Other
                | UseKind::Boolean
                | UseKind::KnownBoolean
        )
    };
    exact(left.use_kind) || exact(right.use_kind)
}

/// `value == null` (also true for `undefined` and objects masquerading as
/// undefined).
pub(crate) fn eq_null(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = cx.lower_js_value(edge);
    let result = undefined_like(cx, edge.node, value, false);
    cx.set_result(id, result);
}

/// `I32` flag: the value is `undefined` (or `null` unless `exact`) or an
/// object masquerading as undefined.
fn undefined_like(cx: &mut LowerCx<'_>, id: NodeId, value: Value, exact: bool) -> Value {
    let plain = |cx: &mut LowerCx<'_>| {
        if exact {
            cx.b.icmp_imm(IntCC::Eq, value, VALUE_UNDEFINED as i64)
        } else {
            cx.is_other(value)
        }
    };
    let ty = cx.state.for_node(id).ty;
    if !ty.overlaps(SpeculatedType::OBJECT_OTHER) {
        return plain(cx);
    }
    let is_cell = cx.is_cell(value);
    cx.diamond(
        Type::I32,
        is_cell,
        BranchWeight::Normal,
        |cx| {
            let flags = cx.b.load8(value, cx.layout.field_offset(FieldKind::TypeInfoFlags));
            let masquerades = cx.b.and_imm(flags, TypeInfoFlags::MASQUERADES_AS_UNDEFINED as i64);
            cx.b.icmp_imm(IntCC::Ne, masquerades, 0)
        },
        plain,
    )
}

/// `!value`.
pub(crate) fn logical_not(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let truthy = truthiness(cx, node.child1());
    let result = cx.b.icmp_imm(IntCC::Eq, truthy, 0);
    cx.set_result(id, result);
}

/// `I32` truthiness of an edge.
pub(crate) fn truthiness(cx: &mut LowerCx<'_>, edge: Edge) -> Value {
    match edge.use_kind {
        UseKind::Boolean | UseKind::KnownBoolean => cx.lower_boolean(edge),
        UseKind::Int32 | UseKind::KnownInt32 => {
            let value = cx.lower_int32(edge);
            cx.b.icmp_imm(IntCC::Ne, value, 0)
        }
        UseKind::Int52Rep => {
            let value = cx.lower_strict_int52(edge);
            cx.b.icmp_imm(IntCC::Ne, value, 0)
        }
        UseKind::DoubleRep | UseKind::DoubleRepReal | UseKind::DoubleRepMachineInt => {
            let value = cx.lower_double(edge);
            double_truthiness(cx, value)
        }
        UseKind::Object | UseKind::Function | UseKind::FinalObject => {
            cx.lower_js_value(edge);
            cx.b.i32(1)
        }
        UseKind::ObjectOrOther => {
            let value = cx.lower_js_value(edge);
            cx.is_cell(value)
        }
        UseKind::String | UseKind::KnownString | UseKind::StringIdent => {
            let value = cx.lower_js_value(edge);
            string_truthiness(cx, value)
        }
        _ => {
            let value = cx.lower_js_value(edge);
            generic_truthiness(cx, edge.node, value)
        }
    }
}

fn double_truthiness(cx: &mut LowerCx<'_>, value: Value) -> Value {
    let zero = cx.b.f64(0.0);
    let is_zero = cx.b.fcmp(FloatCC::Eq, value, zero);
    let ordered = cx.b.fcmp(FloatCC::Eq, value, value);
    let non_zero = cx.b.icmp_imm(IntCC::Eq, is_zero, 0);
    cx.b.and(ordered, non_zero)
}

fn string_truthiness(cx: &mut LowerCx<'_>, string: Value) -> Value {
    let imp = cx.b.load64(string, cx.layout.field_offset(FieldKind::StringImpl));
    let rope = cx.b.icmp_imm(IntCC::Eq, imp, 0);
    cx.diamond(
        Type::I32,
        rope,
        BranchWeight::TakenRare,
        |cx| {
            // Ropes are never empty.
            cx.b.i32(1)
        },
        |cx| {
            let length = cx.b.load32(imp, cx.layout.field_offset(FieldKind::StringImplLength));
            cx.b.icmp_imm(IntCC::Ne, length, 0)
        },
    )
}

fn generic_truthiness(cx: &mut LowerCx<'_>, id: NodeId, value: Value) -> Value {
    let ty = cx.state.for_node(id).ty;
    if ty.is_subset_of(SpeculatedType::BOOLEAN) {
        return cx.b.icmp_imm(IntCC::Eq, value, VALUE_TRUE as i64);
    }
    if ty.is_subset_of(SpeculatedType::INT32) {
        let narrow = cx.b.trunc(value);
        return cx.b.icmp_imm(IntCC::Ne, narrow, 0);
    }
    if ty.is_subset_of(SpeculatedType::OTHER) {
        return cx.b.i32(0);
    }
    let is_boolean = cx.is_boolean(value);
    cx.diamond(
        Type::I32,
        is_boolean,
        BranchWeight::Normal,
        |cx| cx.b.icmp_imm(IntCC::Eq, value, VALUE_TRUE as i64),
        |cx| {
            let is_int = cx.is_int32(value);
            cx.diamond(
                Type::I32,
                is_int,
                BranchWeight::Normal,
                |cx| {
                    let narrow = cx.b.trunc(value);
                    cx.b.icmp_imm(IntCC::Ne, narrow, 0)
                },
                |cx| {
                    let result = cx.call_helper(HelperKind::ToBoolean, &[value]);
                    cx.b.trunc(result)
                },
            )
        },
    )
}

/// `IsUndefined`, `IsBoolean`, `IsNumber`, `IsString`, `IsObject`,
/// `IsObjectOrNull`, `IsFunction` and `IsArrayObject`.
pub(crate) fn type_query(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = cx.lower_js_value(edge);
    let result = match node.op {
        Op::IsUndefined => undefined_like(cx, edge.node, value, true),
        Op::IsBoolean => cx.is_boolean(value),
        Op::IsNumber => cx.is_number(value),
        Op::IsString => cell_query(cx, value, |cx, cell| cx.has_cell_type(cell, CellType::String)),
        Op::IsFunction => cell_query(cx, value, |cx, cell| cx.has_cell_type(cell, CellType::Function)),
        Op::IsArrayObject => {
            if edge.use_kind.is_cell() {
                cx.has_cell_type(value, CellType::Array)
            } else {
                cell_query(cx, value, |cx, cell| cx.has_cell_type(cell, CellType::Array))
            }
        }
        Op::IsObject => cell_query(cx, value, plain_object),
        _ => {
            let null = cx.b.icmp_imm(IntCC::Eq, value, VALUE_NULL as i64);
            let object = cell_query(cx, value, plain_object);
            cx.b.or(null, object)
        }
    };
    cx.set_result(id, result);
}

/// `typeof value == "object"` for a cell: an object that is not callable
/// and does not masquerade as undefined.
fn plain_object(cx: &mut LowerCx<'_>, cell: Value) -> Value {
    let tag = cx.cell_tag(cell);
    let object = cx.is_object_tag(tag);
    let function = cx.layout.type_of(CellType::Function) as i64;
    let callable = cx.b.icmp_imm(IntCC::Eq, tag, function);
    let flags = cx.b.load8(cell, cx.layout.field_offset(FieldKind::TypeInfoFlags));
    let masquerades = cx.b.and_imm(flags, TypeInfoFlags::MASQUERADES_AS_UNDEFINED as i64);
    let not_callable = cx.b.icmp_imm(IntCC::Eq, callable, 0);
    let visible = cx.b.icmp_imm(IntCC::Eq, masquerades, 0);
    let result = cx.b.and(object, not_callable);
    cx.b.and(result, visible)
}

/// Run `query` when the value is a cell, 0 otherwise.
fn cell_query(cx: &mut LowerCx<'_>, value: Value, query: impl FnOnce(&mut LowerCx<'_>, Value) -> Value) -> Value {
    let is_cell = cx.is_cell(value);
    cx.diamond(
        Type::I32,
        is_cell,
        BranchWeight::Normal,
        |cx| query(cx, value),
        |cx| cx.b.i32(0),
    )
}

/// `typeof value`.
pub(crate) fn type_of(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let value = cx.lower_js_value(node.child1());
    let result = cx.call_helper(HelperKind::TypeOf, &[value]);
    cx.set_result(id, result);
}
