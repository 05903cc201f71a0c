//! Indexed access: array shape checks, element loads and stores, strings,
//! typed arrays, arguments objects and array allocation.
//!
//! Every access follows the same order: bounds check, then hole check for
//! butterfly storage, then the load. An in-bounds access of a mode proven
//! dense skips the hole check.

use strata_ir::{
    ArrayMode, ArraySpeculation, ArrayType, Edge, FrozenValue, IndexingType, NewArrayData,
    Node, NodeId, NodeResult, PURE_NAN_BITS, SpeculatedType, TypedArrayType, UseKind,
};

use super::objects::{allocate_butterfly, allocate_cell, initialize_header, structure};
use super::values::double_to_int32_wrapping;
use super::LowerCx;
use crate::abi;
use crate::abstract_state::{array_mode_cell_type, array_mode_type};
use crate::exit::ExitKind;
use crate::helpers::HelperKind;
use crate::lir::{BranchWeight, FloatCC, IntCC, MemWidth, Type, Value};
use crate::object_layout::{FieldKind, string_flags};
use crate::value::{VALUE_EMPTY, VALUE_UNDEFINED, box_frozen};

// ---- checks ----

/// Children are `index, length`.
pub(crate) fn check_in_bounds(cx: &mut LowerCx<'_>, node: &Node) {
    let index = cx.lower_int32(node.child1());
    let length = cx.lower_int32(node.child2());
    let out = cx.b.icmp(IntCC::Uge, index, length);
    cx.speculate(ExitKind::OutOfBounds, None, out);
}

pub(crate) fn check_array(cx: &mut LowerCx<'_>, node: &Node, mode: ArrayMode) {
    let edge = node.child1();
    let Some(ty) = array_mode_type(mode) else {
        cx.lower_js_value(edge);
        cx.terminate(ExitKind::InadequateCoverage);
        return;
    };
    if mode.array_type == ArrayType::Generic {
        cx.lower_js_value(edge);
        return;
    }
    let cell = cx.lower_cell(edge);
    if array_check_is_redundant(cx, edge, mode, ty) {
        cx.stats.checks_elided += 1;
        return;
    }
    let failing = match mode.indexing_shape() {
        Some(shape) => {
            let indexing = cx.b.load8(cell, cx.layout.field_offset(FieldKind::IndexingType));
            if mode.is_array {
                let bits = cx.b.and_imm(indexing, (IndexingType::SHAPE_MASK | IndexingType::IS_ARRAY) as i64);
                cx.b.icmp_imm(IntCC::Ne, bits, (shape | IndexingType::IS_ARRAY) as i64)
            } else {
                let bits = cx.b.and_imm(indexing, IndexingType::SHAPE_MASK as i64);
                cx.b.icmp_imm(IntCC::Ne, bits, shape as i64)
            }
        }
        None => match array_mode_cell_type(mode) {
            Some(cell_type) => {
                let matches = cx.has_cell_type(cell, cell_type);
                cx.b.icmp_imm(IntCC::Eq, matches, 0)
            }
            None => cx.crash(format_args!("no check for array mode {mode:?}")),
        },
    };
    cx.speculate(ExitKind::BadIndexingType, Some(cell), failing);
}

fn array_check_is_redundant(cx: &LowerCx<'_>, edge: Edge, mode: ArrayMode, ty: SpeculatedType) -> bool {
    let known = cx.state.for_node(edge.node);
    if !known.ty.is_subset_of(ty) {
        return false;
    }
    let Some(shape) = mode.indexing_shape() else {
        return true;
    };
    match &known.structures {
        crate::abstract_value::StructureAbstractValue::Known(set) if !set.is_empty() => set.iter().all(|id| {
            cx.graph
                .structures
                .get(id)
                .is_some_and(|s| s.indexing.shape() == shape && (!mode.is_array || s.indexing.is_array()))
        }),
        _ => false,
    }
}

// ---- shared plumbing ----

/// Butterfly of `base`, taken from an explicit storage child when present.
fn butterfly_of(cx: &mut LowerCx<'_>, base: Value, storage: Option<Edge>) -> Value {
    match storage {
        Some(edge) if cx.graph.node(edge.node).result == NodeResult::Storage => cx.lower_storage(edge),
        _ => cx.b.load64(base, cx.layout.field_offset(FieldKind::Butterfly)),
    }
}

/// `storage + (index << shift)`; `index` is an `I32` already bounds-checked.
fn element_address(cx: &mut LowerCx<'_>, storage: Value, index: Value, shift: i64) -> Value {
    let wide = cx.b.zext(index);
    let scaled = cx.b.shl_imm(wide, shift);
    cx.b.add(storage, scaled)
}

fn public_length(cx: &mut LowerCx<'_>, butterfly: Value) -> Value {
    cx.b.load32(butterfly, cx.layout.field_offset(FieldKind::PublicLength))
}

fn vector_length(cx: &mut LowerCx<'_>, butterfly: Value) -> Value {
    cx.b.load32(butterfly, cx.layout.field_offset(FieldKind::VectorLength))
}

fn set_public_length(cx: &mut LowerCx<'_>, butterfly: Value, length: Value) {
    cx.b.store(MemWidth::W32, length, butterfly, cx.layout.field_offset(FieldKind::PublicLength));
}

/// The NaN marking a hole in double storage.
fn double_hole(cx: &mut LowerCx<'_>) -> Value {
    let bits = cx.b.i64(PURE_NAN_BITS as i64);
    cx.b.bitcast_to_double(bits)
}

/// Exit unless `index < length`.
fn speculate_in_bounds(cx: &mut LowerCx<'_>, index: Value, length: Value) {
    let out = cx.b.icmp(IntCC::Uge, index, length);
    cx.speculate(ExitKind::OutOfBounds, None, out);
}

/// Fail when a direct arguments object has left its fast mode.
fn speculate_unmapped(cx: &mut LowerCx<'_>, arguments: Value) {
    let mapped = cx.b.load64(arguments, cx.layout.field_offset(FieldKind::DirectArgumentsMapped));
    let exotic = cx.b.icmp_imm(IntCC::Ne, mapped, 0);
    cx.speculate(ExitKind::ExoticObjectMode, None, exotic);
}

/// Record a loaded element in whatever representation the node produces.
fn set_element(cx: &mut LowerCx<'_>, id: NodeId, value: Value, loaded: Loaded) {
    let result = cx.graph.node(id).result;
    let value = match (loaded, result) {
        (Loaded::Boxed, NodeResult::Int32) => cx.b.trunc(value),
        (Loaded::Boxed, _) => value,
        (Loaded::Double, NodeResult::Double) => value,
        (Loaded::Double, _) => cx.box_double(value, false),
        (Loaded::Int32, NodeResult::Int32) => value,
        (Loaded::Int32, NodeResult::Double) => cx.b.int_to_double(true, value),
        (Loaded::Int32, _) => cx.box_int32(value),
    };
    cx.set_result(id, value);
}

#[derive(Debug, Clone, Copy)]
enum Loaded {
    Boxed,
    Double,
    Int32,
}

// ---- lengths ----

/// Children are `base` and optionally its storage.
pub(crate) fn get_array_length(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArrayMode) {
    let base = cx.lower_cell(node.child1());
    let length = match mode.array_type {
        ArrayType::Int32 | ArrayType::Double | ArrayType::Contiguous => {
            let butterfly = butterfly_of(cx, base, node.children.get(1).copied());
            let length = public_length(cx, butterfly);
            let too_long = cx.b.icmp_imm(IntCC::Slt, length, 0);
            cx.speculate(ExitKind::Uncountable, None, too_long);
            length
        }
        ArrayType::String => {
            let imp = cx.b.load64(base, cx.layout.field_offset(FieldKind::StringImpl));
            let rope = cx.b.icmp_imm(IntCC::Eq, imp, 0);
            cx.speculate(ExitKind::Uncountable, None, rope);
            cx.b.load32(imp, cx.layout.field_offset(FieldKind::StringImplLength))
        }
        ArrayType::DirectArguments => {
            speculate_unmapped(cx, base);
            cx.b.load32(base, cx.layout.field_offset(FieldKind::DirectArgumentsLength))
        }
        ArrayType::TypedArray(_) => cx.b.load32(base, cx.layout.field_offset(FieldKind::TypedArrayLength)),
        other => cx.crash(format_args!("GetArrayLength with {other:?}")),
    };
    cx.set_result(id, length);
}

// ---- loads ----

/// Children are `base, index` and optionally the base's storage.
pub(crate) fn get_by_val(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArrayMode) {
    match mode.array_type {
        ArrayType::Int32 | ArrayType::Contiguous => get_boxed_element(cx, id, node, mode),
        ArrayType::Double => get_double_element(cx, id, node, mode),
        ArrayType::String => {
            let string = cx.lower_cell(node.child1());
            let index = cx.lower_int32(node.child2());
            let code = char_code_at(cx, string, index);
            let wide = code_to_i64(cx, code);
            let character = cx.call_helper(HelperKind::SingleCharacterString, &[wide]);
            cx.set_result(id, character);
        }
        ArrayType::DirectArguments => {
            let arguments = cx.lower_cell(node.child1());
            let index = cx.lower_int32(node.child2());
            speculate_unmapped(cx, arguments);
            let length = cx.b.load32(arguments, cx.layout.field_offset(FieldKind::DirectArgumentsLength));
            speculate_in_bounds(cx, index, length);
            let address = element_address(cx, arguments, index, 3);
            let value = cx.b.load64(address, cx.layout.direct_argument_offset(0));
            set_element(cx, id, value, Loaded::Boxed);
        }
        ArrayType::TypedArray(kind) => {
            let view = cx.lower_cell(node.child1());
            let index = cx.lower_int32(node.child2());
            let length = cx.b.load32(view, cx.layout.field_offset(FieldKind::TypedArrayLength));
            speculate_in_bounds(cx, index, length);
            let vector = cx.b.load64(view, cx.layout.field_offset(FieldKind::TypedArrayVector));
            let (value, loaded) = load_typed_element(cx, id, kind, vector, index);
            set_element(cx, id, value, loaded);
        }
        ArrayType::ScopedArguments | ArrayType::Generic => {
            let base = cx.lower_js_value(node.child1());
            let index = cx.lower_js_value(node.child2());
            let value = cx.call_helper(HelperKind::GetByValGeneric, &[base, index]);
            set_element(cx, id, value, Loaded::Boxed);
        }
        ArrayType::ForceExit => cx.terminate(ExitKind::InadequateCoverage),
    }
}

fn get_boxed_element(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArrayMode) {
    let base = cx.lower_cell(node.child1());
    let index_edge = node.child2();
    let index = cx.lower_int32(index_edge);
    let butterfly = butterfly_of(cx, base, node.children.get(2).copied());
    let length = public_length(cx, butterfly);

    let value = match mode.speculation {
        ArraySpeculation::InBounds => {
            speculate_in_bounds(cx, index, length);
            let address = element_address(cx, butterfly, index, 3);
            let value = cx.b.load64(address, 0);
            if !mode.dense {
                let hole = cx.b.icmp_imm(IntCC::Eq, value, VALUE_EMPTY as i64);
                cx.speculate(ExitKind::LoadFromHole, None, hole);
            }
            value
        }
        ArraySpeculation::SaneChain | ArraySpeculation::OutOfBounds => {
            let sane = mode.speculation == ArraySpeculation::SaneChain;
            let in_bounds = cx.b.icmp(IntCC::Ult, index, length);
            cx.diamond(
                Type::I64,
                in_bounds,
                BranchWeight::Normal,
                |cx| {
                    let address = element_address(cx, butterfly, index, 3);
                    let value = cx.b.load64(address, 0);
                    let hole = cx.b.icmp_imm(IntCC::Eq, value, VALUE_EMPTY as i64);
                    cx.diamond(
                        Type::I64,
                        hole,
                        BranchWeight::TakenRare,
                        |cx| miss(cx, sane, base, index),
                        |_| value,
                    )
                },
                |cx| miss(cx, sane, base, index),
            )
        }
    };
    set_element(cx, id, value, Loaded::Boxed);
}

/// Value of a missing element: `undefined` when the prototype chain is
/// sane, the runtime's answer otherwise.
fn miss(cx: &mut LowerCx<'_>, sane: bool, base: Value, index: Value) -> Value {
    if sane {
        cx.b.i64(VALUE_UNDEFINED as i64)
    } else {
        let boxed = cx.box_int32(index);
        cx.call_helper(HelperKind::GetByValGeneric, &[base, boxed])
    }
}

fn get_double_element(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArrayMode) {
    let base = cx.lower_cell(node.child1());
    let index = cx.lower_int32(node.child2());
    let butterfly = butterfly_of(cx, base, node.children.get(2).copied());
    let length = public_length(cx, butterfly);

    if mode.speculation == ArraySpeculation::InBounds {
        speculate_in_bounds(cx, index, length);
        let address = element_address(cx, butterfly, index, 3);
        let value = cx.b.load(Type::F64, MemWidth::F64, false, address, 0);
        if !mode.dense {
            let hole = cx.b.fcmp(FloatCC::Unordered, value, value);
            cx.speculate(ExitKind::LoadFromHole, None, hole);
        }
        set_element(cx, id, value, Loaded::Double);
        return;
    }

    let sane = mode.speculation == ArraySpeculation::SaneChain;
    let in_bounds = cx.b.icmp(IntCC::Ult, index, length);
    let value = cx.diamond(
        Type::I64,
        in_bounds,
        BranchWeight::Normal,
        |cx| {
            let address = element_address(cx, butterfly, index, 3);
            let value = cx.b.load(Type::F64, MemWidth::F64, false, address, 0);
            let hole = cx.b.fcmp(FloatCC::Unordered, value, value);
            cx.diamond(
                Type::I64,
                hole,
                BranchWeight::TakenRare,
                |cx| miss(cx, sane, base, index),
                |cx| cx.box_double(value, false),
            )
        },
        |cx| miss(cx, sane, base, index),
    );
    set_element(cx, id, value, Loaded::Boxed);
}

fn load_typed_element(
    cx: &mut LowerCx<'_>,
    id: NodeId,
    kind: TypedArrayType,
    vector: Value,
    index: Value,
) -> (Value, Loaded) {
    let shift = kind.element_size().trailing_zeros() as i64;
    let address = element_address(cx, vector, index, shift);
    match kind {
        TypedArrayType::Float32 => (cx.b.load(Type::F64, MemWidth::F32, false, address, 0), Loaded::Double),
        TypedArrayType::Float64 => (cx.b.load(Type::F64, MemWidth::F64, false, address, 0), Loaded::Double),
        TypedArrayType::Uint32 => {
            let raw = cx.b.load32(address, 0);
            if cx.graph.node(id).result == NodeResult::Int32 {
                let negative = cx.b.icmp_imm(IntCC::Slt, raw, 0);
                cx.speculate(ExitKind::Overflow, None, negative);
                (raw, Loaded::Int32)
            } else {
                (cx.b.int_to_double(false, raw), Loaded::Double)
            }
        }
        _ => {
            let width = match kind.element_size() {
                1 => MemWidth::W8,
                2 => MemWidth::W16,
                _ => MemWidth::W32,
            };
            (cx.b.load(Type::I32, width, kind.is_signed(), address, 0), Loaded::Int32)
        }
    }
}

// ---- stores ----

/// Children are `base, index, value` and optionally the base's storage.
pub(crate) fn put_by_val(cx: &mut LowerCx<'_>, node: &Node, mode: ArrayMode) {
    match mode.array_type {
        ArrayType::Int32 | ArrayType::Double | ArrayType::Contiguous => put_butterfly_element(cx, node, mode),
        ArrayType::TypedArray(kind) => {
            let view = cx.lower_cell(node.child1());
            let index = cx.lower_int32(node.child2());
            let value = typed_store_value(cx, node.child3(), kind);
            let length = cx.b.load32(view, cx.layout.field_offset(FieldKind::TypedArrayLength));
            let store = |cx: &mut LowerCx<'_>| {
                let vector = cx.b.load64(view, cx.layout.field_offset(FieldKind::TypedArrayVector));
                let shift = kind.element_size().trailing_zeros() as i64;
                let address = element_address(cx, vector, index, shift);
                let width = match kind {
                    TypedArrayType::Float32 => MemWidth::F32,
                    TypedArrayType::Float64 => MemWidth::F64,
                    _ => match kind.element_size() {
                        1 => MemWidth::W8,
                        2 => MemWidth::W16,
                        _ => MemWidth::W32,
                    },
                };
                cx.b.store(width, value, address, 0);
            };
            if mode.speculation == ArraySpeculation::InBounds {
                speculate_in_bounds(cx, index, length);
                store(cx);
            } else {
                // Out-of-bounds typed array stores are ignored.
                let in_bounds = cx.b.icmp(IntCC::Ult, index, length);
                cx.when(in_bounds, BranchWeight::Normal, store);
            }
        }
        ArrayType::DirectArguments => {
            let arguments = cx.lower_cell(node.child1());
            let index = cx.lower_int32(node.child2());
            let value_edge = node.child3();
            let value = cx.lower_js_value(value_edge);
            speculate_unmapped(cx, arguments);
            let length = cx.b.load32(arguments, cx.layout.field_offset(FieldKind::DirectArgumentsLength));
            speculate_in_bounds(cx, index, length);
            let address = element_address(cx, arguments, index, 3);
            cx.b.store64(value, address, cx.layout.direct_argument_offset(0));
            if cx.state.type_of(value_edge.node).overlaps(SpeculatedType::CELL) {
                cx.write_barrier(arguments);
            }
        }
        ArrayType::String | ArrayType::ScopedArguments | ArrayType::Generic => {
            let base = cx.lower_js_value(node.child1());
            let index = cx.lower_js_value(node.child2());
            let value = cx.lower_js_value(node.child3());
            cx.call_helper(HelperKind::PutByValGeneric, &[base, index, value]);
        }
        ArrayType::ForceExit => cx.terminate(ExitKind::InadequateCoverage),
    }
}

/// Value a typed array stores, converted to the element representation.
/// The edge is an int32, an int52 or a double.
fn typed_store_value(cx: &mut LowerCx<'_>, edge: Edge, kind: TypedArrayType) -> Value {
    let float = kind.is_float();
    match edge.use_kind {
        UseKind::Int32 | UseKind::KnownInt32 => {
            let value = cx.lower_int32(edge);
            if float {
                cx.b.int_to_double(true, value)
            } else if kind == TypedArrayType::Uint8Clamped {
                clamp_int_to_byte(cx, value)
            } else {
                value
            }
        }
        UseKind::Int52Rep => {
            let value = cx.lower_strict_int52(edge);
            if float {
                cx.b.int_to_double(true, value)
            } else if kind == TypedArrayType::Uint8Clamped {
                let double = cx.b.int_to_double(true, value);
                clamp_double_to_byte(cx, double)
            } else {
                cx.b.trunc(value)
            }
        }
        use_kind if use_kind.is_double_rep() => {
            let double = cx.lower_double(edge);
            if float {
                double
            } else if kind == TypedArrayType::Uint8Clamped {
                clamp_double_to_byte(cx, double)
            } else {
                double_to_int32_wrapping(cx, double)
            }
        }
        other => cx.crash(format_args!("typed array store through {other:?}")),
    }
}

fn clamp_int_to_byte(cx: &mut LowerCx<'_>, value: Value) -> Value {
    let zero = cx.b.i32(0);
    let max = cx.b.i32(255);
    let negative = cx.b.icmp_imm(IntCC::Slt, value, 0);
    let low = cx.b.select(negative, zero, value);
    let over = cx.b.icmp_imm(IntCC::Sgt, low, 255);
    cx.b.select(over, max, low)
}

/// Round half to even into `0..=255`; NaN stores 0.
fn clamp_double_to_byte(cx: &mut LowerCx<'_>, value: Value) -> Value {
    let zero = cx.b.f64(0.0);
    let max = cx.b.f64(255.0);
    let above_zero = cx.b.fcmp(FloatCC::Gt, value, zero);
    let low = cx.b.select(above_zero, value, zero);
    let over = cx.b.fcmp(FloatCC::Gt, low, max);
    let clamped = cx.b.select(over, max, low);
    let floor = cx.b.funary(crate::lir::FUnaryOp::Floor, clamped);
    let fraction = cx.b.fbinary(crate::lir::FBinaryOp::Sub, clamped, floor);
    let floor_int = cx.b.double_to_int(Type::I32, floor);
    let half = cx.b.f64(0.5);
    let above_half = cx.b.fcmp(FloatCC::Gt, fraction, half);
    let exactly_half = cx.b.fcmp(FloatCC::Eq, fraction, half);
    let odd = cx.b.and_imm(floor_int, 1);
    let odd = cx.b.icmp_imm(IntCC::Ne, odd, 0);
    let tie_up = cx.b.and(exactly_half, odd);
    let round_up = cx.b.or(above_half, tie_up);
    let plus_one = cx.b.add_imm(floor_int, 1);
    cx.b.select(round_up, plus_one, floor_int)
}

/// Value to store into butterfly storage of `mode`, as the stored word.
fn butterfly_store_value(cx: &mut LowerCx<'_>, edge: Edge, mode: ArrayMode) -> Value {
    match mode.array_type {
        ArrayType::Int32 => {
            let value = cx.lower_int32(edge);
            cx.box_int32(value)
        }
        ArrayType::Double => {
            let value = cx.lower_double(edge);
            // NaN would read back as a hole.
            if cx.state.type_of(edge.node).overlaps(SpeculatedType::DOUBLE_NAN) {
                let nan = cx.b.fcmp(FloatCC::Unordered, value, value);
                cx.speculate(ExitKind::BadType, None, nan);
            }
            value
        }
        _ => cx.lower_js_value(edge),
    }
}

fn store_butterfly_element(cx: &mut LowerCx<'_>, mode: ArrayMode, butterfly: Value, index: Value, value: Value) {
    let address = element_address(cx, butterfly, index, 3);
    let width = if mode.array_type == ArrayType::Double {
        MemWidth::F64
    } else {
        MemWidth::W64
    };
    cx.b.store(width, value, address, 0);
}

fn put_butterfly_element(cx: &mut LowerCx<'_>, node: &Node, mode: ArrayMode) {
    let base = cx.lower_cell(node.child1());
    let index = cx.lower_int32(node.child2());
    let value_edge = node.child3();
    let value = butterfly_store_value(cx, value_edge, mode);
    let butterfly = butterfly_of(cx, base, node.children.get(3).copied());
    let length = public_length(cx, butterfly);

    if mode.speculation == ArraySpeculation::InBounds {
        speculate_in_bounds(cx, index, length);
        store_butterfly_element(cx, mode, butterfly, index, value);
    } else {
        let in_bounds = cx.b.icmp(IntCC::Ult, index, length);
        let store = cx.b.create_block();
        let beyond = cx.b.create_block();
        let join = cx.b.create_block();
        cx.b.branch(in_bounds, store, beyond, BranchWeight::Normal);

        cx.arm_depth += 1;
        cx.b.switch_to(store);
        store_butterfly_element(cx, mode, butterfly, index, value);
        cx.b.jump(join, Vec::new());

        // Appending within capacity grows the public length.
        cx.b.switch_to(beyond);
        let capacity = vector_length(cx, butterfly);
        let fits = cx.b.icmp(IntCC::Ult, index, capacity);
        let append = cx.b.create_block();
        let generic = cx.b.create_block();
        cx.b.branch(fits, append, generic, BranchWeight::Normal);
        cx.b.switch_to(append);
        store_butterfly_element(cx, mode, butterfly, index, value);
        let grown = cx.b.add_imm(index, 1);
        set_public_length(cx, butterfly, grown);
        cx.b.jump(join, Vec::new());
        cx.b.switch_to(generic);
        let boxed_index = cx.box_int32(index);
        let boxed_value = match mode.array_type {
            ArrayType::Double => cx.box_double(value, false),
            _ => value,
        };
        cx.call_helper(HelperKind::PutByValGeneric, &[base, boxed_index, boxed_value]);
        cx.b.jump(join, Vec::new());
        cx.arm_depth -= 1;
        cx.b.switch_to(join);
    }
    if mode.array_type == ArrayType::Contiguous
        && cx.state.type_of(value_edge.node).overlaps(SpeculatedType::CELL)
    {
        cx.write_barrier(base);
    }
}

/// Children are `array, value` and optionally the array's storage.
pub(crate) fn array_push(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArrayMode) {
    let array = cx.lower_cell(node.child1());
    let value_edge = node.child2();
    let value = butterfly_store_value(cx, value_edge, mode);
    let butterfly = butterfly_of(cx, array, node.children.get(2).copied());
    let length = public_length(cx, butterfly);
    let capacity = vector_length(cx, butterfly);
    let fits = cx.b.icmp(IntCC::Ult, length, capacity);
    let result = cx.diamond(
        Type::I64,
        fits,
        BranchWeight::Normal,
        |cx| {
            store_butterfly_element(cx, mode, butterfly, length, value);
            let grown = cx.b.add_imm(length, 1);
            set_public_length(cx, butterfly, grown);
            cx.box_int32(grown)
        },
        |cx| {
            let boxed = match mode.array_type {
                ArrayType::Double => cx.box_double(value, false),
                _ => value,
            };
            cx.call_helper(HelperKind::ArrayPush, &[array, boxed])
        },
    );
    if mode.array_type == ArrayType::Contiguous
        && cx.state.type_of(value_edge.node).overlaps(SpeculatedType::CELL)
    {
        cx.write_barrier(array);
    }
    cx.set_result(id, result);
}

/// Children are `array` and optionally its storage.
pub(crate) fn array_pop(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArrayMode) {
    let array = cx.lower_cell(node.child1());
    let butterfly = butterfly_of(cx, array, node.children.get(1).copied());
    let length = public_length(cx, butterfly);
    let empty = cx.b.icmp_imm(IntCC::Eq, length, 0);
    let double = mode.array_type == ArrayType::Double;
    let result = cx.diamond(
        Type::I64,
        empty,
        BranchWeight::TakenRare,
        |cx| cx.b.i64(VALUE_UNDEFINED as i64),
        |cx| {
            let last = cx.b.add_imm(length, -1);
            let address = element_address(cx, butterfly, last, 3);
            let (value, hole) = if double {
                let value = cx.b.load(Type::F64, MemWidth::F64, false, address, 0);
                let hole = cx.b.fcmp(FloatCC::Unordered, value, value);
                (value, hole)
            } else {
                let value = cx.b.load64(address, 0);
                let hole = cx.b.icmp_imm(IntCC::Eq, value, VALUE_EMPTY as i64);
                (value, hole)
            };
            cx.diamond(
                Type::I64,
                hole,
                BranchWeight::TakenRare,
                |cx| cx.call_helper(HelperKind::ArrayPop, &[array]),
                |cx| {
                    if double {
                        let hole = double_hole(cx);
                        cx.b.store(MemWidth::F64, hole, address, 0);
                    } else {
                        let hole = cx.b.i64(VALUE_EMPTY as i64);
                        cx.b.store64(hole, address, 0);
                    }
                    set_public_length(cx, butterfly, last);
                    if double {
                        cx.box_double(value, false)
                    } else {
                        value
                    }
                },
            )
        },
    );
    cx.set_result(id, result);
}

/// Children are `base, index`.
pub(crate) fn has_indexed_property(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArrayMode) {
    let result = match mode.array_type {
        ArrayType::Int32 | ArrayType::Double | ArrayType::Contiguous => {
            let base = cx.lower_cell(node.child1());
            let index = cx.lower_int32(node.child2());
            let butterfly = butterfly_of(cx, base, node.children.get(2).copied());
            let length = public_length(cx, butterfly);
            let double = mode.array_type == ArrayType::Double;
            if mode.speculation == ArraySpeculation::InBounds {
                speculate_in_bounds(cx, index, length);
                present(cx, butterfly, index, double, base, mode)
            } else {
                let in_bounds = cx.b.icmp(IntCC::Ult, index, length);
                cx.diamond(
                    Type::I32,
                    in_bounds,
                    BranchWeight::Normal,
                    |cx| present(cx, butterfly, index, double, base, mode),
                    |cx| {
                        let boxed = cx.box_int32(index);
                        let result = cx.call_helper(HelperKind::HasIndexedProperty, &[base, boxed]);
                        cx.b.trunc(result)
                    },
                )
            }
        }
        _ => {
            let base = cx.lower_js_value(node.child1());
            let index = cx.lower_js_value(node.child2());
            let result = cx.call_helper(HelperKind::HasIndexedProperty, &[base, index]);
            cx.b.trunc(result)
        }
    };
    cx.set_result(id, result);
}

/// `I32` flag: the in-bounds element is not a hole. Holes ask the runtime
/// unless the access may not see prototype elements.
fn present(cx: &mut LowerCx<'_>, butterfly: Value, index: Value, double: bool, base: Value, mode: ArrayMode) -> Value {
    if mode.dense {
        return cx.b.i32(1);
    }
    let address = element_address(cx, butterfly, index, 3);
    let hole = if double {
        let value = cx.b.load(Type::F64, MemWidth::F64, false, address, 0);
        cx.b.fcmp(FloatCC::Unordered, value, value)
    } else {
        let value = cx.b.load64(address, 0);
        cx.b.icmp_imm(IntCC::Eq, value, VALUE_EMPTY as i64)
    };
    if mode.speculation == ArraySpeculation::SaneChain {
        return cx.b.icmp_imm(IntCC::Eq, hole, 0);
    }
    cx.diamond(
        Type::I32,
        hole,
        BranchWeight::TakenRare,
        |cx| {
            let boxed = cx.box_int32(index);
            let result = cx.call_helper(HelperKind::HasIndexedProperty, &[base, boxed]);
            cx.b.trunc(result)
        },
        |cx| cx.b.i32(1),
    )
}

pub(crate) fn get_indexed_property_storage(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, mode: ArrayMode) {
    let base = cx.lower_cell(node.child1());
    let storage = match mode.array_type {
        ArrayType::String => {
            let imp = cx.b.load64(base, cx.layout.field_offset(FieldKind::StringImpl));
            let rope = cx.b.icmp_imm(IntCC::Eq, imp, 0);
            cx.speculate(ExitKind::Uncountable, None, rope);
            cx.b.load64(imp, cx.layout.field_offset(FieldKind::StringImplData))
        }
        ArrayType::TypedArray(_) => cx.b.load64(base, cx.layout.field_offset(FieldKind::TypedArrayVector)),
        _ => cx.b.load64(base, cx.layout.field_offset(FieldKind::Butterfly)),
    };
    cx.set_result(id, storage);
}

// ---- strings ----

/// `I32` code unit of `string[index]`, exiting when out of bounds.
fn char_code_at(cx: &mut LowerCx<'_>, string: Value, index: Value) -> Value {
    let imp = cx.b.load64(string, cx.layout.field_offset(FieldKind::StringImpl));
    let rope = cx.b.icmp_imm(IntCC::Eq, imp, 0);
    let code = cx.diamond(
        Type::I32,
        rope,
        BranchWeight::TakenRare,
        |cx| {
            let wide = cx.b.sext(index);
            let code = cx.call_helper(HelperKind::StringCharCodeAt, &[string, wide]);
            cx.b.trunc(code)
        },
        |cx| {
            let length = cx.b.load32(imp, cx.layout.field_offset(FieldKind::StringImplLength));
            let out = cx.b.icmp(IntCC::Uge, index, length);
            let minus_one = cx.b.i32(-1);
            let chars = cx.b.load64(imp, cx.layout.field_offset(FieldKind::StringImplData));
            let flags = cx.b.load32(imp, cx.layout.field_offset(FieldKind::StringImplFlags));
            let eight_bit = cx.b.and_imm(flags, string_flags::IS_8BIT as i64);
            let eight_bit = cx.b.icmp_imm(IntCC::Ne, eight_bit, 0);
            cx.diamond(
                Type::I32,
                out,
                BranchWeight::TakenRare,
                |_| minus_one,
                |cx| {
                    cx.diamond(
                        Type::I32,
                        eight_bit,
                        BranchWeight::Normal,
                        |cx| {
                            let address = element_address(cx, chars, index, 0);
                            cx.b.load8(address, 0)
                        },
                        |cx| {
                            let address = element_address(cx, chars, index, 1);
                            cx.b.load(Type::I32, MemWidth::W16, false, address, 0)
                        },
                    )
                },
            )
        },
    );
    // Both paths report an out-of-bounds index as -1.
    let out = cx.b.icmp_imm(IntCC::Slt, code, 0);
    cx.speculate(ExitKind::OutOfBounds, None, out);
    code
}

fn code_to_i64(cx: &mut LowerCx<'_>, code: Value) -> Value {
    cx.b.zext(code)
}

/// Children are `string, index`.
pub(crate) fn string_char_code_at(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, _mode: ArrayMode) {
    let string = cx.lower_cell(node.child1());
    let index = cx.lower_int32(node.child2());
    let code = char_code_at(cx, string, index);
    cx.set_result(id, code);
}

/// Children are `string, index`.
pub(crate) fn string_char_at(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, _mode: ArrayMode) {
    let string = cx.lower_cell(node.child1());
    let index = cx.lower_int32(node.child2());
    let code = char_code_at(cx, string, index);
    let wide = code_to_i64(cx, code);
    let character = cx.call_helper(HelperKind::SingleCharacterString, &[wide]);
    cx.set_result(id, character);
}

// ---- arguments ----

/// `arguments[index]` read straight from the frame. The index is the last
/// child.
pub(crate) fn get_my_argument_by_val(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let Some(&index_edge) = node.children.last() else {
        cx.crash("GetMyArgumentByVal without an index");
    };
    let index = cx.lower_int32(index_edge);
    let count = cx.b.load32(cx.frame, 8 * abi::FRAME_ARGUMENT_COUNT);
    // The count includes `this`.
    let arguments = cx.b.add_imm(count, -1);
    speculate_in_bounds(cx, index, arguments);
    let frame = cx.frame;
    let address = element_address(cx, frame, index, 3);
    let value = cx.b.load64(address, 8 * (abi::FRAME_HEADER_SLOTS + 1));
    cx.set_result(id, value);
}

// ---- allocation ----

fn element_shape(cx: &LowerCx<'_>, data: NewArrayData) -> ArrayType {
    match data.indexing.shape() {
        IndexingType::INT32_SHAPE => ArrayType::Int32,
        IndexingType::DOUBLE_SHAPE => ArrayType::Double,
        IndexingType::CONTIGUOUS_SHAPE => ArrayType::Contiguous,
        other => cx.crash(format_args!("array allocation with indexing shape {other:#x}")),
    }
}

/// Allocate an array of `data` with `length` holes. Small arrays are built
/// inline; larger ones come from the runtime. Returns the array and its
/// butterfly.
fn allocate_array(cx: &mut LowerCx<'_>, data: NewArrayData, length: u32) -> (Value, Value) {
    let shape = element_shape(cx, data);
    if length > cx.options.max_inline_array_allocation {
        let structure_id = cx.b.i64(data.structure.0 as i64);
        let count = cx.b.i64(length as i64);
        let array = cx.call_helper(HelperKind::NewArrayWithSize, &[structure_id, count]);
        let butterfly = cx.b.load64(array, cx.layout.field_offset(FieldKind::Butterfly));
        return (array, butterfly);
    }
    let structure = structure(cx, data.structure);
    let bytes = cx.layout.object_size(structure.inline_capacity);
    let array = allocate_cell(cx, bytes);
    initialize_header(cx, array, structure);
    let undefined = cx.b.i64(VALUE_UNDEFINED as i64);
    for slot in 0..structure.inline_capacity {
        cx.b.store64(undefined, array, cx.layout.property_offset(strata_ir::PropertyOffset(slot)));
    }
    let count = cx.b.i32(length as i32);
    let butterfly = allocate_butterfly(cx, 0, count, count);
    let hole = if shape == ArrayType::Double {
        double_hole(cx)
    } else {
        cx.b.i64(VALUE_EMPTY as i64)
    };
    let width = if shape == ArrayType::Double {
        MemWidth::F64
    } else {
        MemWidth::W64
    };
    for index in 0..length {
        cx.b.store(width, hole, butterfly, 8 * index as i32);
    }
    cx.b.store64(butterfly, array, cx.layout.field_offset(FieldKind::Butterfly));
    (array, butterfly)
}

/// One child per element.
pub(crate) fn new_array(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, data: NewArrayData) {
    let shape = element_shape(cx, data);
    let mode = ArrayMode::in_bounds(shape);
    let values: Vec<Value> = node
        .children
        .iter()
        .map(|edge| butterfly_store_value(cx, *edge, mode))
        .collect();
    let (array, butterfly) = allocate_array(cx, data, values.len() as u32);
    let width = if shape == ArrayType::Double {
        MemWidth::F64
    } else {
        MemWidth::W64
    };
    for (index, value) in values.into_iter().enumerate() {
        cx.b.store(width, value, butterfly, 8 * index as i32);
    }
    cx.set_result(id, array);
}

/// Child is the length. A constant length within the inline limit is
/// allocated inline; anything else goes to the runtime, which also rejects
/// negative lengths.
pub(crate) fn new_array_with_size(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, data: NewArrayData) {
    let edge = node.child1();
    let constant = match &cx.graph.node(edge.node).op {
        strata_ir::Op::JsConstant(FrozenValue::Int32(length)) => u32::try_from(*length).ok(),
        _ => None,
    };
    let array = match constant {
        Some(length) if length <= cx.options.max_inline_array_allocation => {
            cx.lower_int32(edge);
            allocate_array(cx, data, length).0
        }
        _ => {
            let length = cx.lower_int32(edge);
            let structure_id = cx.b.i64(data.structure.0 as i64);
            let wide = cx.b.sext(length);
            cx.call_helper(HelperKind::NewArrayWithSize, &[structure_id, wide])
        }
    };
    cx.set_result(id, array);
}

pub(crate) fn new_array_buffer(cx: &mut LowerCx<'_>, id: NodeId, data: NewArrayData, elements: &[FrozenValue]) {
    let shape = element_shape(cx, data);
    let (array, butterfly) = allocate_array(cx, data, elements.len() as u32);
    for (index, element) in elements.iter().enumerate() {
        let offset = 8 * index as i32;
        if shape == ArrayType::Double {
            let Some(number) = element.as_number() else {
                cx.crash(format_args!("non-number {element:?} in a double array buffer"));
            };
            let value = cx.b.f64(number);
            cx.b.store(MemWidth::F64, value, butterfly, offset);
        } else {
            let value = cx.b.i64(box_frozen(element) as i64);
            cx.b.store64(value, butterfly, offset);
        }
    }
    cx.set_result(id, array);
}
