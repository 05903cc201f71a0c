//! Object model: structure checks, named property slots, allocation, scopes
//! and arguments objects.

use strata_ir::{
    CellType, FrozenValue, GetByOffsetMethod, MaterializeData, MultiGetByOffsetCase, Node, NodeId,
    NodeResult, Op, PromotedLocation, PropertyOffset, PutByOffsetVariant, SpeculatedType, Structure,
    StructureId, StructureSet, Transition, TypeInfoFlags,
};
use tracing::trace;

use super::LowerCx;
use crate::abi;
use crate::abstract_value::StructureAbstractValue;
use crate::exit::ExitKind;
use crate::helpers::HelperKind;
use crate::lir::{BranchWeight, IntCC, MemWidth, Type, Value};
use crate::object_layout::FieldKind;
use crate::value::{VALUE_EMPTY, VALUE_UNDEFINED, box_frozen};

// ---- checks ----

/// A structure check on a frozen constant fails only when the constant's
/// structure changed after it was frozen; it exits with `BadConstantCache`.
pub(crate) fn check_structure(cx: &mut LowerCx<'_>, node: &Node, set: &StructureSet) {
    let edge = node.child1();
    let cell = cx.lower_cell(edge);
    let base = cx.state.for_node(edge.node);
    if base.structures.is_subset_of(set) {
        cx.stats.checks_elided += 1;
        return;
    }
    let kind = match base.value {
        Some(FrozenValue::Cell(_)) => ExitKind::BadConstantCache,
        _ => ExitKind::BadCache,
    };
    if set.is_empty() {
        cx.terminate(kind);
        return;
    }
    let structure = load_structure_id(cx, cell);
    let matches = structure_in(cx, structure, set);
    let failing = cx.b.icmp_imm(IntCC::Eq, matches, 0);
    cx.speculate(kind, Some(cell), failing);
}

pub(crate) fn check_cell(cx: &mut LowerCx<'_>, node: &Node, expected: &FrozenValue) {
    let edge = node.child1();
    let value = cx.lower_js_value(edge);
    if cx.state.for_node(edge.node).value.as_ref() == Some(expected) {
        cx.stats.checks_elided += 1;
        return;
    }
    let failing = cx.b.icmp_imm(IntCC::Ne, value, box_frozen(expected) as i64);
    cx.speculate(ExitKind::BadCell, Some(value), failing);
}

pub(crate) fn check_not_empty(cx: &mut LowerCx<'_>, node: &Node) {
    let edge = node.child1();
    let value = cx.lower_js_value(edge);
    if !cx.state.type_of(edge.node).overlaps(SpeculatedType::EMPTY) {
        cx.stats.checks_elided += 1;
        return;
    }
    let failing = cx.b.icmp_imm(IntCC::Eq, value, VALUE_EMPTY as i64);
    cx.speculate(ExitKind::TdzFailure, None, failing);
}

pub(crate) fn check_has_instance(cx: &mut LowerCx<'_>, node: &Node) {
    let cell = cx.lower_cell(node.child1());
    let flags = cx.b.load8(cell, cx.layout.field_offset(FieldKind::TypeInfoFlags));
    let default = cx.b.and_imm(flags, TypeInfoFlags::IMPLEMENTS_DEFAULT_HAS_INSTANCE as i64);
    let failing = cx.b.icmp_imm(IntCC::Eq, default, 0);
    cx.speculate(ExitKind::Uncountable, None, failing);
}

fn load_structure_id(cx: &mut LowerCx<'_>, cell: Value) -> Value {
    cx.b.load32(cell, cx.layout.field_offset(FieldKind::StructureId))
}

/// `I32` flag: the structure id is one of `set`.
fn structure_in(cx: &mut LowerCx<'_>, structure: Value, set: &StructureSet) -> Value {
    let mut result: Option<Value> = None;
    for id in set.iter() {
        let equal = cx.b.icmp_imm(IntCC::Eq, structure, id.0 as i64);
        result = Some(match result {
            Some(previous) => cx.b.or(previous, equal),
            None => equal,
        });
    }
    match result {
        Some(result) => result,
        None => cx.b.i32(0),
    }
}

pub(crate) fn structure<'g>(cx: &LowerCx<'g>, id: StructureId) -> &'g Structure {
    let graph = cx.graph;
    match graph.structures.get(id) {
        Some(structure) => structure,
        None => cx.crash(format_args!("structure {} is not in the graph's registry", id.0)),
    }
}

// ---- allocation ----

/// Allocate `bytes` for a cell from the size-class free list, falling back
/// to the runtime when the list is empty or the size has no class.
pub(crate) fn allocate_cell(cx: &mut LowerCx<'_>, bytes: u32) -> Value {
    let Some(class) = abi::size_class(bytes) else {
        let size = cx.b.i64(bytes as i64);
        return cx.call_helper(HelperKind::AllocateCell, &[size]);
    };
    let list = abi::free_list_offset(class);
    let head = cx.b.load64(cx.ctx, list);
    let empty = cx.b.icmp_imm(IntCC::Eq, head, 0);
    cx.diamond(
        Type::I64,
        empty,
        BranchWeight::TakenRare,
        |cx| {
            let size = cx.b.i64(bytes as i64);
            cx.call_helper(HelperKind::AllocateCell, &[size])
        },
        |cx| {
            let next = cx.b.load64(head, 0);
            cx.b.store64(next, cx.ctx, list);
            head
        },
    )
}

/// Bump-allocate `bytes` of auxiliary storage, falling back to the runtime
/// when the linear region is exhausted.
pub(crate) fn allocate_storage(cx: &mut LowerCx<'_>, bytes: Value) -> Value {
    let cursor = cx.b.load64(cx.ctx, abi::CTX_LINEAR_CURSOR);
    let end = cx.b.load64(cx.ctx, abi::CTX_LINEAR_END);
    let bumped = cx.b.add(cursor, bytes);
    let fits = cx.b.icmp(IntCC::Ule, bumped, end);
    cx.diamond(
        Type::I64,
        fits,
        BranchWeight::Normal,
        |cx| {
            cx.b.store64(bumped, cx.ctx, abi::CTX_LINEAR_CURSOR);
            cursor
        },
        |cx| cx.call_helper(HelperKind::AllocateStorage, &[bytes]),
    )
}

/// Write the header of a fresh cell of `structure`.
pub(crate) fn initialize_header(cx: &mut LowerCx<'_>, cell: Value, structure: &Structure) {
    let id = cx.b.i32(structure.id.0 as i32);
    cx.b.store(MemWidth::W32, id, cell, cx.layout.field_offset(FieldKind::StructureId));
    let indexing = cx.b.i32(structure.indexing.0 as i32);
    cx.b.store(MemWidth::W8, indexing, cell, cx.layout.field_offset(FieldKind::IndexingType));
    let tag = cx.b.i32(cx.layout.type_of(structure.cell_type) as i32);
    cx.b.store(MemWidth::W8, tag, cell, cx.layout.tag_offset());
    let flags = cx.b.i32(structure.flags.0 as i32);
    cx.b.store(MemWidth::W8, flags, cell, cx.layout.field_offset(FieldKind::TypeInfoFlags));
    let unmarked = cx.b.i32(0);
    cx.b.store(MemWidth::W8, unmarked, cell, cx.layout.field_offset(FieldKind::GcMark));
}

/// Out-of-line slots reserved for `used` out-of-line properties.
pub(crate) fn out_of_line_capacity(used: u32) -> u32 {
    if used == 0 { 0 } else { used.next_power_of_two().max(4) }
}

/// Allocate a butterfly with `out_of_line` property slots and room for
/// `vector_length` elements. Returns the pointer to element 0 with both
/// length fields set.
pub(crate) fn allocate_butterfly(
    cx: &mut LowerCx<'_>,
    out_of_line: u32,
    public_length: Value,
    vector_length: Value,
) -> Value {
    let preamble = cx.layout.butterfly_preamble(out_of_line) as i64;
    let wide = cx.b.zext(vector_length);
    let elements = cx.b.shl_imm(wide, 3);
    let bytes = cx.b.add_imm(elements, preamble);
    let base = allocate_storage(cx, bytes);
    let butterfly = cx.b.add_imm(base, preamble);
    cx.b.store(MemWidth::W32, public_length, butterfly, cx.layout.field_offset(FieldKind::PublicLength));
    cx.b.store(MemWidth::W32, vector_length, butterfly, cx.layout.field_offset(FieldKind::VectorLength));
    butterfly
}

// ---- named properties ----

pub(crate) fn get_butterfly(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let cell = cx.lower_cell(node.child1());
    let butterfly = cx.b.load64(cell, cx.layout.field_offset(FieldKind::Butterfly));
    cx.set_result(id, butterfly);
}

pub(crate) fn allocate_property_storage(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, transition: Transition) {
    let object = cx.lower_cell(node.child1());
    let capacity = out_of_line_capacity(structure(cx, transition.next).out_of_line_size());
    let zero = cx.b.i32(0);
    let butterfly = allocate_butterfly(cx, capacity, zero, zero);
    cx.b.store64(butterfly, object, cx.layout.field_offset(FieldKind::Butterfly));
    cx.set_result(id, butterfly);
}

pub(crate) fn reallocate_property_storage(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, transition: Transition) {
    let object = cx.lower_cell(node.child1());
    let capacity = out_of_line_capacity(structure(cx, transition.next).out_of_line_size());
    let slots = cx.b.i64(capacity as i64);
    let butterfly = cx.call_helper(HelperKind::ReallocateStorage, &[object, slots]);
    cx.set_result(id, butterfly);
}

/// Base pointer a slot at `offset` is addressed from: the cell for inline
/// slots, the butterfly otherwise.
fn slot_base(cx: &mut LowerCx<'_>, storage: Value, storage_is_cell: bool, offset: PropertyOffset) -> Value {
    if storage_is_cell && !offset.is_inline() {
        cx.b.load64(storage, cx.layout.field_offset(FieldKind::Butterfly))
    } else {
        storage
    }
}

pub(crate) fn get_by_offset(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, offset: PropertyOffset) {
    let edge = node.child1();
    let storage = cx.lower_storage_or_cell(edge);
    let is_cell = cx.graph.node(edge.node).result != NodeResult::Storage;
    let base = slot_base(cx, storage, is_cell, offset);
    let value = cx.b.load64(base, cx.layout.property_offset(offset));
    cx.set_result(id, value);
}

/// Children are `storage, base, value`, or `base, value` when the slot is
/// addressed from the base.
pub(crate) fn put_by_offset(cx: &mut LowerCx<'_>, node: &Node, offset: PropertyOffset) {
    let (storage_edge, base_edge, value_edge) = match node.children.len() {
        2 => (node.child1(), node.child1(), node.child2()),
        _ => (node.child1(), node.child2(), node.child3()),
    };
    let storage = cx.lower_storage_or_cell(storage_edge);
    let is_cell = cx.graph.node(storage_edge.node).result != NodeResult::Storage;
    let base = cx.lower_cell(base_edge);
    let value = cx.lower_js_value(value_edge);
    let slot = slot_base(cx, storage, is_cell, offset);
    cx.b.store64(value, slot, cx.layout.property_offset(offset));
    if cx.state.type_of(value_edge.node).overlaps(SpeculatedType::CELL) {
        cx.write_barrier(base);
    }
}

pub(crate) fn multi_get_by_offset(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, cases: &[MultiGetByOffsetCase]) {
    let edge = node.child1();
    let base = cx.lower_cell(edge);
    let known = cx.state.for_node(edge.node).structures;

    // Cases the abstract state rules out are dropped.
    let cases: Vec<&MultiGetByOffsetCase> = cases
        .iter()
        .filter(|case| case.structures.iter().any(|s| structure_possible(&known, s)))
        .collect();
    let mut all = StructureSet::new();
    for case in &cases {
        all.merge(&case.structures);
    }
    let covered = known.is_subset_of(&all);
    if cases.is_empty() {
        cx.terminate(ExitKind::BadCache);
        return;
    }

    let join = cx.b.create_block();
    let result = cx.b.append_block_param(join, Type::I64);
    let structure = load_structure_id(cx, base);
    cx.arm_depth += 1;
    for (index, case) in cases.iter().enumerate() {
        let last = index + 1 == cases.len();
        if !(last && covered) {
            let matches = structure_in(cx, structure, &case.structures);
            let hit = cx.b.create_block();
            let next = cx.b.create_block();
            cx.b.branch(matches, hit, next, BranchWeight::Normal);
            cx.b.switch_to(hit);
            let value = load_case(cx, base, &case.method);
            cx.b.jump(join, vec![value]);
            cx.b.switch_to(next);
            if last {
                cx.exit_here(ExitKind::BadCache, Some(base));
            }
        } else {
            let value = load_case(cx, base, &case.method);
            cx.b.jump(join, vec![value]);
        }
    }
    cx.arm_depth -= 1;
    cx.b.switch_to(join);
    trace!(target: "strata::lower", cases = cases.len(), covered, "multi get by offset");
    cx.set_result(id, result);
}

fn structure_possible(known: &StructureAbstractValue, id: StructureId) -> bool {
    match known {
        StructureAbstractValue::Top => true,
        StructureAbstractValue::Known(set) => set.contains(id),
    }
}

fn load_case(cx: &mut LowerCx<'_>, base: Value, method: &GetByOffsetMethod) -> Value {
    match method {
        GetByOffsetMethod::Load(offset) => {
            let slot = slot_base(cx, base, true, *offset);
            cx.b.load64(slot, cx.layout.property_offset(*offset))
        }
        GetByOffsetMethod::Constant(value) => cx.b.i64(box_frozen(value) as i64),
    }
}

/// Children are `base, value`.
pub(crate) fn multi_put_by_offset(cx: &mut LowerCx<'_>, node: &Node, variants: &[PutByOffsetVariant]) {
    let base_edge = node.child1();
    let value_edge = node.child2();
    let base = cx.lower_cell(base_edge);
    let value = cx.lower_js_value(value_edge);
    let known = cx.state.for_node(base_edge.node).structures;

    let variants: Vec<&PutByOffsetVariant> = variants
        .iter()
        .filter(|variant| variant.old_structures.iter().any(|s| structure_possible(&known, s)))
        .collect();
    if variants.is_empty() {
        cx.terminate(ExitKind::BadCache);
        return;
    }
    let mut all = StructureSet::new();
    for variant in &variants {
        all.merge(&variant.old_structures);
    }
    let covered = known.is_subset_of(&all);

    let join = cx.b.create_block();
    let structure_id = load_structure_id(cx, base);
    cx.arm_depth += 1;
    for (index, variant) in variants.iter().enumerate() {
        let last = index + 1 == variants.len();
        if last && covered {
            store_variant(cx, base, value, variant);
            cx.b.jump(join, Vec::new());
        } else {
            let matches = structure_in(cx, structure_id, &variant.old_structures);
            let hit = cx.b.create_block();
            let next = cx.b.create_block();
            cx.b.branch(matches, hit, next, BranchWeight::Normal);
            cx.b.switch_to(hit);
            store_variant(cx, base, value, variant);
            cx.b.jump(join, Vec::new());
            cx.b.switch_to(next);
            if last {
                cx.exit_here(ExitKind::BadCache, Some(base));
            }
        }
    }
    cx.arm_depth -= 1;
    cx.b.switch_to(join);
    if cx.state.type_of(value_edge.node).overlaps(SpeculatedType::CELL) {
        cx.write_barrier(base);
    }
}

fn store_variant(cx: &mut LowerCx<'_>, base: Value, value: Value, variant: &PutByOffsetVariant) {
    let offset = variant.offset;
    let slot = match variant.new_structure {
        Some(next) if !offset.is_inline() && needs_growth(cx, variant, offset) => {
            let capacity = out_of_line_capacity(structure(cx, next).out_of_line_size());
            let slots = cx.b.i64(capacity as i64);
            cx.call_helper(HelperKind::ReallocateStorage, &[base, slots])
        }
        _ => slot_base(cx, base, true, offset),
    };
    cx.b.store64(value, slot, cx.layout.property_offset(offset));
    if let Some(next) = variant.new_structure {
        let id = cx.b.i32(next.0 as i32);
        cx.b.store(MemWidth::W32, id, base, cx.layout.field_offset(FieldKind::StructureId));
    }
}

/// Some old structure lacks capacity for the slot being added.
fn needs_growth(cx: &LowerCx<'_>, variant: &PutByOffsetVariant, offset: PropertyOffset) -> bool {
    variant.old_structures.iter().any(|old| {
        out_of_line_capacity(structure(cx, old).out_of_line_size()) <= offset.out_of_line_index()
    })
}

pub(crate) fn put_structure(cx: &mut LowerCx<'_>, node: &Node, transition: Transition) {
    let cell = cx.lower_cell(node.child1());
    let id = cx.b.i32(transition.next.0 as i32);
    cx.b.store(MemWidth::W32, id, cell, cx.layout.field_offset(FieldKind::StructureId));
}

pub(crate) fn new_object(cx: &mut LowerCx<'_>, id: NodeId, structure_id: StructureId) {
    let structure = structure(cx, structure_id);
    let object = allocate_object(cx, structure);
    cx.set_result(id, object);
}

/// Allocate an object of `structure` with every inline slot `undefined` and
/// no butterfly.
fn allocate_object(cx: &mut LowerCx<'_>, structure: &Structure) -> Value {
    let bytes = cx.layout.object_size(structure.inline_capacity);
    let object = allocate_cell(cx, bytes);
    initialize_header(cx, object, structure);
    let null = cx.b.i64(0);
    cx.b.store64(null, object, cx.layout.field_offset(FieldKind::Butterfly));
    let undefined = cx.b.i64(VALUE_UNDEFINED as i64);
    for slot in 0..structure.inline_capacity {
        cx.b.store64(undefined, object, cx.layout.property_offset(PropertyOffset(slot)));
    }
    object
}

// ---- globals and scopes ----

pub(crate) fn get_global_var(cx: &mut LowerCx<'_>, id: NodeId, address: u64) {
    let pointer = cx.b.i64(address as i64);
    let value = cx.b.load64(pointer, 0);
    cx.set_result(id, value);
}

pub(crate) fn put_global_var(cx: &mut LowerCx<'_>, node: &Node, address: u64) {
    let value = cx.lower_js_value(node.child1());
    let pointer = cx.b.i64(address as i64);
    cx.b.store64(value, pointer, 0);
}

/// `GetScope`, `SkipScope` and `GetExecutable`: one pointer load.
pub(crate) fn load_link(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let field = match node.op {
        Op::GetScope => FieldKind::FunctionScope,
        Op::SkipScope => FieldKind::ScopeNext,
        _ => FieldKind::FunctionExecutable,
    };
    let cell = cx.lower_cell(node.child1());
    let value = cx.b.load64(cell, cx.layout.field_offset(field));
    cx.set_result(id, value);
}

pub(crate) fn get_closure_var(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, index: u32) {
    let scope = cx.lower_cell(node.child1());
    let value = cx.b.load64(scope, cx.layout.closure_var_offset(index));
    cx.set_result(id, value);
}

pub(crate) fn put_closure_var(cx: &mut LowerCx<'_>, node: &Node, index: u32) {
    let scope = cx.lower_cell(node.child1());
    let value_edge = node.child2();
    let value = cx.lower_js_value(value_edge);
    cx.b.store64(value, scope, cx.layout.closure_var_offset(index));
    if cx.state.type_of(value_edge.node).overlaps(SpeculatedType::CELL) {
        cx.write_barrier(scope);
    }
}

/// Children are `scope, executable`.
pub(crate) fn new_function(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let scope = cx.lower_cell(node.child1());
    let executable = cx.lower_js_value(node.child2());
    let function = cx.call_helper(HelperKind::NewFunction, &[executable, scope]);
    cx.set_result(id, function);
}

/// Allocate an activation of `structure` whose variables are all
/// `undefined`. The structure's inline capacity is the variable count.
fn allocate_activation(cx: &mut LowerCx<'_>, structure: &Structure, scope: Value) -> Value {
    let bytes = cx.layout.closure_var_offset(structure.inline_capacity) as u32;
    let activation = allocate_cell(cx, bytes);
    initialize_header(cx, activation, structure);
    cx.b.store64(scope, activation, cx.layout.field_offset(FieldKind::ScopeNext));
    let null = cx.b.i64(0);
    cx.b.store64(null, activation, cx.layout.field_offset(FieldKind::ActivationSymbolTable));
    let undefined = cx.b.i64(VALUE_UNDEFINED as i64);
    for index in 0..structure.inline_capacity {
        cx.b.store64(undefined, activation, cx.layout.closure_var_offset(index));
    }
    activation
}

pub(crate) fn create_activation(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, structure_id: StructureId) {
    let scope = cx.lower_cell(node.child1());
    let structure = structure(cx, structure_id);
    let activation = allocate_activation(cx, structure, scope);
    cx.set_result(id, activation);
}

pub(crate) fn create_arguments(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let frame = cx.frame;
    let arguments = match node.op {
        Op::CreateDirectArguments => cx.call_helper(HelperKind::CreateDirectArguments, &[frame]),
        Op::CreateScopedArguments => {
            let scope = cx.lower_cell(node.child1());
            cx.call_helper(HelperKind::CreateScopedArguments, &[frame, scope])
        }
        _ => cx.call_helper(HelperKind::CreateClonedArguments, &[frame]),
    };
    cx.set_result(id, arguments);
}

pub(crate) fn get_from_arguments(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, index: u32) {
    let arguments = cx.lower_cell(node.child1());
    let value = cx.b.load64(arguments, cx.layout.direct_argument_offset(index));
    cx.set_result(id, value);
}

pub(crate) fn put_to_arguments(cx: &mut LowerCx<'_>, node: &Node, index: u32) {
    let arguments = cx.lower_cell(node.child1());
    let value_edge = node.child2();
    let value = cx.lower_js_value(value_edge);
    cx.b.store64(value, arguments, cx.layout.direct_argument_offset(index));
    if cx.state.type_of(value_edge.node).overlaps(SpeculatedType::CELL) {
        cx.write_barrier(arguments);
    }
}

// ---- sunk allocations materialized mid-function ----

/// Children are the structure id (int32) followed by one value per
/// location in `data`.
pub(crate) fn materialize_new_object(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, data: &MaterializeData) {
    let values: Vec<Value> = node.children[1..]
        .iter()
        .map(|edge| cx.lower_js_value(*edge))
        .collect();
    let structures: Vec<&Structure> = data.structures.iter().map(|s| structure(cx, s)).collect();

    let object = match structures.as_slice() {
        [] => cx.crash("materialization without a structure"),
        [only] => {
            let object = allocate_object(cx, only);
            store_named_fields(cx, object, only, &data.locations, &values);
            object
        }
        many => {
            let structure_id = cx.lower_int32(node.child1());
            let join = cx.b.create_block();
            let result = cx.b.append_block_param(join, Type::I64);
            cx.arm_depth += 1;
            for (index, structure) in many.iter().enumerate() {
                if index + 1 < many.len() {
                    let matches = cx.b.icmp_imm(IntCC::Eq, structure_id, structure.id.0 as i64);
                    let hit = cx.b.create_block();
                    let next = cx.b.create_block();
                    cx.b.branch(matches, hit, next, BranchWeight::Normal);
                    cx.b.switch_to(hit);
                    let object = allocate_object(cx, structure);
                    store_named_fields(cx, object, structure, &data.locations, &values);
                    cx.b.jump(join, vec![object]);
                    cx.b.switch_to(next);
                } else {
                    let object = allocate_object(cx, structure);
                    store_named_fields(cx, object, structure, &data.locations, &values);
                    cx.b.jump(join, vec![object]);
                }
            }
            cx.arm_depth -= 1;
            cx.b.switch_to(join);
            result
        }
    };
    cx.set_result(id, object);
}

fn store_named_fields(
    cx: &mut LowerCx<'_>,
    object: Value,
    structure: &Structure,
    locations: &[PromotedLocation],
    values: &[Value],
) {
    let out_of_line = out_of_line_capacity(structure.out_of_line_size());
    let butterfly = if out_of_line > 0 {
        let zero = cx.b.i32(0);
        let butterfly = allocate_butterfly(cx, out_of_line, zero, zero);
        cx.b.store64(butterfly, object, cx.layout.field_offset(FieldKind::Butterfly));
        Some(butterfly)
    } else {
        None
    };
    for (location, &value) in locations.iter().zip(values) {
        let PromotedLocation::NamedProperty(identifier) = location else {
            continue;
        };
        let Some(offset) = structure.offset_of(*identifier) else {
            cx.crash(format_args!(
                "structure {} has no slot for {}",
                structure.id.0,
                cx.graph.identifier(*identifier)
            ));
        };
        match butterfly {
            Some(butterfly) if !offset.is_inline() => {
                cx.b.store64(value, butterfly, cx.layout.property_offset(offset));
            }
            _ => cx.b.store64(value, object, cx.layout.property_offset(offset)),
        }
    }
}

/// Children are the parent scope followed by one value per location in
/// `data`.
pub(crate) fn materialize_create_activation(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, data: &MaterializeData) {
    let Some(structure_id) = data.structures.only() else {
        cx.crash("activation materialization needs exactly one structure");
    };
    let scope = cx.lower_cell(node.child1());
    let values: Vec<Value> = node.children[1..]
        .iter()
        .map(|edge| cx.lower_js_value(*edge))
        .collect();
    let structure = structure(cx, structure_id);
    let activation = allocate_activation(cx, structure, scope);
    for (location, &value) in data.locations.iter().zip(&values) {
        match location {
            PromotedLocation::ClosureVar(index) => {
                cx.b.store64(value, activation, cx.layout.closure_var_offset(*index));
            }
            PromotedLocation::ActivationSymbolTable => {
                cx.b.store64(value, activation, cx.layout.field_offset(FieldKind::ActivationSymbolTable));
            }
            _ => {}
        }
    }
    cx.set_result(id, activation);
}

// ---- conversions ----

pub(crate) fn to_this(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = cx.lower_js_value(edge);
    let known = cx.state.for_node(edge.node);
    let plain_objects = known.ty.is_subset_of(SpeculatedType::OBJECT)
        && match &known.structures {
            StructureAbstractValue::Known(set) => set.iter().all(|s| {
                cx.graph
                    .structures
                    .get(s)
                    .is_some_and(|s| !s.flags.contains(TypeInfoFlags::OVERRIDES_TO_THIS))
            }),
            StructureAbstractValue::Top => false,
        };
    if plain_objects {
        cx.set_result(id, value);
        return;
    }
    let is_cell = cx.is_cell(value);
    let fast = cx.diamond(
        Type::I32,
        is_cell,
        BranchWeight::Normal,
        |cx| {
            let tag = cx.cell_tag(value);
            let object = cx.is_object_tag(tag);
            let flags = cx.b.load8(value, cx.layout.field_offset(FieldKind::TypeInfoFlags));
            let overrides = cx.b.and_imm(flags, TypeInfoFlags::OVERRIDES_TO_THIS as i64);
            let plain = cx.b.icmp_imm(IntCC::Eq, overrides, 0);
            cx.b.and(object, plain)
        },
        |cx| cx.b.i32(0),
    );
    let result = cx.diamond(
        Type::I64,
        fast,
        BranchWeight::Normal,
        |_| value,
        |cx| cx.call_helper(HelperKind::ToThis, &[value]),
    );
    cx.set_result(id, result);
}

pub(crate) fn to_primitive(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = cx.lower_js_value(edge);
    if !cx.state.type_of(edge.node).overlaps(SpeculatedType::OBJECT) {
        cx.set_result(id, value);
        return;
    }
    let is_cell = cx.is_cell(value);
    let object = cx.diamond(
        Type::I32,
        is_cell,
        BranchWeight::Normal,
        |cx| {
            let tag = cx.cell_tag(value);
            cx.is_object_tag(tag)
        },
        |cx| cx.b.i32(0),
    );
    let result = cx.diamond(
        Type::I64,
        object,
        BranchWeight::Normal,
        |cx| cx.call_helper(HelperKind::ToPrimitive, &[value]),
        |_| value,
    );
    cx.set_result(id, result);
}

pub(crate) fn to_string(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let edge = node.child1();
    let value = cx.lower_js_value(edge);
    if cx.state.type_of(edge.node).is_subset_of(SpeculatedType::STRING) {
        cx.set_result(id, value);
        return;
    }
    let is_string = if edge.use_kind.is_cell() {
        cx.has_cell_type(value, CellType::String)
    } else {
        let is_cell = cx.is_cell(value);
        cx.diamond(
            Type::I32,
            is_cell,
            BranchWeight::Normal,
            |cx| cx.has_cell_type(value, CellType::String),
            |cx| cx.b.i32(0),
        )
    };
    let result = cx.diamond(
        Type::I64,
        is_string,
        BranchWeight::Normal,
        |_| value,
        |cx| cx.call_helper(HelperKind::ToString, &[value]),
    );
    cx.set_result(id, result);
}

/// Two or three string children; a missing third is passed as empty.
pub(crate) fn make_rope(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let first = cx.lower_js_value(node.child1());
    let second = cx.lower_js_value(node.child2());
    let third = match node.children.get(2) {
        Some(edge) => cx.lower_js_value(*edge),
        None => cx.b.i64(VALUE_EMPTY as i64),
    };
    let rope = cx.call_helper(HelperKind::MakeRope, &[first, second, third]);
    cx.set_result(id, rope);
}

pub(crate) fn instance_of(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let value = cx.lower_js_value(node.child1());
    let prototype = cx.lower_cell(node.child2());
    let result = cx.call_helper(HelperKind::InstanceOf, &[value, prototype]);
    let result = cx.b.trunc(result);
    cx.set_result(id, result);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoweringOptions;
    use crate::lower::LoweredFunction;
    use crate::testing;
    use strata_ir::{CellConstant, Edge, GraphBuilder, UseKind};

    /// `CheckStructure(o: {2}); return o` where `o` is either a constant cell
    /// frozen with structure 1 or the first argument.
    fn structure_check(constant: bool) -> LoweredFunction {
        let mut b = GraphBuilder::new("structure_check", 2, 0);
        b.structure(Structure::new(StructureId(1), CellType::FinalObject));
        b.structure(Structure::new(StructureId(2), CellType::FinalObject));
        let entry = b.entry();
        let o = if constant {
            let cell = FrozenValue::Cell(CellConstant {
                address: 0x20_0000,
                structure: StructureId(1),
                string: None,
            });
            b.add(entry, Op::JsConstant(cell), [], NodeResult::JsValue)
        } else {
            testing::get_argument(&mut b, entry, 1)
        };
        b.add(
            entry,
            Op::CheckStructure(StructureSet::singleton(StructureId(2))),
            [Edge::new(o, UseKind::Cell)],
            NodeResult::None,
        );
        b.add(entry, Op::Return, [Edge::untyped(o)], NodeResult::None);
        let graph = b.build().expect("valid graph");
        testing::lower_default(&graph, &LoweringOptions::default())
    }

    fn exit_kinds(lowered: &LoweredFunction) -> Vec<ExitKind> {
        lowered.exits.exits.iter().map(|exit| exit.kind).collect()
    }

    #[test]
    fn stale_constant_structures_exit_as_constant_cache() {
        let kinds = exit_kinds(&structure_check(true));
        assert!(kinds.contains(&ExitKind::BadConstantCache), "{kinds:?}");
        assert!(!kinds.contains(&ExitKind::BadCache), "{kinds:?}");

        let kinds = exit_kinds(&structure_check(false));
        assert!(kinds.contains(&ExitKind::BadCache), "{kinds:?}");
        assert!(!kinds.contains(&ExitKind::BadConstantCache), "{kinds:?}");
    }

    #[test]
    fn out_of_line_capacity_rounds_up() {
        assert_eq!(out_of_line_capacity(0), 0);
        assert_eq!(out_of_line_capacity(1), 4);
        assert_eq!(out_of_line_capacity(4), 4);
        assert_eq!(out_of_line_capacity(5), 8);
    }
}
