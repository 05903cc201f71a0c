//! Inline cache sites and calls.
//!
//! Every by-id access and call becomes a patchpoint registered in the
//! function's [`InlineCacheTable`](crate::ic::InlineCacheTable). Patchpoint
//! arguments never include the context; the backend passes it.
//!
//! Varargs copy their arguments into frame locals. Locals grow downward, so
//! argument `i` of a buffer starting at `dest` lives at `dest - 8 * i`.

use strata_ir::{
    IdentifierIndex, LoadVarargsData, Node, NodeId, NodeResult, Op, Operand, VarargsData,
};
use tracing::trace;

use super::LowerCx;
use crate::abi;
use crate::exit::ExitKind;
use crate::helpers::HelperKind;
use crate::ic::{InlineCacheKind, SiteId};
use crate::lir::{BranchWeight, IntCC, MemWidth, Type, Value};
use crate::value::{VALUE_TRUE, VALUE_UNDEFINED};

impl LowerCx<'_> {
    fn site(&mut self, kind: InlineCacheKind, identifier: Option<IdentifierIndex>, count: u32) -> SiteId {
        let site = self.ics.push(kind, self.origin, identifier, count);
        trace!(target: "strata::lower", ?site, ?kind, origin = %self.origin, "inline cache site");
        site
    }

    /// Record a boxed site result, unboxing it when the node produces a
    /// boolean.
    fn set_site_result(&mut self, id: NodeId, value: Value) {
        let value = match self.graph.node(id).result {
            NodeResult::Boolean => self.b.icmp_imm(IntCC::Eq, value, VALUE_TRUE as i64),
            _ => value,
        };
        self.set_result(id, value);
    }
}

pub(crate) fn get_by_id(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, identifier: IdentifierIndex) {
    let base = cx.lower_js_value(node.child1());
    let site = cx.site(InlineCacheKind::GetById, Some(identifier), 0);
    let value = cx.b.patchpoint(site, vec![base]);
    cx.set_site_result(id, value);
}

pub(crate) fn put_by_id(cx: &mut LowerCx<'_>, node: &Node, identifier: IdentifierIndex, direct: bool) {
    let base = cx.lower_js_value(node.child1());
    let value = cx.lower_js_value(node.child2());
    let kind = if direct {
        InlineCacheKind::PutByIdDirect
    } else {
        InlineCacheKind::PutById
    };
    let site = cx.site(kind, Some(identifier), 0);
    cx.b.patchpoint(site, vec![base, value]);
}

/// Children are `base, key`.
pub(crate) fn in_(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let base = cx.lower_js_value(node.child1());
    let key = cx.lower_js_value(node.child2());
    let site = cx.site(InlineCacheKind::In, None, 0);
    let value = cx.b.patchpoint(site, vec![base, key]);
    cx.set_site_result(id, value);
}

/// Children are `callee, this, arguments...`.
pub(crate) fn call(cx: &mut LowerCx<'_>, id: NodeId, node: &Node) {
    let kind = match node.op {
        Op::Construct => InlineCacheKind::Construct,
        _ => InlineCacheKind::Call,
    };
    let args: Vec<Value> = node.children.iter().map(|edge| cx.lower_js_value(*edge)).collect();
    let count = args.len().saturating_sub(1) as u32;
    let site = cx.site(kind, None, count);
    let value = cx.b.patchpoint(site, args);
    cx.set_site_result(id, value);
}

/// Children are `callee, this, spread source`.
///
/// With a known limit the arguments are copied into the outgoing area below
/// the function's locals; otherwise the site receives the spread source and
/// copies it itself.
pub(crate) fn call_varargs(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, data: VarargsData) {
    let kind = match node.op {
        Op::ConstructVarargs(_) => InlineCacheKind::ConstructVarargs,
        _ => InlineCacheKind::CallVarargs,
    };
    let callee = cx.lower_js_value(node.child1());
    let this = cx.lower_js_value(node.child2());
    let source = cx.lower_js_value(node.child3());

    let offset = cx.b.i64(data.first_vararg_offset as i64);
    let length = cx.call_helper(HelperKind::SizeFrameForVarargs, &[source, offset]);
    if data.limit > 0 {
        let over = cx.b.icmp_imm(IntCC::Ugt, length, data.limit as i64);
        cx.speculate(ExitKind::VarargsOverflow, None, over);
    }
    check_stack(cx, length);

    let area = if data.limit > 0 {
        let area = outgoing_area(cx);
        cx.call_helper(HelperKind::LoadVarargs, &[area, source, offset, length]);
        area
    } else {
        source
    };
    let site = cx.site(kind, None, data.first_vararg_offset);
    let value = cx.b.patchpoint(site, vec![callee, this, area, length]);
    cx.set_site_result(id, value);
}

/// Children are `callee, this`; the arguments are the current frame's.
///
/// Without a limit the site receives the frame itself.
pub(crate) fn call_forward_varargs(cx: &mut LowerCx<'_>, id: NodeId, node: &Node, data: VarargsData) {
    let callee = cx.lower_js_value(node.child1());
    let this = cx.lower_js_value(node.child2());
    let length = forwarded_length(cx, data.first_vararg_offset);
    if data.limit > 0 {
        let over = cx.b.icmp_imm(IntCC::Ugt, length, data.limit as i64);
        cx.speculate(ExitKind::VarargsOverflow, None, over);
    }
    check_stack(cx, length);

    let area = if data.limit > 0 {
        let area = outgoing_area(cx);
        copy_frame_arguments(cx, area, data.first_vararg_offset, length, data.limit, 0);
        area
    } else {
        cx.frame
    };
    let site = cx.site(InlineCacheKind::CallForwardVarargs, None, data.first_vararg_offset);
    let value = cx.b.patchpoint(site, vec![callee, this, area, length]);
    cx.set_site_result(id, value);
}

/// Copy an array-like into frame locals. Child is the source.
pub(crate) fn load_varargs(cx: &mut LowerCx<'_>, node: &Node, data: LoadVarargsData) {
    let source = cx.lower_js_value(node.child1());
    let offset = cx.b.i64(data.offset as i64);
    let length = cx.call_helper(HelperKind::SizeFrameForVarargs, &[source, offset]);
    let over = cx.b.icmp_imm(IntCC::Ugt, length, data.limit as i64);
    cx.speculate(ExitKind::VarargsOverflow, None, over);
    store_count(cx, data.count, length);

    let dest = varargs_destination(cx, data.start);
    cx.call_helper(HelperKind::LoadVarargs, &[dest, source, offset, length]);
    fill_undefined(cx, dest, length, data.mandatory_minimum);
}

/// Copy the current frame's arguments into frame locals.
pub(crate) fn forward_varargs(cx: &mut LowerCx<'_>, data: LoadVarargsData) {
    let length = forwarded_length(cx, data.offset);
    let over = cx.b.icmp_imm(IntCC::Ugt, length, data.limit as i64);
    cx.speculate(ExitKind::VarargsOverflow, None, over);
    store_count(cx, data.count, length);

    let dest = varargs_destination(cx, data.start);
    copy_frame_arguments(cx, dest, data.offset, length, data.limit, data.mandatory_minimum);
}

// ---- varargs plumbing ----

/// Exit unless the stack can hold a frame for `length` arguments.
fn check_stack(cx: &mut LowerCx<'_>, length: Value) {
    let header = (abi::FRAME_HEADER_SLOTS + 1) as i64;
    let slots = cx.b.add_imm(length, header);
    let refused = cx.call_helper(HelperKind::CheckStackForVarargs, &[slots]);
    let refused = cx.b.icmp_imm(IntCC::Ne, refused, 0);
    cx.speculate(ExitKind::VarargsOverflow, None, refused);
}

/// First slot of the outgoing area, just below the function's locals.
fn outgoing_area(cx: &mut LowerCx<'_>) -> Value {
    let offset = abi::frame_offset(Operand::Local(cx.graph.num_locals));
    cx.b.add_imm(cx.frame, offset as i64)
}

fn varargs_destination(cx: &mut LowerCx<'_>, start: Operand) -> Value {
    if !matches!(start, Operand::Local(_)) {
        cx.crash(format_args!("varargs into {start:?}"));
    }
    cx.b.add_imm(cx.frame, abi::frame_offset(start) as i64)
}

/// `I64` number of caller arguments after `this` and `offset` skipped ones.
fn forwarded_length(cx: &mut LowerCx<'_>, offset: u32) -> Value {
    let count = cx.b.load32(cx.frame, 8 * abi::FRAME_ARGUMENT_COUNT);
    let count = cx.b.zext(count);
    let available = cx.b.add_imm(count, -1 - offset as i64);
    let negative = cx.b.icmp_imm(IntCC::Slt, available, 0);
    let zero = cx.b.i64(0);
    cx.b.select(negative, zero, available)
}

/// Store the argument count, `this` included, into `slot`.
fn store_count(cx: &mut LowerCx<'_>, slot: Operand, length: Value) {
    let count = cx.b.trunc(length);
    let count = cx.b.add_imm(count, 1);
    cx.b.store(MemWidth::W32, count, cx.frame, abi::frame_offset(slot));
}

/// Copy up to `slots` caller arguments into the buffer at `dest`. Slots past
/// `length` below `minimum` receive `undefined`.
fn copy_frame_arguments(cx: &mut LowerCx<'_>, dest: Value, offset: u32, length: Value, slots: u32, minimum: u32) {
    let first = 8 * (abi::FRAME_HEADER_SLOTS + 1 + offset as i32);
    for i in 0..slots.max(minimum) {
        let present = cx.b.icmp_imm(IntCC::Ugt, length, i as i64);
        let pad = i < minimum;
        let frame = cx.frame;
        let target = -8 * i as i32;
        if pad {
            let value = cx.diamond(
                Type::I64,
                present,
                BranchWeight::Normal,
                |cx| cx.b.load64(frame, first + 8 * i as i32),
                |cx| cx.b.i64(VALUE_UNDEFINED as i64),
            );
            cx.b.store64(value, dest, target);
        } else {
            cx.when(present, BranchWeight::Normal, |cx| {
                let value = cx.b.load64(frame, first + 8 * i as i32);
                cx.b.store64(value, dest, target);
            });
        }
    }
}

/// Store `undefined` into the slots below `minimum` of the buffer at `dest`
/// that lie past `length`.
fn fill_undefined(cx: &mut LowerCx<'_>, dest: Value, length: Value, minimum: u32) {
    for i in 0..minimum {
        let missing = cx.b.icmp_imm(IntCC::Ule, length, i as i64);
        cx.when(missing, BranchWeight::Normal, |cx| {
            let undefined = cx.b.i64(VALUE_UNDEFINED as i64);
            cx.b.store64(undefined, dest, -8 * i as i32);
        });
    }
}
