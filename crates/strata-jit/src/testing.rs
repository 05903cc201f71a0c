//! Graph fixtures and an evaluator harness for unit tests.

use strata_ir::{BlockIndex, FlushFormat, Graph, GraphBuilder, NodeId, NodeResult, Op, Operand, StackAccessData};

use crate::abi;
use crate::config::LoweringOptions;
use crate::helpers::HelperKind;
use crate::ic::SiteId;
use crate::lir::eval::{EvalOutcome, EvalRuntime, Evaluator, SparseMemory};
use crate::lower::{LoweredFunction, lower};
use crate::object_layout::{DefaultObjectLayout, FieldKind, ObjectLayout, string_flags};
use crate::value::{VALUE_UNDEFINED, box_int52};

pub(crate) const CTX: u64 = 0x1000;
pub(crate) const FRAME: u64 = 0x10_0000;

/// Runtime answering the boxing helpers; anything else is a test bug.
pub(crate) struct BoxingRuntime;

impl EvalRuntime for BoxingRuntime {
    fn call_helper(&mut self, helper: HelperKind, args: &[u64], _: &mut SparseMemory) -> u64 {
        match helper {
            HelperKind::BoxInt52 => box_int52(args[0] as i64),
            other => panic!("unexpected helper call {other:?}"),
        }
    }

    fn patchpoint(&mut self, site: SiteId, _: &[u64], _: &mut SparseMemory) -> u64 {
        panic!("unexpected patchpoint {site:?}");
    }
}

pub(crate) fn get_argument(b: &mut GraphBuilder, block: BlockIndex, index: u32) -> NodeId {
    b.add(
        block,
        Op::GetStack(StackAccessData {
            local: Operand::Argument(index),
            machine_local: Operand::Argument(index),
            format: FlushFormat::JsValue,
        }),
        [],
        NodeResult::JsValue,
    )
}

pub(crate) fn lower_default(graph: &Graph, options: &LoweringOptions) -> LoweredFunction {
    lower(graph, options, &DefaultObjectLayout)
}

/// Memory holding a frame with `arguments` after `this`.
pub(crate) fn frame_memory(arguments: &[u64]) -> SparseMemory {
    let mut memory = SparseMemory::new();
    let slot = |s: i32| FRAME.wrapping_add_signed(8 * s as i64);
    memory.write_u32(slot(abi::FRAME_ARGUMENT_COUNT), arguments.len() as u32 + 1);
    memory.write_u64(slot(abi::FRAME_HEADER_SLOTS), VALUE_UNDEFINED);
    for (i, &value) in arguments.iter().enumerate() {
        memory.write_u64(slot(abi::FRAME_HEADER_SLOTS + 1 + i as i32), value);
    }
    memory
}

/// Write a resolved one-byte string cell at `address`; its implementation
/// and characters follow the cell.
pub(crate) fn write_string(memory: &mut SparseMemory, layout: &dyn ObjectLayout, address: u64, text: &str) {
    let imp = address + 0x100;
    let chars = address + 0x200;
    memory.write(
        address + layout.tag_offset() as u64,
        1,
        layout.type_of(strata_ir::CellType::String) as u64,
    );
    memory.write_u64(address + layout.field_offset(FieldKind::StringImpl) as u64, imp);
    memory.write_u32(imp + layout.field_offset(FieldKind::StringImplLength) as u64, text.len() as u32);
    memory.write_u64(imp + layout.field_offset(FieldKind::StringImplData) as u64, chars);
    memory.write_u32(imp + layout.field_offset(FieldKind::StringImplFlags) as u64, string_flags::IS_8BIT);
    memory.write_bytes(chars, text.as_bytes());
}

pub(crate) fn run_in(lowered: &LoweredFunction, memory: &mut SparseMemory) -> EvalOutcome {
    Evaluator::new(&lowered.lir, CTX, FRAME)
        .with_step_limit(1_000_000)
        .run(memory, &mut BoxingRuntime)
        .expect("evaluation should finish")
}

pub(crate) fn run(lowered: &LoweredFunction, arguments: &[u64]) -> EvalOutcome {
    run_in(lowered, &mut frame_memory(arguments))
}
