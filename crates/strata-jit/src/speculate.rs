//! Speculation checks.
//!
//! A check is a branch to a cold block ending in an exit. Before emitting
//! one, the abstract state is consulted: a check it proves redundant is
//! skipped, and one it proves can never pass ends the block with an
//! unconditional exit instead. After a check the state is narrowed so later
//! uses of the same value are not checked again.

use strata_ir::{CellType, Edge, NodeId, SpeculatedType, UseKind};
use tracing::trace;

use crate::exit::ExitKind;
use crate::lir::{BranchWeight, FloatCC, IntCC, Type, Value};
use crate::lower::LowerCx;
use crate::object_layout::{FieldKind, string_flags};
use crate::value::{TAG_BIT_UNDEFINED, TAG_MASK, TAG_TYPE_NUMBER, VALUE_FALSE, VALUE_NULL};

impl LowerCx<'_> {
    /// Exit with `kind` when `failing` is non-zero.
    pub(crate) fn speculate(&mut self, kind: ExitKind, profile: Option<Value>, failing: Value) {
        let (exit, stackmap) = self.build_exit(kind, profile);
        let cold = self.b.create_cold_block();
        let continuation = self.b.create_block();
        self.b.branch(failing, cold, continuation, BranchWeight::TakenRare);
        self.b.switch_to(cold);
        self.b.exit(exit, stackmap);
        self.b.switch_to(continuation);
        self.stats.checks_emitted += 1;
        trace!(target: "strata::exit", exit = %exit, kind = %kind, "speculation check");
    }

    /// End the current LIR block with an exit, leaving the abstract state
    /// alone. Used for the fall-through of structure dispatch chains.
    pub(crate) fn exit_here(&mut self, kind: ExitKind, profile: Option<Value>) {
        let (exit, stackmap) = self.build_exit(kind, profile);
        self.b.exit(exit, stackmap);
        self.stats.checks_emitted += 1;
        trace!(target: "strata::exit", exit = %exit, kind = %kind, "dispatch fall-through");
    }

    /// Exit unconditionally and treat the rest of the block, and every block
    /// it dominates, as unreachable. Does nothing once the block has ended.
    pub(crate) fn terminate(&mut self, kind: ExitKind) {
        if !self.state.is_valid() || self.b.is_terminated() {
            return;
        }
        let (exit, stackmap) = self.build_exit(kind, None);
        self.b.exit(exit, stackmap);
        self.stats.terminated_blocks += 1;
        self.state.invalidate();
        self.invalidate_dominated();
        trace!(target: "strata::exit", exit = %exit, kind = %kind, block = %self.block, "block terminated");
    }

    /// Check that `id` has a type in `mask`. `fail` computes the failure
    /// flag and only runs when the check cannot be elided.
    pub(crate) fn type_check(
        &mut self,
        id: NodeId,
        mask: SpeculatedType,
        kind: ExitKind,
        profile: Option<Value>,
        fail: impl FnOnce(&mut Self) -> Value,
    ) {
        let known = self.state.for_node(id);
        if known.is_type(mask) {
            self.stats.checks_elided += 1;
            return;
        }
        if known.is_not_type(mask) && self.arm_depth == 0 {
            self.terminate(kind);
            return;
        }
        let failing = fail(self);
        self.speculate(kind, profile, failing);
        if self.arm_depth == 0 {
            self.state.filter(id, mask);
        }
    }

    /// Check a boxed value against the use kind of `edge`.
    pub(crate) fn speculate_edge(&mut self, edge: Edge, value: Value) {
        let id = edge.node;
        let bad = ExitKind::BadType;
        match edge.use_kind {
            UseKind::Untyped
            | UseKind::KnownInt32
            | UseKind::KnownBoolean
            | UseKind::KnownCell
            | UseKind::KnownString
            | UseKind::Int52Rep
            | UseKind::DoubleRep
            | UseKind::DoubleRepReal
            | UseKind::DoubleRepMachineInt => {}
            UseKind::Int32 => self.speculate_int32(id, value),
            UseKind::Number | UseKind::MachineInt => {
                self.type_check(id, SpeculatedType::BYTECODE_NUMBER, bad, Some(value), |cx| {
                    let is = cx.is_number(value);
                    cx.b.icmp_imm(IntCC::Eq, is, 0)
                });
            }
            UseKind::RealNumber => {
                self.type_check(id, SpeculatedType::BYTECODE_REAL_NUMBER, bad, Some(value), |cx| {
                    let is_int = cx.is_int32(value);
                    cx.diamond(
                        Type::I32,
                        is_int,
                        BranchWeight::Normal,
                        |cx| cx.b.i32(0),
                        |cx| {
                            let is_number = cx.is_number(value);
                            cx.diamond(
                                Type::I32,
                                is_number,
                                BranchWeight::Normal,
                                |cx| {
                                    let double = cx.unbox_double(value);
                                    cx.b.fcmp(FloatCC::Unordered, double, double)
                                },
                                |cx| cx.b.i32(1),
                            )
                        },
                    )
                });
            }
            UseKind::Boolean => {
                self.type_check(id, SpeculatedType::BOOLEAN, bad, Some(value), |cx| {
                    let is = cx.is_boolean(value);
                    cx.b.icmp_imm(IntCC::Eq, is, 0)
                });
            }
            UseKind::Cell => self.speculate_cell(id, value),
            UseKind::Object => {
                self.speculate_cell(id, value);
                self.type_check(id, SpeculatedType::OBJECT, bad, Some(value), |cx| {
                    let tag = cx.cell_tag(value);
                    cx.is_not_object_tag(tag)
                });
            }
            UseKind::Function => self.speculate_cell_type(id, value, SpeculatedType::FUNCTION, CellType::Function),
            UseKind::FinalObject => {
                self.speculate_cell_type(id, value, SpeculatedType::FINAL_OBJECT, CellType::FinalObject)
            }
            UseKind::String => self.speculate_cell_type(id, value, SpeculatedType::STRING, CellType::String),
            UseKind::StringObject => {
                self.speculate_cell_type(id, value, SpeculatedType::STRING_OBJECT, CellType::StringObject)
            }
            UseKind::StringIdent => {
                self.speculate_cell_type(id, value, SpeculatedType::STRING, CellType::String);
                self.type_check(id, SpeculatedType::STRING_IDENT, bad, Some(value), |cx| {
                    cx.is_not_ident_string(value)
                });
            }
            UseKind::StringOrStringObject => {
                self.speculate_cell(id, value);
                let mask = SpeculatedType::STRING | SpeculatedType::STRING_OBJECT;
                self.type_check(id, mask, bad, Some(value), |cx| {
                    let tag = cx.cell_tag(value);
                    let string = cx.layout.type_of(CellType::String) as i64;
                    let object = cx.layout.type_of(CellType::StringObject) as i64;
                    let not_string = cx.b.icmp_imm(IntCC::Ne, tag, string);
                    let not_object = cx.b.icmp_imm(IntCC::Ne, tag, object);
                    cx.b.and(not_string, not_object)
                });
            }
            UseKind::NotStringVar => {
                self.type_check(id, !SpeculatedType::STRING_VAR, bad, Some(value), |cx| {
                    cx.is_string_var(value)
                });
            }
            UseKind::ObjectOrOther => {
                let mask = SpeculatedType::OBJECT | SpeculatedType::OTHER;
                self.type_check(id, mask, bad, Some(value), |cx| {
                    let is_cell = cx.is_cell(value);
                    cx.diamond(
                        Type::I32,
                        is_cell,
                        BranchWeight::Normal,
                        |cx| {
                            let tag = cx.cell_tag(value);
                            cx.is_not_object_tag(tag)
                        },
                        |cx| {
                            let is_other = cx.is_other(value);
                            cx.b.icmp_imm(IntCC::Eq, is_other, 0)
                        },
                    )
                });
            }
            UseKind::NotCell => {
                self.type_check(id, !SpeculatedType::CELL, bad, Some(value), |cx| cx.is_cell(value));
            }
            UseKind::Other => {
                self.type_check(id, SpeculatedType::OTHER, bad, Some(value), |cx| {
                    let is = cx.is_other(value);
                    cx.b.icmp_imm(IntCC::Eq, is, 0)
                });
            }
            UseKind::Misc => {
                self.type_check(id, SpeculatedType::MISC, bad, Some(value), |cx| {
                    let is = cx.is_misc(value);
                    cx.b.icmp_imm(IntCC::Eq, is, 0)
                });
            }
        }
    }

    /// Check that a boxed value is an int32.
    pub(crate) fn speculate_int32(&mut self, id: NodeId, value: Value) {
        self.type_check(id, SpeculatedType::INT32, ExitKind::BadType, Some(value), |cx| {
            cx.b.icmp_imm(IntCC::Ult, value, TAG_TYPE_NUMBER as i64)
        });
    }

    /// Check that a boxed value is a cell.
    pub(crate) fn speculate_cell(&mut self, id: NodeId, value: Value) {
        self.type_check(id, SpeculatedType::CELL, ExitKind::BadType, Some(value), |cx| {
            let is = cx.is_cell(value);
            cx.b.icmp_imm(IntCC::Eq, is, 0)
        });
    }

    /// Check that a boxed value is a cell of `cell_type`.
    pub(crate) fn speculate_cell_type(&mut self, id: NodeId, value: Value, mask: SpeculatedType, cell_type: CellType) {
        self.speculate_cell(id, value);
        self.type_check(id, mask, ExitKind::BadType, Some(value), |cx| {
            let tag = cx.cell_tag(value);
            let expected = cx.layout.type_of(cell_type) as i64;
            cx.b.icmp_imm(IntCC::Ne, tag, expected)
        });
    }

    // ---- bit tests on boxed values; every result is an `I32` flag ----

    pub(crate) fn is_int32(&mut self, value: Value) -> Value {
        self.b.icmp_imm(IntCC::Uge, value, TAG_TYPE_NUMBER as i64)
    }

    pub(crate) fn is_number(&mut self, value: Value) -> Value {
        let tag = self.b.and_imm(value, TAG_TYPE_NUMBER as i64);
        self.b.icmp_imm(IntCC::Ne, tag, 0)
    }

    pub(crate) fn is_cell(&mut self, value: Value) -> Value {
        let tag = self.b.and_imm(value, TAG_MASK as i64);
        self.b.icmp_imm(IntCC::Eq, tag, 0)
    }

    pub(crate) fn is_boolean(&mut self, value: Value) -> Value {
        let false_bits = self.b.i64(VALUE_FALSE as i64);
        let flipped = self.b.xor(value, false_bits);
        let rest = self.b.and_imm(flipped, !1);
        self.b.icmp_imm(IntCC::Eq, rest, 0)
    }

    pub(crate) fn is_other(&mut self, value: Value) -> Value {
        let cleared = self.b.and_imm(value, !(TAG_BIT_UNDEFINED as i64));
        self.b.icmp_imm(IntCC::Eq, cleared, VALUE_NULL as i64)
    }

    pub(crate) fn is_misc(&mut self, value: Value) -> Value {
        let boolean = self.is_boolean(value);
        let other = self.is_other(value);
        self.b.or(boolean, other)
    }

    /// Cell type tag of a cell.
    pub(crate) fn cell_tag(&mut self, cell: Value) -> Value {
        self.b.load8(cell, self.layout.tag_offset())
    }

    /// `I32` flag: a cell type tag belongs to an object.
    pub(crate) fn is_object_tag(&mut self, tag: Value) -> Value {
        let first = self.layout.first_object_tag() as i64;
        self.b.icmp_imm(IntCC::Uge, tag, first)
    }

    /// `I32` flag: a cell type tag belongs to a non-object cell.
    pub(crate) fn is_not_object_tag(&mut self, tag: Value) -> Value {
        let first = self.layout.first_object_tag() as i64;
        self.b.icmp_imm(IntCC::Ult, tag, first)
    }

    /// `I32` flag: the cell has `cell_type`.
    pub(crate) fn has_cell_type(&mut self, cell: Value, cell_type: CellType) -> Value {
        let tag = self.cell_tag(cell);
        let expected = self.layout.type_of(cell_type) as i64;
        self.b.icmp_imm(IntCC::Eq, tag, expected)
    }

    /// `I32` flag: a string cell is a rope or not atomized.
    pub(crate) fn is_not_ident_string(&mut self, string: Value) -> Value {
        let imp = self.b.load64(string, self.layout.field_offset(FieldKind::StringImpl));
        let rope = self.b.icmp_imm(IntCC::Eq, imp, 0);
        self.diamond(
            Type::I32,
            rope,
            BranchWeight::TakenRare,
            |cx| cx.b.i32(1),
            |cx| {
                let flags = cx.b.load32(imp, cx.layout.field_offset(FieldKind::StringImplFlags));
                let atomic = cx.b.and_imm(flags, string_flags::IS_ATOMIC as i64);
                cx.b.icmp_imm(IntCC::Eq, atomic, 0)
            },
        )
    }

    /// `I32` flag: any boxed value is a string that is not an identifier.
    pub(crate) fn is_string_var(&mut self, value: Value) -> Value {
        let is_cell = self.is_cell(value);
        self.diamond(
            Type::I32,
            is_cell,
            BranchWeight::Normal,
            |cx| {
                let is_string = cx.has_cell_type(value, CellType::String);
                cx.diamond(
                    Type::I32,
                    is_string,
                    BranchWeight::Normal,
                    |cx| cx.is_not_ident_string(value),
                    |cx| cx.b.i32(0),
                )
            },
            |cx| cx.b.i32(0),
        )
    }
}

#[cfg(test)]
mod tests {
    use crate::config::LoweringOptions;
    use crate::exit::ExitKind;
    use crate::lir::eval::EvalOutcome;
    use crate::lower::{LoweredFunction, lower};
    use crate::object_layout::{DefaultObjectLayout, FieldKind, ObjectLayout};
    use crate::testing;
    use crate::value::box_int32;
    use strata_ir::{Edge, GraphBuilder, NodeResult, Op, UseKind};

    const CELL: u64 = 0x20_0000;

    /// `Check(x: kind); Check(y: kind); return x`, where `y` is `x` itself
    /// or a second read of the same argument.
    fn checked_twice(kind: UseKind, reread: bool, layout: &dyn ObjectLayout) -> LoweredFunction {
        let mut b = GraphBuilder::new("checked_twice", 2, 0);
        let entry = b.entry();
        let x = testing::get_argument(&mut b, entry, 1);
        b.add(entry, Op::Check, [Edge::new(x, kind)], NodeResult::None);
        let y = if reread { testing::get_argument(&mut b, entry, 1) } else { x };
        b.add(entry, Op::Check, [Edge::new(y, kind)], NodeResult::None);
        b.add(entry, Op::Return, [Edge::untyped(x)], NodeResult::None);
        let graph = b.build().expect("valid graph");
        lower(&graph, &LoweringOptions::default(), layout)
    }

    fn outcome(lowered: &LoweredFunction, argument: u64, tag: u8) -> Result<u64, ExitKind> {
        let mut memory = testing::frame_memory(&[argument]);
        memory.write(CELL + DefaultObjectLayout.tag_offset() as u64, 1, tag as u64);
        match testing::run_in(lowered, &mut memory) {
            EvalOutcome::Returned(bits) => Ok(bits),
            EvalOutcome::Exited { exit, .. } => Err(lowered.exits.exits[exit.0 as usize].kind),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn elided_checks_do_not_change_behaviour() {
        let elided = checked_twice(UseKind::Cell, false, &DefaultObjectLayout);
        let emitted = checked_twice(UseKind::Cell, true, &DefaultObjectLayout);
        assert_eq!(elided.stats.checks_elided, emitted.stats.checks_elided + 1);
        assert_eq!(elided.stats.checks_emitted + 1, emitted.stats.checks_emitted);

        for argument in [CELL, box_int32(3), crate::value::VALUE_NULL] {
            let a = outcome(&elided, argument, 0x20);
            let b = outcome(&emitted, argument, 0x20);
            assert_eq!(a, b, "{argument:#x}");
        }
        assert_eq!(outcome(&elided, CELL, 0x20), Ok(CELL));
        assert!(outcome(&elided, box_int32(3), 0x20).is_err());
    }

    #[derive(Debug)]
    struct HighObjectTags;

    impl ObjectLayout for HighObjectTags {
        fn field_offset(&self, kind: FieldKind) -> i32 {
            DefaultObjectLayout.field_offset(kind)
        }

        fn first_object_tag(&self) -> u8 {
            0x30
        }
    }

    #[test]
    fn object_checks_follow_the_layout() {
        let default = checked_twice(UseKind::Object, false, &DefaultObjectLayout);
        let high = checked_twice(UseKind::Object, false, &HighObjectTags);
        assert_eq!(outcome(&default, CELL, 0x20), Ok(CELL));
        assert_eq!(outcome(&high, CELL, 0x20), Err(ExitKind::BadType));
        assert_eq!(outcome(&high, CELL, 0x30), Ok(CELL));
    }
}
