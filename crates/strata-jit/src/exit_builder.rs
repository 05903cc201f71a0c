//! Construction of exit records from the availability map.
//!
//! Each operand resolves in order: a live flushed slot, a phantom
//! allocation, a constant, a lowered value (passed through the stackmap), an
//! arithmetic recovery, and finally dead.

use rustc_hash::FxHashMap;
use strata_ir::{Edge, NodeId, NodeResult, Op, Operands};

use crate::availability::Availability;
use crate::config::ExitLivenessMode;
use crate::exit::{
    ExitId, ExitKind, ExitTimeObjectMaterialization, ExitValue, MaterializationId,
    MaterializationKind, OsrExit, RecoveryOp, ValueFormat,
};
use crate::lir::Value;
use crate::lower::{LowerCx, Repr};
use crate::value::box_frozen;

/// Values an exit reads, numbered in first-use order.
#[derive(Debug, Default)]
struct Stackmap {
    values: Vec<Value>,
    index: FxHashMap<Value, u32>,
}

impl Stackmap {
    fn push(&mut self, value: Value) -> u32 {
        *self.index.entry(value).or_insert_with(|| {
            self.values.push(value);
            (self.values.len() - 1) as u32
        })
    }
}

/// Representations searched for a lowered value, best first.
const PREFERRED: [(Repr, ValueFormat); 6] = [
    (Repr::Int32, ValueFormat::Int32),
    (Repr::Int52, ValueFormat::Int52),
    (Repr::StrictInt52, ValueFormat::StrictInt52),
    (Repr::Boolean, ValueFormat::Boolean),
    (Repr::Double, ValueFormat::Double),
    (Repr::JsValue, ValueFormat::JsValue),
];

impl LowerCx<'_> {
    /// Record an exit at the current position. Returns its id and the
    /// stackmap to attach to the exit terminator.
    pub(crate) fn build_exit(&mut self, kind: ExitKind, profile: Option<Value>) -> (ExitId, Vec<Value>) {
        let graph = self.graph;
        let origin = self.origin;
        let mut stackmap = Stackmap::default();
        let profile_value = profile.map(|value| stackmap.push(value));
        let mut materialized = FxHashMap::default();

        let operands: Vec<_> = self
            .availability
            .locals
            .iter()
            .map(|(operand, availability)| (operand, *availability))
            .collect();
        let mut values = Operands::new(
            graph.num_arguments as usize,
            graph.num_locals as usize,
            ExitValue::Dead,
        );
        for (operand, availability) in operands {
            let live = graph.is_live_in_bytecode(operand, origin);
            if self.options.validate_exit_liveness && live && availability.is_dead() {
                self.crash(format_args!(
                    "{operand} is live in bytecode at {origin} but was killed"
                ));
            }
            if self.options.exit_liveness == ExitLivenessMode::Pruned && !live {
                continue;
            }
            let value = self.exit_value(availability, &mut stackmap, &mut materialized);
            values.set(operand, value);
        }

        let id = self.exits.push_exit(OsrExit {
            kind,
            origin,
            profile_value,
            values,
        });
        self.stats.exits += 1;
        (id, stackmap.values)
    }

    fn exit_value(
        &mut self,
        availability: Availability,
        stackmap: &mut Stackmap,
        materialized: &mut FxHashMap<NodeId, MaterializationId>,
    ) -> ExitValue {
        if let Some(flush) = availability.live_flush() {
            if let Some(format) = ValueFormat::from_flush(flush.format) {
                return ExitValue::InJsStack {
                    slot: flush.slot,
                    format,
                };
            }
        }
        match availability.node {
            Some(node) => self.exit_value_for_node(node, stackmap, materialized),
            None => ExitValue::Dead,
        }
    }

    fn exit_value_for_node(
        &mut self,
        id: NodeId,
        stackmap: &mut Stackmap,
        materialized: &mut FxHashMap<NodeId, MaterializationId>,
    ) -> ExitValue {
        let graph = self.graph;
        let node = graph.node(id);
        if node.op.is_phantom_allocation() {
            return ExitValue::Materialize(self.materialize_at_exit(id, stackmap, materialized));
        }
        match &node.op {
            Op::JsConstant(value) => return ExitValue::Constant(box_frozen(value)),
            Op::DoubleConstant(bits) => {
                return ExitValue::Constant(crate::value::box_number(f64::from_bits(*bits)));
            }
            Op::Int52Constant(value) => return ExitValue::Constant(crate::value::box_int52(*value)),
            _ => {}
        }
        for (repr, format) in PREFERRED {
            if let Some(value) = self.cached(id, repr) {
                let format = match (format, node.result) {
                    (ValueFormat::JsValue, NodeResult::Cell) => ValueFormat::Cell,
                    (format, _) => format,
                };
                return ExitValue::Argument {
                    index: stackmap.push(value),
                    format,
                };
            }
        }
        if self.exit_only.contains(&id) {
            let op = match node.op {
                Op::ArithAdd(_) => RecoveryOp::Add,
                _ => RecoveryOp::Sub,
            };
            if let (Some(left), Some(right)) = (
                self.int32_for_exit(node.child1()),
                self.int32_for_exit(node.child2()),
            ) {
                return ExitValue::Recovery {
                    op,
                    left: stackmap.push(left),
                    right: stackmap.push(right),
                    format: ValueFormat::Int32,
                };
            }
        }
        ExitValue::Dead
    }

    /// Int32 operand of a recovery, without emitting checks.
    fn int32_for_exit(&mut self, edge: Edge) -> Option<Value> {
        if let Some(value) = self.cached(edge.node, Repr::Int32) {
            return Some(value);
        }
        match &self.graph.node(edge.node).op {
            Op::JsConstant(strata_ir::FrozenValue::Int32(value)) => Some(self.b.i32(*value)),
            _ => None,
        }
    }

    fn materialize_at_exit(
        &mut self,
        allocation: NodeId,
        stackmap: &mut Stackmap,
        materialized: &mut FxHashMap<NodeId, MaterializationId>,
    ) -> MaterializationId {
        if let Some(&id) = materialized.get(&allocation) {
            return id;
        }
        let node = self.graph.node(allocation);
        let kind = match node.op {
            Op::PhantomNewObject => MaterializationKind::NewObject,
            Op::PhantomNewFunction => MaterializationKind::NewFunction,
            Op::PhantomCreateActivation => MaterializationKind::CreateActivation,
            Op::PhantomDirectArguments => MaterializationKind::DirectArguments,
            Op::PhantomClonedArguments => MaterializationKind::ClonedArguments,
            _ => self.crash(format_args!("{allocation} is not a phantom allocation")),
        };
        // Reserve the id first so cyclic references resolve to it.
        let id = self.exits.push_materialization(ExitTimeObjectMaterialization {
            kind,
            origin: node.origin,
            properties: Vec::new(),
        });
        materialized.insert(allocation, id);

        let fields: Vec<_> = self.availability.fields_of(allocation).collect();
        let mut properties = Vec::with_capacity(fields.len());
        for (location, availability) in fields {
            let value = self.exit_value(availability, stackmap, materialized);
            properties.push((location, value));
        }
        self.exits.materializations[id.index()].properties = properties;
        id
    }
}

#[cfg(test)]
mod tests {
    use crate::config::LoweringOptions;
    use crate::exit::{ExitKind, ExitValue, ValueFormat};
    use crate::lir::eval::EvalOutcome;
    use crate::lower::LoweredFunction;
    use crate::testing;
    use crate::value::box_int32;
    use strata_ir::{
        CodeOrigin, Edge, FlushFormat, FrozenValue, GraphBuilder, NodeResult, Op, Operand,
        StackAccessData, UseKind,
    };

    /// Flush the argument to local 3 as an int32, hint 42 into local 4, then
    /// exit at bytecode 2 where only local 3 is live.
    fn flushed_and_hinted(options: &LoweringOptions) -> LoweredFunction {
        let mut b = GraphBuilder::new("flushed_and_hinted", 2, 5);
        b.live_at(0, [Operand::Argument(1)]);
        b.live_at(2, [Operand::Local(3)]);
        let entry = b.entry();
        let x = testing::get_argument(&mut b, entry, 1);
        b.add(
            entry,
            Op::PutStack(StackAccessData {
                local: Operand::Local(3),
                machine_local: Operand::Local(3),
                format: FlushFormat::Int32,
            }),
            [Edge::new(x, UseKind::Int32)],
            NodeResult::None,
        );
        let answer = b.add(entry, Op::JsConstant(FrozenValue::Int32(42)), [], NodeResult::JsValue);
        b.add(entry, Op::MovHint(Operand::Local(4)), [Edge::untyped(answer)], NodeResult::None);
        b.set_origin(2);
        b.add(entry, Op::ForceOsrExit, [], NodeResult::None);
        b.add(entry, Op::Return, [Edge::untyped(x)], NodeResult::None);
        let graph = b.build().expect("valid graph");
        testing::lower_default(&graph, options)
    }

    fn forced_exit(lowered: &LoweredFunction) -> &crate::exit::OsrExit {
        let outcome = testing::run(lowered, &[box_int32(7)]);
        let EvalOutcome::Exited { exit, .. } = outcome else {
            panic!("expected an exit, got {outcome:?}");
        };
        let record = &lowered.exits.exits[exit.0 as usize];
        assert_eq!(record.kind, ExitKind::InadequateCoverage);
        assert_eq!(record.origin, CodeOrigin::new(2));
        record
    }

    #[test]
    fn flushed_slot_and_hinted_constant_are_restored() {
        let lowered = flushed_and_hinted(&LoweringOptions::conservative());
        let exit = forced_exit(&lowered);
        assert_eq!(
            exit.value(Operand::Local(3)),
            &ExitValue::InJsStack {
                slot: Operand::Local(3),
                format: ValueFormat::Int32,
            }
        );
        assert_eq!(exit.value(Operand::Local(4)), &ExitValue::Constant(box_int32(42)));
        assert_eq!(exit.value(Operand::Local(0)), &ExitValue::Dead);
    }

    #[test]
    fn pruned_exits_drop_operands_dead_in_bytecode() {
        let lowered = flushed_and_hinted(&LoweringOptions::default());
        let exit = forced_exit(&lowered);
        assert!(matches!(
            exit.value(Operand::Local(3)),
            ExitValue::InJsStack { slot: Operand::Local(3), format: ValueFormat::Int32 }
        ));
        assert_eq!(exit.value(Operand::Local(4)), &ExitValue::Dead);
    }
}
