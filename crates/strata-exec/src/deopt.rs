//! Exit-time frame reconstruction.
//!
//! When native code leaves through an exit it hands over the exit index and
//! the stackmap values captured at the exit's cold block. [`ExitResolver`]
//! turns those into the boxed operands of the unoptimized frame:
//!
//! 1. Every phantom allocation the exit references is rebuilt through the
//!    caller's [`Materializer`], dependencies first.
//! 2. Every operand is read from its source (constant, frame slot, stackmap
//!    entry, recovery or materialization) and reboxed according to its
//!    [`ValueFormat`].
//!
//! Dead operands come back as `undefined`.

use std::fmt;

use strata_ir::{CodeOrigin, Operand, Operands, PromotedLocation};
use strata_jit::exit::{
    ExitTimeObjectMaterialization, MaterializationId, MaterializationKind, RecoveryOp, ValueFormat,
};
use strata_jit::value::{
    INT52_SHIFT, VALUE_UNDEFINED, box_boolean, box_double, box_int32, box_int52,
};
use strata_jit::{ExitId, ExitKind, ExitTable, ExitValue, OsrExit};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Failure to resolve an exit from what the runtime captured.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeoptError {
    /// The exit index is not in the table.
    #[error("unknown exit {0}")]
    UnknownExit(ExitId),

    /// The captured stackmap is shorter than the exit record needs.
    #[error("exit {exit} reads {needed} stackmap values but only {captured} were captured")]
    StackmapTooShort {
        /// Exit being resolved.
        exit: ExitId,
        /// Values the record reads.
        needed: usize,
        /// Values the runtime handed over.
        captured: usize,
    },

    /// The captured frame has a different shape than the exit record.
    #[error("exit {exit} describes {expected} operands but the frame has {actual}")]
    FrameShapeMismatch {
        /// Exit being resolved.
        exit: ExitId,
        /// Operands in the record.
        expected: usize,
        /// Operands in the frame.
        actual: usize,
    },
}

/// Resolved field values of one phantom allocation.
#[derive(Debug, Clone, Copy)]
pub struct MaterializedFields<'a> {
    /// Arena index of the allocation.
    pub id: MaterializationId,
    /// Source position of the sunk allocation.
    pub origin: CodeOrigin,
    fields: &'a [(PromotedLocation, u64)],
}

impl<'a> MaterializedFields<'a> {
    /// Boxed value of a field, if the allocation recorded it.
    pub fn get(&self, location: PromotedLocation) -> Option<u64> {
        self.fields
            .iter()
            .find(|(loc, _)| *loc == location)
            .map(|(_, value)| *value)
    }

    /// Every recorded field, in record order.
    pub fn iter(&self) -> impl Iterator<Item = (PromotedLocation, u64)> + 'a {
        self.fields.iter().copied()
    }

    /// Number of recorded fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// No fields were recorded.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Allocates the real objects behind phantom allocations.
///
/// Each method receives fully resolved, boxed field values and returns the
/// boxed pointer of the new cell. Fields that are themselves phantom
/// allocations have already been built.
pub trait Materializer {
    /// Plain object with the recorded structure and named properties.
    fn new_object(&mut self, fields: &MaterializedFields<'_>) -> u64;

    /// Closure over the recorded executable and scope.
    fn new_function(&mut self, fields: &MaterializedFields<'_>) -> u64;

    /// Activation with the recorded scope, symbol table and closure variables.
    fn create_activation(&mut self, fields: &MaterializedFields<'_>) -> u64;

    /// Unmapped arguments object.
    fn direct_arguments(&mut self, fields: &MaterializedFields<'_>) -> u64;

    /// Cloned arguments object.
    fn cloned_arguments(&mut self, fields: &MaterializedFields<'_>) -> u64;
}

/// Operands of the unoptimized frame, boxed and ready to resume.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedFrame {
    /// Exit that fired.
    pub exit: ExitId,
    /// Reason.
    pub kind: ExitKind,
    /// Bytecode position to resume at.
    pub origin: CodeOrigin,
    /// Boxed value of every operand.
    pub operands: Operands<u64>,
    /// The value whose check failed, when the exit profiles one.
    pub profiled_value: Option<u64>,
    /// Boxed cells built for phantom allocations, by arena index.
    pub materialized: Vec<(MaterializationId, u64)>,
}

impl ResolvedFrame {
    /// Boxed value of an operand.
    pub fn operand(&self, operand: Operand) -> u64 {
        self.operands.get(operand).copied().unwrap_or(VALUE_UNDEFINED)
    }
}

/// Rebuilds unoptimized frames from the exit records of one compiled function.
#[derive(Debug, Clone, Copy)]
pub struct ExitResolver<'t> {
    table: &'t ExitTable,
}

impl<'t> ExitResolver<'t> {
    /// Resolver over `table`.
    pub fn new(table: &'t ExitTable) -> Self {
        Self { table }
    }

    /// Resolve exit `id`.
    ///
    /// `stackmap` holds the raw values the exit's cold block stored and
    /// `frame` the raw contents of every frame slot at the time of the exit.
    pub fn resolve(
        &self,
        id: ExitId,
        stackmap: &[u64],
        frame: &Operands<u64>,
        materializer: &mut dyn Materializer,
    ) -> Result<ResolvedFrame, DeoptError> {
        let exit = self.table.exit(id).ok_or(DeoptError::UnknownExit(id))?;
        let needed = self.table.stackmap_len(id).unwrap_or(0);
        if stackmap.len() < needed {
            return Err(DeoptError::StackmapTooShort {
                exit: id,
                needed,
                captured: stackmap.len(),
            });
        }
        if frame.num_arguments() != exit.values.num_arguments()
            || frame.num_locals() != exit.values.num_locals()
        {
            return Err(DeoptError::FrameShapeMismatch {
                exit: id,
                expected: exit.values.len(),
                actual: frame.len(),
            });
        }

        let mut cx = ResolveCx {
            table: self.table,
            exit_id: id,
            stackmap,
            frame,
            materialized: vec![None; self.table.materializations.len()],
        };
        cx.materialize_all(exit, materializer)?;

        let mut operands = Operands::new(
            exit.values.num_arguments(),
            exit.values.num_locals(),
            VALUE_UNDEFINED,
        );
        for (operand, value) in exit.values.iter() {
            operands.set(operand, cx.boxed(value)?);
        }
        let profiled_value = exit
            .profile_value
            .map(|index| cx.captured(index))
            .transpose()?;
        let materialized = cx
            .materialized
            .iter()
            .enumerate()
            .filter_map(|(i, cell)| cell.map(|cell| (MaterializationId(i as u32), cell)))
            .collect();

        debug!(
            target: "strata::deopt",
            exit = %id,
            kind = %exit.kind,
            origin = exit.origin.bytecode_index,
            stackmap = stackmap.len(),
            "resolved exit"
        );
        Ok(ResolvedFrame {
            exit: id,
            kind: exit.kind,
            origin: exit.origin,
            operands,
            profiled_value,
            materialized,
        })
    }
}

struct ResolveCx<'a> {
    table: &'a ExitTable,
    exit_id: ExitId,
    stackmap: &'a [u64],
    frame: &'a Operands<u64>,
    materialized: Vec<Option<u64>>,
}

impl ResolveCx<'_> {
    fn crash(&self, message: impl fmt::Display) -> ! {
        error!(target: "strata::deopt", exit = %self.exit_id, "{message}");
        panic!("strata deopt crash at exit {}: {message}", self.exit_id);
    }

    fn record(&self, id: MaterializationId) -> &ExitTimeObjectMaterialization {
        match self.table.materialization(id) {
            Some(record) => record,
            None => self.crash(format_args!("dangling materialization {}", id.0)),
        }
    }

    /// Materializations reachable from the exit's operands, transitively.
    fn reachable(&self, exit: &OsrExit) -> Vec<MaterializationId> {
        let mut seen = vec![false; self.table.materializations.len()];
        let mut stack: Vec<MaterializationId> = exit.materialization_roots().collect();
        let mut order = Vec::new();
        while let Some(id) = stack.pop() {
            let record = self.record(id);
            if std::mem::replace(&mut seen[id.index()], true) {
                continue;
            }
            order.push(id);
            stack.extend(record.dependencies());
        }
        order.sort_unstable();
        order
    }

    /// Build every reachable materialization, a dependency-ready round at a
    /// time. A round without progress means the dependencies form a cycle.
    fn materialize_all(
        &mut self,
        exit: &OsrExit,
        materializer: &mut dyn Materializer,
    ) -> Result<(), DeoptError> {
        let mut pending = self.reachable(exit);
        let mut round = 0;
        while !pending.is_empty() {
            round += 1;
            let before = pending.len();
            let mut waiting = Vec::with_capacity(pending.len());
            for id in pending {
                let ready = self
                    .record(id)
                    .dependencies()
                    .all(|dep| self.materialized[dep.index()].is_some());
                if ready {
                    self.materialize(id, materializer)?;
                } else {
                    waiting.push(id);
                }
            }
            if waiting.len() == before {
                let ids: Vec<u32> = waiting.iter().map(|id| id.0).collect();
                self.crash(format_args!("materialization cycle among {ids:?}"));
            }
            pending = waiting;
        }
        if round > 0 {
            trace!(target: "strata::deopt", exit = %self.exit_id, rounds = round, "materialized");
        }
        Ok(())
    }

    fn materialize(
        &mut self,
        id: MaterializationId,
        materializer: &mut dyn Materializer,
    ) -> Result<(), DeoptError> {
        let table = self.table;
        let Some(record) = table.materialization(id) else {
            self.crash(format_args!("dangling materialization {}", id.0));
        };
        let fields = record
            .properties
            .iter()
            .map(|(location, value)| Ok((*location, self.boxed(value)?)))
            .collect::<Result<Vec<(PromotedLocation, u64)>, DeoptError>>()?;
        let view = MaterializedFields {
            id,
            origin: record.origin,
            fields: &fields,
        };
        let cell = match record.kind {
            MaterializationKind::NewObject => materializer.new_object(&view),
            MaterializationKind::NewFunction => materializer.new_function(&view),
            MaterializationKind::CreateActivation => materializer.create_activation(&view),
            MaterializationKind::DirectArguments => materializer.direct_arguments(&view),
            MaterializationKind::ClonedArguments => materializer.cloned_arguments(&view),
        };
        trace!(
            target: "strata::deopt",
            materialization = id.0,
            kind = ?record.kind,
            cell,
            "materialized allocation"
        );
        self.materialized[id.index()] = Some(cell);
        Ok(())
    }

    /// Raw stackmap value at `index`.
    fn captured(&self, index: u32) -> Result<u64, DeoptError> {
        self.stackmap
            .get(index as usize)
            .copied()
            .ok_or(DeoptError::StackmapTooShort {
                exit: self.exit_id,
                needed: index as usize + 1,
                captured: self.stackmap.len(),
            })
    }

    fn boxed(&self, value: &ExitValue) -> Result<u64, DeoptError> {
        Ok(match value {
            ExitValue::Dead => VALUE_UNDEFINED,
            ExitValue::Constant(bits) => *bits,
            ExitValue::InJsStack { slot, format } => {
                let Some(raw) = self.frame.get(*slot) else {
                    self.crash(format_args!("frame slot {slot} out of range"));
                };
                rebox(*raw, *format)
            }
            ExitValue::Argument { index, format } => rebox(self.captured(*index)?, *format),
            ExitValue::Recovery {
                op,
                left,
                right,
                format,
            } => {
                let left = self.captured(*left)?;
                let right = self.captured(*right)?;
                match recover(*op, left, right, *format) {
                    Some(raw) => rebox(raw, *format),
                    None => self.crash(format_args!("recovery in {format:?} format")),
                }
            }
            ExitValue::Materialize(id) => match self.materialized.get(id.index()).copied().flatten() {
                Some(cell) => cell,
                None => self.crash(format_args!("materialization {} read before it was built", id.0)),
            },
        })
    }
}

/// Box a raw machine value of the given format.
pub fn rebox(raw: u64, format: ValueFormat) -> u64 {
    match format {
        ValueFormat::Int32 => box_int32(raw as u32 as i32),
        ValueFormat::Int52 => box_int52((raw as i64) >> INT52_SHIFT),
        ValueFormat::StrictInt52 => box_int52(raw as i64),
        ValueFormat::Double => box_double(f64::from_bits(raw)),
        ValueFormat::Boolean => box_boolean(raw & 1 != 0),
        ValueFormat::Cell | ValueFormat::JsValue => raw,
    }
}

/// Apply a recovery to two raw values, wrapping at the format's width.
///
/// Returns the raw result in the same format, or `None` for formats that
/// recoveries are never recorded in.
pub fn recover(op: RecoveryOp, left: u64, right: u64, format: ValueFormat) -> Option<u64> {
    match format {
        ValueFormat::Int32 => {
            let (l, r) = (left as u32 as i32, right as u32 as i32);
            let result = match op {
                RecoveryOp::Add => l.wrapping_add(r),
                RecoveryOp::Sub => l.wrapping_sub(r),
            };
            Some(result as u32 as u64)
        }
        // Shifted int52 values add and subtract in place.
        ValueFormat::Int52 | ValueFormat::StrictInt52 => {
            let (l, r) = (left as i64, right as i64);
            let result = match op {
                RecoveryOp::Add => l.wrapping_add(r),
                RecoveryOp::Sub => l.wrapping_sub(r),
            };
            let result = match format {
                ValueFormat::StrictInt52 => wrap_int52(result),
                _ => result,
            };
            Some(result as u64)
        }
        ValueFormat::Double | ValueFormat::Boolean | ValueFormat::Cell | ValueFormat::JsValue => {
            None
        }
    }
}

/// Sign-extend the low 52 bits.
fn wrap_int52(value: i64) -> i64 {
    (value << INT52_SHIFT) >> INT52_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_jit::value::{VALUE_FALSE, VALUE_TRUE, unbox_double};

    #[test]
    fn int32_reboxes_from_the_low_word() {
        assert_eq!(rebox(0xFFFF_FFFF, ValueFormat::Int32), box_int32(-1));
        assert_eq!(rebox(0xDEAD_0000_0000_0007, ValueFormat::Int32), box_int32(7));
    }

    #[test]
    fn int52_reboxes_as_int32_when_it_fits() {
        let small = 12i64 << INT52_SHIFT;
        assert_eq!(rebox(small as u64, ValueFormat::Int52), box_int32(12));
        let big = 1i64 << 40;
        assert_eq!(rebox((big << INT52_SHIFT) as u64, ValueFormat::Int52), box_double(big as f64));
        assert_eq!(rebox(big as u64, ValueFormat::StrictInt52), box_double(big as f64));
    }

    #[test]
    fn doubles_are_purified() {
        let impure = 0xFFFF_0000_0000_0001u64;
        let boxed = rebox(impure, ValueFormat::Double);
        assert!(unbox_double(boxed).is_nan());
        assert_eq!(boxed, box_double(f64::NAN));
    }

    #[test]
    fn booleans_rebox_from_bit_zero() {
        assert_eq!(rebox(1, ValueFormat::Boolean), VALUE_TRUE);
        assert_eq!(rebox(0, ValueFormat::Boolean), VALUE_FALSE);
    }

    #[test]
    fn int32_recovery_wraps() {
        let raw = recover(RecoveryOp::Add, i32::MAX as u32 as u64, 1, ValueFormat::Int32);
        assert_eq!(raw, Some(i32::MIN as u32 as u64));
        let raw = recover(RecoveryOp::Sub, i32::MIN as u32 as u64, 1, ValueFormat::Int32);
        assert_eq!(raw, Some(i32::MAX as u32 as u64));
    }

    #[test]
    fn strict_int52_recovery_wraps_at_52_bits() {
        let max = (1i64 << 51) - 1;
        let raw = recover(RecoveryOp::Add, max as u64, 1, ValueFormat::StrictInt52);
        assert_eq!(raw, Some((-(1i64 << 51)) as u64));
    }

    struct Cells(u64);

    impl Materializer for Cells {
        fn new_object(&mut self, _: &MaterializedFields<'_>) -> u64 {
            self.0 += 0x100;
            self.0
        }

        fn new_function(&mut self, fields: &MaterializedFields<'_>) -> u64 {
            self.new_object(fields)
        }

        fn create_activation(&mut self, fields: &MaterializedFields<'_>) -> u64 {
            self.new_object(fields)
        }

        fn direct_arguments(&mut self, fields: &MaterializedFields<'_>) -> u64 {
            self.new_object(fields)
        }

        fn cloned_arguments(&mut self, fields: &MaterializedFields<'_>) -> u64 {
            self.new_object(fields)
        }
    }

    /// Local 0 is a phantom arguments object whose only field lives at
    /// stackmap index 2.
    fn arguments_exit() -> ExitTable {
        let mut table = ExitTable::new();
        let arguments = table.push_materialization(ExitTimeObjectMaterialization {
            kind: MaterializationKind::DirectArguments,
            origin: CodeOrigin::new(0),
            properties: vec![(
                PromotedLocation::Argument(0),
                ExitValue::Argument {
                    index: 2,
                    format: ValueFormat::Int32,
                },
            )],
        });
        let mut values = Operands::new(1, 1, ExitValue::Dead);
        values.set(Operand::Local(0), ExitValue::Materialize(arguments));
        table.push_exit(OsrExit {
            kind: ExitKind::ExoticObjectMode,
            origin: CodeOrigin::new(1),
            profile_value: None,
            values,
        });
        table
    }

    #[test]
    fn short_stackmaps_behind_materializations_are_errors() {
        let table = arguments_exit();
        let frame = Operands::new(1, 1, 0);
        let result = ExitResolver::new(&table).resolve(ExitId(0), &[0, 0], &frame, &mut Cells(0));
        assert_eq!(
            result,
            Err(DeoptError::StackmapTooShort {
                exit: ExitId(0),
                needed: 3,
                captured: 2,
            })
        );

        let resolved = ExitResolver::new(&table)
            .resolve(ExitId(0), &[0, 0, 9], &frame, &mut Cells(0))
            .expect("exit should resolve");
        assert_eq!(resolved.operand(Operand::Local(0)), 0x100);
    }

    #[test]
    fn doubles_have_no_recovery() {
        assert_eq!(recover(RecoveryOp::Add, 0, 0, ValueFormat::Double), None);
    }
}
