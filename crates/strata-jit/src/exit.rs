//! OSR exit records.
//!
//! An [`OsrExit`] is created for every check that can fail. It names the
//! reason, the source position and, for every operand of the unoptimized
//! frame, an [`ExitValue`] telling the deoptimization runtime how to rebuild
//! it. Values that only exist in registers are referenced by their index in
//! the stackmap attached to the exit's [`Terminator::Exit`](crate::lir::Terminator).
//!
//! Phantom allocations are described by [`ExitTimeObjectMaterialization`]
//! records stored in an arena and referenced by [`MaterializationId`].

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_ir::{CodeOrigin, FlushFormat, Operand, Operands, PromotedLocation};

/// Why an exit fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExitKind {
    /// A value had an unexpected type.
    BadType,
    /// A cell had an unexpected structure.
    BadCache,
    /// A constant's structure changed.
    BadConstantCache,
    /// A value was not the expected cell.
    BadCell,
    /// A cell had an unexpected indexing shape.
    BadIndexingType,
    /// Int32 arithmetic overflowed.
    Overflow,
    /// Int52 arithmetic overflowed.
    Int52Overflow,
    /// An integer result would have been -0.
    NegativeZero,
    /// An index was out of bounds.
    OutOfBounds,
    /// An element load found a hole.
    LoadFromHole,
    /// Generic or rarely taken path.
    Uncountable,
    /// The compiled code was invalidated.
    UncountableInvalidation,
    /// An arguments object left its fast mode.
    ExoticObjectMode,
    /// A varargs call needed more stack than is available.
    VarargsOverflow,
    /// Profiling never reached this point.
    InadequateCoverage,
    /// A binding was read before initialization.
    TdzFailure,
}

impl ExitKind {
    /// Every kind, in discriminant order.
    pub const ALL: [ExitKind; 16] = [
        Self::BadType,
        Self::BadCache,
        Self::BadConstantCache,
        Self::BadCell,
        Self::BadIndexingType,
        Self::Overflow,
        Self::Int52Overflow,
        Self::NegativeZero,
        Self::OutOfBounds,
        Self::LoadFromHole,
        Self::Uncountable,
        Self::UncountableInvalidation,
        Self::ExoticObjectMode,
        Self::VarargsOverflow,
        Self::InadequateCoverage,
        Self::TdzFailure,
    ];

    /// Exit reflects a type mismatch whose observed value is worth profiling.
    pub const fn records_value_profile(self) -> bool {
        matches!(
            self,
            Self::BadType | Self::BadCache | Self::BadConstantCache | Self::BadCell
        )
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Exit record handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExitId(pub u32);

impl ExitId {
    /// Index into [`ExitTable::exits`].
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ExitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit{}", self.0)
    }
}

/// Materialization handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MaterializationId(pub u32);

impl MaterializationId {
    /// Index into [`ExitTable::materializations`].
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Machine format of a value an exit reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueFormat {
    /// Int32 in the low 32 bits.
    Int32,
    /// Int52 shifted left by [`INT52_SHIFT`](crate::value::INT52_SHIFT).
    Int52,
    /// Unshifted int52.
    StrictInt52,
    /// Raw double bits.
    Double,
    /// 0/1.
    Boolean,
    /// Cell pointer.
    Cell,
    /// Boxed value.
    JsValue,
}

impl ValueFormat {
    /// Format of a flushed slot, or `None` when the slot holds nothing usable.
    pub const fn from_flush(format: FlushFormat) -> Option<Self> {
        match format {
            FlushFormat::Int32 => Some(Self::Int32),
            FlushFormat::Int52 => Some(Self::Int52),
            FlushFormat::Double => Some(Self::Double),
            FlushFormat::Boolean => Some(Self::Boolean),
            FlushFormat::Cell => Some(Self::Cell),
            FlushFormat::JsValue => Some(Self::JsValue),
            FlushFormat::Dead | FlushFormat::Conflicting => None,
        }
    }
}

/// Arithmetic used to recover a value that was overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecoveryOp {
    /// `left + right`
    Add,
    /// `left - right`
    Sub,
}

/// How to rebuild one operand at exit time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitValue {
    /// Nothing to restore.
    Dead,
    /// A boxed constant.
    Constant(u64),
    /// Read from a frame slot.
    InJsStack {
        /// Slot.
        slot: Operand,
        /// Format of the slot's contents.
        format: ValueFormat,
    },
    /// Read from the stackmap.
    Argument {
        /// Stackmap index.
        index: u32,
        /// Format of the value.
        format: ValueFormat,
    },
    /// Combine two stackmap values.
    Recovery {
        /// Operation.
        op: RecoveryOp,
        /// Stackmap index of the left operand.
        left: u32,
        /// Stackmap index of the right operand.
        right: u32,
        /// Format of both operands and the result.
        format: ValueFormat,
    },
    /// Pointer to a materialized phantom allocation.
    Materialize(MaterializationId),
}

impl ExitValue {
    /// Value is [`ExitValue::Dead`].
    pub const fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }

    /// Stackmap indices the value reads.
    pub fn argument_indices(&self) -> impl Iterator<Item = u32> {
        let (a, b) = match self {
            Self::Argument { index, .. } => (Some(*index), None),
            Self::Recovery { left, right, .. } => (Some(*left), Some(*right)),
            _ => (None, None),
        };
        a.into_iter().chain(b)
    }
}

impl fmt::Display for ExitValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dead => f.write_str("dead"),
            Self::Constant(bits) => write!(f, "const({bits:#x})"),
            Self::InJsStack { slot, format } => write!(f, "stack({slot}, {format:?})"),
            Self::Argument { index, format } => write!(f, "arg({index}, {format:?})"),
            Self::Recovery {
                op,
                left,
                right,
                format,
            } => write!(f, "recover({op:?}, {left}, {right}, {format:?})"),
            Self::Materialize(id) => write!(f, "materialize({})", id.0),
        }
    }
}

/// Kind of object an exit materializes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaterializationKind {
    /// Plain object.
    NewObject,
    /// Function closure.
    NewFunction,
    /// Activation.
    CreateActivation,
    /// Unmapped arguments.
    DirectArguments,
    /// Cloned arguments.
    ClonedArguments,
}

/// A phantom allocation to rebuild at exit time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitTimeObjectMaterialization {
    /// Kind of object.
    pub kind: MaterializationKind,
    /// Source position of the sunk allocation.
    pub origin: CodeOrigin,
    /// Field values; a field may itself be [`ExitValue::Materialize`].
    pub properties: Vec<(PromotedLocation, ExitValue)>,
}

impl ExitTimeObjectMaterialization {
    /// Value of a field.
    pub fn property(&self, location: PromotedLocation) -> Option<&ExitValue> {
        self.properties
            .iter()
            .find(|(loc, _)| *loc == location)
            .map(|(_, value)| value)
    }

    /// Materializations this one needs first.
    pub fn dependencies(&self) -> impl Iterator<Item = MaterializationId> + '_ {
        self.properties.iter().filter_map(|(_, value)| match value {
            ExitValue::Materialize(id) => Some(*id),
            _ => None,
        })
    }
}

/// One exit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsrExit {
    /// Reason.
    pub kind: ExitKind,
    /// Source position execution resumes at.
    pub origin: CodeOrigin,
    /// Stackmap index of the value whose check failed, for value profiling.
    pub profile_value: Option<u32>,
    /// Reconstruction of every operand.
    pub values: Operands<ExitValue>,
}

impl OsrExit {
    /// Value of an operand.
    pub fn value(&self, operand: Operand) -> &ExitValue {
        self.values.get(operand).unwrap_or(&ExitValue::Dead)
    }

    /// Materializations named directly by an operand.
    pub fn materialization_roots(&self) -> impl Iterator<Item = MaterializationId> + '_ {
        self.values.iter().filter_map(|(_, value)| match value {
            ExitValue::Materialize(id) => Some(*id),
            _ => None,
        })
    }
}

/// All exits and materializations of one compiled function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitTable {
    /// Exits, indexed by [`ExitId`].
    pub exits: Vec<OsrExit>,
    /// Materializations, indexed by [`MaterializationId`].
    pub materializations: Vec<ExitTimeObjectMaterialization>,
}

impl ExitTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an exit.
    pub fn push_exit(&mut self, exit: OsrExit) -> ExitId {
        self.exits.push(exit);
        ExitId((self.exits.len() - 1) as u32)
    }

    /// Add a materialization.
    pub fn push_materialization(
        &mut self,
        materialization: ExitTimeObjectMaterialization,
    ) -> MaterializationId {
        self.materializations.push(materialization);
        MaterializationId((self.materializations.len() - 1) as u32)
    }

    /// Exit by id.
    pub fn exit(&self, id: ExitId) -> Option<&OsrExit> {
        self.exits.get(id.index())
    }

    /// Materialization by id.
    pub fn materialization(&self, id: MaterializationId) -> Option<&ExitTimeObjectMaterialization> {
        self.materializations.get(id.index())
    }

    /// Largest stackmap index exit `id` reads plus one, counting the
    /// properties of every materialization it reaches.
    pub fn stackmap_len(&self, id: ExitId) -> Option<usize> {
        let exit = self.exit(id)?;
        let mut seen = vec![false; self.materializations.len()];
        let mut pending: Vec<MaterializationId> = exit.materialization_roots().collect();
        let mut len = exit
            .values
            .iter()
            .flat_map(|(_, value)| value.argument_indices())
            .chain(exit.profile_value)
            .map(|index| index as usize + 1)
            .max()
            .unwrap_or(0);
        while let Some(materialization) = pending.pop() {
            let Some(record) = self.materialization(materialization) else {
                continue;
            };
            if std::mem::replace(&mut seen[materialization.index()], true) {
                continue;
            }
            for (_, value) in &record.properties {
                if let Some(index) = value.argument_indices().max() {
                    len = len.max(index as usize + 1);
                }
            }
            pending.extend(record.dependencies());
        }
        Some(len)
    }

    /// Number of exits.
    pub fn len(&self) -> usize {
        self.exits.len()
    }

    /// No exits.
    pub fn is_empty(&self) -> bool {
        self.exits.is_empty()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stackmap_len_covers_recoveries_and_profile() {
        let mut values = Operands::new(1, 2, ExitValue::Dead);
        values.set(
            Operand::Local(0),
            ExitValue::Recovery {
                op: RecoveryOp::Sub,
                left: 1,
                right: 4,
                format: ValueFormat::Int32,
            },
        );
        let mut table = ExitTable::new();
        let id = table.push_exit(OsrExit {
            kind: ExitKind::Overflow,
            origin: CodeOrigin::new(3),
            profile_value: Some(2),
            values,
        });
        assert_eq!(table.stackmap_len(id), Some(5));
        assert_eq!(table.stackmap_len(ExitId(7)), None);
        let exit = table.exit(id).expect("exit record");
        assert_eq!(exit.value(Operand::Local(9)), &ExitValue::Dead);
    }

    #[test]
    fn stackmap_len_follows_materialized_properties() {
        let mut table = ExitTable::new();
        let inner = table.push_materialization(ExitTimeObjectMaterialization {
            kind: MaterializationKind::CreateActivation,
            origin: CodeOrigin::new(0),
            properties: vec![(
                PromotedLocation::ClosureVar(1),
                ExitValue::Argument {
                    index: 6,
                    format: ValueFormat::Double,
                },
            )],
        });
        let outer = table.push_materialization(ExitTimeObjectMaterialization {
            kind: MaterializationKind::NewObject,
            origin: CodeOrigin::new(0),
            properties: vec![
                (PromotedLocation::ActivationScope, ExitValue::Materialize(inner)),
                (
                    PromotedLocation::Structure,
                    ExitValue::Argument {
                        index: 1,
                        format: ValueFormat::Cell,
                    },
                ),
            ],
        });
        // A cycle back to the outer object must not loop.
        table.materializations[inner.index()]
            .properties
            .push((PromotedLocation::ActivationScope, ExitValue::Materialize(outer)));

        let mut values = Operands::new(1, 1, ExitValue::Dead);
        values.set(Operand::Local(0), ExitValue::Materialize(outer));
        let id = table.push_exit(OsrExit {
            kind: ExitKind::BadCache,
            origin: CodeOrigin::new(2),
            profile_value: None,
            values,
        });
        assert_eq!(table.stackmap_len(id), Some(7));
    }

    #[test]
    fn table_round_trips_through_json() {
        let mut table = ExitTable::new();
        let m = table.push_materialization(ExitTimeObjectMaterialization {
            kind: MaterializationKind::NewObject,
            origin: CodeOrigin::new(1),
            properties: vec![(PromotedLocation::Structure, ExitValue::Constant(0x10))],
        });
        let mut values = Operands::new(1, 1, ExitValue::Dead);
        values.set(Operand::Local(0), ExitValue::Materialize(m));
        table.push_exit(OsrExit {
            kind: ExitKind::BadType,
            origin: CodeOrigin::new(1),
            profile_value: None,
            values,
        });
        let json = table.to_json().expect("serialize");
        assert_eq!(ExitTable::from_json(&json).expect("deserialize"), table);
    }

    #[test]
    fn flush_formats_map_to_exit_formats() {
        assert_eq!(ValueFormat::from_flush(FlushFormat::Int32), Some(ValueFormat::Int32));
        assert_eq!(ValueFormat::from_flush(FlushFormat::Conflicting), None);
    }
}
