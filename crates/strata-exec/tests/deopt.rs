//! Exits taken by lowered code resolve into the frame the unoptimized tier
//! expects, and feed the exit profile.

mod common;

use common::*;
use proptest::prelude::*;
use strata_exec::deopt::{recover, rebox};
use strata_exec::{
    DeoptError, ExitProfile, ExitResolver, MaterializedFields, Materializer,
};
use strata_ir::{CodeOrigin, IdentifierIndex, Operand, Operands, PromotedLocation, SpeculatedType};
use strata_jit::exit::{
    ExitTimeObjectMaterialization, MaterializationKind, RecoveryOp, ValueFormat,
};
use strata_jit::value::{VALUE_UNDEFINED, box_double, box_int32};
use strata_jit::{ExitId, ExitKind, ExitTable, ExitValue, OsrExit};

/// Hands out fake cell addresses and remembers what it built.
#[derive(Default)]
struct RecordingMaterializer {
    built: Vec<(MaterializationKind, Vec<(PromotedLocation, u64)>)>,
}

impl RecordingMaterializer {
    fn build(&mut self, kind: MaterializationKind, fields: &MaterializedFields<'_>) -> u64 {
        self.built.push((kind, fields.iter().collect()));
        0x1_0000 * self.built.len() as u64
    }
}

impl Materializer for RecordingMaterializer {
    fn new_object(&mut self, fields: &MaterializedFields<'_>) -> u64 {
        self.build(MaterializationKind::NewObject, fields)
    }

    fn new_function(&mut self, fields: &MaterializedFields<'_>) -> u64 {
        self.build(MaterializationKind::NewFunction, fields)
    }

    fn create_activation(&mut self, fields: &MaterializedFields<'_>) -> u64 {
        self.build(MaterializationKind::CreateActivation, fields)
    }

    fn direct_arguments(&mut self, fields: &MaterializedFields<'_>) -> u64 {
        self.build(MaterializationKind::DirectArguments, fields)
    }

    fn cloned_arguments(&mut self, fields: &MaterializedFields<'_>) -> u64 {
        self.build(MaterializationKind::ClonedArguments, fields)
    }
}

#[test]
fn overflow_exit_resolves_the_hinted_local() {
    let lowered = lower(&hinted_sum(false));
    let arguments = [box_int32(2), box_int32(3)];
    let (id, stackmap) = run_to_exit(&lowered, &arguments);

    let resolver = ExitResolver::new(&lowered.exits);
    let resolved = resolver
        .resolve(id, &stackmap, &frame(&arguments, 1), &mut RecordingMaterializer::default())
        .expect("exit should resolve");

    assert_eq!(resolved.kind, ExitKind::Overflow);
    assert_eq!(resolved.origin, CodeOrigin::new(1));
    assert_eq!(resolved.operand(Operand::Local(0)), box_int32(5));
    // Dead at bytecode 1.
    assert_eq!(resolved.operand(Operand::Argument(1)), VALUE_UNDEFINED);
    assert!(resolved.materialized.is_empty());
}

#[test]
fn exit_only_addition_wraps_like_int32() {
    let lowered = lower(&hinted_sum(true));
    let arguments = [box_int32(i32::MAX), box_int32(1)];
    let (id, stackmap) = run_to_exit(&lowered, &arguments);

    let resolved = ExitResolver::new(&lowered.exits)
        .resolve(id, &stackmap, &frame(&arguments, 1), &mut RecordingMaterializer::default())
        .expect("exit should resolve");
    assert_eq!(resolved.operand(Operand::Local(0)), box_int32(i32::MIN));
}

#[test]
fn type_exit_profiles_the_observed_value() {
    let lowered = lower(&hinted_sum(false));
    let arguments = [box_int32(2), box_double(0.5)];
    let (id, stackmap) = run_to_exit(&lowered, &arguments);

    let resolved = ExitResolver::new(&lowered.exits)
        .resolve(id, &stackmap, &frame(&arguments, 1), &mut RecordingMaterializer::default())
        .expect("exit should resolve");
    assert_eq!(resolved.kind, ExitKind::BadType);
    assert_eq!(resolved.profiled_value, Some(box_double(0.5)));
    assert_eq!(resolved.operand(Operand::Argument(2)), box_double(0.5));

    let exit = lowered.exits.exit(id).expect("exit record");
    let mut profile = ExitProfile::new();
    profile.record_frame(exit, &resolved);
    let site = profile.site(id).expect("site was counted");
    let observed = site.values.as_ref().expect("type exits keep values").observed();
    assert_eq!(observed, SpeculatedType::NON_INT_AS_DOUBLE);
    assert!(profile.has_exit_site(CodeOrigin::new(0), ExitKind::BadType));
}

#[test]
fn repeated_exits_ask_for_reoptimization() {
    let lowered = lower(&hinted_sum(false));
    let arguments = [box_int32(2), box_int32(3)];
    let mut profile = ExitProfile::with_threshold(5);
    let mut fired = 0;
    while !profile.should_reoptimize() {
        let (id, stackmap) = run_to_exit(&lowered, &arguments);
        let resolved = ExitResolver::new(&lowered.exits)
            .resolve(id, &stackmap, &frame(&arguments, 1), &mut RecordingMaterializer::default())
            .expect("exit should resolve");
        profile.record_frame(lowered.exits.exit(id).expect("exit record"), &resolved);
        fired += 1;
    }
    assert_eq!(fired, 5);
    assert_eq!(profile.count(ExitKind::Overflow), 5);
}

/// Local 0 holds a phantom object whose property points at a phantom
/// activation, which captured stackmap value 0 as an int32.
fn nested_table(cyclic: bool) -> ExitTable {
    let mut table = ExitTable::new();
    let object = table.push_materialization(ExitTimeObjectMaterialization {
        kind: MaterializationKind::NewObject,
        origin: CodeOrigin::new(0),
        properties: Vec::new(),
    });
    let activation = table.push_materialization(ExitTimeObjectMaterialization {
        kind: MaterializationKind::CreateActivation,
        origin: CodeOrigin::new(0),
        properties: vec![(
            PromotedLocation::ClosureVar(0),
            ExitValue::Argument {
                index: 0,
                format: ValueFormat::Int32,
            },
        )],
    });
    table.materializations[object.index()].properties = vec![(
        PromotedLocation::NamedProperty(IdentifierIndex(0)),
        ExitValue::Materialize(activation),
    )];
    if cyclic {
        table.materializations[activation.index()]
            .properties
            .push((PromotedLocation::ActivationScope, ExitValue::Materialize(object)));
    }

    let mut values = Operands::new(1, 1, ExitValue::Dead);
    values.set(Operand::Local(0), ExitValue::Materialize(object));
    table.push_exit(OsrExit {
        kind: ExitKind::BadCache,
        origin: CodeOrigin::new(4),
        profile_value: None,
        values,
    });
    table
}

#[test]
fn materializations_are_built_dependencies_first() {
    let table = nested_table(false);
    let mut materializer = RecordingMaterializer::default();
    let resolved = ExitResolver::new(&table)
        .resolve(ExitId(0), &[0xFFFF_FFF9], &Operands::new(1, 1, 0), &mut materializer)
        .expect("exit should resolve");

    let kinds: Vec<MaterializationKind> = materializer.built.iter().map(|(kind, _)| *kind).collect();
    assert_eq!(
        kinds,
        vec![MaterializationKind::CreateActivation, MaterializationKind::NewObject]
    );
    let (_, activation_fields) = &materializer.built[0];
    assert_eq!(activation_fields, &vec![(PromotedLocation::ClosureVar(0), box_int32(-7))]);
    let (_, object_fields) = &materializer.built[1];
    assert_eq!(
        object_fields,
        &vec![(PromotedLocation::NamedProperty(IdentifierIndex(0)), 0x1_0000)]
    );
    assert_eq!(resolved.operand(Operand::Local(0)), 0x2_0000);
    assert_eq!(resolved.materialized.len(), 2);
}

#[test]
#[should_panic(expected = "materialization cycle")]
fn cyclic_materializations_crash() {
    let table = nested_table(true);
    let _ = ExitResolver::new(&table).resolve(
        ExitId(0),
        &[0],
        &Operands::new(1, 1, 0),
        &mut RecordingMaterializer::default(),
    );
}

#[test]
fn malformed_captures_are_errors() {
    let table = nested_table(false);
    let resolver = ExitResolver::new(&table);
    let mut materializer = RecordingMaterializer::default();

    assert_eq!(
        resolver.resolve(ExitId(9), &[0], &Operands::new(1, 1, 0), &mut materializer),
        Err(DeoptError::UnknownExit(ExitId(9)))
    );
    assert!(matches!(
        resolver.resolve(ExitId(0), &[], &Operands::new(1, 1, 0), &mut materializer),
        Err(DeoptError::StackmapTooShort { needed: 1, captured: 0, .. })
    ));
    assert!(matches!(
        resolver.resolve(ExitId(0), &[0], &Operands::new(2, 1, 0), &mut materializer),
        Err(DeoptError::FrameShapeMismatch { .. })
    ));
    assert!(materializer.built.is_empty());
}

proptest! {
    #[test]
    fn int32_recoveries_match_wrapping_arithmetic(a: i32, b: i32) {
        let (left, right) = (a as u32 as u64, b as u32 as u64);
        let add = recover(RecoveryOp::Add, left, right, ValueFormat::Int32).expect("int32 recovers");
        let sub = recover(RecoveryOp::Sub, left, right, ValueFormat::Int32).expect("int32 recovers");
        prop_assert_eq!(rebox(add, ValueFormat::Int32), box_int32(a.wrapping_add(b)));
        prop_assert_eq!(rebox(sub, ValueFormat::Int32), box_int32(a.wrapping_sub(b)));
    }

    #[test]
    fn reboxed_doubles_are_never_impure(bits: u64) {
        let boxed = rebox(bits, ValueFormat::Double);
        prop_assert!(strata_jit::value::is_number(boxed));
        prop_assert!(!strata_jit::value::is_cell(boxed));
    }
}
