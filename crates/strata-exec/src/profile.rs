//! Exit profiling and reoptimization accounting.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_ir::{CodeOrigin, SpeculatedType};
use strata_jit::value::{Decoded, decode, double_as_int52};
use strata_jit::{ExitId, ExitKind, OsrExit};
use tracing::debug;

use crate::deopt::ResolvedFrame;

/// Exits a compiled function may take before it should be recompiled.
pub const REOPTIMIZATION_THRESHOLD: u32 = 100;

/// Observed values kept per profiled exit site.
pub const VALUE_PROFILE_BUCKETS: usize = 8;

/// Values observed at a failing type or structure check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueProfile {
    buckets: Vec<u64>,
    next: usize,
    observed: SpeculatedType,
}

impl ValueProfile {
    /// Remember `bits`; the oldest bucket is overwritten once all are full.
    pub fn record(&mut self, bits: u64) {
        if self.buckets.len() < VALUE_PROFILE_BUCKETS {
            self.buckets.push(bits);
        } else {
            self.buckets[self.next] = bits;
        }
        self.next = (self.next + 1) % VALUE_PROFILE_BUCKETS;
        self.observed |= speculation_from_value(bits);
    }

    /// The most recent values, oldest first once the buckets wrapped.
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Union of the types of every value ever recorded.
    pub fn observed(&self) -> SpeculatedType {
        self.observed
    }
}

/// Counters for one exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteProfile {
    /// Reason of the exit.
    pub kind: ExitKind,
    /// Where the exit resumes.
    pub origin: CodeOrigin,
    /// Times taken.
    pub count: u32,
    /// Observed values, for kinds that profile them.
    pub values: Option<ValueProfile>,
}

/// Exit counts of one compiled function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitProfile {
    threshold: u32,
    total: u32,
    per_kind: BTreeMap<ExitKind, u32>,
    sites: BTreeMap<ExitId, SiteProfile>,
}

impl Default for ExitProfile {
    fn default() -> Self {
        Self::new()
    }
}

impl ExitProfile {
    /// Empty profile using [`REOPTIMIZATION_THRESHOLD`].
    pub fn new() -> Self {
        Self::with_threshold(REOPTIMIZATION_THRESHOLD)
    }

    /// Empty profile that asks for reoptimization after `threshold` exits.
    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            total: 0,
            per_kind: BTreeMap::new(),
            sites: BTreeMap::new(),
        }
    }

    /// Count one exit through `id`.
    ///
    /// `observed` is the value whose check failed. It is kept only for kinds
    /// that profile values. Returns [`should_reoptimize`](Self::should_reoptimize).
    pub fn record(&mut self, id: ExitId, exit: &OsrExit, observed: Option<u64>) -> bool {
        self.total = self.total.saturating_add(1);
        *self.per_kind.entry(exit.kind).or_default() += 1;

        let site = self.sites.entry(id).or_insert_with(|| SiteProfile {
            kind: exit.kind,
            origin: exit.origin,
            count: 0,
            values: None,
        });
        site.count = site.count.saturating_add(1);
        if let Some(bits) = observed.filter(|_| exit.kind.records_value_profile()) {
            site.values.get_or_insert_with(ValueProfile::default).record(bits);
        }

        let reoptimize = self.should_reoptimize();
        if reoptimize && self.total == self.threshold {
            debug!(
                target: "strata::deopt",
                total = self.total,
                threshold = self.threshold,
                "exit threshold reached"
            );
        }
        reoptimize
    }

    /// Count a frame produced by [`ExitResolver`](crate::ExitResolver).
    pub fn record_frame(&mut self, exit: &OsrExit, frame: &ResolvedFrame) -> bool {
        self.record(frame.exit, exit, frame.profiled_value)
    }

    /// Enough exits were taken that the function should be recompiled with
    /// the new profile.
    pub fn should_reoptimize(&self) -> bool {
        self.total >= self.threshold
    }

    /// Exits counted so far.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Exits of one kind.
    pub fn count(&self, kind: ExitKind) -> u32 {
        self.per_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Counters of one exit, if it was taken.
    pub fn site(&self, id: ExitId) -> Option<&SiteProfile> {
        self.sites.get(&id)
    }

    /// Every exit taken, by id.
    pub fn sites(&self) -> impl Iterator<Item = (ExitId, &SiteProfile)> {
        self.sites.iter().map(|(id, site)| (*id, site))
    }

    /// An exit of `kind` resuming at `origin` was taken. The next compile
    /// should not repeat the speculation there.
    pub fn has_exit_site(&self, origin: CodeOrigin, kind: ExitKind) -> bool {
        self.sites
            .values()
            .any(|site| site.origin == origin && site.kind == kind)
    }

    /// Forget the counts after recompiling; exit sites are kept.
    pub fn reset_counts(&mut self) {
        self.total = 0;
        self.per_kind.clear();
        for site in self.sites.values_mut() {
            site.count = 0;
        }
    }
}

/// Speculated type of a boxed value.
///
/// Cells are reported as [`SpeculatedType::CELL`]; their precise kind lives
/// in the heap, which the profile never reads.
pub fn speculation_from_value(bits: u64) -> SpeculatedType {
    match decode(bits) {
        Decoded::Empty => SpeculatedType::EMPTY,
        Decoded::Int32(0 | 1) => SpeculatedType::BOOL_INT32,
        Decoded::Int32(_) => SpeculatedType::NON_BOOL_INT32,
        Decoded::Double(value) if value.is_nan() => SpeculatedType::DOUBLE_PURE_NAN,
        Decoded::Double(value) => match double_as_int52(value) {
            Some(_) => SpeculatedType::INT52_AS_DOUBLE,
            None => SpeculatedType::NON_INT_AS_DOUBLE,
        },
        Decoded::Boolean(_) => SpeculatedType::BOOLEAN,
        Decoded::Null | Decoded::Undefined => SpeculatedType::OTHER,
        Decoded::Cell(_) => SpeculatedType::CELL,
        Decoded::Invalid(_) => SpeculatedType::HEAP_TOP,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_ir::Operands;
    use strata_jit::ExitValue;
    use strata_jit::value::{VALUE_NULL, box_double, box_int32};

    fn exit(kind: ExitKind, bytecode_index: u32) -> OsrExit {
        OsrExit {
            kind,
            origin: CodeOrigin::new(bytecode_index),
            profile_value: None,
            values: Operands::new(1, 0, ExitValue::Dead),
        }
    }

    #[test]
    fn counts_per_kind_and_site() {
        let mut profile = ExitProfile::new();
        let overflow = exit(ExitKind::Overflow, 3);
        let bad_type = exit(ExitKind::BadType, 5);
        profile.record(ExitId(0), &overflow, None);
        profile.record(ExitId(0), &overflow, None);
        profile.record(ExitId(1), &bad_type, Some(box_int32(4)));

        assert_eq!(profile.total(), 3);
        assert_eq!(profile.count(ExitKind::Overflow), 2);
        assert_eq!(profile.count(ExitKind::BadType), 1);
        assert_eq!(profile.count(ExitKind::OutOfBounds), 0);
        assert_eq!(profile.site(ExitId(0)).map(|s| s.count), Some(2));
        assert!(profile.has_exit_site(CodeOrigin::new(5), ExitKind::BadType));
        assert!(!profile.has_exit_site(CodeOrigin::new(5), ExitKind::Overflow));
    }

    #[test]
    fn only_type_and_cache_exits_keep_values() {
        let mut profile = ExitProfile::new();
        profile.record(ExitId(0), &exit(ExitKind::Overflow, 0), Some(box_int32(1)));
        profile.record(ExitId(1), &exit(ExitKind::BadCache, 0), Some(VALUE_NULL));
        assert!(profile.site(ExitId(0)).and_then(|s| s.values.as_ref()).is_none());
        let values = profile
            .site(ExitId(1))
            .and_then(|s| s.values.as_ref())
            .expect("bad cache exits keep values");
        assert_eq!(values.buckets(), &[VALUE_NULL]);
        assert_eq!(values.observed(), SpeculatedType::OTHER);
    }

    #[test]
    fn value_buckets_wrap() {
        let mut values = ValueProfile::default();
        for i in 0..(VALUE_PROFILE_BUCKETS as i32 + 3) {
            values.record(box_int32(i + 2));
        }
        values.record(box_double(0.5));
        assert_eq!(values.buckets().len(), VALUE_PROFILE_BUCKETS);
        assert!(values.buckets().contains(&box_double(0.5)));
        assert!(!values.buckets().contains(&box_int32(2)));
        assert_eq!(
            values.observed(),
            SpeculatedType::NON_BOOL_INT32 | SpeculatedType::NON_INT_AS_DOUBLE
        );
    }

    #[test]
    fn reoptimization_fires_at_the_threshold() {
        let mut profile = ExitProfile::with_threshold(3);
        let e = exit(ExitKind::OutOfBounds, 1);
        assert!(!profile.record(ExitId(0), &e, None));
        assert!(!profile.record(ExitId(0), &e, None));
        assert!(profile.record(ExitId(0), &e, None));
        assert!(profile.should_reoptimize());

        profile.reset_counts();
        assert!(!profile.should_reoptimize());
        assert!(profile.has_exit_site(CodeOrigin::new(1), ExitKind::OutOfBounds));
    }

    #[test]
    fn speculation_of_numbers() {
        assert_eq!(speculation_from_value(box_int32(1)), SpeculatedType::BOOL_INT32);
        assert_eq!(speculation_from_value(box_double(3.0)), SpeculatedType::INT52_AS_DOUBLE);
        assert_eq!(speculation_from_value(box_double(f64::NAN)), SpeculatedType::DOUBLE_PURE_NAN);
    }

    #[test]
    fn profile_survives_json() {
        let mut profile = ExitProfile::new();
        profile.record(ExitId(2), &exit(ExitKind::BadType, 7), Some(box_int32(9)));
        let json = serde_json::to_string(&profile).expect("serialize");
        let back: ExitProfile = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, profile);
    }
}
