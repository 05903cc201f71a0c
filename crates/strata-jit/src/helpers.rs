//! Runtime helper infrastructure for compiled code → runtime callbacks.
//!
//! Operations that need the full runtime (generic arithmetic, allocation slow
//! paths, conversions that may run user code) are lowered to calls of
//! `extern "C"` helper functions.
//!
//! # Architecture
//!
//! ```text
//! strata-jit (defines kinds + signatures, emits calls)
//!       ↑
//! strata-exec / embedder (implements helpers, fills RuntimeHelpers)
//! ```
//!
//! # ABI
//!
//! Every helper takes the execution context pointer first, followed by
//! `i64` operands, and returns an `i64`. Doubles travel as their raw bits;
//! booleans and int32s in the low bits.

use cranelift_codegen::ir::{self, AbiParam, types};
use cranelift_codegen::isa::CallConv;
use cranelift_jit::JITBuilder;
use cranelift_module::{FuncId, Linkage, Module};

use crate::compiler::JitError;

/// Returned by [`HelperKind::ConvertDoubleToInt52`] when the double is not an
/// int52.
pub const NOT_INT52: i64 = 1 << 52;

// ---------------------------------------------------------------------------
// Helper kind enumeration
// ---------------------------------------------------------------------------

macro_rules! helper_kinds {
    ($( $(#[$doc:meta])* $name:ident = $index:literal, $symbol:literal, $params:literal; )*) => {
        /// Identifies a runtime helper function.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
        #[repr(u8)]
        pub enum HelperKind {
            $( $(#[$doc])* $name = $index, )*
        }

        impl HelperKind {
            /// Every helper, indexed by discriminant.
            pub const ALL: &'static [HelperKind] = &[$(HelperKind::$name),*];

            /// Symbol name used when registering with the JIT module.
            pub const fn symbol_name(self) -> &'static str {
                match self {
                    $( HelperKind::$name => $symbol, )*
                }
            }

            /// Number of parameters after `ctx`.
            pub const fn param_count(self) -> usize {
                match self {
                    $( HelperKind::$name => $params, )*
                }
            }
        }
    };
}

helper_kinds! {
    // ---- representation ----
    /// `(ctx, double_bits) -> int52 or NOT_INT52`
    ConvertDoubleToInt52 = 0, "strata_convert_double_to_int52", 1;
    /// `(ctx, strict_int52) -> value`
    BoxInt52 = 1, "strata_box_int52", 1;
    /// `(ctx, value) -> 0/1`
    ToBoolean = 2, "strata_to_boolean", 1;
    /// `(ctx, value) -> int32` (JS ToInt32, may run user code)
    ToInt32 = 3, "strata_to_int32", 1;
    /// `(ctx, double_bits) -> int32` (JS ToInt32 on an out-of-range double)
    DoubleToInt32 = 4, "strata_double_to_int32", 1;

    // ---- generic operators ----
    /// `(ctx, lhs, rhs) -> value` generic `+`
    ValueAdd = 5, "strata_value_add", 2;
    /// `(ctx, lhs, rhs) -> 0/1` generic `==`
    CompareEq = 6, "strata_compare_eq", 2;
    /// `(ctx, lhs, rhs) -> 0/1` generic `===`
    CompareStrictEq = 7, "strata_compare_strict_eq", 2;
    /// `(ctx, lhs, rhs) -> 0/1` generic `<`
    CompareLess = 8, "strata_compare_less", 2;
    /// `(ctx, lhs, rhs) -> 0/1` generic `<=`
    CompareLessEq = 9, "strata_compare_less_eq", 2;
    /// `(ctx, lhs, rhs) -> 0/1` generic `>`
    CompareGreater = 10, "strata_compare_greater", 2;
    /// `(ctx, lhs, rhs) -> 0/1` generic `>=`
    CompareGreaterEq = 11, "strata_compare_greater_eq", 2;
    /// `(ctx, lhs, rhs) -> 0/1` string content equality
    StringEq = 12, "strata_string_eq", 2;
    /// `(ctx, value) -> string`
    TypeOf = 13, "strata_type_of", 1;
    /// `(ctx, value) -> value`
    ToPrimitive = 14, "strata_to_primitive", 1;
    /// `(ctx, value) -> string`
    ToString = 15, "strata_to_string", 1;
    /// `(ctx, value) -> value`
    ToThis = 16, "strata_to_this", 1;
    /// `(ctx, a, b, c) -> string` (c is empty for two-part ropes)
    MakeRope = 17, "strata_make_rope", 3;
    /// `(ctx, value, prototype) -> 0/1`
    InstanceOf = 18, "strata_instance_of", 2;

    // ---- math ----
    /// `(ctx, x_bits, y_bits) -> double_bits`
    Pow = 19, "strata_pow", 2;
    /// `(ctx, x_bits) -> double_bits`
    Sin = 20, "strata_sin", 1;
    /// `(ctx, x_bits) -> double_bits`
    Cos = 21, "strata_cos", 1;
    /// `(ctx, x_bits) -> double_bits`
    Log = 22, "strata_log", 1;
    /// `(ctx, x_bits, y_bits) -> double_bits` (double `%`)
    Fmod = 23, "strata_fmod", 2;

    // ---- allocation ----
    /// `(ctx, size_bytes) -> cell` (free-list slow path)
    AllocateCell = 24, "strata_allocate_cell", 1;
    /// `(ctx, size_bytes) -> ptr` (linear-region slow path)
    AllocateStorage = 25, "strata_allocate_storage", 1;
    /// `(ctx, object, new_out_of_line_slots) -> butterfly`
    ReallocateStorage = 26, "strata_reallocate_storage", 2;
    /// `(ctx, cell) -> 0`
    WriteBarrier = 27, "strata_write_barrier", 1;
    /// `(ctx, structure_id, length) -> array`
    NewArrayWithSize = 28, "strata_new_array_with_size", 2;
    /// `(ctx, executable, scope) -> function`
    NewFunction = 29, "strata_new_function", 2;
    /// `(ctx, frame) -> arguments`
    CreateDirectArguments = 30, "strata_create_direct_arguments", 1;
    /// `(ctx, frame, scope) -> arguments`
    CreateScopedArguments = 31, "strata_create_scoped_arguments", 2;
    /// `(ctx, frame) -> arguments`
    CreateClonedArguments = 32, "strata_create_cloned_arguments", 1;

    // ---- indexed access ----
    /// `(ctx, base, index) -> value`
    GetByValGeneric = 33, "strata_get_by_val_generic", 2;
    /// `(ctx, base, index, value) -> 0`
    PutByValGeneric = 34, "strata_put_by_val_generic", 3;
    /// `(ctx, array, value) -> new_length_value`
    ArrayPush = 35, "strata_array_push", 2;
    /// `(ctx, array) -> value`
    ArrayPop = 36, "strata_array_pop", 1;
    /// `(ctx, base, index) -> 0/1`
    HasIndexedProperty = 37, "strata_has_indexed_property", 2;
    /// `(ctx, code_unit) -> string`
    SingleCharacterString = 38, "strata_single_character_string", 1;
    /// `(ctx, string, index) -> code_unit` (ropes and 16-bit strings)
    StringCharCodeAt = 39, "strata_string_char_code_at", 2;
    /// `(ctx, view) -> byte_offset`
    TypedArrayByteOffset = 40, "strata_typed_array_byte_offset", 1;

    // ---- varargs ----
    /// `(ctx, arguments, offset) -> length`
    SizeFrameForVarargs = 41, "strata_size_frame_for_varargs", 2;
    /// `(ctx, destination, arguments, offset, length) -> 0`
    LoadVarargs = 42, "strata_load_varargs", 4;
    /// `(ctx, slots) -> 0 when the stack can grow by `slots`, 1 otherwise`
    CheckStackForVarargs = 43, "strata_check_stack_for_varargs", 1;

    // ---- control ----
    /// `(ctx, table_index, string) -> case index or -1`
    SwitchStringLookup = 44, "strata_switch_string_lookup", 2;
    /// `(ctx, value) -> exception marker`
    Throw = 45, "strata_throw", 1;
    /// `(ctx, identifier) -> exception marker`
    ThrowReferenceError = 46, "strata_throw_reference_error", 1;
}

/// Number of helper kinds.
pub const HELPER_COUNT: usize = HelperKind::ALL.len();

impl HelperKind {
    /// Build the Cranelift signature for this helper.
    pub fn make_signature(self, call_conv: CallConv) -> ir::Signature {
        let mut sig = ir::Signature::new(call_conv);
        sig.params.push(AbiParam::new(types::I64)); // ctx
        for _ in 0..self.param_count() {
            sig.params.push(AbiParam::new(types::I64));
        }
        sig.returns.push(AbiParam::new(types::I64));
        sig
    }
}

// ---------------------------------------------------------------------------
// RuntimeHelpers: function pointer table
// ---------------------------------------------------------------------------

/// Table of runtime helper function pointers.
///
/// When a slot is `None`, functions that need the helper are rejected by the
/// native backend with [`JitError::MissingHelper`].
#[derive(Clone)]
pub struct RuntimeHelpers {
    ptrs: [Option<*const u8>; HELPER_COUNT],
}

// SAFETY: function pointers are `Send + Sync` by nature.
unsafe impl Send for RuntimeHelpers {}
unsafe impl Sync for RuntimeHelpers {}

impl Default for RuntimeHelpers {
    fn default() -> Self {
        Self {
            ptrs: [None; HELPER_COUNT],
        }
    }
}

impl std::fmt::Debug for RuntimeHelpers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = self.ptrs.iter().filter(|p| p.is_some()).count();
        f.debug_struct("RuntimeHelpers")
            .field("registered", &set)
            .finish()
    }
}

impl RuntimeHelpers {
    /// Create an empty helper table (all helpers unset).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a helper function pointer.
    ///
    /// # Safety
    ///
    /// The function pointer must have the `extern "C"` signature described on
    /// the [`HelperKind`] variant.
    pub unsafe fn set(&mut self, kind: HelperKind, ptr: *const u8) {
        self.ptrs[kind as usize] = Some(ptr);
    }

    /// Get a helper function pointer.
    pub fn get(&self, kind: HelperKind) -> Option<*const u8> {
        self.ptrs[kind as usize]
    }

    /// Register all set helpers as symbols on the JIT builder.
    pub fn register_symbols(&self, builder: &mut JITBuilder) {
        for &kind in HelperKind::ALL {
            if let Some(ptr) = self.get(kind) {
                builder.symbol(kind.symbol_name(), ptr);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// HelperFuncIds: module-level function declarations
// ---------------------------------------------------------------------------

/// Module-level function IDs for declared helper imports.
pub(crate) struct HelperFuncIds {
    ids: [Option<FuncId>; HELPER_COUNT],
}

impl HelperFuncIds {
    /// Declare all available helpers as imported functions on the module.
    pub fn declare<M: Module>(helpers: &RuntimeHelpers, module: &mut M) -> Result<Self, JitError> {
        let call_conv = module.isa().default_call_conv();
        let mut ids = [None; HELPER_COUNT];
        for &kind in HelperKind::ALL {
            if helpers.get(kind).is_some() {
                let sig = kind.make_signature(call_conv);
                let func_id = module.declare_function(kind.symbol_name(), Linkage::Import, &sig)?;
                ids[kind as usize] = Some(func_id);
            }
        }
        Ok(Self { ids })
    }
}

// ---------------------------------------------------------------------------
// HelperRefs: per-function FuncRefs for calling helpers from IR
// ---------------------------------------------------------------------------

/// Per-compiled-function helper references.
pub(crate) struct HelperRefs {
    refs: [Option<ir::FuncRef>; HELPER_COUNT],
}

impl HelperRefs {
    /// Declare all available helpers into a function's IR.
    pub fn declare<M: Module>(
        func_ids: &HelperFuncIds,
        module: &mut M,
        func: &mut ir::Function,
    ) -> Self {
        let mut refs = [None; HELPER_COUNT];
        for (i, id) in func_ids.ids.iter().enumerate() {
            if let Some(func_id) = id {
                refs[i] = Some(module.declare_func_in_func(*func_id, func));
            }
        }
        Self { refs }
    }

    /// Get the FuncRef, or report the helper as missing.
    pub fn require(&self, kind: HelperKind) -> Result<ir::FuncRef, JitError> {
        self.refs[kind as usize].ok_or(JitError::MissingHelper(kind.symbol_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discriminants_index_all() {
        for (i, kind) in HelperKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, i);
        }
    }

    #[test]
    fn symbols_are_unique() {
        let mut names: Vec<_> = HelperKind::ALL.iter().map(|k| k.symbol_name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), HELPER_COUNT);
    }

    #[test]
    fn signature_has_ctx_first() {
        let sig = HelperKind::MakeRope.make_signature(CallConv::SystemV);
        assert_eq!(sig.params.len(), 4);
        assert_eq!(sig.returns.len(), 1);
    }
}
