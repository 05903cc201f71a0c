//! Optimizing-tier compiler: capability check, lowering and Cranelift code
//! generation.
//!
//! [`prepare`] runs everything that does not touch the code cache and may run
//! on a worker thread. [`JitCompiler::finalize`] emits native code for a
//! prepared function on the thread owning the compiler.

use cranelift_codegen::ir::{AbiParam, UserFuncName, types};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module, ModuleError, default_libcall_names};
use strata_ir::{Graph, IrError, NodeId, UseKind};
use tracing::debug;

use crate::capabilities::can_compile;
use crate::config::LoweringOptions;
use crate::exit::ExitTable;
use crate::helpers::{HelperFuncIds, HelperRefs, RuntimeHelpers};
use crate::ic::InlineCacheTable;
use crate::lower::{self, LoweredFunction, LoweringStats};
use crate::object_layout::ObjectLayout;
use crate::translator;

/// Native code for one function plus the tables the runtime needs to run it.
#[derive(Debug)]
pub struct CompiledFunction {
    /// Entry point with the signature of [`crate::abi`].
    pub code_ptr: *const u8,
    /// Exit and materialization records, indexed by the exit index the code
    /// writes into the context.
    pub exits: ExitTable,
    /// Inline cache sites; the site table passed in the context needs one
    /// entry per site.
    pub ics: InlineCacheTable,
    /// Lowering counters.
    pub stats: LoweringStats,
}

impl CompiledFunction {
    /// Number of site table entries the code may read.
    pub fn site_count(&self) -> usize {
        self.ics.sites.len()
    }

    /// Run the code.
    ///
    /// # Safety
    ///
    /// `ctx` must point at an [`ExecutionContext`](crate::abi::ExecutionContext)
    /// whose exit buffer holds the largest stackmap of [`Self::exits`] and
    /// whose site table holds [`Self::site_count`] valid entry points. `frame`
    /// must point at a frame with the header, arguments and locals the
    /// function was compiled for. The owning [`JitCompiler`] must be alive.
    pub unsafe fn call(&self, ctx: *mut u8, frame: *mut u64) -> u64 {
        let func: extern "C" fn(*mut u8, *mut u64) -> u64 = unsafe {
            // SAFETY: code produced by `JitCompiler::finalize` has this
            // signature.
            std::mem::transmute(self.code_ptr)
        };
        func(ctx, frame)
    }
}

/// Errors produced by the compiler.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// Cranelift module-level error.
    #[error("cranelift module error: {0}")]
    Module(Box<ModuleError>),

    /// Failed to create the JIT builder or translate a function.
    #[error("jit builder error: {0}")]
    Builder(String),

    /// The code calls a runtime helper the embedder did not register.
    #[error("runtime helper {0} is not registered")]
    MissingHelper(&'static str),

    /// The node has no lowering in this shape.
    #[error("cannot compile {op} at {node}: {reason}")]
    Unsupported {
        /// Rejected node.
        node: NodeId,
        /// Its opcode.
        op: &'static str,
        /// What is missing.
        reason: &'static str,
    },

    /// The node has no lowering for one of its use kinds.
    #[error("cannot compile {op} at {node}: child {child} used as {use_kind:?}")]
    UnsupportedUseKind {
        /// Rejected node.
        node: NodeId,
        /// Its opcode.
        op: &'static str,
        /// Child position.
        child: usize,
        /// Offending use kind.
        use_kind: UseKind,
    },

    /// The graph is malformed.
    #[error(transparent)]
    Ir(#[from] IrError),
}

impl From<ModuleError> for JitError {
    fn from(value: ModuleError) -> Self {
        Self::Module(Box::new(value))
    }
}

/// Check and lower `graph`.
pub fn prepare(
    graph: &Graph,
    options: &LoweringOptions,
    layout: &dyn ObjectLayout,
) -> Result<LoweredFunction, JitError> {
    can_compile(graph)?;
    Ok(lower::lower(graph, options, layout))
}

/// JIT builder for the host, optimizing for speed.
fn jit_builder() -> Result<JITBuilder, JitError> {
    let mut flags = settings::builder();
    flags
        .set("opt_level", "speed")
        .map_err(|e| JitError::Builder(e.to_string()))?;
    let isa = cranelift_native::builder()
        .map_err(|e| JitError::Builder(format!("host machine is not supported: {e}")))?
        .finish(settings::Flags::new(flags))
        .map_err(|e| JitError::Builder(e.to_string()))?;
    Ok(JITBuilder::with_isa(isa, default_libcall_names()))
}

/// Cranelift-backed code generator for lowered functions.
pub struct JitCompiler {
    module: JITModule,
    function_builder_ctx: FunctionBuilderContext,
    context: cranelift_codegen::Context,
    next_function_id: u64,
    helper_func_ids: Option<HelperFuncIds>,
}

impl JitCompiler {
    /// Create a compiler without runtime helpers.
    pub fn new() -> Result<Self, JitError> {
        let module = JITModule::new(jit_builder()?);
        Ok(Self {
            module,
            function_builder_ctx: FunctionBuilderContext::new(),
            context: cranelift_codegen::Context::new(),
            next_function_id: 0,
            helper_func_ids: None,
        })
    }

    /// Create a compiler whose code may call the registered runtime helpers.
    pub fn new_with_helpers(helpers: RuntimeHelpers) -> Result<Self, JitError> {
        let mut builder = jit_builder()?;
        helpers.register_symbols(&mut builder);
        let mut module = JITModule::new(builder);
        let helper_func_ids = HelperFuncIds::declare(&helpers, &mut module)?;
        Ok(Self {
            module,
            function_builder_ctx: FunctionBuilderContext::new(),
            context: cranelift_codegen::Context::new(),
            next_function_id: 0,
            helper_func_ids: Some(helper_func_ids),
        })
    }

    /// Whether runtime helpers are available.
    pub fn has_helpers(&self) -> bool {
        self.helper_func_ids.is_some()
    }

    /// Check, lower and emit `graph`.
    pub fn compile(
        &mut self,
        graph: &Graph,
        options: &LoweringOptions,
        layout: &dyn ObjectLayout,
    ) -> Result<CompiledFunction, JitError> {
        let lowered = prepare(graph, options, layout)?;
        self.finalize(lowered)
    }

    /// Emit native code for a lowered function.
    pub fn finalize(&mut self, lowered: LoweredFunction) -> Result<CompiledFunction, JitError> {
        let mut signature = self.module.make_signature();
        // (ctx, frame) -> value
        signature.params.push(AbiParam::new(types::I64));
        signature.params.push(AbiParam::new(types::I64));
        signature.returns.push(AbiParam::new(types::I64));

        let name = format!(
            "strata_{}_{}",
            lowered
                .lir
                .name
                .replace(|c: char| !c.is_ascii_alphanumeric(), "_"),
            self.next_function_id
        );
        self.next_function_id = self.next_function_id.saturating_add(1);

        let func_id = self
            .module
            .declare_function(&name, Linkage::Local, &signature)?;
        self.context.func = cranelift_codegen::ir::Function::with_name_signature(
            UserFuncName::user(0, func_id.as_u32()),
            signature,
        );

        let helper_refs = self.helper_func_ids.as_ref().map(|func_ids| {
            HelperRefs::declare(func_ids, &mut self.module, &mut self.context.func)
        });

        let translated = {
            let mut builder =
                FunctionBuilder::new(&mut self.context.func, &mut self.function_builder_ctx);
            let result =
                translator::translate_function(&mut builder, &lowered.lir, helper_refs.as_ref());
            if result.is_ok() {
                builder.finalize();
            }
            result
        };
        if let Err(err) = translated {
            self.module.clear_context(&mut self.context);
            return Err(err);
        }

        self.module.define_function(func_id, &mut self.context)?;
        self.module.clear_context(&mut self.context);
        self.module.finalize_definitions()?;

        let code_ptr = self.module.get_finalized_function(func_id);
        debug!(
            target: "strata::backend",
            function = %lowered.lir.name,
            symbol = %name,
            exits = lowered.exits.exits.len(),
            sites = lowered.ics.sites.len(),
            "emitted native code"
        );
        Ok(CompiledFunction {
            code_ptr,
            exits: lowered.exits,
            ics: lowered.ics,
            stats: lowered.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{EXIT_SENTINEL, ExecutionContext};
    use crate::object_layout::DefaultObjectLayout;
    use crate::value::{box_double, box_int32};
    use strata_ir::{
        ArithMode, Edge, FlushFormat, GraphBuilder, NodeResult, Op, Operand, StackAccessData,
    };

    fn get_argument(b: &mut GraphBuilder, index: u32, format: FlushFormat) -> NodeId {
        let entry = b.entry();
        let result = match format {
            FlushFormat::Int32 => NodeResult::Int32,
            _ => NodeResult::JsValue,
        };
        b.add(
            entry,
            Op::GetStack(StackAccessData {
                local: Operand::Argument(index),
                machine_local: Operand::Argument(index),
                format,
            }),
            [],
            result,
        )
    }

    /// `return a + b` over boxed arguments speculated int32.
    fn add_graph() -> Graph {
        let mut b = GraphBuilder::new("add", 3, 0);
        let x = get_argument(&mut b, 1, FlushFormat::JsValue);
        let y = get_argument(&mut b, 2, FlushFormat::JsValue);
        let entry = b.entry();
        let sum = b.add(
            entry,
            Op::ArithAdd(ArithMode::CheckOverflow),
            [Edge::new(x, UseKind::Int32), Edge::new(y, UseKind::Int32)],
            NodeResult::Int32,
        );
        let boxed = b.add(entry, Op::ValueRep, [Edge::new(sum, UseKind::Int32)], NodeResult::JsValue);
        b.add(entry, Op::Return, [Edge::untyped(boxed)], NodeResult::None);
        b.build().expect("valid graph")
    }

    /// Frame with two arguments after `this`.
    fn frame(a: u64, b: u64) -> Vec<u64> {
        vec![0, 0, 3, crate::value::VALUE_UNDEFINED, a, b]
    }

    fn compile(graph: &Graph) -> (JitCompiler, CompiledFunction) {
        let mut jit = JitCompiler::new().expect("jit initialization should succeed");
        let compiled = jit
            .compile(graph, &LoweringOptions::default(), &DefaultObjectLayout)
            .expect("compilation should succeed");
        (jit, compiled)
    }

    #[test]
    fn basic_compile() {
        let (_jit, compiled) = compile(&add_graph());
        assert!(!compiled.code_ptr.is_null());
        assert!(!compiled.exits.exits.is_empty());
    }

    #[test]
    fn int32_add_returns_boxed_sum() {
        let (_jit, compiled) = compile(&add_graph());
        let mut buffer = vec![0u64; 16];
        let mut ctx = ExecutionContext::new(buffer.as_mut_ptr(), std::ptr::null());
        let mut frame = frame(box_int32(2), box_int32(3));
        let result = unsafe { compiled.call(ctx.as_ptr(), frame.as_mut_ptr()) };
        assert_eq!(result, box_int32(5));
    }

    #[test]
    fn failed_speculation_leaves_through_an_exit() {
        let (_jit, compiled) = compile(&add_graph());
        let mut buffer = vec![0u64; 16];
        let mut ctx = ExecutionContext::new(buffer.as_mut_ptr(), std::ptr::null());
        let mut frame = frame(box_int32(2), box_double(0.5));
        let result = unsafe { compiled.call(ctx.as_ptr(), frame.as_mut_ptr()) };
        assert_eq!(result, EXIT_SENTINEL);
        assert!((ctx.exit_index as usize) < compiled.exits.exits.len());
    }

    #[test]
    fn overflow_leaves_through_an_exit() {
        let (_jit, compiled) = compile(&add_graph());
        let mut buffer = vec![0u64; 16];
        let mut ctx = ExecutionContext::new(buffer.as_mut_ptr(), std::ptr::null());
        let mut frame = frame(box_int32(i32::MAX), box_int32(1));
        let result = unsafe { compiled.call(ctx.as_ptr(), frame.as_mut_ptr()) };
        assert_eq!(result, EXIT_SENTINEL);
        let exit = &compiled.exits.exits[ctx.exit_index as usize];
        assert_eq!(exit.kind, crate::exit::ExitKind::Overflow);
    }

    extern "C" fn answer_site(_ctx: *mut u8, _base: u64) -> u64 {
        box_int32(42)
    }

    #[test]
    fn patchpoint_calls_through_the_site_table() {
        let mut b = GraphBuilder::new("get_x", 2, 0);
        let o = get_argument(&mut b, 1, FlushFormat::JsValue);
        let x = b.identifier("x");
        let entry = b.entry();
        let value = b.add(entry, Op::GetById(x), [Edge::untyped(o)], NodeResult::JsValue);
        b.add(entry, Op::Return, [Edge::untyped(value)], NodeResult::None);
        let graph = b.build().expect("valid graph");

        let (_jit, compiled) = compile(&graph);
        assert_eq!(compiled.site_count(), 1);
        let table = [answer_site as *const u8];
        let mut buffer = vec![0u64; 16];
        let mut ctx = ExecutionContext::new(buffer.as_mut_ptr(), table.as_ptr());
        let mut frame = vec![0, 0, 2, crate::value::VALUE_UNDEFINED, crate::value::VALUE_NULL];
        let result = unsafe { compiled.call(ctx.as_ptr(), frame.as_mut_ptr()) };
        assert_eq!(result, box_int32(42));
    }

    #[test]
    fn helper_calls_need_registered_helpers() {
        let mut b = GraphBuilder::new("varargs", 2, 4);
        b.live_at(0, [Operand::Argument(1)]);
        let source = get_argument(&mut b, 1, FlushFormat::JsValue);
        let entry = b.entry();
        b.add(
            entry,
            Op::LoadVarargs(strata_ir::LoadVarargsData {
                start: Operand::Local(1),
                count: Operand::Local(0),
                offset: 0,
                limit: 2,
                mandatory_minimum: 0,
            }),
            [Edge::untyped(source)],
            NodeResult::None,
        );
        let undefined = b.add(
            entry,
            Op::JsConstant(strata_ir::FrozenValue::Undefined),
            [],
            NodeResult::JsValue,
        );
        b.add(entry, Op::Return, [Edge::untyped(undefined)], NodeResult::None);
        let graph = b.build().expect("valid graph");

        let mut jit = JitCompiler::new().expect("jit initialization should succeed");
        let err = jit
            .compile(&graph, &LoweringOptions::default(), &DefaultObjectLayout)
            .expect_err("no helpers registered");
        assert!(matches!(err, JitError::MissingHelper(_)));
    }
}
