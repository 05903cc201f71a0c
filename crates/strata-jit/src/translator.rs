//! LIR to Cranelift IR translation.
//!
//! Every LIR block maps to one Cranelift block with the same parameters. A
//! separate entry block receives `(ctx, frame)` and jumps to LIR block 0, so
//! loops may target block 0.
//!
//! Exits become cold blocks that spill their stackmap into the exit buffer,
//! record the exit index in the context and return [`EXIT_SENTINEL`].
//! Patchpoints are indirect calls through the context's site table, which the
//! runtime may rewrite at any time.

use cranelift_codegen::ir::condcodes::{FloatCC as ClFloatCC, IntCC as ClIntCC};
use cranelift_codegen::ir::immediates::Ieee64;
use cranelift_codegen::ir::instructions::BlockArg;
use cranelift_codegen::ir::{
    self, AbiParam, InstBuilder, MemFlags, SigRef, Signature, TrapCode, Value, types,
};
use cranelift_frontend::{FunctionBuilder, Switch};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::JitError;
use crate::abi::{CTX_EXIT_BUFFER, CTX_EXIT_INDEX, CTX_SITE_TABLE, EXIT_SENTINEL};
use crate::helpers::HelperRefs;
use crate::lir::{
    self, BinaryOp, BlockId, FBinaryOp, FUnaryOp, FloatCC, Inst, IntCC, LirFunction, MemWidth,
    OverflowOp, Terminator, Type, UnaryOp,
};

/// Trap code of blocks the lowering proved unreachable.
const UNREACHABLE_TRAP: u8 = 1;

fn cl_type(ty: Type) -> ir::Type {
    match ty {
        Type::I32 => types::I32,
        Type::I64 => types::I64,
        Type::F64 => types::F64,
    }
}

fn int_cc(cc: IntCC) -> ClIntCC {
    match cc {
        IntCC::Eq => ClIntCC::Equal,
        IntCC::Ne => ClIntCC::NotEqual,
        IntCC::Slt => ClIntCC::SignedLessThan,
        IntCC::Sle => ClIntCC::SignedLessThanOrEqual,
        IntCC::Sgt => ClIntCC::SignedGreaterThan,
        IntCC::Sge => ClIntCC::SignedGreaterThanOrEqual,
        IntCC::Ult => ClIntCC::UnsignedLessThan,
        IntCC::Ule => ClIntCC::UnsignedLessThanOrEqual,
        IntCC::Ugt => ClIntCC::UnsignedGreaterThan,
        IntCC::Uge => ClIntCC::UnsignedGreaterThanOrEqual,
    }
}

fn float_cc(cc: FloatCC) -> ClFloatCC {
    match cc {
        FloatCC::Eq => ClFloatCC::Equal,
        // Unordered operands compare not-equal.
        FloatCC::Ne => ClFloatCC::NotEqual,
        FloatCC::Lt => ClFloatCC::LessThan,
        FloatCC::Le => ClFloatCC::LessThanOrEqual,
        FloatCC::Gt => ClFloatCC::GreaterThan,
        FloatCC::Ge => ClFloatCC::GreaterThanOrEqual,
        FloatCC::Unordered => ClFloatCC::Unordered,
    }
}

struct Translator<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    lir: &'a LirFunction,
    helper_refs: Option<&'a HelperRefs>,
    blocks: Vec<ir::Block>,
    values: Vec<Option<Value>>,
    ctx: Value,
    frame: Value,
    /// Indirect call signatures by patchpoint argument count.
    site_signatures: FxHashMap<usize, SigRef>,
}

/// Translate `lir` into the function under construction.
///
/// The function signature must be `(ctx: i64, frame: i64) -> i64`. Runtime
/// helper calls need `helper_refs`; a function calling a helper without them
/// fails with [`JitError::MissingHelper`].
pub(crate) fn translate_function(
    builder: &mut FunctionBuilder<'_>,
    lir: &LirFunction,
    helper_refs: Option<&HelperRefs>,
) -> Result<(), JitError> {
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    let params = builder.block_params(entry).to_vec();
    let (ctx, frame) = match params.as_slice() {
        [ctx, frame] => (*ctx, *frame),
        _ => {
            return Err(JitError::Builder(format!(
                "expected (ctx, frame) parameters, found {}",
                params.len()
            )));
        }
    };

    let blocks: Vec<ir::Block> = lir.blocks.iter().map(|_| builder.create_block()).collect();
    let mut translator = Translator {
        builder,
        lir,
        helper_refs,
        blocks,
        values: vec![None; lir.value_types.len()],
        ctx,
        frame,
        site_signatures: FxHashMap::default(),
    };
    translator.builder.ins().jump(translator.blocks[0], &[]);

    let order = lir.reachable_blocks();
    debug!(
        target: "strata::backend",
        function = %lir.name,
        blocks = order.len(),
        insts = lir.inst_count(),
        "translating"
    );
    for block in order {
        translator.translate_block(block)?;
    }
    translator.builder.seal_all_blocks();
    Ok(())
}

impl Translator<'_, '_> {
    fn value(&self, value: lir::Value) -> Result<Value, JitError> {
        self.values
            .get(value.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| JitError::Builder(format!("{value} used before its definition")))
    }

    fn values(&self, values: &[lir::Value]) -> Result<Vec<Value>, JitError> {
        values.iter().map(|v| self.value(*v)).collect()
    }

    fn block_args(&self, values: &[lir::Value]) -> Result<Vec<BlockArg>, JitError> {
        Ok(self.values(values)?.into_iter().map(BlockArg::Value).collect())
    }

    fn translate_block(&mut self, id: BlockId) -> Result<(), JitError> {
        let block = self.lir.block(id);
        let cl_block = self.blocks[id.index()];
        for &param in &block.params {
            let ty = cl_type(self.lir.value_type(param));
            let value = self.builder.append_block_param(cl_block, ty);
            self.values[param.0 as usize] = Some(value);
        }
        if block.cold {
            self.builder.set_cold_block(cl_block);
        }
        self.builder.switch_to_block(cl_block);
        trace!(target: "strata::backend", block = %id, cold = block.cold, "block");

        for data in &block.insts {
            let value = self.translate_inst(&data.inst)?;
            if let (Some(result), Some(value)) = (data.result, value) {
                self.values[result.0 as usize] = Some(value);
            }
        }
        self.translate_terminator(&block.terminator)
    }

    fn translate_inst(&mut self, inst: &Inst) -> Result<Option<Value>, JitError> {
        let value = match *inst {
            Inst::Iconst { ty, imm } => self.builder.ins().iconst(cl_type(ty), imm),
            Inst::Fconst { bits } => self.builder.ins().f64const(Ieee64::with_bits(bits)),
            Inst::Context => self.ctx,
            Inst::Frame => self.frame,
            Inst::Binary { op, ty, lhs, rhs } => {
                let (lhs, rhs) = (self.value(lhs)?, self.value(rhs)?);
                self.binary(op, ty, lhs, rhs)
            }
            Inst::Overflows { op, lhs, rhs, .. } => {
                let (lhs, rhs) = (self.value(lhs)?, self.value(rhs)?);
                let (_, flag) = match op {
                    OverflowOp::Add => self.builder.ins().sadd_overflow(lhs, rhs),
                    OverflowOp::Sub => self.builder.ins().ssub_overflow(lhs, rhs),
                    OverflowOp::Mul => self.builder.ins().smul_overflow(lhs, rhs),
                };
                self.builder.ins().uextend(types::I32, flag)
            }
            Inst::Unary { op, arg, .. } => {
                let arg = self.value(arg)?;
                match op {
                    UnaryOp::Neg => self.builder.ins().ineg(arg),
                    UnaryOp::Not => self.builder.ins().bnot(arg),
                    UnaryOp::Clz => self.builder.ins().clz(arg),
                }
            }
            Inst::FBinary { op, lhs, rhs } => {
                let (lhs, rhs) = (self.value(lhs)?, self.value(rhs)?);
                let ins = self.builder.ins();
                match op {
                    FBinaryOp::Add => ins.fadd(lhs, rhs),
                    FBinaryOp::Sub => ins.fsub(lhs, rhs),
                    FBinaryOp::Mul => ins.fmul(lhs, rhs),
                    FBinaryOp::Div => ins.fdiv(lhs, rhs),
                    FBinaryOp::Min => ins.fmin(lhs, rhs),
                    FBinaryOp::Max => ins.fmax(lhs, rhs),
                }
            }
            Inst::FUnary { op, arg } => {
                let arg = self.value(arg)?;
                match op {
                    FUnaryOp::Neg => self.builder.ins().fneg(arg),
                    FUnaryOp::Abs => self.builder.ins().fabs(arg),
                    FUnaryOp::Sqrt => self.builder.ins().sqrt(arg),
                    FUnaryOp::Floor => self.builder.ins().floor(arg),
                    FUnaryOp::Ceil => self.builder.ins().ceil(arg),
                    FUnaryOp::Demote => {
                        let single = self.builder.ins().fdemote(types::F32, arg);
                        self.builder.ins().fpromote(types::F64, single)
                    }
                }
            }
            Inst::Icmp { cc, lhs, rhs } => {
                let (lhs, rhs) = (self.value(lhs)?, self.value(rhs)?);
                let flag = self.builder.ins().icmp(int_cc(cc), lhs, rhs);
                self.builder.ins().uextend(types::I32, flag)
            }
            Inst::Fcmp { cc, lhs, rhs } => {
                let (lhs, rhs) = (self.value(lhs)?, self.value(rhs)?);
                let flag = self.builder.ins().fcmp(float_cc(cc), lhs, rhs);
                self.builder.ins().uextend(types::I32, flag)
            }
            Inst::Select {
                cond,
                if_true,
                if_false,
            } => {
                let cond = self.value(cond)?;
                let (if_true, if_false) = (self.value(if_true)?, self.value(if_false)?);
                self.builder.ins().select(cond, if_true, if_false)
            }
            Inst::Extend { signed, arg } => {
                let arg = self.value(arg)?;
                if signed {
                    self.builder.ins().sextend(types::I64, arg)
                } else {
                    self.builder.ins().uextend(types::I64, arg)
                }
            }
            Inst::Truncate { arg } => {
                let arg = self.value(arg)?;
                self.builder.ins().ireduce(types::I32, arg)
            }
            Inst::IntToDouble { signed, arg } => {
                let arg = self.value(arg)?;
                if signed {
                    self.builder.ins().fcvt_from_sint(types::F64, arg)
                } else {
                    self.builder.ins().fcvt_from_uint(types::F64, arg)
                }
            }
            Inst::DoubleToInt { ty, arg } => {
                let arg = self.value(arg)?;
                self.builder.ins().fcvt_to_sint_sat(cl_type(ty), arg)
            }
            Inst::BitcastToInt { arg } => {
                let arg = self.value(arg)?;
                self.builder.ins().bitcast(types::I64, MemFlags::new(), arg)
            }
            Inst::BitcastToDouble { arg } => {
                let arg = self.value(arg)?;
                self.builder.ins().bitcast(types::F64, MemFlags::new(), arg)
            }
            Inst::Load {
                ty,
                width,
                signed,
                addr,
                offset,
            } => {
                let addr = self.value(addr)?;
                self.load(ty, width, signed, addr, offset)
            }
            Inst::Store {
                width,
                value,
                addr,
                offset,
            } => {
                let ty = self.lir.value_type(value);
                let (value, addr) = (self.value(value)?, self.value(addr)?);
                self.store(width, ty, value, addr, offset);
                return Ok(None);
            }
            Inst::Call { helper, ref args } => {
                let func_ref = match self.helper_refs {
                    Some(refs) => refs.require(helper)?,
                    None => return Err(JitError::MissingHelper(helper.symbol_name())),
                };
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(self.ctx);
                call_args.extend(self.values(args)?);
                let call = self.builder.ins().call(func_ref, &call_args);
                self.builder.inst_results(call)[0]
            }
            Inst::Patchpoint { site, ref args } => {
                let sig = self.site_signature(args.len());
                let flags = MemFlags::trusted();
                let table = self.builder.ins().load(types::I64, flags, self.ctx, CTX_SITE_TABLE);
                let entry_offset = 8 * site.0 as i32;
                let entry = self.builder.ins().load(types::I64, flags, table, entry_offset);
                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(self.ctx);
                call_args.extend(self.values(args)?);
                let call = self.builder.ins().call_indirect(sig, entry, &call_args);
                self.builder.inst_results(call)[0]
            }
        };
        Ok(Some(value))
    }

    /// Wrapping arithmetic. Division by zero gives 0 and the overflowing
    /// `MIN / -1` wraps, so no division traps.
    fn binary(&mut self, op: BinaryOp, ty: Type, lhs: Value, rhs: Value) -> Value {
        if matches!(op, BinaryOp::SDiv | BinaryOp::SRem | BinaryOp::UDiv) {
            return self.chill_division(op, ty, lhs, rhs);
        }
        let ins = self.builder.ins();
        match op {
            BinaryOp::Add => ins.iadd(lhs, rhs),
            BinaryOp::Sub => ins.isub(lhs, rhs),
            BinaryOp::Mul => ins.imul(lhs, rhs),
            BinaryOp::And => ins.band(lhs, rhs),
            BinaryOp::Or => ins.bor(lhs, rhs),
            BinaryOp::Xor => ins.bxor(lhs, rhs),
            BinaryOp::Shl => ins.ishl(lhs, rhs),
            BinaryOp::SShr => ins.sshr(lhs, rhs),
            BinaryOp::UShr => ins.ushr(lhs, rhs),
            BinaryOp::SDiv | BinaryOp::SRem | BinaryOp::UDiv => unreachable!("division handled above"),
        }
    }

    fn chill_division(&mut self, op: BinaryOp, ty: Type, lhs: Value, rhs: Value) -> Value {
        let cl_ty = cl_type(ty);
        let zero_divisor = self.builder.ins().icmp_imm(ClIntCC::Equal, rhs, 0);
        let unsafe_divisor = if op == BinaryOp::UDiv {
            zero_divisor
        } else {
            let min = match ty {
                Type::I32 => i32::MIN as i64,
                _ => i64::MIN,
            };
            let lhs_min = self.builder.ins().icmp_imm(ClIntCC::Equal, lhs, min);
            let rhs_minus_one = self.builder.ins().icmp_imm(ClIntCC::Equal, rhs, -1);
            let overflow = self.builder.ins().band(lhs_min, rhs_minus_one);
            self.builder.ins().bor(zero_divisor, overflow)
        };
        // MIN / 1 and MIN % 1 give the wrapped results of MIN / -1.
        let one = self.builder.ins().iconst(cl_ty, 1);
        let divisor = self.builder.ins().select(unsafe_divisor, one, rhs);
        let result = match op {
            BinaryOp::SDiv => self.builder.ins().sdiv(lhs, divisor),
            BinaryOp::SRem => self.builder.ins().srem(lhs, divisor),
            _ => self.builder.ins().udiv(lhs, divisor),
        };
        let zero = self.builder.ins().iconst(cl_ty, 0);
        self.builder.ins().select(zero_divisor, zero, result)
    }

    fn load(&mut self, ty: Type, width: MemWidth, signed: bool, addr: Value, offset: i32) -> Value {
        let flags = MemFlags::trusted();
        let cl_ty = cl_type(ty);
        let ins = self.builder.ins();
        match (width, signed) {
            (MemWidth::W8, true) => ins.sload8(cl_ty, flags, addr, offset),
            (MemWidth::W8, false) => ins.uload8(cl_ty, flags, addr, offset),
            (MemWidth::W16, true) => ins.sload16(cl_ty, flags, addr, offset),
            (MemWidth::W16, false) => ins.uload16(cl_ty, flags, addr, offset),
            (MemWidth::W32, _) if ty == Type::I32 => ins.load(types::I32, flags, addr, offset),
            (MemWidth::W32, true) => ins.sload32(flags, addr, offset),
            (MemWidth::W32, false) => ins.uload32(flags, addr, offset),
            (MemWidth::W64, _) => ins.load(types::I64, flags, addr, offset),
            (MemWidth::F32, _) => {
                let single = ins.load(types::F32, flags, addr, offset);
                self.builder.ins().fpromote(types::F64, single)
            }
            (MemWidth::F64, _) => ins.load(types::F64, flags, addr, offset),
        }
    }

    fn store(&mut self, width: MemWidth, ty: Type, value: Value, addr: Value, offset: i32) {
        let flags = MemFlags::trusted();
        let ins = self.builder.ins();
        match width {
            MemWidth::W8 => ins.istore8(flags, value, addr, offset),
            MemWidth::W16 => ins.istore16(flags, value, addr, offset),
            MemWidth::W32 if ty == Type::I64 => ins.istore32(flags, value, addr, offset),
            MemWidth::W32 | MemWidth::W64 | MemWidth::F64 => ins.store(flags, value, addr, offset),
            MemWidth::F32 => {
                let single = ins.fdemote(types::F32, value);
                self.builder.ins().store(flags, single, addr, offset)
            }
        };
    }

    fn site_signature(&mut self, args: usize) -> SigRef {
        if let Some(sig) = self.site_signatures.get(&args) {
            return *sig;
        }
        let mut signature = Signature::new(self.builder.func.signature.call_conv);
        signature.params.push(AbiParam::new(types::I64));
        for _ in 0..args {
            signature.params.push(AbiParam::new(types::I64));
        }
        signature.returns.push(AbiParam::new(types::I64));
        let sig = self.builder.import_signature(signature);
        self.site_signatures.insert(args, sig);
        sig
    }

    fn translate_terminator(&mut self, terminator: &Terminator) -> Result<(), JitError> {
        match terminator {
            Terminator::Jump { target, args } => {
                let args = self.block_args(args)?;
                self.builder.ins().jump(self.blocks[target.index()], &args);
            }
            Terminator::Branch {
                cond,
                taken,
                taken_args,
                not_taken,
                not_taken_args,
                ..
            } => {
                let cond = self.value(*cond)?;
                let taken_args = self.block_args(taken_args)?;
                let not_taken_args = self.block_args(not_taken_args)?;
                self.builder.ins().brif(
                    cond,
                    self.blocks[taken.index()],
                    &taken_args,
                    self.blocks[not_taken.index()],
                    &not_taken_args,
                );
            }
            Terminator::Switch {
                value,
                cases,
                default,
            } => {
                let value = self.value(*value)?;
                let mut switch = Switch::new();
                for &(key, target) in cases {
                    // Keys compare as the unsigned bits of the I32 scrutinee.
                    switch.set_entry(key as u32 as u128, self.blocks[target.index()]);
                }
                switch.emit(self.builder, value, self.blocks[default.index()]);
            }
            Terminator::Return { value } => {
                let value = self.value(*value)?;
                self.builder.ins().return_(&[value]);
            }
            Terminator::Exit { exit, values } => {
                let flags = MemFlags::trusted();
                let buffer = self.builder.ins().load(types::I64, flags, self.ctx, CTX_EXIT_BUFFER);
                for (i, &value) in values.iter().enumerate() {
                    let bits = match self.lir.value_type(value) {
                        Type::I64 => self.value(value)?,
                        Type::I32 => {
                            let value = self.value(value)?;
                            self.builder.ins().uextend(types::I64, value)
                        }
                        Type::F64 => {
                            let value = self.value(value)?;
                            self.builder.ins().bitcast(types::I64, MemFlags::new(), value)
                        }
                    };
                    self.builder.ins().store(flags, bits, buffer, 8 * i as i32);
                }
                let index = self.builder.ins().iconst(types::I32, exit.0 as i64);
                self.builder.ins().store(flags, index, self.ctx, CTX_EXIT_INDEX);
                let sentinel = self.builder.ins().iconst(types::I64, EXIT_SENTINEL as i64);
                self.builder.ins().return_(&[sentinel]);
            }
            Terminator::Unreachable => {
                self.builder.ins().trap(TrapCode::unwrap_user(UNREACHABLE_TRAP));
            }
        }
        Ok(())
    }
}
