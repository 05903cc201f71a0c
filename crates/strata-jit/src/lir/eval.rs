//! Reference interpreter for LIR.
//!
//! Runs a [`LirFunction`] over a [`SparseMemory`] with the same semantics the
//! native backend gives each instruction. Runtime helpers and patchpoints are
//! answered by an [`EvalRuntime`]. Exits are reported with their stackmap
//! values instead of being written into the context.

use rustc_hash::FxHashMap;

use super::{
    BinaryOp, BlockId, FBinaryOp, FUnaryOp, FloatCC, Inst, IntCC, LirFunction, MemWidth,
    OverflowOp, Terminator, Type, UnaryOp, Value,
};
use crate::exit::ExitId;
use crate::helpers::HelperKind;
use crate::ic::SiteId;

const PAGE_BITS: u32 = 12;
const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Byte-addressed memory that allocates pages on first touch.
///
/// Unwritten bytes read as zero.
#[derive(Debug, Default, Clone)]
pub struct SparseMemory {
    pages: FxHashMap<u64, Box<[u8; PAGE_SIZE]>>,
}

impl SparseMemory {
    /// Empty memory.
    pub fn new() -> Self {
        Self::default()
    }

    fn byte(&self, addr: u64) -> u8 {
        self.pages
            .get(&(addr >> PAGE_BITS))
            .map(|page| page[(addr as usize) & (PAGE_SIZE - 1)])
            .unwrap_or(0)
    }

    fn set_byte(&mut self, addr: u64, value: u8) {
        let page = self
            .pages
            .entry(addr >> PAGE_BITS)
            .or_insert_with(|| Box::new([0; PAGE_SIZE]));
        page[(addr as usize) & (PAGE_SIZE - 1)] = value;
    }

    /// Read `bytes` (at most 8) little-endian bytes.
    pub fn read(&self, addr: u64, bytes: u32) -> u64 {
        (0..bytes as u64).fold(0, |acc, i| {
            acc | (self.byte(addr.wrapping_add(i)) as u64) << (8 * i)
        })
    }

    /// Write the low `bytes` (at most 8) bytes of `value` little-endian.
    pub fn write(&mut self, addr: u64, bytes: u32, value: u64) {
        for i in 0..bytes as u64 {
            self.set_byte(addr.wrapping_add(i), (value >> (8 * i)) as u8);
        }
    }

    /// Read a 64-bit word.
    pub fn read_u64(&self, addr: u64) -> u64 {
        self.read(addr, 8)
    }

    /// Write a 64-bit word.
    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, 8, value);
    }

    /// Read a 32-bit word.
    pub fn read_u32(&self, addr: u64) -> u32 {
        self.read(addr, 4) as u32
    }

    /// Write a 32-bit word.
    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, 4, value as u64);
    }

    /// Copy `data` to `addr`.
    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.set_byte(addr.wrapping_add(i as u64), *byte);
        }
    }

    /// Copy `len` bytes starting at `addr`.
    pub fn read_bytes(&self, addr: u64, len: usize) -> Vec<u8> {
        (0..len as u64).map(|i| self.byte(addr.wrapping_add(i))).collect()
    }
}

/// Answers the calls compiled code makes out of itself.
pub trait EvalRuntime {
    /// Run a runtime helper; `args` excludes the context.
    fn call_helper(&mut self, helper: HelperKind, args: &[u64], memory: &mut SparseMemory) -> u64;

    /// Run the code currently installed at a patchpoint.
    fn patchpoint(&mut self, site: SiteId, args: &[u64], memory: &mut SparseMemory) -> u64;
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EvalOutcome {
    /// The function returned.
    Returned(u64),
    /// An exit fired.
    Exited {
        /// Exit record.
        exit: ExitId,
        /// Stackmap values, indexed by exit argument index.
        values: Vec<u64>,
    },
    /// Control reached an `Unreachable` terminator.
    Unreachable(BlockId),
}

/// Failure to evaluate a function.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// The step budget ran out.
    #[error("step limit of {0} exceeded")]
    StepLimit(u64),

    /// A value was read before being defined.
    #[error("value {0} used before definition")]
    Undefined(Value),

    /// Block arguments do not match the target's parameters.
    #[error("block {block} expects {expected} arguments, got {actual}")]
    Arity {
        /// Target block.
        block: BlockId,
        /// Parameter count.
        expected: usize,
        /// Argument count.
        actual: usize,
    },
}

/// LIR interpreter.
#[derive(Debug)]
pub struct Evaluator<'f> {
    func: &'f LirFunction,
    ctx: u64,
    frame: u64,
    step_limit: u64,
}

impl<'f> Evaluator<'f> {
    /// Evaluator with the given context and frame pointers.
    pub fn new(func: &'f LirFunction, ctx: u64, frame: u64) -> Self {
        Self {
            func,
            ctx,
            frame,
            step_limit: 1_000_000,
        }
    }

    /// Change the step budget (instructions plus terminators).
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Run from the entry block.
    pub fn run(
        &self,
        memory: &mut SparseMemory,
        runtime: &mut dyn EvalRuntime,
    ) -> Result<EvalOutcome, EvalError> {
        let mut values: Vec<Option<u64>> = vec![None; self.func.value_types.len()];
        let mut block = BlockId(0);
        let mut steps = 0u64;

        loop {
            let data = self.func.block(block);
            for inst in &data.insts {
                steps += 1;
                if steps > self.step_limit {
                    return Err(EvalError::StepLimit(self.step_limit));
                }
                let result = self.exec(&inst.inst, &values, memory, runtime)?;
                if let (Some(value), Some(result)) = (inst.result, result) {
                    let ty = self.func.value_type(value);
                    values[value.0 as usize] = Some(normalize(ty, result));
                }
            }
            steps += 1;
            if steps > self.step_limit {
                return Err(EvalError::StepLimit(self.step_limit));
            }

            let (target, args) = match &data.terminator {
                Terminator::Jump { target, args } => (*target, args.as_slice()),
                Terminator::Branch {
                    cond,
                    taken,
                    taken_args,
                    not_taken,
                    not_taken_args,
                    ..
                } => {
                    if get(&values, *cond)? as u32 != 0 {
                        (*taken, taken_args.as_slice())
                    } else {
                        (*not_taken, not_taken_args.as_slice())
                    }
                }
                Terminator::Switch {
                    value,
                    cases,
                    default,
                } => {
                    let key = get(&values, *value)? as u32 as i32;
                    let target = cases
                        .iter()
                        .find(|(k, _)| *k == key)
                        .map(|(_, b)| *b)
                        .unwrap_or(*default);
                    (target, &[][..])
                }
                Terminator::Return { value } => {
                    return Ok(EvalOutcome::Returned(get(&values, *value)?));
                }
                Terminator::Exit { exit, values: stack } => {
                    let captured = stack
                        .iter()
                        .map(|v| get(&values, *v))
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(EvalOutcome::Exited {
                        exit: *exit,
                        values: captured,
                    });
                }
                Terminator::Unreachable => return Ok(EvalOutcome::Unreachable(block)),
            };

            let params = &self.func.block(target).params;
            if params.len() != args.len() {
                return Err(EvalError::Arity {
                    block: target,
                    expected: params.len(),
                    actual: args.len(),
                });
            }
            let incoming = args
                .iter()
                .map(|v| get(&values, *v))
                .collect::<Result<Vec<_>, _>>()?;
            for (param, value) in params.iter().zip(incoming) {
                values[param.0 as usize] = Some(value);
            }
            block = target;
        }
    }

    fn exec(
        &self,
        inst: &Inst,
        values: &[Option<u64>],
        memory: &mut SparseMemory,
        runtime: &mut dyn EvalRuntime,
    ) -> Result<Option<u64>, EvalError> {
        let v = |value: Value| get(values, value);
        let result = match inst {
            Inst::Iconst { imm, .. } => *imm as u64,
            Inst::Fconst { bits } => *bits,
            Inst::Context => self.ctx,
            Inst::Frame => self.frame,
            Inst::Binary { op, ty, lhs, rhs } => binary(*op, *ty, v(*lhs)?, v(*rhs)?),
            Inst::Overflows { op, ty, lhs, rhs } => {
                overflows(*op, *ty, v(*lhs)?, v(*rhs)?) as u64
            }
            Inst::Unary { op, ty, arg } => unary(*op, *ty, v(*arg)?),
            Inst::FBinary { op, lhs, rhs } => {
                fbinary(*op, f(v(*lhs)?), f(v(*rhs)?)).to_bits()
            }
            Inst::FUnary { op, arg } => funary(*op, f(v(*arg)?)).to_bits(),
            Inst::Icmp { cc, lhs, rhs } => {
                let ty = self.func.value_type(*lhs);
                icmp(*cc, ty, v(*lhs)?, v(*rhs)?) as u64
            }
            Inst::Fcmp { cc, lhs, rhs } => fcmp(*cc, f(v(*lhs)?), f(v(*rhs)?)) as u64,
            Inst::Select {
                cond,
                if_true,
                if_false,
            } => {
                if v(*cond)? as u32 != 0 {
                    v(*if_true)?
                } else {
                    v(*if_false)?
                }
            }
            Inst::Extend { signed, arg } => {
                let low = v(*arg)? as u32;
                if *signed {
                    low as i32 as i64 as u64
                } else {
                    low as u64
                }
            }
            Inst::Truncate { arg } => v(*arg)? as u32 as u64,
            Inst::IntToDouble { signed, arg } => {
                let ty = self.func.value_type(*arg);
                let raw = v(*arg)?;
                let value = match (ty, signed) {
                    (Type::I32, true) => raw as u32 as i32 as f64,
                    (Type::I32, false) => raw as u32 as f64,
                    (_, true) => raw as i64 as f64,
                    (_, false) => raw as f64,
                };
                value.to_bits()
            }
            Inst::DoubleToInt { ty, arg } => {
                let value = f(v(*arg)?);
                match ty {
                    Type::I32 => value as i32 as u32 as u64,
                    _ => value as i64 as u64,
                }
            }
            Inst::BitcastToInt { arg } | Inst::BitcastToDouble { arg } => v(*arg)?,
            Inst::Load {
                width,
                signed,
                addr,
                offset,
                ..
            } => {
                let address = v(*addr)?.wrapping_add(*offset as i64 as u64);
                let raw = memory.read(address, width.bytes());
                match width {
                    MemWidth::F32 => (f32::from_bits(raw as u32) as f64).to_bits(),
                    MemWidth::W8 if *signed => raw as u8 as i8 as i64 as u64,
                    MemWidth::W16 if *signed => raw as u16 as i16 as i64 as u64,
                    MemWidth::W32 if *signed => raw as u32 as i32 as i64 as u64,
                    _ => raw,
                }
            }
            Inst::Store {
                width,
                value,
                addr,
                offset,
            } => {
                let address = v(*addr)?.wrapping_add(*offset as i64 as u64);
                let raw = v(*value)?;
                let raw = match width {
                    MemWidth::F32 => (f(raw) as f32).to_bits() as u64,
                    _ => raw,
                };
                memory.write(address, width.bytes(), raw);
                return Ok(None);
            }
            Inst::Call { helper, args } => {
                let args = args.iter().map(|a| v(*a)).collect::<Result<Vec<_>, _>>()?;
                runtime.call_helper(*helper, &args, memory)
            }
            Inst::Patchpoint { site, args } => {
                let args = args.iter().map(|a| v(*a)).collect::<Result<Vec<_>, _>>()?;
                runtime.patchpoint(*site, &args, memory)
            }
        };
        Ok(Some(result))
    }
}

fn get(values: &[Option<u64>], value: Value) -> Result<u64, EvalError> {
    values
        .get(value.0 as usize)
        .copied()
        .flatten()
        .ok_or(EvalError::Undefined(value))
}

fn normalize(ty: Type, raw: u64) -> u64 {
    match ty {
        Type::I32 => raw as u32 as u64,
        Type::I64 | Type::F64 => raw,
    }
}

fn f(raw: u64) -> f64 {
    f64::from_bits(raw)
}

fn binary(op: BinaryOp, ty: Type, lhs: u64, rhs: u64) -> u64 {
    match ty {
        Type::I32 => {
            let (a, b) = (lhs as u32 as i32, rhs as u32 as i32);
            let r = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::SDiv => {
                    if b == 0 {
                        0
                    } else {
                        a.wrapping_div(b)
                    }
                }
                BinaryOp::SRem => {
                    if b == 0 {
                        0
                    } else {
                        a.wrapping_rem(b)
                    }
                }
                BinaryOp::UDiv => {
                    if b == 0 {
                        0
                    } else {
                        ((a as u32) / (b as u32)) as i32
                    }
                }
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::Shl => a.wrapping_shl(b as u32),
                BinaryOp::SShr => a.wrapping_shr(b as u32),
                BinaryOp::UShr => (a as u32).wrapping_shr(b as u32) as i32,
            };
            r as u32 as u64
        }
        _ => {
            let (a, b) = (lhs as i64, rhs as i64);
            let r = match op {
                BinaryOp::Add => a.wrapping_add(b),
                BinaryOp::Sub => a.wrapping_sub(b),
                BinaryOp::Mul => a.wrapping_mul(b),
                BinaryOp::SDiv => {
                    if b == 0 {
                        0
                    } else {
                        a.wrapping_div(b)
                    }
                }
                BinaryOp::SRem => {
                    if b == 0 {
                        0
                    } else {
                        a.wrapping_rem(b)
                    }
                }
                BinaryOp::UDiv => {
                    if b == 0 {
                        0
                    } else {
                        ((a as u64) / (b as u64)) as i64
                    }
                }
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
                BinaryOp::Shl => a.wrapping_shl(b as u32),
                BinaryOp::SShr => a.wrapping_shr(b as u32),
                BinaryOp::UShr => (a as u64).wrapping_shr(b as u32) as i64,
            };
            r as u64
        }
    }
}

fn overflows(op: OverflowOp, ty: Type, lhs: u64, rhs: u64) -> bool {
    match ty {
        Type::I32 => {
            let (a, b) = (lhs as u32 as i32, rhs as u32 as i32);
            match op {
                OverflowOp::Add => a.checked_add(b).is_none(),
                OverflowOp::Sub => a.checked_sub(b).is_none(),
                OverflowOp::Mul => a.checked_mul(b).is_none(),
            }
        }
        _ => {
            let (a, b) = (lhs as i64, rhs as i64);
            match op {
                OverflowOp::Add => a.checked_add(b).is_none(),
                OverflowOp::Sub => a.checked_sub(b).is_none(),
                OverflowOp::Mul => a.checked_mul(b).is_none(),
            }
        }
    }
}

fn unary(op: UnaryOp, ty: Type, arg: u64) -> u64 {
    match ty {
        Type::I32 => {
            let a = arg as u32;
            let r = match op {
                UnaryOp::Neg => (a as i32).wrapping_neg() as u32,
                UnaryOp::Not => !a,
                UnaryOp::Clz => a.leading_zeros(),
            };
            r as u64
        }
        _ => match op {
            UnaryOp::Neg => (arg as i64).wrapping_neg() as u64,
            UnaryOp::Not => !arg,
            UnaryOp::Clz => arg.leading_zeros() as u64,
        },
    }
}

fn fbinary(op: FBinaryOp, a: f64, b: f64) -> f64 {
    match op {
        FBinaryOp::Add => a + b,
        FBinaryOp::Sub => a - b,
        FBinaryOp::Mul => a * b,
        FBinaryOp::Div => a / b,
        FBinaryOp::Min => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else if a == b {
                if a.is_sign_negative() { a } else { b }
            } else {
                a.min(b)
            }
        }
        FBinaryOp::Max => {
            if a.is_nan() || b.is_nan() {
                f64::NAN
            } else if a == b {
                if a.is_sign_positive() { a } else { b }
            } else {
                a.max(b)
            }
        }
    }
}

fn funary(op: FUnaryOp, a: f64) -> f64 {
    match op {
        FUnaryOp::Neg => -a,
        FUnaryOp::Abs => a.abs(),
        FUnaryOp::Sqrt => a.sqrt(),
        FUnaryOp::Floor => a.floor(),
        FUnaryOp::Ceil => a.ceil(),
        FUnaryOp::Demote => a as f32 as f64,
    }
}

fn icmp(cc: IntCC, ty: Type, lhs: u64, rhs: u64) -> bool {
    let (sa, sb, ua, ub) = match ty {
        Type::I32 => (
            lhs as u32 as i32 as i64,
            rhs as u32 as i32 as i64,
            lhs as u32 as u64,
            rhs as u32 as u64,
        ),
        _ => (lhs as i64, rhs as i64, lhs, rhs),
    };
    match cc {
        IntCC::Eq => ua == ub,
        IntCC::Ne => ua != ub,
        IntCC::Slt => sa < sb,
        IntCC::Sle => sa <= sb,
        IntCC::Sgt => sa > sb,
        IntCC::Sge => sa >= sb,
        IntCC::Ult => ua < ub,
        IntCC::Ule => ua <= ub,
        IntCC::Ugt => ua > ub,
        IntCC::Uge => ua >= ub,
    }
}

fn fcmp(cc: FloatCC, a: f64, b: f64) -> bool {
    match cc {
        FloatCC::Eq => a == b,
        FloatCC::Ne => a != b,
        FloatCC::Lt => a < b,
        FloatCC::Le => a <= b,
        FloatCC::Gt => a > b,
        FloatCC::Ge => a >= b,
        FloatCC::Unordered => a.is_nan() || b.is_nan(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lir::{BranchWeight, LirBuilder};

    struct NoRuntime;

    impl EvalRuntime for NoRuntime {
        fn call_helper(&mut self, helper: HelperKind, _: &[u64], _: &mut SparseMemory) -> u64 {
            panic!("unexpected helper call {helper:?}");
        }

        fn patchpoint(&mut self, site: SiteId, _: &[u64], _: &mut SparseMemory) -> u64 {
            panic!("unexpected patchpoint {site:?}");
        }
    }

    #[test]
    fn chill_division() {
        assert_eq!(binary(BinaryOp::SDiv, Type::I32, 7, 0), 0);
        let min = i32::MIN as u32 as u64;
        let neg_one = -1i32 as u32 as u64;
        assert_eq!(binary(BinaryOp::SDiv, Type::I32, min, neg_one), min);
        assert_eq!(binary(BinaryOp::SRem, Type::I32, min, neg_one), 0);
    }

    #[test]
    fn memory_is_little_endian_and_sparse() {
        let mut memory = SparseMemory::new();
        memory.write_u64(0x1ffc, 0x1122_3344_5566_7788);
        assert_eq!(memory.read_u32(0x1ffc), 0x5566_7788);
        assert_eq!(memory.read_u32(0x2000), 0x1122_3344);
        assert_eq!(memory.read_u64(0x9000), 0);
    }

    #[test]
    fn block_params_carry_values() {
        let mut b = LirBuilder::new("loop");
        let head = b.create_block();
        let i = b.append_block_param(head, Type::I32);
        let done = b.create_block();
        let zero = b.i32(0);
        b.jump(head, vec![zero]);
        b.switch_to(head);
        let next = b.add_imm(i, 1);
        let again = b.icmp_imm(IntCC::Slt, next, 10);
        let body = b.create_block();
        b.branch(again, body, done, BranchWeight::Normal);
        b.switch_to(body);
        b.jump(head, vec![next]);
        b.switch_to(done);
        let wide = b.zext(next);
        b.ret(wide);
        let func = b.finish();

        let mut memory = SparseMemory::new();
        let outcome = Evaluator::new(&func, 0, 0)
            .run(&mut memory, &mut NoRuntime)
            .expect("runs");
        assert_eq!(outcome, EvalOutcome::Returned(10));
    }

    #[test]
    fn step_limit_stops_infinite_loops() {
        let mut b = LirBuilder::new("spin");
        let head = b.create_block();
        b.jump(head, vec![]);
        b.switch_to(head);
        b.jump(head, vec![]);
        let func = b.finish();
        let result = Evaluator::new(&func, 0, 0)
            .with_step_limit(100)
            .run(&mut SparseMemory::new(), &mut NoRuntime);
        assert!(matches!(result, Err(EvalError::StepLimit(100))));
    }
}
