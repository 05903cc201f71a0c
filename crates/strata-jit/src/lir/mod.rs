//! Low-level IR handed to the native backend.
//!
//! A [`LirFunction`] is a list of blocks in SSA form. Block parameters carry
//! values across edges. Every value has one of three machine types. Two
//! instructions carry the speculation protocol:
//!
//! - [`Inst::Patchpoint`] reserves a runtime-rewritable call site;
//! - [`Terminator::Exit`] ends a cold block and records the stackmap (the
//!   values the exit's records refer to by argument index).

pub mod eval;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::exit::ExitId;
use crate::helpers::HelperKind;
use crate::ic::SiteId;

/// Machine type of a LIR value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Type {
    /// 32-bit integer.
    I32,
    /// 64-bit integer or pointer.
    I64,
    /// 64-bit float.
    F64,
}

/// SSA value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Value(pub u32);

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// LIR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u32);

impl BlockId {
    /// Index into [`LirFunction::blocks`].
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Wrapping integer binary operations.
///
/// Division and remainder are "chill": `x / 0 == 0`, `x % 0 == 0`,
/// `MIN / -1 == MIN` and `MIN % -1 == 0`. Shift amounts are masked to the
/// operand width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// signed `/`
    SDiv,
    /// signed `%`
    SRem,
    /// unsigned `/`
    UDiv,
    /// `&`
    And,
    /// `|`
    Or,
    /// `^`
    Xor,
    /// `<<`
    Shl,
    /// arithmetic `>>`
    SShr,
    /// logical `>>`
    UShr,
}

/// Integer operations whose signed overflow can be tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverflowOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
}

/// Integer unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    /// Wrapping negation.
    Neg,
    /// Bitwise not.
    Not,
    /// Count leading zeros.
    Clz,
}

/// Float binary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FBinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// IEEE minimum (NaN-propagating, -0 < +0).
    Min,
    /// IEEE maximum (NaN-propagating, -0 < +0).
    Max,
}

/// Float unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FUnaryOp {
    /// Negation.
    Neg,
    /// Absolute value.
    Abs,
    /// Square root.
    Sqrt,
    /// Round toward negative infinity.
    Floor,
    /// Round toward positive infinity.
    Ceil,
    /// Round to single precision and back.
    Demote,
}

/// Integer comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntCC {
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// signed `<`
    Slt,
    /// signed `<=`
    Sle,
    /// signed `>`
    Sgt,
    /// signed `>=`
    Sge,
    /// unsigned `<`
    Ult,
    /// unsigned `<=`
    Ule,
    /// unsigned `>`
    Ugt,
    /// unsigned `>=`
    Uge,
}

/// Float comparisons; all but `Ne` and `Unordered` are false on NaN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FloatCC {
    /// `==`
    Eq,
    /// `!=` (true on NaN)
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// Either operand is NaN.
    Unordered,
}

/// Memory access width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemWidth {
    /// 8-bit integer.
    W8,
    /// 16-bit integer.
    W16,
    /// 32-bit integer.
    W32,
    /// 64-bit integer.
    W64,
    /// 32-bit float (widened to / narrowed from `F64`).
    F32,
    /// 64-bit float.
    F64,
}

impl MemWidth {
    /// Size in bytes.
    pub const fn bytes(self) -> u32 {
        match self {
            Self::W8 => 1,
            Self::W16 => 2,
            Self::W32 | Self::F32 => 4,
            Self::W64 | Self::F64 => 8,
        }
    }
}

/// Hint about which side of a branch is cold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BranchWeight {
    /// No information.
    #[default]
    Normal,
    /// The taken side is rarely executed.
    TakenRare,
    /// The not-taken side is rarely executed.
    NotTakenRare,
}

/// Value-producing (or storing) instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Inst {
    /// Integer constant.
    Iconst {
        /// `I32` or `I64`.
        ty: Type,
        /// Value, truncated to `ty`.
        imm: i64,
    },
    /// Float constant (raw bits).
    Fconst {
        /// Bits.
        bits: u64,
    },
    /// Execution context pointer.
    Context,
    /// Frame pointer of the unoptimized tier.
    Frame,
    /// Wrapping integer arithmetic.
    Binary {
        /// Operation.
        op: BinaryOp,
        /// Operand type.
        ty: Type,
        /// Left.
        lhs: Value,
        /// Right.
        rhs: Value,
    },
    /// `I32` 1 when the signed operation overflows `ty`.
    Overflows {
        /// Operation.
        op: OverflowOp,
        /// Operand type.
        ty: Type,
        /// Left.
        lhs: Value,
        /// Right.
        rhs: Value,
    },
    /// Integer unary operation.
    Unary {
        /// Operation.
        op: UnaryOp,
        /// Operand type.
        ty: Type,
        /// Operand.
        arg: Value,
    },
    /// Float binary operation.
    FBinary {
        /// Operation.
        op: FBinaryOp,
        /// Left.
        lhs: Value,
        /// Right.
        rhs: Value,
    },
    /// Float unary operation.
    FUnary {
        /// Operation.
        op: FUnaryOp,
        /// Operand.
        arg: Value,
    },
    /// `I32` 0/1 integer comparison.
    Icmp {
        /// Condition.
        cc: IntCC,
        /// Left.
        lhs: Value,
        /// Right.
        rhs: Value,
    },
    /// `I32` 0/1 float comparison.
    Fcmp {
        /// Condition.
        cc: FloatCC,
        /// Left.
        lhs: Value,
        /// Right.
        rhs: Value,
    },
    /// `cond != 0 ? if_true : if_false`.
    Select {
        /// `I32` condition.
        cond: Value,
        /// Value when true.
        if_true: Value,
        /// Value when false.
        if_false: Value,
    },
    /// `I32` → `I64`.
    Extend {
        /// Sign- or zero-extend.
        signed: bool,
        /// Operand.
        arg: Value,
    },
    /// `I64` → `I32` (low bits).
    Truncate {
        /// Operand.
        arg: Value,
    },
    /// Integer → `F64`.
    IntToDouble {
        /// Interpret the operand as signed.
        signed: bool,
        /// `I32` or `I64` operand.
        arg: Value,
    },
    /// `F64` → integer, truncating toward zero and saturating; NaN gives 0.
    DoubleToInt {
        /// `I32` or `I64`.
        ty: Type,
        /// Operand.
        arg: Value,
    },
    /// `F64` bits as `I64`.
    BitcastToInt {
        /// Operand.
        arg: Value,
    },
    /// `I64` bits as `F64`.
    BitcastToDouble {
        /// Operand.
        arg: Value,
    },
    /// Load `width` bytes at `addr + offset`, extended to `ty`.
    Load {
        /// Result type.
        ty: Type,
        /// Access width.
        width: MemWidth,
        /// Sign-extend narrow integer loads.
        signed: bool,
        /// Base address.
        addr: Value,
        /// Byte offset.
        offset: i32,
    },
    /// Store the low `width` bytes of `value` at `addr + offset`.
    Store {
        /// Access width.
        width: MemWidth,
        /// Stored value.
        value: Value,
        /// Base address.
        addr: Value,
        /// Byte offset.
        offset: i32,
    },
    /// Call a runtime helper with `ctx` prepended; returns `I64`.
    Call {
        /// Helper.
        helper: HelperKind,
        /// Arguments after `ctx`.
        args: Vec<Value>,
    },
    /// Patchable call site; returns `I64`.
    Patchpoint {
        /// Site descriptor.
        site: SiteId,
        /// Values the site receives.
        args: Vec<Value>,
    },
}

/// An instruction and the value it defines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstData {
    /// Instruction.
    pub inst: Inst,
    /// Defined value, `None` for stores.
    pub result: Option<Value>,
}

/// Block terminator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Terminator {
    /// Unconditional jump.
    Jump {
        /// Target.
        target: BlockId,
        /// Target block parameters.
        args: Vec<Value>,
    },
    /// Two-way branch on `cond != 0`.
    Branch {
        /// `I32` condition.
        cond: Value,
        /// Target when non-zero.
        taken: BlockId,
        /// Parameters of `taken`.
        taken_args: Vec<Value>,
        /// Target when zero.
        not_taken: BlockId,
        /// Parameters of `not_taken`.
        not_taken_args: Vec<Value>,
        /// Cold-side hint.
        weight: BranchWeight,
    },
    /// Multi-way branch on an `I32`; targets take no parameters.
    Switch {
        /// Scrutinee.
        value: Value,
        /// `(key, target)` pairs.
        cases: Vec<(i32, BlockId)>,
        /// Target when no key matches.
        default: BlockId,
    },
    /// Return an `I64`.
    Return {
        /// Returned value.
        value: Value,
    },
    /// Leave through an OSR exit.
    Exit {
        /// Exit record.
        exit: ExitId,
        /// Stackmap: the values the exit record refers to by argument index.
        values: Vec<Value>,
    },
    /// Never reached.
    Unreachable,
}

impl Terminator {
    /// Successor blocks.
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Self::Jump { target, .. } => vec![*target],
            Self::Branch {
                taken, not_taken, ..
            } => vec![*taken, *not_taken],
            Self::Switch { cases, default, .. } => {
                let mut out: Vec<BlockId> = cases.iter().map(|(_, b)| *b).collect();
                out.push(*default);
                out
            }
            Self::Return { .. } | Self::Exit { .. } | Self::Unreachable => Vec::new(),
        }
    }
}

/// A LIR block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LirBlock {
    /// Parameters.
    pub params: Vec<Value>,
    /// Instructions.
    pub insts: Vec<InstData>,
    /// Terminator.
    pub terminator: Terminator,
    /// Block only runs when a speculation fails.
    pub cold: bool,
}

/// A lowered function. Block 0 is the entry and takes no parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LirFunction {
    /// Name, for diagnostics.
    pub name: String,
    /// Blocks.
    pub blocks: Vec<LirBlock>,
    /// Type of every value.
    pub value_types: Vec<Type>,
}

impl LirFunction {
    /// Block by id.
    pub fn block(&self, id: BlockId) -> &LirBlock {
        &self.blocks[id.index()]
    }

    /// Type of a value.
    pub fn value_type(&self, value: Value) -> Type {
        self.value_types[value.0 as usize]
    }

    /// Total number of instructions.
    pub fn inst_count(&self) -> usize {
        self.blocks.iter().map(|b| b.insts.len()).sum()
    }

    /// Blocks reachable from the entry, in depth-first preorder.
    pub fn reachable_blocks(&self) -> Vec<BlockId> {
        let mut seen = vec![false; self.blocks.len()];
        let mut order = Vec::new();
        let mut stack = vec![BlockId(0)];
        while let Some(block) = stack.pop() {
            if seen[block.index()] {
                continue;
            }
            seen[block.index()] = true;
            order.push(block);
            for succ in self.block(block).terminator.successors().into_iter().rev() {
                if !seen[succ.index()] {
                    stack.push(succ);
                }
            }
        }
        order
    }

    /// Patchpoint sites referenced by reachable code.
    pub fn patchpoint_sites(&self) -> Vec<SiteId> {
        let mut sites = Vec::new();
        for block in &self.blocks {
            for inst in &block.insts {
                if let Inst::Patchpoint { site, .. } = inst.inst {
                    sites.push(site);
                }
            }
        }
        sites
    }
}

impl fmt::Display for LirFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "function {}:", self.name)?;
        for (i, block) in self.blocks.iter().enumerate() {
            let params: Vec<String> = block.params.iter().map(|p| p.to_string()).collect();
            let cold = if block.cold { " cold" } else { "" };
            writeln!(f, "  b{i}({}){cold}:", params.join(", "))?;
            for inst in &block.insts {
                match inst.result {
                    Some(result) => writeln!(f, "    {result} = {:?}", inst.inst)?,
                    None => writeln!(f, "    {:?}", inst.inst)?,
                }
            }
            writeln!(f, "    {:?}", block.terminator)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Appends instructions to a [`LirFunction`].
///
/// Emitting into a block that already has a terminator starts a fresh
/// unreachable block, so code following an exit is dropped rather than
/// corrupting the terminated block.
#[derive(Debug)]
pub struct LirBuilder {
    func: LirFunction,
    terminated: Vec<bool>,
    current: BlockId,
}

impl LirBuilder {
    /// Start a function with an empty entry block.
    pub fn new(name: impl Into<String>) -> Self {
        let mut builder = Self {
            func: LirFunction {
                name: name.into(),
                blocks: Vec::new(),
                value_types: Vec::new(),
            },
            terminated: Vec::new(),
            current: BlockId(0),
        };
        builder.create_block();
        builder
    }

    /// Create an empty block.
    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.func.blocks.len() as u32);
        self.func.blocks.push(LirBlock {
            params: Vec::new(),
            insts: Vec::new(),
            terminator: Terminator::Unreachable,
            cold: false,
        });
        self.terminated.push(false);
        id
    }

    /// Create a block that only runs when a speculation fails.
    pub fn create_cold_block(&mut self) -> BlockId {
        let id = self.create_block();
        self.func.blocks[id.index()].cold = true;
        id
    }

    /// Add a parameter to `block`.
    pub fn append_block_param(&mut self, block: BlockId, ty: Type) -> Value {
        let value = self.new_value(ty);
        self.func.blocks[block.index()].params.push(value);
        value
    }

    /// Continue emitting into `block`.
    pub fn switch_to(&mut self, block: BlockId) {
        self.current = block;
    }

    /// Block being emitted into.
    pub fn current(&self) -> BlockId {
        self.current
    }

    /// The current block already has a terminator.
    pub fn is_terminated(&self) -> bool {
        self.terminated[self.current.index()]
    }

    /// Type of a value.
    pub fn value_type(&self, value: Value) -> Type {
        self.func.value_type(value)
    }

    /// Total number of instructions emitted so far.
    pub fn inst_count(&self) -> usize {
        self.func.inst_count()
    }

    fn new_value(&mut self, ty: Type) -> Value {
        let value = Value(self.func.value_types.len() as u32);
        self.func.value_types.push(ty);
        value
    }

    fn ensure_open(&mut self) {
        if self.is_terminated() {
            let dead = self.create_block();
            self.current = dead;
        }
    }

    fn push(&mut self, inst: Inst, ty: Option<Type>) -> Option<Value> {
        self.ensure_open();
        let result = ty.map(|ty| self.new_value(ty));
        self.func.blocks[self.current.index()]
            .insts
            .push(InstData { inst, result });
        result
    }

    fn value(&mut self, inst: Inst, ty: Type) -> Value {
        match self.push(inst, Some(ty)) {
            Some(value) => value,
            None => unreachable!("push with a type always defines a value"),
        }
    }

    /// Set the terminator of the current block.
    pub fn terminate(&mut self, terminator: Terminator) {
        self.ensure_open();
        let index = self.current.index();
        self.func.blocks[index].terminator = terminator;
        self.terminated[index] = true;
    }

    // ---- constants and parameters ----

    /// Integer constant.
    pub fn iconst(&mut self, ty: Type, imm: i64) -> Value {
        self.value(Inst::Iconst { ty, imm }, ty)
    }

    /// `I32` constant.
    pub fn i32(&mut self, imm: i32) -> Value {
        self.iconst(Type::I32, imm as i64)
    }

    /// `I64` constant.
    pub fn i64(&mut self, imm: i64) -> Value {
        self.iconst(Type::I64, imm)
    }

    /// `F64` constant.
    pub fn f64(&mut self, value: f64) -> Value {
        self.value(Inst::Fconst { bits: value.to_bits() }, Type::F64)
    }

    /// Execution context pointer.
    pub fn context(&mut self) -> Value {
        self.value(Inst::Context, Type::I64)
    }

    /// Frame pointer.
    pub fn frame(&mut self) -> Value {
        self.value(Inst::Frame, Type::I64)
    }

    // ---- integer arithmetic ----

    /// Wrapping binary operation; the type is taken from `lhs`.
    pub fn binary(&mut self, op: BinaryOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.value_type(lhs);
        self.value(Inst::Binary { op, ty, lhs, rhs }, ty)
    }

    /// `lhs + rhs`
    pub fn add(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    /// `lhs - rhs`
    pub fn sub(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    /// `lhs & rhs`
    pub fn and(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::And, lhs, rhs)
    }

    /// `lhs | rhs`
    pub fn or(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Or, lhs, rhs)
    }

    /// `lhs ^ rhs`
    pub fn xor(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Xor, lhs, rhs)
    }

    /// `lhs << rhs`
    pub fn shl(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::Shl, lhs, rhs)
    }

    /// Arithmetic `lhs >> rhs`.
    pub fn sshr(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::SShr, lhs, rhs)
    }

    /// Logical `lhs >> rhs`.
    pub fn ushr(&mut self, lhs: Value, rhs: Value) -> Value {
        self.binary(BinaryOp::UShr, lhs, rhs)
    }

    /// `lhs + imm` with `imm` of `lhs`'s type.
    pub fn add_imm(&mut self, lhs: Value, imm: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, imm);
        self.add(lhs, rhs)
    }

    /// `lhs & imm`.
    pub fn and_imm(&mut self, lhs: Value, imm: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, imm);
        self.and(lhs, rhs)
    }

    /// `lhs | imm`.
    pub fn or_imm(&mut self, lhs: Value, imm: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, imm);
        self.or(lhs, rhs)
    }

    /// `lhs << imm`.
    pub fn shl_imm(&mut self, lhs: Value, imm: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, imm);
        self.shl(lhs, rhs)
    }

    /// Arithmetic `lhs >> imm`.
    pub fn sshr_imm(&mut self, lhs: Value, imm: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, imm);
        self.sshr(lhs, rhs)
    }

    /// `I32` overflow flag of a signed operation.
    pub fn overflows(&mut self, op: OverflowOp, lhs: Value, rhs: Value) -> Value {
        let ty = self.value_type(lhs);
        self.value(Inst::Overflows { op, ty, lhs, rhs }, Type::I32)
    }

    /// Integer unary operation.
    pub fn unary(&mut self, op: UnaryOp, arg: Value) -> Value {
        let ty = self.value_type(arg);
        self.value(Inst::Unary { op, ty, arg }, ty)
    }

    // ---- float arithmetic ----

    /// Float binary operation.
    pub fn fbinary(&mut self, op: FBinaryOp, lhs: Value, rhs: Value) -> Value {
        self.value(Inst::FBinary { op, lhs, rhs }, Type::F64)
    }

    /// Float unary operation.
    pub fn funary(&mut self, op: FUnaryOp, arg: Value) -> Value {
        self.value(Inst::FUnary { op, arg }, Type::F64)
    }

    // ---- comparisons and selection ----

    /// Integer comparison.
    pub fn icmp(&mut self, cc: IntCC, lhs: Value, rhs: Value) -> Value {
        self.value(Inst::Icmp { cc, lhs, rhs }, Type::I32)
    }

    /// Integer comparison against an immediate of `lhs`'s type.
    pub fn icmp_imm(&mut self, cc: IntCC, lhs: Value, imm: i64) -> Value {
        let ty = self.value_type(lhs);
        let rhs = self.iconst(ty, imm);
        self.icmp(cc, lhs, rhs)
    }

    /// Float comparison.
    pub fn fcmp(&mut self, cc: FloatCC, lhs: Value, rhs: Value) -> Value {
        self.value(Inst::Fcmp { cc, lhs, rhs }, Type::I32)
    }

    /// `cond ? if_true : if_false`.
    pub fn select(&mut self, cond: Value, if_true: Value, if_false: Value) -> Value {
        let ty = self.value_type(if_true);
        self.value(
            Inst::Select {
                cond,
                if_true,
                if_false,
            },
            ty,
        )
    }

    // ---- conversions ----

    /// Sign-extend `I32` → `I64`.
    pub fn sext(&mut self, arg: Value) -> Value {
        self.value(Inst::Extend { signed: true, arg }, Type::I64)
    }

    /// Zero-extend `I32` → `I64`.
    pub fn zext(&mut self, arg: Value) -> Value {
        self.value(Inst::Extend { signed: false, arg }, Type::I64)
    }

    /// Truncate `I64` → `I32`.
    pub fn trunc(&mut self, arg: Value) -> Value {
        self.value(Inst::Truncate { arg }, Type::I32)
    }

    /// Integer → `F64`.
    pub fn int_to_double(&mut self, signed: bool, arg: Value) -> Value {
        self.value(Inst::IntToDouble { signed, arg }, Type::F64)
    }

    /// `F64` → integer (truncating, saturating).
    pub fn double_to_int(&mut self, ty: Type, arg: Value) -> Value {
        self.value(Inst::DoubleToInt { ty, arg }, ty)
    }

    /// `F64` bits → `I64`.
    pub fn bitcast_to_int(&mut self, arg: Value) -> Value {
        self.value(Inst::BitcastToInt { arg }, Type::I64)
    }

    /// `I64` bits → `F64`.
    pub fn bitcast_to_double(&mut self, arg: Value) -> Value {
        self.value(Inst::BitcastToDouble { arg }, Type::F64)
    }

    // ---- memory ----

    /// Load.
    pub fn load(&mut self, ty: Type, width: MemWidth, signed: bool, addr: Value, offset: i32) -> Value {
        self.value(
            Inst::Load {
                ty,
                width,
                signed,
                addr,
                offset,
            },
            ty,
        )
    }

    /// Load a 64-bit word.
    pub fn load64(&mut self, addr: Value, offset: i32) -> Value {
        self.load(Type::I64, MemWidth::W64, false, addr, offset)
    }

    /// Load an unsigned 32-bit word.
    pub fn load32(&mut self, addr: Value, offset: i32) -> Value {
        self.load(Type::I32, MemWidth::W32, false, addr, offset)
    }

    /// Load an unsigned byte as `I32`.
    pub fn load8(&mut self, addr: Value, offset: i32) -> Value {
        self.load(Type::I32, MemWidth::W8, false, addr, offset)
    }

    /// Store.
    pub fn store(&mut self, width: MemWidth, value: Value, addr: Value, offset: i32) {
        self.push(
            Inst::Store {
                width,
                value,
                addr,
                offset,
            },
            None,
        );
    }

    /// Store a 64-bit word.
    pub fn store64(&mut self, value: Value, addr: Value, offset: i32) {
        self.store(MemWidth::W64, value, addr, offset);
    }

    // ---- calls ----

    /// Call a runtime helper.
    pub fn call(&mut self, helper: HelperKind, args: Vec<Value>) -> Value {
        self.value(Inst::Call { helper, args }, Type::I64)
    }

    /// Emit a patchable call site.
    pub fn patchpoint(&mut self, site: SiteId, args: Vec<Value>) -> Value {
        self.value(Inst::Patchpoint { site, args }, Type::I64)
    }

    // ---- terminators ----

    /// Jump with block arguments.
    pub fn jump(&mut self, target: BlockId, args: Vec<Value>) {
        self.terminate(Terminator::Jump { target, args });
    }

    /// Branch without block arguments.
    pub fn branch(&mut self, cond: Value, taken: BlockId, not_taken: BlockId, weight: BranchWeight) {
        self.terminate(Terminator::Branch {
            cond,
            taken,
            taken_args: Vec::new(),
            not_taken,
            not_taken_args: Vec::new(),
            weight,
        });
    }

    /// Multi-way branch.
    pub fn switch(&mut self, value: Value, cases: Vec<(i32, BlockId)>, default: BlockId) {
        self.terminate(Terminator::Switch {
            value,
            cases,
            default,
        });
    }

    /// Return.
    pub fn ret(&mut self, value: Value) {
        self.terminate(Terminator::Return { value });
    }

    /// Leave through an exit.
    pub fn exit(&mut self, exit: ExitId, values: Vec<Value>) {
        self.terminate(Terminator::Exit { exit, values });
    }

    /// Mark the current block unreachable.
    pub fn unreachable(&mut self) {
        self.terminate(Terminator::Unreachable);
    }

    /// Finish building.
    pub fn finish(self) -> LirFunction {
        self.func
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emitting_after_terminator_opens_dead_block() {
        let mut b = LirBuilder::new("t");
        let one = b.i32(1);
        b.ret(one);
        let entry_insts = b.inst_count();
        let two = b.i32(2);
        b.ret(two);
        let func = b.finish();
        assert_eq!(func.blocks.len(), 2);
        assert_eq!(func.block(BlockId(0)).insts.len(), entry_insts);
        assert_eq!(func.reachable_blocks(), vec![BlockId(0)]);
    }

    #[test]
    fn value_types_follow_operands() {
        let mut b = LirBuilder::new("t");
        let a = b.i64(3);
        let c = b.add_imm(a, 4);
        let flag = b.icmp_imm(IntCC::Eq, c, 7);
        assert_eq!(b.value_type(c), Type::I64);
        assert_eq!(b.value_type(flag), Type::I32);
    }
}
