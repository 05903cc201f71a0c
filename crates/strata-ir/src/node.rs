//! Nodes, edges and opcode payloads

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::constant::FrozenValue;
use crate::operand::{BlockIndex, CodeOrigin, FlushFormat, IdentifierIndex, NodeId, Operand};
use crate::speculated_type::SpeculatedType;
use crate::structure::{IndexingType, PropertyOffset, StructureId, StructureSet, TypedArrayType};
use crate::use_kind::UseKind;

/// An input of a node: the producing node and the requirement on its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Producing node.
    pub node: NodeId,
    /// Requirement on the value.
    pub use_kind: UseKind,
    /// This is the last use of `node` in its block.
    pub kill: bool,
}

impl Edge {
    /// Edge with the given use kind.
    pub const fn new(node: NodeId, use_kind: UseKind) -> Self {
        Self {
            node,
            use_kind,
            kill: false,
        }
    }

    /// Edge that accepts any boxed value.
    pub const fn untyped(node: NodeId) -> Self {
        Self::new(node, UseKind::Untyped)
    }

    /// Mark this edge as the last use of its node.
    pub const fn killed(mut self) -> Self {
        self.kill = true;
        self
    }
}

/// Machine form of a node's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeResult {
    /// Produces nothing.
    None,
    /// 0/1.
    Boolean,
    /// 32-bit integer.
    Int32,
    /// 52-bit integer.
    Int52,
    /// 64-bit float.
    Double,
    /// Cell pointer.
    Cell,
    /// Boxed value.
    JsValue,
    /// Raw storage pointer (butterfly, typed array vector, string characters).
    Storage,
}

impl NodeResult {
    /// Types a value of this machine form can possibly have.
    pub fn type_bound(self) -> SpeculatedType {
        match self {
            Self::None | Self::Storage => SpeculatedType::NONE,
            Self::Boolean => SpeculatedType::BOOLEAN,
            Self::Int32 => SpeculatedType::INT32,
            Self::Int52 => SpeculatedType::MACHINE_INT,
            Self::Double => SpeculatedType::FULL_DOUBLE,
            Self::Cell => SpeculatedType::CELL,
            Self::JsValue => SpeculatedType::BYTECODE_TOP,
        }
    }
}

/// Overflow and negative-zero policy of an integer arithmetic node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArithMode {
    /// Result is known not to overflow; no checks.
    Unchecked,
    /// Exit on overflow.
    CheckOverflow,
    /// Exit on overflow and on a negative-zero result.
    CheckOverflowAndNegativeZero,
    /// Wrap on overflow (the result is truncated by its consumer).
    DoOverflow,
}

impl ArithMode {
    /// Overflow must be checked.
    pub const fn should_check_overflow(self) -> bool {
        matches!(self, Self::CheckOverflow | Self::CheckOverflowAndNegativeZero)
    }

    /// A negative-zero result must be checked.
    pub const fn should_check_negative_zero(self) -> bool {
        matches!(self, Self::CheckOverflowAndNegativeZero)
    }
}

/// How `ArithRound` produces its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoundingMode {
    /// Int32 result, -0 becomes 0.
    Int32,
    /// Int32 result, exits on -0.
    Int32WithNegativeZeroCheck,
    /// Double result.
    Double,
}

/// Frame slot accessed by `GetStack` / `PutStack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackAccessData {
    /// Source-level variable.
    pub local: Operand,
    /// Slot the value actually lives in.
    pub machine_local: Operand,
    /// Format of the slot's contents.
    pub format: FlushFormat,
}

/// Named property slot accessed by `GetByOffset` / `PutByOffset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageAccessData {
    /// Slot.
    pub offset: PropertyOffset,
    /// Property name.
    pub identifier: IdentifierIndex,
}

/// How one case of a `MultiGetByOffset` obtains its value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GetByOffsetMethod {
    /// Load from the given slot.
    Load(PropertyOffset),
    /// The property is a known constant.
    Constant(FrozenValue),
}

/// One structure-keyed case of a `MultiGetByOffset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MultiGetByOffsetCase {
    /// Structures this case applies to.
    pub structures: StructureSet,
    /// How to get the value.
    pub method: GetByOffsetMethod,
}

/// One structure-keyed variant of a `MultiPutByOffset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PutByOffsetVariant {
    /// Structures this variant applies to.
    pub old_structures: StructureSet,
    /// Structure after the store, when the store adds a property.
    pub new_structure: Option<StructureId>,
    /// Slot written.
    pub offset: PropertyOffset,
}

/// Structure transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transition {
    /// Structure before.
    pub previous: StructureId,
    /// Structure after.
    pub next: StructureId,
}

/// Storage shape an indexed access was specialized for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArrayType {
    /// Boxed int32 elements.
    Int32,
    /// Raw double elements.
    Double,
    /// Boxed value elements.
    Contiguous,
    /// String characters.
    String,
    /// Unmapped arguments object.
    DirectArguments,
    /// Scope-aliasing arguments object.
    ScopedArguments,
    /// Typed array view.
    TypedArray(TypedArrayType),
    /// No specialization; call into the runtime.
    Generic,
    /// Profiling saw nothing; exit unconditionally.
    ForceExit,
}

/// What an indexed access may do when the index is not a present element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ArraySpeculation {
    /// Exit when out of bounds or on a hole.
    InBounds,
    /// Holes read as `undefined` because the prototype chain is sane.
    SaneChain,
    /// Out-of-bounds accesses go to the runtime.
    OutOfBounds,
}

/// Specialization of an indexed access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArrayMode {
    /// Storage shape.
    pub array_type: ArrayType,
    /// Out-of-bounds and hole policy.
    pub speculation: ArraySpeculation,
    /// The base is known to be an `Array` (as opposed to any object with
    /// indexed storage).
    pub is_array: bool,
    /// Elements below the public length are proven present.
    pub dense: bool,
}

impl ArrayMode {
    /// In-bounds access of `array_type` on an `Array`.
    pub const fn in_bounds(array_type: ArrayType) -> Self {
        Self {
            array_type,
            speculation: ArraySpeculation::InBounds,
            is_array: true,
            dense: false,
        }
    }

    /// Copy with a different speculation.
    pub const fn with_speculation(mut self, speculation: ArraySpeculation) -> Self {
        self.speculation = speculation;
        self
    }

    /// Copy with the dense flag set.
    pub const fn proven_dense(mut self) -> Self {
        self.dense = true;
        self
    }

    /// Storage is a butterfly holding indexed elements.
    pub const fn uses_butterfly(self) -> bool {
        matches!(
            self.array_type,
            ArrayType::Int32 | ArrayType::Double | ArrayType::Contiguous
        )
    }

    /// Indexing shape byte the check for this mode expects.
    pub const fn indexing_shape(self) -> Option<u8> {
        match self.array_type {
            ArrayType::Int32 => Some(IndexingType::INT32_SHAPE),
            ArrayType::Double => Some(IndexingType::DOUBLE_SHAPE),
            ArrayType::Contiguous => Some(IndexingType::CONTIGUOUS_SHAPE),
            _ => None,
        }
    }
}

/// Flavour of a `Switch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchKind {
    /// Int32 immediates.
    Imm,
    /// Single-character strings, matched on the code unit.
    Char,
    /// Strings.
    String,
    /// Cell identity.
    Cell,
}

/// Key of a switch case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SwitchValue {
    /// Immediate case.
    Int(i32),
    /// Character case.
    Char(u16),
    /// String case.
    String(String),
    /// Cell case (address).
    Cell(u64),
}

/// One case of a switch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwitchCase {
    /// Key.
    pub value: SwitchValue,
    /// Target block.
    pub target: BlockIndex,
}

/// Switch table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwitchData {
    /// Flavour.
    pub kind: SwitchKind,
    /// Cases in source order.
    pub cases: Vec<SwitchCase>,
    /// Block taken when no case matches.
    pub fall_through: BlockIndex,
    /// Index of the runtime lookup table for this switch.
    pub table_index: u32,
}

/// Targets of a two-way branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchData {
    /// Block taken when the condition is truthy.
    pub taken: BlockIndex,
    /// Block taken otherwise.
    pub not_taken: BlockIndex,
}

/// Shape of a varargs call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VarargsData {
    /// Number of leading elements of the spread source to skip.
    pub first_vararg_offset: u32,
    /// Largest argument count the callee frame was sized for (0 when unknown).
    pub limit: u32,
}

/// Shape of a `LoadVarargs` / `ForwardVarargs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoadVarargsData {
    /// First frame slot receiving an argument.
    pub start: Operand,
    /// Frame slot receiving the argument count.
    pub count: Operand,
    /// Number of leading elements of the source to skip.
    pub offset: u32,
    /// Maximum number of arguments the target slots can hold.
    pub limit: u32,
    /// Arguments below this count are filled with `undefined`.
    pub mandatory_minimum: u32,
}

/// Allocation shape of a `NewArray*` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NewArrayData {
    /// Structure of the new array.
    pub structure: StructureId,
    /// Indexing byte of the new array.
    pub indexing: IndexingType,
}

/// Field of a phantom allocation tracked for exit-time materialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PromotedLocation {
    /// Structure of an object.
    Structure,
    /// Named property.
    NamedProperty(IdentifierIndex),
    /// Indexed argument of an arguments object.
    Argument(u32),
    /// Argument count of an arguments object.
    ArgumentCount,
    /// Callee of an arguments object.
    ArgumentsCallee,
    /// Executable of a function.
    FunctionExecutable,
    /// Scope of a function.
    FunctionActivation,
    /// Parent scope of an activation.
    ActivationScope,
    /// Symbol table of an activation.
    ActivationSymbolTable,
    /// Closure variable slot of an activation.
    ClosureVar(u32),
}

/// Payload of a mid-function materialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MaterializeData {
    /// Possible structures of the object.
    pub structures: StructureSet,
    /// Location of each child after the first, in order.
    pub locations: Vec<PromotedLocation>,
}

macro_rules! define_ops {
    ($( $(#[$doc:meta])* $name:ident $( ( $($payload:ty),* ) )? ,)*) => {
        /// IR operation, with its typed payload.
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        pub enum Op {
            $( $(#[$doc])* $name $( ( $($payload),* ) )? ,)*
        }

        impl Op {
            /// Opcode name.
            pub fn name(&self) -> &'static str {
                match self {
                    $( Op::$name { .. } => stringify!($name), )*
                }
            }
        }
    };
}

define_ops! {
    // ==================== Constants ====================
    /// Boxed constant.
    JsConstant(FrozenValue),
    /// Double machine constant (raw bits).
    DoubleConstant(u64),
    /// Int52 machine constant.
    Int52Constant(i64),

    // ==================== Plumbing ====================
    /// Forwards its only child.
    Identity,
    /// Keeps children alive; discharges their use kinds.
    Phantom,
    /// Discharges the use kinds of its children.
    Check,
    /// Value of a node proven never to execute.
    BottomValue,

    // ==================== Frame and SSA ====================
    /// Read a flushed frame slot.
    GetStack(StackAccessData),
    /// Flush a value to a frame slot.
    PutStack(StackAccessData),
    /// The frame slot of an operand no longer holds its value.
    KillStack(Operand),
    /// The operand now holds the child's value (no code).
    MovHint(Operand),
    /// The operand is dead from here (no code).
    ZombieHint(Operand),
    /// SSA merge; values arrive through `Upsilon`s.
    Phi,
    /// Feeds its child into the given `Phi`.
    Upsilon(NodeId),
    /// Argument arrives in its frame slot.
    SetArgument(Operand),
    /// Current callee.
    GetCallee,
    /// Argument count including `this`.
    GetArgumentCount,
    /// Loop header marker.
    LoopHint,
    /// Exit here if the code has been invalidated.
    InvalidationPoint,
    /// Increment the counter at the given address.
    CountExecution(u64),

    // ==================== Representation ====================
    /// Convert to a double machine value.
    DoubleRep,
    /// Box a machine value.
    ValueRep,
    /// Convert to an int52 machine value.
    Int52Rep,
    /// Boolean to 0/1 number.
    BooleanToNumber,
    /// Double to int32, exiting if not exact.
    DoubleAsInt32(ArithMode),
    /// JS ToInt32.
    ValueToInt32,
    /// Reinterpret an int32 as unsigned.
    UInt32ToNumber(ArithMode),

    // ==================== Arithmetic ====================
    /// `+` on numbers.
    ArithAdd(ArithMode),
    /// `-` on numbers.
    ArithSub(ArithMode),
    /// `*` on numbers.
    ArithMul(ArithMode),
    /// `/` on numbers.
    ArithDiv(ArithMode),
    /// `%` on numbers.
    ArithMod(ArithMode),
    /// Unary `-`.
    ArithNegate(ArithMode),
    /// `Math.abs`.
    ArithAbs(ArithMode),
    /// `Math.min`.
    ArithMin,
    /// `Math.max`.
    ArithMax,
    /// `Math.sqrt`.
    ArithSqrt,
    /// `Math.sin`.
    ArithSin,
    /// `Math.cos`.
    ArithCos,
    /// `Math.log`.
    ArithLog,
    /// `Math.pow`.
    ArithPow,
    /// `Math.round`.
    ArithRound(RoundingMode),
    /// `Math.fround`.
    ArithFRound,
    /// `Math.clz32`.
    ArithClz32,
    /// Generic `+`.
    ValueAdd,

    // ==================== Bitwise ====================
    /// `&`
    BitAnd,
    /// `|`
    BitOr,
    /// `^`
    BitXor,
    /// `<<`
    BitLShift,
    /// `>>`
    BitRShift,
    /// `>>>`
    BitURShift,

    // ==================== Comparison ====================
    /// `==`
    CompareEq,
    /// `===`
    CompareStrictEq,
    /// `<`
    CompareLess,
    /// `<=`
    CompareLessEq,
    /// `>`
    CompareGreater,
    /// `>=`
    CompareGreaterEq,
    /// `== null`
    CompareEqConstant,
    /// `!`
    LogicalNot,

    // ==================== Type queries ====================
    /// `=== undefined`
    IsUndefined,
    /// `typeof == "boolean"`
    IsBoolean,
    /// `typeof == "number"`
    IsNumber,
    /// `typeof == "string"`
    IsString,
    /// `typeof == "object"` excluding null.
    IsObject,
    /// `typeof == "object"`
    IsObjectOrNull,
    /// `typeof == "function"`
    IsFunction,
    /// `Array.isArray` on a cell that is not a proxy.
    IsArrayObject,
    /// `typeof`
    TypeOf,

    // ==================== Checks ====================
    /// Cell's structure is in the set.
    CheckStructure(StructureSet),
    /// Value is exactly this cell.
    CheckCell(FrozenValue),
    /// Always fails.
    CheckBadCell,
    /// Value is not the empty value.
    CheckNotEmpty,
    /// Index is below length.
    CheckInBounds,
    /// Base has the storage shape of the mode.
    CheckArray(ArrayMode),
    /// `instanceof` target supports the default algorithm.
    CheckHasInstance,
    /// Exit unconditionally to collect more profiling.
    ForceOsrExit,

    // ==================== Object model ====================
    /// Butterfly pointer of an object.
    GetButterfly,
    /// Allocate out-of-line storage for a transition.
    AllocatePropertyStorage(Transition),
    /// Grow out-of-line storage for a transition.
    ReallocatePropertyStorage(Transition),
    /// Load a named property slot.
    GetByOffset(StorageAccessData),
    /// Store a named property slot.
    PutByOffset(StorageAccessData),
    /// Structure-dispatched load.
    MultiGetByOffset(Vec<MultiGetByOffsetCase>),
    /// Structure-dispatched store.
    MultiPutByOffset(Vec<PutByOffsetVariant>),
    /// Change the structure of a cell.
    PutStructure(Transition),
    /// Allocate an empty object.
    NewObject(StructureId),
    /// Allocate an array from its children.
    NewArray(NewArrayData),
    /// Allocate an array with a length.
    NewArrayWithSize(NewArrayData),
    /// Allocate an array from a constant buffer.
    NewArrayBuffer(NewArrayData, Vec<FrozenValue>),
    /// Record a store into the child cell for the collector.
    StoreBarrier,
    /// Load a global variable.
    GetGlobalVar(u64),
    /// Store a global variable.
    PutGlobalVar(u64),
    /// Scope of a function.
    GetScope,
    /// Parent of a scope.
    SkipScope,
    /// Load a closure variable.
    GetClosureVar(u32),
    /// Store a closure variable.
    PutClosureVar(u32),
    /// Executable of a function.
    GetExecutable,
    /// Create a closure.
    NewFunction,
    /// Allocate an activation.
    CreateActivation(StructureId),
    /// Allocate an unmapped arguments object.
    CreateDirectArguments,
    /// Allocate a scope-aliasing arguments object.
    CreateScopedArguments,
    /// Allocate an arguments object by copying the frame.
    CreateClonedArguments,
    /// Load an argument from an arguments object.
    GetFromArguments(u32),
    /// Store an argument into an arguments object.
    PutToArguments(u32),
    /// `arguments[i]` without materializing `arguments`.
    GetMyArgumentByVal,

    // ==================== Phantom allocations ====================
    /// Object whose allocation was sunk.
    PhantomNewObject,
    /// Function whose allocation was sunk.
    PhantomNewFunction,
    /// Activation whose allocation was sunk.
    PhantomCreateActivation,
    /// Unmapped arguments whose allocation was sunk.
    PhantomDirectArguments,
    /// Cloned arguments whose allocation was sunk.
    PhantomClonedArguments,
    /// Field of a phantom allocation now holds the second child (no code).
    PutHint(PromotedLocation),
    /// Allocate a sunk object mid-function.
    MaterializeNewObject(MaterializeData),
    /// Allocate a sunk activation mid-function.
    MaterializeCreateActivation(MaterializeData),

    // ==================== Indexed access ====================
    /// Length of an indexed object.
    GetArrayLength(ArrayMode),
    /// `base[index]`
    GetByVal(ArrayMode),
    /// `base[index] = value`
    PutByVal(ArrayMode),
    /// `Array.prototype.push` with one value.
    ArrayPush(ArrayMode),
    /// `Array.prototype.pop`
    ArrayPop(ArrayMode),
    /// `index in base` for indexed storage.
    HasIndexedProperty(ArrayMode),
    /// Raw element storage pointer.
    GetIndexedPropertyStorage(ArrayMode),
    /// Byte offset of a typed array view.
    GetTypedArrayByteOffset,
    /// `String.prototype.charAt`
    StringCharAt(ArrayMode),
    /// `String.prototype.charCodeAt`
    StringCharCodeAt(ArrayMode),

    // ==================== Inline caches and calls ====================
    /// `base.name`
    GetById(IdentifierIndex),
    /// `base.name = value`
    PutById(IdentifierIndex),
    /// Own-property definition `base.name = value`.
    PutByIdDirect(IdentifierIndex),
    /// `key in base`
    In,
    /// Call with children `callee, this, args...`.
    Call,
    /// Construct with children `callee, this, args...`.
    Construct,
    /// Call spreading an array-like.
    CallVarargs(VarargsData),
    /// Construct spreading an array-like.
    ConstructVarargs(VarargsData),
    /// Call forwarding the current frame's arguments.
    CallForwardVarargs(VarargsData),
    /// Copy an array-like into frame slots.
    LoadVarargs(LoadVarargsData),
    /// Copy the current frame's arguments into frame slots.
    ForwardVarargs(LoadVarargsData),

    // ==================== Conversions and misc ====================
    /// `this` coercion.
    ToThis,
    /// ToPrimitive.
    ToPrimitive,
    /// ToString.
    ToString,
    /// String concatenation of two or three strings.
    MakeRope,
    /// `instanceof` with the prototype as second child.
    InstanceOf,
    /// `throw`
    Throw,
    /// Throw a ReferenceError with the given message.
    ThrowReferenceError(IdentifierIndex),

    // ==================== Control ====================
    /// Unconditional jump.
    Jump(BlockIndex),
    /// Two-way branch on truthiness.
    Branch(BranchData),
    /// Multi-way branch.
    Switch(SwitchData),
    /// Return the child.
    Return,
    /// Never reached.
    Unreachable,
}

impl Op {
    /// Ends a basic block.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Op::Jump(_)
                | Op::Branch(_)
                | Op::Switch(_)
                | Op::Return
                | Op::Unreachable
                | Op::Throw
                | Op::ThrowReferenceError(_)
        )
    }

    /// Successor blocks of a terminal, in case order.
    pub fn successors(&self) -> SmallVec<[BlockIndex; 2]> {
        let mut successors = SmallVec::new();
        match self {
            Op::Jump(target) => successors.push(*target),
            Op::Branch(data) => {
                successors.push(data.taken);
                successors.push(data.not_taken);
            }
            Op::Switch(data) => {
                for case in &data.cases {
                    if !successors.contains(&case.target) {
                        successors.push(case.target);
                    }
                }
                if !successors.contains(&data.fall_through) {
                    successors.push(data.fall_through);
                }
            }
            _ => {}
        }
        successors
    }

    /// Allocation that was sunk and only exists for exit-time materialization.
    pub fn is_phantom_allocation(&self) -> bool {
        matches!(
            self,
            Op::PhantomNewObject
                | Op::PhantomNewFunction
                | Op::PhantomCreateActivation
                | Op::PhantomDirectArguments
                | Op::PhantomClonedArguments
        )
    }

    /// May run arbitrary user code or otherwise change any structure.
    pub fn clobbers_world(&self) -> bool {
        match self {
            Op::ValueAdd
            | Op::ToPrimitive
            | Op::ToString
            | Op::ToThis
            | Op::InstanceOf
            | Op::GetById(_)
            | Op::PutById(_)
            | Op::PutByIdDirect(_)
            | Op::In
            | Op::Call
            | Op::Construct
            | Op::CallVarargs(_)
            | Op::ConstructVarargs(_)
            | Op::CallForwardVarargs(_)
            | Op::LoadVarargs(_) => true,
            Op::GetByVal(mode) | Op::PutByVal(mode) => {
                matches!(mode.array_type, ArrayType::Generic)
                    || matches!(mode.speculation, ArraySpeculation::OutOfBounds)
            }
            Op::CompareEq
            | Op::CompareLess
            | Op::CompareLessEq
            | Op::CompareGreater
            | Op::CompareGreaterEq => false,
            _ => false,
        }
    }

    /// Produces no code; only informs availability or abstract state.
    pub fn is_hint(&self) -> bool {
        matches!(
            self,
            Op::MovHint(_)
                | Op::ZombieHint(_)
                | Op::KillStack(_)
                | Op::PutHint(_)
                | Op::SetArgument(_)
                | Op::LoopHint
        ) || self.is_phantom_allocation()
    }
}

/// One IR operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Operation and payload.
    pub op: Op,
    /// Inputs.
    pub children: SmallVec<[Edge; 3]>,
    /// Machine form of the result.
    pub result: NodeResult,
    /// Source position.
    pub origin: CodeOrigin,
    /// Profiled type of the result, used for heap loads and calls.
    pub prediction: SpeculatedType,
}

impl Node {
    /// Create a node.
    pub fn new(op: Op, children: impl IntoIterator<Item = Edge>, result: NodeResult) -> Self {
        Self {
            op,
            children: children.into_iter().collect(),
            result,
            origin: CodeOrigin::default(),
            prediction: SpeculatedType::HEAP_TOP,
        }
    }

    /// First child.
    ///
    /// # Panics
    /// If the node has no children; the graph validator rejects such nodes
    /// for every opcode that calls this.
    pub fn child1(&self) -> Edge {
        self.children[0]
    }

    /// Second child.
    pub fn child2(&self) -> Edge {
        self.children[1]
    }

    /// Third child.
    pub fn child3(&self) -> Edge {
        self.children[2]
    }

    /// Node has a value result.
    pub fn has_result(&self) -> bool {
        !matches!(self.result, NodeResult::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_come_from_variants() {
        assert_eq!(Op::ArithAdd(ArithMode::CheckOverflow).name(), "ArithAdd");
        assert_eq!(Op::Return.name(), "Return");
        assert_eq!(Op::CheckStructure(StructureSet::new()).name(), "CheckStructure");
    }

    #[test]
    fn switch_successors_are_unique() {
        let data = SwitchData {
            kind: SwitchKind::Imm,
            cases: vec![
                SwitchCase { value: SwitchValue::Int(1), target: BlockIndex(1) },
                SwitchCase { value: SwitchValue::Int(2), target: BlockIndex(1) },
                SwitchCase { value: SwitchValue::Int(3), target: BlockIndex(2) },
            ],
            fall_through: BlockIndex(2),
            table_index: 0,
        };
        let successors = Op::Switch(data).successors();
        assert_eq!(successors.as_slice(), &[BlockIndex(1), BlockIndex(2)]);
    }

    #[test]
    fn arith_mode_policies() {
        assert!(!ArithMode::Unchecked.should_check_overflow());
        assert!(ArithMode::CheckOverflow.should_check_overflow());
        assert!(!ArithMode::CheckOverflow.should_check_negative_zero());
        assert!(ArithMode::CheckOverflowAndNegativeZero.should_check_negative_zero());
    }
}
