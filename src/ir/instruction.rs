//! IR instruction definitions: the SSA instruction set.
//!
//! Key types:
//! - `Value`: SSA value reference (u32 index, formats as "%{id}")
//! - `BlockId`: basic block identifier (u32 index, formats as "bb{id}")
//! - `Operand`: either a `Value` or an `IrConst`
//! - `Instruction`: the main instruction enum
//! - `Terminator`: block terminators (return, branch, cond branch)
//! - `BasicBlock`: a labeled sequence of instructions ending in a terminator

use crate::common::types::IrType;
use super::constants::IrConst;

/// A basic block identifier. Uses a u32 index for zero-cost copies
/// instead of heap-allocated String labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// An SSA value reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Value(pub u32);

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// An operand (either a value reference or a constant).
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Const(IrConst),
}

impl Operand {
    /// The local SSA value, if this operand is one.
    pub fn as_value(&self) -> Option<Value> {
        match self {
            Operand::Value(v) => Some(*v),
            Operand::Const(_) => None,
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    /// The integer payload, if this operand is an integer constant.
    pub fn const_int(&self) -> Option<i64> {
        match self {
            Operand::Const(c) => c.as_int(),
            Operand::Value(_) => None,
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Value(v) => write!(f, "{}", v),
            Operand::Const(c) => write!(f, "{}", c),
        }
    }
}

/// Cast operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CastOp {
    /// Reinterpret the bits at a new type (pointer-to-pointer casts).
    Bitcast,
    Sext,
    Zext,
    Trunc,
    PtrToInt,
    IntToPtr,
}

/// Binary operations (pass-through for the instrumentation pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrBinOp {
    Add,
    Sub,
    Mul,
    SDiv,
    UDiv,
    And,
    Or,
    Xor,
    Shl,
    AShr,
    LShr,
}

/// Comparison operations (pass-through for the instrumentation pass).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrCmpOp {
    Eq,
    Ne,
    Slt,
    Sle,
    Sgt,
    Sge,
    Ult,
    Ule,
    Ugt,
    Uge,
}

/// A call target: a named symbol or a computed function pointer.
#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    Name(String),
    Indirect(Operand),
}

/// An IR instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Stack allocation: %dest = alloca ty [, count]. The result type is
    /// ty*. `count` scales the allocation; `count_ty` is its integer type
    /// (counts narrower than 64 bits are sign-extended by consumers).
    Alloca {
        dest: Value,
        ty: IrType,
        count: Option<Operand>,
        count_ty: IrType,
    },

    /// %dest = load ty, ptr. `ptr` has type ty*.
    Load { dest: Value, ptr: Operand, ty: IrType },

    /// store val, ptr. `val` has type ty; `ptr` has type ty*.
    Store { val: Operand, ptr: Operand, ty: IrType },

    /// %dest = gep base, indices. `base` has type base_ty*; the result
    /// referent follows aggregate indexing from `base_ty`.
    Gep {
        dest: Value,
        base: Operand,
        base_ty: IrType,
        indices: Vec<Operand>,
    },

    /// %dest = cast op src. Bitcasts between pointer types are the one
    /// cast kind the instrumentation pass cares about.
    Cast {
        dest: Value,
        op: CastOp,
        src: Operand,
        from_ty: IrType,
        to_ty: IrType,
    },

    /// %dest = select cond, true_val, false_val (both of type ty).
    Select {
        dest: Value,
        cond: Operand,
        true_val: Operand,
        false_val: Operand,
        ty: IrType,
    },

    /// SSA phi node: merges values of type ty from predecessor blocks.
    Phi {
        dest: Value,
        ty: IrType,
        incoming: Vec<(Operand, BlockId)>,
    },

    /// Function call: %dest = call callee(args...). `arg_types` is
    /// parallel to `args`.
    Call {
        dest: Option<Value>,
        callee: Callee,
        args: Vec<Operand>,
        arg_types: Vec<IrType>,
        return_type: IrType,
        is_variadic: bool,
    },

    /// Binary operation: %dest = op lhs, rhs.
    BinOp {
        dest: Value,
        op: IrBinOp,
        lhs: Operand,
        rhs: Operand,
        ty: IrType,
    },

    /// Comparison: %dest = cmp op lhs, rhs. Produces i1.
    Cmp {
        dest: Value,
        op: IrCmpOp,
        lhs: Operand,
        rhs: Operand,
        ty: IrType,
    },
}

impl Instruction {
    /// Get the destination value defined by this instruction, if any.
    pub fn dest(&self) -> Option<Value> {
        match self {
            Instruction::Alloca { dest, .. }
            | Instruction::Load { dest, .. }
            | Instruction::Gep { dest, .. }
            | Instruction::Cast { dest, .. }
            | Instruction::Select { dest, .. }
            | Instruction::Phi { dest, .. }
            | Instruction::BinOp { dest, .. }
            | Instruction::Cmp { dest, .. } => Some(*dest),
            Instruction::Call { dest, .. } => *dest,
            Instruction::Store { .. } => None,
        }
    }

    /// The type of the value this instruction defines, if any.
    /// For GEPs the result type follows aggregate indexing and may not be
    /// derivable (dynamic struct index); that yields `None`.
    pub fn result_type(&self) -> Option<IrType> {
        match self {
            Instruction::Alloca { ty, .. } => Some(ty.clone().ptr_to()),
            Instruction::Load { ty, .. } => Some(ty.clone()),
            Instruction::Gep { base_ty, indices, .. } => {
                base_ty.indexed(indices).map(IrType::ptr_to)
            }
            Instruction::Cast { to_ty, .. } => Some(to_ty.clone()),
            Instruction::Select { ty, .. } | Instruction::Phi { ty, .. } => Some(ty.clone()),
            Instruction::Call { dest, return_type, .. } => {
                dest.map(|_| return_type.clone())
            }
            Instruction::BinOp { ty, .. } => Some(ty.clone()),
            Instruction::Cmp { .. } => Some(IrType::I1),
            Instruction::Store { .. } => None,
        }
    }
}

/// Block terminator.
#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    /// Return from function.
    Return(Option<Operand>),

    /// Unconditional branch.
    Branch(BlockId),

    /// Conditional branch.
    CondBranch {
        cond: Operand,
        true_label: BlockId,
        false_label: BlockId,
    },

    /// Unreachable (e.g. after a noreturn call).
    Unreachable,
}

/// A basic block in the CFG.
#[derive(Debug, Clone, PartialEq)]
pub struct BasicBlock {
    pub label: BlockId,
    pub instructions: Vec<Instruction>,
    pub terminator: Terminator,
}

impl BasicBlock {
    pub fn new(label: BlockId, terminator: Terminator) -> Self {
        BasicBlock { label, instructions: Vec::new(), terminator }
    }
}
