use std::fmt::{self, Display};
use std::sync::Arc;

use slotmap::new_key_type;
use strum::{Display as OpDisplay, EnumDiscriminants};

use crate::index::ClassId;
use crate::util::float::F64;
use crate::value::Val;

new_key_type! {
    pub struct BlockId;
}

/// A function-local variable slot. Dense, producer-assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(pub u32);

impl LocalId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loc{}", self.0)
    }
}

/// A function-local iterator slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IterId(pub u32);

impl IterId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One of the function's class-reference slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClsRefSlot(pub u32);

impl ClsRefSlot {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsTypeOp {
    Null,
    Bool,
    Int,
    Dbl,
    Str,
    Arr,
    Obj,
    Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetOpKind {
    PlusEq,
    MinusEq,
    MulEq,
    DivEq,
    ModEq,
    PowEq,
    ConcatEq,
    AndEq,
    OrEq,
    XorEq,
    ShlEq,
    ShrEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncDecOp {
    PreInc,
    PostInc,
    PreDec,
    PostDec,
}

impl IncDecOp {
    pub fn is_pre(self) -> bool {
        matches!(self, Self::PreInc | Self::PreDec)
    }

    pub fn is_inc(self) -> bool {
        matches!(self, Self::PreInc | Self::PostInc)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BareThisOp {
    Notice,
    NoNotice,
    NeverNull,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalKind {
    Parse,
    Runtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjMethodOp {
    NullThrows,
    NullSafe,
}

/// The instruction set. Operand-stack convention: operands are popped with
/// the topmost first, results pushed in listed order.
#[derive(Debug, Clone, PartialEq, OpDisplay, EnumDiscriminants)]
#[strum_discriminants(name(OpTag), derive(Hash))]
pub enum Op {
    Nop,
    Dup,
    PopC,
    PopV,
    PopU,

    Null,
    NullUninit,
    True,
    False,
    Int(i64),
    Double(F64),
    Str(Arc<str>),
    Arr(Val),
    NewList(u32),
    NewDict(u32),
    AddElemC,
    AddNewElemC,

    Cns(Arc<str>),
    ClsCns(ClsRefSlot, Arc<str>),
    ClsCnsD(Arc<str>, Arc<str>),

    Concat,
    ConcatN(u32),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    BitNot,
    Not,
    Xor,

    Same,
    NSame,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Cmp,

    CastBool,
    CastInt,
    CastDouble,
    CastString,
    CastList,
    CastDict,

    InstanceOf,
    InstanceOfD(Arc<str>),
    IsTypeC(IsTypeOp),
    IsTypeL(LocalId, IsTypeOp),
    IsUninit,

    Print,
    Exit,
    Fatal(FatalKind),

    JmpZ(BlockId),
    JmpNZ(BlockId),
    Switch(Box<[BlockId]>),
    SSwitch {
        cases: Box<[(Arc<str>, BlockId)]>,
        default: BlockId,
    },
    RetC,
    Throw,
    Catch,

    CGetL(LocalId),
    CGetQuietL(LocalId),
    CUGetL(LocalId),
    CGetL2(LocalId),
    PushL(LocalId),
    SetL(LocalId),
    PopL(LocalId),
    SetOpL(LocalId, SetOpKind),
    IncDecL(LocalId, IncDecOp),
    UnsetL(LocalId),
    IssetL(LocalId),
    EmptyL(LocalId),
    VGetL(LocalId),
    BindL(LocalId),
    Box,
    Unbox,

    This,
    BareThis(BareThisOp),
    CheckThis,

    StaticLocCheck(LocalId, Arc<str>),
    StaticLocDef(LocalId, Arc<str>),
    StaticLocInit(LocalId, Arc<str>),

    ClsRefGetC(ClsRefSlot),
    ClsRefGetL(LocalId, ClsRefSlot),
    DiscardClsRef(ClsRefSlot),
    ClsRefName(ClsRefSlot),
    CGetS(ClsRefSlot),
    SetS(ClsRefSlot),

    CGetG,
    SetG,
    IssetG,

    AKExists,
    Idx,

    FPushFunc(u32),
    FPushFuncD(u32, Arc<str>),
    FPushFuncU(u32, Arc<str>, Arc<str>),
    FPushObjMethodD(u32, Arc<str>, ObjMethodOp),
    FPushClsMethodD(u32, Arc<str>, Arc<str>),
    FPushCtor(u32, ClsRefSlot),
    FPushCtorD(u32, Arc<str>),
    FCall(u32),

    IterInit {
        iter: IterId,
        target: BlockId,
        val: LocalId,
    },
    IterInitK {
        iter: IterId,
        target: BlockId,
        val: LocalId,
        key: LocalId,
    },
    IterNext {
        iter: IterId,
        target: BlockId,
        val: LocalId,
    },
    IterNextK {
        iter: IterId,
        target: BlockId,
        val: LocalId,
        key: LocalId,
    },
    IterFree(IterId),
    IterBreak {
        target: BlockId,
        iters: Box<[IterId]>,
    },
}

impl Op {
    /// How many values the instruction pushes.
    pub fn num_push(&self) -> usize {
        match self {
            Op::Nop
            | Op::PopC
            | Op::PopV
            | Op::PopU
            | Op::PopL(_)
            | Op::UnsetL(_)
            | Op::Fatal(_)
            | Op::JmpZ(_)
            | Op::JmpNZ(_)
            | Op::Switch(_)
            | Op::SSwitch { .. }
            | Op::RetC
            | Op::Throw
            | Op::CheckThis
            | Op::StaticLocDef(..)
            | Op::StaticLocInit(..)
            | Op::DiscardClsRef(_)
            | Op::ClsRefGetC(_)
            | Op::ClsRefGetL(..)
            | Op::FPushFunc(_)
            | Op::FPushFuncD(..)
            | Op::FPushFuncU(..)
            | Op::FPushObjMethodD(..)
            | Op::FPushClsMethodD(..)
            | Op::IterInit { .. }
            | Op::IterInitK { .. }
            | Op::IterNext { .. }
            | Op::IterNextK { .. }
            | Op::IterFree(_)
            | Op::IterBreak { .. } => 0,

            Op::Dup | Op::CGetL2(_) => 2,

            _ => 1,
        }
    }

    /// Whether control never falls through to the next instruction.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Op::RetC
                | Op::Throw
                | Op::Fatal(_)
                | Op::Switch(_)
                | Op::SSwitch { .. }
                | Op::IterBreak { .. }
        )
    }
}

/// A basic block as handed over by the producer: the instruction list, the
/// static fallthrough successor, and the exceptional successors reached
/// when any instruction in the block raises.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub instrs: Vec<Op>,
    pub fallthrough: Option<BlockId>,
    pub throw_exits: Vec<BlockId>,
}

/// Static facts about the enclosing function that transfer functions need.
#[derive(Debug, Clone, Default)]
pub struct FuncMeta {
    pub num_locals: u32,
    pub num_iters: u32,
    pub num_cls_ref_slots: u32,
    /// The enclosing class, when the function is a method.
    pub cls: Option<ClassId>,
}
