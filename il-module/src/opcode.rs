// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

/// Kind of inline operand that follows an opcode in the instruction stream.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandKind {
    None,
    ShortBranchTarget,
    BranchTarget,
    Switch,
    ShortI,
    I,
    I8,
    ShortR,
    R,
    ShortVar,
    Var,
    Token,
}

impl OperandKind {
    /// Encoded operand size in bytes.
    ///
    /// Returns `None` for `switch`, whose size depends on its jump table.
    pub fn size(&self) -> Option<u32> {
        use OperandKind::*;

        let size = match self {
            None => 0,
            ShortBranchTarget | ShortI | ShortVar => 1,
            Var => 2,
            BranchTarget | I | ShortR | Token => 4,
            I8 | R => 8,
            Switch => return Option::None,
        };

        Some(size)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FlowControl {
    Next,
    Break,
    Branch,
    CondBranch,
    Call,
    Return,
    Throw,
    Meta,
}

// Marks a stack behaviour that depends on a call signature.
const VAR: u8 = u8::MAX;

macro_rules! opcodes {
    ($($variant:ident = $value:literal, $name:literal, $operand:ident, $pop:expr, $push:expr, $flow:ident;)*) => {
        #[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
        pub enum OpCode {
            $($variant,)*
        }

        impl OpCode {
            pub fn from_value(value: u16) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)*
                    _ => None,
                }
            }

            /// Encoded value. Two-byte opcodes carry the `0xfe` prefix in the high byte.
            pub fn value(self) -> u16 {
                match self {
                    $(Self::$variant => $value,)*
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            pub fn operand_kind(self) -> OperandKind {
                match self {
                    $(Self::$variant => OperandKind::$operand,)*
                }
            }

            pub fn flow_control(self) -> FlowControl {
                match self {
                    $(Self::$variant => FlowControl::$flow,)*
                }
            }

            fn stack_behaviour(self) -> (u8, u8) {
                match self {
                    $(Self::$variant => ($pop, $push),)*
                }
            }
        }
    };
}

opcodes! {
    Nop = 0x00, "nop", None, 0, 0, Next;
    Break = 0x01, "break", None, 0, 0, Break;
    Ldarg0 = 0x02, "ldarg.0", None, 0, 1, Next;
    Ldarg1 = 0x03, "ldarg.1", None, 0, 1, Next;
    Ldarg2 = 0x04, "ldarg.2", None, 0, 1, Next;
    Ldarg3 = 0x05, "ldarg.3", None, 0, 1, Next;
    Ldloc0 = 0x06, "ldloc.0", None, 0, 1, Next;
    Ldloc1 = 0x07, "ldloc.1", None, 0, 1, Next;
    Ldloc2 = 0x08, "ldloc.2", None, 0, 1, Next;
    Ldloc3 = 0x09, "ldloc.3", None, 0, 1, Next;
    Stloc0 = 0x0a, "stloc.0", None, 1, 0, Next;
    Stloc1 = 0x0b, "stloc.1", None, 1, 0, Next;
    Stloc2 = 0x0c, "stloc.2", None, 1, 0, Next;
    Stloc3 = 0x0d, "stloc.3", None, 1, 0, Next;
    LdargS = 0x0e, "ldarg.s", ShortVar, 0, 1, Next;
    LdargaS = 0x0f, "ldarga.s", ShortVar, 0, 1, Next;
    StargS = 0x10, "starg.s", ShortVar, 1, 0, Next;
    LdlocS = 0x11, "ldloc.s", ShortVar, 0, 1, Next;
    LdlocaS = 0x12, "ldloca.s", ShortVar, 0, 1, Next;
    StlocS = 0x13, "stloc.s", ShortVar, 1, 0, Next;
    Ldnull = 0x14, "ldnull", None, 0, 1, Next;
    LdcI4M1 = 0x15, "ldc.i4.m1", None, 0, 1, Next;
    LdcI40 = 0x16, "ldc.i4.0", None, 0, 1, Next;
    LdcI41 = 0x17, "ldc.i4.1", None, 0, 1, Next;
    LdcI42 = 0x18, "ldc.i4.2", None, 0, 1, Next;
    LdcI43 = 0x19, "ldc.i4.3", None, 0, 1, Next;
    LdcI44 = 0x1a, "ldc.i4.4", None, 0, 1, Next;
    LdcI45 = 0x1b, "ldc.i4.5", None, 0, 1, Next;
    LdcI46 = 0x1c, "ldc.i4.6", None, 0, 1, Next;
    LdcI47 = 0x1d, "ldc.i4.7", None, 0, 1, Next;
    LdcI48 = 0x1e, "ldc.i4.8", None, 0, 1, Next;
    LdcI4S = 0x1f, "ldc.i4.s", ShortI, 0, 1, Next;
    LdcI4 = 0x20, "ldc.i4", I, 0, 1, Next;
    LdcI8 = 0x21, "ldc.i8", I8, 0, 1, Next;
    LdcR4 = 0x22, "ldc.r4", ShortR, 0, 1, Next;
    LdcR8 = 0x23, "ldc.r8", R, 0, 1, Next;
    Dup = 0x25, "dup", None, 1, 2, Next;
    Pop = 0x26, "pop", None, 1, 0, Next;
    Jmp = 0x27, "jmp", Token, 0, 0, Call;
    Call = 0x28, "call", Token, VAR, VAR, Call;
    Calli = 0x29, "calli", Token, VAR, VAR, Call;
    Ret = 0x2a, "ret", None, VAR, 0, Return;
    BrS = 0x2b, "br.s", ShortBranchTarget, 0, 0, Branch;
    BrfalseS = 0x2c, "brfalse.s", ShortBranchTarget, 1, 0, CondBranch;
    BrtrueS = 0x2d, "brtrue.s", ShortBranchTarget, 1, 0, CondBranch;
    BeqS = 0x2e, "beq.s", ShortBranchTarget, 2, 0, CondBranch;
    BgeS = 0x2f, "bge.s", ShortBranchTarget, 2, 0, CondBranch;
    BgtS = 0x30, "bgt.s", ShortBranchTarget, 2, 0, CondBranch;
    BleS = 0x31, "ble.s", ShortBranchTarget, 2, 0, CondBranch;
    BltS = 0x32, "blt.s", ShortBranchTarget, 2, 0, CondBranch;
    BneUnS = 0x33, "bne.un.s", ShortBranchTarget, 2, 0, CondBranch;
    BgeUnS = 0x34, "bge.un.s", ShortBranchTarget, 2, 0, CondBranch;
    BgtUnS = 0x35, "bgt.un.s", ShortBranchTarget, 2, 0, CondBranch;
    BleUnS = 0x36, "ble.un.s", ShortBranchTarget, 2, 0, CondBranch;
    BltUnS = 0x37, "blt.un.s", ShortBranchTarget, 2, 0, CondBranch;
    Br = 0x38, "br", BranchTarget, 0, 0, Branch;
    Brfalse = 0x39, "brfalse", BranchTarget, 1, 0, CondBranch;
    Brtrue = 0x3a, "brtrue", BranchTarget, 1, 0, CondBranch;
    Beq = 0x3b, "beq", BranchTarget, 2, 0, CondBranch;
    Bge = 0x3c, "bge", BranchTarget, 2, 0, CondBranch;
    Bgt = 0x3d, "bgt", BranchTarget, 2, 0, CondBranch;
    Ble = 0x3e, "ble", BranchTarget, 2, 0, CondBranch;
    Blt = 0x3f, "blt", BranchTarget, 2, 0, CondBranch;
    BneUn = 0x40, "bne.un", BranchTarget, 2, 0, CondBranch;
    BgeUn = 0x41, "bge.un", BranchTarget, 2, 0, CondBranch;
    BgtUn = 0x42, "bgt.un", BranchTarget, 2, 0, CondBranch;
    BleUn = 0x43, "ble.un", BranchTarget, 2, 0, CondBranch;
    BltUn = 0x44, "blt.un", BranchTarget, 2, 0, CondBranch;
    Switch = 0x45, "switch", Switch, 1, 0, CondBranch;
    LdindI1 = 0x46, "ldind.i1", None, 1, 1, Next;
    LdindU1 = 0x47, "ldind.u1", None, 1, 1, Next;
    LdindI2 = 0x48, "ldind.i2", None, 1, 1, Next;
    LdindU2 = 0x49, "ldind.u2", None, 1, 1, Next;
    LdindI4 = 0x4a, "ldind.i4", None, 1, 1, Next;
    LdindU4 = 0x4b, "ldind.u4", None, 1, 1, Next;
    LdindI8 = 0x4c, "ldind.i8", None, 1, 1, Next;
    LdindI = 0x4d, "ldind.i", None, 1, 1, Next;
    LdindR4 = 0x4e, "ldind.r4", None, 1, 1, Next;
    LdindR8 = 0x4f, "ldind.r8", None, 1, 1, Next;
    LdindRef = 0x50, "ldind.ref", None, 1, 1, Next;
    StindRef = 0x51, "stind.ref", None, 2, 0, Next;
    StindI1 = 0x52, "stind.i1", None, 2, 0, Next;
    StindI2 = 0x53, "stind.i2", None, 2, 0, Next;
    StindI4 = 0x54, "stind.i4", None, 2, 0, Next;
    StindI8 = 0x55, "stind.i8", None, 2, 0, Next;
    StindR4 = 0x56, "stind.r4", None, 2, 0, Next;
    StindR8 = 0x57, "stind.r8", None, 2, 0, Next;
    Add = 0x58, "add", None, 2, 1, Next;
    Sub = 0x59, "sub", None, 2, 1, Next;
    Mul = 0x5a, "mul", None, 2, 1, Next;
    Div = 0x5b, "div", None, 2, 1, Next;
    DivUn = 0x5c, "div.un", None, 2, 1, Next;
    Rem = 0x5d, "rem", None, 2, 1, Next;
    RemUn = 0x5e, "rem.un", None, 2, 1, Next;
    And = 0x5f, "and", None, 2, 1, Next;
    Or = 0x60, "or", None, 2, 1, Next;
    Xor = 0x61, "xor", None, 2, 1, Next;
    Shl = 0x62, "shl", None, 2, 1, Next;
    Shr = 0x63, "shr", None, 2, 1, Next;
    ShrUn = 0x64, "shr.un", None, 2, 1, Next;
    Neg = 0x65, "neg", None, 1, 1, Next;
    Not = 0x66, "not", None, 1, 1, Next;
    ConvI1 = 0x67, "conv.i1", None, 1, 1, Next;
    ConvI2 = 0x68, "conv.i2", None, 1, 1, Next;
    ConvI4 = 0x69, "conv.i4", None, 1, 1, Next;
    ConvI8 = 0x6a, "conv.i8", None, 1, 1, Next;
    ConvR4 = 0x6b, "conv.r4", None, 1, 1, Next;
    ConvR8 = 0x6c, "conv.r8", None, 1, 1, Next;
    ConvU4 = 0x6d, "conv.u4", None, 1, 1, Next;
    ConvU8 = 0x6e, "conv.u8", None, 1, 1, Next;
    Callvirt = 0x6f, "callvirt", Token, VAR, VAR, Call;
    Cpobj = 0x70, "cpobj", Token, 2, 0, Next;
    Ldobj = 0x71, "ldobj", Token, 1, 1, Next;
    Ldstr = 0x72, "ldstr", Token, 0, 1, Next;
    Newobj = 0x73, "newobj", Token, VAR, 1, Call;
    Castclass = 0x74, "castclass", Token, 1, 1, Next;
    Isinst = 0x75, "isinst", Token, 1, 1, Next;
    ConvRUn = 0x76, "conv.r.un", None, 1, 1, Next;
    Unbox = 0x79, "unbox", Token, 1, 1, Next;
    Throw = 0x7a, "throw", None, 1, 0, Throw;
    Ldfld = 0x7b, "ldfld", Token, 1, 1, Next;
    Ldflda = 0x7c, "ldflda", Token, 1, 1, Next;
    Stfld = 0x7d, "stfld", Token, 2, 0, Next;
    Ldsfld = 0x7e, "ldsfld", Token, 0, 1, Next;
    Ldsflda = 0x7f, "ldsflda", Token, 0, 1, Next;
    Stsfld = 0x80, "stsfld", Token, 1, 0, Next;
    Stobj = 0x81, "stobj", Token, 2, 0, Next;
    ConvOvfI1Un = 0x82, "conv.ovf.i1.un", None, 1, 1, Next;
    ConvOvfI2Un = 0x83, "conv.ovf.i2.un", None, 1, 1, Next;
    ConvOvfI4Un = 0x84, "conv.ovf.i4.un", None, 1, 1, Next;
    ConvOvfI8Un = 0x85, "conv.ovf.i8.un", None, 1, 1, Next;
    ConvOvfU1Un = 0x86, "conv.ovf.u1.un", None, 1, 1, Next;
    ConvOvfU2Un = 0x87, "conv.ovf.u2.un", None, 1, 1, Next;
    ConvOvfU4Un = 0x88, "conv.ovf.u4.un", None, 1, 1, Next;
    ConvOvfU8Un = 0x89, "conv.ovf.u8.un", None, 1, 1, Next;
    ConvOvfIUn = 0x8a, "conv.ovf.i.un", None, 1, 1, Next;
    ConvOvfUUn = 0x8b, "conv.ovf.u.un", None, 1, 1, Next;
    Box = 0x8c, "box", Token, 1, 1, Next;
    Newarr = 0x8d, "newarr", Token, 1, 1, Next;
    Ldlen = 0x8e, "ldlen", None, 1, 1, Next;
    Ldelema = 0x8f, "ldelema", Token, 2, 1, Next;
    LdelemI1 = 0x90, "ldelem.i1", None, 2, 1, Next;
    LdelemU1 = 0x91, "ldelem.u1", None, 2, 1, Next;
    LdelemI2 = 0x92, "ldelem.i2", None, 2, 1, Next;
    LdelemU2 = 0x93, "ldelem.u2", None, 2, 1, Next;
    LdelemI4 = 0x94, "ldelem.i4", None, 2, 1, Next;
    LdelemU4 = 0x95, "ldelem.u4", None, 2, 1, Next;
    LdelemI8 = 0x96, "ldelem.i8", None, 2, 1, Next;
    LdelemI = 0x97, "ldelem.i", None, 2, 1, Next;
    LdelemR4 = 0x98, "ldelem.r4", None, 2, 1, Next;
    LdelemR8 = 0x99, "ldelem.r8", None, 2, 1, Next;
    LdelemRef = 0x9a, "ldelem.ref", None, 2, 1, Next;
    StelemI = 0x9b, "stelem.i", None, 3, 0, Next;
    StelemI1 = 0x9c, "stelem.i1", None, 3, 0, Next;
    StelemI2 = 0x9d, "stelem.i2", None, 3, 0, Next;
    StelemI4 = 0x9e, "stelem.i4", None, 3, 0, Next;
    StelemI8 = 0x9f, "stelem.i8", None, 3, 0, Next;
    StelemR4 = 0xa0, "stelem.r4", None, 3, 0, Next;
    StelemR8 = 0xa1, "stelem.r8", None, 3, 0, Next;
    StelemRef = 0xa2, "stelem.ref", None, 3, 0, Next;
    Ldelem = 0xa3, "ldelem", Token, 2, 1, Next;
    Stelem = 0xa4, "stelem", Token, 3, 0, Next;
    UnboxAny = 0xa5, "unbox.any", Token, 1, 1, Next;
    ConvOvfI1 = 0xb3, "conv.ovf.i1", None, 1, 1, Next;
    ConvOvfU1 = 0xb4, "conv.ovf.u1", None, 1, 1, Next;
    ConvOvfI2 = 0xb5, "conv.ovf.i2", None, 1, 1, Next;
    ConvOvfU2 = 0xb6, "conv.ovf.u2", None, 1, 1, Next;
    ConvOvfI4 = 0xb7, "conv.ovf.i4", None, 1, 1, Next;
    ConvOvfU4 = 0xb8, "conv.ovf.u4", None, 1, 1, Next;
    ConvOvfI8 = 0xb9, "conv.ovf.i8", None, 1, 1, Next;
    ConvOvfU8 = 0xba, "conv.ovf.u8", None, 1, 1, Next;
    Refanyval = 0xc2, "refanyval", Token, 1, 1, Next;
    Ckfinite = 0xc3, "ckfinite", None, 1, 1, Next;
    Mkrefany = 0xc6, "mkrefany", Token, 1, 1, Next;
    Ldtoken = 0xd0, "ldtoken", Token, 0, 1, Next;
    ConvU2 = 0xd1, "conv.u2", None, 1, 1, Next;
    ConvU1 = 0xd2, "conv.u1", None, 1, 1, Next;
    ConvI = 0xd3, "conv.i", None, 1, 1, Next;
    ConvOvfI = 0xd4, "conv.ovf.i", None, 1, 1, Next;
    ConvOvfU = 0xd5, "conv.ovf.u", None, 1, 1, Next;
    AddOvf = 0xd6, "add.ovf", None, 2, 1, Next;
    AddOvfUn = 0xd7, "add.ovf.un", None, 2, 1, Next;
    MulOvf = 0xd8, "mul.ovf", None, 2, 1, Next;
    MulOvfUn = 0xd9, "mul.ovf.un", None, 2, 1, Next;
    SubOvf = 0xda, "sub.ovf", None, 2, 1, Next;
    SubOvfUn = 0xdb, "sub.ovf.un", None, 2, 1, Next;
    Endfinally = 0xdc, "endfinally", None, 0, 0, Return;
    Leave = 0xdd, "leave", BranchTarget, 0, 0, Branch;
    LeaveS = 0xde, "leave.s", ShortBranchTarget, 0, 0, Branch;
    StindI = 0xdf, "stind.i", None, 2, 0, Next;
    ConvU = 0xe0, "conv.u", None, 1, 1, Next;
    Arglist = 0xfe00, "arglist", None, 0, 1, Next;
    Ceq = 0xfe01, "ceq", None, 2, 1, Next;
    Cgt = 0xfe02, "cgt", None, 2, 1, Next;
    CgtUn = 0xfe03, "cgt.un", None, 2, 1, Next;
    Clt = 0xfe04, "clt", None, 2, 1, Next;
    CltUn = 0xfe05, "clt.un", None, 2, 1, Next;
    Ldftn = 0xfe06, "ldftn", Token, 0, 1, Next;
    Ldvirtftn = 0xfe07, "ldvirtftn", Token, 1, 1, Next;
    Ldarg = 0xfe09, "ldarg", Var, 0, 1, Next;
    Ldarga = 0xfe0a, "ldarga", Var, 0, 1, Next;
    Starg = 0xfe0b, "starg", Var, 1, 0, Next;
    Ldloc = 0xfe0c, "ldloc", Var, 0, 1, Next;
    Ldloca = 0xfe0d, "ldloca", Var, 0, 1, Next;
    Stloc = 0xfe0e, "stloc", Var, 1, 0, Next;
    Localloc = 0xfe0f, "localloc", None, 1, 1, Next;
    Endfilter = 0xfe11, "endfilter", None, 1, 0, Return;
    Unaligned = 0xfe12, "unaligned.", ShortI, 0, 0, Meta;
    Volatile = 0xfe13, "volatile.", None, 0, 0, Meta;
    Tail = 0xfe14, "tail.", None, 0, 0, Meta;
    Initobj = 0xfe15, "initobj", Token, 1, 0, Next;
    Constrained = 0xfe16, "constrained.", Token, 0, 0, Meta;
    Cpblk = 0xfe17, "cpblk", None, 3, 0, Next;
    Initblk = 0xfe18, "initblk", None, 3, 0, Next;
    No = 0xfe19, "no.", ShortI, 0, 0, Meta;
    Rethrow = 0xfe1a, "rethrow", None, 0, 0, Throw;
    Sizeof = 0xfe1c, "sizeof", Token, 0, 1, Next;
    Refanytype = 0xfe1d, "refanytype", None, 1, 1, Next;
    Readonly = 0xfe1e, "readonly.", None, 0, 0, Meta;
}

impl OpCode {
    /// Size of the encoded opcode in bytes.
    pub fn size(self) -> u32 {
        if self.value() > 0xff {
            2
        } else {
            1
        }
    }

    /// Number of stack slots popped, or `None` if it depends on a signature.
    pub fn stack_pop(self) -> Option<u8> {
        let (pop, _) = self.stack_behaviour();
        (pop != VAR).then_some(pop)
    }

    /// Number of stack slots pushed, or `None` if it depends on a signature.
    pub fn stack_push(self) -> Option<u8> {
        let (_, push) = self.stack_behaviour();
        (push != VAR).then_some(push)
    }

    pub fn is_conditional_branch(self) -> bool {
        self.flow_control() == FlowControl::CondBranch && self != Self::Switch
    }

    pub fn is_branch(self) -> bool {
        matches!(
            self.operand_kind(),
            OperandKind::BranchTarget | OperandKind::ShortBranchTarget | OperandKind::Switch
        )
    }

    /// `leave` and `endfinally` empty the evaluation stack.
    pub fn clears_stack(self) -> bool {
        matches!(self, Self::Leave | Self::LeaveS | Self::Endfinally)
    }

    /// Returns `true` if control can reach the next instruction in sequence.
    pub fn falls_through(self) -> bool {
        use FlowControl::*;

        match self.flow_control() {
            Branch | Return | Throw => false,
            _ => self != Self::Jmp,
        }
    }

    /// The 1-byte displacement variant of a long branch.
    pub fn short_form(self) -> Option<Self> {
        use OpCode::*;

        let short = match self {
            Br => BrS,
            Brfalse => BrfalseS,
            Brtrue => BrtrueS,
            Beq => BeqS,
            Bge => BgeS,
            Bgt => BgtS,
            Ble => BleS,
            Blt => BltS,
            BneUn => BneUnS,
            BgeUn => BgeUnS,
            BgtUn => BgtUnS,
            BleUn => BleUnS,
            BltUn => BltUnS,
            Leave => LeaveS,
            _ => return None,
        };

        Some(short)
    }

    /// The 4-byte displacement variant of a short branch.
    pub fn long_form(self) -> Option<Self> {
        use OpCode::*;

        let long = match self {
            BrS => Br,
            BrfalseS => Brfalse,
            BrtrueS => Brtrue,
            BeqS => Beq,
            BgeS => Bge,
            BgtS => Bgt,
            BleS => Ble,
            BltS => Blt,
            BneUnS => BneUn,
            BgeUnS => BgeUn,
            BgtUnS => BgtUn,
            BleUnS => BleUn,
            BltUnS => BltUn,
            LeaveS => Leave,
            _ => return None,
        };

        Some(long)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
