// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use scroll::ctx::TryFromCtx;
use scroll::{Endian, IOwrite, Pread, LE};

use crate::opcode::{OpCode, OperandKind};
use crate::{Error, Token};

/// Inline operand of an instruction.
///
/// Branch targets are generic so the same shape can hold absolute IL offsets
/// (`u32`, as decoded) or any other label type used while rewriting a body.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand<T = u32> {
    None,
    Int8(i8),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Var(u16),
    Token(Token),
    Target(T),
    Switch(Vec<T>),
}

impl<T> Operand<T> {
    pub fn map_targets<U>(self, mut f: impl FnMut(T) -> U) -> Operand<U> {
        use Operand::*;

        match self {
            None => None,
            Int8(v) => Int8(v),
            Int32(v) => Int32(v),
            Int64(v) => Int64(v),
            Float32(v) => Float32(v),
            Float64(v) => Float64(v),
            Var(v) => Var(v),
            Token(t) => Token(t),
            Target(t) => Target(f(t)),
            Switch(targets) => Switch(targets.into_iter().map(f).collect()),
        }
    }

    pub fn targets(&self) -> &[T] {
        match self {
            Operand::Target(target) => std::slice::from_ref(target),
            Operand::Switch(targets) => targets,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction<T = u32> {
    /// IL offset of the first opcode byte.
    pub offset: u32,
    pub opcode: OpCode,
    pub operand: Operand<T>,
}

impl<T> Instruction<T> {
    pub fn new(opcode: OpCode, operand: Operand<T>) -> Self {
        Self {
            offset: 0,
            opcode,
            operand,
        }
    }

    pub fn size(&self) -> u32 {
        encoded_size(self.opcode, &self.operand)
    }

    pub fn map_targets<U>(self, f: impl FnMut(T) -> U) -> Instruction<U> {
        Instruction {
            offset: self.offset,
            opcode: self.opcode,
            operand: self.operand.map_targets(f),
        }
    }

    /// Returns `true` if this is a direct call to `method`.
    pub fn is_call_to(&self, method: Token) -> bool
    where
        T: PartialEq,
    {
        self.opcode == OpCode::Call && self.operand == Operand::Token(method)
    }
}

pub fn encoded_size<T>(opcode: OpCode, operand: &Operand<T>) -> u32 {
    let operand_size = match (opcode.operand_kind().size(), operand) {
        (Some(size), _) => size,
        (None, Operand::Switch(targets)) => 4 + 4 * targets.len() as u32,
        (None, _) => 4,
    };

    opcode.size() + operand_size
}

fn read<'a, N>(data: &'a [u8], pos: &mut usize) -> Result<N, Error>
where
    N: TryFromCtx<'a, Endian, Error = scroll::Error>,
{
    let offset = *pos;
    data.gread_with(pos, LE)
        .map_err(|_| Error::Truncated { offset })
}

fn branch_target(offset: u32, next: usize, displacement: i64, len: usize) -> Result<u32, Error> {
    let target = next as i64 + displacement;

    if target < 0 || target >= len as i64 {
        return Err(Error::TargetOutOfRange { offset });
    }

    Ok(target as u32)
}

/// Decode an IL code stream, resolving branch displacements to absolute offsets.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, Error> {
    let mut instructions = vec![];
    let mut pos = 0;

    while pos < code.len() {
        let offset = pos as u32;

        let mut value = u16::from(read::<u8>(code, &mut pos)?);
        if value == 0xfe {
            value = 0xfe00 | u16::from(read::<u8>(code, &mut pos)?);
        }

        let opcode = OpCode::from_value(value).ok_or(Error::UnknownOpcode { offset, value })?;

        let operand = match opcode.operand_kind() {
            OperandKind::None => Operand::None,
            OperandKind::ShortBranchTarget => {
                let displacement = read::<i8>(code, &mut pos)?;
                let target = branch_target(offset, pos, displacement.into(), code.len())?;
                Operand::Target(target)
            }
            OperandKind::BranchTarget => {
                let displacement = read::<i32>(code, &mut pos)?;
                let target = branch_target(offset, pos, displacement.into(), code.len())?;
                Operand::Target(target)
            }
            OperandKind::Switch => {
                let count = read::<u32>(code, &mut pos)?;

                // Bound the table by the remaining data before allocating.
                if (count as usize).saturating_mul(4) > code.len() - pos {
                    return Err(Error::Truncated { offset: pos });
                }

                let mut displacements = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    displacements.push(read::<i32>(code, &mut pos)?);
                }

                // Displacements are relative to the end of the whole table.
                let targets = displacements
                    .into_iter()
                    .map(|d| branch_target(offset, pos, d.into(), code.len()))
                    .collect::<Result<_, _>>()?;

                Operand::Switch(targets)
            }
            OperandKind::ShortI => Operand::Int8(read(code, &mut pos)?),
            OperandKind::I => Operand::Int32(read(code, &mut pos)?),
            OperandKind::I8 => Operand::Int64(read(code, &mut pos)?),
            OperandKind::ShortR => Operand::Float32(read(code, &mut pos)?),
            OperandKind::R => Operand::Float64(read(code, &mut pos)?),
            OperandKind::ShortVar => Operand::Var(u16::from(read::<u8>(code, &mut pos)?)),
            OperandKind::Var => Operand::Var(read(code, &mut pos)?),
            OperandKind::Token => Operand::Token(Token(read(code, &mut pos)?)),
        };

        instructions.push(Instruction {
            offset,
            opcode,
            operand,
        });
    }

    Ok(instructions)
}

/// Encode instructions whose offsets already describe a contiguous layout.
pub fn encode(instructions: &[Instruction]) -> Result<Vec<u8>, Error> {
    let mut code: Vec<u8> = vec![];

    for inst in instructions {
        let offset = inst.offset;

        if code.len() as u32 != offset {
            return Err(Error::Layout { offset });
        }

        let value = inst.opcode.value();
        if value > 0xff {
            code.push(0xfe);
        }
        code.push(value as u8);

        let next = i64::from(offset + inst.size());
        let displacement = |target: u32| i64::from(target) - next;

        match (inst.opcode.operand_kind(), &inst.operand) {
            (OperandKind::None, Operand::None) => {}
            (OperandKind::ShortBranchTarget, Operand::Target(target)) => {
                let short = i8::try_from(displacement(*target)).map_err(|_| {
                    Error::ShortBranchOverflow {
                        offset,
                        target: *target,
                    }
                })?;
                code.iowrite_with(short, LE)?;
            }
            (OperandKind::BranchTarget, Operand::Target(target)) => {
                code.iowrite_with(displacement(*target) as i32, LE)?;
            }
            (OperandKind::Switch, Operand::Switch(targets)) => {
                code.iowrite_with(targets.len() as u32, LE)?;
                for target in targets {
                    code.iowrite_with(displacement(*target) as i32, LE)?;
                }
            }
            (OperandKind::ShortI, Operand::Int8(v)) => code.iowrite_with(*v, LE)?,
            (OperandKind::I, Operand::Int32(v)) => code.iowrite_with(*v, LE)?,
            (OperandKind::I8, Operand::Int64(v)) => code.iowrite_with(*v, LE)?,
            (OperandKind::ShortR, Operand::Float32(v)) => code.iowrite_with(*v, LE)?,
            (OperandKind::R, Operand::Float64(v)) => code.iowrite_with(*v, LE)?,
            (OperandKind::ShortVar, Operand::Var(v)) => {
                let v = u8::try_from(*v).map_err(|_| Error::Operand {
                    offset,
                    opcode: inst.opcode.name(),
                })?;
                code.push(v);
            }
            (OperandKind::Var, Operand::Var(v)) => code.iowrite_with(*v, LE)?,
            (OperandKind::Token, Operand::Token(t)) => code.iowrite_with(t.0, LE)?,
            _ => {
                return Err(Error::Operand {
                    offset,
                    opcode: inst.opcode.name(),
                })
            }
        }
    }

    Ok(code)
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "IL_{:04x}: {}", self.offset, self.opcode)?;

        match &self.operand {
            Operand::None => Ok(()),
            Operand::Int8(v) => write!(f, " {v}"),
            Operand::Int32(v) => write!(f, " {v}"),
            Operand::Int64(v) => write!(f, " {v}"),
            Operand::Float32(v) => write!(f, " {v}"),
            Operand::Float64(v) => write!(f, " {v}"),
            Operand::Var(v) => write!(f, " V_{v}"),
            Operand::Token(t) => write!(f, " 0x{t:x}"),
            Operand::Target(t) => write!(f, " IL_{t:04x}"),
            Operand::Switch(targets) => {
                let targets: Vec<_> = targets.iter().map(|t| format!("IL_{t:04x}")).collect();
                write!(f, " ({})", targets.join(", "))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn at(offset: u32, opcode: OpCode, operand: Operand) -> Instruction {
        Instruction {
            offset,
            opcode,
            operand,
        }
    }

    #[test]
    fn test_decode_branches() -> Result<(), Error> {
        // ldarg.0; brtrue.s +2; ldc.i4.0; ret; ldc.i4.1; ret
        let code = [0x02, 0x2d, 0x02, 0x16, 0x2a, 0x17, 0x2a];
        let decoded = decode(&code)?;

        assert_eq!(
            decoded,
            vec![
                at(0, OpCode::Ldarg0, Operand::None),
                at(1, OpCode::BrtrueS, Operand::Target(5)),
                at(3, OpCode::LdcI40, Operand::None),
                at(4, OpCode::Ret, Operand::None),
                at(5, OpCode::LdcI41, Operand::None),
                at(6, OpCode::Ret, Operand::None),
            ]
        );

        assert_eq!(encode(&decoded)?, code);

        Ok(())
    }

    #[test]
    fn test_decode_switch() -> Result<(), Error> {
        // ldarg.0; switch (+1, +0); ldc.i4.0; ret
        let mut code = vec![0x02, 0x45, 0x02, 0, 0, 0];
        code.extend_from_slice(&1i32.to_le_bytes());
        code.extend_from_slice(&0i32.to_le_bytes());
        code.extend_from_slice(&[0x16, 0x2a]);

        let decoded = decode(&code)?;
        assert_eq!(decoded[1].operand, Operand::Switch(vec![15, 14]));
        assert_eq!(decoded[1].size(), 13);
        assert_eq!(decoded[1].to_string(), "IL_0001: switch (IL_000f, IL_000e)");

        assert_eq!(encode(&decoded)?, code);

        Ok(())
    }

    #[test]
    fn test_decode_two_byte_and_operands() -> Result<(), Error> {
        // ldarg.0; ldc.i4 1000; ceq; stloc 300; ldc.i4.s -3; pop; ret
        let mut code = vec![0x02, 0x20];
        code.extend_from_slice(&1000i32.to_le_bytes());
        code.extend_from_slice(&[0xfe, 0x01, 0xfe, 0x0e]);
        code.extend_from_slice(&300u16.to_le_bytes());
        code.extend_from_slice(&[0x1f, 0xfd, 0x26, 0x2a]);

        let decoded = decode(&code)?;
        assert_eq!(decoded[1].operand, Operand::Int32(1000));
        assert_eq!(decoded[2].opcode, OpCode::Ceq);
        assert_eq!(decoded[3], at(8, OpCode::Stloc, Operand::Var(300)));
        assert_eq!(decoded[4].operand, Operand::Int8(-3));

        assert_eq!(encode(&decoded)?, code);

        Ok(())
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(
            decode(&[0x24]),
            Err(Error::UnknownOpcode { offset: 0, value: 0x24 })
        ));
        assert!(matches!(decode(&[0x20, 0x01]), Err(Error::Truncated { .. })));
        assert!(matches!(
            decode(&[0x2b, 0x7f]),
            Err(Error::TargetOutOfRange { offset: 0 })
        ));
    }

    #[test]
    fn test_encode_short_overflow() {
        let insts = vec![
            at(0, OpCode::BrS, Operand::Target(300)),
            at(2, OpCode::Ret, Operand::None),
        ];

        assert!(matches!(
            encode(&insts),
            Err(Error::ShortBranchOverflow {
                offset: 0,
                target: 300
            })
        ));
    }

    #[test]
    fn test_encode_layout_mismatch() {
        let insts = vec![
            at(0, OpCode::Nop, Operand::None),
            at(4, OpCode::Ret, Operand::None),
        ];

        assert!(matches!(encode(&insts), Err(Error::Layout { offset: 4 })));
    }
}
