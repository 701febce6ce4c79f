// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use il_module::body::ExceptionClause;
use il_module::instruction::{encode, Instruction, Operand};
use il_module::opcode::OperandKind;
use il_module::Error;

use crate::rewrite::LabelledBody;

/// Encoded code and clauses of a relinked body.
#[derive(Clone, Debug, PartialEq)]
pub struct Relinked {
    pub code: Vec<u8>,
    pub clauses: Vec<ExceptionClause>,
    pub promoted: usize,
}

/// Offset of each instruction, followed by the code size.
pub fn layout<T>(instructions: &[Instruction<T>]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut offset = 0;

    for instruction in instructions {
        offsets.push(offset);
        offset += instruction.size();
    }

    offsets.push(offset);
    offsets
}

/// Assign final offsets and encode.
///
/// Short branches whose displacement no longer fits in a byte are promoted
/// to their long form. Promotion only grows the code, so this converges.
pub fn relink(body: LabelledBody) -> Result<Relinked, Error> {
    let LabelledBody {
        mut instructions,
        clauses,
    } = body;

    let mut promoted = 0;

    let offsets = loop {
        let offsets = layout(&instructions);
        let mut changed = false;

        for (index, instruction) in instructions.iter_mut().enumerate() {
            if instruction.opcode.operand_kind() != OperandKind::ShortBranchTarget {
                continue;
            }

            let Operand::Target(target) = instruction.operand else {
                continue;
            };

            let target_offset = *offsets
                .get(target)
                .ok_or(Error::TargetOutOfRange { offset: offsets[index] })?;
            let next = offsets[index] + instruction.size();
            let displacement = i64::from(target_offset) - i64::from(next);

            if i8::try_from(displacement).is_err() {
                let long = instruction
                    .opcode
                    .long_form()
                    .ok_or(Error::ShortBranchOverflow {
                        offset: offsets[index],
                        target: target_offset,
                    })?;

                instruction.opcode = long;
                promoted += 1;
                changed = true;
            }
        }

        if !changed {
            break offsets;
        }
    };

    let mut absolute = Vec::with_capacity(instructions.len());

    for (index, instruction) in instructions.into_iter().enumerate() {
        let offset = offsets[index];

        let mut out_of_range = false;
        let mut instruction = instruction.map_targets(|target| match offsets.get(target) {
            Some(offset) => *offset,
            None => {
                out_of_range = true;
                0
            }
        });

        if out_of_range {
            return Err(Error::TargetOutOfRange { offset });
        }

        instruction.offset = offset;
        absolute.push(instruction);
    }

    let code = encode(&absolute)?;

    let mut relinked_clauses = Vec::with_capacity(clauses.len());
    for clause in clauses {
        let start = offsets
            .get(clause.try_start)
            .copied()
            .ok_or_else(|| Error::Section("clause starts outside the method".into()))?;

        let mut out_of_range = false;
        let clause = clause.map(|index| match offsets.get(index) {
            Some(offset) => *offset,
            None => {
                out_of_range = true;
                0
            }
        });

        if out_of_range {
            return Err(Error::Section(format!(
                "clause at IL_{start:04x} ends outside the method"
            )));
        }

        relinked_clauses.push(clause);
    }

    Ok(Relinked {
        code,
        clauses: relinked_clauses,
        promoted,
    })
}

#[cfg(test)]
mod tests {
    use il_module::instruction::decode;
    use il_module::opcode::OpCode;
    use pretty_assertions::assert_eq;

    use super::*;

    fn instruction(opcode: OpCode, operand: Operand<usize>) -> Instruction<usize> {
        Instruction::new(opcode, operand)
    }

    #[test]
    fn test_short_branch_promoted() -> Result<(), Error> {
        // br.s over 200 nops.
        let mut instructions = vec![instruction(OpCode::BrS, Operand::Target(201))];
        instructions.extend((0..200).map(|_| instruction(OpCode::Nop, Operand::None)));
        instructions.push(instruction(OpCode::Ret, Operand::None));

        let relinked = relink(LabelledBody {
            instructions,
            clauses: vec![],
        })?;

        assert_eq!(relinked.promoted, 1);

        let decoded = decode(&relinked.code)?;
        assert_eq!(decoded[0].opcode, OpCode::Br);
        assert_eq!(decoded[0].operand, Operand::Target(205));
        assert_eq!(decoded[201].offset, 205);

        Ok(())
    }

    #[test]
    fn test_short_branch_kept() -> Result<(), Error> {
        let instructions = vec![
            instruction(OpCode::BrS, Operand::Target(2)),
            instruction(OpCode::Nop, Operand::None),
            instruction(OpCode::Ret, Operand::None),
        ];

        let relinked = relink(LabelledBody {
            instructions,
            clauses: vec![],
        })?;

        assert_eq!(relinked.promoted, 0);
        assert_eq!(relinked.code, vec![0x2b, 0x01, 0x00, 0x2a]);

        Ok(())
    }

    #[test]
    fn test_promotion_cascades() -> Result<(), Error> {
        // The backward branch only overflows once the forward one grows.
        let mut instructions = vec![
            instruction(OpCode::Nop, Operand::None),
            instruction(OpCode::BrS, Operand::Target(135)),
        ];
        instructions.extend((0..122).map(|_| instruction(OpCode::Nop, Operand::None)));
        instructions.push(instruction(OpCode::BrS, Operand::Target(0)));
        instructions.extend((0..10).map(|_| instruction(OpCode::Nop, Operand::None)));
        instructions.push(instruction(OpCode::Ret, Operand::None));

        let relinked = relink(LabelledBody {
            instructions,
            clauses: vec![],
        })?;

        assert_eq!(relinked.promoted, 2);

        let decoded = decode(&relinked.code)?;
        assert_eq!(decoded[1].opcode, OpCode::Br);
        assert_eq!(decoded[124].opcode, OpCode::Br);
        assert_eq!(decoded[124].operand, Operand::Target(0));

        Ok(())
    }

    #[test]
    fn test_clauses_relinked() -> Result<(), Error> {
        let instructions = vec![
            instruction(OpCode::Nop, Operand::None),
            instruction(OpCode::LeaveS, Operand::Target(3)),
            instruction(OpCode::Endfinally, Operand::None),
            instruction(OpCode::Ret, Operand::None),
        ];

        let clauses = vec![ExceptionClause {
            kind: il_module::body::ClauseKind::Finally,
            try_start: 0,
            try_end: 2,
            handler_start: 2,
            handler_end: 3,
        }];

        let relinked = relink(LabelledBody {
            instructions,
            clauses,
        })?;

        let clause = relinked.clauses[0];
        assert_eq!((clause.try_start, clause.try_end), (0, 3));
        assert_eq!((clause.handler_start, clause.handler_end), (3, 4));

        Ok(())
    }
}
