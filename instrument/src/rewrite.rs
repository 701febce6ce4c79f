// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Probe insertion over index-labelled method bodies.
//!
//! Branch targets and exception clause boundaries are instruction indices
//! while a body is being rewritten. A boundary equal to the instruction count
//! means the end of the code.

use std::collections::BTreeMap;

use coverage::HitId;
use il_module::body::ExceptionClause;
use il_module::instruction::{Instruction, Operand};
use il_module::opcode::OpCode;
use il_module::Token;

/// A method body whose targets are instruction indices.
#[derive(Clone, Debug, PartialEq)]
pub struct LabelledBody {
    pub instructions: Vec<Instruction<usize>>,
    pub clauses: Vec<ExceptionClause<usize>>,
}

/// Offset that is not the start of an instruction.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NotABoundary {
    /// Instruction or clause referring to the offset.
    pub source: u32,
    pub offset: u32,
}

fn index_of(instructions: &[Instruction], offset: u32) -> Option<usize> {
    instructions
        .binary_search_by_key(&offset, |instruction| instruction.offset)
        .ok()
}

/// Replace absolute IL offsets with instruction indices.
pub fn lower(
    instructions: &[Instruction],
    clauses: &[ExceptionClause],
    code_size: u32,
) -> Result<LabelledBody, NotABoundary> {
    let boundary = |source: u32, offset: u32| -> Result<usize, NotABoundary> {
        if offset == code_size {
            return Ok(instructions.len());
        }

        index_of(instructions, offset).ok_or(NotABoundary { source, offset })
    };

    let mut lowered = Vec::with_capacity(instructions.len());

    for instruction in instructions {
        let source = instruction.offset;

        let mut error = None;
        let mapped = instruction.clone().map_targets(|target| {
            // Branching to the end of the code is never valid.
            match index_of(instructions, target) {
                Some(index) => index,
                None => {
                    error.get_or_insert(NotABoundary {
                        source,
                        offset: target,
                    });
                    0
                }
            }
        });

        if let Some(error) = error {
            return Err(error);
        }

        lowered.push(mapped);
    }

    let mut lowered_clauses = Vec::with_capacity(clauses.len());

    for clause in clauses {
        let source = clause.try_start;

        let mut error = None;
        let mapped = clause.map(|offset| match boundary(source, offset) {
            Ok(index) => index,
            Err(err) => {
                error.get_or_insert(err);
                0
            }
        });

        if let Some(error) = error {
            return Err(error);
        }

        lowered_clauses.push(mapped);
    }

    Ok(LabelledBody {
        instructions: lowered,
        clauses: lowered_clauses,
    })
}

/// Where to put probes, by original instruction index.
#[derive(Clone, Debug, Default)]
pub struct ProbePlan {
    /// Sequence probe placed before the instruction.
    pub sequences: BTreeMap<usize, HitId>,

    /// Branch probes for a decision, one per distinct successor. The first
    /// entry is the fallthrough successor.
    pub decisions: BTreeMap<usize, Vec<(usize, HitId)>>,
}

#[derive(Clone, Copy, Debug)]
enum Label {
    /// Entry point of an original instruction, including its probe.
    Original(usize),

    /// An instruction emitted during the rewrite.
    Emitted(usize),
}

fn emit_probe(out: &mut Vec<Instruction<Label>>, offset: u32, id: HitId, probe: Token) {
    out.push(Instruction {
        offset,
        opcode: OpCode::LdcI4,
        operand: Operand::Int32(id.0 as i32),
    });
    out.push(Instruction {
        offset,
        opcode: OpCode::Call,
        operand: Operand::Token(probe),
    });
}

fn emit_jump(out: &mut Vec<Instruction<Label>>, offset: u32, target: usize) {
    // Promoted to `br` by relinking if it cannot reach.
    out.push(Instruction {
        offset,
        opcode: OpCode::BrS,
        operand: Operand::Target(Label::Original(target)),
    });
}

/// Insert the probes of `plan` into `body`.
///
/// A sequence probe becomes the new entry point of its instruction: every
/// branch, switch entry and clause boundary that referred to the instruction
/// refers to the probe instead. A decision is retargeted to per-successor
/// stubs placed right after it, each recording its branch and jumping on to
/// the original successor.
pub fn insert_probes(body: &LabelledBody, plan: &ProbePlan, probe: Token) -> LabelledBody {
    let count = body.instructions.len();

    let mut out: Vec<Instruction<Label>> = Vec::with_capacity(count * 2);
    let mut entry = vec![0; count + 1];

    for (index, instruction) in body.instructions.iter().enumerate() {
        let offset = instruction.offset;
        entry[index] = out.len();

        if let Some(id) = plan.sequences.get(&index) {
            emit_probe(&mut out, offset, *id, probe);
        }

        let successors = match plan.decisions.get(&index) {
            Some(successors) if !successors.is_empty() => successors,
            _ => {
                out.push(instruction.clone().map_targets(Label::Original));
                continue;
            }
        };

        let decision = out.len();
        out.push(instruction.clone().map_targets(Label::Original));

        // [decision] [fallthrough probe] [br next] [stub]...
        let mut stubs = Vec::with_capacity(successors.len());

        for (position, (target, id)) in successors.iter().enumerate() {
            stubs.push((*target, out.len()));
            emit_probe(&mut out, offset, *id, probe);

            let next = if position == 0 { index + 1 } else { *target };
            emit_jump(&mut out, offset, next);
        }

        let retargeted = instruction.clone().map_targets(|target| {
            stubs
                .iter()
                .find(|(successor, _)| *successor == target)
                .map_or(Label::Original(target), |(_, stub)| Label::Emitted(*stub))
        });
        out[decision] = retargeted;
    }

    entry[count] = out.len();

    let resolve = |label: Label| match label {
        Label::Original(index) => entry[index],
        Label::Emitted(position) => position,
    };

    let instructions = out
        .into_iter()
        .map(|instruction| instruction.map_targets(resolve))
        .collect();

    let clauses = body
        .clauses
        .iter()
        .map(|clause| clause.map(|index| entry[index]))
        .collect();

    LabelledBody {
        instructions,
        clauses,
    }
}

#[cfg(test)]
mod tests {
    use il_module::body::ClauseKind;
    use il_module::instruction::decode;
    use pretty_assertions::assert_eq;

    use super::*;

    const PROBE: Token = Token(0x0a00_0001);

    fn opcodes(body: &LabelledBody) -> Vec<OpCode> {
        body.instructions.iter().map(|i| i.opcode).collect()
    }

    #[test]
    fn test_lower_rejects_branch_into_instruction() {
        // ldc.i4 1; br.s -4 (into the ldc.i4 operand)
        let code = [0x20, 0x01, 0x00, 0x00, 0x00, 0x2b, 0xfc];
        let instructions = decode(&code).unwrap_or_default();
        assert_eq!(instructions.len(), 2);

        let err = lower(&instructions, &[], code.len() as u32);
        assert_eq!(
            err,
            Err(NotABoundary {
                source: 5,
                offset: 3
            })
        );
    }

    #[test]
    fn test_sequence_probe_takes_over_references() {
        // 0: ldarg.0; 1: brtrue.s 4; 3: nop; 4: ret
        let code = [0x02, 0x2d, 0x01, 0x00, 0x2a];
        let instructions = decode(&code).unwrap_or_default();
        let clauses = vec![ExceptionClause {
            kind: ClauseKind::Fault,
            try_start: 3,
            try_end: 4,
            handler_start: 4,
            handler_end: 5,
        }];

        let body = lower(&instructions, &clauses, code.len() as u32).unwrap();
        assert_eq!(body.clauses[0].handler_end, 4);

        let mut plan = ProbePlan::default();
        plan.sequences.insert(3, HitId(7));
        plan.sequences.insert(2, HitId(8));

        let rewritten = insert_probes(&body, &plan, PROBE);

        use OpCode::*;
        assert_eq!(
            opcodes(&rewritten),
            vec![Ldarg0, BrtrueS, LdcI4, Call, Nop, LdcI4, Call, Ret]
        );

        // The branch now lands on the probe of `ret`.
        assert_eq!(rewritten.instructions[1].operand, Operand::Target(5));

        let clause = rewritten.clauses[0];
        assert_eq!(clause.try_start, 2);
        assert_eq!(clause.try_end, 5);
        assert_eq!(clause.handler_start, 5);
        assert_eq!(clause.handler_end, 8);
    }

    #[test]
    fn test_decision_stubs() {
        // 0: ldarg.0; 1: switch (a, b, a); 18: nop; 19: a: nop; 20: b: ret
        let mut code = vec![0x02, 0x45, 0x03, 0, 0, 0];
        for displacement in [1i32, 2, 1] {
            code.extend_from_slice(&displacement.to_le_bytes());
        }
        code.extend_from_slice(&[0x00, 0x00, 0x2a]);

        let instructions = decode(&code).unwrap_or_default();
        let body = lower(&instructions, &[], code.len() as u32).unwrap();

        let mut plan = ProbePlan::default();
        plan.decisions.insert(
            1,
            vec![(2, HitId(1)), (3, HitId(2)), (4, HitId(3))],
        );

        let rewritten = insert_probes(&body, &plan, PROBE);

        use OpCode::*;
        assert_eq!(
            opcodes(&rewritten),
            vec![
                Ldarg0, Switch, // decision
                LdcI4, Call, BrS, // fallthrough
                LdcI4, Call, BrS, // a
                LdcI4, Call, BrS, // b
                Nop, Nop, Ret,
            ]
        );

        assert_eq!(rewritten.instructions[1].operand, Operand::Switch(vec![5, 8, 5]));
        assert_eq!(rewritten.instructions[2].operand, Operand::Int32(1));
        assert_eq!(rewritten.instructions[4].operand, Operand::Target(11));
        assert_eq!(rewritten.instructions[7].operand, Operand::Target(12));
        assert_eq!(rewritten.instructions[10].operand, Operand::Target(13));
    }
}
