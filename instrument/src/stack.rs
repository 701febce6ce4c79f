// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use il_module::body::{ClauseKind, ExceptionClause};
use il_module::instruction::{Instruction, Operand};
use il_module::opcode::OpCode;
use il_module::{StackEffect, Token};

fn effect(
    instruction: &Instruction<usize>,
    call_effect: &impl Fn(Token) -> Option<StackEffect>,
) -> Option<(u32, u32)> {
    use OpCode::*;

    match instruction.opcode {
        Call | Callvirt | Newobj | Calli => {
            let Operand::Token(token) = instruction.operand else {
                return None;
            };

            let effect = call_effect(token)?;
            Some((u32::from(effect.pop), u32::from(effect.push)))
        }
        // Leaves the method, so its pop count does not matter.
        Ret | Jmp => Some((0, 0)),
        opcode => Some((
            u32::from(opcode.stack_pop()?),
            u32::from(opcode.stack_push()?),
        )),
    }
}

struct Dataflow {
    depths: Vec<Option<u32>>,
    pending: Vec<usize>,
}

impl Dataflow {
    fn visit(&mut self, index: usize, depth: u32) -> Option<()> {
        let slot = self.depths.get_mut(index)?;

        match slot {
            None => {
                *slot = Some(depth);
                self.pending.push(index);
                Some(())
            }
            Some(existing) if *existing == depth => Some(()),
            Some(_) => None,
        }
    }
}

/// Maximum evaluation stack depth of a body, by dataflow from the method
/// entry and every handler entry.
///
/// Returns `None` if the depth cannot be determined: a call has an unknown
/// signature, the stack underflows, or two paths reach an instruction with
/// different depths.
pub fn max_stack(
    instructions: &[Instruction<usize>],
    clauses: &[ExceptionClause<usize>],
    call_effect: impl Fn(Token) -> Option<StackEffect>,
) -> Option<u16> {
    if instructions.is_empty() {
        return Some(0);
    }

    let mut flow = Dataflow {
        depths: vec![None; instructions.len()],
        pending: vec![],
    };

    flow.visit(0, 0)?;

    for clause in clauses {
        // Catch and filter handlers start with the exception object.
        let handler_depth = match clause.kind {
            ClauseKind::Catch(_) => 1,
            ClauseKind::Filter(filter_start) => {
                flow.visit(filter_start, 1)?;
                1
            }
            ClauseKind::Finally | ClauseKind::Fault => 0,
        };

        flow.visit(clause.handler_start, handler_depth)?;
    }

    let mut max = 0;

    while let Some(index) = flow.pending.pop() {
        let instruction = &instructions[index];
        let depth = flow.depths[index]?;
        let (pop, push) = effect(instruction, &call_effect)?;

        let after = depth.checked_sub(pop)? + push;
        max = max.max(depth).max(after);

        let next = if instruction.opcode.clears_stack() {
            0
        } else {
            after
        };

        for target in instruction.operand.targets() {
            flow.visit(*target, next)?;
        }

        if instruction.opcode.falls_through() && index + 1 < instructions.len() {
            flow.visit(index + 1, next)?;
        }
    }

    u16::try_from(max).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRINT: Token = Token(0x0a00_0001);
    const PROBE: Token = Token(0x0a00_0002);
    const UNKNOWN: Token = Token(0x0a00_0003);

    fn effects(token: Token) -> Option<StackEffect> {
        match token {
            PRINT => Some(StackEffect::new(2, 0)),
            PROBE => Some(StackEffect::new(1, 0)),
            _ => None,
        }
    }

    fn i(opcode: OpCode, operand: Operand<usize>) -> Instruction<usize> {
        Instruction::new(opcode, operand)
    }

    #[test]
    fn test_straight_line() {
        use OpCode::*;

        let body = [
            i(Ldarg0, Operand::None),
            i(Ldarg1, Operand::None),
            i(Call, Operand::Token(PRINT)),
            i(Ret, Operand::None),
        ];

        assert_eq!(max_stack(&body, &[], effects), Some(2));
    }

    #[test]
    fn test_probe_adds_one_at_peak() {
        use OpCode::*;

        let body = [
            i(Ldarg0, Operand::None),
            i(Ldarg1, Operand::None),
            i(LdcI4, Operand::Int32(4)),
            i(Call, Operand::Token(PROBE)),
            i(Call, Operand::Token(PRINT)),
            i(Ret, Operand::None),
        ];

        assert_eq!(max_stack(&body, &[], effects), Some(3));
    }

    #[test]
    fn test_unknown_call_effect() {
        use OpCode::*;

        let body = [i(Call, Operand::Token(UNKNOWN)), i(Ret, Operand::None)];

        assert_eq!(max_stack(&body, &[], effects), None);
    }

    #[test]
    fn test_inconsistent_depths() {
        use OpCode::*;

        // One path pushes before the merge point, the other does not.
        let body = [
            i(Ldarg0, Operand::None),
            i(BrtrueS, Operand::Target(3)),
            i(LdcI41, Operand::None),
            i(Ret, Operand::None),
        ];

        assert_eq!(max_stack(&body, &[], effects), None);
    }

    #[test]
    fn test_handlers() {
        use OpCode::*;

        // try { leave 4 } catch { pop; leave 4 } ret
        let body = [
            i(LeaveS, Operand::Target(4)),
            i(Pop, Operand::None),
            i(LeaveS, Operand::Target(4)),
            i(Nop, Operand::None),
            i(Ret, Operand::None),
        ];

        let clauses = [ExceptionClause {
            kind: ClauseKind::Catch(Token(0x0100_0001)),
            try_start: 0,
            try_end: 1,
            handler_start: 1,
            handler_end: 3,
        }];

        assert_eq!(max_stack(&body, &clauses, effects), Some(1));
    }
}
