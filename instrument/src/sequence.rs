// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use il_module::debuginfo::SequencePoint;
use il_module::instruction::Instruction;
use il_module::opcode::OpCode;

/// Instructions `[start, end)` attributed to one visible sequence point.
#[derive(Clone, Debug, PartialEq)]
pub struct Span {
    pub point: SequencePoint,
    pub start: usize,
    pub end: usize,
}

/// A conditional branch or `switch` with more than one distinct successor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Decision {
    pub index: usize,

    /// Distinct successor indices. The fallthrough successor comes first.
    pub successors: Vec<usize>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SegmentError {
    /// A sequence point does not start at an instruction.
    Misaligned { offset: u32 },

    /// A visible sequence point ends on a line before the one it starts on.
    InvertedLines { offset: u32 },

    /// A decision is the last instruction, so it can fall off the end.
    FallthroughPastEnd { offset: u32 },
}

/// Split a body into sequence spans.
///
/// A point closes the span opened by the previous point. Hidden points, and
/// points whose document is not `allowed`, open no span of their own.
pub fn segment<T>(
    instructions: &[Instruction<T>],
    mut points: Vec<SequencePoint>,
    allowed: impl Fn(&SequencePoint) -> bool,
) -> Result<Vec<Span>, SegmentError> {
    points.sort_by_key(|point| point.offset);

    let mut starts = Vec::with_capacity(points.len());

    for point in points {
        if !point.is_hidden() && point.end_line < point.start_line {
            return Err(SegmentError::InvertedLines {
                offset: point.offset,
            });
        }

        let index = instructions
            .binary_search_by_key(&point.offset, |instruction| instruction.offset)
            .map_err(|_| SegmentError::Misaligned {
                offset: point.offset,
            })?;

        // Several points at one offset describe one span; keep the first.
        if matches!(starts.last(), Some((last, _)) if *last == index) {
            debug!("ignoring duplicate sequence point at IL_{:04x}", point.offset);
            continue;
        }

        starts.push((index, point));
    }

    let mut spans = vec![];

    for (position, (start, point)) in starts.iter().enumerate() {
        if point.is_hidden() || !allowed(point) {
            continue;
        }

        let end = starts
            .get(position + 1)
            .map_or(instructions.len(), |(next, _)| *next);

        spans.push(Span {
            point: point.clone(),
            start: *start,
            end,
        });
    }

    Ok(spans)
}

/// Decisions within a span.
pub fn decisions(
    instructions: &[Instruction<usize>],
    span: &Span,
) -> Result<Vec<Decision>, SegmentError> {
    let mut decisions = vec![];

    for index in span.start..span.end {
        let instruction = &instructions[index];

        if !instruction.opcode.is_conditional_branch() && instruction.opcode != OpCode::Switch {
            continue;
        }

        let fallthrough = index + 1;
        if fallthrough >= instructions.len() {
            return Err(SegmentError::FallthroughPastEnd {
                offset: instruction.offset,
            });
        }

        let mut successors = vec![fallthrough];
        for target in instruction.operand.targets() {
            if !successors.contains(target) {
                successors.push(*target);
            }
        }

        if successors.len() > 1 {
            decisions.push(Decision { index, successors });
        }
    }

    Ok(decisions)
}
