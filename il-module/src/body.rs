// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use scroll::{IOwrite, Pread, LE};

use crate::{Error, Token};

const TINY_FORMAT: u8 = 0x2;
const FAT_FORMAT: u8 = 0x3;
const FORMAT_MASK: u8 = 0x3;

const FLAG_MORE_SECTS: u16 = 0x08;
const FLAG_INIT_LOCALS: u16 = 0x10;

// Fat headers are always 3 dwords.
const FAT_HEADER_DWORDS: u16 = 3;
const FAT_HEADER_SIZE: usize = 12;

const TINY_MAX_CODE_SIZE: usize = 64;
const TINY_MAX_STACK: u16 = 8;

const SECT_EH_TABLE: u8 = 0x01;
const SECT_OPT_IL_TABLE: u8 = 0x02;
const SECT_FAT_FORMAT: u8 = 0x40;
const SECT_MORE_SECTS: u8 = 0x80;

const CLAUSE_EXCEPTION: u32 = 0x0;
const CLAUSE_FILTER: u32 = 0x1;
const CLAUSE_FINALLY: u32 = 0x2;
const CLAUSE_FAULT: u32 = 0x4;

const SMALL_CLAUSE_SIZE: usize = 12;
const FAT_CLAUSE_SIZE: usize = 24;

/// Kind of an exception handling clause.
///
/// Filter clauses carry the start of their filter block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClauseKind<T = u32> {
    Catch(Token),
    Filter(T),
    Finally,
    Fault,
}

/// Protected region and its handler, as half-open `[start, end)` ranges.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExceptionClause<T = u32> {
    pub kind: ClauseKind<T>,
    pub try_start: T,
    pub try_end: T,
    pub handler_start: T,
    pub handler_end: T,
}

impl<T> ExceptionClause<T> {
    pub fn map<U>(self, mut f: impl FnMut(T) -> U) -> ExceptionClause<U> {
        let kind = match self.kind {
            ClauseKind::Catch(token) => ClauseKind::Catch(token),
            ClauseKind::Filter(start) => ClauseKind::Filter(f(start)),
            ClauseKind::Finally => ClauseKind::Finally,
            ClauseKind::Fault => ClauseKind::Fault,
        };

        ExceptionClause {
            kind,
            try_start: f(self.try_start),
            try_end: f(self.try_end),
            handler_start: f(self.handler_start),
            handler_end: f(self.handler_end),
        }
    }
}

/// A decoded method body: header fields, IL code, and exception clauses.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct MethodBody {
    pub max_stack: u16,
    pub init_locals: bool,
    pub local_var_sig: Token,
    pub code: Vec<u8>,
    pub clauses: Vec<ExceptionClause>,
}

fn read<'a, N>(data: &'a [u8], pos: &mut usize) -> Result<N, Error>
where
    N: scroll::ctx::TryFromCtx<'a, scroll::Endian, Error = scroll::Error>,
{
    let offset = *pos;
    data.gread_with(pos, LE)
        .map_err(|_| Error::Truncated { offset })
}

fn align4(pos: usize) -> usize {
    (pos + 3) & !3
}

fn slice(data: &[u8], start: usize, len: usize) -> Result<&[u8], Error> {
    data.get(start..start.saturating_add(len))
        .ok_or(Error::Truncated { offset: start })
}

impl MethodBody {
    /// Parse a header-prefixed method body.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let mut pos = 0;
        let first = read::<u8>(data, &mut pos)?;

        match first & FORMAT_MASK {
            TINY_FORMAT => {
                let size = usize::from(first >> 2);
                let code = slice(data, 1, size)?.to_vec();

                Ok(Self {
                    max_stack: TINY_MAX_STACK,
                    code,
                    ..Self::default()
                })
            }
            FAT_FORMAT => {
                let mut pos = 0;
                let flags_and_size = read::<u16>(data, &mut pos)?;
                let flags = flags_and_size & 0x0fff;
                let header_size = usize::from(flags_and_size >> 12) * 4;

                if header_size != FAT_HEADER_SIZE {
                    return Err(Error::Header(format!(
                        "unexpected fat header size {header_size}"
                    )));
                }

                let max_stack = read::<u16>(data, &mut pos)?;
                let code_size = read::<u32>(data, &mut pos)? as usize;
                let local_var_sig = Token(read::<u32>(data, &mut pos)?);
                let code = slice(data, header_size, code_size)?.to_vec();

                let clauses = if flags & FLAG_MORE_SECTS != 0 {
                    parse_sections(data, align4(header_size + code_size))?
                } else {
                    vec![]
                };

                Ok(Self {
                    max_stack,
                    init_locals: flags & FLAG_INIT_LOCALS != 0,
                    local_var_sig,
                    code,
                    clauses,
                })
            }
            format => Err(Error::Header(format!("unknown body format {format:#x}"))),
        }
    }

    pub fn is_tiny(&self) -> bool {
        self.code.len() < TINY_MAX_CODE_SIZE
            && self.max_stack <= TINY_MAX_STACK
            && self.local_var_sig.is_nil()
            && self.clauses.is_empty()
            && !self.init_locals
    }

    /// Encode as a header-prefixed method body, choosing the tiny format when possible.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut data: Vec<u8> = vec![];

        if self.is_tiny() {
            data.push(((self.code.len() as u8) << 2) | TINY_FORMAT);
            data.extend_from_slice(&self.code);
            return Ok(data);
        }

        let mut flags = u16::from(FAT_FORMAT);
        if !self.clauses.is_empty() {
            flags |= FLAG_MORE_SECTS;
        }
        if self.init_locals {
            flags |= FLAG_INIT_LOCALS;
        }

        data.iowrite_with(flags | (FAT_HEADER_DWORDS << 12), LE)?;
        data.iowrite_with(self.max_stack, LE)?;
        data.iowrite_with(self.code.len() as u32, LE)?;
        data.iowrite_with(self.local_var_sig.0, LE)?;
        data.extend_from_slice(&self.code);

        if self.clauses.is_empty() {
            return Ok(data);
        }

        data.resize(align4(data.len()), 0);

        // Always emit the fat section format, which can describe any clause.
        let section_size = 4 + FAT_CLAUSE_SIZE * self.clauses.len();
        if section_size > 0x00ff_ffff {
            return Err(Error::Section("too many exception clauses".into()));
        }

        data.push(SECT_EH_TABLE | SECT_FAT_FORMAT);
        data.extend_from_slice(&(section_size as u32).to_le_bytes()[..3]);

        for clause in &self.clauses {
            let (flags, extra) = match clause.kind {
                ClauseKind::Catch(token) => (CLAUSE_EXCEPTION, token.0),
                ClauseKind::Filter(start) => (CLAUSE_FILTER, start),
                ClauseKind::Finally => (CLAUSE_FINALLY, 0),
                ClauseKind::Fault => (CLAUSE_FAULT, 0),
            };

            data.iowrite_with(flags, LE)?;
            data.iowrite_with(clause.try_start, LE)?;
            data.iowrite_with(clause.try_end - clause.try_start, LE)?;
            data.iowrite_with(clause.handler_start, LE)?;
            data.iowrite_with(clause.handler_end - clause.handler_start, LE)?;
            data.iowrite_with(extra, LE)?;
        }

        Ok(data)
    }
}

fn parse_sections(data: &[u8], mut pos: usize) -> Result<Vec<ExceptionClause>, Error> {
    let mut clauses = vec![];

    loop {
        let start = pos;
        let kind = read::<u8>(data, &mut pos)?;

        if kind & SECT_OPT_IL_TABLE != 0 || kind & SECT_EH_TABLE == 0 {
            return Err(Error::Section(format!("unsupported section kind {kind:#x}")));
        }

        if kind & SECT_FAT_FORMAT != 0 {
            let size = slice(data, pos, 3)?;
            let size = u32::from_le_bytes([size[0], size[1], size[2], 0]) as usize;
            let count = size.saturating_sub(4) / FAT_CLAUSE_SIZE;

            let mut pos = start + 4;
            for _ in 0..count {
                let flags = read::<u32>(data, &mut pos)?;
                let try_offset = read::<u32>(data, &mut pos)?;
                let try_length = read::<u32>(data, &mut pos)?;
                let handler_offset = read::<u32>(data, &mut pos)?;
                let handler_length = read::<u32>(data, &mut pos)?;
                let extra = read::<u32>(data, &mut pos)?;

                clauses.push(clause(
                    flags,
                    [try_offset, try_length, handler_offset, handler_length],
                    extra,
                )?);
            }

            pos = start + size;
        } else {
            let size = usize::from(read::<u8>(data, &mut pos)?);
            let count = size.saturating_sub(4) / SMALL_CLAUSE_SIZE;

            let mut pos = start + 4;
            for _ in 0..count {
                let flags = read::<u16>(data, &mut pos)?;
                let try_offset = read::<u16>(data, &mut pos)?;
                let try_length = read::<u8>(data, &mut pos)?;
                let handler_offset = read::<u16>(data, &mut pos)?;
                let handler_length = read::<u8>(data, &mut pos)?;
                let extra = read::<u32>(data, &mut pos)?;

                clauses.push(clause(
                    u32::from(flags),
                    [
                        u32::from(try_offset),
                        u32::from(try_length),
                        u32::from(handler_offset),
                        u32::from(handler_length),
                    ],
                    extra,
                )?);
            }

            pos = start + size;
        }

        if pos <= start {
            return Err(Error::Section("empty data section".into()));
        }

        if kind & SECT_MORE_SECTS == 0 {
            break;
        }

        pos = align4(pos);
    }

    Ok(clauses)
}

fn clause(flags: u32, ranges: [u32; 4], extra: u32) -> Result<ExceptionClause, Error> {
    let [try_offset, try_length, handler_offset, handler_length] = ranges;

    let kind = match flags {
        CLAUSE_EXCEPTION => ClauseKind::Catch(Token(extra)),
        CLAUSE_FILTER => ClauseKind::Filter(extra),
        CLAUSE_FINALLY => ClauseKind::Finally,
        CLAUSE_FAULT => ClauseKind::Fault,
        _ => {
            return Err(Error::Section(format!(
                "unknown exception clause flags {flags:#x}"
            )))
        }
    };

    let try_end = try_offset
        .checked_add(try_length)
        .ok_or_else(|| Error::Section("try range overflows".into()))?;
    let handler_end = handler_offset
        .checked_add(handler_length)
        .ok_or_else(|| Error::Section("handler range overflows".into()))?;

    Ok(ExceptionClause {
        kind,
        try_start: try_offset,
        try_end,
        handler_start: handler_offset,
        handler_end,
    })
}
