// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#[macro_use]
extern crate log;

use std::fmt;
use std::io::Cursor;

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub mod body;
pub mod debuginfo;
pub mod instruction;
pub mod loader;
pub mod memory;
pub mod opcode;

/// Metadata token: table index in the high byte, row in the low 24 bits.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Token(pub u32);

impl Token {
    pub const METHOD_DEF_TABLE: u8 = 0x06;
    pub const MEMBER_REF_TABLE: u8 = 0x0a;

    pub fn new(table: u8, row: u32) -> Self {
        Self((u32::from(table) << 24) | (row & 0x00ff_ffff))
    }

    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn row(&self) -> u32 {
        self.0 & 0x00ff_ffff
    }

    pub fn is_nil(&self) -> bool {
        self.row() == 0
    }
}

impl fmt::LowerHex for Token {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Malformed or unsupported method body data.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unknown opcode 0x{value:x} at IL_{offset:04x}")]
    UnknownOpcode { offset: u32, value: u16 },

    #[error("truncated data at offset 0x{offset:x}")]
    Truncated { offset: usize },

    #[error("branch at IL_{offset:04x} targets an offset outside the method")]
    TargetOutOfRange { offset: u32 },

    #[error("short branch at IL_{offset:04x} cannot reach IL_{target:04x}")]
    ShortBranchOverflow { offset: u32, target: u32 },

    #[error("instruction at IL_{offset:04x} is not at its encoded position")]
    Layout { offset: u32 },

    #[error("operand does not match opcode `{opcode}` at IL_{offset:04x}")]
    Operand { offset: u32, opcode: &'static str },

    #[error("invalid method body header: {0}")]
    Header(String),

    #[error("invalid method data section: {0}")]
    Section(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Net evaluation stack effect of a call site, derived from its signature.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StackEffect {
    pub pop: u16,
    pub push: u16,
}

impl StackEffect {
    pub fn new(pop: u16, push: u16) -> Self {
        Self { pop, push }
    }
}

/// Method reference that instrumented code calls to record a hit.
///
/// The referenced method must have the signature `void (int32)`.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ProbeReference {
    pub assembly: String,
    pub type_name: String,
    pub method: String,
}

impl ProbeReference {
    pub const EFFECT: StackEffect = StackEffect { pop: 1, push: 0 };
}

/// A method definition, with its raw (header-prefixed) IL body, if any.
#[derive(Clone, Debug, PartialEq)]
pub struct MethodDef {
    pub token: Token,
    pub declaring_type: String,
    pub name: String,
    pub body: Option<Vec<u8>>,
}

impl MethodDef {
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.declaring_type, self.name)
    }
}

/// A loaded managed module whose method bodies can be rewritten.
pub trait Module {
    /// Simple assembly name.
    fn name(&self) -> &str;

    /// Raw bytes of the original image. May be empty for synthesized modules.
    fn image(&self) -> &[u8];

    /// Names of referenced assemblies.
    fn references(&self) -> Vec<String>;

    fn methods(&self) -> Vec<MethodDef>;

    /// Stack effect of a `call`, `callvirt`, `newobj` or `calli` operand.
    fn call_effect(&self, token: Token) -> Option<StackEffect>;

    /// Add a reference to the probe method and return its call token.
    ///
    /// Importing the same probe twice returns the same token.
    fn import_probe(&mut self, probe: &ProbeReference) -> Result<Token>;

    /// Token of the already-imported probe, if any.
    fn probe_token(&self) -> Option<Token>;

    fn replace_body(&mut self, method: Token, body: Vec<u8>) -> Result<()>;

    fn is_instrumented(&self) -> bool;

    fn mark_instrumented(&mut self);
}

pub fn is_windows_module(data: &[u8]) -> Result<bool> {
    let mut cursor = Cursor::new(data);
    let hint = goblin::peek(&mut cursor)?;
    Ok(matches!(hint, goblin::Hint::PE))
}

/// Returns `true` if `data` is a PE image with a CLI (CLR runtime) header.
pub fn is_managed_image(data: &[u8]) -> Result<bool> {
    if !is_windows_module(data)? {
        return Ok(false);
    }

    let pe = goblin::pe::PE::parse(data)?;

    let managed = pe
        .header
        .optional_header
        .map(|header| header.data_directories.get_clr_runtime_header().is_some())
        .unwrap_or(false);

    Ok(managed)
}
