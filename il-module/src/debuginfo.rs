// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::Token;

/// Line number used by compilers to mark compiler-generated code.
pub const HIDDEN_LINE: u32 = 0x00fe_efee;

/// Maps an IL offset to a span of source text.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SequencePoint {
    pub offset: u32,
    pub document: String,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SequencePoint {
    pub fn is_hidden(&self) -> bool {
        self.start_line == HIDDEN_LINE
    }
}

/// Source of debug symbols for the methods of one module.
pub trait SymbolReader {
    /// Sequence points of a method, in any order.
    ///
    /// `Ok(None)` means the method has no symbols.
    fn sequence_points(&self, method: Token) -> Result<Option<Vec<SequencePoint>>>;
}

/// Symbols held in memory, keyed by method token.
#[derive(Clone, Debug, Default)]
pub struct DebugInfo {
    methods: BTreeMap<Token, Vec<SequencePoint>>,
}

impl DebugInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, method: Token, points: Vec<SequencePoint>) {
        self.methods.insert(method, points);
    }

    pub fn methods(&self) -> impl Iterator<Item = Token> + '_ {
        self.methods.keys().copied()
    }

    /// Distinct documents referenced by any sequence point.
    pub fn documents(&self) -> Vec<&str> {
        let mut documents: Vec<&str> = self
            .methods
            .values()
            .flatten()
            .map(|point| point.document.as_str())
            .collect();

        documents.sort_unstable();
        documents.dedup();
        documents
    }
}

impl SymbolReader for DebugInfo {
    fn sequence_points(&self, method: Token) -> Result<Option<Vec<SequencePoint>>> {
        Ok(self.methods.get(&method).cloned())
    }
}

impl<R: SymbolReader + ?Sized> SymbolReader for &R {
    fn sequence_points(&self, method: Token) -> Result<Option<Vec<SequencePoint>>> {
        (**self).sequence_points(method)
    }
}
