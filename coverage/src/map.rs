// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Key correlating a coverable point with its runtime hit count.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct HitId(pub u32);

impl fmt::Display for HitId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One outcome of a `Condition`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Branch {
    pub hit_id: HitId,

    /// IL offset of the instruction this outcome continues at.
    pub offset: u32,

    /// `true` for the not-taken path of a conditional branch or switch.
    pub fallthrough: bool,

    pub instruction: String,
}

/// A decision point: a conditional branch or `switch` and its distinct outcomes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Condition {
    pub offset: u32,
    pub instruction: String,
    pub branches: Vec<Branch>,
}

#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MethodInfo {
    pub declaring_type: String,
    pub name: String,
    pub full_name: String,
}

impl MethodInfo {
    pub fn new(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        let declaring_type = declaring_type.into();
        let name = name.into();
        let full_name = format!("{declaring_type}::{name}");

        Self {
            declaring_type,
            name,
            full_name,
        }
    }
}

/// The smallest coverable statement span.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Sequence {
    pub hit_id: HitId,
    pub offset: u32,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub method: MethodInfo,
    pub instruction: String,
    pub conditions: Vec<Condition>,
}

impl Sequence {
    /// Source lines spanned by the statement.
    pub fn lines(&self) -> RangeInclusive<u32> {
        self.start_line..=self.end_line.max(self.start_line)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.conditions.iter().flat_map(|c| c.branches.iter())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SourceFile {
    pub path: String,
    pub sequences: Vec<Sequence>,
}

impl SourceFile {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sequences: vec![],
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InstrumentedAssembly {
    pub name: String,

    /// Hex SHA-256 of the original, uninstrumented image.
    pub hash: String,

    pub source_files: Vec<SourceFile>,
}

impl InstrumentedAssembly {
    pub fn sequence_count(&self) -> usize {
        self.source_files.iter().map(|f| f.sequences.len()).sum()
    }
}

/// Static coverage map for one instrumentation run.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstrumentationResult {
    pub source_root: Option<String>,
    pub hits_dir: PathBuf,
    pub assemblies: Vec<InstrumentedAssembly>,
}

impl InstrumentationResult {
    /// All source files, with the sequences of files shared between
    /// assemblies merged under one path.
    pub fn source_files(&self) -> Vec<SourceFile> {
        let mut files: BTreeMap<&str, SourceFile> = BTreeMap::new();

        for file in self.assemblies.iter().flat_map(|a| &a.source_files) {
            files
                .entry(file.path.as_str())
                .or_insert_with(|| SourceFile::new(file.path.clone()))
                .sequences
                .extend(file.sequences.iter().cloned());
        }

        files.into_values().collect()
    }

    pub fn hit_ids(&self) -> impl Iterator<Item = HitId> + '_ {
        self.assemblies
            .iter()
            .flat_map(|a| &a.source_files)
            .flat_map(|f| &f.sequences)
            .flat_map(|s| std::iter::once(s.hit_id).chain(s.branches().map(|b| b.hit_id)))
    }
}
