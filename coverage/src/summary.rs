// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::hits::HitsInfo;
use crate::map::{InstrumentationResult, Sequence, SourceFile};
use crate::store::HitsStore;

pub const ROOT_NAME: &str = "All Files";

#[derive(Debug, thiserror::Error)]
pub enum SummaryError {
    #[error("coverage threshold {0} is not between 0 and 1")]
    InvalidThreshold(f64),
}

/// Minimum coverage ratio, in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct Threshold(f64);

impl Threshold {
    pub fn new(value: f64) -> Result<Self, SummaryError> {
        if (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(SummaryError::InvalidThreshold(value))
        }
    }

    pub fn value(&self) -> f64 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(0.9)
    }
}

impl TryFrom<f64> for Threshold {
    type Error = SummaryError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl<'de> Deserialize<'de> for Threshold {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = f64::deserialize(deserializer)?;
        Self::new(value).map_err(serde::de::Error::custom)
    }
}

/// Whether a hit on any branch of a sequence counts the sequence as covered.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceHitPolicy {
    /// Sequences are covered only by their own entry probe.
    #[default]
    Independent,

    BranchImpliesSequence,
}

impl SequenceHitPolicy {
    pub fn is_covered(&self, sequence: &Sequence, hits: &HitsInfo) -> bool {
        if hits.is_hit(sequence.hit_id) {
            return true;
        }

        match self {
            Self::Independent => false,
            Self::BranchImpliesSequence => sequence.branches().any(|b| hits.is_hit(b.hit_id)),
        }
    }
}

/// Covered and total counts of one kind of coverable item.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Metric {
    pub total: usize,
    pub covered: usize,
    pub percentage: f64,
    pub pass: bool,
}

impl Metric {
    pub fn new(covered: usize, total: usize, threshold: Threshold) -> Self {
        // Nothing to cover is full coverage.
        let percentage = if total == 0 {
            1.0
        } else {
            covered as f64 / total as f64
        };

        Self {
            total,
            covered,
            percentage,
            pass: percentage >= threshold.value(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Summary {
    pub statements: Metric,
    pub lines: Metric,
    pub branches: Metric,
}

impl Summary {
    pub fn pass(&self) -> bool {
        self.statements.pass && self.lines.pass && self.branches.pass
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowKind {
    Root,
    Folder,
    File,
}

/// Node of the per-directory breakdown.
#[derive(Clone, Debug, Serialize)]
pub struct SummaryRow<'a> {
    pub level: usize,
    pub name: String,
    pub full_name: String,
    pub kind: RowKind,

    #[serde(skip)]
    pub source_files: Vec<&'a SourceFile>,

    pub summary: Summary,
    pub children: Vec<SummaryRow<'a>>,
}

impl<'a> SummaryRow<'a> {
    pub fn is_folder(&self) -> bool {
        self.kind == RowKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == RowKind::File
    }

    /// Rows in pre-order, as listed by a grid.
    pub fn flatten(&self) -> Vec<&SummaryRow<'a>> {
        let mut rows = vec![self];

        for child in &self.children {
            rows.extend(child.flatten());
        }

        rows
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SummaryAggregator {
    threshold: Threshold,
    policy: SequenceHitPolicy,
}

impl SummaryAggregator {
    pub fn new(threshold: Threshold) -> Self {
        Self {
            threshold,
            policy: SequenceHitPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SequenceHitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Summary over a set of files, computed from raw counts.
    pub fn files_summary<'a>(
        &self,
        files: impl IntoIterator<Item = &'a SourceFile>,
        hits: &HitsInfo,
    ) -> Summary {
        let mut statements = 0;
        let mut covered_statements = 0;
        let mut lines = 0;
        let mut covered_lines = 0;
        let mut branches = 0;
        let mut covered_branches = 0;

        for file in files {
            // Lines are distinct within a file.
            let mut file_lines = BTreeSet::new();
            let mut file_covered_lines = BTreeSet::new();

            for sequence in &file.sequences {
                let covered = self.policy.is_covered(sequence, hits);

                statements += 1;
                file_lines.extend(sequence.lines());

                if covered {
                    covered_statements += 1;
                    file_covered_lines.extend(sequence.lines());
                }

                for branch in sequence.branches() {
                    branches += 1;

                    if hits.is_hit(branch.hit_id) {
                        covered_branches += 1;
                    }
                }
            }

            lines += file_lines.len();
            covered_lines += file_covered_lines.len();
        }

        Summary {
            statements: Metric::new(covered_statements, statements, self.threshold),
            lines: Metric::new(covered_lines, lines, self.threshold),
            branches: Metric::new(covered_branches, branches, self.threshold),
        }
    }

    /// Summary tree rooted at "All Files", grouping files by path segment.
    pub fn tree<'a>(&self, files: &'a [SourceFile], hits: &HitsInfo) -> SummaryRow<'a> {
        let items: Vec<Item<'a>> = files
            .iter()
            .map(|file| Item {
                segments: split_path(&file.path),
                file,
            })
            .collect();

        SummaryRow {
            level: 0,
            name: ROOT_NAME.to_owned(),
            full_name: ROOT_NAME.to_owned(),
            kind: RowKind::Root,
            source_files: files.iter().collect(),
            summary: self.files_summary(files, hits),
            children: self.rows(&items, 1, "", hits),
        }
    }

    fn rows<'a>(
        &self,
        items: &[Item<'a>],
        level: usize,
        base: &str,
        hits: &HitsInfo,
    ) -> Vec<SummaryRow<'a>> {
        // Group by the segment at this level, in order of first appearance.
        let mut groups: Vec<(&str, Vec<Item<'a>>)> = vec![];

        for item in items {
            let Some(segment) = item.segments.get(level - 1).copied() else {
                continue;
            };

            match groups.iter_mut().find(|(key, _)| *key == segment) {
                Some((_, group)) => group.push(item.clone()),
                None => groups.push((segment, vec![item.clone()])),
            }
        }

        let mut rows = vec![];

        for (segment, group) in groups {
            let source_files: Vec<&'a SourceFile> = group.iter().map(|item| item.file).collect();
            let summary = self.files_summary(source_files.iter().copied(), hits);

            let row = if let [item] = group.as_slice() {
                let name = item.segments[level - 1..].join("/");

                SummaryRow {
                    level,
                    full_name: join(base, &name),
                    name,
                    kind: RowKind::File,
                    source_files,
                    summary,
                    children: vec![],
                }
            } else {
                let full_name = join(base, segment);
                let children = self.rows(&group, level + 1, &full_name, hits);

                SummaryRow {
                    level,
                    name: segment.to_owned(),
                    full_name,
                    kind: RowKind::Folder,
                    source_files,
                    summary,
                    children,
                }
            };

            rows.push(row);
        }

        rows
    }
}

#[derive(Clone)]
struct Item<'a> {
    segments: Vec<&'a str>,
    file: &'a SourceFile,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split(['/', '\\'])
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn join(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_owned()
    } else {
        format!("{base}/{name}")
    }
}

/// Summarize `files` against `threshold`.
pub fn calculate_files_summary(
    files: &[SourceFile],
    hits: &HitsInfo,
    threshold: f64,
) -> Result<Summary, SummaryError> {
    let threshold = Threshold::new(threshold)?;
    Ok(SummaryAggregator::new(threshold).files_summary(files, hits))
}

/// Per-directory summary tree of `files` against `threshold`.
pub fn summary_tree<'a>(
    files: &'a [SourceFile],
    hits: &HitsInfo,
    threshold: f64,
) -> Result<SummaryRow<'a>, SummaryError> {
    let threshold = Threshold::new(threshold)?;
    Ok(SummaryAggregator::new(threshold).tree(files, hits))
}

/// Summarize an instrumentation run using the hits recorded in its hits dir.
pub fn calculate_summary(result: &InstrumentationResult, threshold: f64) -> Result<Summary> {
    let threshold = Threshold::new(threshold)?;
    let hits = HitsStore::new(&result.hits_dir).read()?;
    let files = result.source_files();

    Ok(SummaryAggregator::new(threshold).files_summary(&files, &hits))
}

#[cfg(test)]
mod tests;
