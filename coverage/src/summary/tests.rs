// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use pretty_assertions::assert_eq;
use tempfile::tempdir;

use super::*;
use crate::map::{Branch, Condition, HitId, InstrumentedAssembly, MethodInfo};
use crate::store::HitFile;

fn sequence(hit_id: u32, start_line: u32, end_line: u32) -> Sequence {
    Sequence {
        hit_id: HitId(hit_id),
        offset: 0,
        start_line,
        start_column: 9,
        end_line,
        end_column: 20,
        method: MethodInfo::new("App.Program", "Main"),
        instruction: "IL_0000: nop".into(),
        conditions: vec![],
    }
}

/// A file with `total` single-line sequences, of which the first `covered`
/// are hit. Hit ids start at `first_id`.
fn file(path: &str, first_id: u32, total: u32, covered: u32, hits: &mut HitsInfo) -> SourceFile {
    let sequences = (0..total)
        .map(|i| sequence(first_id + i, i + 1, i + 1))
        .collect();

    for i in 0..covered {
        hits.add(HitId(first_id + i), 1);
    }

    SourceFile {
        path: path.into(),
        sequences,
    }
}

fn threshold(value: f64) -> SummaryAggregator {
    SummaryAggregator::new(Threshold::new(value).unwrap())
}

#[test]
fn test_empty_files_pass() -> Result<()> {
    let files = vec![SourceFile::new("Empty.cs")];
    let hits = HitsInfo::new();

    for t in [0.01, 0.5, 1.0] {
        let summary = calculate_files_summary(&files, &hits, t)?;

        assert_eq!(summary.statements.total, 0);
        assert_eq!(summary.statements.percentage, 1.0);
        assert!(summary.statements.pass);
        assert_eq!(summary.lines.percentage, 1.0);
        assert_eq!(summary.branches.percentage, 1.0);
        assert!(summary.pass());
    }

    Ok(())
}

#[test]
fn test_invalid_threshold() {
    let files: Vec<SourceFile> = vec![];
    let hits = HitsInfo::new();

    for t in [-0.1, 1.5, f64::NAN] {
        assert!(matches!(
            calculate_files_summary(&files, &hits, t),
            Err(SummaryError::InvalidThreshold(_))
        ));
    }
}

#[test]
fn test_threshold_boundary_is_inclusive() {
    let mut hits = HitsInfo::new();
    let files = vec![file("a.cs", 1, 4, 3, &mut hits)];

    let at = threshold(0.75).files_summary(&files, &hits);
    assert_eq!(at.statements.percentage, 0.75);
    assert!(at.statements.pass);

    let above = threshold(0.75 + 1e-6).files_summary(&files, &hits);
    assert!(!above.statements.pass);
}

#[test]
fn test_lines_are_distinct_per_file() {
    let mut hits = HitsInfo::new();
    hits.add(HitId(1), 2);

    let files = vec![
        SourceFile {
            path: "a.cs".into(),
            sequences: vec![sequence(1, 3, 4), sequence(2, 4, 5)],
        },
        SourceFile {
            path: "b.cs".into(),
            sequences: vec![sequence(3, 3, 3)],
        },
    ];

    let summary = threshold(0.5).files_summary(&files, &hits);

    // a.cs spans lines 3-5, b.cs line 3.
    assert_eq!(summary.lines.total, 4);
    assert_eq!(summary.lines.covered, 2);
    assert_eq!(summary.statements.total, 3);
    assert_eq!(summary.statements.covered, 1);
}

#[test]
fn test_branches_and_hit_policy() {
    let mut seq = sequence(1, 1, 1);
    seq.conditions.push(Condition {
        offset: 1,
        instruction: "IL_0001: brtrue.s IL_0005".into(),
        branches: vec![
            Branch {
                hit_id: HitId(2),
                offset: 3,
                fallthrough: true,
                instruction: "IL_0001: brtrue.s IL_0005".into(),
            },
            Branch {
                hit_id: HitId(3),
                offset: 5,
                fallthrough: false,
                instruction: "IL_0001: brtrue.s IL_0005".into(),
            },
        ],
    });

    let files = vec![SourceFile {
        path: "a.cs".into(),
        sequences: vec![seq],
    }];

    let mut hits = HitsInfo::new();
    hits.add(HitId(3), 1);

    let independent = threshold(1.0).files_summary(&files, &hits);
    assert_eq!(independent.branches.total, 2);
    assert_eq!(independent.branches.covered, 1);
    assert_eq!(independent.branches.percentage, 0.5);
    assert_eq!(independent.statements.covered, 0);

    let implied = threshold(1.0)
        .with_policy(SequenceHitPolicy::BranchImpliesSequence)
        .files_summary(&files, &hits);
    assert_eq!(implied.statements.covered, 1);
    assert_eq!(implied.branches.covered, 1);
}

#[test]
fn test_tree_folder_recomputes_counts() {
    let mut hits = HitsInfo::new();
    let files = vec![
        file("src/Full.cs", 1, 10, 10, &mut hits),
        file("src/Half.cs", 100, 10, 5, &mut hits),
    ];

    let root = threshold(0.8).tree(&files, &hits);

    assert_eq!(root.name, ROOT_NAME);
    assert_eq!(root.level, 0);
    assert_eq!(root.summary.statements.total, 20);
    assert_eq!(root.summary.statements.covered, 15);
    assert_eq!(root.summary.statements.percentage, 0.75);
    assert!(!root.summary.statements.pass);

    assert_eq!(root.children.len(), 1);
    let src = &root.children[0];
    assert!(src.is_folder());
    assert_eq!(src.name, "src");
    assert_eq!(src.level, 1);
    assert_eq!(src.summary, root.summary);

    let names: Vec<&str> = src.children.iter().map(|c| c.full_name.as_str()).collect();
    assert_eq!(names, vec!["src/Full.cs", "src/Half.cs"]);
    assert!(src.children.iter().all(|c| c.is_file() && c.level == 2));
    assert_eq!(src.children[1].summary.statements.percentage, 0.5);
}

#[test]
fn test_tree_depth_does_not_change_folder_summary() {
    let mut hits = HitsInfo::new();
    let files = vec![
        file("repo\\lib\\core\\Full.cs", 1, 10, 10, &mut hits),
        file("repo/lib/core/Half.cs", 100, 10, 5, &mut hits),
    ];

    let root = threshold(0.5).tree(&files, &hits);
    let rows = root.flatten();

    let names: Vec<(usize, &str)> = rows
        .iter()
        .map(|row| (row.level, row.full_name.as_str()))
        .collect();

    assert_eq!(
        names,
        vec![
            (0, ROOT_NAME),
            (1, "repo"),
            (2, "repo/lib"),
            (3, "repo/lib/core"),
            (4, "repo/lib/core/Full.cs"),
            (4, "repo/lib/core/Half.cs"),
        ]
    );

    for row in &rows[..4] {
        assert_eq!(row.summary.statements.total, 20);
        assert_eq!(row.summary.statements.covered, 15);
        assert_eq!(row.summary.statements.percentage, 0.75);
    }
}

#[test]
fn test_tree_single_file_is_leaf_with_remaining_path() {
    let mut hits = HitsInfo::new();
    let files = vec![
        file("src/app/Program.cs", 1, 2, 1, &mut hits),
        file("tests/Unit.cs", 10, 2, 2, &mut hits),
        file("src/Other.cs", 20, 2, 0, &mut hits),
    ];

    let root = threshold(0.5).tree(&files, &hits);

    let top: Vec<(&str, RowKind)> = root
        .children
        .iter()
        .map(|row| (row.name.as_str(), row.kind))
        .collect();
    assert_eq!(
        top,
        vec![("src", RowKind::Folder), ("tests/Unit.cs", RowKind::File)]
    );

    let src = &root.children[0];
    let leaves: Vec<&str> = src.children.iter().map(|row| row.name.as_str()).collect();
    assert_eq!(leaves, vec!["app/Program.cs", "Other.cs"]);
    assert_eq!(src.children[0].full_name, "src/app/Program.cs");
    assert_eq!(src.source_files.len(), 2);
}

#[test]
fn test_calculate_summary_reads_hits_dir() -> Result<()> {
    let dir = tempdir()?;

    let mut hits = HitsInfo::new();
    let source = file("a.cs", 1, 4, 2, &mut hits);

    let store = HitsStore::new(dir.path());
    store.write(&store.new_file_path("run"), &HitFile::new(None, hits))?;

    let result = InstrumentationResult {
        source_root: None,
        hits_dir: dir.path().to_owned(),
        assemblies: vec![InstrumentedAssembly {
            name: "App".into(),
            hash: String::new(),
            source_files: vec![source],
        }],
    };

    let summary = calculate_summary(&result, 0.5)?;
    assert_eq!(summary.statements.covered, 2);
    assert!(summary.statements.pass);

    assert!(calculate_summary(&result, 2.0).is_err());

    // No hits recorded: everything is unhit, not an error.
    store.reset()?;
    let summary = calculate_summary(&result, 0.5)?;
    assert_eq!(summary.statements.covered, 0);

    Ok(())
}

#[test]
fn test_calculate_summary_hits_dir_is_file() -> Result<()> {
    let dir = tempdir()?;
    let hits_dir = dir.path().join("hits");
    std::fs::write(&hits_dir, b"not a directory")?;

    let mut hits = HitsInfo::new();
    let source = file("a.cs", 1, 4, 4, &mut hits);

    let result = InstrumentationResult {
        source_root: None,
        hits_dir,
        assemblies: vec![InstrumentedAssembly {
            name: "App".into(),
            hash: String::new(),
            source_files: vec![source],
        }],
    };

    let summary = calculate_summary(&result, 0.5)?;
    assert_eq!(summary.statements.total, 4);
    assert_eq!(summary.statements.covered, 0);
    assert!(!summary.statements.pass);

    Ok(())
}

#[test]
fn test_summary_tree_threshold() {
    let mut hits = HitsInfo::new();
    let files = vec![
        file("src/a.cs", 1, 4, 3, &mut hits),
        file("src/b.cs", 10, 4, 3, &mut hits),
    ];

    for value in [-0.1, 1.5, f64::NAN] {
        assert!(matches!(
            summary_tree(&files, &hits, value),
            Err(SummaryError::InvalidThreshold(_))
        ));
    }

    let root = summary_tree(&files, &hits, 0.75).unwrap();
    assert_eq!(root.name, "All Files");
    assert_eq!(root.summary.statements.covered, 6);
    assert!(root.summary.statements.pass);
}
