// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::BTreeSet;

use anyhow::{bail, Result};
use coverage::map::{
    Branch, Condition, HitId, InstrumentationResult, InstrumentedAssembly, MethodInfo, Sequence,
    SourceFile,
};

#[derive(Deserialize, Serialize)]
pub struct CoverageMapJson {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_root: Option<String>,
    pub hits_dir: String,
    pub assemblies: Vec<AssemblyJson>,
}

#[derive(Deserialize, Serialize)]
pub struct AssemblyJson {
    pub name: String,
    pub hash: String,
    pub files: Vec<SourceFileJson>,
}

#[derive(Deserialize, Serialize)]
pub struct SourceFileJson {
    pub path: String,
    pub sequences: Vec<SequenceJson>,
}

#[derive(Deserialize, Serialize)]
pub struct SequenceJson {
    pub hit_id: u32,
    pub offset: u32,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
    pub method: MethodJson,
    pub instruction: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<ConditionJson>,
}

#[derive(Deserialize, Serialize)]
pub struct MethodJson {
    pub declaring_type: String,
    pub name: String,
    pub full_name: String,
}

#[derive(Deserialize, Serialize)]
pub struct ConditionJson {
    pub offset: u32,
    pub instruction: String,
    pub branches: Vec<BranchJson>,
}

#[derive(Deserialize, Serialize)]
pub struct BranchJson {
    pub hit_id: u32,
    pub offset: u32,

    #[serde(default)]
    pub fallthrough: bool,

    pub instruction: String,
}

impl From<&InstrumentationResult> for CoverageMapJson {
    fn from(result: &InstrumentationResult) -> Self {
        let assemblies = result
            .assemblies
            .iter()
            .map(|assembly| AssemblyJson {
                name: assembly.name.clone(),
                hash: assembly.hash.clone(),
                files: assembly.source_files.iter().map(SourceFileJson::from).collect(),
            })
            .collect();

        Self {
            source_root: result.source_root.clone(),
            hits_dir: result.hits_dir.to_string_lossy().into_owned(),
            assemblies,
        }
    }
}

impl From<&SourceFile> for SourceFileJson {
    fn from(file: &SourceFile) -> Self {
        let sequences = file
            .sequences
            .iter()
            .map(|seq| SequenceJson {
                hit_id: seq.hit_id.0,
                offset: seq.offset,
                start_line: seq.start_line,
                start_column: seq.start_column,
                end_line: seq.end_line,
                end_column: seq.end_column,
                method: MethodJson {
                    declaring_type: seq.method.declaring_type.clone(),
                    name: seq.method.name.clone(),
                    full_name: seq.method.full_name.clone(),
                },
                instruction: seq.instruction.clone(),
                conditions: seq.conditions.iter().map(ConditionJson::from).collect(),
            })
            .collect();

        Self {
            path: file.path.clone(),
            sequences,
        }
    }
}

impl From<&Condition> for ConditionJson {
    fn from(condition: &Condition) -> Self {
        let branches = condition
            .branches
            .iter()
            .map(|branch| BranchJson {
                hit_id: branch.hit_id.0,
                offset: branch.offset,
                fallthrough: branch.fallthrough,
                instruction: branch.instruction.clone(),
            })
            .collect();

        Self {
            offset: condition.offset,
            instruction: condition.instruction.clone(),
            branches,
        }
    }
}

impl TryFrom<CoverageMapJson> for InstrumentationResult {
    type Error = anyhow::Error;

    fn try_from(json: CoverageMapJson) -> Result<Self> {
        if json.hits_dir.is_empty() {
            bail!("coverage map has no hits dir");
        }

        // Every coverable point must have its own hit id.
        let mut seen = BTreeSet::new();
        let mut check = |id: u32| -> Result<HitId> {
            if !seen.insert(id) {
                bail!("hit id {} is used more than once", id);
            }
            Ok(HitId(id))
        };

        let mut assemblies = vec![];

        for assembly in json.assemblies {
            let mut source_files = vec![];

            for file in assembly.files {
                let mut sequences = vec![];

                for seq in file.sequences {
                    if seq.end_line < seq.start_line {
                        bail!(
                            "sequence {} in {} ends before it starts",
                            seq.hit_id,
                            file.path
                        );
                    }

                    let hit_id = check(seq.hit_id)?;
                    let mut conditions = vec![];

                    for condition in seq.conditions {
                        if condition.branches.len() < 2 {
                            bail!(
                                "condition at IL_{:04x} in {} has fewer than two branches",
                                condition.offset,
                                seq.method.full_name
                            );
                        }

                        let mut branches = vec![];

                        for branch in condition.branches {
                            branches.push(Branch {
                                hit_id: check(branch.hit_id)?,
                                offset: branch.offset,
                                fallthrough: branch.fallthrough,
                                instruction: branch.instruction,
                            });
                        }

                        conditions.push(Condition {
                            offset: condition.offset,
                            instruction: condition.instruction,
                            branches,
                        });
                    }

                    sequences.push(Sequence {
                        hit_id,
                        offset: seq.offset,
                        start_line: seq.start_line,
                        start_column: seq.start_column,
                        end_line: seq.end_line,
                        end_column: seq.end_column,
                        method: MethodInfo {
                            declaring_type: seq.method.declaring_type,
                            name: seq.method.name,
                            full_name: seq.method.full_name,
                        },
                        instruction: seq.instruction,
                        conditions,
                    });
                }

                source_files.push(SourceFile {
                    path: file.path,
                    sequences,
                });
            }

            assemblies.push(InstrumentedAssembly {
                name: assembly.name,
                hash: assembly.hash,
                source_files,
            });
        }

        Ok(InstrumentationResult {
            source_root: json.source_root,
            hits_dir: json.hits_dir.into(),
            assemblies,
        })
    }
}
