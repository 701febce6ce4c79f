// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::PathBuf;

use anyhow::Result;
use coverage::AllowList;
use il_module::ProbeReference;
use serde::{Deserialize, Serialize};

pub use coverage::store::DEFAULT_HITS_DIR;

pub const DEFAULT_PROBE_ASSEMBLY: &str = "Coverage.Runtime";
pub const DEFAULT_PROBE_TYPE: &str = "Coverage.Runtime.HitService";
pub const DEFAULT_PROBE_METHOD: &str = "Hit";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Globs of source documents to instrument. Empty means all.
    pub sources: Vec<String>,

    /// Globs of source documents to leave alone.
    pub exclude_sources: Vec<String>,

    /// Source paths in the coverage map are made relative to this directory.
    pub source_root: Option<String>,

    pub hits_dir: PathBuf,

    /// Record branch outcomes as well as sequences.
    pub branches: bool,

    /// Instrument assemblies of a batch in parallel.
    pub parallel: bool,

    pub probe: ProbeReference,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: vec![],
            exclude_sources: vec![],
            source_root: None,
            hits_dir: DEFAULT_HITS_DIR.into(),
            branches: true,
            parallel: true,
            probe: ProbeReference {
                assembly: DEFAULT_PROBE_ASSEMBLY.into(),
                type_name: DEFAULT_PROBE_TYPE.into(),
                method: DEFAULT_PROBE_METHOD.into(),
            },
        }
    }
}

impl Config {
    pub fn with_options(options: impl IntoIterator<Item = ConfigOption>) -> Self {
        let mut config = Self::default();

        for option in options {
            config.apply(option);
        }

        config
    }

    pub fn apply(&mut self, option: ConfigOption) {
        use ConfigOption::*;

        match option {
            Sources(globs) => self.sources.extend(globs),
            ExcludeSources(globs) => self.exclude_sources.extend(globs),
            SourceRoot(root) => self.source_root = Some(root),
            HitsDir(dir) => self.hits_dir = dir,
            NoBranches => self.branches = false,
            Sequential => self.parallel = false,
            Probe(probe) => self.probe = probe,
        }
    }

    pub fn allowlist(&self) -> Result<AllowList> {
        AllowList::from_globs(&self.sources, &self.exclude_sources)
    }
}

/// How many values an option takes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OptionArity {
    Flag,
    Single,
    Multi,
}

/// A single configuration setting, with its value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfigOption {
    Sources(Vec<String>),
    ExcludeSources(Vec<String>),
    SourceRoot(String),
    HitsDir(PathBuf),
    NoBranches,
    Sequential,
    Probe(ProbeReference),
}

impl ConfigOption {
    pub fn name(&self) -> &'static str {
        use ConfigOption::*;

        match self {
            Sources(_) => "sources",
            ExcludeSources(_) => "exclude-sources",
            SourceRoot(_) => "source-root",
            HitsDir(_) => "hits-dir",
            NoBranches => "no-branches",
            Sequential => "sequential",
            Probe(_) => "probe",
        }
    }

    pub fn arity(&self) -> OptionArity {
        use ConfigOption::*;

        match self {
            NoBranches | Sequential => OptionArity::Flag,
            SourceRoot(_) | HitsDir(_) | Probe(_) => OptionArity::Single,
            Sources(_) | ExcludeSources(_) => OptionArity::Multi,
        }
    }
}
