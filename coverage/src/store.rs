// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hits::HitsInfo;

pub const DEFAULT_HITS_DIR: &str = "coverage-hits";
pub const HIT_FILE_EXTENSION: &str = "hits";
pub const HIT_FILE_VERSION: u32 = 1;

const TEMP_EXTENSION: &str = "tmp";

/// Test case that produced a hit file, when known.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TestIdentity {
    pub name: String,
}

impl TestIdentity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Contents of one hit file: a complete snapshot of one process's counters.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HitFile {
    pub version: u32,
    pub test: Option<TestIdentity>,
    pub hits: HitsInfo,
}

impl HitFile {
    pub fn new(test: Option<TestIdentity>, hits: HitsInfo) -> Self {
        Self {
            version: HIT_FILE_VERSION,
            test,
            hits,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let file: HitFile = bincode::deserialize(data)?;

        if file.version != HIT_FILE_VERSION {
            bail!("unsupported hit file version {}", file.version);
        }

        Ok(file)
    }
}

/// Hits of a single recording context, as read back from its file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContextHits {
    pub path: PathBuf,
    pub test: Option<TestIdentity>,
    pub hits: HitsInfo,
}

/// Directory of hit files, one per recording process.
///
/// Each writer owns a uniquely named file. Readers only see complete files,
/// since writers replace their file atomically.
#[derive(Clone, Debug)]
pub struct HitsStore {
    dir: PathBuf,
}

impl HitsStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Allocate a file path that no other writer will use.
    ///
    /// Named `<run-id>.<pid>.<uuid>.hits`.
    pub fn new_file_path(&self, run_id: &str) -> PathBuf {
        let run_id = sanitize(run_id);
        let pid = std::process::id();
        let unique = Uuid::new_v4().simple();

        self.dir
            .join(format!("{run_id}.{pid}.{unique}.{HIT_FILE_EXTENSION}"))
    }

    /// Replace the contents of `path` with `file`.
    pub fn write(&self, path: &Path, file: &HitFile) -> Result<()> {
        let data = file.to_bytes()?;

        fs::create_dir_all(&self.dir)
            .with_context(|| format!("unable to create hits dir {}", self.dir.display()))?;

        let temp = path.with_extension(TEMP_EXTENSION);

        {
            let mut writer = fs::File::create(&temp)
                .with_context(|| format!("unable to create {}", temp.display()))?;
            writer.write_all(&data)?;
            writer.sync_all()?;
        }

        fs::rename(&temp, path)
            .with_context(|| format!("unable to replace hit file {}", path.display()))?;

        Ok(())
    }

    /// Paths of all hit files, sorted.
    ///
    /// A missing or unreadable directory has none.
    pub fn hit_files(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("hits dir {} does not exist", self.dir.display());
                return Ok(vec![]);
            }
            Err(err) => {
                warn!("unable to list hits dir {}: {}", self.dir.display(), err);
                return Ok(vec![]);
            }
        };

        let mut files = vec![];

        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(err) => {
                    warn!("skipping unreadable entry in {}: {}", self.dir.display(), err);
                    continue;
                }
            };

            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(HIT_FILE_EXTENSION)
            {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }

    /// Hits of each recording context. Unreadable files are skipped.
    pub fn read_contexts(&self) -> Result<Vec<ContextHits>> {
        let mut contexts = vec![];

        for path in self.hit_files()? {
            match read_hit_file(&path) {
                Ok(file) => contexts.push(ContextHits {
                    path,
                    test: file.test,
                    hits: file.hits,
                }),
                Err(err) => {
                    warn!("skipping corrupt hit file {}: {:#}", path.display(), err);
                }
            }
        }

        Ok(contexts)
    }

    /// Sum of all recorded hits.
    pub fn read(&self) -> Result<HitsInfo> {
        let mut hits = HitsInfo::new();

        let contexts = self.read_contexts()?;
        for context in &contexts {
            hits.merge(&context.hits);
        }

        debug!(
            "read {} hit ids from {} files in {}",
            hits.len(),
            contexts.len(),
            self.dir.display()
        );

        Ok(hits)
    }

    /// Delete all hit files, returning how many were removed.
    pub fn reset(&self) -> Result<usize> {
        let files = self.hit_files()?;

        for path in &files {
            fs::remove_file(path)
                .with_context(|| format!("unable to remove hit file {}", path.display()))?;
        }

        Ok(files.len())
    }
}

fn read_hit_file(path: &Path) -> Result<HitFile> {
    let data = fs::read(path)?;
    HitFile::from_bytes(&data)
}

fn sanitize(run_id: &str) -> String {
    let sanitized: String = run_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "run".to_owned()
    } else {
        sanitized
    }
}
