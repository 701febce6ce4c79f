// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use coverage::map::InstrumentationResult;

pub mod v1;

/// Serialized coverage map, tagged with its format version.
#[derive(Deserialize, Serialize)]
#[serde(tag = "version")]
pub enum CoverageMapJson {
    #[serde(rename = "1")]
    V1(v1::CoverageMapJson),
}

impl CoverageMapJson {
    pub fn deserialize(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

// Convert into the latest format.
impl From<&InstrumentationResult> for CoverageMapJson {
    fn from(result: &InstrumentationResult) -> Self {
        Self::V1(v1::CoverageMapJson::from(result))
    }
}

impl TryFrom<CoverageMapJson> for InstrumentationResult {
    type Error = anyhow::Error;

    fn try_from(json: CoverageMapJson) -> Result<Self> {
        match json {
            CoverageMapJson::V1(v1) => v1.try_into(),
        }
    }
}

pub fn from_str(text: &str) -> Result<InstrumentationResult> {
    CoverageMapJson::deserialize(text)?.try_into()
}

pub fn to_string(result: &InstrumentationResult) -> Result<String> {
    let json = CoverageMapJson::from(result);
    Ok(serde_json::to_string_pretty(&json)?)
}

/// Load a coverage map. Any error here means coverage cannot be reported.
pub fn load(path: impl AsRef<Path>) -> Result<InstrumentationResult> {
    let path = path.as_ref();

    let text = fs::read_to_string(path)
        .with_context(|| format!("unable to read coverage map {}", path.display()))?;

    from_str(&text).with_context(|| format!("invalid coverage map {}", path.display()))
}

pub fn save(result: &InstrumentationResult, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = to_string(result)?;

    fs::write(path, text)
        .with_context(|| format!("unable to write coverage map {}", path.display()))?;

    Ok(())
}
