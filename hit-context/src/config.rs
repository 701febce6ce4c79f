// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use coverage::store::{TestIdentity, DEFAULT_HITS_DIR};

pub const HITS_DIR_VAR: &str = "MINICOV_HITS_DIR";
pub const RUN_ID_VAR: &str = "MINICOV_RUN_ID";
pub const FLUSH_INTERVAL_VAR: &str = "MINICOV_FLUSH_INTERVAL_MS";
pub const TEST_VAR: &str = "MINICOV_TEST";

pub const DEFAULT_RUN_ID: &str = "run";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecorderConfig {
    pub hits_dir: PathBuf,

    /// Prefix of the hit file name.
    pub run_id: String,

    /// Flush in the background at this interval, if set.
    pub flush_interval: Option<Duration>,

    pub test: Option<TestIdentity>,
}

impl RecorderConfig {
    pub fn new(hits_dir: impl Into<PathBuf>) -> Self {
        Self {
            hits_dir: hits_dir.into(),
            run_id: DEFAULT_RUN_ID.into(),
            flush_interval: None,
            test: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Read the config from named variables. Empty values count as unset.
    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| var(name).filter(|value| !value.is_empty());

        let mut config = Self::new(var(HITS_DIR_VAR).unwrap_or_else(|| DEFAULT_HITS_DIR.into()));

        if let Some(run_id) = var(RUN_ID_VAR) {
            config.run_id = run_id;
        }

        if let Some(interval) = var(FLUSH_INTERVAL_VAR) {
            let millis: u64 = interval
                .trim()
                .parse()
                .with_context(|| format!("invalid {FLUSH_INTERVAL_VAR}: {interval}"))?;

            config.flush_interval = (millis > 0).then(|| Duration::from_millis(millis));
        }

        config.test = var(TEST_VAR).map(TestIdentity::new);

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() -> Result<()> {
        let config = RecorderConfig::from_vars(vars(&[(TEST_VAR, "")]))?;
        assert_eq!(config, RecorderConfig::new(DEFAULT_HITS_DIR));

        Ok(())
    }

    #[test]
    fn test_from_vars() -> Result<()> {
        let config = RecorderConfig::from_vars(vars(&[
            (HITS_DIR_VAR, "/tmp/hits"),
            (RUN_ID_VAR, "nightly"),
            (FLUSH_INTERVAL_VAR, "250"),
            (TEST_VAR, "Tests.Parser.Empty"),
        ]))?;

        assert_eq!(
            config,
            RecorderConfig {
                hits_dir: "/tmp/hits".into(),
                run_id: "nightly".into(),
                flush_interval: Some(Duration::from_millis(250)),
                test: Some(TestIdentity::new("Tests.Parser.Empty")),
            }
        );

        let disabled = RecorderConfig::from_vars(vars(&[(FLUSH_INTERVAL_VAR, "0")]))?;
        assert_eq!(disabled.flush_interval, None);

        assert!(RecorderConfig::from_vars(vars(&[(FLUSH_INTERVAL_VAR, "soon")])).is_err());

        Ok(())
    }
}
