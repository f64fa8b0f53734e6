use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;

use super::process::ProcessSpec;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.yml";

fn default_max_restarts() -> usize { 2 }
fn default_level() -> String { String::from("info") }

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Directory for the daily rotating log file. Logs go to stderr when unset.
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { dir: None, level: default_level() }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
    #[serde(default)]
    pub shell: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub processes: Vec<ProcessSpec>,
}

impl SupervisorConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        let parsed: SupervisorConfig =
            serde_yaml::from_str(text).context("malformed supervisor config")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.processes.clone()
    }

    fn validate(&self) -> Result<()> {
        for (idx, spec) in self.processes.iter().enumerate() {
            if spec.executable.trim().is_empty() {
                bail!("process #{} has an empty `cmd`", idx);
            }
        }
        Ok(())
    }
}



/*
    @@@
    @parser();
    . Reads the content of the YAML config into a String. Any I/O error (file not found, permission denied, etc.) is returned with the path as context.
    . Hands the raw YAML text to serde_yaml and rejects processes without an executable.
*/
pub fn parser(path: &str) -> Result<SupervisorConfig> {
    let yaml_file = fs::read_to_string(path)
        .with_context(|| format!("reading config file `{}`", path))?;
    SupervisorConfig::from_yaml(&yaml_file)
}
