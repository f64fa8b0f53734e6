use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

/// One external program to supervise.
///
/// Immutable once handed to the supervisor; every launch attempt of the same
/// lineage shares it through an `Arc`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    #[serde(rename = "cmd")]
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// `None` inherits the supervisor's environment; `Some` replaces it.
    #[serde(default)]
    pub env: Option<HashMap<String, String>>,
}

impl ProcessSpec {
    pub fn new<I, S>(executable: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            executable: executable.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: None,
        }
    }

    pub fn with_env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }
}

impl fmt::Display for ProcessSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
