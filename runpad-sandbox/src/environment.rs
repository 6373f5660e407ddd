//! Environment handed to supervised processes
//!
//! Children start from an empty environment. Only the variables built here
//! are visible to them, so secrets held by the service never leak into
//! generated code.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// `PATH` for children (None = inherit the service's `PATH`)
    pub path: Option<String>,

    /// Variables copied from the service environment when present
    pub passthrough: Vec<String>,

    /// Fixed variables, applied last
    pub set: BTreeMap<String, String>,
}

impl EnvironmentConfig {
    /// Build the full environment for a process running in `workspace`
    ///
    /// `python_path` is prepended to `PYTHONPATH` when set.
    pub fn build(&self, workspace: &Path, python_path: Option<&Path>) -> Vec<(String, String)> {
        let workspace = workspace.to_string_lossy().into_owned();
        let path = self
            .path
            .clone()
            .or_else(|| std::env::var("PATH").ok())
            .unwrap_or_else(|| FALLBACK_PATH.to_string());

        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert("PATH".into(), path);
        env.insert("HOME".into(), workspace.clone());
        env.insert("TMPDIR".into(), workspace);
        env.insert("LANG".into(), "C.UTF-8".into());
        env.insert("LC_ALL".into(), "C.UTF-8".into());
        env.insert("PYTHONUNBUFFERED".into(), "1".into());
        env.insert("PYTHONDONTWRITEBYTECODE".into(), "1".into());
        env.insert("MPLBACKEND".into(), "Agg".into());
        if let Some(dir) = python_path {
            env.insert("PYTHONPATH".into(), dir.to_string_lossy().into_owned());
        }

        for name in &self.passthrough {
            if let Ok(value) = std::env::var(name) {
                env.insert(name.clone(), value);
            }
        }
        for (name, value) in &self.set {
            if name == "PYTHONPATH" {
                if let Some(existing) = env.get_mut(name) {
                    existing.push(':');
                    existing.push_str(value);
                    continue;
                }
            }
            env.insert(name.clone(), value.clone());
        }

        env.into_iter().collect()
    }
}
