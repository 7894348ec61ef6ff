use crate::engine::types::{AttributePath, FastMap};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::fs;
use std::path::Path;

/// Materializer settings shared by every plan built from one materializer.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct MaterializerConfig {
    /// Basis values sent per round trip for select-fetched correlations.
    pub default_batch_size: usize,
    /// Overrides keyed by attribute path, e.g. `"documents.owner"`.
    pub batch_sizes: FastMap<SmolStr, usize>,
    /// Nested multiset rows arrive as text and are parsed on read.
    pub textual_multisets: bool,
    pub filter_null_elements: bool,
    /// Alias of the root entity in projected expressions.
    pub root_alias: SmolStr,
}

impl Default for MaterializerConfig {
    fn default() -> Self {
        MaterializerConfig {
            default_batch_size: 1,
            batch_sizes: FastMap::default(),
            textual_multisets: false,
            filter_null_elements: true,
            root_alias: SmolStr::new_static("e"),
        }
    }
}

impl MaterializerConfig {
    /// Defaults, overridden from the environment.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Reads a JSON config file, then applies environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Failed to read materializer config: {:?}", path))?;
        let config: MaterializerConfig =
            serde_json::from_str(&content).context("Failed to parse materializer config")?;
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.default_batch_size = std::env::var("VIEWGRAPH_DEFAULT_BATCH_SIZE")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|size| *size > 0)
            .unwrap_or(self.default_batch_size);
        self.textual_multisets = std::env::var("VIEWGRAPH_MULTISET_TEXTUAL")
            .ok()
            .map(|s| matches!(s.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(self.textual_multisets);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_batch_size == 0 {
            anyhow::bail!("default_batch_size must be at least 1");
        }
        if let Some((path, _)) = self.batch_sizes.iter().find(|(_, size)| **size == 0) {
            anyhow::bail!("batch size for '{}' must be at least 1", path);
        }
        if self.root_alias.is_empty() {
            anyhow::bail!("root_alias must not be empty");
        }
        Ok(())
    }

    pub fn batch_size_for(&self, path: &AttributePath) -> Option<usize> {
        self.batch_sizes.get(path.as_str().as_str()).copied()
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"batch_sizes": {{"documents": 4}}, "root_alias": "p"}}"#).unwrap();
        let config = MaterializerConfig::load(file.path()).unwrap();
        assert_eq!(config.root_alias, "p");
        assert!(config.filter_null_elements);
        assert_eq!(config.batch_size_for(&AttributePath::new("documents")), Some(4));
        assert_eq!(config.batch_size_for(&AttributePath::new("other")), None);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"batch_sizes": {{"documents": 0}}}}"#).unwrap();
        let err = MaterializerConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("documents"));
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = MaterializerConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(err.to_string().contains("Failed to read materializer config"));
    }
}
