use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;

/// Top-level `weft.toml` contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub tree: TreeOptions,
}

/// Behavior switches for a causal tree replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Archive superseded value atoms after each mutation or batch.
    #[serde(default = "default_true")]
    pub garbage_collection: bool,
    /// Hold atoms whose cause is missing until the cause arrives.
    #[serde(default = "default_true")]
    pub buffer_orphans: bool,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            garbage_collection: default_true(),
            buffer_orphans: default_true(),
        }
    }
}

impl TreeOptions {
    /// Options with garbage collection switched off.
    #[must_use]
    pub fn without_gc() -> Self {
        Self {
            garbage_collection: false,
            ..Self::default()
        }
    }
}

/// Parse a config from TOML text.
///
/// # Errors
///
/// Returns an error when the text is not valid TOML for [`WeftConfig`].
pub fn parse_config(content: &str) -> Result<WeftConfig> {
    toml::from_str::<WeftConfig>(content).context("Failed to parse weft config")
}

/// Load a config file, falling back to defaults when it does not exist.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed.
pub fn load_config(path: &Path) -> Result<WeftConfig> {
    if !path.exists() {
        return Ok(WeftConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<WeftConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Resolve the effective tree options: config file first, then the `WEFT_GC`
/// environment override.
///
/// # Errors
///
/// Returns an error when the config file cannot be loaded.
pub fn resolve_tree_options(config_path: Option<&Path>) -> Result<TreeOptions> {
    let config = match config_path {
        Some(path) => load_config(path)?,
        None => WeftConfig::default(),
    };
    Ok(apply_gc_override(config.tree, env::var("WEFT_GC").ok()))
}

fn apply_gc_override(mut options: TreeOptions, env_gc: Option<String>) -> TreeOptions {
    match env_gc.as_deref().map(|raw| raw.trim().to_ascii_lowercase()) {
        Some(value) if matches!(value.as_str(), "0" | "off" | "false" | "no") => {
            options.garbage_collection = false;
        }
        Some(value) if matches!(value.as_str(), "1" | "on" | "true" | "yes") => {
            options.garbage_collection = true;
        }
        Some(value) => {
            tracing::warn!(value, "ignoring unrecognized WEFT_GC value");
        }
        None => {}
    }
    options
}

const fn default_true() -> bool {
    true
}
