//! System-wide configuration: host aliases and the default fetch policy.
//!
//! The engine itself never reads config; commands load it, hand the alias
//! map to the fetcher service, and use the policy as the fallback for
//! `--fetch-policy`.

use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use maru2_models::Alias;
use serde::Deserialize;
use thiserror::Error;

use crate::fetch::FetchPolicy;

const CONFIG_CANDIDATES: &[&str] = &[".maru2/config.yaml", ".maru2/config.yml"];

/// The resolved system configuration.
#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// System-level aliases, shadowed by workflow-level ones.
    #[serde(default)]
    pub aliases: IndexMap<String, Alias>,

    /// The fetch policy used when the command line doesn't set one.
    #[serde(default)]
    pub fetch_policy: Option<FetchPolicy>,
}

/// A configuration file failed to load.
#[derive(Debug, Error)]
#[error("configuration error in {path}")]
pub struct ConfigError {
    /// The path of the offending file.
    path: String,
    #[source]
    source: ConfigErrorInner,
}

#[derive(Debug, Error)]
enum ConfigErrorInner {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration syntax")]
    Syntax(#[from] serde_yaml::Error),
}

/// Loads the user's configuration, if one exists. A missing file is an
/// empty configuration, not an error.
pub fn load() -> Result<Config, ConfigError> {
    let Ok(home) = etcetera::home_dir() else {
        return Ok(Config::default());
    };

    for candidate in CONFIG_CANDIDATES {
        let path = home.join(candidate);
        if path.exists() {
            return load_from(&path);
        }
    }

    Ok(Config::default())
}

/// Loads configuration from an explicit path.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let wrap = |source: ConfigErrorInner| ConfigError {
        path: path.display().to_string(),
        source,
    };

    let bytes = fs::read(path).map_err(|e| wrap(e.into()))?;
    serde_yaml::from_slice(&bytes).map_err(|e| wrap(e.into()))
}

/// The default content-store directory: `./.maru2/store` when a local
/// `.maru2` directory exists, the home-scoped one otherwise.
pub fn default_store_dir() -> PathBuf {
    let local = Path::new(".maru2");
    if local.is_dir() {
        return local.join("store");
    }

    match etcetera::home_dir() {
        Ok(home) => home.join(".maru2").join("store"),
        Err(_) => local.join("store"),
    }
}
