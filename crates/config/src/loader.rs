use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{env_subst::substitute_env, error::ConfigError, schema::KeywardConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "keyward.toml",
    "keyward.yaml",
    "keyward.yml",
    "keyward.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<KeywardConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./keyward.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/keyward/keyward.{toml,yaml,yml,json}` (user-global)
///
/// Returns `KeywardConfig::default()` if no config file is found. A file that
/// exists but fails to load is an error: falling back to defaults could point
/// the process at the wrong master key.
pub fn discover_and_load() -> Result<KeywardConfig, ConfigError> {
    match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            load_config(&path)
        },
        None => {
            debug!("no config file found, using defaults");
            Ok(KeywardConfig::default())
        },
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    // Project-local
    for name in CONFIG_FILENAMES {
        let p = PathBuf::from(name);
        if p.exists() {
            return Some(p);
        }
    }

    // User-global
    let config_dir = config_dir()?;
    CONFIG_FILENAMES
        .iter()
        .map(|name| config_dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/keyward/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "keyward").map(|d| d.config_dir().to_path_buf())
}

fn parse_config(raw: &str, path: &Path) -> Result<KeywardConfig, ConfigError> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let parse_err = |message: String| ConfigError::Parse {
        path: path.to_path_buf(),
        message,
    };

    match ext {
        "toml" => toml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| parse_err(e.to_string())),
        "json" => serde_json::from_str(raw).map_err(|e| parse_err(e.to_string())),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}
