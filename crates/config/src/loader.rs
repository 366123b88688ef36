use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::JobkitConfig,
};

/// Standard config file names, checked in order.
pub const CONFIG_FILENAMES: &[&str] = &["jobkit.toml", "jobkit.yaml", "jobkit.yml", "jobkit.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<JobkitConfig> {
    let raw = read(path)?;
    parse_config(&substitute_env(&raw), path)
}

/// Load the config as an untyped value, for unknown-field checks.
pub fn load_config_value(path: &Path) -> Result<serde_json::Value> {
    let raw = read(path)?;
    parse_config_value(&substitute_env(&raw), path)
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./jobkit.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/jobkit/jobkit.{toml,yaml,yml,json}` (user-global)
///
/// Returns `None` when no file exists. A file that exists but fails to
/// parse is an error.
pub fn discover_and_load() -> Result<Option<(PathBuf, JobkitConfig)>> {
    let Some(path) = find_config_file() else {
        debug!("no config file found");
        return Ok(None);
    };
    debug!(path = %path.display(), "loading config");
    let config = load_config(&path)?;
    Ok(Some((path, config)))
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    find_in(Path::new(".")).or_else(|| config_dir().and_then(|dir| find_in(&dir)))
}

fn find_in(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/jobkit/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "jobkit").map(|d| d.config_dir().to_path_buf())
}

fn extension(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("toml")
}

/// Parse config text, picking the format from the file extension.
pub fn parse_config(raw: &str, path: &Path) -> Result<JobkitConfig> {
    match extension(path) {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        ext => Err(Error::UnsupportedFormat {
            ext: ext.to_string(),
        }),
    }
}

pub(crate) fn parse_config_value(raw: &str, path: &Path) -> Result<serde_json::Value> {
    match extension(path) {
        "toml" => {
            let v: toml::Value = toml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "json" => Ok(serde_json::from_str(raw)?),
        ext => Err(Error::UnsupportedFormat {
            ext: ext.to_string(),
        }),
    }
}
