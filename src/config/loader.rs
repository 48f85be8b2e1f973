use std::path::{Path, PathBuf};

use tracing::debug;

use crate::config::types::JudgeletConfig;
use crate::error::{JudgeletError, Result};

/// Get the default configuration file path
pub fn get_config_path() -> PathBuf {
    if let Some(proj_dirs) = directories::ProjectDirs::from("com", "judgelet", "judgelet") {
        proj_dirs.config_dir().join("config.toml")
    } else {
        // Fallback to home directory
        dirs_fallback().join(".judgelet").join("config.toml")
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Load configuration from file, with defaults for missing values.
///
/// An explicitly requested path must exist; the default location may be absent.
pub fn load_config(config_path: Option<&Path>) -> Result<JudgeletConfig> {
    let explicit = config_path.is_some();
    let path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(get_config_path);

    if !path.exists() {
        if explicit {
            return Err(JudgeletError::ConfigNotFound {
                path: path.display().to_string(),
            });
        }
        // Return defaults if no config file exists
        return Ok(JudgeletConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config = parse_config(&content)?;
    debug!(path = %path.display(), "Loaded configuration");

    Ok(config)
}

/// Parse and validate a TOML configuration document
pub fn parse_config(content: &str) -> Result<JudgeletConfig> {
    let config: JudgeletConfig =
        toml::from_str(content).map_err(|e| JudgeletError::TomlParse(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
