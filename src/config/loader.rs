use crate::config::Config;
use crate::errors::NanobotError;
use crate::utils::get_nanobot_home;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub fn get_config_path() -> Result<PathBuf> {
    Ok(get_nanobot_home()?.join("config.json"))
}

/// Load configuration from `~/.nanobot/config.json` (or an explicit path).
/// A missing file yields defaults; a malformed file is an error.
pub fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let default_path = get_config_path().unwrap_or_else(|_| PathBuf::from("config.json"));
    let path = config_path.unwrap_or(default_path.as_path());

    if path.exists() {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        let config: Config = serde_json::from_str(&content).map_err(|e| {
            NanobotError::Config(format!("invalid JSON in {}: {}", path.display(), e))
        })?;
        return Ok(config);
    }

    Ok(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = load_config(Some(&tmp.path().join("absent.json"))).unwrap();
        assert!(!config.channels.discord.enabled);
    }

    #[test]
    fn test_load_from_explicit_path() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{"channels": {"discord": {"enabled": true, "token": "t"}}}"#,
        )
        .unwrap();
        let config = load_config(Some(&path)).unwrap();
        assert!(config.channels.discord.enabled);
        assert_eq!(config.channels.discord.token, "t");
    }

    #[test]
    fn test_malformed_json_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.json");
        fs::write(&path, "{not json").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("Configuration error"));
    }
}
