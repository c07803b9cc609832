//! Config-file path resolution and TOML loading shared by every binary in
//! the workspace.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Resolve the configuration file path from, in order: an explicit CLI flag
/// value, an environment variable, then a default path.
pub fn resolve_path(cli_value: Option<&str>, env_var: &str, default: &str) -> PathBuf {
    if let Some(path) = cli_value {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var(env_var) {
        return PathBuf::from(path);
    }
    PathBuf::from(default)
}

/// Scan CLI args for `--config <path>` the way the service binaries do.
pub fn cli_config_flag(args: &[String]) -> Option<&str> {
    args.iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

/// Load and deserialize a TOML config file.
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(path)?;
    toml::from_str(&contents).map_err(Error::Toml)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn resolve_path_prefers_cli_flag() {
        let path = resolve_path(Some("/cli/path.toml"), "CCPROXY_CONFIG_NOPE", "/default.toml");
        assert_eq!(path, PathBuf::from("/cli/path.toml"));
    }

    #[test]
    fn resolve_path_falls_back_to_default() {
        let path = resolve_path(None, "CCPROXY_CONFIG_DOES_NOT_EXIST_ENV", "/default.toml");
        assert_eq!(path, PathBuf::from("/default.toml"));
    }

    #[test]
    fn cli_config_flag_finds_value_after_flag() {
        let args: Vec<String> = vec!["bin".into(), "--config".into(), "/tmp/x.toml".into()];
        assert_eq!(cli_config_flag(&args), Some("/tmp/x.toml"));
    }

    #[test]
    fn cli_config_flag_absent_returns_none() {
        let args: Vec<String> = vec!["bin".into()];
        assert_eq!(cli_config_flag(&args), None);
    }

    #[test]
    fn load_toml_parses_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        std::fs::write(&path, "name = \"demo\"\ncount = 3\n").unwrap();
        let parsed: Sample = load_toml(&path).unwrap();
        assert_eq!(parsed.name, "demo");
        assert_eq!(parsed.count, 3);
    }

    #[test]
    fn load_toml_missing_file_is_io_error() {
        let result: Result<Sample> = load_toml(Path::new("/nonexistent/path.toml"));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
