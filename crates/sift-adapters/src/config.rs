//! User configuration for sift
//!
//! Stored in ~/.config/sift/config.json. Environment variables override the
//! file for the capability commands and the API endpoint.

use crate::util::split_command_line;
use serde::{Deserialize, Serialize};
use sift_core::duplicates::DEFAULT_DUPLICATE_THRESHOLD;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const EVALUATOR_CMD_ENV: &str = "SIFT_EVALUATOR_CMD";
pub const FIXER_CMD_ENV: &str = "SIFT_FIXER_CMD";
pub const GITHUB_API_URL_ENV: &str = "SIFT_GITHUB_API_URL";

const DEFAULT_CAPABILITY_TIMEOUT_SECS: u64 = 900;
const DEFAULT_CONTEXT_RADIUS: usize = 8;
pub const DEFAULT_GITHUB_API_URL: &str = "https://api.github.com";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// argv of the evaluator capability
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub evaluator_command: Vec<String>,
    /// argv of the fixer capability
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fixer_command: Vec<String>,
    pub capability_timeout_secs: u64,
    pub duplicate_threshold: f64,
    /// Lines of source shown either side of an item's location.
    pub context_radius: usize,
    pub github_api_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            evaluator_command: Vec::new(),
            fixer_command: Vec::new(),
            capability_timeout_secs: DEFAULT_CAPABILITY_TIMEOUT_SECS,
            duplicate_threshold: DEFAULT_DUPLICATE_THRESHOLD,
            context_radius: DEFAULT_CONTEXT_RADIUS,
            github_api_url: DEFAULT_GITHUB_API_URL.to_string(),
        }
    }
}

impl Config {
    fn sanitize(&mut self) {
        if self.capability_timeout_secs == 0 {
            self.capability_timeout_secs = DEFAULT_CAPABILITY_TIMEOUT_SECS;
        }
        if !self.duplicate_threshold.is_finite() {
            self.duplicate_threshold = DEFAULT_DUPLICATE_THRESHOLD;
        }
        self.duplicate_threshold = self.duplicate_threshold.clamp(0.0, 1.0);
        self.evaluator_command.retain(|arg| !arg.trim().is_empty());
        self.fixer_command.retain(|arg| !arg.trim().is_empty());
        let trimmed = self.github_api_url.trim().trim_end_matches('/');
        self.github_api_url = if trimmed.is_empty() {
            DEFAULT_GITHUB_API_URL.to_string()
        } else {
            trimmed.to_string()
        };
    }

    fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("sift"))
    }

    fn config_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("config.json"))
    }

    /// Load from the default location with env overrides applied.
    pub fn load() -> Self {
        let mut config = Self::config_path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default();
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config
    }

    /// Load a config file, falling back to defaults. A file that fails to
    /// parse is moved aside to `config.json.corrupt`.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Config>(&content) {
            Ok(mut config) => {
                config.sanitize();
                config
            }
            Err(err) => {
                preserve_corrupt_config(path, &content);
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file was corrupt; a backup was saved and defaults were loaded"
                );
                Self::default()
            }
        }
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        if let Some(raw) = non_empty(EVALUATOR_CMD_ENV) {
            self.evaluator_command = split_command_line(&raw);
        }
        if let Some(raw) = non_empty(FIXER_CMD_ENV) {
            self.fixer_command = split_command_line(&raw);
        }
        if let Some(url) = non_empty(GITHUB_API_URL_ENV) {
            self.github_api_url = url;
        }
        self.sanitize();
    }

    pub fn capability_timeout(&self) -> Duration {
        Duration::from_secs(self.capability_timeout_secs)
    }
}

fn preserve_corrupt_config(path: &Path, content: &str) {
    let corrupt_path = path.with_extension("json.corrupt");
    if fs::rename(path, &corrupt_path).is_err() {
        let _ = fs::write(&corrupt_path, content);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_fields_take_defaults() {
        let parsed: Config = serde_json::from_str(r#"{"context_radius": 3}"#).unwrap();
        assert_eq!(parsed.context_radius, 3);
        assert_eq!(parsed.capability_timeout_secs, 900);
        assert_eq!(parsed.github_api_url, DEFAULT_GITHUB_API_URL);
        assert!(parsed.evaluator_command.is_empty());
    }

    #[test]
    fn corrupt_file_is_preserved_and_defaults_used() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config, Config::default());
        assert!(!path.exists());
        assert_eq!(
            fs::read_to_string(dir.path().join("config.json.corrupt")).unwrap(),
            "{ nope"
        );
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            (EVALUATOR_CMD_ENV, "python3 eval.py --strict"),
            (GITHUB_API_URL_ENV, "https://ghe.example.com/api/v3/"),
            (FIXER_CMD_ENV, "   "),
        ]);
        let mut config = Config {
            fixer_command: vec!["./fix".to_string()],
            ..Config::default()
        };
        config.apply_env_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(
            config.evaluator_command,
            vec!["python3", "eval.py", "--strict"]
        );
        assert_eq!(config.fixer_command, vec!["./fix"]);
        assert_eq!(config.github_api_url, "https://ghe.example.com/api/v3");
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = Config {
            duplicate_threshold: 4.0,
            capability_timeout_secs: 0,
            ..Config::default()
        };
        config.sanitize();
        assert_eq!(config.duplicate_threshold, 1.0);
        assert_eq!(config.capability_timeout_secs, 900);
    }
}
