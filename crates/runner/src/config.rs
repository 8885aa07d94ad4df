use std::env;
use std::path::PathBuf;

use sandbox::IsolateConfig;
use thiserror::Error;

pub const DEFAULT_LANGUAGES_PATH: &str = "./configs/languages.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be one of 1/0, true/false, yes/no (got {value:?})")]
    InvalidBool { name: &'static str, value: String },
    #[error("{name} must not be empty")]
    Empty { name: &'static str },
}

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub isolate: IsolateConfig,
    pub languages_path: PathBuf,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            isolate: IsolateConfig::default(),
            languages_path: PathBuf::from(DEFAULT_LANGUAGES_PATH),
        }
    }
}

impl RunnerConfig {
    /// Reads `ISOLATE_BIN`, `ISOLATE_CG`, `ISOLATE_META_DIR` and `ISORUN_LANGUAGES`.
    /// Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(bin) = non_empty(&lookup, "ISOLATE_BIN")? {
            config.isolate.executable = PathBuf::from(bin);
        }
        if let Some(value) = lookup("ISOLATE_CG") {
            config.isolate.use_cgroups = parse_bool("ISOLATE_CG", &value)?;
        }
        if let Some(dir) = non_empty(&lookup, "ISOLATE_META_DIR")? {
            config.isolate.meta_dir = PathBuf::from(dir);
        }
        if let Some(path) = non_empty(&lookup, "ISORUN_LANGUAGES")? {
            config.languages_path = PathBuf::from(path);
        }
        Ok(config)
    }
}

fn non_empty(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<String>, ConfigError> {
    match lookup(name) {
        Some(value) if value.trim().is_empty() => Err(ConfigError::Empty { name }),
        other => Ok(other),
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_without_variables() {
        let config = RunnerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.isolate.executable, PathBuf::from("isolate"));
        assert!(!config.isolate.use_cgroups);
        assert_eq!(config.languages_path, PathBuf::from(DEFAULT_LANGUAGES_PATH));
    }

    #[test]
    fn test_overrides() {
        let config = RunnerConfig::from_lookup(lookup(&[
            ("ISOLATE_BIN", "/usr/local/bin/isolate"),
            ("ISOLATE_CG", "Yes"),
            ("ISOLATE_META_DIR", "/var/run/isorun"),
            ("ISORUN_LANGUAGES", "/etc/isorun/languages.json"),
        ]))
        .unwrap();
        assert_eq!(
            config.isolate.executable,
            PathBuf::from("/usr/local/bin/isolate")
        );
        assert!(config.isolate.use_cgroups);
        assert_eq!(config.isolate.meta_dir, PathBuf::from("/var/run/isorun"));
        assert_eq!(
            config.languages_path,
            PathBuf::from("/etc/isorun/languages.json")
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = RunnerConfig::from_lookup(lookup(&[("ISOLATE_CG", "maybe")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidBool { name: "ISOLATE_CG", .. }));

        let err = RunnerConfig::from_lookup(lookup(&[("ISOLATE_BIN", "  ")])).unwrap_err();
        assert!(matches!(err, ConfigError::Empty { name: "ISOLATE_BIN" }));
    }
}
