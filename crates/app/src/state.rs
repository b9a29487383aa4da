use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use common::materialize::DEFAULT_CONCURRENCY;
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::modules::preference_credentials::Patterns;

pub const APP_NAME: &str = "bft";
pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Upper bound on records reconstructed at the same time
    pub materialize_concurrency: usize,
    /// Default log level when `RUST_LOG` and `--log-level` are unset
    pub log_level: String,
    pub modules: ModulesConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            materialize_concurrency: DEFAULT_CONCURRENCY,
            log_level: "info".to_string(),
            modules: ModulesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModulesConfig {
    /// Built-in modules that never run
    pub disabled: Vec<String>,
    pub preference_credentials: Patterns,
}

impl AppConfig {
    /// The default config directory (~/.bft)
    pub fn config_dir() -> Result<PathBuf, StateError> {
        let home = dirs::home_dir().ok_or(StateError::NoHomeDirectory)?;
        Ok(home.join(format!(".{}", APP_NAME)))
    }

    /// Load configuration from `custom_path`, or from `~/.bft/config.toml`.
    ///
    /// An explicit path must exist. The default location is optional and
    /// falls back to built-in defaults.
    pub fn load(custom_path: Option<&Path>) -> Result<Self, StateError> {
        match custom_path {
            Some(path) => {
                if !path.exists() {
                    return Err(StateError::MissingFile(path.to_path_buf()));
                }
                Self::from_file(path)
            }
            None => {
                let path = Self::config_dir()?.join(CONFIG_FILE_NAME);
                if path.exists() {
                    Self::from_file(&path)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    fn from_file(path: &Path) -> Result<Self, StateError> {
        let config_toml = fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&config_toml)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), StateError> {
        if self.materialize_concurrency == 0 {
            return Err(StateError::Invalid(
                "materialize_concurrency must be at least 1".to_string(),
            ));
        }
        parse_level(&self.log_level)?;
        Ok(())
    }

    pub fn level(&self) -> Result<Level, StateError> {
        parse_level(&self.log_level)
    }
}

pub fn parse_level(level: &str) -> Result<Level, StateError> {
    Level::from_str(level).map_err(|_| StateError::InvalidLogLevel(level.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("no home directory found")]
    NoHomeDirectory,

    #[error("config file not found: {0}")]
    MissingFile(PathBuf),

    #[error("invalid log level: {0}")]
    InvalidLogLevel(String),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "").unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.materialize_concurrency, 8);
        assert_eq!(config.level().unwrap(), Level::INFO);
        assert!(config.modules.disabled.is_empty());
        assert!(!config.modules.preference_credentials.password_keys.is_empty());
    }

    #[test]
    fn test_partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"
materialize_concurrency = 2
log_level = "debug"

[modules]
disabled = ["preference-credentials"]

[modules.preference_credentials]
token_keys = ["session"]
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.materialize_concurrency, 2);
        assert_eq!(config.level().unwrap(), Level::DEBUG);
        assert_eq!(config.modules.disabled, vec!["preference-credentials"]);
        let patterns = &config.modules.preference_credentials;
        assert_eq!(patterns.token_keys, vec!["session"]);
        assert_eq!(patterns.password_keys, Patterns::default().password_keys);
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let result = AppConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(StateError::MissingFile(_))));
    }

    #[test]
    fn test_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        fs::write(&path, "materialize_concurrency = 0").unwrap();
        assert!(matches!(
            AppConfig::load(Some(&path)),
            Err(StateError::Invalid(_))
        ));

        fs::write(&path, "log_level = \"loud\"").unwrap();
        assert!(matches!(
            AppConfig::load(Some(&path)),
            Err(StateError::InvalidLogLevel(_))
        ));

        fs::write(&path, "materialize_concurrency = \"many\"").unwrap();
        assert!(matches!(
            AppConfig::load(Some(&path)),
            Err(StateError::TomlDe(_))
        ));
    }
}
