//! Runtime configuration.
//!
//! Everything comes from the environment so the library can be embedded
//! without a config file; the binary layers command line flags on top.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub const API_URL_VAR: &str = "CUTOUT_API_URL";
pub const API_KEY_VAR: &str = "CUTOUT_API_KEY";
pub const API_TIMEOUT_VAR: &str = "CUTOUT_API_TIMEOUT_SECS";
pub const DB_PATH_VAR: &str = "CUTOUT_DB";

/// Where and how to reach the background removal service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoverConfig {
    pub endpoint: String,
    pub api_key: String,
    /// No timeout unless set: a hung request stays pending.
    pub timeout: Option<Duration>,
}

impl RemoverConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Read `CUTOUT_API_URL`, `CUTOUT_API_KEY` and the optional
    /// `CUTOUT_API_TIMEOUT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(name))
        };

        let mut config = Self::new(required(API_URL_VAR)?, required(API_KEY_VAR)?);
        if let Some(raw) = lookup(API_TIMEOUT_VAR) {
            let secs: u64 = raw.trim().parse().map_err(|e| ConfigError::Invalid {
                name: API_TIMEOUT_VAR,
                message: format!("{}", e),
            })?;
            config.timeout = Some(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

/// Location of the library database.
///
/// `CUTOUT_DB` wins; otherwise the platform data directory is used:
/// - Linux: ~/.local/share/cutout/library.db
/// - macOS: ~/Library/Application Support/cutout/library.db
/// - Windows: %APPDATA%\cutout\library.db
pub fn default_db_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = std::env::var_os(DB_PATH_VAR) {
        return Ok(PathBuf::from(path));
    }

    let mut path = dirs::data_dir()
        .or_else(dirs::home_dir)
        .ok_or(ConfigError::Missing("user data directory"))?;
    path.push("cutout");
    path.push("library.db");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_remover_config_from_vars() {
        let config = RemoverConfig::from_lookup(lookup(&[
            (API_URL_VAR, "https://example.test/remove"),
            (API_KEY_VAR, "secret"),
        ]))
        .unwrap();

        assert_eq!(config, RemoverConfig::new("https://example.test/remove", "secret"));
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn test_timeout_is_parsed() {
        let config = RemoverConfig::from_lookup(lookup(&[
            (API_URL_VAR, "http://localhost"),
            (API_KEY_VAR, "k"),
            (API_TIMEOUT_VAR, " 30 "),
        ]))
        .unwrap();
        assert_eq!(config.timeout, Some(Duration::from_secs(30)));

        let err = RemoverConfig::from_lookup(lookup(&[
            (API_URL_VAR, "http://localhost"),
            (API_KEY_VAR, "k"),
            (API_TIMEOUT_VAR, "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: API_TIMEOUT_VAR, .. }));
    }

    #[test]
    fn test_missing_or_blank_values_are_errors() {
        let err = RemoverConfig::from_lookup(lookup(&[(API_URL_VAR, "http://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(API_KEY_VAR)));

        let err = RemoverConfig::from_lookup(lookup(&[(API_URL_VAR, " "), (API_KEY_VAR, "k")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Missing(API_URL_VAR)));
    }
}
