use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::postgres::{DEFAULT_QUESTION_TABLE, DEFAULT_RECORD_TABLE};

pub const DEFAULT_API_URL: &str = "http://localhost:8000";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{var} is not a valid URL ({value}): {reason}")]
    InvalidUrl {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings shared by the service and the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct ScreeningConfig {
    pub api_url: String,
    pub database_url: Option<String>,
    pub question_table: String,
    pub questionnaire_table: String,
    pub request_timeout: Duration,
    pub credential_path: PathBuf,
    pub port: u16,
}

impl ScreeningConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_url = get("SCREENING_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        if let Err(e) = reqwest::Url::parse(&api_url) {
            return Err(ConfigError::InvalidUrl {
                var: "SCREENING_API_URL",
                value: api_url,
                reason: e.to_string(),
            });
        }

        let credential_path = get("CREDENTIAL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| default_credential_path(get("HOME")));

        Ok(Self {
            api_url,
            database_url: get("DATABASE_URL"),
            question_table: get("QUESTION_TABLE")
                .unwrap_or_else(|| DEFAULT_QUESTION_TABLE.to_string()),
            questionnaire_table: get("QUESTIONNAIRE_TABLE")
                .unwrap_or_else(|| DEFAULT_RECORD_TABLE.to_string()),
            request_timeout: Duration::from_secs(parse_or(
                "REQUEST_TIMEOUT_SECS",
                get("REQUEST_TIMEOUT_SECS"),
                DEFAULT_TIMEOUT_SECS,
            )),
            credential_path,
            port: parse_or("PORT", get("PORT"), DEFAULT_PORT),
        })
    }
}

impl Default for ScreeningConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            database_url: None,
            question_table: DEFAULT_QUESTION_TABLE.to_string(),
            questionnaire_table: DEFAULT_RECORD_TABLE.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            credential_path: default_credential_path(None),
            port: DEFAULT_PORT,
        }
    }
}

fn default_credential_path(home: Option<String>) -> PathBuf {
    let base = home.map(PathBuf::from).unwrap_or_default();
    base.join(".dermascreen").join("credential.json")
}

fn parse_or<T>(name: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + Copy + PartialOrd + Default + std::fmt::Display,
{
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) if value > T::default() => value,
            _ => {
                warn!("Ignoring invalid {}={:?}, using {}", name, raw, default);
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<ScreeningConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ScreeningConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let cfg = config(&[("HOME", "/home/pat")]).unwrap();
        assert_eq!(cfg.api_url, DEFAULT_API_URL);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.question_table, "question_definitions");
        assert_eq!(cfg.questionnaire_table, "mole_questionnaires");
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(
            cfg.credential_path,
            PathBuf::from("/home/pat/.dermascreen/credential.json")
        );
        assert_eq!(cfg.port, 3000);
    }

    #[test]
    fn explicit_values_win() {
        let cfg = config(&[
            ("SCREENING_API_URL", "https://api.dermascreen.test"),
            ("DATABASE_URL", "postgres://db/screening"),
            ("REQUEST_TIMEOUT_SECS", "5"),
            ("CREDENTIAL_PATH", "/tmp/cred.json"),
            ("PORT", "8080"),
        ])
        .unwrap();
        assert_eq!(cfg.api_url, "https://api.dermascreen.test");
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://db/screening"));
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.credential_path, PathBuf::from("/tmp/cred.json"));
        assert_eq!(cfg.port, 8080);
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let cfg = config(&[("REQUEST_TIMEOUT_SECS", "soon"), ("PORT", "0")]).unwrap();
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.port, 3000);
    }

    #[test]
    fn bad_url_is_an_error() {
        let err = config(&[("SCREENING_API_URL", "not a url")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidUrl {
                var: "SCREENING_API_URL",
                ..
            }
        ));
    }
}
