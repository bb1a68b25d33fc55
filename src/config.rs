use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::path::PathBuf;
use std::time::Duration;

use crate::services::credentials::CredentialSource;
use crate::time::{host_timezone, parse_timezone};

const DEFAULT_API_BASE: &str = "https://api.bringyour.com";
const DEFAULT_ENV_FILE: &str = ".env";
const DEFAULT_DATABASE_PATH: &str = "transfer_stats.db";

#[derive(Debug, Clone)]
pub struct StatsConfig {
    pub credentials: CredentialSource,
    pub configured_token: Option<String>,
    pub env_file: PathBuf,
    pub database_path: PathBuf,
    pub api_base: String,
    pub http_timeout: Duration,
    pub fetch_interval_minutes: u32,
    pub schedule_timezone: Tz,
    pub display_timezone: Tz,
}

impl StatsConfig {
    /// Loads the `.env` file named by `UR_ENV_FILE` (if present) and then reads the process
    /// environment. Variables already set in the environment are not overridden by the file.
    pub fn from_env() -> Result<Self> {
        let env_file = PathBuf::from(env_string("UR_ENV_FILE", DEFAULT_ENV_FILE));
        match dotenvy::from_path(&env_file) {
            Ok(()) => tracing::debug!(path = %env_file.display(), "loaded env file"),
            Err(err) if err.not_found() => {
                tracing::debug!(
                    path = %env_file.display(),
                    "no env file; using process environment"
                )
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to load {}", env_file.display()))
            }
        }
        Self::from_lookup(env_file, |key| std::env::var(key).ok())
    }

    fn from_lookup(env_file: PathBuf, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let configured_token = get("UR_JWT");
        let credentials = credential_source(
            get("UR_USER"),
            get("UR_PASS"),
            configured_token.is_some(),
        )?;

        let database_path = get("UR_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
        let api_base = get("UR_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        if !(api_base.starts_with("http://") || api_base.starts_with("https://")) {
            anyhow::bail!("UR_API_BASE must be an http(s) URL, got {api_base:?}");
        }

        let http_timeout_seconds = parse_or(
            "UR_HTTP_TIMEOUT_SECONDS",
            get("UR_HTTP_TIMEOUT_SECONDS"),
            60u64,
        )?;
        if http_timeout_seconds == 0 {
            anyhow::bail!("UR_HTTP_TIMEOUT_SECONDS must be greater than zero");
        }

        let fetch_interval_minutes = parse_or(
            "UR_FETCH_INTERVAL_MINUTES",
            get("UR_FETCH_INTERVAL_MINUTES"),
            15u32,
        )?;
        if fetch_interval_minutes == 0 || 60 % fetch_interval_minutes != 0 {
            anyhow::bail!(
                "UR_FETCH_INTERVAL_MINUTES must divide an hour evenly, got {fetch_interval_minutes}"
            );
        }

        let schedule_timezone = match get("UR_SCHEDULE_TIMEZONE") {
            Some(value) => parse_timezone(&value)
                .map_err(anyhow::Error::msg)
                .context("invalid UR_SCHEDULE_TIMEZONE")?,
            None => Tz::UTC,
        };
        let display_timezone = match get("UR_DISPLAY_TIMEZONE") {
            Some(value) => parse_timezone(&value)
                .map_err(anyhow::Error::msg)
                .context("invalid UR_DISPLAY_TIMEZONE")?,
            None => host_timezone(),
        };

        Ok(Self {
            credentials,
            configured_token,
            env_file,
            database_path,
            api_base,
            http_timeout: Duration::from_secs(http_timeout_seconds),
            fetch_interval_minutes,
            schedule_timezone,
            display_timezone,
        })
    }
}

fn credential_source(
    username: Option<String>,
    password: Option<String>,
    has_token: bool,
) -> Result<CredentialSource> {
    match (username, password) {
        (Some(username), Some(password)) => Ok(CredentialSource::Password { username, password }),
        (Some(_), None) => anyhow::bail!("UR_USER is set but UR_PASS is missing"),
        (None, Some(_)) => anyhow::bail!("UR_PASS is set but UR_USER is missing"),
        (None, None) if has_token => Ok(CredentialSource::TokenOnly),
        (None, None) => {
            anyhow::bail!("no credentials configured: set UR_USER and UR_PASS, or UR_JWT")
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("invalid {key} {raw:?}: {err}")),
        None => Ok(default),
    }
}
