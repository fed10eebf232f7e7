//! Configuration loaded from environment variables.
//!
//! Unset variables fall back to defaults; set but unparsable variables are
//! an error rather than silently ignored.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;

use crate::lifecycle::LeadTimePolicy;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_PATH: &str = "sqlite:gestparc.db?mode=rwc";

/// Default capacity of the push channel per subscriber.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

pub const DEFAULT_API_URL: &str = "http://localhost:3000";

/// Settings of the reference service.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub database_url: String,
    pub lead_time: LeadTimePolicy,
    pub event_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: DEFAULT_DB_PATH.to_string(),
            lead_time: LeadTimePolicy::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl ServerConfig {
    /// Read `GESTPARC_PORT`, `GESTPARC_DATABASE_URL`, `GESTPARC_LEAD_DAYS`
    /// (`urgent,normale,basse`) and `GESTPARC_EVENT_BUFFER`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let lead_time = match lookup("GESTPARC_LEAD_DAYS") {
            Some(value) => parse_lead_days(&value)?,
            None => defaults.lead_time,
        };

        let event_buffer: usize =
            parse_or("GESTPARC_EVENT_BUFFER", &lookup, defaults.event_buffer)?;
        if event_buffer == 0 {
            anyhow::bail!("GESTPARC_EVENT_BUFFER must be positive");
        }

        Ok(Self {
            port: parse_or("GESTPARC_PORT", &lookup, defaults.port)?,
            database_url: lookup("GESTPARC_DATABASE_URL").unwrap_or(defaults.database_url),
            lead_time,
            event_buffer,
        })
    }
}

/// Settings of a client session.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    pub reconnect_delay: Duration,
    pub lead_time: LeadTimePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            request_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(3),
            lead_time: LeadTimePolicy::default(),
        }
    }
}

impl ClientConfig {
    /// Read `GESTPARC_API_URL`, `GESTPARC_HTTP_TIMEOUT_SECS`,
    /// `GESTPARC_RECONNECT_SECS` and `GESTPARC_LEAD_DAYS`.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let lead_time = match lookup("GESTPARC_LEAD_DAYS") {
            Some(value) => parse_lead_days(&value)?,
            None => defaults.lead_time,
        };

        Ok(Self {
            base_url: lookup("GESTPARC_API_URL").unwrap_or(defaults.base_url),
            request_timeout: Duration::from_secs(parse_or(
                "GESTPARC_HTTP_TIMEOUT_SECS",
                &lookup,
                defaults.request_timeout.as_secs(),
            )?),
            reconnect_delay: Duration::from_secs(parse_or(
                "GESTPARC_RECONNECT_SECS",
                &lookup,
                defaults.reconnect_delay.as_secs(),
            )?),
            lead_time,
        })
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {value:?}")),
        None => Ok(default),
    }
}

/// Parse `"urgent,normale,basse"` minimum lead times in days.
pub fn parse_lead_days(value: &str) -> anyhow::Result<LeadTimePolicy> {
    let days = value
        .split(',')
        .map(|part| part.trim().parse::<i64>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("invalid GESTPARC_LEAD_DAYS: {value:?}"))?;

    match days.as_slice() {
        [urgent, normale, basse] => LeadTimePolicy::new(*urgent, *normale, *basse),
        _ => anyhow::bail!("GESTPARC_LEAD_DAYS expects three values (urgent,normale,basse), got {value:?}"),
    }
}
