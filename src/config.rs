use std::time::Duration;

use url::Url;

use crate::error::{Error, Result};
use crate::storage::repository;
use crate::storage::Database;

/// Environment variable that overrides the stored endpoint.
pub const ENDPOINT_ENV: &str = "FORMSYNC_ENDPOINT";

pub const KEY_ENDPOINT: &str = "endpoint";
pub const KEY_REQUEST_TIMEOUT: &str = "request_timeout_secs";
pub const KEY_MAX_RETRIES: &str = "max_retries";
pub const KEY_SYNC_INTERVAL: &str = "sync_interval_secs";
pub const KEY_PROBE_INTERVAL: &str = "probe_interval_secs";
pub const KEY_MAX_BACKOFF: &str = "max_backoff_secs";

/// Upper bound for every duration setting, in seconds.
pub const MAX_DURATION_SECS: u64 = 86_400;

pub const KNOWN_KEYS: &[&str] = &[
    KEY_ENDPOINT,
    KEY_REQUEST_TIMEOUT,
    KEY_MAX_RETRIES,
    KEY_SYNC_INTERVAL,
    KEY_PROBE_INTERVAL,
    KEY_MAX_BACKOFF,
];

/// Runtime settings for one client session.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Where responses are POSTed. Batches go to `<endpoint>/batch`.
    pub endpoint: Option<Url>,
    pub request_timeout: Duration,
    /// Failed attempts before an entry is parked for manual review.
    pub max_retries: u32,
    /// Periodic sync while online. `None` disables the timer.
    pub sync_interval: Option<Duration>,
    pub probe_interval: Duration,
    pub max_backoff: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: None,
            request_timeout: Duration::from_secs(10),
            max_retries: 5,
            sync_interval: Some(Duration::from_secs(60)),
            probe_interval: Duration::from_secs(15),
            max_backoff: Duration::from_secs(900),
        }
    }
}

impl Settings {
    /// Load from `app_config`, falling back to defaults for unset keys. The
    /// `FORMSYNC_ENDPOINT` environment variable wins over the stored endpoint.
    pub async fn load(db: &Database) -> Result<Self> {
        let pairs = db
            .reader()
            .call(|conn| repository::list_config(conn))
            .await?;
        let mut settings = Self::from_pairs(&pairs)?;
        if let Ok(raw) = std::env::var(ENDPOINT_ENV) {
            if !raw.trim().is_empty() {
                settings.endpoint = Some(parse_endpoint(&raw)?);
            }
        }
        Ok(settings)
    }

    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut settings = Self::default();
        for (key, value) in pairs {
            settings.apply(key, value)?;
        }
        Ok(settings)
    }

    /// Apply one `key = value` pair, validating it.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            KEY_ENDPOINT => self.endpoint = Some(parse_endpoint(value)?),
            KEY_REQUEST_TIMEOUT => self.request_timeout = Duration::from_secs(parse_secs(key, value, 1)?),
            KEY_MAX_RETRIES => {
                let n = parse_number(key, value)?;
                self.max_retries = u32::try_from(n)
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| Error::Config(format!("{key} must be between 1 and {}", u32::MAX)))?;
            }
            KEY_SYNC_INTERVAL => {
                let secs = parse_secs(key, value, 0)?;
                self.sync_interval = (secs > 0).then(|| Duration::from_secs(secs));
            }
            KEY_PROBE_INTERVAL => self.probe_interval = Duration::from_secs(parse_secs(key, value, 1)?),
            KEY_MAX_BACKOFF => self.max_backoff = Duration::from_secs(parse_secs(key, value, 0)?),
            other => {
                log::warn!("Ignoring unknown config key: {other}");
            }
        }
        Ok(())
    }

    /// The endpoint, or a configuration error telling the user how to set one.
    pub fn require_endpoint(&self) -> Result<&Url> {
        self.endpoint.as_ref().ok_or_else(|| {
            Error::Config(format!(
                "no sync endpoint configured. Run: formsync config set {KEY_ENDPOINT} <URL> or set {ENDPOINT_ENV}"
            ))
        })
    }
}

/// Validate a config value before it is stored, so `config set` fails early.
pub fn validate(key: &str, value: &str) -> Result<()> {
    if !KNOWN_KEYS.contains(&key) {
        return Err(Error::Config(format!(
            "unknown key {key}. Known keys: {}",
            KNOWN_KEYS.join(", ")
        )));
    }
    Settings::default().apply(key, value)
}

pub fn parse_endpoint(raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::Config(format!("invalid endpoint {raw:?}: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(Error::Config(format!(
            "endpoint must use http or https, got {other}"
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got {value:?}")))
}

fn parse_secs(key: &str, value: &str, min: u64) -> Result<u64> {
    let secs = parse_number(key, value)?;
    if !(min..=MAX_DURATION_SECS).contains(&secs) {
        return Err(Error::Config(format!(
            "{key} must be between {min} and {MAX_DURATION_SECS} seconds, got {secs}"
        )));
    }
    Ok(secs)
}
