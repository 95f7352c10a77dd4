use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::model::Coordinate;
use crate::{
    AppError, ErrorKind, AUTOCOMPLETE_LIMIT, CLOSE_UP_ZOOM, COORDINATE_PRECISION,
    DEBOUNCE_QUIET_PERIOD, DEFAULT_CENTER, DEFAULT_GEOCODER_URL, DEFAULT_MAP_ZOOM,
    DEFAULT_PHOTO_BUCKET, FEED_POLL_INTERVAL, MAX_SEARCH_LIMIT, MIN_QUERY_CHARS,
    PLACEHOLDER_STORE_URL, REQUEST_TIMEOUT, RESULT_ZOOM, SEARCH_LIMIT,
};

pub const ENV_STORE_URL: &str = "PAWMAP_STORE_URL";
pub const ENV_STORE_KEY: &str = "PAWMAP_STORE_KEY";
pub const ENV_GEOCODER_URL: &str = "PAWMAP_GEOCODER_URL";
pub const ENV_USER_AGENT: &str = "PAWMAP_USER_AGENT";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} is not a valid URL: {reason}")]
    InvalidUrl { name: &'static str, reason: String },
    #[error("{0} must not be zero")]
    Zero(&'static str),
    #[error("{name} is {value}, the maximum is {max}")]
    TooLarge {
        name: &'static str,
        value: usize,
        max: usize,
    },
    #[error("default center is not a valid coordinate")]
    InvalidCenter,
    #[error("user agent must not be empty")]
    MissingUserAgent,
}

impl From<ConfigError> for AppError {
    fn from(e: ConfigError) -> Self {
        AppError::new(ErrorKind::Configuration, "invalid configuration").with_internal(e.to_string())
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store_url: Option<Url>,
    pub store_api_key: Option<SecretString>,
    pub photo_bucket: String,
    pub geocoder_base_url: Url,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub debounce: Duration,
    pub min_query_chars: usize,
    pub search_limit: usize,
    pub autocomplete_limit: usize,
    pub feed_poll_interval: Duration,
    pub close_up_zoom: f64,
    pub result_zoom: f64,
    pub default_center: (f64, f64),
    pub default_zoom: f64,
    pub coordinate_precision: usize,
}

fn default_geocoder_url() -> Url {
    // Constant literal; parse cannot fail.
    Url::parse(DEFAULT_GEOCODER_URL).unwrap_or_else(|_| unreachable!("invalid built-in URL"))
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_url: None,
            store_api_key: None,
            photo_bucket: DEFAULT_PHOTO_BUCKET.to_owned(),
            geocoder_base_url: default_geocoder_url(),
            user_agent: concat!("pawmap/", env!("CARGO_PKG_VERSION")).to_owned(),
            request_timeout: REQUEST_TIMEOUT,
            debounce: DEBOUNCE_QUIET_PERIOD,
            min_query_chars: MIN_QUERY_CHARS,
            search_limit: SEARCH_LIMIT,
            autocomplete_limit: AUTOCOMPLETE_LIMIT,
            feed_poll_interval: FEED_POLL_INTERVAL,
            close_up_zoom: CLOSE_UP_ZOOM,
            result_zoom: RESULT_ZOOM,
            default_center: DEFAULT_CENTER,
            default_zoom: DEFAULT_MAP_ZOOM,
            coordinate_precision: COORDINATE_PRECISION,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`Config::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &str| lookup(name).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());
        let parse_url = |name: &'static str, raw: String| {
            Url::parse(&raw).map_err(|e| ConfigError::InvalidUrl {
                name,
                reason: e.to_string(),
            })
        };

        let mut config = Self::default();
        if let Some(raw) = read(ENV_STORE_URL) {
            config.store_url = Some(parse_url(ENV_STORE_URL, raw)?);
        }
        config.store_api_key = read(ENV_STORE_KEY).map(SecretString::new);
        if let Some(raw) = read(ENV_GEOCODER_URL) {
            config.geocoder_base_url = parse_url(ENV_GEOCODER_URL, raw)?;
        }
        if let Some(agent) = read(ENV_USER_AGENT) {
            config.user_agent = agent;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, url) in [
            ("store_url", self.store_url.as_ref()),
            ("geocoder_base_url", Some(&self.geocoder_base_url)),
        ] {
            if let Some(url) = url {
                if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                    return Err(ConfigError::InvalidUrl {
                        name,
                        reason: "only http(s) URLs with a host are supported".to_owned(),
                    });
                }
            }
        }
        for (name, value) in [
            ("request_timeout", self.request_timeout),
            ("debounce", self.debounce),
            ("feed_poll_interval", self.feed_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Zero(name));
            }
        }
        for (name, value) in [
            ("search_limit", self.search_limit),
            ("autocomplete_limit", self.autocomplete_limit),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
            if value > MAX_SEARCH_LIMIT {
                return Err(ConfigError::TooLarge {
                    name,
                    value,
                    max: MAX_SEARCH_LIMIT,
                });
            }
        }
        if self.min_query_chars == 0 {
            return Err(ConfigError::Zero("min_query_chars"));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::MissingUserAgent);
        }
        if self.photo_bucket.trim().is_empty() {
            return Err(ConfigError::Zero("photo_bucket"));
        }
        self.default_center()?;
        Ok(())
    }

    pub fn default_center(&self) -> Result<Coordinate, ConfigError> {
        Coordinate::try_from(self.default_center).map_err(|_| ConfigError::InvalidCenter)
    }

    /// False means demo mode: the session runs against the seeded in-memory store.
    #[must_use]
    pub fn uses_real_store(&self) -> bool {
        let Some(url) = &self.store_url else {
            return false;
        };
        let has_key = self
            .store_api_key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().is_empty());
        has_key && url.as_str().trim_end_matches('/') != PLACEHOLDER_STORE_URL
    }
}
