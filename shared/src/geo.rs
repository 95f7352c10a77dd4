//! Place search and reverse geocoding against a Nominatim-compatible service.
//!
//! `search` surfaces failures; `reverse_geocode` never does and degrades to a
//! formatted-coordinate label instead.

use async_trait::async_trait;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::capabilities::{HttpError, HttpRequest, HttpTransport, ValidatedUrl};
use crate::config::Config;
use crate::model::{Coordinate, PlaceId};
use crate::{AppError, ErrorKind, MAX_SEARCH_LIMIT, REVERSE_CACHE_SIZE};

const CACHE_CAPACITY: NonZeroUsize = match NonZeroUsize::new(REVERSE_CACHE_SIZE) {
    Some(n) => n,
    None => NonZeroUsize::MIN,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCandidate {
    pub place_id: PlaceId,
    pub display_name: String,
    pub location: Coordinate,
    pub kind: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeoError {
    #[error("place search timed out after {0:?}")]
    Timeout(Duration),
    #[error("place search failed: {0}")]
    Network(HttpError),
}

impl GeoError {
    fn from_http(error: HttpError, timeout: Duration) -> Self {
        if error.is_timeout() {
            Self::Timeout(timeout)
        } else {
            Self::Network(error)
        }
    }
}

impl From<GeoError> for AppError {
    fn from(e: GeoError) -> Self {
        let kind = match e {
            GeoError::Timeout(_) => ErrorKind::Timeout,
            GeoError::Network(_) => ErrorKind::Network,
        };
        AppError::new(kind, "place search failed").with_internal(e.to_string())
    }
}

/// Seam the query streams and panels search through.
#[async_trait]
pub trait PlaceSearch: Send + Sync {
    /// At most `limit` candidates (capped at 10) in upstream relevance order.
    async fn search(&self, text: &str, limit: usize) -> Result<Vec<SearchCandidate>, GeoError>;

    /// Best effort; never fails.
    async fn reverse_geocode(&self, at: Coordinate) -> String;
}

/// Loose shape of one search hit; Nominatim sends coordinates as strings.
#[derive(Debug, Deserialize)]
struct PlaceHit {
    place_id: Value,
    display_name: String,
    lat: Value,
    lon: Value,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    addresstype: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReverseHit {
    #[serde(default)]
    display_name: Option<String>,
}

fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl PlaceHit {
    fn into_candidate(self) -> Option<SearchCandidate> {
        let place_id = match &self.place_id {
            Value::Number(n) => n.to_string(),
            Value::String(s) if !s.is_empty() => s.clone(),
            _ => return None,
        };
        let location = Coordinate::new(number(&self.lat)?, number(&self.lon)?).ok()?;
        Some(SearchCandidate {
            place_id: PlaceId::new(place_id),
            display_name: self.display_name,
            location,
            kind: self.kind.or(self.addresstype).unwrap_or_default(),
        })
    }
}

pub struct GeoSearchClient {
    http: Arc<dyn HttpTransport>,
    base: Url,
    user_agent: String,
    timeout: Duration,
    precision: usize,
    reverse_cache: Mutex<LruCache<(i64, i64), String>>,
}

impl GeoSearchClient {
    #[must_use]
    pub fn new(http: Arc<dyn HttpTransport>, config: &Config) -> Self {
        Self {
            http,
            base: config.geocoder_base_url.clone(),
            user_agent: config.user_agent.clone(),
            timeout: config.request_timeout,
            precision: config.coordinate_precision,
            reverse_cache: Mutex::new(LruCache::new(CACHE_CAPACITY)),
        }
    }

    fn request(&self, path: &str, query: &[(&str, &str)]) -> Result<HttpRequest, HttpError> {
        let url = ValidatedUrl::build(&self.base, &[path], query)?;
        HttpRequest::get(url)
            .with_timeout(self.timeout)?
            .with_header("User-Agent", self.user_agent.as_str())?
            .with_header("Accept", "application/json")
    }

    fn cached(&self, at: Coordinate) -> Option<String> {
        self.reverse_cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&at.rounded_key())
            .cloned()
    }

    async fn lookup_label(&self, at: Coordinate) -> Result<Option<String>, HttpError> {
        let lat = at.lat().to_string();
        let lon = at.lng().to_string();
        let request = self.request(
            "reverse",
            &[("format", "jsonv2"), ("lat", lat.as_str()), ("lon", lon.as_str())],
        )?;
        let response = self.http.execute(request).await?.error_for_status()?;
        let hit: ReverseHit = response.json()?;
        Ok(hit.display_name.filter(|name| !name.trim().is_empty()))
    }
}

#[async_trait]
impl PlaceSearch for GeoSearchClient {
    #[instrument(skip(self, text), fields(query_len = text.len()))]
    async fn search(&self, text: &str, limit: usize) -> Result<Vec<SearchCandidate>, GeoError> {
        let text = text.trim();
        let limit = limit.clamp(1, MAX_SEARCH_LIMIT);
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let limit_param = limit.to_string();
        let timeout = self.timeout;
        let request = self
            .request(
                "search",
                &[
                    ("format", "jsonv2"),
                    ("q", text),
                    ("addressdetails", "1"),
                    ("limit", limit_param.as_str()),
                ],
            )
            .map_err(GeoError::Network)?;
        let response = self
            .http
            .execute(request)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| GeoError::from_http(e, timeout))?;
        let hits: Vec<Value> = response.json().map_err(GeoError::Network)?;

        let total = hits.len();
        let candidates: Vec<SearchCandidate> = hits
            .into_iter()
            .filter_map(|raw| serde_json::from_value::<PlaceHit>(raw).ok()?.into_candidate())
            .take(limit)
            .collect();
        if candidates.len() < total.min(limit) {
            debug!(skipped = total - candidates.len(), "dropped unusable search hits");
        }
        Ok(candidates)
    }

    #[instrument(skip(self))]
    async fn reverse_geocode(&self, at: Coordinate) -> String {
        if let Some(label) = self.cached(at) {
            return label;
        }
        match self.lookup_label(at).await {
            Ok(Some(label)) => {
                self.reverse_cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .put(at.rounded_key(), label.clone());
                label
            }
            Ok(None) => {
                debug!("no place at coordinates, using fallback label");
                at.label(self.precision)
            }
            Err(e) => {
                warn!(error = %e, "reverse geocode failed, using fallback label");
                at.label(self.precision)
            }
        }
    }
}
