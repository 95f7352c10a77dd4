// lib.rs - Location search and interaction-state core for the pet map

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::too_many_lines)]

pub mod capabilities;
pub mod config;
pub mod debounce;
pub mod event;
pub mod form;
pub mod geo;
pub mod interaction;
pub mod model;
pub mod photo;
pub mod search_panel;
pub mod session;
pub mod sync;
pub mod viewport;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use capabilities::{Capabilities, HttpTransport, InMemoryStore, RemoteStore, RestStore};
pub use config::Config;
pub use debounce::{DebouncedQuery, SuggestionsView};
pub use event::UiEvent;
pub use form::{LocationView, ReportForm};
pub use geo::{GeoSearchClient, PlaceSearch, SearchCandidate};
pub use interaction::{InteractionStateMachine, Modal, UiMode};
pub use model::{Category, Coordinate, PetReport, RecordId, ReportDraft, Species};
pub use search_panel::SearchPanel;
pub use session::Session;
pub use sync::{RecordSync, Subscription, SyncError};
pub use viewport::{MapViewport, MarkerLayer};

pub const DEFAULT_CENTER: (f64, f64) = (51.505, -0.09);
pub const DEFAULT_MAP_ZOOM: f64 = 13.0;
pub const MIN_ZOOM: f64 = 1.0;
pub const MAX_ZOOM: f64 = 19.0;
pub const CLOSE_UP_ZOOM: f64 = 15.0;
pub const RESULT_ZOOM: f64 = 16.0;
pub const DEBOUNCE_QUIET_PERIOD: Duration = Duration::from_millis(350);
pub const MIN_QUERY_CHARS: usize = 3;
pub const SEARCH_LIMIT: usize = 10;
pub const AUTOCOMPLETE_LIMIT: usize = 5;
pub const MAX_SEARCH_LIMIT: usize = 10;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const FEED_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_PHOTO_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_PHOTO_DIMENSION: u32 = 4096;
pub const COORDINATE_PRECISION: usize = 6;
pub const REVERSE_CACHE_SIZE: usize = 64;
pub const PLACEHOLDER_STORE_URL: &str = "https://example.supabase.co";
pub const DEFAULT_GEOCODER_URL: &str = "https://nominatim.openstreetmap.org";
pub const DEFAULT_PHOTO_BUCKET: &str = "pet-photos";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Network,
    Timeout,
    Integrity,
    Upload,
    Aborted,
    Validation,
    Configuration,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::Integrity => "INTEGRITY_ERROR",
            Self::Upload => "UPLOAD_ERROR",
            Self::Aborted => "ABORTED",
            Self::Validation => "VALIDATION_ERROR",
            Self::Configuration => "CONFIG_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    /// Retry means the user re-invoking the action; nothing here retries on its own.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Network | Self::Timeout | Self::Upload)
    }

    #[must_use]
    pub const fn is_silent(self) -> bool {
        matches!(self, Self::Aborted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    #[must_use]
    pub const fn is_silent(&self) -> bool {
        self.kind.is_silent()
    }

    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self.kind {
            ErrorKind::Network => {
                "Unable to reach the server. Please check your connection and try again.".into()
            }
            ErrorKind::Timeout => "The request timed out. Please try again.".into(),
            ErrorKind::Integrity => {
                "Some reports could not be displayed because their data is incomplete.".into()
            }
            ErrorKind::Upload => {
                "The photo could not be uploaded, so the report was not saved. Please try again."
                    .into()
            }
            ErrorKind::Validation => self.message.clone(),
            ErrorKind::Aborted => String::new(),
            ErrorKind::Configuration => {
                "The app is not configured correctly. Please contact support.".into()
            }
            ErrorKind::Internal => {
                "An unexpected error occurred. Please try again or contact support.".into()
            }
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

/// Zoom clamped to the range the tile server serves.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoomLevel {
    value: f64,
}

impl ZoomLevel {
    #[must_use]
    pub fn new(value: f64) -> Self {
        let value = if value.is_finite() { value } else { DEFAULT_MAP_ZOOM };
        Self {
            value: value.clamp(MIN_ZOOM, MAX_ZOOM),
        }
    }

    #[must_use]
    pub const fn value(self) -> f64 {
        self.value
    }
}

impl Default for ZoomLevel {
    fn default() -> Self {
        Self::new(DEFAULT_MAP_ZOOM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(ErrorKind::Network.code(), "NETWORK_ERROR");
        assert_eq!(ErrorKind::Integrity.code(), "INTEGRITY_ERROR");
        assert_eq!(ErrorKind::Upload.code(), "UPLOAD_ERROR");
        assert_eq!(ErrorKind::Aborted.code(), "ABORTED");
    }

    #[test]
    fn only_aborted_is_silent() {
        assert!(ErrorKind::Aborted.is_silent());
        assert!(!ErrorKind::Network.is_silent());
        assert!(!ErrorKind::Integrity.is_silent());
        assert!(!ErrorKind::Upload.is_silent());
    }

    #[test]
    fn integrity_is_not_retryable() {
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Upload.is_retryable());
        assert!(!ErrorKind::Integrity.is_retryable());
        assert!(!ErrorKind::Aborted.is_retryable());
    }

    #[test]
    fn display_includes_internal_message() {
        let err = AppError::new(ErrorKind::Network, "fetch failed").with_internal("status 502");
        assert_eq!(err.to_string(), "[NETWORK_ERROR] fetch failed (internal: status 502)");
    }

    #[test]
    fn validation_message_is_shown_verbatim() {
        let err = AppError::new(ErrorKind::Validation, "Latitude must be between -90 and 90");
        assert_eq!(err.user_facing_message(), "Latitude must be between -90 and 90");
    }

    #[test]
    fn zoom_is_clamped() {
        assert_eq!(ZoomLevel::new(25.0).value(), MAX_ZOOM);
        assert_eq!(ZoomLevel::new(-3.0).value(), MIN_ZOOM);
        assert_eq!(ZoomLevel::new(f64::NAN).value(), DEFAULT_MAP_ZOOM);
        assert_eq!(ZoomLevel::new(16.0).value(), 16.0);
    }
}
