use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::DropGuard;

use super::http::HttpError;
use crate::model::{Category, NewReportRow};
use crate::{AppError, ErrorKind};

/// Notifications buffered per subscriber before the feed starts coalescing.
pub const FEED_BUFFER: usize = 16;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("store rejected the request: {0}")]
    Rejected(String),
    #[error("unexpected store response: {0}")]
    UnexpectedResponse(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Http(e) if e.is_timeout())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Http(http) => http.into(),
            other => AppError::new(ErrorKind::Network, "the report service failed")
                .with_internal(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeNotice {
    pub category: Category,
}

/// Push feed for one category. Notices carry no row data; receivers reload.
pub struct ChangeFeed {
    rx: mpsc::Receiver<ChangeNotice>,
    _guard: Option<DropGuard>,
}

impl ChangeFeed {
    /// `guard` cancels whatever task produces the feed when the feed is dropped.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<ChangeNotice>, guard: Option<DropGuard>) -> Self {
        Self { rx, _guard: guard }
    }

    pub async fn next(&mut self) -> Option<ChangeNotice> {
        self.rx.recv().await
    }

    /// A notice that is already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<ChangeNotice> {
        self.rx.try_recv().ok()
    }
}

/// Opaque remote data service: rows in, rows out, plus object upload.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Every row of the category, newest first, unvalidated.
    async fn select_all(&self, category: Category) -> Result<Vec<Value>, StoreError>;

    /// Inserts one row and returns the canonical row with `id` and `created_at`.
    async fn insert(&self, category: Category, row: &NewReportRow) -> Result<Value, StoreError>;

    /// Stores the object at `path` and returns its public URL.
    async fn upload(&self, path: &str, content_type: &str, bytes: Bytes) -> Result<String, StoreError>;

    fn subscribe(&self, category: Category) -> ChangeFeed;
}
