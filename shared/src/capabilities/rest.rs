use async_trait::async_trait;
use bytes::Bytes;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::http::{HttpError, HttpRequest, HttpTransport, ValidatedUrl};
use super::store::{ChangeFeed, ChangeNotice, RemoteStore, StoreError, FEED_BUFFER};
use crate::config::{Config, ConfigError};
use crate::model::{Category, NewReportRow};

/// PostgREST-style row API plus object storage, authenticated with an anon key.
#[derive(Clone)]
pub struct RestStore {
    http: Arc<dyn HttpTransport>,
    base: Url,
    api_key: Arc<SecretString>,
    bucket: String,
    timeout: Duration,
    poll_interval: Duration,
}

impl RestStore {
    pub fn new(http: Arc<dyn HttpTransport>, config: &Config) -> Result<Self, ConfigError> {
        let missing = |name: &'static str| ConfigError::InvalidUrl {
            name,
            reason: "not configured".to_owned(),
        };
        let base = config.store_url.clone().ok_or_else(|| missing("store_url"))?;
        let key = config
            .store_api_key
            .as_ref()
            .ok_or_else(|| missing("store_api_key"))?;
        Ok(Self {
            http,
            base,
            api_key: Arc::new(SecretString::new(key.expose_secret().clone())),
            bucket: config.photo_bucket.clone(),
            timeout: config.request_timeout,
            poll_interval: config.feed_poll_interval,
        })
    }

    fn authed(&self, request: HttpRequest) -> Result<HttpRequest, HttpError> {
        let key = self.api_key.expose_secret();
        request
            .with_timeout(self.timeout)?
            .with_header("apikey", key.as_str())?
            .with_header("Authorization", format!("Bearer {key}"))
    }

    fn table_url(&self, category: Category, query: &[(&str, &str)]) -> Result<ValidatedUrl, HttpError> {
        ValidatedUrl::build(&self.base, &["rest/v1", category.table()], query)
    }

    #[must_use]
    pub fn public_url(&self, path: &str) -> Option<String> {
        ValidatedUrl::build(&self.base, &["storage/v1/object/public", self.bucket.as_str(), path], &[])
            .ok()
            .map(|u| u.as_str().to_owned())
    }
}

/// Changes whenever any row is added, removed, or rewritten.
fn fingerprint(rows: &[Value]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for row in rows {
        hasher.update(row.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize()
}

#[async_trait]
impl RemoteStore for RestStore {
    #[tracing::instrument(level = "debug", skip(self), fields(table = category.table()))]
    async fn select_all(&self, category: Category) -> Result<Vec<Value>, StoreError> {
        let url = self.table_url(category, &[("select", "*"), ("order", "created_at.desc")])?;
        let request = self.authed(HttpRequest::get(url))?;
        let response = self.http.execute(request).await?.error_for_status()?;
        let rows: Vec<Value> = response.json()?;
        tracing::debug!(rows = rows.len(), "selected rows");
        Ok(rows)
    }

    #[tracing::instrument(level = "debug", skip(self, row), fields(table = category.table()))]
    async fn insert(&self, category: Category, row: &NewReportRow) -> Result<Value, StoreError> {
        let url = self.table_url(category, &[])?;
        let request = self
            .authed(HttpRequest::post(url))?
            .with_header("Prefer", "return=representation")?
            .with_json(&[row])?;
        let response = self.http.execute(request).await?.error_for_status()?;
        let mut rows: Vec<Value> = response.json()?;
        if rows.is_empty() {
            return Err(StoreError::UnexpectedResponse(
                "insert returned no rows".to_owned(),
            ));
        }
        Ok(rows.swap_remove(0))
    }

    #[tracing::instrument(level = "debug", skip(self, bytes), fields(size = bytes.len()))]
    async fn upload(&self, path: &str, content_type: &str, bytes: Bytes) -> Result<String, StoreError> {
        let url = ValidatedUrl::build(&self.base, &["storage/v1/object", self.bucket.as_str(), path], &[])?;
        let request = self
            .authed(HttpRequest::post(url))?
            // Same content hash, same path: re-uploading is harmless.
            .with_header("x-upsert", "true")?
            .with_body(bytes, content_type)?;
        self.http.execute(request).await?.error_for_status()?;
        self.public_url(path)
            .ok_or_else(|| StoreError::UnexpectedResponse(format!("no public URL for {path}")))
    }

    /// Polls the table and emits a notice whenever its content fingerprint moves.
    fn subscribe(&self, category: Category) -> ChangeFeed {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let store = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(store.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last: Option<blake3::Hash> = None;
            loop {
                tokio::select! {
                    () = cancelled.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let rows = tokio::select! {
                    () = cancelled.cancelled() => break,
                    rows = store.select_all(category) => rows,
                };
                match rows {
                    Ok(rows) => {
                        let current = fingerprint(&rows);
                        let changed = last.is_some_and(|prev| prev != current);
                        last = Some(current);
                        if changed && tx.send(ChangeNotice { category }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::debug!(table = category.table(), error = %e, "feed poll failed"),
                }
            }
            tracing::debug!(table = category.table(), "change feed stopped");
        });

        ChangeFeed::new(rx, Some(token.drop_guard()))
    }
}
