//! Client-side collection for one report category.
//!
//! All mutation funnels through [`RecordSync::load`], [`RecordSync::add`] and
//! the subscription task. Merging is keyed by record id, so an `add` and the
//! reload its own change notice triggers converge on one copy in either order.

use bytes::Bytes;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::capabilities::{HttpError, RemoteStore, StoreError};
use crate::model::{Category, IntegrityIssue, PetReport, RecordId, ReportDraft};
use crate::photo;
use crate::{AppError, ErrorKind, REQUEST_TIMEOUT};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    #[error("could not reach the report service: {0}")]
    Network(StoreError),

    #[error("{rejected} of {total} {category} reports were malformed")]
    Integrity {
        category: Category,
        rejected: usize,
        total: usize,
        issues: Vec<IntegrityIssue>,
    },

    #[error("photo upload failed: {reason}")]
    Upload { reason: String },

    #[error("draft belongs to {found}, this collection holds {expected}")]
    WrongCategory { expected: Category, found: Category },
}

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Network(store) => AppError::from(store),
            SyncError::Integrity {
                category,
                rejected,
                total,
                ..
            } => AppError::new(ErrorKind::Integrity, format!("{rejected} malformed reports"))
                .with_internal(format!("{rejected} of {total} rows rejected"))
                .with_context("category", category.tag())
                .with_context("rejected", rejected.to_string()),
            SyncError::Upload { reason } => {
                AppError::new(ErrorKind::Upload, "photo upload failed").with_internal(reason)
            }
            wrong @ SyncError::WrongCategory { .. } => {
                AppError::new(ErrorKind::Internal, "report routed to the wrong list")
                    .with_internal(wrong.to_string())
            }
        }
    }
}

#[derive(Debug, Default)]
struct SyncState {
    records: Vec<PetReport>,
    /// Tickets handed to `load` calls, in start order.
    issued: u64,
    /// Ticket of the newest load whose result was applied.
    applied: u64,
    /// Records added locally, with the newest ticket issued when they landed.
    local: Vec<(u64, RecordId)>,
    revision: u64,
}

impl SyncState {
    fn merge_front(&mut self, report: PetReport) {
        self.records.retain(|r| r.id != report.id);
        self.records.insert(0, report);
    }
}

/// Validates every row; returns the accepted reports and the rejects.
fn validate_rows(category: Category, rows: &[Value]) -> (Vec<PetReport>, Vec<IntegrityIssue>) {
    let mut reports: Vec<PetReport> = Vec::with_capacity(rows.len());
    let mut issues = Vec::new();
    for row in rows {
        match PetReport::from_row(category, row) {
            Ok(report) if reports.iter().any(|r| r.id == report.id) => {
                debug!(id = %report.id, "duplicate row id in snapshot");
            }
            Ok(report) => reports.push(report),
            Err(issue) => issues.push(issue),
        }
    }
    (reports, issues)
}

#[derive(Clone)]
pub struct RecordSync {
    category: Category,
    store: Arc<dyn RemoteStore>,
    timeout: Duration,
    state: Arc<RwLock<SyncState>>,
}

impl RecordSync {
    #[must_use]
    pub fn new(category: Category, store: Arc<dyn RemoteStore>) -> Self {
        Self::with_timeout(category, store, REQUEST_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(category: Category, store: Arc<dyn RemoteStore>, timeout: Duration) -> Self {
        Self {
            category,
            store,
            timeout,
            state: Arc::new(RwLock::new(SyncState::default())),
        }
    }

    #[must_use]
    pub const fn category(&self) -> Category {
        self.category
    }

    pub async fn snapshot(&self) -> Vec<PetReport> {
        self.state.read().await.records.clone()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.records.is_empty()
    }

    /// Bumped on every change to the collection.
    pub async fn revision(&self) -> u64 {
        self.state.read().await.revision
    }

    async fn with_deadline<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = self.timeout.as_millis() as u64;
        tokio::time::timeout(self.timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Http(HttpError::Timeout {
                    timeout_ms,
                    request_id: String::new(),
                }))
            })
    }

    /// Replaces the collection with the store's current rows, newest first.
    ///
    /// Malformed rows are dropped and reported as `Integrity` after the valid
    /// ones are applied. On a network failure the previous collection stays.
    /// A load that finishes after a newer one was applied is discarded.
    #[instrument(skip(self), fields(category = %self.category))]
    pub async fn load(&self) -> Result<Vec<PetReport>, SyncError> {
        let ticket = {
            let mut state = self.state.write().await;
            state.issued += 1;
            state.issued
        };

        let rows = self
            .with_deadline(self.store.select_all(self.category))
            .await
            .map_err(|e| {
                warn!(error = %e, "load failed");
                SyncError::Network(e)
            })?;
        let total = rows.len();
        let (reports, issues) = validate_rows(self.category, &rows);

        let mut state = self.state.write().await;
        if ticket < state.applied {
            debug!(ticket, applied = state.applied, "discarding stale load");
            return Ok(state.records.clone());
        }

        // Local adds that may have landed after this snapshot was taken.
        let pending: Vec<PetReport> = state
            .local
            .iter()
            .filter(|(landed, _)| *landed >= ticket)
            .filter_map(|(_, id)| state.records.iter().find(|r| &r.id == id).cloned())
            .filter(|r| !reports.iter().any(|fresh| fresh.id == r.id))
            .collect();
        state.local.retain(|(landed, _)| *landed >= ticket);

        state.records = reports;
        for report in pending.into_iter().rev() {
            state.merge_front(report);
        }
        state.applied = ticket;
        state.revision += 1;
        let snapshot = state.records.clone();
        drop(state);

        if issues.is_empty() {
            info!(count = snapshot.len(), "loaded reports");
            return Ok(snapshot);
        }
        for issue in &issues {
            warn!(%issue, "rejected malformed row");
        }
        Err(SyncError::Integrity {
            category: self.category,
            rejected: issues.len(),
            total,
            issues,
        })
    }

    /// Uploads the photo (if any), inserts the draft and merges the canonical row.
    ///
    /// Nothing is inserted when the photo step fails.
    #[instrument(skip(self, draft, photo), fields(category = %self.category, has_photo = photo.is_some()))]
    pub async fn add(&self, draft: &ReportDraft, photo: Option<Bytes>) -> Result<PetReport, SyncError> {
        if draft.category != self.category {
            return Err(SyncError::WrongCategory {
                expected: self.category,
                found: draft.category,
            });
        }

        let photo_url = match photo {
            Some(bytes) => {
                let prepared = photo::prepare(self.category, bytes)
                    .await
                    .map_err(|e| SyncError::Upload {
                        reason: e.to_string(),
                    })?;
                let url = self
                    .with_deadline(self.store.upload(
                        &prepared.path,
                        prepared.format.content_type(),
                        prepared.bytes.clone(),
                    ))
                    .await
                    .map_err(|e| {
                        warn!(error = %e, "photo upload failed, report not created");
                        SyncError::Upload {
                            reason: e.to_string(),
                        }
                    })?;
                Some(url)
            }
            None => None,
        };

        let row = draft.to_row(photo_url.as_deref());
        let created = self
            .with_deadline(self.store.insert(self.category, &row))
            .await
            .map_err(SyncError::Network)?;
        let report = PetReport::from_row(self.category, &created).map_err(|issue| {
            warn!(%issue, "store returned a malformed row");
            SyncError::Integrity {
                category: self.category,
                rejected: 1,
                total: 1,
                issues: vec![issue],
            }
        })?;

        let mut state = self.state.write().await;
        let landed = state.issued;
        state.local.push((landed, report.id.clone()));
        state.merge_front(report.clone());
        state.revision += 1;
        info!(id = %report.id, "report added");
        Ok(report)
    }

    /// Reloads on every change notice until the returned handle is disposed.
    pub fn subscribe<F>(&self, on_change: F) -> Subscription
    where
        F: Fn(Result<Vec<PetReport>, SyncError>) + Send + Sync + 'static,
    {
        let mut feed = self.store.subscribe(self.category);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let sync = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    () = cancelled.cancelled() => break,
                    notice = feed.next() => notice,
                };
                if notice.is_none() {
                    debug!(category = %sync.category, "change feed closed");
                    break;
                }
                // One reload covers every notice already queued.
                while feed.try_next().is_some() {}

                let result = tokio::select! {
                    () = cancelled.cancelled() => break,
                    result = sync.load() => result,
                };
                if cancelled.is_cancelled() {
                    break;
                }
                on_change(result);
            }
        });

        Subscription {
            category: self.category,
            token,
            handle: Some(handle),
        }
    }
}

/// Live subscription to a category's change feed. Dropping it disposes it.
#[must_use = "dropping a Subscription immediately unsubscribes"]
pub struct Subscription {
    category: Category,
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    #[must_use]
    pub const fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn dispose(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!(category = %self.category, "subscription disposed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{InMemoryStore, StoreOp};
    use crate::model::Coordinate;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn draft(category: Category, name: &str) -> ReportDraft {
        let mut draft = ReportDraft::new(category);
        draft.pet_name = name.to_owned();
        draft.location_label = "Hyde Park".to_owned();
        draft.location = Some(Coordinate::new(51.5, -0.1).unwrap());
        draft
    }

    fn sync_pair(store: &InMemoryStore) -> (RecordSync, RecordSync) {
        let store: Arc<dyn RemoteStore> = Arc::new(store.clone());
        (
            RecordSync::new(Category::Missing, store.clone()),
            RecordSync::new(Category::Found, store),
        )
    }

    fn tiny_png() -> Bytes {
        use image::{ExtendedColorType, ImageEncoder};
        let mut buffer = Vec::new();
        image::codecs::png::PngEncoder::new(&mut buffer)
            .write_image(&[255, 0, 0, 0, 255, 0], 2, 1, ExtendedColorType::Rgb8)
            .unwrap();
        Bytes::from(buffer)
    }

    #[tokio::test]
    async fn load_returns_newest_first() {
        let store = InMemoryStore::seeded();
        let (missing, found) = sync_pair(&store);
        let reports = missing.load().await.unwrap();
        let ids: Vec<_> = reports.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2"]);
        assert_eq!(found.load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_rows_are_reported_but_valid_rows_render() {
        let store = InMemoryStore::seeded();
        store.push_raw_row(Category::Missing, json!({"pet_name": "No id", "created_at": "2024-01-01T00:00:00Z"}));
        store.push_raw_row(
            Category::Missing,
            json!({"id": "bad-lat", "pet_name": "Nan", "lat": "NaN", "lng": 1.0, "created_at": "2024-01-01T00:00:00Z"}),
        );
        let (missing, _) = sync_pair(&store);

        let err = missing.load().await.unwrap_err();
        match &err {
            SyncError::Integrity { rejected, total, .. } => {
                assert_eq!(*rejected, 2);
                assert_eq!(*total, 4);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(missing.len().await, 2);
        assert_eq!(AppError::from(err).kind, ErrorKind::Integrity);
    }

    #[tokio::test]
    async fn network_failure_keeps_previous_collection() {
        let store = InMemoryStore::seeded();
        let (missing, _) = sync_pair(&store);
        missing.load().await.unwrap();

        store.set_failure(StoreOp::Select, Some(StoreError::Unavailable("down".into())));
        let err = missing.load().await.unwrap_err();
        assert!(matches!(err, SyncError::Network(_)));
        assert_eq!(missing.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_times_out_as_network_error() {
        let store = InMemoryStore::seeded();
        store.set_select_delay(Category::Missing, Some(Duration::from_secs(30)));
        let missing = RecordSync::with_timeout(
            Category::Missing,
            Arc::new(store.clone()),
            Duration::from_secs(10),
        );
        let err = missing.load().await.unwrap_err();
        assert!(matches!(&err, SyncError::Network(e) if e.is_timeout()));
        assert!(AppError::from(err).is_retryable());
    }

    #[tokio::test]
    async fn add_then_reload_keeps_one_copy() {
        let store = InMemoryStore::seeded();
        let (missing, found) = sync_pair(&store);
        missing.load().await.unwrap();
        found.load().await.unwrap();

        let report = missing.add(&draft(Category::Missing, "Rex"), None).await.unwrap();
        assert_eq!(missing.len().await, 3);
        assert_eq!(missing.snapshot().await[0].id, report.id);

        missing.load().await.unwrap();
        assert_eq!(missing.len().await, 3);
        assert_eq!(found.len().await, 1);
    }

    #[tokio::test]
    async fn submitted_coordinates_round_trip_exactly() {
        let store = InMemoryStore::new();
        let (missing, _) = sync_pair(&store);
        missing.add(&draft(Category::Missing, "Rex"), None).await.unwrap();
        let reports = missing.load().await.unwrap();
        let location = reports[0].location.unwrap();
        assert_eq!(location.lat(), 51.5);
        assert_eq!(location.lng(), -0.1);
    }

    #[tokio::test]
    async fn draft_without_location_is_stored_without_coordinates() {
        let store = InMemoryStore::new();
        let (_, found) = sync_pair(&store);
        let mut draft = draft(Category::Found, "Stray");
        draft.location = None;
        let report = found.add(&draft, None).await.unwrap();
        assert_eq!(report.location, None);
        assert!(store.rows(Category::Found)[0]["lat"].is_null());
    }

    #[tokio::test]
    async fn upload_failure_aborts_insert() {
        let store = InMemoryStore::new();
        store.set_failure(StoreOp::Upload, Some(StoreError::Unavailable("bucket".into())));
        let (missing, _) = sync_pair(&store);

        let err = missing
            .add(&draft(Category::Missing, "Rex"), Some(tiny_png()))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Upload { .. }));
        assert!(store.rows(Category::Missing).is_empty());
        assert!(missing.is_empty().await);
    }

    #[tokio::test]
    async fn invalid_photo_aborts_insert() {
        let store = InMemoryStore::new();
        let (missing, _) = sync_pair(&store);
        let err = missing
            .add(&draft(Category::Missing, "Rex"), Some(Bytes::from_static(b"not an image")))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Upload { .. }));
        assert_eq!(store.object_count(), 0);
        assert!(store.rows(Category::Missing).is_empty());
    }

    #[tokio::test]
    async fn photo_url_is_stored_with_the_row() {
        let store = InMemoryStore::new();
        let (missing, _) = sync_pair(&store);
        let report = missing
            .add(&draft(Category::Missing, "Rex"), Some(tiny_png()))
            .await
            .unwrap();
        let url = report.photo_url.unwrap();
        assert!(url.contains("missing_pets/"));
        assert_eq!(store.object_count(), 1);
    }

    #[tokio::test]
    async fn wrong_category_is_rejected() {
        let store = InMemoryStore::new();
        let (missing, _) = sync_pair(&store);
        let err = missing.add(&draft(Category::Found, "Rex"), None).await.unwrap_err();
        assert!(matches!(err, SyncError::WrongCategory { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_load_does_not_overwrite_newer_state() {
        let store = InMemoryStore::seeded();
        let (missing, _) = sync_pair(&store);

        store.set_select_delay(Category::Missing, Some(Duration::from_secs(2)));
        let slow = {
            let missing = missing.clone();
            tokio::spawn(async move { missing.load().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.set_select_delay(Category::Missing, None);
        store.remove(Category::Missing, "m2");
        missing.load().await.unwrap();
        assert_eq!(missing.len().await, 1);

        let stale = slow.await.unwrap().unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(missing.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn add_survives_a_load_that_started_before_it() {
        let store = InMemoryStore::seeded();
        let (missing, _) = sync_pair(&store);

        store.set_select_delay(Category::Missing, Some(Duration::from_secs(2)));
        let slow = {
            let missing = missing.clone();
            tokio::spawn(async move { missing.load().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let report = missing.add(&draft(Category::Missing, "Rex"), None).await.unwrap();

        slow.await.unwrap().unwrap();
        let ids: Vec<_> = missing.snapshot().await.into_iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[0], report.id);
    }

    #[tokio::test]
    async fn out_of_band_delete_is_dropped_on_reload() {
        let store = InMemoryStore::seeded();
        let (missing, _) = sync_pair(&store);
        missing.load().await.unwrap();
        store.remove(Category::Missing, "m1");
        missing.load().await.unwrap();
        let ids: Vec<_> = missing.snapshot().await.into_iter().map(|r| r.id.0).collect();
        assert_eq!(ids, ["m2"]);
    }

    #[tokio::test]
    async fn subscription_reloads_on_change_and_stops_when_disposed() {
        let store = InMemoryStore::seeded();
        let (missing, _) = sync_pair(&store);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = missing.subscribe(move |result| {
            let _ = tx.send(result.map(|reports| reports.len()));
        });
        assert!(subscription.is_active());

        store.push_raw_row(
            Category::Missing,
            json!({"id": "m3", "pet_name": "Bo", "type": "missing", "created_at": "2024-04-01T00:00:00Z"}),
        );
        assert_eq!(rx.recv().await, Some(Ok(3)));
        assert_eq!(missing.len().await, 3);

        subscription.dispose();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.subscriber_count(), 0);
        let calls_before = store.select_calls(Category::Missing);
        store.remove(Category::Missing, "m3");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.select_calls(Category::Missing), calls_before);
        assert_eq!(missing.len().await, 3);
    }

    #[tokio::test]
    async fn add_and_echo_reload_converge() {
        let store = InMemoryStore::seeded();
        let (missing, found) = sync_pair(&store);
        missing.load().await.unwrap();
        found.load().await.unwrap();
        let reloads = Arc::new(Mutex::new(0usize));
        let counter = reloads.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _subscription = missing.subscribe(move |_| {
            *counter.lock().unwrap() += 1;
            let _ = tx.send(());
        });

        missing.add(&draft(Category::Missing, "Rex"), None).await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(*reloads.lock().unwrap(), 1);
        assert_eq!(missing.len().await, 3);
        assert_eq!(found.len().await, 1);
    }

    proptest! {
        #[test]
        fn merge_front_never_duplicates(ids in proptest::collection::vec(0u8..6, 1..20)) {
            let mut state = SyncState::default();
            for id in &ids {
                let row = json!({
                    "id": id.to_string(),
                    "pet_name": "p",
                    "created_at": "2024-01-01T00:00:00Z"
                });
                state.merge_front(PetReport::from_row(Category::Missing, &row).unwrap());
            }
            let mut unique: Vec<u8> = ids.clone();
            unique.sort_unstable();
            unique.dedup();
            prop_assert_eq!(state.records.len(), unique.len());
            prop_assert_eq!(state.records[0].id.as_str(), ids.last().unwrap().to_string());
        }
    }
}
