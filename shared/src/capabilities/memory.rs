use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::store::{ChangeFeed, ChangeNotice, RemoteStore, StoreError, FEED_BUFFER};
use crate::model::{Category, NewReportRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Select,
    Insert,
    Upload,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<Category, Vec<Value>>,
    objects: HashMap<String, Bytes>,
    subscribers: Vec<(Category, mpsc::Sender<ChangeNotice>)>,
    failures: HashMap<StoreOp, StoreError>,
    select_delay: HashMap<Category, Duration>,
    select_calls: HashMap<Category, usize>,
}

impl MemoryState {
    fn notify(&mut self, category: Category) {
        self.subscribers.retain(|(cat, tx)| {
            if *cat != category {
                return !tx.is_closed();
            }
            // A full buffer already guarantees a pending reload.
            !matches!(
                tx.try_send(ChangeNotice { category }),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }
}

/// Process-local store used in demo mode and as the test double.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sample reports shown when no real store is configured.
    #[must_use]
    pub fn seeded() -> Self {
        let store = Self::new();
        {
            let mut state = store.lock();
            state.tables.insert(
                Category::Missing,
                vec![
                    json!({
                        "id": "m1",
                        "pet_name": "Max",
                        "breed": "Golden Retriever",
                        "species": "dog",
                        "last_seen": "123 Main St",
                        "contact": "john@example.com",
                        "lat": 40.7128,
                        "lng": -74.006,
                        "type": "missing",
                        "created_at": "2024-03-02T10:00:00Z"
                    }),
                    json!({
                        "id": "m2",
                        "pet_name": "Whiskers",
                        "breed": "Tabby",
                        "species": "cat",
                        "last_seen": "456 Park Ave",
                        "contact": "sarah@example.com",
                        "lat": 40.7135,
                        "lng": -74.008,
                        "type": "missing",
                        "created_at": "2024-03-01T09:30:00Z"
                    }),
                ],
            );
            state.tables.insert(
                Category::Found,
                vec![json!({
                    "id": "f1",
                    "pet_name": "Unknown",
                    "breed": "Beagle",
                    "species": "dog",
                    "found_at": "Central Park",
                    "contact": "mike@example.com",
                    "lat": 40.7821,
                    "lng": -73.9665,
                    "type": "found",
                    "created_at": "2024-03-02T08:15:00Z"
                })],
            );
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check(&self, op: StoreOp) -> Result<(), StoreError> {
        match self.lock().failures.get(&op) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Every subsequent `op` fails with `error` until cleared with `None`.
    pub fn set_failure(&self, op: StoreOp, error: Option<StoreError>) {
        let mut state = self.lock();
        match error {
            Some(err) => state.failures.insert(op, err),
            None => state.failures.remove(&op),
        };
    }

    /// Selects snapshot the rows immediately, then wait `delay` before answering.
    pub fn set_select_delay(&self, category: Category, delay: Option<Duration>) {
        let mut state = self.lock();
        match delay {
            Some(d) => state.select_delay.insert(category, d),
            None => state.select_delay.remove(&category),
        };
    }

    #[must_use]
    pub fn select_calls(&self, category: Category) -> usize {
        self.lock().select_calls.get(&category).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn rows(&self, category: Category) -> Vec<Value> {
        self.lock().tables.get(&category).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn object(&self, path: &str) -> Option<Bytes> {
        self.lock().objects.get(path).cloned()
    }

    #[must_use]
    pub fn object_count(&self) -> usize {
        self.lock().objects.len()
    }

    /// Out-of-band write, as another client would make it.
    pub fn push_raw_row(&self, category: Category, row: Value) {
        let mut state = self.lock();
        state.tables.entry(category).or_default().insert(0, row);
        state.notify(category);
    }

    /// Out-of-band delete. Returns whether a row was removed.
    pub fn remove(&self, category: Category, id: &str) -> bool {
        let mut state = self.lock();
        let Some(rows) = state.tables.get_mut(&category) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|row| row.get("id").and_then(Value::as_str) != Some(id));
        let removed = rows.len() != before;
        if removed {
            state.notify(category);
        }
        removed
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.lock();
        state.subscribers.retain(|(_, tx)| !tx.is_closed());
        state.subscribers.len()
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn select_all(&self, category: Category) -> Result<Vec<Value>, StoreError> {
        self.check(StoreOp::Select)?;
        let (rows, delay) = {
            let mut state = self.lock();
            *state.select_calls.entry(category).or_default() += 1;
            (
                state.tables.get(&category).cloned().unwrap_or_default(),
                state.select_delay.get(&category).copied(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(rows)
    }

    async fn insert(&self, category: Category, row: &NewReportRow) -> Result<Value, StoreError> {
        self.check(StoreOp::Insert)?;
        let mut value =
            serde_json::to_value(row).map_err(|e| StoreError::Rejected(e.to_string()))?;
        let Some(object) = value.as_object_mut() else {
            return Err(StoreError::Rejected("row is not an object".to_owned()));
        };
        object.insert("id".to_owned(), Value::String(uuid::Uuid::new_v4().to_string()));
        object.insert("created_at".to_owned(), Value::String(Utc::now().to_rfc3339()));

        let mut state = self.lock();
        state.tables.entry(category).or_default().insert(0, value.clone());
        state.notify(category);
        Ok(value)
    }

    async fn upload(&self, path: &str, _content_type: &str, bytes: Bytes) -> Result<String, StoreError> {
        self.check(StoreOp::Upload)?;
        self.lock().objects.insert(path.to_owned(), bytes);
        Ok(format!("memory://objects/{path}"))
    }

    fn subscribe(&self, category: Category) -> ChangeFeed {
        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        self.lock().subscribers.push((category, tx));
        ChangeFeed::new(rx, None)
    }
}
