//! The per-session service object.
//!
//! Owns both record collections, the interaction state, the map camera and
//! every query stream. Construct once, call [`Session::start`], and call
//! [`Session::shutdown`] when the map goes away.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::capabilities::Capabilities;
use crate::config::Config;
use crate::event::UiEvent;
use crate::form::ReportForm;
use crate::geo::{GeoSearchClient, PlaceSearch, SearchCandidate};
use crate::interaction::{InteractionStateMachine, Modal, Transition};
use crate::model::{Category, Coordinate, PetReport};
use crate::search_panel::SearchPanel;
use crate::sync::{RecordSync, Subscription, SyncError};
use crate::viewport::{FlyTo, MapViewport, MarkerLayer};
use crate::{AppError, ErrorKind};

/// Dismissible error banner shared with the feed tasks.
#[derive(Clone, Default)]
struct Banner {
    slot: Arc<Mutex<Option<AppError>>>,
}

impl Banner {
    fn lock(&self) -> MutexGuard<'_, Option<AppError>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn show(&self, error: AppError) {
        if error.is_silent() {
            return;
        }
        warn!(code = error.code(), "banner: {}", error.message);
        *self.lock() = Some(error);
    }

    fn current(&self) -> Option<AppError> {
        self.lock().clone()
    }

    fn dismiss(&self) {
        *self.lock() = None;
    }
}

pub struct Session {
    config: Config,
    places: Arc<dyn PlaceSearch>,
    missing: RecordSync,
    found: RecordSync,
    ui: InteractionStateMachine,
    viewport: MapViewport,
    search_panel: SearchPanel,
    form: Option<ReportForm>,
    banner: Banner,
    subscriptions: Vec<Subscription>,
    changes: watch::Sender<u64>,
}

impl Session {
    pub fn new(config: Config, capabilities: Capabilities) -> Result<Self, AppError> {
        let places: Arc<dyn PlaceSearch> =
            Arc::new(GeoSearchClient::new(Arc::clone(&capabilities.http), &config));
        Self::with_places(config, capabilities, places)
    }

    /// Like [`Session::new`] with a caller-supplied place search.
    pub fn with_places(
        config: Config,
        capabilities: Capabilities,
        places: Arc<dyn PlaceSearch>,
    ) -> Result<Self, AppError> {
        config.validate()?;
        let sync = |category| {
            RecordSync::with_timeout(category, Arc::clone(&capabilities.store), config.request_timeout)
        };
        let (changes, _) = watch::channel(0);
        Ok(Self {
            missing: sync(Category::Missing),
            found: sync(Category::Found),
            ui: InteractionStateMachine::new(),
            viewport: MapViewport::from_config(&config),
            search_panel: SearchPanel::from_config(Arc::clone(&places), &config),
            form: None,
            banner: Banner::default(),
            subscriptions: Vec::new(),
            changes,
            places,
            config,
        })
    }

    /// Subscribes to both change feeds, then loads both collections, so a
    /// change landing during the first load still triggers a reload.
    /// Failures land in the banner; the session stays usable.
    #[instrument(skip(self))]
    pub async fn start(&mut self) {
        self.subscriptions.clear();
        for sync in [&self.missing, &self.found] {
            let banner = self.banner.clone();
            let changes = self.changes.clone();
            self.subscriptions.push(sync.subscribe(move |result: Result<Vec<PetReport>, SyncError>| {
                if let Err(e) = result {
                    banner.show(e.into());
                }
                changes.send_modify(|revision| *revision += 1);
            }));
        }

        let (missing, found) = tokio::join!(self.missing.load(), self.found.load());
        for result in [missing, found] {
            if let Err(e) = result {
                self.banner.show(e.into());
            }
        }
        self.changes.send_modify(|revision| *revision += 1);
        info!("session started");
    }

    /// Disposes every subscription and stops every query stream.
    pub fn shutdown(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            subscription.dispose();
        }
        if let Some(mut form) = self.form.take() {
            form.reset();
        }
        self.search_panel.clear();
        info!("session shut down");
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub const fn records(&self, category: Category) -> &RecordSync {
        match category {
            Category::Missing => &self.missing,
            Category::Found => &self.found,
        }
    }

    #[must_use]
    pub const fn ui(&self) -> &InteractionStateMachine {
        &self.ui
    }

    #[must_use]
    pub const fn viewport(&self) -> &MapViewport {
        &self.viewport
    }

    pub fn viewport_mut(&mut self) -> &mut MapViewport {
        &mut self.viewport
    }

    #[must_use]
    pub const fn search_panel(&self) -> &SearchPanel {
        &self.search_panel
    }

    pub fn search_panel_mut(&mut self) -> &mut SearchPanel {
        &mut self.search_panel
    }

    /// The open create modal's form.
    #[must_use]
    pub const fn form(&self) -> Option<&ReportForm> {
        self.form.as_ref()
    }

    pub fn form_mut(&mut self) -> Option<&mut ReportForm> {
        self.form.as_mut()
    }

    #[must_use]
    pub fn banner(&self) -> Option<AppError> {
        self.banner.current()
    }

    pub fn dismiss_banner(&mut self) {
        self.banner.dismiss();
    }

    /// Ticks whenever either collection changes.
    #[must_use]
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Feeds one user event through the state machine and keeps the form in
    /// step. Never waits on I/O; a prefilled point is labelled in the background.
    pub fn handle(&mut self, event: UiEvent) -> Transition {
        let transition = self.ui.transition(event);
        let opened = match transition.after.modal() {
            Some(modal @ (Modal::CreateMissing { .. } | Modal::CreateFound { .. }))
                if transition.before.modal() != Some(modal) =>
            {
                Some(modal)
            }
            _ => None,
        };

        if transition.closed_modal().is_some() {
            if let Some(mut form) = self.form.take() {
                form.reset();
            }
        }
        if let Some(modal) = opened {
            if let Some(category) = modal.category() {
                let mut form = ReportForm::new(category, Arc::clone(&self.places), &self.config);
                form.prefill(modal.pending());
                self.form = Some(form);
            }
        }
        transition
    }

    /// Submits the open form. On failure the modal and every field stay as
    /// they were; upload failures are shown in the form, others in the banner.
    #[instrument(skip(self))]
    pub async fn submit(&mut self) -> Result<PetReport, AppError> {
        let Some(form) = self.form.as_mut() else {
            return Err(AppError::new(ErrorKind::Validation, "No report form is open"));
        };
        form.set_error(None);
        if let Err(e) = form.validate() {
            form.set_error(Some(e.clone()));
            return Err(e);
        }
        let draft = form.to_draft();
        let photo = form.photo().cloned();
        let sync = match draft.category {
            Category::Missing => &self.missing,
            Category::Found => &self.found,
        };

        let result = sync.add(&draft, photo).await;
        match result {
            Ok(report) => {
                self.changes.send_modify(|revision| *revision += 1);
                self.handle(UiEvent::Submitted);
                Ok(report)
            }
            Err(e) => {
                let error = AppError::from(e);
                if error.kind == ErrorKind::Upload {
                    if let Some(form) = self.form.as_mut() {
                        form.set_error(Some(error.clone()));
                    }
                } else {
                    self.banner.show(error.clone());
                }
                Err(error)
            }
        }
    }

    /// Runs the sidebar search, opening the panel if it was closed.
    pub async fn submit_search(&mut self) {
        self.handle(UiEvent::OpenSearch);
        self.search_panel.submit().await;
    }

    /// Current markers for both collections and the search result.
    pub async fn markers(&self) -> MarkerLayer {
        let (missing, found) = tokio::join!(self.missing.snapshot(), self.found.snapshot());
        self.viewport.render(&missing, &found)
    }

    pub fn focus(&mut self, at: Coordinate, zoom: Option<f64>) -> FlyTo {
        self.viewport.focus(at, zoom)
    }

    /// Flies to a search result and drops the search marker on it.
    pub fn select_search_result(&mut self, candidate: &SearchCandidate) -> FlyTo {
        let selection = self.search_panel.select(candidate);
        self.viewport
            .set_search_marker(selection.focus.at, selection.marker_label);
        self.viewport.apply(selection.focus)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{testing::ScriptedTransport, InMemoryStore, StoreError, StoreOp};
    use crate::geo::GeoError;
    use crate::interaction::UiMode;
    use crate::RESULT_ZOOM;
    use async_trait::async_trait;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    /// Reverse geocoding that takes as long as the request timeout.
    struct StalledPlaces;

    #[async_trait]
    impl PlaceSearch for StalledPlaces {
        async fn search(&self, _text: &str, _limit: usize) -> Result<Vec<SearchCandidate>, GeoError> {
            Ok(Vec::new())
        }

        async fn reverse_geocode(&self, at: Coordinate) -> String {
            tokio::time::sleep(Duration::from_secs(10)).await;
            at.fallback_label()
        }
    }

    fn session_with(store: &InMemoryStore, transport: &Arc<ScriptedTransport>) -> Session {
        let capabilities = Capabilities::new(transport.clone(), Arc::new(store.clone()));
        Session::new(Config::default(), capabilities).unwrap()
    }

    fn paris() -> Coordinate {
        Coordinate::new(48.8566, 2.3522).unwrap()
    }

    #[tokio::test]
    async fn start_loads_both_categories() {
        let store = InMemoryStore::seeded();
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);
        session.start().await;

        assert_eq!(session.records(Category::Missing).len().await, 2);
        assert_eq!(session.records(Category::Found).len().await, 1);
        assert_eq!(session.markers().await.len(), 3);
        assert!(session.banner().is_none());
        assert_eq!(store.subscriber_count(), 2);

        session.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(store.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn failed_load_shows_banner_with_empty_collection() {
        let store = InMemoryStore::seeded();
        store.set_failure(StoreOp::Select, Some(StoreError::Unavailable("down".into())));
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);
        session.start().await;

        assert!(session.records(Category::Missing).is_empty().await);
        let banner = session.banner().unwrap();
        assert_eq!(banner.kind, ErrorKind::Network);
        session.dismiss_banner();
        assert!(session.banner().is_none());
    }

    #[tokio::test]
    async fn map_click_opens_prefilled_form() {
        let store = InMemoryStore::new();
        let transport = Arc::new(ScriptedTransport::default());
        transport.reply_json(200, &json!({"display_name": "Paris, France"}));
        let mut session = session_with(&store, &transport);

        session.handle(UiEvent::MapClicked { coord: paris() });
        assert!(session.form().is_none());
        session.handle(UiEvent::ChooseCategory {
            category: Category::Found,
        });

        let form = session.form().unwrap();
        assert_eq!(form.category(), Category::Found);
        assert_eq!(form.coords(), Some(paris()));
        assert_eq!(form.resolved_label().await, "Paris, France");

        session.handle(UiEvent::Cancel);
        assert!(session.form().is_none());
        assert_eq!(session.ui().mode(), UiMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_reverse_geocode_never_blocks_the_modal() {
        let store = InMemoryStore::new();
        let transport = Arc::new(ScriptedTransport::default());
        let capabilities = Capabilities::new(transport, Arc::new(store));
        let mut session =
            Session::with_places(Config::default(), capabilities, Arc::new(StalledPlaces)).unwrap();
        let started = tokio::time::Instant::now();

        session.handle(UiEvent::MapClicked { coord: paris() });
        session.handle(UiEvent::ChooseCategory {
            category: Category::Missing,
        });
        let location = session.form().unwrap().location();
        assert_eq!(location.coords, Some(paris()));
        assert!(location.resolving);

        session.handle(UiEvent::Dismiss);
        assert!(session.form().is_none());
        assert_eq!(session.ui().mode(), UiMode::Idle);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn change_during_first_load_is_not_missed() {
        let store = InMemoryStore::seeded();
        store.set_select_delay(Category::Found, Some(Duration::from_millis(50)));
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);

        let writer = store.clone();
        tokio::join!(session.start(), async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(writer.remove(Category::Found, "f1"));
        });

        tokio::time::timeout(Duration::from_secs(2), async {
            while !session.records(Category::Found).is_empty().await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("removal during the first load was never picked up");
        assert_eq!(session.records(Category::Missing).len().await, 2);
    }

    #[tokio::test]
    async fn submit_success_closes_modal_and_adds_record() {
        let store = InMemoryStore::seeded();
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);
        session.start().await;

        session.handle(UiEvent::OpenCreate {
            category: Category::Missing,
        });
        session.form_mut().unwrap().pet_name = "Rex".to_owned();
        let report = session.submit().await.unwrap();

        assert_eq!(report.location, None);
        assert_eq!(session.ui().modal(), None);
        assert!(session.form().is_none());
        assert_eq!(session.records(Category::Missing).len().await, 3);
        assert_eq!(session.records(Category::Found).len().await, 1);
        // No coordinates, no marker.
        assert_eq!(session.markers().await.len(), 3);
    }

    #[tokio::test]
    async fn failed_upload_keeps_modal_and_draft() {
        let store = InMemoryStore::new();
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);
        session.handle(UiEvent::OpenCreate {
            category: Category::Found,
        });
        let form = session.form_mut().unwrap();
        form.pet_name = "Stray".to_owned();
        form.attach_photo(Bytes::from_static(b"definitely not an image"));

        let err = session.submit().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Upload);
        assert!(session.ui().is_visible(UiMode::CreateFound));
        let form = session.form().unwrap();
        assert_eq!(form.pet_name, "Stray");
        assert!(form.photo().is_some());
        assert_eq!(form.error().map(|e| e.kind), Some(ErrorKind::Upload));
        assert!(session.banner().is_none());
        assert!(store.rows(Category::Found).is_empty());
    }

    #[tokio::test]
    async fn failed_insert_goes_to_banner() {
        let store = InMemoryStore::new();
        store.set_failure(StoreOp::Insert, Some(StoreError::Unavailable("down".into())));
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);
        session.handle(UiEvent::OpenCreate {
            category: Category::Missing,
        });
        session.form_mut().unwrap().pet_name = "Rex".to_owned();

        assert!(session.submit().await.is_err());
        assert_eq!(session.banner().map(|e| e.kind), Some(ErrorKind::Network));
        assert_eq!(session.form().unwrap().pet_name, "Rex");
    }

    #[tokio::test]
    async fn blank_name_is_rejected_before_any_io() {
        let store = InMemoryStore::new();
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);
        assert_eq!(session.submit().await.unwrap_err().kind, ErrorKind::Validation);

        session.handle(UiEvent::OpenCreate {
            category: Category::Missing,
        });
        assert_eq!(session.submit().await.unwrap_err().kind, ErrorKind::Validation);
        assert!(store.rows(Category::Missing).is_empty());
        assert!(session.banner().is_none());
    }

    #[tokio::test]
    async fn selecting_search_result_flies_and_marks() {
        let store = InMemoryStore::new();
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);
        let candidate = SearchCandidate {
            place_id: crate::model::PlaceId::new("1"),
            display_name: "Eiffel Tower".to_owned(),
            location: paris(),
            kind: "attraction".to_owned(),
        };
        let fly = session.select_search_result(&candidate);
        assert_eq!(fly.zoom.value(), RESULT_ZOOM);
        let layer = session.markers().await;
        assert_eq!(layer.get("search").unwrap().title, "Eiffel Tower");
    }

    #[tokio::test]
    async fn remote_change_reaches_the_session() {
        let store = InMemoryStore::seeded();
        let transport = Arc::new(ScriptedTransport::default());
        let mut session = session_with(&store, &transport);
        session.start().await;
        let mut changes = session.changes();
        changes.borrow_and_update();

        store.remove(Category::Found, "f1");
        changes.changed().await.unwrap();
        assert!(session.records(Category::Found).is_empty().await);
        assert_eq!(session.records(Category::Missing).len().await, 2);
    }
}
