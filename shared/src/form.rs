use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::config::Config;
use crate::debounce::{DebouncedQuery, SuggestionsView};
use crate::geo::{PlaceSearch, SearchCandidate};
use crate::model::{Category, Coordinate, CoordinateError, ReportDraft, Species};
use crate::{AppError, ErrorKind};

/// Prefill coordinates closer than this count as unchanged.
const SAME_POINT_TOLERANCE: f64 = 1e-9;

/// The location field as the modal shows it.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LocationView {
    pub label: String,
    pub coords: Option<Coordinate>,
    /// A reverse geocode for `coords` is still outstanding.
    pub resolving: bool,
    /// Bumped by every edit; a label lookup applies only to its own generation.
    pub generation: u64,
}

/// State behind one create-report modal.
///
/// The location field is backed by its own autocomplete stream; typing in it
/// drops any resolved point until a suggestion or a geolocation fix supplies
/// a new one. Points arrive immediately and their labels follow from a
/// background reverse geocode.
pub struct ReportForm {
    category: Category,
    search: Arc<dyn PlaceSearch>,
    pub pet_name: String,
    pub breed: String,
    pub species: Species,
    pub contact: String,
    location: Arc<watch::Sender<LocationView>>,
    label_task: Option<JoinHandle<()>>,
    photo: Option<Bytes>,
    error: Option<AppError>,
    query: DebouncedQuery,
}

impl fmt::Debug for ReportForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportForm")
            .field("category", &self.category)
            .field("species", &self.species)
            .field("coords", &self.coords())
            .field("has_photo", &self.photo.is_some())
            .field("contact", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl ReportForm {
    #[must_use]
    pub fn new(category: Category, search: Arc<dyn PlaceSearch>, config: &Config) -> Self {
        let query = DebouncedQuery::from_config(Arc::clone(&search), config);
        Self::with_query(category, search, query)
    }

    #[must_use]
    pub fn with_query(category: Category, search: Arc<dyn PlaceSearch>, query: DebouncedQuery) -> Self {
        let (location, _) = watch::channel(LocationView::default());
        Self {
            category,
            search,
            pet_name: String::new(),
            breed: String::new(),
            species: Species::default(),
            contact: String::new(),
            location: Arc::new(location),
            label_task: None,
            photo: None,
            error: None,
            query,
        }
    }

    #[must_use]
    pub const fn category(&self) -> Category {
        self.category
    }

    #[must_use]
    pub fn location(&self) -> LocationView {
        self.location.borrow().clone()
    }

    #[must_use]
    pub fn location_label(&self) -> String {
        self.location.borrow().label.clone()
    }

    #[must_use]
    pub fn coords(&self) -> Option<Coordinate> {
        self.location.borrow().coords
    }

    #[must_use]
    pub fn subscribe_location(&self) -> watch::Receiver<LocationView> {
        self.location.subscribe()
    }

    /// Waits for an outstanding label lookup, then returns the label.
    pub async fn resolved_label(&self) -> String {
        let mut updates = self.location.subscribe();
        let label = match updates.wait_for(|view| !view.resolving).await {
            Ok(view) => view.label.clone(),
            Err(_) => self.location_label(),
        };
        label
    }

    #[must_use]
    pub const fn photo(&self) -> Option<&Bytes> {
        self.photo.as_ref()
    }

    /// Failure of the last submit attempt, shown inside the modal.
    #[must_use]
    pub const fn error(&self) -> Option<&AppError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: Option<AppError>) {
        self.error = error;
    }

    #[must_use]
    pub fn suggestions(&self) -> SuggestionsView {
        self.query.view()
    }

    #[must_use]
    pub fn subscribe_suggestions(&self) -> watch::Receiver<SuggestionsView> {
        self.query.subscribe()
    }

    /// Adopts the point the modal was opened with. The label is resolved in
    /// the background. Returns false when the point is absent or already adopted.
    #[instrument(skip(self), fields(category = %self.category))]
    pub fn prefill(&mut self, initial: Option<Coordinate>) -> bool {
        let Some(initial) = initial else {
            return false;
        };
        if self
            .coords()
            .is_some_and(|current| current.approx_eq(initial, SAME_POINT_TOLERANCE))
        {
            return false;
        }
        self.adopt_point(initial);
        true
    }

    /// The user typed in the location field.
    pub fn edit_location(&mut self, text: &str) {
        self.cancel_label();
        self.location.send_modify(|view| {
            view.generation += 1;
            text.clone_into(&mut view.label);
            view.coords = None;
            view.resolving = false;
        });
        self.query.on_input(text);
    }

    pub fn select_suggestion(&mut self, candidate: &SearchCandidate) {
        self.cancel_label();
        self.location.send_modify(|view| {
            view.generation += 1;
            view.label.clone_from(&candidate.display_name);
            view.coords = Some(candidate.location);
            view.resolving = false;
        });
        self.query.clear_suggestions();
        debug!(place = %candidate.place_id, "suggestion selected");
    }

    /// Applies a device geolocation fix.
    pub fn use_my_location(&mut self, lat: f64, lng: f64) -> Result<Coordinate, CoordinateError> {
        let at = Coordinate::new(lat, lng)?;
        self.adopt_point(at);
        self.query.clear_suggestions();
        Ok(at)
    }

    pub fn attach_photo(&mut self, bytes: Bytes) {
        self.photo = Some(bytes);
    }

    pub fn clear_photo(&mut self) {
        self.photo = None;
    }

    /// Sets the point now and labels it once the reverse geocode answers,
    /// unless the field was edited in the meantime.
    fn adopt_point(&mut self, at: Coordinate) {
        self.cancel_label();
        let mut generation = 0;
        self.location.send_modify(|view| {
            view.generation += 1;
            view.coords = Some(at);
            view.resolving = true;
            generation = view.generation;
        });

        let location = Arc::clone(&self.location);
        let search = Arc::clone(&self.search);
        self.label_task = Some(tokio::spawn(async move {
            let label = search.reverse_geocode(at).await;
            let applied = location.send_if_modified(|view| {
                if view.generation != generation {
                    return false;
                }
                view.label = label;
                view.resolving = false;
                true
            });
            if !applied {
                debug!(generation, "discarded stale location label");
            }
        }));
    }

    fn cancel_label(&mut self) {
        if let Some(task) = self.label_task.take() {
            task.abort();
        }
    }

    /// A report needs at least a pet name.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.pet_name.trim().is_empty() {
            return Err(AppError::new(ErrorKind::Validation, "Please enter the pet's name")
                .with_context("field", "pet_name"));
        }
        Ok(())
    }

    #[must_use]
    pub fn to_draft(&self) -> ReportDraft {
        ReportDraft {
            category: self.category,
            pet_name: self.pet_name.trim().to_owned(),
            breed: self.breed.trim().to_owned(),
            species: self.species,
            contact: self.contact.trim().to_owned(),
            location_label: self.location_label().trim().to_owned(),
            location: self.coords(),
        }
    }

    /// Clears every field and stops the autocomplete stream.
    pub fn reset(&mut self) {
        self.query.teardown();
        self.cancel_label();
        self.location.send_modify(|view| {
            *view = LocationView {
                generation: view.generation + 1,
                ..LocationView::default()
            };
        });
        self.pet_name.clear();
        self.breed.clear();
        self.species = Species::default();
        self.contact.clear();
        self.photo = None;
        self.error = None;
    }
}

impl Drop for ReportForm {
    fn drop(&mut self) {
        self.cancel_label();
    }
}
