use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::debounce::GenerationGate;
use crate::geo::{PlaceSearch, SearchCandidate};
use crate::viewport::FocusRequest;
use crate::{RESULT_ZOOM, SEARCH_LIMIT};

/// What the map should do after a result is picked.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub focus: FocusRequest,
    pub marker_label: String,
}

/// Sidebar place search. Submits explicitly, without debouncing.
pub struct SearchPanel {
    search: Arc<dyn PlaceSearch>,
    limit: usize,
    result_zoom: f64,
    query: String,
    results: Vec<SearchCandidate>,
    searching: bool,
    has_searched: bool,
    gate: GenerationGate,
}

impl SearchPanel {
    #[must_use]
    pub fn new(search: Arc<dyn PlaceSearch>) -> Self {
        Self::with_limits(search, SEARCH_LIMIT, RESULT_ZOOM)
    }

    #[must_use]
    pub fn from_config(search: Arc<dyn PlaceSearch>, config: &Config) -> Self {
        Self::with_limits(search, config.search_limit, config.result_zoom)
    }

    fn with_limits(search: Arc<dyn PlaceSearch>, limit: usize, result_zoom: f64) -> Self {
        Self {
            search,
            limit,
            result_zoom,
            query: String::new(),
            results: Vec::new(),
            searching: false,
            has_searched: false,
            gate: GenerationGate::default(),
        }
    }

    #[must_use]
    pub fn query(&self) -> &str {
        &self.query
    }

    #[must_use]
    pub fn results(&self) -> &[SearchCandidate] {
        &self.results
    }

    #[must_use]
    pub const fn is_searching(&self) -> bool {
        self.searching
    }

    #[must_use]
    pub const fn has_searched(&self) -> bool {
        self.has_searched
    }

    pub fn set_query(&mut self, text: &str) {
        text.clone_into(&mut self.query);
    }

    /// Starts a search for the current query. Returns `None` for a blank query,
    /// otherwise the generation the result must carry to be applied.
    pub fn begin(&mut self) -> Option<(u64, String)> {
        let query = self.query.trim();
        if query.is_empty() {
            return None;
        }
        let query = query.to_owned();
        self.searching = true;
        self.has_searched = true;
        Some((self.gate.advance(), query))
    }

    /// Applies a result if no newer search started since. Failures show as no results.
    pub fn finish(&mut self, generation: u64, results: Vec<SearchCandidate>) -> bool {
        if !self.gate.accepts(generation) {
            debug!(generation, current = self.gate.current(), "discarded stale search results");
            return false;
        }
        self.results = results;
        self.searching = false;
        true
    }

    #[instrument(skip(self), fields(limit = self.limit))]
    pub async fn submit(&mut self) {
        let Some((generation, query)) = self.begin() else {
            return;
        };
        let results = self.search.search(&query, self.limit).await.unwrap_or_else(|e| {
            warn!(error = %e, "place search failed");
            Vec::new()
        });
        self.finish(generation, results);
    }

    #[must_use]
    pub fn status_text(&self) -> Option<&'static str> {
        if self.searching {
            Some("Searching…")
        } else if self.results.is_empty() && self.has_searched {
            Some("No results")
        } else if self.results.is_empty() {
            Some("Type a place above to search")
        } else {
            None
        }
    }

    #[must_use]
    pub fn select(&self, candidate: &SearchCandidate) -> Selection {
        Selection {
            focus: FocusRequest {
                at: candidate.location,
                zoom: Some(self.result_zoom),
            },
            marker_label: candidate.display_name.clone(),
        }
    }

    /// Forgets the query and results; in-flight results are discarded.
    pub fn clear(&mut self) {
        self.gate.advance();
        self.query.clear();
        self.results.clear();
        self.searching = false;
        self.has_searched = false;
    }
}
