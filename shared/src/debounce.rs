//! Debounced, cancellable autocomplete over [`PlaceSearch`].
//!
//! Every keystroke advances the stream's generation. A request carries the
//! generation that was current when its quiet period elapsed, and its result
//! is applied only if that generation is still current. Acceptance is decided
//! by comparing generations, never by arrival order.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::geo::{PlaceSearch, SearchCandidate};
use crate::{AUTOCOMPLETE_LIMIT, DEBOUNCE_QUIET_PERIOD, MIN_QUERY_CHARS};

/// Monotonic counter naming the one authoritative request of a stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GenerationGate {
    current: u64,
}

impl GenerationGate {
    /// Supersedes everything issued so far.
    pub fn advance(&mut self) -> u64 {
        self.current += 1;
        self.current
    }

    #[must_use]
    pub const fn current(&self) -> u64 {
        self.current
    }

    #[must_use]
    pub const fn accepts(&self, generation: u64) -> bool {
        generation == self.current
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestionsView {
    pub loading: bool,
    pub suggestions: Vec<SearchCandidate>,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputOutcome {
    /// Too short to search; suggestions were cleared.
    Cleared,
    /// A request for `query` fires after the quiet period unless superseded.
    Scheduled { generation: u64, query: String },
}

/// Timing-free state of one query stream.
#[derive(Debug, Clone)]
pub struct QuerySession {
    gate: GenerationGate,
    text: String,
    min_chars: usize,
    view: SuggestionsView,
}

impl QuerySession {
    #[must_use]
    pub fn new(min_chars: usize) -> Self {
        Self {
            gate: GenerationGate::default(),
            text: String::new(),
            min_chars,
            view: SuggestionsView::default(),
        }
    }

    pub fn input(&mut self, text: &str) -> InputOutcome {
        self.text = text.to_owned();
        let generation = self.gate.advance();
        let query = text.trim();
        if query.chars().count() < self.min_chars {
            self.view = SuggestionsView {
                loading: false,
                suggestions: Vec::new(),
                generation,
            };
            return InputOutcome::Cleared;
        }
        // Any request still in flight is cancelled by this input.
        self.view.loading = false;
        self.view.generation = generation;
        InputOutcome::Scheduled {
            generation,
            query: query.to_owned(),
        }
    }

    /// Quiet period elapsed. False if the generation was superseded meanwhile.
    pub fn fire(&mut self, generation: u64) -> bool {
        if !self.gate.accepts(generation) {
            return false;
        }
        self.view = SuggestionsView {
            loading: true,
            suggestions: Vec::new(),
            generation,
        };
        true
    }

    /// Applies a response. Stale generations leave the view untouched.
    pub fn complete(&mut self, generation: u64, suggestions: Vec<SearchCandidate>) -> bool {
        if !self.gate.accepts(generation) {
            return false;
        }
        self.view = SuggestionsView {
            loading: false,
            suggestions,
            generation,
        };
        true
    }

    /// Invalidates every outstanding generation and empties the view.
    pub fn teardown(&mut self) {
        let generation = self.gate.advance();
        self.text.clear();
        self.view = SuggestionsView {
            loading: false,
            suggestions: Vec::new(),
            generation,
        };
    }

    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    #[must_use]
    pub const fn view(&self) -> &SuggestionsView {
        &self.view
    }
}

struct Inflight {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    session: Mutex<QuerySession>,
    view_tx: watch::Sender<SuggestionsView>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QuerySession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mutates the session and publishes the resulting view atomically.
    fn update<R>(&self, f: impl FnOnce(&mut QuerySession) -> R) -> R {
        let mut session = self.lock();
        let result = f(&mut session);
        self.view_tx.send_if_modified(|view| {
            if view == session.view() {
                return false;
            }
            view.clone_from(session.view());
            true
        });
        result
    }
}

/// One autocomplete stream bound to an input field.
///
/// Must be driven from within a tokio runtime; each scheduled query runs on
/// its own task. Dropping the stream tears it down.
pub struct DebouncedQuery {
    search: Arc<dyn PlaceSearch>,
    limit: usize,
    quiet_period: Duration,
    shared: Arc<Shared>,
    inflight: Option<Inflight>,
}

impl DebouncedQuery {
    #[must_use]
    pub fn new(
        search: Arc<dyn PlaceSearch>,
        limit: usize,
        quiet_period: Duration,
        min_chars: usize,
    ) -> Self {
        let (view_tx, _) = watch::channel(SuggestionsView::default());
        Self {
            search,
            limit,
            quiet_period,
            shared: Arc::new(Shared {
                session: Mutex::new(QuerySession::new(min_chars)),
                view_tx,
            }),
            inflight: None,
        }
    }

    #[must_use]
    pub fn autocomplete(search: Arc<dyn PlaceSearch>) -> Self {
        Self::new(search, AUTOCOMPLETE_LIMIT, DEBOUNCE_QUIET_PERIOD, MIN_QUERY_CHARS)
    }

    #[must_use]
    pub fn from_config(search: Arc<dyn PlaceSearch>, config: &Config) -> Self {
        Self::new(
            search,
            config.autocomplete_limit,
            config.debounce,
            config.min_query_chars,
        )
    }

    pub fn on_input(&mut self, text: &str) {
        self.cancel_inflight();
        let outcome = self.shared.update(|session| session.input(text));
        let InputOutcome::Scheduled { generation, query } = outcome else {
            return;
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let shared = Arc::clone(&self.shared);
        let search = Arc::clone(&self.search);
        let limit = self.limit;
        let quiet_period = self.quiet_period;

        let handle = tokio::spawn(async move {
            tokio::select! {
                () = cancelled.cancelled() => return,
                () = tokio::time::sleep(quiet_period) => {}
            }
            if !shared.update(|session| session.fire(generation)) {
                return;
            }
            let result = tokio::select! {
                () = cancelled.cancelled() => {
                    debug!(generation, "query superseded in flight");
                    return;
                }
                result = search.search(&query, limit) => result,
            };
            let suggestions = result.unwrap_or_else(|e| {
                warn!(generation, error = %e, "autocomplete search failed");
                Vec::new()
            });
            if !shared.update(|session| session.complete(generation, suggestions)) {
                debug!(generation, "discarded stale suggestions");
            }
        });
        self.inflight = Some(Inflight { token, handle });
    }

    /// Cancels any pending timer or request; nothing fires afterwards.
    pub fn teardown(&mut self) {
        self.cancel_inflight();
        self.shared.update(QuerySession::teardown);
    }

    /// Drops current suggestions, e.g. after one was picked, keeping the text.
    pub fn clear_suggestions(&mut self) {
        self.cancel_inflight();
        self.shared.update(|session| {
            let text = session.text().to_owned();
            session.teardown();
            session.text = text;
        });
    }

    #[must_use]
    pub fn view(&self) -> SuggestionsView {
        self.shared.lock().view().clone()
    }

    #[must_use]
    pub fn text(&self) -> String {
        self.shared.lock().text().to_owned()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SuggestionsView> {
        self.shared.view_tx.subscribe()
    }

    fn cancel_inflight(&mut self) {
        if let Some(inflight) = self.inflight.take() {
            inflight.token.cancel();
            inflight.handle.abort();
        }
    }
}

impl Drop for DebouncedQuery {
    fn drop(&mut self) {
        self.cancel_inflight();
    }
}
