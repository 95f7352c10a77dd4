use serde::Serialize;
use tracing::debug;

use crate::event::UiEvent;
use crate::model::{Category, Coordinate};

/// The modal axis. Being an enum, two modals can never be open at once.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Modal {
    AskType { pending: Coordinate },
    CreateMissing { pending: Option<Coordinate> },
    CreateFound { pending: Option<Coordinate> },
}

impl Modal {
    #[must_use]
    pub const fn create(category: Category, pending: Option<Coordinate>) -> Self {
        match category {
            Category::Missing => Self::CreateMissing { pending },
            Category::Found => Self::CreateFound { pending },
        }
    }

    #[must_use]
    pub const fn pending(&self) -> Option<Coordinate> {
        match *self {
            Self::AskType { pending } => Some(pending),
            Self::CreateMissing { pending } | Self::CreateFound { pending } => pending,
        }
    }

    /// Category of a create modal; `None` while asking for the type.
    #[must_use]
    pub const fn category(&self) -> Option<Category> {
        match self {
            Self::AskType { .. } => None,
            Self::CreateMissing { .. } => Some(Category::Missing),
            Self::CreateFound { .. } => Some(Category::Found),
        }
    }

    #[must_use]
    pub const fn mode(&self) -> UiMode {
        match self {
            Self::AskType { .. } => UiMode::AskType,
            Self::CreateMissing { .. } => UiMode::CreateMissing,
            Self::CreateFound { .. } => UiMode::CreateFound,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiMode {
    Idle,
    AskType,
    CreateMissing,
    CreateFound,
    SearchOpen,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transition {
    pub before: InteractionStateMachine,
    pub after: InteractionStateMachine,
}

impl Transition {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.before != self.after
    }

    /// A modal that this transition closed or replaced.
    #[must_use]
    pub fn closed_modal(&self) -> Option<Modal> {
        match (self.before.modal, self.after.modal) {
            (Some(before), Some(after)) if before == after => None,
            (before, _) => before,
        }
    }
}

/// Which UI surface is visible: at most one modal, plus the search panel flag.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct InteractionStateMachine {
    modal: Option<Modal>,
    search_open: bool,
}

impl InteractionStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub const fn modal(&self) -> Option<Modal> {
        self.modal
    }

    #[must_use]
    pub const fn search_open(&self) -> bool {
        self.search_open
    }

    #[must_use]
    pub fn pending(&self) -> Option<Coordinate> {
        self.modal.and_then(|m| m.pending())
    }

    /// The modal mode when one is open, else `SearchOpen` or `Idle`.
    #[must_use]
    pub fn mode(&self) -> UiMode {
        match (self.modal, self.search_open) {
            (Some(modal), _) => modal.mode(),
            (None, true) => UiMode::SearchOpen,
            (None, false) => UiMode::Idle,
        }
    }

    #[must_use]
    pub fn is_visible(&self, mode: UiMode) -> bool {
        match mode {
            UiMode::SearchOpen => self.search_open,
            UiMode::Idle => self.modal.is_none() && !self.search_open,
            modal => self.modal.map(|m| m.mode()) == Some(modal),
        }
    }

    /// The only way the state changes. Events that do not apply in the
    /// current state leave it untouched.
    pub fn transition(&mut self, event: UiEvent) -> Transition {
        let before = *self;
        match event {
            UiEvent::MapClicked { coord } => {
                self.modal = Some(Modal::AskType { pending: coord });
            }
            UiEvent::ChooseCategory { category } => {
                if let Some(Modal::AskType { pending }) = self.modal {
                    self.modal = Some(Modal::create(category, Some(pending)));
                }
            }
            UiEvent::OpenCreate { category } => {
                self.modal = Some(Modal::create(category, None));
            }
            UiEvent::Submitted => {
                if self.modal.and_then(|m| m.category()).is_some() {
                    self.modal = None;
                }
            }
            UiEvent::Cancel => self.modal = None,
            UiEvent::Dismiss => {
                self.search_open = false;
                self.modal = None;
            }
            UiEvent::OpenSearch => self.search_open = true,
            UiEvent::CloseSearch => self.search_open = false,
        }
        let transition = Transition {
            before,
            after: *self,
        };
        if transition.changed() {
            debug!(event = event.name(), from = ?before.mode(), to = ?self.mode(), "ui transition");
        }
        transition
    }
}
