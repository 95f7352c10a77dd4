use serde::{Deserialize, Serialize};

use crate::model::{Category, Coordinate};

/// Everything the user can do to the modal/search interaction surface.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    MapClicked { coord: Coordinate },
    ChooseCategory { category: Category },
    OpenCreate { category: Category },
    Submitted,
    Cancel,
    Dismiss,
    OpenSearch,
    CloseSearch,
}

impl UiEvent {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::MapClicked { .. } => "map_clicked",
            Self::ChooseCategory { .. } => "choose_category",
            Self::OpenCreate { .. } => "open_create",
            Self::Submitted => "submitted",
            Self::Cancel => "cancel",
            Self::Dismiss => "dismiss",
            Self::OpenSearch => "open_search",
            Self::CloseSearch => "close_search",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let event = UiEvent::ChooseCategory {
            category: Category::Found,
        };
        let value = serde_json::to_value(event).unwrap();
        assert_eq!(value["type"], "choose_category");
        assert_eq!(value["category"], "found");
        assert_eq!(event.name(), "choose_category");
    }
}
