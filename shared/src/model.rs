use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::debug;

use crate::{AppError, ErrorKind, COORDINATE_PRECISION, DEFAULT_CENTER};

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(RecordId);
typed_id!(PlaceId);

// --- Coordinate: validated, NaN-safe ---

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoordinateError {
    #[error("Latitude {0} is out of valid range [-90, 90]")]
    LatitudeOutOfRange(f64),
    #[error("Longitude {0} is out of valid range [-180, 180]")]
    LongitudeOutOfRange(f64),
    #[error("Coordinate value is not finite (NaN or Infinity)")]
    NonFinite,
}

impl From<CoordinateError> for AppError {
    fn from(e: CoordinateError) -> Self {
        AppError::new(ErrorKind::Validation, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    lat: f64,
    lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Result<Self, CoordinateError> {
        if !lat.is_finite() || !lng.is_finite() {
            return Err(CoordinateError::NonFinite);
        }
        if !(-90.0..=90.0).contains(&lat) {
            return Err(CoordinateError::LatitudeOutOfRange(lat));
        }
        if !(-180.0..=180.0).contains(&lng) {
            return Err(CoordinateError::LongitudeOutOfRange(lng));
        }
        Ok(Self { lat, lng })
    }

    /// Where the map opens when nothing else is configured.
    #[must_use]
    pub const fn default_center() -> Self {
        Self {
            lat: DEFAULT_CENTER.0,
            lng: DEFAULT_CENTER.1,
        }
    }

    #[must_use]
    pub const fn lat(self) -> f64 {
        self.lat
    }

    #[must_use]
    pub const fn lng(self) -> f64 {
        self.lng
    }

    #[must_use]
    pub fn approx_eq(self, other: Self, tolerance: f64) -> bool {
        (self.lat - other.lat).abs() < tolerance && (self.lng - other.lng).abs() < tolerance
    }

    /// Deterministic `"{lat}, {lng}"` label used when reverse geocoding fails.
    #[must_use]
    pub fn fallback_label(self) -> String {
        self.label(COORDINATE_PRECISION)
    }

    #[must_use]
    pub fn label(self, precision: usize) -> String {
        format!(
            "{}, {}",
            format_fixed(self.lat, precision),
            format_fixed(self.lng, precision)
        )
    }

    /// Cache key at the precision the fallback label is rendered with.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn rounded_key(self) -> (i64, i64) {
        let scale = 10f64.powi(COORDINATE_PRECISION as i32);
        ((self.lat * scale).round() as i64, (self.lng * scale).round() as i64)
    }
}

impl TryFrom<(f64, f64)> for Coordinate {
    type Error = CoordinateError;

    fn try_from((lat, lng): (f64, f64)) -> Result<Self, Self::Error> {
        Self::new(lat, lng)
    }
}

/// Fixed precision with trailing zeros trimmed: `10.0 -> "10"`, `2.35220 -> "2.3522"`.
#[must_use]
pub fn format_fixed(value: f64, precision: usize) -> String {
    let value = if value == 0.0 { 0.0 } else { value };
    let text = format!("{value:.precision$}");
    if !text.contains('.') {
        return text;
    }
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    if trimmed == "-0" {
        "0".to_owned()
    } else {
        trimmed.to_owned()
    }
}

// --- Domain enums ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Missing,
    Found,
}

impl Category {
    pub const ALL: [Self; 2] = [Self::Missing, Self::Found];

    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Missing => "missing",
            Self::Found => "found",
        }
    }

    #[must_use]
    pub const fn table(self) -> &'static str {
        match self {
            Self::Missing => "missing_pets",
            Self::Found => "found_pets",
        }
    }

    #[must_use]
    pub const fn location_column(self) -> &'static str {
        match self {
            Self::Missing => "last_seen",
            Self::Found => "found_at",
        }
    }

    #[must_use]
    pub const fn location_caption(self) -> &'static str {
        match self {
            Self::Missing => "Last seen",
            Self::Found => "Found at",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    #[default]
    Dog,
    Cat,
    Bird,
    Other,
}

impl Species {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dog => "dog",
            Self::Cat => "cat",
            Self::Bird => "bird",
            Self::Other => "other",
        }
    }

    /// Case-insensitive; anything unrecognised is `Other`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dog" => Self::Dog,
            "cat" => Self::Cat,
            "bird" => Self::Bird,
            _ => Self::Other,
        }
    }
}

// --- Records ---

#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PetReport {
    pub id: RecordId,
    pub category: Category,
    pub pet_name: String,
    pub breed: String,
    pub species: Species,
    pub contact: String,
    pub location_label: String,
    pub location: Option<Coordinate>,
    pub photo_url: Option<String>,
    /// Absent when the store row carries no readable timestamp.
    pub created_at: Option<DateTime<Utc>>,
}

// Redact contact details; they are user-provided personal data.
impl fmt::Debug for PetReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PetReport")
            .field("id", &self.id)
            .field("category", &self.category)
            .field("species", &self.species)
            .field("location", &self.location)
            .field("contact_present", &!self.contact.is_empty())
            .field("photo_present", &self.photo_url.is_some())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrityReason {
    #[error("row is not a valid report object: {0}")]
    Malformed(String),
    #[error("row has no id")]
    MissingId,
    #[error("row has no pet name")]
    MissingPetName,
    #[error("{field} is not a number")]
    NonNumericCoordinate { field: &'static str },
    #[error("only one of lat/lng is present")]
    PartialCoordinate,
    #[error(transparent)]
    InvalidCoordinate(#[from] CoordinateError),
    #[error("row belongs to category {found}, expected {expected}")]
    CategoryMismatch { expected: Category, found: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("rejected row {}: {reason}", .row_id.as_deref().unwrap_or("<no id>"))]
pub struct IntegrityIssue {
    pub row_id: Option<String>,
    pub reason: IntegrityReason,
}

/// Loose wire shape of a stored row; every field is optional until validated.
#[derive(Debug, Clone, Default, Deserialize)]
struct ReportRow {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    pet_name: Option<String>,
    #[serde(default)]
    breed: Option<String>,
    #[serde(default)]
    species: Option<String>,
    #[serde(default)]
    contact: Option<String>,
    #[serde(default)]
    last_seen: Option<String>,
    #[serde(default)]
    found_at: Option<String>,
    #[serde(default)]
    lat: Option<Value>,
    #[serde(default)]
    lng: Option<Value>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    photo_url: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
}

fn id_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn coordinate_part(value: Option<&Value>, field: &'static str) -> Result<Option<f64>, IntegrityReason> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or(IntegrityReason::NonNumericCoordinate { field }),
        Some(_) => Err(IntegrityReason::NonNumericCoordinate { field }),
    }
}

/// RFC 3339, or a zone-less `timestamp` column read as UTC.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

impl PetReport {
    /// Schema validation at the store boundary.
    pub fn from_row(category: Category, raw: &Value) -> Result<Self, IntegrityIssue> {
        if !raw.is_object() {
            return Err(IntegrityIssue {
                row_id: None,
                reason: IntegrityReason::Malformed("expected a JSON object".to_owned()),
            });
        }
        let row: ReportRow = serde_json::from_value(raw.clone()).map_err(|e| IntegrityIssue {
            row_id: id_text(raw.get("id")),
            reason: IntegrityReason::Malformed(e.to_string()),
        })?;
        let row_id = id_text(row.id.as_ref());
        let fail = |reason: IntegrityReason| IntegrityIssue {
            row_id: row_id.clone(),
            reason,
        };

        let id = row_id.clone().ok_or_else(|| fail(IntegrityReason::MissingId))?;
        let pet_name = row
            .pet_name
            .ok_or_else(|| fail(IntegrityReason::MissingPetName))?;

        if let Some(kind) = row.kind.as_deref() {
            if !kind.eq_ignore_ascii_case(category.tag()) {
                return Err(fail(IntegrityReason::CategoryMismatch {
                    expected: category,
                    found: kind.to_owned(),
                }));
            }
        }

        let lat = coordinate_part(row.lat.as_ref(), "lat").map_err(&fail)?;
        let lng = coordinate_part(row.lng.as_ref(), "lng").map_err(&fail)?;
        let location = match (lat, lng) {
            (Some(lat), Some(lng)) => {
                Some(Coordinate::new(lat, lng).map_err(|e| fail(e.into()))?)
            }
            (None, None) => None,
            _ => return Err(fail(IntegrityReason::PartialCoordinate)),
        };

        // Ordering comes from the store; a bad timestamp never hides a row.
        let created_at = row.created_at.as_deref().and_then(parse_timestamp);
        if created_at.is_none() {
            debug!(row_id = %id, "row has no readable created_at");
        }

        let location_label = match category {
            Category::Missing => row.last_seen,
            Category::Found => row.found_at,
        }
        .unwrap_or_default();

        Ok(Self {
            id: RecordId::new(id),
            category,
            pet_name,
            breed: row.breed.unwrap_or_default(),
            species: row.species.as_deref().map(Species::parse).unwrap_or(Species::Other),
            contact: row.contact.unwrap_or_default(),
            location_label,
            location,
            photo_url: row.photo_url.filter(|u| !u.is_empty()),
            created_at,
        })
    }
}

/// Client-composed report that has not been persisted yet; it has no id.
#[derive(Clone, PartialEq)]
pub struct ReportDraft {
    pub category: Category,
    pub pet_name: String,
    pub breed: String,
    pub species: Species,
    pub contact: String,
    pub location_label: String,
    pub location: Option<Coordinate>,
}

impl fmt::Debug for ReportDraft {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReportDraft")
            .field("category", &self.category)
            .field("species", &self.species)
            .field("location", &self.location)
            .field("contact_present", &!self.contact.is_empty())
            .finish_non_exhaustive()
    }
}

impl ReportDraft {
    #[must_use]
    pub fn new(category: Category) -> Self {
        Self {
            category,
            pet_name: String::new(),
            breed: String::new(),
            species: Species::default(),
            contact: String::new(),
            location_label: String::new(),
            location: None,
        }
    }

    /// Insert payload; `id` and `created_at` are left for the store to assign.
    #[must_use]
    pub fn to_row(&self, photo_url: Option<&str>) -> NewReportRow {
        let label = Some(self.location_label.clone());
        let (last_seen, found_at) = match self.category {
            Category::Missing => (label, None),
            Category::Found => (None, label),
        };
        NewReportRow {
            pet_name: self.pet_name.clone(),
            breed: self.breed.clone(),
            species: self.species.as_str().to_owned(),
            contact: self.contact.clone(),
            last_seen,
            found_at,
            lat: self.location.map(Coordinate::lat),
            lng: self.location.map(Coordinate::lng),
            kind: self.category.tag().to_owned(),
            photo_url: photo_url.map(str::to_owned),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NewReportRow {
    pub pet_name: String,
    pub breed: String,
    pub species: String,
    pub contact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub found_at: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row() -> Value {
        json!({
            "id": "m1",
            "pet_name": "Max",
            "breed": "Golden Retriever",
            "species": "Dog",
            "last_seen": "123 Main St",
            "contact": "john@example.com",
            "lat": 40.7128,
            "lng": -74.006,
            "type": "missing",
            "created_at": "2024-05-01T10:20:30.123456+00:00"
        })
    }

    #[test]
    fn coordinate_rejects_nan_and_range() {
        assert_eq!(Coordinate::new(f64::NAN, 0.0), Err(CoordinateError::NonFinite));
        assert_eq!(Coordinate::new(0.0, f64::INFINITY), Err(CoordinateError::NonFinite));
        assert!(matches!(Coordinate::new(91.0, 0.0), Err(CoordinateError::LatitudeOutOfRange(_))));
        assert!(matches!(Coordinate::new(0.0, -181.0), Err(CoordinateError::LongitudeOutOfRange(_))));
        assert!(Coordinate::new(-90.0, 180.0).is_ok());
    }

    #[test]
    fn fallback_label_trims_trailing_zeros() {
        assert_eq!(Coordinate::new(10.0, 20.0).unwrap().fallback_label(), "10, 20");
        assert_eq!(Coordinate::new(48.8566, 2.3522).unwrap().fallback_label(), "48.8566, 2.3522");
        assert_eq!(Coordinate::new(-0.0, -0.1).unwrap().fallback_label(), "0, -0.1");
        assert_eq!(
            Coordinate::new(1.123_456_789, 0.0).unwrap().fallback_label(),
            "1.123457, 0"
        );
    }

    #[test]
    fn species_parse_is_lenient() {
        assert_eq!(Species::parse("Dog"), Species::Dog);
        assert_eq!(Species::parse(" CAT "), Species::Cat);
        assert_eq!(Species::parse("ferret"), Species::Other);
    }

    #[test]
    fn valid_row_is_accepted() {
        let report = PetReport::from_row(Category::Missing, &row()).unwrap();
        assert_eq!(report.id.as_str(), "m1");
        assert_eq!(report.pet_name, "Max");
        assert_eq!(report.species, Species::Dog);
        assert_eq!(report.location_label, "123 Main St");
        assert_eq!(report.location, Some(Coordinate::new(40.7128, -74.006).unwrap()));
    }

    #[test]
    fn numeric_ids_are_accepted() {
        let mut raw = row();
        raw["id"] = json!(42);
        let report = PetReport::from_row(Category::Missing, &raw).unwrap();
        assert_eq!(report.id.as_str(), "42");
    }

    #[test]
    fn missing_id_is_rejected() {
        let mut raw = row();
        raw.as_object_mut().unwrap().remove("id");
        let issue = PetReport::from_row(Category::Missing, &raw).unwrap_err();
        assert_eq!(issue.reason, IntegrityReason::MissingId);
        assert_eq!(issue.row_id, None);
    }

    #[test]
    fn missing_pet_name_is_rejected() {
        let mut raw = row();
        raw["pet_name"] = Value::Null;
        let issue = PetReport::from_row(Category::Missing, &raw).unwrap_err();
        assert_eq!(issue.reason, IntegrityReason::MissingPetName);
        assert_eq!(issue.row_id.as_deref(), Some("m1"));
    }

    #[test]
    fn string_coordinate_is_rejected() {
        let mut raw = row();
        raw["lat"] = json!("NaN");
        let issue = PetReport::from_row(Category::Missing, &raw).unwrap_err();
        assert_eq!(issue.reason, IntegrityReason::NonNumericCoordinate { field: "lat" });
    }

    #[test]
    fn half_coordinate_is_rejected() {
        let mut raw = row();
        raw["lng"] = Value::Null;
        let issue = PetReport::from_row(Category::Missing, &raw).unwrap_err();
        assert_eq!(issue.reason, IntegrityReason::PartialCoordinate);
    }

    #[test]
    fn absent_coordinates_are_allowed() {
        let mut raw = row();
        raw["lat"] = Value::Null;
        raw["lng"] = Value::Null;
        let report = PetReport::from_row(Category::Missing, &raw).unwrap();
        assert_eq!(report.location, None);
    }

    #[test]
    fn wrong_category_is_rejected() {
        let issue = PetReport::from_row(Category::Found, &row()).unwrap_err();
        assert!(matches!(issue.reason, IntegrityReason::CategoryMismatch { .. }));
    }

    #[test]
    fn non_object_row_is_malformed() {
        let issue = PetReport::from_row(Category::Found, &json!(["not", "a", "row"])).unwrap_err();
        assert!(matches!(issue.reason, IntegrityReason::Malformed(_)));

        let positional = json!(["a", "Rex", "Collie", "dog", "", "", "", 1.0, 2.0, "missing", null, "2024-01-01T00:00:00Z"]);
        let issue = PetReport::from_row(Category::Missing, &positional).unwrap_err();
        assert!(matches!(issue.reason, IntegrityReason::Malformed(_)));
    }

    #[test]
    fn zone_less_timestamp_is_read_as_utc() {
        let mut raw = row();
        raw["created_at"] = json!("2024-01-01T00:00:00.123456");
        let report = PetReport::from_row(Category::Missing, &raw).unwrap();
        assert_eq!(
            report.created_at.unwrap().to_rfc3339(),
            "2024-01-01T00:00:00.123456+00:00"
        );

        raw["created_at"] = json!("2024-01-01 08:30:00");
        let report = PetReport::from_row(Category::Missing, &raw).unwrap();
        assert_eq!(report.created_at.unwrap().to_rfc3339(), "2024-01-01T08:30:00+00:00");
    }

    #[test]
    fn missing_timestamp_keeps_the_row() {
        let mut raw = row();
        raw.as_object_mut().unwrap().remove("created_at");
        let report = PetReport::from_row(Category::Missing, &raw).unwrap();
        assert_eq!(report.created_at, None);

        raw["created_at"] = json!("yesterday");
        assert_eq!(PetReport::from_row(Category::Missing, &raw).unwrap().created_at, None);
    }

    #[test]
    fn draft_row_uses_category_location_column() {
        let mut draft = ReportDraft::new(Category::Found);
        draft.pet_name = "Unknown".into();
        draft.location_label = "Central Park".into();
        draft.location = Some(Coordinate::new(40.7821, -73.9665).unwrap());

        let value = serde_json::to_value(draft.to_row(None)).unwrap();
        assert_eq!(value["found_at"], "Central Park");
        assert!(value.get("last_seen").is_none());
        assert!(value.get("id").is_none());
        assert_eq!(value["type"], "found");
        assert_eq!(value["species"], "dog");
        assert_eq!(value["lat"], 40.7821);
    }

    #[test]
    fn debug_output_redacts_contact() {
        let report = PetReport::from_row(Category::Missing, &row()).unwrap();
        let text = format!("{report:?}");
        assert!(!text.contains("john@example.com"));
        assert!(text.contains("contact_present: true"));
    }
}
