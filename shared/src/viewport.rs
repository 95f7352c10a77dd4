use geojson::{feature::Id, Feature, FeatureCollection, Geometry, JsonObject, Value as GeoValue};
use serde::Serialize;
use serde_json::Value;

use crate::config::Config;
use crate::model::{Category, Coordinate, PetReport};
use crate::{ZoomLevel, CLOSE_UP_ZOOM, DEFAULT_MAP_ZOOM};

pub const SEARCH_MARKER_KEY: &str = "search";

/// Ask the map to centre on a point; `zoom: None` means "close up, never out".
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FocusRequest {
    pub at: Coordinate,
    pub zoom: Option<f64>,
}

/// Camera animation handed to the map host.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FlyTo {
    pub center: Coordinate,
    pub zoom: ZoomLevel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerKind {
    Missing,
    Found,
    Search,
}

impl From<Category> for MarkerKind {
    fn from(category: Category) -> Self {
        match category {
            Category::Missing => Self::Missing,
            Category::Found => Self::Found,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    /// Stable across renders: derived from the record id, never the position in a list.
    pub key: String,
    pub kind: MarkerKind,
    pub position: Coordinate,
    pub title: String,
    pub popup: Vec<String>,
    pub photo_url: Option<String>,
}

impl Marker {
    fn for_report(report: &PetReport) -> Option<Self> {
        let position = report.location?;
        let mut popup = Vec::with_capacity(4);
        if !report.breed.is_empty() {
            popup.push(format!("{} ({})", report.breed, report.species.as_str()));
        }
        if !report.location_label.is_empty() {
            popup.push(format!(
                "{}: {}",
                report.category.location_caption(),
                report.location_label
            ));
        }
        if !report.contact.is_empty() {
            popup.push(format!("Contact: {}", report.contact));
        }
        Some(Self {
            key: format!("{}:{}", report.category.tag(), report.id),
            kind: report.category.into(),
            position,
            title: report.pet_name.clone(),
            popup,
            photo_url: report.photo_url.clone(),
        })
    }

    fn to_feature(&self) -> Feature {
        let mut properties = JsonObject::new();
        properties.insert("kind".to_owned(), serde_json::json!(self.kind));
        properties.insert("title".to_owned(), Value::String(self.title.clone()));
        properties.insert("popup".to_owned(), serde_json::json!(self.popup));
        if let Some(url) = &self.photo_url {
            properties.insert("photoUrl".to_owned(), Value::String(url.clone()));
        }
        Feature {
            bbox: None,
            geometry: Some(Geometry::new(GeoValue::Point(vec![
                self.position.lng(),
                self.position.lat(),
            ]))),
            id: Some(Id::String(self.key.clone())),
            properties: Some(properties),
            foreign_members: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MarkerLayer {
    pub markers: Vec<Marker>,
}

impl MarkerLayer {
    #[must_use]
    pub fn len(&self) -> usize {
        self.markers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Marker> {
        self.markers.iter().find(|m| m.key == key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.markers.iter().map(|m| m.key.as_str())
    }

    /// GeoJSON positions are `[lng, lat]`.
    #[must_use]
    pub fn to_geojson(&self) -> FeatureCollection {
        FeatureCollection {
            bbox: None,
            features: self.markers.iter().map(Marker::to_feature).collect(),
            foreign_members: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapViewport {
    center: Coordinate,
    zoom: ZoomLevel,
    close_up_zoom: f64,
    search_marker: Option<Marker>,
}

impl Default for MapViewport {
    fn default() -> Self {
        Self::new(Coordinate::default_center(), ZoomLevel::new(DEFAULT_MAP_ZOOM), CLOSE_UP_ZOOM)
    }
}

impl MapViewport {
    #[must_use]
    pub fn new(center: Coordinate, zoom: ZoomLevel, close_up_zoom: f64) -> Self {
        Self {
            center,
            zoom,
            close_up_zoom,
            search_marker: None,
        }
    }

    /// Starts at the configured centre; an invalid centre falls back to the default.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let center = config
            .default_center()
            .unwrap_or_else(|_| Coordinate::default_center());
        Self::new(center, ZoomLevel::new(config.default_zoom), config.close_up_zoom)
    }

    #[must_use]
    pub const fn center(&self) -> Coordinate {
        self.center
    }

    #[must_use]
    pub const fn zoom(&self) -> ZoomLevel {
        self.zoom
    }

    /// Moves the camera. Without an explicit zoom this never zooms out.
    pub fn focus(&mut self, at: Coordinate, zoom: Option<f64>) -> FlyTo {
        let zoom = match zoom {
            Some(z) => ZoomLevel::new(z),
            None => ZoomLevel::new(self.zoom.value().max(self.close_up_zoom)),
        };
        self.center = at;
        self.zoom = zoom;
        FlyTo { center: at, zoom }
    }

    pub fn apply(&mut self, request: FocusRequest) -> FlyTo {
        self.focus(request.at, request.zoom)
    }

    /// Records a camera move the user made by panning or zooming.
    pub fn set_camera(&mut self, center: Coordinate, zoom: f64) {
        self.center = center;
        self.zoom = ZoomLevel::new(zoom);
    }

    /// Replaces the single ad-hoc search marker.
    pub fn set_search_marker(&mut self, at: Coordinate, label: impl Into<String>) {
        self.search_marker = Some(Marker {
            key: SEARCH_MARKER_KEY.to_owned(),
            kind: MarkerKind::Search,
            position: at,
            title: label.into(),
            popup: Vec::new(),
            photo_url: None,
        });
    }

    pub fn clear_search_marker(&mut self) {
        self.search_marker = None;
    }

    #[must_use]
    pub fn search_marker(&self) -> Option<&Marker> {
        self.search_marker.as_ref()
    }

    /// Markers for both collections plus the search marker. Records without
    /// coordinates are skipped.
    #[must_use]
    pub fn render(&self, missing: &[PetReport], found: &[PetReport]) -> MarkerLayer {
        let markers = missing
            .iter()
            .chain(found)
            .filter_map(Marker::for_report)
            .chain(self.search_marker.clone())
            .collect();
        MarkerLayer { markers }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn report(category: Category, id: &str, location: Option<(f64, f64)>) -> PetReport {
        let (lat, lng) = location.map_or((Value::Null, Value::Null), |(a, b)| (json!(a), json!(b)));
        let row = json!({
            "id": id,
            "pet_name": "Max",
            "breed": "Beagle",
            "species": "dog",
            "last_seen": "Hyde Park",
            "found_at": "Hyde Park",
            "contact": "555-0100",
            "lat": lat,
            "lng": lng,
            "created_at": "2024-03-01T10:00:00Z"
        });
        PetReport::from_row(category, &row).unwrap()
    }

    fn point(lat: f64, lng: f64) -> Coordinate {
        Coordinate::new(lat, lng).unwrap()
    }

    #[test]
    fn focus_without_zoom_never_zooms_out() {
        let mut viewport = MapViewport::default();
        let fly = viewport.focus(point(1.0, 2.0), None);
        assert_eq!(fly.zoom.value(), CLOSE_UP_ZOOM);

        viewport.set_camera(point(1.0, 2.0), 18.0);
        let fly = viewport.focus(point(3.0, 4.0), None);
        assert_eq!(fly.zoom.value(), 18.0);
        assert_eq!(viewport.center(), point(3.0, 4.0));
    }

    #[test]
    fn explicit_zoom_is_clamped() {
        let mut viewport = MapViewport::default();
        let fly = viewport.focus(point(1.0, 2.0), Some(40.0));
        assert_eq!(fly.zoom.value(), crate::MAX_ZOOM);
        let fly = viewport.apply(FocusRequest {
            at: point(1.0, 2.0),
            zoom: Some(9.0),
        });
        assert_eq!(fly.zoom.value(), 9.0);
    }

    #[test]
    fn marker_keys_follow_record_ids() {
        let mut viewport = MapViewport::default();
        viewport.set_search_marker(point(5.0, 5.0), "Somewhere");
        let missing = [report(Category::Missing, "a", Some((1.0, 1.0))), report(Category::Missing, "b", None)];
        let found = [report(Category::Found, "a", Some((2.0, 2.0)))];

        let layer = viewport.render(&missing, &found);
        let keys: Vec<_> = layer.keys().collect();
        assert_eq!(keys, ["missing:a", "found:a", "search"]);

        let reversed: Vec<_> = missing.iter().rev().cloned().collect();
        let again = viewport.render(&reversed, &found);
        assert_eq!(again.get("missing:a"), layer.get("missing:a"));
    }

    #[test]
    fn popup_uses_category_caption() {
        let viewport = MapViewport::default();
        let layer = viewport.render(
            &[report(Category::Missing, "m", Some((1.0, 1.0)))],
            &[report(Category::Found, "f", Some((1.0, 1.0)))],
        );
        assert!(layer.get("missing:m").unwrap().popup.contains(&"Last seen: Hyde Park".to_owned()));
        assert!(layer.get("found:f").unwrap().popup.contains(&"Found at: Hyde Park".to_owned()));
    }

    #[test]
    fn search_marker_is_single() {
        let mut viewport = MapViewport::default();
        viewport.set_search_marker(point(1.0, 1.0), "First");
        viewport.set_search_marker(point(2.0, 2.0), "Second");
        let layer = viewport.render(&[], &[]);
        assert_eq!(layer.len(), 1);
        assert_eq!(layer.get(SEARCH_MARKER_KEY).unwrap().title, "Second");

        viewport.clear_search_marker();
        assert!(viewport.render(&[], &[]).is_empty());
    }

    #[test]
    fn geojson_uses_lng_lat_order() {
        let viewport = MapViewport::default();
        let layer = viewport.render(&[report(Category::Missing, "m", Some((51.5, -0.1)))], &[]);
        let collection = layer.to_geojson();
        assert_eq!(collection.features.len(), 1);
        let value = serde_json::to_value(&collection).unwrap();
        assert_eq!(value["features"][0]["geometry"]["coordinates"], json!([-0.1, 51.5]));
        assert_eq!(value["features"][0]["id"], "missing:m");
        assert_eq!(value["features"][0]["properties"]["kind"], "missing");
    }
}
