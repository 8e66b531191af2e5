pub mod centroids;
pub mod coordinates;
pub mod features;
pub mod geocode;
pub mod layout;
pub mod record;
pub mod reference;
pub mod resale;

use geo_types::Coord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Coordinate {
        Coordinate {
            latitude,
            longitude,
        }
    }

    /// Both halves must be present and finite, otherwise there is no coordinate.
    pub fn from_parts(latitude: Option<f64>, longitude: Option<f64>) -> Option<Coordinate> {
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) if latitude.is_finite() && longitude.is_finite() => {
                Some(Coordinate::new(latitude, longitude))
            }
            _ => None,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.latitude.is_finite() && self.longitude.is_finite()
    }
}

impl From<Coordinate> for Coord {
    fn from(coordinate: Coordinate) -> Self {
        Coord {
            x: coordinate.longitude,
            y: coordinate.latitude,
        }
    }
}

/// Lenient numeric parse: blanks, garbage and non-finite values all become `None`.
pub fn coerce_f64(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// A JSON cell as table text. Null is blank; strings lose their quotes.
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
