use std::{
    collections::{BTreeSet, HashMap},
    fs,
    path::Path,
};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    centroids::CentroidTable,
    coerce_f64,
    geocode::{CachedGeocoder, LocationSearch},
    layout::IDENTIFIER_COLUMNS,
    record::{CoordinateSource, RecordSet},
    Coordinate,
};

#[derive(Debug, Deserialize)]
struct PreciseRowIn {
    block: Option<String>,
    street_name: Option<String>,
    #[serde(alias = "lat")]
    latitude: Option<String>,
    #[serde(alias = "lon")]
    longitude: Option<String>,
}

#[derive(Debug, Serialize)]
struct PreciseRowOut<'a> {
    block: &'a str,
    street_name: &'a str,
    latitude: f64,
    longitude: f64,
}

/// Building-level coordinates keyed by trimmed `(block, street_name)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreciseGeocodes {
    entries: HashMap<(String, String), Coordinate>,
}

impl PreciseGeocodes {
    pub fn from_entries<I, B, S>(entries: I) -> PreciseGeocodes
    where
        I: IntoIterator<Item = (B, S, Coordinate)>,
        B: AsRef<str>,
        S: AsRef<str>,
    {
        let mut geocodes = PreciseGeocodes::default();
        for (block, street_name, coordinate) in entries {
            if coordinate.is_finite() {
                geocodes
                    .entries
                    .entry(Self::key(block.as_ref(), street_name.as_ref()))
                    .or_insert(coordinate);
            }
        }
        geocodes
    }

    fn key(block: &str, street_name: &str) -> (String, String) {
        (block.trim().to_string(), street_name.trim().to_string())
    }

    /// Reads a precise geocode table. Unreadable files are `None`; rows
    /// without an identifier or a full coordinate are skipped.
    pub fn load(path: &Path) -> Option<PreciseGeocodes> {
        let mut reader = match csv::Reader::from_path(path) {
            Ok(reader) => reader,
            Err(err) => {
                warn!("Ignoring precise geocodes {:?}: {}", path, err);
                return None;
            }
        };
        let mut entries = Vec::new();
        for row in reader.deserialize::<PreciseRowIn>() {
            let row = match row {
                Ok(row) => row,
                Err(err) => {
                    warn!("Ignoring precise geocodes {:?}: {}", path, err);
                    return None;
                }
            };
            let (Some(block), Some(street_name)) = (row.block, row.street_name) else {
                continue;
            };
            let coordinate = Coordinate::from_parts(
                row.latitude.as_deref().and_then(coerce_f64),
                row.longitude.as_deref().and_then(coerce_f64),
            );
            if let Some(coordinate) = coordinate {
                entries.push((block, street_name, coordinate));
            }
        }
        Some(PreciseGeocodes::from_entries(entries))
    }

    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut rows: Vec<_> = self.entries.iter().collect();
        rows.sort_by(|a, b| a.0.cmp(b.0));
        let mut writer = csv::Writer::from_path(path)?;
        for ((block, street_name), coordinate) in rows {
            writer.serialize(PreciseRowOut {
                block,
                street_name,
                latitude: coordinate.latitude,
                longitude: coordinate.longitude,
            })?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn get(&self, block: &str, street_name: &str) -> Option<Coordinate> {
        self.entries.get(&Self::key(block, street_name)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolutionSummary {
    pub total: usize,
    pub from_input: usize,
    pub precise: usize,
    pub centroid: usize,
    pub missing: usize,
}

/// Fills empty coordinates from the precise table, then from region
/// centroids. Existing coordinates are never replaced, so running it twice
/// changes nothing.
pub fn resolve_coordinates(
    records: &mut RecordSet,
    precise: Option<&PreciseGeocodes>,
    centroids: &CentroidTable,
) -> ResolutionSummary {
    let has_identifiers = IDENTIFIER_COLUMNS.iter().all(|column| records.has_column(column));
    let precise = match precise {
        Some(_) if !has_identifiers => {
            warn!(
                "Records lack {} columns, skipping the precise geocode join",
                IDENTIFIER_COLUMNS.join("/")
            );
            None
        }
        precise => precise,
    };

    for record in records.records_mut() {
        record.discard_non_finite_coordinate();
        if let (Some(precise), Some(block), Some(street_name)) =
            (precise, record.block.as_deref(), record.street_name.as_deref())
        {
            if let Some(coordinate) = precise.get(block, street_name) {
                record.fill_coordinate(coordinate, CoordinateSource::Precise);
            }
        }
        let centroid = record.region.as_deref().and_then(|region| centroids.get(region));
        if let Some(coordinate) = centroid {
            record.fill_coordinate(coordinate, CoordinateSource::Centroid);
        }
    }

    let mut summary = ResolutionSummary {
        total: records.len(),
        ..Default::default()
    };
    for record in records.records() {
        match record.coordinate_source() {
            Some(CoordinateSource::Input) => summary.from_input += 1,
            Some(CoordinateSource::Precise) => summary.precise += 1,
            Some(CoordinateSource::Centroid) => summary.centroid += 1,
            None => summary.missing += 1,
        }
    }
    info!(
        "Resolved coordinates for {} records: {} input, {} precise, {} centroid, {} missing",
        summary.total, summary.from_input, summary.precise, summary.centroid, summary.missing
    );
    summary
}

pub fn geocode_key(block: &str, street_name: &str) -> String {
    format!("{} {} Singapore", block.trim(), street_name.trim())
}

/// Geocodes every distinct `(block, street_name)` pair of the record set.
pub async fn build_precise_geocodes<S: LocationSearch>(
    records: &RecordSet,
    geocoder: &mut CachedGeocoder<S>,
) -> PreciseGeocodes {
    let pairs: BTreeSet<(String, String)> = records
        .records()
        .iter()
        .filter_map(|record| {
            let block = record.block.as_deref()?.trim();
            let street_name = record.street_name.as_deref()?.trim();
            if block.is_empty() || street_name.is_empty() {
                return None;
            }
            Some((block.to_string(), street_name.to_string()))
        })
        .collect();
    info!("Geocoding {} distinct block/street pairs", pairs.len());

    let keys: Vec<String> = pairs
        .iter()
        .map(|(block, street_name)| geocode_key(block, street_name))
        .collect();
    let resolved = geocoder.resolve_many(&keys).await;
    PreciseGeocodes::from_entries(pairs.iter().zip(&keys).filter_map(
        |((block, street_name), key)| {
            let coordinate = resolved.get(key).copied().flatten()?;
            Some((block, street_name, coordinate))
        },
    ))
}
