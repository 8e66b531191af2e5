use std::path::PathBuf;

use geo_types::Coord;
use log::{debug, info, warn};
use parcelgeo_spatial::{nearest_distances, DEFAULT_BATCH_SIZE};
use rayon::prelude::*;

use crate::{
    centroids::CentroidTable,
    coerce_f64,
    coordinates::{resolve_coordinates, PreciseGeocodes, ResolutionSummary},
    layout::DataLayout,
    record::RecordSet,
    reference::{CategoryConfig, ReferenceTable},
};

/// Midpoint of a storey band such as `"10 TO 12"`.
pub fn storey_mid(range: &str) -> Option<f64> {
    let parts: Vec<&str> = range.split_whitespace().collect();
    let [low, _, high] = parts.as_slice() else {
        return None;
    };
    let low: i64 = low.parse().ok()?;
    let high: i64 = high.parse().ok()?;
    Some((low + high) as f64 / 2.0)
}

/// Years left on a lease written as `"56 years 10 months"`. Either unit may be
/// missing, but not both.
pub fn remaining_lease_years(text: &str) -> Option<f64> {
    let lowered = text.to_lowercase();
    let parts: Vec<&str> = lowered.split_whitespace().collect();
    let amount_before = |units: &[&str]| -> Result<Option<f64>, ()> {
        let Some(position) = parts.iter().position(|part| units.contains(part)) else {
            return Ok(None);
        };
        let amount = position
            .checked_sub(1)
            .and_then(|index| coerce_f64(parts[index]))
            .ok_or(())?;
        Ok(Some(amount))
    };
    let years = amount_before(&["years", "year"]).ok()?;
    let months = amount_before(&["months", "month"]).ok()?;
    if years.is_none() && months.is_none() {
        return None;
    }
    Some(years.unwrap_or(0.0) + months.unwrap_or(0.0) / 12.0)
}

pub fn price_per_sqm(resale_price: Option<f64>, floor_area_sqm: Option<f64>) -> Option<f64> {
    let ratio = resale_price? / floor_area_sqm?;
    ratio.is_finite().then_some(ratio)
}

fn text_feature(
    records: &RecordSet,
    source: &str,
    target: &str,
    parse: fn(&str) -> Option<f64>,
) -> Option<Vec<Option<f64>>> {
    if !records.has_column(source) || records.has_column(target) {
        return None;
    }
    Some(
        records
            .records()
            .iter()
            .map(|record| records.value(record, source).and_then(parse))
            .collect(),
    )
}

/// Adds `storey_mid`, `remaining_lease_years` and `price_per_sqm` when their
/// source columns exist and the input does not already carry them.
pub fn derive_features(records: &mut RecordSet) {
    if let Some(values) = text_feature(records, "storey_range", "storey_mid", storey_mid) {
        records.set_derived("storey_mid", values);
    }
    if let Some(values) = text_feature(
        records,
        "remaining_lease",
        "remaining_lease_years",
        remaining_lease_years,
    ) {
        records.set_derived("remaining_lease_years", values);
    }
    if records.has_column("resale_price")
        && records.has_column("floor_area_sqm")
        && !records.has_column("price_per_sqm")
    {
        let values = records
            .records()
            .iter()
            .map(|record| price_per_sqm(record.resale_price, record.floor_area_sqm))
            .collect();
        records.set_derived("price_per_sqm", values);
    }
}

pub fn distance_column_name(category: &str) -> String {
    format!("dist_to_{}_m", category)
}

/// Adds one nearest-distance column per reference table. Returns how many
/// records got a distance for each category.
pub fn attach_distances(
    records: &mut RecordSet,
    tables: &[ReferenceTable],
    batch_size: usize,
) -> Vec<(String, usize)> {
    let points: Vec<Option<Coord>> = records
        .coordinates()
        .into_iter()
        .map(|coordinate| coordinate.map(Into::into))
        .collect();
    let columns: Vec<(String, Vec<Option<f64>>)> = tables
        .par_iter()
        .map(|table| {
            (
                distance_column_name(&table.category),
                nearest_distances(&points, &table.coords(), batch_size),
            )
        })
        .collect();

    columns
        .into_iter()
        .map(|(column, distances)| {
            let filled = distances.iter().filter(|distance| distance.is_some()).count();
            records.set_derived(&column, distances);
            (column, filled)
        })
        .collect()
}

/// Everything one feature build reads and writes.
#[derive(Debug, Clone)]
pub struct FeatureInputs {
    pub primary: PathBuf,
    pub precise: Option<PathBuf>,
    pub categories: Vec<(String, PathBuf)>,
    pub output: PathBuf,
    pub batch_size: usize,
}

impl FeatureInputs {
    pub fn from_layout(
        layout: &DataLayout,
        categories: &[CategoryConfig],
    ) -> Result<FeatureInputs, anyhow::Error> {
        Ok(FeatureInputs {
            primary: layout.locate_primary_table()?,
            precise: layout.locate_block_geocodes(),
            categories: categories
                .iter()
                .map(|config| (config.name.clone(), config.output.clone()))
                .collect(),
            output: layout.features_output(),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSummary {
    pub rows: usize,
    pub coordinates: ResolutionSummary,
    pub distances: Vec<(String, usize)>,
    pub output: PathBuf,
}

/// Loads the primary table, derives record features, resolves coordinates,
/// computes distances for every category whose reference table is present and
/// writes the feature table.
pub fn build_features(
    inputs: &FeatureInputs,
    centroids: &CentroidTable,
) -> Result<FeatureSummary, anyhow::Error> {
    let mut records = RecordSet::load(&inputs.primary)?;
    derive_features(&mut records);

    let precise = inputs.precise.as_deref().and_then(PreciseGeocodes::load);
    match &precise {
        Some(precise) => debug!("Loaded {} precise geocodes", precise.len()),
        None => warn!("No precise geocode table, using region centroids only"),
    }
    let coordinates = resolve_coordinates(&mut records, precise.as_ref(), centroids);

    let tables: Vec<ReferenceTable> = inputs
        .categories
        .iter()
        .filter_map(|(category, path)| {
            let table = ReferenceTable::load(category, path);
            if table.is_none() {
                warn!("No usable {} reference table at {:?}, skipping", category, path);
            }
            table
        })
        .collect();
    let distances = attach_distances(&mut records, &tables, inputs.batch_size);

    records.write(&inputs.output)?;
    info!(
        "Wrote {} rows to {:?} ({} with coordinates)",
        records.len(),
        inputs.output,
        coordinates.total - coordinates.missing
    );
    for (column, filled) in &distances {
        info!("{}: {} rows", column, filled);
    }
    Ok(FeatureSummary {
        rows: records.len(),
        coordinates,
        distances,
        output: inputs.output.clone(),
    })
}
