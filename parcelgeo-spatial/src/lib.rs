use geo_types::Coord;
use log::debug;
use parcelgeo_geomath::haversine_meters;
use rayon::prelude::*;

pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// For each point, the great-circle distance in meters to the closest reference
/// coordinate. Coordinates are `x = longitude`, `y = latitude`.
///
/// Points are processed in batches of `batch_size`; each batch holds a full
/// `batch_size * references.len()` distance matrix, so the batch size bounds
/// peak memory. Batches are independent and run on the rayon pool. Output is
/// aligned with `points`. A point without a coordinate, or an empty reference
/// set, yields `None`.
pub fn nearest_distances(
    points: &[Option<Coord>],
    references: &[Coord],
    batch_size: usize,
) -> Vec<Option<f64>> {
    if references.is_empty() {
        debug!("No reference points, skipping {} distance queries", points.len());
        return vec![None; points.len()];
    }
    let batch_size = batch_size.max(1);
    debug!(
        "Computing nearest distances for {} points against {} references in batches of {}",
        points.len(),
        references.len(),
        batch_size
    );
    points
        .par_chunks(batch_size)
        .map(|batch| nearest_in_batch(batch, references))
        .collect::<Vec<Vec<Option<f64>>>>()
        .into_iter()
        .flatten()
        .collect()
}

fn nearest_in_batch(batch: &[Option<Coord>], references: &[Coord]) -> Vec<Option<f64>> {
    let width = references.len();
    let mut matrix = vec![f64::NAN; batch.len() * width];
    for (row, point) in batch.iter().enumerate() {
        let Some(point) = point else {
            continue;
        };
        for (col, reference) in references.iter().enumerate() {
            matrix[row * width + col] = haversine_meters(point.y, point.x, reference.y, reference.x);
        }
    }
    matrix.chunks(width).map(row_min).collect()
}

/// Minimum of a row ignoring NaN entries; `None` if every entry is NaN.
fn row_min(row: &[f64]) -> Option<f64> {
    row.iter()
        .copied()
        .filter(|d| !d.is_nan())
        .fold(None, |best: Option<f64>, d| match best {
            Some(best) if best <= d => Some(best),
            _ => Some(d),
        })
}
