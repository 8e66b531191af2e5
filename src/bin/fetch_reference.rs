use std::path::PathBuf;

use clap::Parser;
use log::{info, warn};
use parcelgeo::{
    centroids::CentroidTable,
    geocode::{CachedGeocoder, GeocodeCache, OneMapSearch},
    layout::DataLayout,
    reference::{AcquisitionError, AttemptOutcome, CategoryConfig, ReferenceResolver, ResolverSettings},
};

#[derive(Parser)]
struct Args {
    /// Project root holding the `data/` tree.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
    #[arg(long, env = "DATAGOV_API_KEY")]
    api_key: Option<String>,
    /// JSON file of category chains replacing the built-in transit and school chains.
    #[arg(long)]
    categories: Option<PathBuf>,
    /// Only resolve these categories.
    #[arg(long)]
    only: Vec<String>,
    #[arg(long)]
    onemap_endpoint: Option<String>,
    #[arg(long)]
    geocode_cache: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Args::parse();
    let layout = DataLayout::new(&args.data_dir);
    let categories = CategoryConfig::configured(&layout, args.categories.as_deref())?;

    let settings = ResolverSettings {
        api_key: args.api_key.clone(),
        ..Default::default()
    };
    let geocoder = CachedGeocoder::new(
        OneMapSearch::new(args.onemap_endpoint.clone())?,
        GeocodeCache::open(
            args.geocode_cache
                .clone()
                .unwrap_or_else(|| layout.school_geocode_cache()),
        ),
    );
    let mut resolver = ReferenceResolver::new(settings, CentroidTable::hdb_towns())?.with_geocoder(geocoder);

    let mut exhausted = 0;
    for config in &categories {
        if !args.only.is_empty() && !args.only.contains(&config.name) {
            continue;
        }
        match resolver.resolve(config).await {
            Ok(resolution) => info!(
                "{}: {} points written to {:?} after {} attempts",
                config.name,
                resolution.table.len(),
                config.output,
                resolution.attempts.len()
            ),
            Err(AcquisitionError::Exhausted { category, attempts }) => {
                exhausted += 1;
                warn!("{}: every tier failed", category);
                for attempt in attempts {
                    if let AttemptOutcome::Failure { reason } = attempt.outcome {
                        warn!("  tier {} ({}): {}", attempt.tier, attempt.description, reason);
                    }
                }
            }
        }
    }
    if exhausted > 0 {
        warn!(
            "{} categories have no reference table; their distance columns will be omitted",
            exhausted
        );
    }
    Ok(())
}
