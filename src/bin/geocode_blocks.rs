use std::{path::PathBuf, time::Duration};

use clap::Parser;
use log::info;
use parcelgeo::{
    coordinates::build_precise_geocodes,
    geocode::{CachedGeocoder, GeocodeCache, OneMapSearch},
    layout::DataLayout,
    record::RecordSet,
};

#[derive(Parser)]
struct Args {
    /// Project root holding the `data/` tree.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
    #[arg(long)]
    onemap_endpoint: Option<String>,
    /// Pause after every uncached lookup.
    #[arg(long, default_value_t = 150)]
    courtesy_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Args::parse();
    let layout = DataLayout::new(&args.data_dir);
    let records = RecordSet::load(&layout.locate_primary_table()?)?;

    let mut geocoder = CachedGeocoder::new(
        OneMapSearch::new(args.onemap_endpoint)?,
        GeocodeCache::open(layout.block_geocode_cache()),
    )
    .with_courtesy_delay(Duration::from_millis(args.courtesy_delay_ms));
    let geocodes = build_precise_geocodes(&records, &mut geocoder).await;

    let output = layout.block_geocodes();
    geocodes.save(&output)?;
    info!("Wrote {} block geocodes to {:?}", geocodes.len(), output);
    Ok(())
}
