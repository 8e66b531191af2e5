use std::path::PathBuf;

use clap::Parser;
use log::info;
use parcelgeo::{
    centroids::CentroidTable,
    features::{build_features, FeatureInputs},
    layout::DataLayout,
    reference::CategoryConfig,
};
use parcelgeo_spatial::DEFAULT_BATCH_SIZE;

#[derive(Parser)]
struct Args {
    /// Project root holding the `data/` tree.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
    /// JSON file of category chains; only their output paths are read here.
    #[arg(long)]
    categories: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    batch_size: usize,
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Args::parse();
    let layout = DataLayout::new(&args.data_dir);
    let categories = CategoryConfig::configured(&layout, args.categories.as_deref())?;

    let mut inputs = FeatureInputs::from_layout(&layout, &categories)?;
    inputs.batch_size = args.batch_size;
    if let Some(output) = args.output {
        inputs.output = output;
    }
    info!(
        "Building features from {:?} (precise geocodes: {:?})",
        inputs.primary, inputs.precise
    );

    let summary = build_features(&inputs, &CentroidTable::hdb_towns())?;
    let coordinates = summary.coordinates;
    println!(
        "rows={} with_coordinates={} precise={} centroid={} output={}",
        summary.rows,
        coordinates.total - coordinates.missing,
        coordinates.precise,
        coordinates.centroid,
        summary.output.display()
    );
    for (column, filled) in &summary.distances {
        println!("{}={}", column, filled);
    }
    Ok(())
}
