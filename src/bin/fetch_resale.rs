use std::{path::PathBuf, time::Duration};

use clap::Parser;
use log::info;
use parcelgeo::{
    layout::DataLayout,
    resale::{fetch_resale, CkanDatastore, PagingSettings, RESALE_RESOURCE_ID},
};

#[derive(Parser)]
struct Args {
    /// Project root holding the `data/` tree.
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,
    #[arg(long, env = "DATAGOV_API_KEY")]
    api_key: Option<String>,
    #[arg(long)]
    endpoint: Option<String>,
    #[arg(long, default_value_t = RESALE_RESOURCE_ID.to_string())]
    resource_id: String,
    /// Local CSV used when the download fails. Defaults to the output path.
    #[arg(long)]
    fallback: Option<PathBuf>,
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();
    let args = Args::parse();
    let layout = DataLayout::new(&args.data_dir);
    let output = layout.resale_table();
    let fallback = args.fallback.clone().unwrap_or_else(|| output.clone());

    let datastore = CkanDatastore::new(
        args.endpoint,
        args.api_key,
        Duration::from_secs(args.timeout_secs),
    )?;
    let rows = fetch_resale(
        &datastore,
        &args.resource_id,
        &PagingSettings::default(),
        &output,
        &fallback,
    )
    .await?;
    info!("Resale table {:?} has {} rows", output, rows);
    Ok(())
}
