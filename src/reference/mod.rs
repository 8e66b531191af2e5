pub mod datagov;
pub mod overpass;
pub mod parse;

use std::{
    collections::BTreeMap,
    fmt,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use geo_types::Coord;
use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::{
    centroids::CentroidTable,
    geocode::{CachedGeocoder, LocationSearch, OneMapSearch},
    layout::DataLayout,
    Coordinate,
};

use self::{
    datagov::{DatasetDownload, RowListing, DATAGOV_DOWNLOAD_API, DATAGOV_ROWS_API},
    overpass::OVERPASS_MIRRORS,
    parse::NormalizedTable,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferencePoint {
    pub label: Option<String>,
    pub code: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

impl ReferencePoint {
    pub fn coordinate(&self) -> Coordinate {
        Coordinate::new(self.latitude, self.longitude)
    }
}

/// The points of one category. Only finite coordinates make it in.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceTable {
    pub category: String,
    pub points: Vec<ReferencePoint>,
}

impl ReferenceTable {
    pub fn new(category: &str, points: Vec<ReferencePoint>) -> ReferenceTable {
        ReferenceTable {
            category: category.to_string(),
            points: points
                .into_iter()
                .filter(|point| point.coordinate().is_finite())
                .collect(),
        }
    }

    /// Reads a persisted table. Missing, empty, unreadable or column-less
    /// files are all `None`; rows without both coordinates are dropped.
    pub fn load(category: &str, path: &Path) -> Option<ReferenceTable> {
        if !path.is_file() {
            return None;
        }
        let table = match Self::read(category, path) {
            Ok(table) => table,
            Err(err) => {
                warn!("Ignoring reference table {:?}: {}", path, err);
                return None;
            }
        };
        if table.is_empty() {
            debug!("Reference table {:?} has no usable rows", path);
            return None;
        }
        Some(table)
    }

    fn read(category: &str, path: &Path) -> Result<ReferenceTable, anyhow::Error> {
        let table = NormalizedTable::parse(&fs::read_to_string(path)?)?;
        if !table.has_coordinates() {
            bail!("missing latitude/longitude columns");
        }
        Ok(ReferenceTable::new(category, table.points()))
    }

    pub fn save(&self, path: &Path) -> Result<(), anyhow::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        for point in &self.points {
            writer.serialize(point)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn coords(&self) -> Vec<Coord> {
        self.points
            .iter()
            .map(|point| point.coordinate().into())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DatasetFormat {
    /// Point features with an HTML attribute table in `properties.Description`.
    GeoJson {
        label_field: String,
        #[serde(default)]
        code_field: Option<String>,
    },
    /// A delimited table, geocoded by address when it has no coordinates.
    Csv,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSource {
    pub path: PathBuf,
    pub format: DatasetFormat,
}

fn default_overpass_timeout() -> u32 {
    25
}

fn default_page_limit() -> usize {
    5000
}

/// One acquisition strategy. A category lists these in priority order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Tier {
    RemoteDataset {
        dataset_id: String,
        format: DatasetFormat,
    },
    /// The paged list-rows API; a table geocoded like a CSV download.
    RemoteRows {
        dataset_id: String,
        #[serde(default = "default_page_limit")]
        page_limit: usize,
    },
    LocalArtifact {
        candidates: Vec<ArtifactSource>,
    },
    Community {
        endpoints: Vec<String>,
        area: String,
        filters: Vec<BTreeMap<String, String>>,
        #[serde(default = "default_overpass_timeout")]
        timeout_secs: u32,
    },
    Proxy {
        label_prefix: String,
    },
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Tier::RemoteDataset { dataset_id, .. } => write!(f, "remote dataset {dataset_id}"),
            Tier::RemoteRows { dataset_id, .. } => write!(f, "remote rows {dataset_id}"),
            Tier::LocalArtifact { candidates } => {
                let paths: Vec<String> = candidates
                    .iter()
                    .map(|candidate| candidate.path.display().to_string())
                    .collect();
                write!(f, "local artifact [{}]", paths.join(", "))
            }
            Tier::Community { area, endpoints, .. } => {
                write!(f, "community data in {area} ({} endpoints)", endpoints.len())
            }
            Tier::Proxy { label_prefix } => write!(f, "proxy points ({label_prefix})"),
        }
    }
}

/// The acquisition chain for one category and where its result is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryConfig {
    pub name: String,
    pub output: PathBuf,
    pub tiers: Vec<Tier>,
}

impl CategoryConfig {
    /// MRT station exits. Ends in the proxy tier, so it always resolves.
    pub fn transit(layout: &DataLayout) -> CategoryConfig {
        let dir = layout.category_dir("mrt");
        let exit_geojson = DatasetFormat::GeoJson {
            label_field: "STATION_NA".to_string(),
            code_field: Some("EXIT_CODE".to_string()),
        };
        CategoryConfig {
            name: "mrt".to_string(),
            output: dir.join("mrt_exits.csv"),
            tiers: vec![
                Tier::RemoteDataset {
                    dataset_id: "d_b39d3a0871985372d7e1637193335da5".to_string(),
                    format: exit_geojson.clone(),
                },
                Tier::LocalArtifact {
                    candidates: vec![
                        ArtifactSource {
                            path: dir.join("mrt_exits.geojson"),
                            format: exit_geojson.clone(),
                        },
                        ArtifactSource {
                            path: dir.join("mrt_exits.json"),
                            format: exit_geojson,
                        },
                        ArtifactSource {
                            path: dir.join("mrt_exits.csv"),
                            format: DatasetFormat::Csv,
                        },
                    ],
                },
                Tier::Community {
                    endpoints: OVERPASS_MIRRORS.iter().map(|url| url.to_string()).collect(),
                    area: "Singapore".to_string(),
                    filters: vec![
                        BTreeMap::from([
                            ("railway".to_string(), "station".to_string()),
                            ("station".to_string(), "subway".to_string()),
                        ]),
                        BTreeMap::from([
                            ("railway".to_string(), "station".to_string()),
                            ("subway".to_string(), "yes".to_string()),
                        ]),
                    ],
                    timeout_secs: 25,
                },
                Tier::Proxy {
                    label_prefix: "MRT Proxy".to_string(),
                },
            ],
        }
    }

    /// MOE general information of schools. No proxy tier: may be exhausted.
    pub fn schools(layout: &DataLayout) -> CategoryConfig {
        let dir = layout.category_dir("schools");
        CategoryConfig {
            name: "school".to_string(),
            output: dir.join("schools.csv"),
            tiers: vec![
                Tier::RemoteDataset {
                    dataset_id: "d_688b934f82c1059ed0a6993d2a829089".to_string(),
                    format: DatasetFormat::Csv,
                },
                Tier::RemoteRows {
                    dataset_id: "d_688b934f82c1059ed0a6993d2a829089".to_string(),
                    page_limit: default_page_limit(),
                },
                Tier::LocalArtifact {
                    candidates: vec![ArtifactSource {
                        path: dir.join("schools.csv"),
                        format: DatasetFormat::Csv,
                    }],
                },
                Tier::Community {
                    endpoints: vec![OVERPASS_MIRRORS[0].to_string()],
                    area: "Singapore".to_string(),
                    filters: vec![BTreeMap::from([(
                        "amenity".to_string(),
                        "school".to_string(),
                    )])],
                    timeout_secs: 60,
                },
            ],
        }
    }

    pub fn defaults(layout: &DataLayout) -> Vec<CategoryConfig> {
        vec![CategoryConfig::transit(layout), CategoryConfig::schools(layout)]
    }

    /// Reads a JSON array of category chains.
    pub fn load_all(path: &Path) -> Result<Vec<CategoryConfig>, anyhow::Error> {
        let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// The chains in `path` if given, the built-in ones otherwise.
    pub fn configured(layout: &DataLayout, path: Option<&Path>) -> Result<Vec<CategoryConfig>, anyhow::Error> {
        match path {
            Some(path) => CategoryConfig::load_all(path),
            None => Ok(CategoryConfig::defaults(layout)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Success { rows: usize },
    Failure { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionAttempt {
    /// 1-based position in the chain.
    pub tier: usize,
    pub description: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error("no acquisition tier produced data for `{category}` ({} attempts)", .attempts.len())]
    Exhausted {
        category: String,
        attempts: Vec<AcquisitionAttempt>,
    },
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub table: ReferenceTable,
    pub attempts: Vec<AcquisitionAttempt>,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub datagov_api_base: String,
    pub datagov_rows_api: String,
    pub api_key: Option<String>,
    pub poll_retries: usize,
    pub poll_delay: Duration,
    pub endpoint_pause: Duration,
    pub request_timeout: Duration,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        ResolverSettings {
            datagov_api_base: DATAGOV_DOWNLOAD_API.to_string(),
            datagov_rows_api: DATAGOV_ROWS_API.to_string(),
            api_key: None,
            poll_retries: 60,
            poll_delay: Duration::from_secs(2),
            endpoint_pause: Duration::from_secs(2),
            request_timeout: Duration::from_secs(60),
        }
    }
}

/// Runs acquisition chains. Holds the centroids used by proxy tiers and an
/// optional geocoder for tables that arrive without coordinates.
pub struct ReferenceResolver<S: LocationSearch = OneMapSearch> {
    client: Client,
    settings: ResolverSettings,
    centroids: CentroidTable,
    geocoder: Option<CachedGeocoder<S>>,
}

impl ReferenceResolver<OneMapSearch> {
    pub fn new(
        settings: ResolverSettings,
        centroids: CentroidTable,
    ) -> Result<ReferenceResolver<OneMapSearch>, anyhow::Error> {
        Ok(ReferenceResolver {
            client: Client::builder().timeout(settings.request_timeout).build()?,
            settings,
            centroids,
            geocoder: None,
        })
    }
}

impl<S: LocationSearch> ReferenceResolver<S> {
    pub fn with_geocoder<T: LocationSearch>(self, geocoder: CachedGeocoder<T>) -> ReferenceResolver<T> {
        ReferenceResolver {
            client: self.client,
            settings: self.settings,
            centroids: self.centroids,
            geocoder: Some(geocoder),
        }
    }

    pub fn geocoder(&self) -> Option<&CachedGeocoder<S>> {
        self.geocoder.as_ref()
    }

    /// Tries each tier in order until one yields a non-empty table, persists it
    /// to the category output and returns it with the attempt log. Tier errors
    /// never escape; only a chain where every tier failed is an error.
    pub async fn resolve(&mut self, config: &CategoryConfig) -> Result<Resolution, AcquisitionError> {
        let mut attempts = Vec::new();
        for (index, tier) in config.tiers.iter().enumerate() {
            let description = tier.to_string();
            debug!("[{}] tier {}: trying {}", config.name, index + 1, description);
            let outcome = match self.attempt(tier).await {
                Ok(points) => {
                    let table = ReferenceTable::new(&config.name, points);
                    if table.is_empty() {
                        Err("no rows with coordinates".to_string())
                    } else {
                        Ok(table)
                    }
                }
                Err(err) => Err(format!("{err:#}")),
            };
            match outcome {
                Ok(table) => {
                    if let Err(err) = table.save(&config.output) {
                        warn!(
                            "[{}] could not persist {} points to {:?}: {}",
                            config.name,
                            table.len(),
                            config.output,
                            err
                        );
                    }
                    info!(
                        "[{}] tier {} ({}) produced {} points",
                        config.name,
                        index + 1,
                        description,
                        table.len()
                    );
                    attempts.push(AcquisitionAttempt {
                        tier: index + 1,
                        description,
                        outcome: AttemptOutcome::Success { rows: table.len() },
                    });
                    return Ok(Resolution { table, attempts });
                }
                Err(reason) => {
                    warn!(
                        "[{}] tier {} ({}) failed: {}",
                        config.name,
                        index + 1,
                        description,
                        reason
                    );
                    attempts.push(AcquisitionAttempt {
                        tier: index + 1,
                        description,
                        outcome: AttemptOutcome::Failure { reason },
                    });
                }
            }
        }
        Err(AcquisitionError::Exhausted {
            category: config.name.clone(),
            attempts,
        })
    }

    async fn attempt(&mut self, tier: &Tier) -> Result<Vec<ReferencePoint>, anyhow::Error> {
        match tier {
            Tier::RemoteDataset { dataset_id, format } => {
                let download = DatasetDownload {
                    client: &self.client,
                    api_base: &self.settings.datagov_api_base,
                    api_key: self.settings.api_key.as_deref(),
                    poll_retries: self.settings.poll_retries,
                    poll_delay: self.settings.poll_delay,
                };
                let body = download.fetch(dataset_id).await?;
                self.parse(format, &body).await
            }
            Tier::RemoteRows {
                dataset_id,
                page_limit,
            } => {
                let listing = RowListing {
                    client: &self.client,
                    api_base: &self.settings.datagov_rows_api,
                    api_key: self.settings.api_key.as_deref(),
                    page_limit: *page_limit,
                };
                let rows = datagov::list_rows(&listing, dataset_id).await?;
                self.table_points(NormalizedTable::from_rows(&rows)).await
            }
            Tier::LocalArtifact { candidates } => {
                let mut reasons = Vec::new();
                for source in candidates.iter().filter(|source| source.path.is_file()) {
                    debug!("Reading local artifact {:?}", source.path);
                    let points = match tokio::fs::read_to_string(&source.path).await {
                        Ok(body) => self.parse(&source.format, &body).await,
                        Err(err) => Err(err.into()),
                    };
                    match points {
                        Ok(points) if points.iter().any(|point| point.coordinate().is_finite()) => {
                            return Ok(points)
                        }
                        Ok(_) => reasons.push(format!("{:?}: no rows with coordinates", source.path)),
                        Err(err) => reasons.push(format!("{:?}: {err:#}", source.path)),
                    }
                }
                if reasons.is_empty() {
                    bail!("no local artifact present");
                }
                bail!("{}", reasons.join("; "))
            }
            Tier::Community {
                endpoints,
                area,
                filters,
                timeout_secs,
            } => {
                let query = overpass::build_query(area, filters, *timeout_secs);
                overpass::fetch(&self.client, endpoints, &query, self.settings.endpoint_pause).await
            }
            Tier::Proxy { label_prefix } => Ok(proxy_points(&self.centroids, label_prefix)),
        }
    }

    async fn parse(&mut self, format: &DatasetFormat, body: &str) -> Result<Vec<ReferencePoint>, anyhow::Error> {
        match format {
            DatasetFormat::GeoJson {
                label_field,
                code_field,
            } => parse::geojson_points(body, label_field, code_field.as_deref()),
            DatasetFormat::Csv => self.table_points(NormalizedTable::parse(body)?).await,
        }
    }

    /// Points from the table's own coordinates, or geocoded by address.
    async fn table_points(&mut self, table: NormalizedTable) -> Result<Vec<ReferencePoint>, anyhow::Error> {
        if table.has_coordinates() {
            return Ok(table.points());
        }
        let Some(geocoder) = self.geocoder.as_mut() else {
            bail!("table has no coordinate columns and no geocoder is configured");
        };
        let keys = table.address_keys();
        let resolved = geocoder.resolve_many(&keys).await;
        Ok(keys
            .iter()
            .zip(table.labels())
            .filter_map(|(key, label)| {
                let coordinate = resolved.get(key).copied().flatten()?;
                Some(ReferencePoint {
                    label,
                    code: None,
                    latitude: coordinate.latitude,
                    longitude: coordinate.longitude,
                })
            })
            .collect())
    }
}

/// One point per centroid, labeled `"<prefix> - <Region>"`.
pub fn proxy_points(centroids: &CentroidTable, label_prefix: &str) -> Vec<ReferencePoint> {
    centroids
        .iter()
        .map(|(region, coordinate)| ReferencePoint {
            label: Some(format!("{} - {}", label_prefix, title_case(region))),
            code: None,
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
        })
        .collect()
}

fn title_case(text: &str) -> String {
    let mut titled = String::with_capacity(text.len());
    let mut at_word_start = true;
    for c in text.chars() {
        if c.is_alphabetic() {
            if at_word_start {
                titled.extend(c.to_uppercase());
            } else {
                titled.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            titled.push(c);
            at_word_start = true;
        }
    }
    titled
}
