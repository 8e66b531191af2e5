use std::{
    collections::BTreeSet,
    fs,
    path::Path,
    time::Duration,
};

use anyhow::{bail, Context};
use log::{debug, info, warn};
use reqwest::{header::AUTHORIZATION, Client, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::cell_text;

pub static CKAN_DATASTORE_SEARCH: &str = "https://data.gov.sg/api/action/datastore_search";

/// HDB resale flat prices, registrations from January 2017 onwards.
pub static RESALE_RESOURCE_ID: &str = "f1765b54-a209-4718-8d38-a39237f502b3";

/// Output columns, in order, when the source provides them.
pub static RESALE_COLUMNS: [&str; 11] = [
    "month",
    "town",
    "flat_type",
    "block",
    "street_name",
    "storey_range",
    "floor_area_sqm",
    "flat_model",
    "lease_commence_year",
    "remaining_lease",
    "resale_price",
];

pub type Row = Map<String, Value>;

/// One datastore page request's outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Page {
    Records(Vec<Row>),
    /// The server refused the page size (HTTP 422).
    TooLarge,
}

#[allow(async_fn_in_trait)]
pub trait DatastorePages {
    async fn page(&self, resource_id: &str, limit: usize, offset: usize) -> Result<Page, anyhow::Error>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Option<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    records: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct CkanDatastore {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl CkanDatastore {
    pub fn new(
        endpoint: Option<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<CkanDatastore, anyhow::Error> {
        Ok(CkanDatastore {
            client: Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.unwrap_or_else(|| CKAN_DATASTORE_SEARCH.to_string()),
            api_key,
        })
    }
}

impl DatastorePages for CkanDatastore {
    async fn page(&self, resource_id: &str, limit: usize, offset: usize) -> Result<Page, anyhow::Error> {
        let mut request = self.client.get(&self.endpoint).query(&[
            ("resource_id", resource_id.to_string()),
            ("limit", limit.to_string()),
            ("offset", offset.to_string()),
        ]);
        if let Some(api_key) = &self.api_key {
            request = request.header(AUTHORIZATION, api_key);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(Page::TooLarge);
        }
        let body = response.error_for_status()?.text().await?;
        let response: SearchResponse = serde_json::from_str(&body)?;
        Ok(Page::Records(
            response.result.map(|result| result.records).unwrap_or_default(),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct PagingSettings {
    pub initial_limit: usize,
    pub min_limit: usize,
    pub page_pause: Duration,
}

impl Default for PagingSettings {
    fn default() -> Self {
        PagingSettings {
            initial_limit: 32_000,
            min_limit: 1_000,
            page_pause: Duration::from_millis(200),
        }
    }
}

/// Pages through a datastore resource until a short or empty page. A refused
/// page size is halved, down to `min_limit`; a refusal at the floor is an error.
pub async fn fetch_all<P: DatastorePages>(
    pages: &P,
    resource_id: &str,
    settings: &PagingSettings,
) -> Result<Vec<Row>, anyhow::Error> {
    let min_limit = settings.min_limit.max(1);
    let mut limit = settings.initial_limit.max(min_limit);
    let mut rows = Vec::new();
    loop {
        let records = match pages.page(resource_id, limit, rows.len()).await? {
            Page::TooLarge if limit > min_limit => {
                limit = (limit / 2).max(min_limit);
                debug!("Page size refused, retrying with limit {}", limit);
                continue;
            }
            Page::TooLarge => bail!("datastore refused the minimum page size {}", limit),
            Page::Records(records) => records,
        };
        if records.is_empty() {
            break;
        }
        let got = records.len();
        rows.extend(records);
        debug!("Fetched {} rows (limit {}), {} total", got, limit, rows.len());
        if got < limit {
            break;
        }
        tokio::time::sleep(settings.page_pause).await;
    }
    if rows.is_empty() {
        bail!("datastore returned no records for {}", resource_id);
    }
    Ok(rows)
}

fn normalize_column(name: &str) -> &str {
    match name {
        "lease_commence_date" => "lease_commence_year",
        other => other,
    }
}

/// Flattens datastore rows into a table. Known columns are kept in their
/// canonical order; a source with none of them keeps every column instead.
pub fn tabulate(rows: &[Row]) -> (Vec<String>, Vec<Vec<String>>) {
    let mut seen = Vec::new();
    let mut names = BTreeSet::new();
    for row in rows {
        for key in row.keys() {
            let name = normalize_column(key);
            if names.insert(name.to_string()) {
                seen.push(name.to_string());
            }
        }
    }
    let known: Vec<String> = RESALE_COLUMNS
        .iter()
        .filter(|column| names.contains(**column))
        .map(|column| column.to_string())
        .collect();
    let headers = if known.is_empty() { seen } else { known };

    let table = rows
        .iter()
        .map(|row| {
            let normalized: Map<String, Value> = row
                .iter()
                .map(|(key, value)| (normalize_column(key).to_string(), value.clone()))
                .collect();
            headers
                .iter()
                .map(|header| normalized.get(header).map(cell_text).unwrap_or_default())
                .collect()
        })
        .collect();
    (headers, table)
}

fn write_table(path: &Path, headers: &[String], rows: &[Vec<String>]) -> Result<(), anyhow::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("creating {:?}", path))?;
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn count_rows(path: &Path) -> Result<usize, anyhow::Error> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let mut count = 0;
    for row in reader.records() {
        row?;
        count += 1;
    }
    Ok(count)
}

/// Downloads the resale table into `output`. If the download fails for any
/// reason the local copy at `fallback` is used instead; without one the
/// command fails. Returns the number of rows written.
pub async fn fetch_resale<P: DatastorePages>(
    pages: &P,
    resource_id: &str,
    settings: &PagingSettings,
    output: &Path,
    fallback: &Path,
) -> Result<usize, anyhow::Error> {
    match fetch_all(pages, resource_id, settings).await {
        Ok(rows) => {
            let (headers, table) = tabulate(&rows);
            write_table(output, &headers, &table)?;
            info!("Wrote {} resale rows to {:?}", table.len(), output);
            Ok(table.len())
        }
        Err(err) => {
            warn!("Resale download failed: {:#}. Falling back to {:?}", err, fallback);
            if !fallback.is_file() {
                bail!(
                    "local fallback not found at {:?}; place the raw resale CSV there",
                    fallback
                );
            }
            if fallback != output {
                if let Some(parent) = output.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(fallback, output)
                    .with_context(|| format!("copying {:?} to {:?}", fallback, output))?;
            }
            let rows = count_rows(output)?;
            info!("Using local resale table {:?} with {} rows", output, rows);
            Ok(rows)
        }
    }
}

#[cfg(test)]
mod test {
    use std::{cell::RefCell, collections::VecDeque, fs, time::Duration};

    use serde_json::json;
    use tempdir::TempDir;

    use super::{
        fetch_all, fetch_resale, tabulate, CkanDatastore, DatastorePages, Page, PagingSettings, Row,
    };

    /// Serves a fixed number of rows and refuses pages larger than `max_limit`.
    struct FakeDatastore {
        total: usize,
        max_limit: usize,
        requests: RefCell<Vec<(usize, usize)>>,
        failures: RefCell<VecDeque<()>>,
    }

    impl FakeDatastore {
        fn new(total: usize, max_limit: usize) -> FakeDatastore {
            FakeDatastore {
                total,
                max_limit,
                requests: RefCell::new(Vec::new()),
                failures: RefCell::new(VecDeque::new()),
            }
        }
    }

    impl DatastorePages for FakeDatastore {
        async fn page(&self, _resource_id: &str, limit: usize, offset: usize) -> Result<Page, anyhow::Error> {
            self.requests.borrow_mut().push((limit, offset));
            if self.failures.borrow_mut().pop_front().is_some() {
                anyhow::bail!("connection reset");
            }
            if limit > self.max_limit {
                return Ok(Page::TooLarge);
            }
            let end = (offset + limit).min(self.total);
            Ok(Page::Records(
                (offset..end)
                    .map(|index| {
                        let row = json!({
                            "_id": index + 1,
                            "month": "2024-01",
                            "town": "BISHAN",
                            "block": "123",
                            "street_name": "BISHAN ST 12",
                            "lease_commence_date": 1987,
                            "resale_price": 500000.0,
                            "remaining_lease": null,
                        });
                        row.as_object().cloned().unwrap_or_default()
                    })
                    .collect(),
            ))
        }
    }

    fn settings() -> PagingSettings {
        PagingSettings {
            initial_limit: 8,
            min_limit: 2,
            page_pause: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_fetch_all_backs_off_and_stops_on_short_page() {
        let datastore = FakeDatastore::new(7, 3);
        let rows = fetch_all(&datastore, "resource", &settings()).await.unwrap();
        assert_eq!(rows.len(), 7);
        assert_eq!(
            *datastore.requests.borrow(),
            vec![(8, 0), (4, 0), (2, 0), (2, 2), (2, 4), (2, 6)]
        );
    }

    #[tokio::test]
    async fn test_fetch_all_stops_on_empty_page() {
        let datastore = FakeDatastore::new(4, 8);
        let settings = PagingSettings {
            initial_limit: 2,
            ..settings()
        };
        let rows = fetch_all(&datastore, "resource", &settings).await.unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(datastore.requests.borrow().last(), Some(&(2, 4)));
    }

    #[tokio::test]
    async fn test_fetch_all_errors() {
        assert!(fetch_all(&FakeDatastore::new(0, 8), "resource", &settings()).await.is_err());
        assert!(fetch_all(&FakeDatastore::new(5, 1), "resource", &settings()).await.is_err());
    }

    #[test]
    fn test_tabulate_renames_and_orders_columns() {
        let rows: Vec<Row> = vec![json!({
            "_id": 1,
            "resale_price": "500000",
            "month": "2024-01",
            "lease_commence_date": 1987,
            "remaining_lease": null,
        })
        .as_object()
        .cloned()
        .unwrap()];
        let (headers, table) = tabulate(&rows);
        assert_eq!(
            headers,
            vec!["month", "lease_commence_year", "remaining_lease", "resale_price"]
        );
        assert_eq!(table, vec![vec!["2024-01", "1987", "", "500000"]]);

        let unknown: Vec<Row> = vec![json!({"a": 1, "b": "x"}).as_object().cloned().unwrap()];
        assert_eq!(tabulate(&unknown).0, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fetch_resale_writes_download() {
        let dir = TempDir::new("resale").unwrap();
        let output = dir.path().join("raw").join("hdb").join("resale.csv");
        let rows = fetch_resale(
            &FakeDatastore::new(3, 8),
            "resource",
            &settings(),
            &output,
            &dir.path().join("missing.csv"),
        )
        .await
        .unwrap();
        assert_eq!(rows, 3);
        let written = fs::read_to_string(&output).unwrap();
        let lines: Vec<&str> = written.lines().collect();
        assert_eq!(
            lines[0],
            "month,town,block,street_name,lease_commence_year,remaining_lease,resale_price"
        );
        assert_eq!(lines[1], "2024-01,BISHAN,123,BISHAN ST 12,1987,,500000.0");
    }

    #[tokio::test]
    async fn test_fetch_resale_falls_back_to_local_copy() {
        let dir = TempDir::new("resale").unwrap();
        let fallback = dir.path().join("local.csv");
        fs::write(&fallback, "month,town\n2024-01,BISHAN\n2024-02,BEDOK\n").unwrap();
        let output = dir.path().join("out").join("resale.csv");
        let datastore = FakeDatastore::new(3, 8);
        datastore.failures.borrow_mut().push_back(());

        let rows = fetch_resale(&datastore, "resource", &settings(), &output, &fallback)
            .await
            .unwrap();
        assert_eq!(rows, 2);
        assert_eq!(fs::read_to_string(&output).unwrap(), fs::read_to_string(&fallback).unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_datastore_without_fallback_fails() {
        let dir = TempDir::new("resale").unwrap();
        let datastore = CkanDatastore::new(
            Some("http://127.0.0.1:9/api/action/datastore_search".to_string()),
            None,
            Duration::from_secs(2),
        )
        .unwrap();
        let output = dir.path().join("resale.csv");
        assert!(fetch_resale(&datastore, "resource", &settings(), &output, &output)
            .await
            .is_err());
        assert!(!output.exists());
    }
}
