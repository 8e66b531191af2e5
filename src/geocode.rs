use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use log::{debug, info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{coerce_f64, Coordinate};

pub static ONEMAP_SEARCH: &str = "https://www.onemap.gov.sg/api/common/elastic/search";
pub static DEFAULT_COURTESY_DELAY: Duration = Duration::from_millis(150);
static SEARCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A free-text location search service.
#[allow(async_fn_in_trait)]
pub trait LocationSearch {
    /// `Ok(None)` when the service answered but had no candidates.
    async fn search(&self, query: &str) -> Result<Option<Coordinate>, anyhow::Error>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(rename = "LATITUDE")]
    latitude: Value,
    #[serde(rename = "LONGITUDE")]
    longitude: Value,
}

/// OneMap reports coordinates as strings, but accept plain numbers too.
fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|value| value.is_finite()),
        Value::String(text) => coerce_f64(text),
        _ => None,
    }
}

fn first_result(body: &str) -> Result<Option<Coordinate>, anyhow::Error> {
    let response: SearchResponse = serde_json::from_str(body)?;
    let Some(first) = response.results.first() else {
        return Ok(None);
    };
    match Coordinate::from_parts(json_number(&first.latitude), json_number(&first.longitude)) {
        Some(coordinate) => Ok(Some(coordinate)),
        None => anyhow::bail!("first search result has no usable coordinates"),
    }
}

#[derive(Debug, Clone)]
pub struct OneMapSearch {
    client: Client,
    endpoint: String,
}

impl OneMapSearch {
    pub fn new(endpoint: Option<String>) -> Result<OneMapSearch, anyhow::Error> {
        Ok(OneMapSearch {
            client: Client::builder().timeout(SEARCH_TIMEOUT).build()?,
            endpoint: endpoint.unwrap_or_else(|| ONEMAP_SEARCH.to_string()),
        })
    }
}

impl LocationSearch for OneMapSearch {
    async fn search(&self, query: &str) -> Result<Option<Coordinate>, anyhow::Error> {
        let body = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("searchVal", query),
                ("returnGeom", "Y"),
                ("getAddrDetails", "Y"),
                ("pageNum", "1"),
            ])
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        first_result(&body)
    }
}

#[derive(Debug, Deserialize)]
struct CacheRowIn {
    key: Option<String>,
    #[serde(alias = "lat")]
    latitude: Option<String>,
    #[serde(alias = "lon")]
    longitude: Option<String>,
}

#[derive(Debug, Serialize)]
struct CacheRowOut<'a> {
    key: &'a str,
    latitude: f64,
    longitude: f64,
}

/// Append-only CSV of `key,latitude,longitude`. When the file holds a key
/// more than once the first row wins.
#[derive(Debug)]
pub struct GeocodeCache {
    path: PathBuf,
    entries: HashMap<String, Coordinate>,
    /// The file on disk could not be read and is replaced on the first write.
    replace_on_write: bool,
}

impl GeocodeCache {
    /// Loads whatever is usable. A missing, unreadable or malformed file is an
    /// empty cache; a malformed file is moved aside before anything is written.
    pub fn open(path: impl Into<PathBuf>) -> GeocodeCache {
        let path = path.into();
        let mut replace_on_write = false;
        let has_content = fs::metadata(&path)
            .map(|metadata| metadata.is_file() && metadata.len() > 0)
            .unwrap_or(false);
        let entries = if has_content {
            match read_entries(&path) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!("Ignoring unreadable geocode cache {:?}: {}", path, err);
                    replace_on_write = true;
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        debug!("Geocode cache {:?} has {} entries", path, entries.len());
        GeocodeCache {
            path,
            entries,
            replace_on_write,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<Coordinate> {
        self.entries.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, Coordinate)> {
        self.entries.iter().map(|(key, coordinate)| (key.as_str(), *coordinate))
    }

    /// Records a new entry in memory and appends it to the file straight away.
    /// Keys already present are left alone and `Ok(false)` is returned.
    pub fn insert(&mut self, key: &str, coordinate: Coordinate) -> Result<bool, anyhow::Error> {
        if self.entries.contains_key(key) {
            return Ok(false);
        }
        self.entries.insert(key.to_string(), coordinate);
        self.append(key, coordinate)?;
        Ok(true)
    }

    fn set_aside_unreadable(&mut self) -> Result<(), anyhow::Error> {
        let mut aside = self.path.clone().into_os_string();
        aside.push(".unreadable");
        let aside = PathBuf::from(aside);
        if let Err(err) = fs::rename(&self.path, &aside) {
            debug!("Could not move {:?} aside ({}), truncating it", self.path, err);
            File::create(&self.path)?;
        } else {
            warn!("Moved unreadable geocode cache to {:?}", aside);
        }
        self.replace_on_write = false;
        Ok(())
    }

    fn append(&mut self, key: &str, coordinate: Coordinate) -> Result<(), anyhow::Error> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.replace_on_write && self.path.exists() {
            self.set_aside_unreadable()?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        let len = file.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1))?;
            file.read_exact(&mut last)?;
            if last[0] != b'\n' {
                file.write_all(b"\n")?;
            }
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if len == 0 {
            writer.write_record(["key", "latitude", "longitude"])?;
        }
        writer.serialize(CacheRowOut {
            key,
            latitude: coordinate.latitude,
            longitude: coordinate.longitude,
        })?;
        writer.flush()?;
        Ok(())
    }
}

fn read_entries(path: &Path) -> Result<HashMap<String, Coordinate>, anyhow::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    if !headers.iter().any(|header| header == "key") {
        anyhow::bail!("missing `key` column");
    }
    let mut entries = HashMap::new();
    for row in reader.deserialize::<CacheRowIn>() {
        let row = match row {
            Ok(row) => row,
            Err(err) => {
                debug!("Skipping cache row: {}", err);
                continue;
            }
        };
        let Some(key) = row.key else {
            continue;
        };
        let coordinate = Coordinate::from_parts(
            row.latitude.as_deref().and_then(coerce_f64),
            row.longitude.as_deref().and_then(coerce_f64),
        );
        if let Some(coordinate) = coordinate {
            entries.entry(key).or_insert(coordinate);
        }
    }
    Ok(entries)
}

/// Read-through geocoder: cache first, then one external search per new key.
pub struct CachedGeocoder<S: LocationSearch> {
    search: S,
    cache: GeocodeCache,
    courtesy_delay: Duration,
}

impl<S: LocationSearch> CachedGeocoder<S> {
    pub fn new(search: S, cache: GeocodeCache) -> CachedGeocoder<S> {
        CachedGeocoder {
            search,
            cache,
            courtesy_delay: DEFAULT_COURTESY_DELAY,
        }
    }

    pub fn with_courtesy_delay(mut self, courtesy_delay: Duration) -> CachedGeocoder<S> {
        self.courtesy_delay = courtesy_delay;
        self
    }

    pub fn cache(&self) -> &GeocodeCache {
        &self.cache
    }

    pub fn search(&self) -> &S {
        &self.search
    }

    /// Resolves every key, returning all cached entries plus one entry per
    /// input key (`None` when it could not be resolved). Lookup failures are
    /// logged and never retried within the call. Keys are matched exactly.
    pub async fn resolve_many<I, K>(&mut self, keys: I) -> BTreeMap<String, Option<Coordinate>>
    where
        I: IntoIterator<Item = K>,
        K: AsRef<str>,
    {
        let keys: Vec<String> = keys.into_iter().map(|key| key.as_ref().to_string()).collect();
        let mut attempted = HashSet::new();
        let mut resolved = 0usize;
        for key in &keys {
            if key.trim().is_empty() || self.cache.get(key).is_some() || !attempted.insert(key.as_str()) {
                continue;
            }
            let result = self.search.search(key).await;
            tokio::time::sleep(self.courtesy_delay).await;
            match result {
                Ok(Some(coordinate)) => {
                    resolved += 1;
                    if let Err(err) = self.cache.insert(key, coordinate) {
                        warn!("Failed to persist geocode for {:?}: {}", key, err);
                    }
                }
                Ok(None) => debug!("No geocode result for {:?}", key),
                Err(err) => debug!("Geocode lookup for {:?} failed: {}", key, err),
            }
        }
        info!(
            "Geocoded {} of {} new keys ({} inputs, {} cached entries)",
            resolved,
            attempted.len(),
            keys.len(),
            self.cache.len()
        );

        let mut mapping: BTreeMap<String, Option<Coordinate>> = self
            .cache
            .entries()
            .map(|(key, coordinate)| (key.to_string(), Some(coordinate)))
            .collect();
        for key in keys {
            mapping.entry(key).or_insert(None);
        }
        mapping
    }
}

#[cfg(test)]
pub(crate) mod test {
    use std::{cell::RefCell, collections::HashMap, fs, time::Duration};

    use tempdir::TempDir;

    use crate::Coordinate;

    use super::{first_result, CachedGeocoder, GeocodeCache, LocationSearch};

    /// Answers from a fixed table and records every query it receives.
    pub(crate) struct ScriptedSearch {
        pub answers: HashMap<String, Coordinate>,
        pub calls: RefCell<Vec<String>>,
    }

    impl ScriptedSearch {
        pub fn new(answers: &[(&str, Coordinate)]) -> ScriptedSearch {
            ScriptedSearch {
                answers: answers
                    .iter()
                    .map(|(key, coordinate)| (key.to_string(), *coordinate))
                    .collect(),
                calls: RefCell::new(Vec::new()),
            }
        }

        pub fn calls_for(&self, key: &str) -> usize {
            self.calls.borrow().iter().filter(|call| *call == key).count()
        }
    }

    impl LocationSearch for ScriptedSearch {
        async fn search(&self, query: &str) -> Result<Option<Coordinate>, anyhow::Error> {
            self.calls.borrow_mut().push(query.to_string());
            if query == "BROKEN" {
                anyhow::bail!("connection reset");
            }
            Ok(self.answers.get(query).copied())
        }
    }

    fn geocoder(dir: &TempDir, search: ScriptedSearch) -> CachedGeocoder<ScriptedSearch> {
        CachedGeocoder::new(search, GeocodeCache::open(dir.path().join("cache").join("geo.csv")))
            .with_courtesy_delay(Duration::ZERO)
    }

    #[test]
    fn test_first_result() {
        let body = r#"{"found":2,"results":[{"LATITUDE":"1.3513","LONGITUDE":"103.8486"},{"LATITUDE":"0","LONGITUDE":"0"}]}"#;
        assert_eq!(first_result(body).unwrap(), Some(Coordinate::new(1.3513, 103.8486)));
        assert_eq!(first_result(r#"{"found":0,"results":[]}"#).unwrap(), None);
        assert!(first_result("<html>").is_err());
        assert!(first_result(r#"{"results":[{"LATITUDE":"x","LONGITUDE":"1"}]}"#).is_err());
    }

    #[tokio::test]
    async fn test_repeated_key_is_looked_up_once() {
        let dir = TempDir::new("geocode").unwrap();
        let bishan = Coordinate::new(1.3513, 103.8486);
        let mut geocoder = geocoder(&dir, ScriptedSearch::new(&[("123 BISHAN ST 12 Singapore", bishan)]));
        let keys = [
            "123 BISHAN ST 12 Singapore",
            "999 NOWHERE Singapore",
            "123 BISHAN ST 12 Singapore",
            "999 NOWHERE Singapore",
        ];
        let mapping = geocoder.resolve_many(keys).await;
        assert_eq!(mapping["123 BISHAN ST 12 Singapore"], Some(bishan));
        assert_eq!(mapping["999 NOWHERE Singapore"], None);
        assert_eq!(geocoder.search().calls_for("123 BISHAN ST 12 Singapore"), 1);
        assert_eq!(geocoder.search().calls_for("999 NOWHERE Singapore"), 1);

        let written = fs::read_to_string(geocoder.cache().path()).unwrap();
        let rows: Vec<&str> = written.lines().collect();
        assert_eq!(rows, vec!["key,latitude,longitude", "123 BISHAN ST 12 Singapore,1.3513,103.8486"]);
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let dir = TempDir::new("geocode").unwrap();
        let bishan = Coordinate::new(1.3513, 103.8486);
        let mut first = geocoder(&dir, ScriptedSearch::new(&[("BISHAN", bishan)]));
        first.resolve_many(["BISHAN"]).await;

        let mut second = geocoder(&dir, ScriptedSearch::new(&[]));
        let mapping = second.resolve_many(["BISHAN", "TOA PAYOH"]).await;
        assert_eq!(mapping["BISHAN"], Some(bishan));
        assert_eq!(second.search().calls_for("BISHAN"), 0);
        assert_eq!(second.search().calls_for("TOA PAYOH"), 1);
        assert_eq!(fs::read_to_string(second.cache().path()).unwrap().lines().count(), 2);
    }

    #[tokio::test]
    async fn test_blank_and_failing_keys() {
        let dir = TempDir::new("geocode").unwrap();
        let mut geocoder = geocoder(&dir, ScriptedSearch::new(&[]));
        let mapping = geocoder.resolve_many(["", "   ", "BROKEN"]).await;
        assert_eq!(mapping.get("   "), Some(&None));
        assert_eq!(mapping["BROKEN"], None);
        assert_eq!(geocoder.search().calls.borrow().len(), 1);
        assert!(!geocoder.cache().path().exists());
    }

    #[tokio::test]
    async fn test_whitespace_variants_are_distinct() {
        let dir = TempDir::new("geocode").unwrap();
        let mut geocoder = geocoder(&dir, ScriptedSearch::new(&[]));
        geocoder.resolve_many(["BISHAN", "BISHAN "]).await;
        assert_eq!(geocoder.search().calls.borrow().len(), 2);
    }

    #[test]
    fn test_cache_load_dedupes_and_accepts_legacy_headers() {
        let dir = TempDir::new("geocode").unwrap();
        let path = dir.path().join("geo.csv");
        fs::write(&path, "key,lat,lon\nA,1.0,103.0\nA,2.0,104.0\nB,oops,103.0\n").unwrap();
        let cache = GeocodeCache::open(&path);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("A"), Some(Coordinate::new(1.0, 103.0)));
    }

    #[tokio::test]
    async fn test_malformed_cache_is_replaced_not_appended_to() {
        let dir = TempDir::new("geocode").unwrap();
        let path = dir.path().join("cache").join("geo.csv");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "name,x,y\nA,1,2").unwrap();
        let bishan = Coordinate::new(1.3513, 103.8486);

        let mut first = geocoder(&dir, ScriptedSearch::new(&[("BISHAN", bishan)]));
        first.resolve_many(["BISHAN"]).await;
        assert_eq!(first.search().calls_for("BISHAN"), 1);

        let mut second = geocoder(&dir, ScriptedSearch::new(&[("BISHAN", bishan)]));
        let mapping = second.resolve_many(["BISHAN"]).await;
        assert_eq!(mapping["BISHAN"], Some(bishan));
        assert_eq!(second.search().calls_for("BISHAN"), 0);
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "key,latitude,longitude\nBISHAN,1.3513,103.8486\n"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("cache").join("geo.csv.unreadable")).unwrap(),
            "name,x,y\nA,1,2"
        );
    }

    #[tokio::test]
    async fn test_append_after_unterminated_last_row() {
        let dir = TempDir::new("geocode").unwrap();
        let path = dir.path().join("cache").join("geo.csv");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "key,latitude,longitude\nA,1.0,103.0").unwrap();

        let mut geocoder = geocoder(&dir, ScriptedSearch::new(&[("B", Coordinate::new(1.3, 103.8))]));
        geocoder.resolve_many(["A", "B"]).await;
        assert_eq!(geocoder.search().calls_for("A"), 0);

        let reopened = GeocodeCache::open(&path);
        assert_eq!(reopened.get("A"), Some(Coordinate::new(1.0, 103.0)));
        assert_eq!(reopened.get("B"), Some(Coordinate::new(1.3, 103.8)));
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 3);
    }

    #[test]
    fn test_malformed_cache_is_empty() {
        let dir = TempDir::new("geocode").unwrap();
        let path = dir.path().join("geo.csv");
        fs::write(&path, "name,x,y\nA,1,2\n").unwrap();
        assert!(GeocodeCache::open(&path).is_empty());
        fs::write(&path, "").unwrap();
        assert!(GeocodeCache::open(&path).is_empty());
    }
}
