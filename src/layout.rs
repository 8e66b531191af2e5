use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::bail;
use log::debug;

pub static RESALE_TABLE_NAME: &str = "hdb_resale_2017_onwards.csv";

/// Columns a primary table must carry to take part in the precise geocode join.
pub static IDENTIFIER_COLUMNS: [&str; 2] = ["block", "street_name"];

/// Tables this crate writes under `data/raw`. They are never the primary table.
static DERIVED_TABLE_NAMES: [&str; 3] = ["block_street_geocodes.csv", "mrt_exits.csv", "schools.csv"];

/// Where every intermediate and output table lives under a project root.
///
/// ```text
/// data/raw/hdb/           primary resale table
/// data/raw/mrt/           transit exit tables
/// data/raw/schools/       school tables
/// data/raw/geocodes/      precise block geocodes
/// data/cache/             geocoder caches
/// data/processed/         feature output
/// ```
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> DataLayout {
        DataLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn raw_dir(&self) -> PathBuf {
        self.root.join("data").join("raw")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("data").join("cache")
    }

    pub fn processed_dir(&self) -> PathBuf {
        self.root.join("data").join("processed")
    }

    pub fn category_dir(&self, category: &str) -> PathBuf {
        self.raw_dir().join(category)
    }

    pub fn resale_table(&self) -> PathBuf {
        self.category_dir("hdb").join(RESALE_TABLE_NAME)
    }

    pub fn block_geocodes(&self) -> PathBuf {
        self.category_dir("geocodes").join("block_street_geocodes.csv")
    }

    pub fn block_geocode_cache(&self) -> PathBuf {
        self.cache_dir().join("onemap_block_geocode.csv")
    }

    pub fn school_geocode_cache(&self) -> PathBuf {
        self.cache_dir().join("onemap_school_geocode.csv")
    }

    pub fn features_output(&self) -> PathBuf {
        self.processed_dir().join("features_real.csv")
    }

    /// Finds the primary resale table: the canonical file names first, then any
    /// CSV under the raw directories whose header has the identifier columns.
    pub fn locate_primary_table(&self) -> Result<PathBuf, anyhow::Error> {
        let mut candidates = vec![
            self.resale_table(),
            self.raw_dir().join(RESALE_TABLE_NAME),
        ];
        candidates.extend(csv_files_in(&self.category_dir("hdb")));
        candidates.extend(csv_files_in(&self.raw_dir()));

        for candidate in candidates {
            if !candidate.is_file() || is_derived_table(&candidate) {
                continue;
            }
            if has_identifier_columns(&candidate) {
                debug!("Using primary table {:?}", candidate);
                return Ok(candidate);
            }
            debug!("Skipping {:?}, missing identifier columns", candidate);
        }
        bail!(
            "no resale table found; place it at {:?} (it must contain {})",
            self.resale_table(),
            IDENTIFIER_COLUMNS.join(", ")
        )
    }

    pub fn locate_block_geocodes(&self) -> Option<PathBuf> {
        [
            self.block_geocodes(),
            self.raw_dir().join("block_street_geocodes.csv"),
        ]
        .into_iter()
        .find(|path| path.is_file())
    }
}

fn is_derived_table(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| DERIVED_TABLE_NAMES.contains(&name))
        .unwrap_or(false)
}

fn csv_files_in(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .filter(|path| path.extension().map(|ext| ext == "csv").unwrap_or(false))
        .collect();
    paths.sort();
    paths
}

fn has_identifier_columns(path: &Path) -> bool {
    let Ok(mut reader) = csv::Reader::from_path(path) else {
        return false;
    };
    let Ok(headers) = reader.headers() else {
        return false;
    };
    let headers: Vec<String> = headers
        .iter()
        .map(|header| header.trim().to_lowercase())
        .collect();
    IDENTIFIER_COLUMNS
        .iter()
        .all(|column| headers.iter().any(|header| header == column))
}
