use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use anyhow::bail;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;

use super::ReferencePoint;

pub static OVERPASS_MIRRORS: [&str; 3] = [
    "https://overpass-api.de/api/interpreter",
    "https://overpass.kumi.systems/api/interpreter",
    "https://lz4.overpass-api.de/api/interpreter",
];

/// Overpass QL for nodes inside a named area. Each filter is one node
/// selector whose tags must all match; selectors are unioned.
pub fn build_query(area: &str, filters: &[BTreeMap<String, String>], timeout_secs: u32) -> String {
    let mut query = format!(
        "[out:json][timeout:{}];\narea[\"name\"=\"{}\"]->.searchArea;\n(\n",
        timeout_secs,
        quote(area)
    );
    for filter in filters {
        query.push_str("  node");
        for (key, value) in filter {
            query.push_str(&format!("[\"{}\"=\"{}\"]", quote(key), quote(value)));
        }
        query.push_str("(area.searchArea);\n");
    }
    query.push_str(");\nout body;\n");
    query
}

fn quote(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<Element>,
}

#[derive(Debug, Deserialize)]
struct Element {
    #[serde(rename = "type")]
    kind: String,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

pub fn parse_elements(body: &str) -> Result<Vec<ReferencePoint>, anyhow::Error> {
    let response: OverpassResponse = serde_json::from_str(body)?;
    Ok(response
        .elements
        .into_iter()
        .filter(|element| element.kind == "node")
        .filter_map(|mut element| {
            Some(ReferencePoint {
                label: element.tags.remove("name"),
                code: None,
                latitude: element.lat?,
                longitude: element.lon?,
            })
        })
        .collect())
}

async fn post(client: &Client, endpoint: &str, query: &str) -> Result<Vec<ReferencePoint>, anyhow::Error> {
    let body = client
        .post(endpoint)
        .form(&[("data", query)])
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    parse_elements(&body)
}

/// Tries each mirror in order, pausing between failures, and returns the
/// first non-empty answer.
pub async fn fetch(
    client: &Client,
    endpoints: &[String],
    query: &str,
    pause: Duration,
) -> Result<Vec<ReferencePoint>, anyhow::Error> {
    for (attempt, endpoint) in endpoints.iter().enumerate() {
        match post(client, endpoint, query).await {
            Ok(points) if !points.is_empty() => {
                debug!("Overpass mirror {} returned {} nodes", endpoint, points.len());
                return Ok(points);
            }
            Ok(_) => warn!(
                "Overpass attempt {}/{} ({}) returned no nodes",
                attempt + 1,
                endpoints.len(),
                endpoint
            ),
            Err(err) => warn!(
                "Overpass attempt {}/{} ({}) failed: {}",
                attempt + 1,
                endpoints.len(),
                endpoint,
                err
            ),
        }
        if attempt + 1 < endpoints.len() {
            tokio::time::sleep(pause).await;
        }
    }
    bail!("no Overpass mirror returned usable nodes")
}
