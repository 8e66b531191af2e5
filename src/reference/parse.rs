use anyhow::anyhow;
use regress::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{cell_text, coerce_f64};

use super::ReferencePoint;

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(default)]
    coordinates: Value,
}

/// Pulls `<th>FIELD</th><td>value</td>` cells out of the HTML attribute tables
/// that data.gov.sg embeds in KML-derived GeoJSON descriptions.
pub struct DescriptionFields {
    patterns: Vec<(String, Regex)>,
}

impl DescriptionFields {
    pub fn new(fields: &[&str]) -> Result<DescriptionFields, anyhow::Error> {
        let patterns = fields
            .iter()
            .map(|field| {
                let pattern = format!(r"<th>\s*{}\s*</th>\s*<td>(.*?)</td>", escape(field));
                Regex::new(&pattern)
                    .map(|regex| (field.to_string(), regex))
                    .map_err(|err| anyhow!("bad description pattern for {field}: {err}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DescriptionFields { patterns })
    }

    pub fn extract(&self, description: &str, field: &str) -> Option<String> {
        let (_, regex) = self.patterns.iter().find(|(name, _)| name == field)?;
        let found = regex.find(description)?;
        let value = description[found.group(1)?].trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    }
}

fn escape(field: &str) -> String {
    let mut escaped = String::with_capacity(field.len());
    for c in field.chars() {
        if r"\^$.|?*+()[]{}/".contains(c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn property_text(properties: &Map<String, Value>, key: &str) -> Option<String> {
    properties
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Parses a GeoJSON feature collection into points. The label comes from the
/// description table, then the plain property, then `Name`. Features without a
/// numeric `[lon, lat]` are dropped.
pub fn geojson_points(
    body: &str,
    label_field: &str,
    code_field: Option<&str>,
) -> Result<Vec<ReferencePoint>, anyhow::Error> {
    let collection: FeatureCollection = serde_json::from_str(body)?;
    let mut fields = vec![label_field];
    fields.extend(code_field);
    let description_fields = DescriptionFields::new(&fields)?;

    let empty = Map::new();
    let mut points = Vec::new();
    for feature in &collection.features {
        let Some(geometry) = &feature.geometry else {
            continue;
        };
        let longitude = geometry.coordinates.get(0).and_then(Value::as_f64);
        let latitude = geometry.coordinates.get(1).and_then(Value::as_f64);
        let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
            continue;
        };
        let properties = feature.properties.as_ref().unwrap_or(&empty);
        let description = properties
            .get("Description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let label = description_fields
            .extract(description, label_field)
            .or_else(|| property_text(properties, label_field))
            .or_else(|| property_text(properties, "Name"));
        let code = code_field.and_then(|field| {
            description_fields
                .extract(description, field)
                .or_else(|| property_text(properties, field))
        });
        points.push(ReferencePoint {
            label,
            code,
            latitude,
            longitude,
        });
    }
    Ok(points)
}

static LATITUDE_COLUMNS: [&str; 2] = ["lat", "latitude"];
static LONGITUDE_COLUMNS: [&str; 3] = ["lon", "longitude", "lng"];
static LABEL_COLUMNS: [&str; 4] = ["label", "school_name", "station_name", "name"];
static CODE_COLUMNS: [&str; 2] = ["code", "exit_code"];
static ADDRESS_COLUMNS: [&str; 4] = ["address", "addr1", "addr", "street_name"];

fn normalize_header(header: &str) -> String {
    let header = header.trim().to_lowercase();
    match header.as_str() {
        "schoolname" => "school_name".to_string(),
        "postalcode" => "postal_code".to_string(),
        _ => header,
    }
}

/// A delimited table with trimmed, lower-cased and harmonized headers.
#[derive(Debug, Clone)]
pub struct NormalizedTable {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl NormalizedTable {
    pub fn parse(body: &str) -> Result<NormalizedTable, anyhow::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(body.as_bytes());
        let headers: Vec<String> = reader.headers()?.iter().map(normalize_header).collect();
        let mut rows = Vec::new();
        for row in reader.records() {
            let mut row: Vec<String> = row?.iter().map(|value| value.trim().to_string()).collect();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }
        Ok(NormalizedTable { headers, rows })
    }

    /// A table from JSON row objects. Columns appear in first-seen order and
    /// missing cells are blank.
    pub fn from_rows(records: &[Map<String, Value>]) -> NormalizedTable {
        let mut headers: Vec<String> = Vec::new();
        for record in records {
            for key in record.keys() {
                let header = normalize_header(key);
                if !headers.contains(&header) {
                    headers.push(header);
                }
            }
        }
        let rows = records
            .iter()
            .map(|record| {
                let normalized: Map<String, Value> = record
                    .iter()
                    .map(|(key, value)| (normalize_header(key), value.clone()))
                    .collect();
                headers
                    .iter()
                    .map(|header| {
                        normalized
                            .get(header)
                            .map(|value| cell_text(value).trim().to_string())
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .collect();
        NormalizedTable { headers, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column(&self, names: &[&str]) -> Option<usize> {
        names
            .iter()
            .find_map(|name| self.headers.iter().position(|header| header == name))
    }

    fn cell(row: &[String], column: Option<usize>) -> Option<String> {
        column
            .map(|column| row[column].clone())
            .filter(|value| !value.is_empty() && !value.eq_ignore_ascii_case("nan"))
    }

    pub fn has_coordinates(&self) -> bool {
        self.column(&LATITUDE_COLUMNS).is_some() && self.column(&LONGITUDE_COLUMNS).is_some()
    }

    /// Rows whose coordinate cells both parse. Other rows are dropped.
    pub fn points(&self) -> Vec<ReferencePoint> {
        let latitude = self.column(&LATITUDE_COLUMNS);
        let longitude = self.column(&LONGITUDE_COLUMNS);
        let label = self.column(&LABEL_COLUMNS);
        let code = self.column(&CODE_COLUMNS);
        let (Some(latitude), Some(longitude)) = (latitude, longitude) else {
            return Vec::new();
        };
        self.rows
            .iter()
            .filter_map(|row| {
                Some(ReferencePoint {
                    label: Self::cell(row, label),
                    code: Self::cell(row, code),
                    latitude: coerce_f64(&row[latitude])?,
                    longitude: coerce_f64(&row[longitude])?,
                })
            })
            .collect()
    }

    /// One search string per row: name, address parts, postal code and
    /// "Singapore", skipping blanks.
    pub fn address_keys(&self) -> Vec<String> {
        let name = self.column(&["school_name", "name"]);
        let addresses: Vec<usize> = ADDRESS_COLUMNS
            .iter()
            .filter_map(|column| self.column(&[column]))
            .collect();
        let postal = self.headers.iter().position(|header| header.contains("postal"));
        self.rows
            .iter()
            .map(|row| {
                let mut parts: Vec<String> = Vec::new();
                parts.extend(Self::cell(row, name));
                parts.extend(addresses.iter().filter_map(|column| Self::cell(row, Some(*column))));
                parts.extend(Self::cell(row, postal));
                parts.push("Singapore".to_string());
                parts.join(" ")
            })
            .collect()
    }

    /// Labels aligned with `address_keys`.
    pub fn labels(&self) -> Vec<Option<String>> {
        let label = self.column(&LABEL_COLUMNS);
        self.rows.iter().map(|row| Self::cell(row, label)).collect()
    }
}
