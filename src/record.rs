use std::{
    fs::{self, File},
    io::Read,
    path::Path,
};

use anyhow::Context;
use log::debug;

use crate::{coerce_f64, Coordinate};

/// Input columns that carry a coordinate rather than passthrough data.
static LATITUDE_COLUMNS: [&str; 2] = ["lat", "latitude"];
static LONGITUDE_COLUMNS: [&str; 3] = ["lon", "longitude", "lng"];

/// Where a record's coordinate came from, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoordinateSource {
    Input,
    Precise,
    Centroid,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedCoordinate {
    pub coordinate: Coordinate,
    pub source: CoordinateSource,
}

/// One resale transaction. The raw cells are kept for passthrough; the typed
/// attributes are parsed once on load.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    values: Vec<String>,
    pub region: Option<String>,
    pub flat_type: Option<String>,
    pub block: Option<String>,
    pub street_name: Option<String>,
    pub floor_area_sqm: Option<f64>,
    pub resale_price: Option<f64>,
    coordinate: Option<ResolvedCoordinate>,
    derived: Vec<Option<f64>>,
}

impl Record {
    pub fn coordinate(&self) -> Option<Coordinate> {
        self.coordinate.map(|resolved| resolved.coordinate)
    }

    pub fn coordinate_source(&self) -> Option<CoordinateSource> {
        self.coordinate.map(|resolved| resolved.source)
    }

    /// Sets the coordinate only if none is present. Returns whether it was set.
    pub fn fill_coordinate(&mut self, coordinate: Coordinate, source: CoordinateSource) -> bool {
        if self.coordinate.is_some() || !coordinate.is_finite() {
            return false;
        }
        self.coordinate = Some(ResolvedCoordinate { coordinate, source });
        true
    }

    /// Drops a coordinate that is not a finite number pair.
    pub(crate) fn discard_non_finite_coordinate(&mut self) {
        if let Some(resolved) = self.coordinate {
            if !resolved.coordinate.is_finite() {
                self.coordinate = None;
            }
        }
    }
}

/// A loaded primary table plus the derived columns attached to it, in the
/// order they were added.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSet {
    headers: Vec<String>,
    records: Vec<Record>,
    derived_columns: Vec<String>,
}

impl RecordSet {
    pub fn load(path: &Path) -> Result<RecordSet, anyhow::Error> {
        let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
        let set = RecordSet::from_reader(file).with_context(|| format!("reading {:?}", path))?;
        debug!("Loaded {} records from {:?}", set.len(), path);
        Ok(set)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<RecordSet, anyhow::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|header| header.trim().to_lowercase())
            .collect();

        let index = |name: &str| headers.iter().position(|header| header == name);
        let first_index = |names: &[&str]| names.iter().find_map(|name| index(name));
        let region = index("town");
        let flat_type = index("flat_type");
        let block = index("block");
        let street_name = index("street_name");
        let floor_area = index("floor_area_sqm");
        let resale_price = index("resale_price");
        let latitude = first_index(&LATITUDE_COLUMNS);
        let longitude = first_index(&LONGITUDE_COLUMNS);

        let mut records = Vec::new();
        for row in reader.records() {
            let row = row?;
            let mut values: Vec<String> = row.iter().map(|value| value.trim().to_string()).collect();
            values.resize(headers.len(), String::new());

            let text = |column: Option<usize>| {
                column
                    .map(|column| values[column].clone())
                    .filter(|value| !value.is_empty())
            };
            let number = |column: Option<usize>| column.and_then(|column| coerce_f64(&values[column]));

            let coordinate = Coordinate::from_parts(number(latitude), number(longitude)).map(
                |coordinate| ResolvedCoordinate {
                    coordinate,
                    source: CoordinateSource::Input,
                },
            );
            records.push(Record {
                region: text(region),
                flat_type: text(flat_type),
                block: text(block),
                street_name: text(street_name),
                floor_area_sqm: number(floor_area),
                resale_price: number(resale_price),
                coordinate,
                derived: Vec::new(),
                values,
            });
        }
        Ok(RecordSet {
            headers,
            records,
            derived_columns: Vec::new(),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|header| header == name)
    }

    /// Raw cell of an input column, `None` if the column does not exist.
    pub fn value<'a>(&self, record: &'a Record, column: &str) -> Option<&'a str> {
        let index = self.headers.iter().position(|header| header == column)?;
        record.values.get(index).map(String::as_str)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn records_mut(&mut self) -> &mut [Record] {
        &mut self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn coordinates(&self) -> Vec<Option<Coordinate>> {
        self.records.iter().map(Record::coordinate).collect()
    }

    /// Adds a derived numeric column, replacing an earlier one of the same name.
    pub fn set_derived(&mut self, name: &str, values: Vec<Option<f64>>) {
        assert_eq!(values.len(), self.records.len());
        let slot = match self.derived_columns.iter().position(|column| column == name) {
            Some(slot) => slot,
            None => {
                self.derived_columns.push(name.to_string());
                for record in &mut self.records {
                    record.derived.push(None);
                }
                self.derived_columns.len() - 1
            }
        };
        for (record, value) in self.records.iter_mut().zip(values) {
            record.derived[slot] = value;
        }
    }

    pub fn derived_columns(&self) -> &[String] {
        &self.derived_columns
    }

    pub fn derived(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let slot = self.derived_columns.iter().position(|column| column == name)?;
        Some(self.records.iter().map(|record| record.derived[slot]).collect())
    }

    /// Writes passthrough columns, then `lat`/`lon`, then derived columns.
    /// Input coordinate columns and inputs shadowed by a derived column are
    /// not repeated.
    pub fn write(&self, path: &Path) -> Result<(), anyhow::Error> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path).with_context(|| format!("creating {:?}", path))?;
        let passthrough: Vec<usize> = self
            .headers
            .iter()
            .enumerate()
            .filter(|(_, header)| {
                !LATITUDE_COLUMNS.contains(&header.as_str())
                    && !LONGITUDE_COLUMNS.contains(&header.as_str())
                    && !self.derived_columns.contains(header)
            })
            .map(|(index, _)| index)
            .collect();

        let mut header_row: Vec<&str> = passthrough
            .iter()
            .map(|index| self.headers[*index].as_str())
            .collect();
        header_row.extend(["lat", "lon"]);
        header_row.extend(self.derived_columns.iter().map(String::as_str));
        writer.write_record(&header_row)?;

        for record in &self.records {
            let mut row: Vec<String> = passthrough
                .iter()
                .map(|index| record.values[*index].clone())
                .collect();
            let coordinate = record.coordinate();
            row.push(format_number(coordinate.map(|c| c.latitude)));
            row.push(format_number(coordinate.map(|c| c.longitude)));
            row.extend(record.derived.iter().map(|value| format_number(*value)));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn format_number(value: Option<f64>) -> String {
    match value {
        Some(value) => value.to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use tempdir::TempDir;

    use crate::Coordinate;

    use super::{CoordinateSource, RecordSet};

    const SAMPLE: &str = "\
Month, Town ,flat_type,block,street_name,floor_area_sqm,resale_price,lat,lon
2024-01,ANG MO KIO,3 ROOM,406,ANG MO KIO AVE 10,67,420000,1.3620,103.8540
2024-02,BISHAN,4 ROOM, 123 ,BISHAN ST 12 ,92,680000,,
2024-03,BISHAN,4 ROOM,124,BISHAN ST 12,n/a,690000,abc,103.8
";

    #[test]
    fn test_load_normalizes_headers_and_values() {
        let set = RecordSet::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(set.len(), 3);
        assert!(set.has_column("town"));
        assert!(set.has_column("month"));
        let record = &set.records()[1];
        assert_eq!(record.region.as_deref(), Some("BISHAN"));
        assert_eq!(record.block.as_deref(), Some("123"));
        assert_eq!(record.street_name.as_deref(), Some("BISHAN ST 12"));
        assert_eq!(record.floor_area_sqm, Some(92.0));
        assert_eq!(set.value(record, "month"), Some("2024-02"));
        assert_eq!(set.value(record, "missing"), None);
    }

    #[test]
    fn test_input_coordinates_are_coerced() {
        let set = RecordSet::from_reader(SAMPLE.as_bytes()).unwrap();
        let records = set.records();
        assert_eq!(records[0].coordinate(), Some(Coordinate::new(1.362, 103.854)));
        assert_eq!(records[0].coordinate_source(), Some(CoordinateSource::Input));
        assert_eq!(records[1].coordinate(), None);
        assert_eq!(records[2].coordinate(), None);
        assert_eq!(records[2].floor_area_sqm, None);
    }

    #[test]
    fn test_fill_never_overwrites() {
        let mut set = RecordSet::from_reader(SAMPLE.as_bytes()).unwrap();
        let record = &mut set.records_mut()[1];
        assert!(record.fill_coordinate(Coordinate::new(1.35, 103.85), CoordinateSource::Precise));
        assert!(!record.fill_coordinate(Coordinate::new(1.0, 103.0), CoordinateSource::Precise));
        assert_eq!(record.coordinate(), Some(Coordinate::new(1.35, 103.85)));
        assert_eq!(record.coordinate_source(), Some(CoordinateSource::Precise));
        assert!(!record.fill_coordinate(Coordinate::new(f64::NAN, 1.0), CoordinateSource::Centroid));
    }

    #[test]
    fn test_short_rows_are_padded() {
        let set = RecordSet::from_reader("town,block,street_name\nBISHAN,1\n".as_bytes()).unwrap();
        assert_eq!(set.records()[0].street_name, None);
    }

    #[test]
    fn test_write_layout() {
        let dir = TempDir::new("records").unwrap();
        let path = dir.path().join("out").join("features.csv");
        let mut set = RecordSet::from_reader(SAMPLE.as_bytes()).unwrap();
        set.set_derived("dist_to_mrt_m", vec![Some(12.5), None, None]);
        set.set_derived("dist_to_mrt_m", vec![Some(10.0), None, Some(3.0)]);
        set.write(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        let mut lines = written.lines();
        assert_eq!(
            lines.next().unwrap(),
            "month,town,flat_type,block,street_name,floor_area_sqm,resale_price,lat,lon,dist_to_mrt_m"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2024-01,ANG MO KIO,3 ROOM,406,ANG MO KIO AVE 10,67,420000,1.362,103.854,10"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2024-02,BISHAN,4 ROOM,123,BISHAN ST 12,92,680000,,,"
        );
    }
}
