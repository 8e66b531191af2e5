use std::collections::BTreeMap;

use crate::Coordinate;

/// Approximate representative points for HDB towns.
static HDB_TOWNS: [(&str, f64, f64); 26] = [
    ("ANG MO KIO", 1.3691, 103.8454),
    ("BEDOK", 1.3236, 103.9273),
    ("BISHAN", 1.3509, 103.8485),
    ("BUKIT BATOK", 1.3496, 103.7496),
    ("BUKIT MERAH", 1.2826, 103.8179),
    ("BUKIT PANJANG", 1.3786, 103.7639),
    ("BUKIT TIMAH", 1.3294, 103.8021),
    ("CENTRAL AREA", 1.2920, 103.8545),
    ("CHOA CHU KANG", 1.3854, 103.7443),
    ("CLEMENTI", 1.3151, 103.7643),
    ("GEYLANG", 1.3181, 103.8839),
    ("HOUGANG", 1.3612, 103.8930),
    ("JURONG EAST", 1.3333, 103.7430),
    ("JURONG WEST", 1.3496, 103.7080),
    ("KALLANG/WHAMPOA", 1.3133, 103.8641),
    ("MARINE PARADE", 1.3030, 103.9010),
    ("PASIR RIS", 1.3730, 103.9490),
    ("PUNGGOL", 1.4043, 103.9020),
    ("QUEENSTOWN", 1.2941, 103.7851),
    ("SEMBAWANG", 1.4491, 103.8201),
    ("SENGKANG", 1.3911, 103.8950),
    ("SERANGOON", 1.3524, 103.8677),
    ("TAMPINES", 1.3536, 103.9455),
    ("TOA PAYOH", 1.3347, 103.8530),
    ("WOODLANDS", 1.4360, 103.7865),
    ("YISHUN", 1.4304, 103.8353),
];

/// Region label to representative coordinate. Labels are stored upper-cased
/// and trimmed, and lookups normalize the same way.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CentroidTable {
    entries: BTreeMap<String, Coordinate>,
}

impl CentroidTable {
    pub fn new<I, K>(entries: I) -> CentroidTable
    where
        I: IntoIterator<Item = (K, Coordinate)>,
        K: AsRef<str>,
    {
        CentroidTable {
            entries: entries
                .into_iter()
                .map(|(region, coordinate)| (normalize_region(region.as_ref()), coordinate))
                .collect(),
        }
    }

    pub fn hdb_towns() -> CentroidTable {
        CentroidTable::new(
            HDB_TOWNS
                .iter()
                .map(|(town, lat, lng)| (*town, Coordinate::new(*lat, *lng))),
        )
    }

    pub fn get(&self, region: &str) -> Option<Coordinate> {
        self.entries.get(&normalize_region(region)).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Coordinate)> {
        self.entries
            .iter()
            .map(|(region, coordinate)| (region.as_str(), *coordinate))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_region(region: &str) -> String {
    region.trim().to_uppercase()
}
