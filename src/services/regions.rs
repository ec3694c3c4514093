//! Region → endpoint table, loaded from a TOML file at startup.

use serde::Deserialize;
use std::{collections::HashMap, fs, io, path::Path};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegionTableError {
    #[error("reading region table `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("parsing region table: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("region table is empty")]
    Empty,
    #[error("anchor region `{0}` is not in the region table")]
    MissingAnchor(String),
}

#[derive(Debug, Deserialize)]
struct RegionFile {
    regions: HashMap<String, String>,
}

/// Known provider regions and the endpoint serving each.
///
/// One region is the anchor: location lookups are sent to its endpoint and
/// an empty location constraint resolves to it.
#[derive(Clone, Debug)]
pub struct RegionTable {
    endpoints: HashMap<String, String>,
    anchor: String,
}

impl RegionTable {
    /// Build a table from `(region, endpoint)` pairs.
    pub fn new<I, K, V>(entries: I, anchor: &str) -> Result<Self, RegionTableError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let endpoints: HashMap<String, String> = entries
            .into_iter()
            .map(|(region, endpoint)| (normalize_region(region.as_ref()), endpoint.into()))
            .collect();
        if endpoints.is_empty() {
            return Err(RegionTableError::Empty);
        }

        let anchor = normalize_region(anchor);
        if !endpoints.contains_key(&anchor) {
            return Err(RegionTableError::MissingAnchor(anchor));
        }

        Ok(Self { endpoints, anchor })
    }

    /// Parse a TOML document with a `[regions]` table.
    pub fn from_toml_str(raw: &str, anchor: &str) -> Result<Self, RegionTableError> {
        let file: RegionFile = toml::from_str(raw)?;
        Self::new(file.regions, anchor)
    }

    /// Read and parse the region file at `path`.
    pub fn load(path: impl AsRef<Path>, anchor: &str) -> Result<Self, RegionTableError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| RegionTableError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw, anchor)
    }

    /// Endpoint for an already-normalized region code.
    pub fn endpoint(&self, region: &str) -> Option<&str> {
        self.endpoints.get(region).map(String::as_str)
    }

    pub fn anchor(&self) -> &str {
        &self.anchor
    }

    pub fn anchor_endpoint(&self) -> &str {
        // presence checked in `new`
        self.endpoints
            .get(&self.anchor)
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }
}

/// Lower-case a region code and replace `_` with `-`.
pub fn normalize_region(raw: &str) -> String {
    raw.trim().to_lowercase().replace('_', "-")
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [regions]
        "us-east-1" = "https://s3.wasabisys.com"
        "EU_WEST_1" = "https://s3.eu-west-1.wasabisys.com"
    "#;

    #[test]
    fn parses_and_normalizes_codes() {
        let table = RegionTable::from_toml_str(SAMPLE, "us-east-1").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.endpoint("eu-west-1"),
            Some("https://s3.eu-west-1.wasabisys.com")
        );
        assert_eq!(table.anchor_endpoint(), "https://s3.wasabisys.com");
    }

    #[test]
    fn unknown_anchor_is_rejected() {
        assert!(matches!(
            RegionTable::from_toml_str(SAMPLE, "ap-south-9"),
            Err(RegionTableError::MissingAnchor(region)) if region == "ap-south-9"
        ));
    }

    #[test]
    fn empty_table_is_rejected() {
        assert!(matches!(
            RegionTable::from_toml_str("[regions]\n", "us-east-1"),
            Err(RegionTableError::Empty)
        ));
    }

    #[test]
    fn shipped_table_loads() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/regions.toml");
        let table = RegionTable::load(path, "us-east-1").unwrap();
        assert_eq!(table.len(), 15);
        assert_eq!(table.endpoint("eu-central-2"), Some("https://s3.eu-central-2.wasabisys.com"));
    }

    #[test]
    fn normalize_lowercases_and_hyphenates() {
        assert_eq!(normalize_region("EU_Central_1"), "eu-central-1");
        assert_eq!(normalize_region("us-west-1"), "us-west-1");
    }
}
