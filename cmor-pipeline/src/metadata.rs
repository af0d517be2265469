// Metadata Lookup
// Table-driven derivation of attributes from a compound identifier

use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use thiserror::Error;

/// Errors raised by a metadata lookup
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("no metadata entry for '{0}'")]
    NotFound(String),

    #[error("invalid metadata table: {0}")]
    InvalidTable(String),
}

/// Source of derived attributes for a compound identifier
pub trait MetadataLookup: Send + Sync {
    /// Attributes derived for `compound_name`, already named as target attributes
    fn lookup(&self, compound_name: &str) -> Result<BTreeMap<String, String>, LookupError>;
}

/// Table field names that map to a differently named target attribute
const FIELD_RENAMES: &[(&str, &str)] = &[
    ("cmip6_table", "table_id"),
    ("units", "cmor_unit"),
    ("modeling_realm", "realm"),
    ("out_name", "cmor_variable"),
];

#[derive(Debug, Deserialize)]
struct TableDocument {
    #[serde(rename = "Compound Name", default)]
    compound_names: HashMap<String, HashMap<String, serde_json::Value>>,
}

/// In-memory metadata table keyed by compound name
#[derive(Debug, Clone, Default)]
pub struct TableLookup {
    entries: HashMap<String, BTreeMap<String, String>>,
}

impl TableLookup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document with a top-level `"Compound Name"` object
    pub fn from_json_str(json: &str) -> Result<Self, LookupError> {
        let document: TableDocument =
            serde_json::from_str(json).map_err(|e| LookupError::InvalidTable(e.to_string()))?;

        let entries = document
            .compound_names
            .into_iter()
            .map(|(name, fields)| {
                let attributes = fields
                    .into_iter()
                    .filter_map(|(field, value)| {
                        let value = match value {
                            serde_json::Value::String(s) => s,
                            serde_json::Value::Null => return None,
                            other => other.to_string(),
                        };
                        if value.is_empty() {
                            return None;
                        }
                        Some((rename_field(&field).to_string(), value))
                    })
                    .collect();
                (name, attributes)
            })
            .collect();

        Ok(Self { entries })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LookupError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| LookupError::InvalidTable(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&content)
    }

    pub fn insert(&mut self, compound_name: impl Into<String>, attributes: BTreeMap<String, String>) {
        self.entries.insert(compound_name.into(), attributes);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MetadataLookup for TableLookup {
    fn lookup(&self, compound_name: &str) -> Result<BTreeMap<String, String>, LookupError> {
        self.entries
            .get(compound_name)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(compound_name.to_string()))
    }
}

fn rename_field(field: &str) -> &str {
    FIELD_RENAMES
        .iter()
        .find(|(from, _)| *from == field)
        .map(|(_, to)| *to)
        .unwrap_or(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE: &str = r#"{
        "Header": {"Description": "test"},
        "Compound Name": {
            "atmos.tas.tavg-h2m-hxy-u.mon.GLB": {
                "frequency": "mon",
                "modeling_realm": "atmos",
                "standard_name": "air_temperature",
                "units": "K",
                "positive": "",
                "cmip6_table": "Amon",
                "out_name": "tas"
            }
        }
    }"#;

    #[test]
    fn test_lookup_renames_fields() {
        let table = TableLookup::from_json_str(TABLE).unwrap();
        assert_eq!(table.len(), 1);

        let attrs = table.lookup("atmos.tas.tavg-h2m-hxy-u.mon.GLB").unwrap();
        assert_eq!(attrs.get("table_id").map(String::as_str), Some("Amon"));
        assert_eq!(attrs.get("cmor_unit").map(String::as_str), Some("K"));
        assert_eq!(attrs.get("realm").map(String::as_str), Some("atmos"));
        assert_eq!(attrs.get("frequency").map(String::as_str), Some("mon"));
        assert!(!attrs.contains_key("positive"));
    }

    #[test]
    fn test_lookup_not_found() {
        let table = TableLookup::from_json_str(TABLE).unwrap();
        assert_eq!(
            table.lookup("ocean.tos.tavg-u-hxy-sea.mon.GLB"),
            Err(LookupError::NotFound(
                "ocean.tos.tavg-u-hxy-sea.mon.GLB".to_string()
            ))
        );
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        std::fs::write(&path, TABLE).unwrap();
        assert_eq!(TableLookup::from_file(&path).unwrap().len(), 1);

        assert!(matches!(
            TableLookup::from_file(dir.path().join("missing.json")),
            Err(LookupError::InvalidTable(_))
        ));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            TableLookup::from_json_str("not json"),
            Err(LookupError::InvalidTable(_))
        ));
    }
}
