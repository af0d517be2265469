// Compound Identifier
// Parsing of `realm.variable.branding.frequency.region` names into derived attributes

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of dot-separated components in a compound name
pub const COMPOUND_COMPONENTS: usize = 5;

/// Malformed compound name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompoundNameError {
    #[error(
        "compound name '{name}' has {found} components, expected {} (realm.variable.branding.frequency.region)",
        COMPOUND_COMPONENTS
    )]
    WrongComponentCount { name: String, found: usize },

    #[error("compound name '{name}' has an empty component at position {position}")]
    EmptyComponent { name: String, position: usize },
}

/// Disagreement between a compound name's derivations and a target's effective attributes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DerivationConflict {
    /// A later layer replaced a value derived from the compound name
    Overridden {
        attribute: String,
        derived: String,
        effective: String,
    },
    /// The derived table id no longer matches the effective realm and frequency
    StaleTableId { table_id: String, expected: String },
}

impl fmt::Display for DerivationConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DerivationConflict::Overridden {
                attribute,
                derived,
                effective,
            } => write!(
                f,
                "'{}' is '{}' but the compound name derives '{}'",
                attribute, effective, derived
            ),
            DerivationConflict::StaleTableId { table_id, expected } => write!(
                f,
                "table_id '{}' disagrees with the effective realm and frequency ('{}')",
                table_id, expected
            ),
        }
    }
}

/// A parsed compound identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompoundName {
    pub realm: String,
    pub variable: String,
    pub branding: String,
    pub frequency: String,
    pub region: String,
}

impl FromStr for CompoundName {
    type Err = CompoundNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != COMPOUND_COMPONENTS {
            return Err(CompoundNameError::WrongComponentCount {
                name: s.to_string(),
                found: parts.len(),
            });
        }
        if let Some(i) = parts.iter().position(|p| p.trim().is_empty()) {
            return Err(CompoundNameError::EmptyComponent {
                name: s.to_string(),
                position: i + 1,
            });
        }

        Ok(Self {
            realm: parts[0].to_string(),
            variable: parts[1].to_string(),
            branding: parts[2].to_string(),
            frequency: parts[3].to_string(),
            region: parts[4].to_string(),
        })
    }
}

impl fmt::Display for CompoundName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.realm, self.variable, self.branding, self.frequency, self.region
        )
    }
}

impl CompoundName {
    /// Table identifier: realm letter followed by the frequency, e.g. `Amon`
    pub fn table_id(&self) -> String {
        table_id_for(&self.realm, &self.frequency)
    }

    /// Attributes derived from the compound name
    pub fn derived_attributes(&self) -> BTreeMap<String, String> {
        [
            ("realm", self.realm.clone()),
            ("cmor_variable", self.variable.clone()),
            ("branding", self.branding.clone()),
            ("frequency", self.frequency.clone()),
            ("region", self.region.clone()),
            ("table_id", self.table_id()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    /// Derived attributes whose effective value in `attributes` differs,
    /// plus a derived table id left stale by an overridden realm or frequency
    pub fn conflicts(&self, attributes: &BTreeMap<String, String>) -> Vec<DerivationConflict> {
        let mut conflicts: Vec<DerivationConflict> = self
            .derived_attributes()
            .into_iter()
            .filter_map(|(attribute, derived)| {
                let effective = attributes.get(&attribute)?;
                (*effective != derived).then(|| DerivationConflict::Overridden {
                    attribute,
                    derived,
                    effective: effective.clone(),
                })
            })
            .collect();

        let derived_table = self.table_id();
        if attributes.get("table_id") == Some(&derived_table) {
            let realm = attributes.get("realm").unwrap_or(&self.realm);
            let frequency = attributes.get("frequency").unwrap_or(&self.frequency);
            let expected = table_id_for(realm, frequency);
            if expected != derived_table {
                conflicts.push(DerivationConflict::StaleTableId {
                    table_id: derived_table,
                    expected,
                });
            }
        }
        conflicts
    }
}

/// Table identifier for a realm and frequency, e.g. `Amon`
pub fn table_id_for(realm: &str, frequency: &str) -> String {
    format!("{}{}", realm_letter(realm), frequency)
}

fn realm_letter(realm: &str) -> String {
    match realm {
        "atmos" | "atmosChem" | "aerosol" => "A".to_string(),
        "ocean" | "ocn" | "ocnBgchem" => "O".to_string(),
        "seaIce" => "SI".to_string(),
        "land" => "L".to_string(),
        "landIce" => "LI".to_string(),
        other => other
            .chars()
            .next()
            .map(|c| c.to_uppercase().to_string())
            .unwrap_or_default(),
    }
}
