// Dataset
// In-memory array payload passed between pipeline steps

use crate::chunking::ChunkDimension;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// A named dimension of a dataset variable
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimension {
    pub name: String,
    pub len: usize,
}

impl Dimension {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            len,
        }
    }
}

impl From<&Dimension> for ChunkDimension {
    fn from(dim: &Dimension) -> Self {
        ChunkDimension {
            name: dim.name.clone(),
            len: dim.len,
        }
    }
}

/// A single variable with its dimensions, values and attributes
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Dataset {
    /// Variable name
    pub variable: String,
    /// Ordered dimensions
    pub dims: Vec<Dimension>,
    /// Bytes per element in the archival encoding
    pub element_size: usize,
    /// Flattened values in row-major order
    pub values: Vec<f64>,
    /// Variable and global attributes
    pub attrs: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new(variable: impl Into<String>) -> Self {
        Self {
            variable: variable.into(),
            element_size: std::mem::size_of::<f64>(),
            ..Default::default()
        }
    }

    pub fn with_dims<S: Into<String>>(mut self, dims: impl IntoIterator<Item = (S, usize)>) -> Self {
        self.dims = dims
            .into_iter()
            .map(|(name, len)| Dimension::new(name, len))
            .collect();
        self
    }

    pub fn with_values(mut self, values: Vec<f64>) -> Self {
        self.values = values;
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Number of elements implied by the dimensions
    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|d| d.len).product()
    }

    pub fn chunk_dimensions(&self) -> Vec<ChunkDimension> {
        self.dims.iter().map(ChunkDimension::from).collect()
    }

    /// Content hash of the dataset, stable across runs
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.variable.as_bytes());
        for dim in &self.dims {
            hasher.update(dim.name.as_bytes());
            hasher.update((dim.len as u64).to_le_bytes());
        }
        hasher.update((self.element_size as u64).to_le_bytes());
        for value in &self.values {
            hasher.update(value.to_bits().to_le_bytes());
        }
        for (key, value) in &self.attrs {
            hasher.update(key.as_bytes());
            hasher.update([0]);
            hasher.update(value.as_bytes());
            hasher.update([0]);
        }
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Dataset::new("tas")
            .with_dims([("time", 2), ("lat", 1)])
            .with_values(vec![280.0, 281.5])
            .with_attr("units", "K");
        let b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_tracks_content() {
        let a = Dataset::new("tas").with_values(vec![1.0]);
        let b = Dataset::new("tas").with_values(vec![2.0]);
        let c = Dataset::new("tas").with_values(vec![1.0]).with_attr("units", "K");
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_element_count() {
        let ds = Dataset::new("pr").with_dims([("time", 12), ("lat", 4), ("lon", 8)]);
        assert_eq!(ds.element_count(), 384);
        assert_eq!(ds.element_size, 8);
        assert_eq!(ds.chunk_dimensions()[0].name, "time");
    }
}
