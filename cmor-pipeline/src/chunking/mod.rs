// Chunk-Shape Selection
// Chooses per-dimension chunk lengths for the archival write under a byte budget

pub mod even_divisor;
pub mod iterative;
pub mod simple;

pub use even_divisor::{even_divisor_chunks, even_divisors};
pub use iterative::iterative_chunks;
pub use simple::simple_chunks;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Dimension names treated as the sequential (time) axis
pub const SEQUENTIAL_DIMENSION_NAMES: &[&str] = &["time", "t", "Time"];

/// Default chunk byte budget (100MB)
pub const DEFAULT_CHUNK_BUDGET: u64 = 100_000_000;

/// Default size tolerance fraction
pub const DEFAULT_TOLERANCE: f64 = 0.5;

/// Default compression level for the archival encoding
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 4;

/// Errors that can occur while selecting a chunk layout
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChunkingError {
    #[error(
        "no chunk shape fits the {budget} byte budget within tolerance {tolerance}; \
         retry with a larger tolerance"
    )]
    NoMatchingChunks { budget: u64, tolerance: f64 },

    #[error("invalid chunk request: {0}")]
    InvalidRequest(String),

    #[error("invalid byte size '{0}'")]
    InvalidByteSize(String),

    #[error("unknown chunking algorithm '{0}'")]
    UnknownAlgorithm(String),
}

/// Layout selection algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkAlgorithm {
    #[default]
    Simple,
    EvenDivisor,
    Iterative,
}

impl fmt::Display for ChunkAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkAlgorithm::Simple => f.write_str("simple"),
            ChunkAlgorithm::EvenDivisor => f.write_str("even_divisor"),
            ChunkAlgorithm::Iterative => f.write_str("iterative"),
        }
    }
}

impl FromStr for ChunkAlgorithm {
    type Err = ChunkingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(ChunkAlgorithm::Simple),
            "even_divisor" | "even-divisor" => Ok(ChunkAlgorithm::EvenDivisor),
            "iterative" => Ok(ChunkAlgorithm::Iterative),
            _ => Err(ChunkingError::UnknownAlgorithm(s.to_string())),
        }
    }
}

/// A named dimension of the array being laid out
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDimension {
    pub name: String,
    pub len: usize,
}

/// Input to the chunk-shape selector
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRequest {
    /// Ordered dimensions of the array
    pub dims: Vec<ChunkDimension>,
    /// Bytes per array element
    pub element_size: usize,
    /// Target bytes per chunk
    pub budget: u64,
    /// Accepted relative deviation from the budget
    pub tolerance: f64,
    /// Prefer chunking along the sequential dimension
    pub prefer_sequential: bool,
}

impl ChunkRequest {
    pub fn new<S: Into<String>>(
        dims: impl IntoIterator<Item = (S, usize)>,
        element_size: usize,
        budget: u64,
    ) -> Self {
        Self {
            dims: dims
                .into_iter()
                .map(|(name, len)| ChunkDimension {
                    name: name.into(),
                    len,
                })
                .collect(),
            element_size,
            budget,
            tolerance: DEFAULT_TOLERANCE,
            prefer_sequential: true,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn prefer_sequential(mut self, prefer: bool) -> Self {
        self.prefer_sequential = prefer;
        self
    }

    /// Index of the first dimension named like a time axis
    pub fn sequential_dim(&self) -> Option<usize> {
        self.dims
            .iter()
            .position(|d| SEQUENTIAL_DIMENSION_NAMES.contains(&d.name.as_str()))
    }

    /// The sequential dimension, only if the request prefers chunking along it
    pub(crate) fn preferred_sequential_dim(&self) -> Option<usize> {
        if self.prefer_sequential {
            self.sequential_dim()
        } else {
            None
        }
    }

    pub fn lengths(&self) -> Vec<usize> {
        self.dims.iter().map(|d| d.len).collect()
    }

    /// Total bytes of one chunk of the given shape
    pub fn chunk_bytes(&self, shape: &[usize]) -> u128 {
        shape.iter().map(|&c| c as u128).product::<u128>() * self.element_size as u128
    }

    pub(crate) fn lower_bound(&self) -> f64 {
        self.budget as f64 * (1.0 - self.tolerance)
    }

    pub(crate) fn upper_bound(&self) -> f64 {
        self.budget as f64 * (1.0 + self.tolerance)
    }

    pub(crate) fn no_match(&self) -> ChunkingError {
        ChunkingError::NoMatchingChunks {
            budget: self.budget,
            tolerance: self.tolerance,
        }
    }

    fn validate(&self) -> Result<(), ChunkingError> {
        if self.element_size == 0 {
            return Err(ChunkingError::InvalidRequest(
                "element size must be positive".to_string(),
            ));
        }
        if self.budget == 0 {
            return Err(ChunkingError::InvalidRequest(
                "chunk budget must be positive".to_string(),
            ));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(ChunkingError::InvalidRequest(format!(
                "tolerance must be a non-negative fraction, got {}",
                self.tolerance
            )));
        }
        if let Some(dim) = self.dims.iter().find(|d| d.len == 0) {
            return Err(ChunkingError::InvalidRequest(format!(
                "dimension '{}' has zero length",
                dim.name
            )));
        }
        Ok(())
    }
}

/// Compute a chunk shape for the request using the chosen algorithm.
///
/// The returned shape has one entry per dimension, each in `[1, len]`.
pub fn select_chunk_shape(
    request: &ChunkRequest,
    algorithm: ChunkAlgorithm,
) -> Result<Vec<usize>, ChunkingError> {
    request.validate()?;
    if request.dims.is_empty() {
        return Ok(Vec::new());
    }

    let shape = match algorithm {
        ChunkAlgorithm::Simple => simple_chunks(request),
        ChunkAlgorithm::EvenDivisor => even_divisor_chunks(request)?,
        ChunkAlgorithm::Iterative => iterative_chunks(request)?,
    };

    tracing::debug!(
        algorithm = %algorithm,
        ?shape,
        bytes = %request.chunk_bytes(&shape),
        budget = request.budget,
        "selected chunk shape"
    );

    Ok(shape)
}

/// Parse a byte size such as `"100MB"`, `"1.5GiB"` or `"4096"`.
///
/// Decimal units (kB, MB, GB, TB, PB) are powers of 1000, binary units
/// (KiB, MiB, GiB, TiB, PiB) powers of 1024. Units are case-insensitive.
pub fn parse_byte_size(input: &str) -> Result<u64, ChunkingError> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = if number.is_empty() {
        1.0
    } else {
        number
            .parse()
            .map_err(|_| ChunkingError::InvalidByteSize(input.to_string()))?
    };

    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" => 1.0,
        "k" | "kb" => 1e3,
        "m" | "mb" => 1e6,
        "g" | "gb" => 1e9,
        "t" | "tb" => 1e12,
        "p" | "pb" => 1e15,
        "ki" | "kib" => 1024.0,
        "mi" | "mib" => 1024f64.powi(2),
        "gi" | "gib" => 1024f64.powi(3),
        "ti" | "tib" => 1024f64.powi(4),
        "pi" | "pib" => 1024f64.powi(5),
        _ => return Err(ChunkingError::InvalidByteSize(input.to_string())),
    };

    let bytes = value * multiplier;
    if !bytes.is_finite() || bytes < 0.0 || trimmed.is_empty() {
        return Err(ChunkingError::InvalidByteSize(input.to_string()));
    }
    Ok(bytes as u64)
}

/// Chunk layout and compression used by the terminal write step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEncoding {
    /// Dimension names, in array order
    pub dims: Vec<String>,
    /// Chunk length per dimension
    pub chunk_shape: Vec<usize>,
    /// Compression level, or `None` when compression is disabled
    pub compression_level: Option<u8>,
}

/// Per-target chunking configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkingSettings {
    pub algorithm: ChunkAlgorithm,
    pub budget: u64,
    pub tolerance: f64,
    pub prefer_sequential: bool,
    pub compression_level: u8,
    pub enable_compression: bool,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            algorithm: ChunkAlgorithm::Simple,
            budget: DEFAULT_CHUNK_BUDGET,
            tolerance: DEFAULT_TOLERANCE,
            prefer_sequential: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            enable_compression: true,
        }
    }
}

/// Attribute names read by [`ChunkingSettings::from_attributes`]
pub const CHUNKING_ATTRIBUTES: &[&str] = &[
    "chunk_algorithm",
    "chunk_size",
    "chunk_tolerance",
    "chunk_prefer_time",
    "compression_level",
    "enable_compression",
];

impl ChunkingSettings {
    /// Read chunking settings from resolved target attributes, falling back to defaults
    pub fn from_attributes(attributes: &BTreeMap<String, String>) -> Result<Self, ChunkingError> {
        let mut settings = Self::default();

        if let Some(algorithm) = attributes.get("chunk_algorithm") {
            settings.algorithm = algorithm.parse()?;
        }
        if let Some(size) = attributes.get("chunk_size") {
            settings.budget = parse_byte_size(size)?;
        }
        if let Some(tolerance) = attributes.get("chunk_tolerance") {
            settings.tolerance = tolerance.trim().parse().map_err(|_| {
                ChunkingError::InvalidRequest(format!("invalid chunk_tolerance '{}'", tolerance))
            })?;
        }
        if let Some(prefer) = attributes.get("chunk_prefer_time") {
            settings.prefer_sequential = parse_flag("chunk_prefer_time", prefer)?;
        }
        if let Some(enabled) = attributes.get("enable_compression") {
            settings.enable_compression = parse_flag("enable_compression", enabled)?;
        }
        if let Some(level) = attributes.get("compression_level") {
            settings.compression_level = level
                .trim()
                .parse::<u8>()
                .ok()
                .filter(|l| (1..=9).contains(l))
                .ok_or_else(|| {
                    ChunkingError::InvalidRequest(format!(
                        "compression_level must be between 1 and 9, got '{}'",
                        level
                    ))
                })?;
        }

        Ok(settings)
    }

    /// Build the selector request for an array with these dimensions
    pub fn request(&self, dims: &[ChunkDimension], element_size: usize) -> ChunkRequest {
        ChunkRequest {
            dims: dims.to_vec(),
            element_size,
            budget: self.budget,
            tolerance: self.tolerance,
            prefer_sequential: self.prefer_sequential,
        }
    }

    /// Select a chunk shape and combine it with the compression setting
    pub fn encoding(
        &self,
        dims: &[ChunkDimension],
        element_size: usize,
    ) -> Result<ChunkEncoding, ChunkingError> {
        let request = self.request(dims, element_size);
        let chunk_shape = select_chunk_shape(&request, self.algorithm)?;
        Ok(ChunkEncoding {
            dims: dims.iter().map(|d| d.name.clone()).collect(),
            chunk_shape,
            compression_level: self.enable_compression.then_some(self.compression_level),
        })
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ChunkingError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" | "on" => Ok(true),
        "no" | "false" | "0" | "off" => Ok(false),
        _ => Err(ChunkingError::InvalidRequest(format!(
            "invalid boolean for {}: '{}'",
            name, value
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn climate_request(budget: u64) -> ChunkRequest {
        ChunkRequest::new([("time", 120), ("lat", 180), ("lon", 360)], 4, budget)
    }

    #[test]
    fn test_parse_byte_size() {
        assert_eq!(parse_byte_size("100MB").unwrap(), 100_000_000);
        assert_eq!(parse_byte_size("100 mb").unwrap(), 100_000_000);
        assert_eq!(parse_byte_size("1.5GiB").unwrap(), 1_610_612_736);
        assert_eq!(parse_byte_size("4096").unwrap(), 4096);
        assert_eq!(parse_byte_size("2kB").unwrap(), 2000);
        assert_eq!(parse_byte_size("MB").unwrap(), 1_000_000);
    }

    #[test]
    fn test_parse_byte_size_rejects_garbage() {
        assert!(parse_byte_size("").is_err());
        assert!(parse_byte_size("12 parsecs").is_err());
        assert!(parse_byte_size("1.2.3MB").is_err());
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("simple".parse::<ChunkAlgorithm>().unwrap(), ChunkAlgorithm::Simple);
        assert_eq!(
            "even_divisor".parse::<ChunkAlgorithm>().unwrap(),
            ChunkAlgorithm::EvenDivisor
        );
        assert_eq!(
            "Iterative".parse::<ChunkAlgorithm>().unwrap(),
            ChunkAlgorithm::Iterative
        );
        assert!("random".parse::<ChunkAlgorithm>().is_err());
    }

    #[test]
    fn test_sequential_dimension_detection() {
        let request = ChunkRequest::new([("lat", 10), ("Time", 4)], 8, 1000);
        assert_eq!(request.sequential_dim(), Some(1));

        let request = ChunkRequest::new([("lat", 10), ("lon", 4)], 8, 1000);
        assert_eq!(request.sequential_dim(), None);
    }

    #[test]
    fn test_every_algorithm_respects_shape_bounds() {
        for algorithm in [
            ChunkAlgorithm::Simple,
            ChunkAlgorithm::EvenDivisor,
            ChunkAlgorithm::Iterative,
        ] {
            let request = climate_request(10_000_000);
            let shape = select_chunk_shape(&request, algorithm).unwrap();
            assert_eq!(shape.len(), 3, "{algorithm}");
            for (chunk, len) in shape.iter().zip(request.lengths()) {
                assert!(*chunk >= 1 && *chunk <= len, "{algorithm}: {shape:?}");
            }
        }
    }

    #[test]
    fn test_selection_is_deterministic() {
        let request = climate_request(10_000_000);
        for algorithm in [
            ChunkAlgorithm::Simple,
            ChunkAlgorithm::EvenDivisor,
            ChunkAlgorithm::Iterative,
        ] {
            let first = select_chunk_shape(&request, algorithm).unwrap();
            let second = select_chunk_shape(&request, algorithm).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn test_invalid_requests() {
        let request = ChunkRequest::new([("time", 0)], 4, 100);
        assert!(matches!(
            select_chunk_shape(&request, ChunkAlgorithm::Simple),
            Err(ChunkingError::InvalidRequest(_))
        ));

        let request = ChunkRequest::new([("time", 10)], 0, 100);
        assert!(select_chunk_shape(&request, ChunkAlgorithm::Simple).is_err());

        let request = ChunkRequest::new([("time", 10)], 4, 100).with_tolerance(-0.1);
        assert!(select_chunk_shape(&request, ChunkAlgorithm::Iterative).is_err());
    }

    #[test]
    fn test_scalar_array_has_empty_shape() {
        let request = ChunkRequest::new(Vec::<(String, usize)>::new(), 8, 100);
        assert!(select_chunk_shape(&request, ChunkAlgorithm::EvenDivisor)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_settings_from_attributes() {
        let mut attributes = BTreeMap::new();
        attributes.insert("chunk_algorithm".to_string(), "even_divisor".to_string());
        attributes.insert("chunk_size".to_string(), "50MB".to_string());
        attributes.insert("chunk_tolerance".to_string(), "0.25".to_string());
        attributes.insert("chunk_prefer_time".to_string(), "no".to_string());
        attributes.insert("compression_level".to_string(), "6".to_string());

        let settings = ChunkingSettings::from_attributes(&attributes).unwrap();
        assert_eq!(settings.algorithm, ChunkAlgorithm::EvenDivisor);
        assert_eq!(settings.budget, 50_000_000);
        assert_eq!(settings.tolerance, 0.25);
        assert!(!settings.prefer_sequential);
        assert_eq!(settings.compression_level, 6);
        assert!(settings.enable_compression);
    }

    #[test]
    fn test_settings_reject_bad_compression_level() {
        let mut attributes = BTreeMap::new();
        attributes.insert("compression_level".to_string(), "12".to_string());
        assert!(ChunkingSettings::from_attributes(&attributes).is_err());
    }

    #[test]
    fn test_encoding_without_compression() {
        let settings = ChunkingSettings {
            enable_compression: false,
            ..Default::default()
        };
        let dims = vec![
            ChunkDimension {
                name: "time".to_string(),
                len: 12,
            },
            ChunkDimension {
                name: "lat".to_string(),
                len: 2,
            },
        ];
        let encoding = settings.encoding(&dims, 8).unwrap();
        assert_eq!(encoding.dims, vec!["time".to_string(), "lat".to_string()]);
        assert_eq!(encoding.chunk_shape, vec![12, 2]);
        assert_eq!(encoding.compression_level, None);
    }
}
