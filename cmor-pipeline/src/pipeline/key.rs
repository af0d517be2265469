// Cache Keys
// Content-derived identity of one step invocation

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Identity of a step invocation: step name, input fingerprint and the
/// values of the attributes the step declares relevant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key. Attribute pairs are sorted by name, so declaration order
    /// does not matter.
    pub fn derive<'a>(
        step_name: &str,
        input_fingerprint: &str,
        attributes: impl IntoIterator<Item = (&'a str, Option<&'a str>)>,
    ) -> Self {
        let mut attributes: Vec<(&str, Option<&str>)> = attributes.into_iter().collect();
        attributes.sort_unstable();
        attributes.dedup();

        let mut hasher = Sha256::new();
        hasher.update(step_name.as_bytes());
        hasher.update([0]);
        hasher.update(input_fingerprint.as_bytes());
        hasher.update([0]);
        for (name, value) in attributes {
            hasher.update(name.as_bytes());
            match value {
                Some(value) => {
                    hasher.update(b"=");
                    hasher.update(value.as_bytes());
                }
                None => hasher.update(b"!"),
            }
            hasher.update([0]);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wrap an existing digest
    pub fn from_digest(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self
            .0
            .char_indices()
            .nth(12)
            .map_or(self.0.len(), |(i, _)| i);
        f.write_str(&self.0[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_order_irrelevant() {
        let a = CacheKey::derive("s", "f", [("a", Some("1")), ("b", Some("2"))]);
        let b = CacheKey::derive("s", "f", [("b", Some("2")), ("a", Some("1"))]);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_every_component_changes_key() {
        let base = CacheKey::derive("s", "f", [("a", Some("1"))]);
        assert_ne!(base, CacheKey::derive("t", "f", [("a", Some("1"))]));
        assert_ne!(base, CacheKey::derive("s", "g", [("a", Some("1"))]));
        assert_ne!(base, CacheKey::derive("s", "f", [("a", Some("2"))]));
        assert_ne!(base, CacheKey::derive("s", "f", [("a", None)]));
        assert_ne!(
            CacheKey::derive("s", "f", [("a", Some(""))]),
            CacheKey::derive("s", "f", [("a", None)])
        );
    }

    #[test]
    fn test_display_is_short() {
        let key = CacheKey::derive("s", "f", Vec::<(&str, Option<&str>)>::new());
        assert_eq!(key.to_string().len(), 12);
        assert_eq!(CacheKey::from_digest("abc").to_string(), "abc");
    }
}
