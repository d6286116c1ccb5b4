//! Request fingerprints and normalized parameter sets.
//!
//! A [`Fingerprint`] identifies a logical request: the same endpoint and
//! the same parameters always hash to the same value, regardless of the
//! order parameters were added in or how their values were spelled at the
//! call site (`6014` and `"6014"` are the same value). The hash is a
//! SHA-256 over a canonical JSON encoding, so it is stable across
//! processes and can be used directly as an on-disk key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Normalized request parameters.
///
/// Keys are kept sorted and values are stored in their canonical string
/// form. Blank keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, String>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing any previous value for the key.
    pub fn insert(&mut self, key: impl AsRef<str>, value: impl fmt::Display) {
        let key = key.as_ref().trim();
        if key.is_empty() {
            return;
        }
        self.0
            .insert(key.to_string(), value.to_string().trim().to_string());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, key: impl AsRef<str>, value: impl fmt::Display) -> Self {
        self.insert(key, value);
        self
    }

    /// Set a parameter only when a value is present.
    pub fn with_opt<V: fmt::Display>(mut self, key: impl AsRef<str>, value: Option<V>) -> Self {
        if let Some(value) = value {
            self.insert(key, value);
        }
        self
    }

    /// Set a list parameter, joined with commas as the provider expects.
    pub fn with_list<I, V>(mut self, key: impl AsRef<str>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        let joined = values
            .into_iter()
            .map(|v| v.to_string().trim().to_string())
            .collect::<Vec<_>>()
            .join(",");
        self.insert(key, joined);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in canonical (sorted) order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: AsRef<str>, V: fmt::Display> FromIterator<(K, V)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut params = Params::new();
        for (k, v) in iter {
            params.insert(k, v);
        }
        params
    }
}

/// Deterministic identifier of an (endpoint, params) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Compute the fingerprint of a request.
    pub fn compute(endpoint: &str, params: &Params) -> Self {
        let canonical = serde_json::json!([normalize_endpoint(endpoint), params]);
        let digest = Sha256::digest(canonical.to_string().as_bytes());
        Self(hex::encode(digest))
    }

    /// Wrap an existing hex digest, e.g. a cache file stem.
    ///
    /// Returns `None` unless the value looks like a SHA-256 hex digest.
    pub fn from_hex(value: &str) -> Option<Self> {
        let valid = value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for log lines. Shorter values are returned
    /// whole.
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Strip surrounding slashes and whitespace: `/ios/ranking/` → `ios/ranking`.
pub fn normalize_endpoint(endpoint: &str) -> &str {
    endpoint.trim().trim_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_tolerates_truncated_values() {
        let truncated: Fingerprint = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(truncated.short(), "abc");
        let empty: Fingerprint = serde_json::from_str("\"\"").unwrap();
        assert_eq!(empty.short(), "");

        let full = Fingerprint::compute("ios/apps", &Params::new());
        assert_eq!(full.short(), &full.as_str()[..8]);
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let a = Params::new().with("category", 6014).with("country", "US");
        let b = Params::new().with("country", "US").with("category", 6014);
        assert_eq!(
            Fingerprint::compute("ios/ranking", &a),
            Fingerprint::compute("ios/ranking", &b)
        );
    }

    #[test]
    fn numeric_and_string_values_are_equivalent() {
        let a = Params::new().with("category", 6014);
        let b = Params::new().with("category", "6014");
        let c = Params::new().with("category", " 6014 ");
        let fa = Fingerprint::compute("top_apps", &a);
        assert_eq!(fa, Fingerprint::compute("top_apps", &b));
        assert_eq!(fa, Fingerprint::compute("top_apps", &c));
    }

    #[test]
    fn endpoint_slashes_are_ignored() {
        let p = Params::new().with("app_ids", "1,2");
        assert_eq!(
            Fingerprint::compute("/ios/apps/", &p),
            Fingerprint::compute("ios/apps", &p)
        );
    }

    #[test]
    fn different_endpoints_differ() {
        let p = Params::new().with("app_ids", "1");
        assert_ne!(
            Fingerprint::compute("ios/apps", &p),
            Fingerprint::compute("android/apps", &p)
        );
    }

    #[test]
    fn different_values_differ() {
        let a = Params::new().with("country", "US");
        let b = Params::new().with("country", "GB");
        assert_ne!(
            Fingerprint::compute("ios/ranking", &a),
            Fingerprint::compute("ios/ranking", &b)
        );
    }

    #[test]
    fn key_value_boundaries_are_unambiguous() {
        let a = Params::new().with("ab", "c");
        let b = Params::new().with("a", "bc");
        assert_ne!(Fingerprint::compute("x", &a), Fingerprint::compute("x", &b));
    }

    #[test]
    fn list_values_are_comma_joined() {
        let p = Params::new().with_list("app_ids", [284882215, 310633997]);
        assert_eq!(p.get("app_ids"), Some("284882215,310633997"));
    }

    #[test]
    fn absent_optional_is_skipped() {
        let p = Params::new().with_opt::<&str>("country", None);
        assert!(p.is_empty());
    }

    #[test]
    fn blank_keys_are_ignored() {
        let p = Params::new().with("  ", "x");
        assert!(p.is_empty());
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        let f = Fingerprint::compute("ios/ranking", &Params::new());
        assert_eq!(f.as_str().len(), 64);
        assert_eq!(Fingerprint::from_hex(f.as_str()), Some(f.clone()));
        assert_eq!(f.short().len(), 8);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(Fingerprint::from_hex("not-a-digest").is_none());
        assert!(Fingerprint::from_hex(&"z".repeat(64)).is_none());
    }

    #[test]
    fn collected_params_match_built_params() {
        let collected: Params = [("b", "2"), ("a", "1")].into_iter().collect();
        let built = Params::new().with("a", 1).with("b", 2);
        assert_eq!(collected, built);
    }
}
