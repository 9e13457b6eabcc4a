//! Parameter maps and their deterministic cache fingerprints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::table::Value;

/// Arguments bound to a feature function, kept sorted by name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(BTreeMap<String, Value>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// SHA-256 over the canonical JSON of the key-sorted map, hex encoded.
///
/// Values are type tagged, so `1`, `1.0` and `"1"` fingerprint differently.
pub fn fingerprint(params: &Params) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"params:");
    for (key, value) in params.iter() {
        hasher.update(canonical_entry(key, value).as_bytes());
        hasher.update(b";");
    }
    hex::encode(hasher.finalize())
}

fn canonical_entry(key: &str, value: &Value) -> String {
    // serde_json cannot fail on string keys and tagged scalars (non-finite
    // floats are written as strings); fall back to the debug form so hashing
    // stays total.
    let key = serde_json::to_string(key).unwrap_or_else(|_| format!("{key:?}"));
    let value = serde_json::to_string(value).unwrap_or_else(|_| format!("{value:?}"));
    format!("{key}={value}")
}
