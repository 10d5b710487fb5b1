//! Goal sets - key/value descriptions of a desired end-state
//!
//! Used for de-duplication and idempotence checks: two pieces of work with
//! structurally equal goal sets are the same work.

use std::collections::btree_map;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered key/value map describing the end-state an operation works toward
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Goals(BTreeMap<String, Value>);

impl Goals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a goal
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, Value> {
        self.0.iter()
    }

    /// Structural equality: the same keys mapped to the same values
    pub fn matches(&self, other: &Goals) -> bool {
        self == other
    }
}

impl From<BTreeMap<String, Value>> for Goals {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for Goals {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
