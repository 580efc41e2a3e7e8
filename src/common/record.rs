//! Record model shared by the store, group commit and placement
//!
//! A record holds three categories of string-keyed fields (simple, list and
//! map). A key lives in at most one category at a time: every setter and every
//! merge evicts the key from the other two.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Store-assigned version of a record. Strictly increasing per path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u64);

impl Version {
    pub fn new(v: u64) -> Self {
        Self(v)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Structured document stored at a path
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    id: String,
    #[serde(default)]
    simple_fields: BTreeMap<String, String>,
    #[serde(default)]
    list_fields: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    map_fields: BTreeMap<String, BTreeMap<String, String>>,
    /// List keys this (partial) record appends to instead of replacing.
    /// Never persisted.
    #[serde(skip)]
    append_lists: BTreeSet<String>,
}

/// A record together with the version it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub record: Record,
    pub version: Version,
}

impl Record {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // === Simple fields ===

    pub fn set_simple_field(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.evict(&key);
        self.simple_fields.insert(key, value.into());
    }

    pub fn simple_field(&self, key: &str) -> Option<&str> {
        self.simple_fields.get(key).map(String::as_str)
    }

    pub fn simple_fields(&self) -> &BTreeMap<String, String> {
        &self.simple_fields
    }

    // === List fields ===

    /// Set a list field; on merge it replaces whatever list is already there.
    pub fn set_list_field(&mut self, key: impl Into<String>, values: Vec<String>) {
        let key = key.into();
        self.evict(&key);
        self.list_fields.insert(key, values);
    }

    /// Set a list field that is concatenated onto the existing list on merge.
    pub fn append_list_field(&mut self, key: impl Into<String>, values: Vec<String>) {
        let key = key.into();
        self.evict(&key);
        self.list_fields.insert(key.clone(), values);
        self.append_lists.insert(key);
    }

    pub fn list_field(&self, key: &str) -> Option<&[String]> {
        self.list_fields.get(key).map(Vec::as_slice)
    }

    pub fn list_fields(&self) -> &BTreeMap<String, Vec<String>> {
        &self.list_fields
    }

    pub fn is_append(&self, key: &str) -> bool {
        self.append_lists.contains(key)
    }

    // === Map fields ===

    pub fn set_map_field(&mut self, key: impl Into<String>, entries: BTreeMap<String, String>) {
        let key = key.into();
        self.evict(&key);
        self.map_fields.insert(key, entries);
    }

    /// Set one inner entry of a map field, creating the map if needed.
    pub fn set_map_entry(
        &mut self,
        key: impl Into<String>,
        inner_key: impl Into<String>,
        value: impl Into<String>,
    ) {
        let key = key.into();
        if !self.map_fields.contains_key(&key) {
            self.evict(&key);
        }
        self.map_fields
            .entry(key)
            .or_default()
            .insert(inner_key.into(), value.into());
    }

    pub fn map_field(&self, key: &str) -> Option<&BTreeMap<String, String>> {
        self.map_fields.get(key)
    }

    pub fn map_fields(&self) -> &BTreeMap<String, BTreeMap<String, String>> {
        &self.map_fields
    }

    // === Whole record ===

    pub fn contains_key(&self, key: &str) -> bool {
        self.simple_fields.contains_key(key)
            || self.list_fields.contains_key(key)
            || self.map_fields.contains_key(key)
    }

    /// Remove a key from whichever category holds it.
    pub fn remove_field(&mut self, key: &str) -> bool {
        self.append_lists.remove(key);
        self.evict(key)
    }

    pub fn field_count(&self) -> usize {
        self.simple_fields.len() + self.list_fields.len() + self.map_fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.field_count() == 0
    }

    /// Drop append marks before the record is persisted.
    pub fn clear_marks(&mut self) {
        self.append_lists.clear();
    }

    /// Apply `delta` on top of this record.
    ///
    /// Simple fields: `delta` wins. List fields: `delta` replaces the list,
    /// unless it marks the key as append, in which case the lists are
    /// concatenated. Map fields: merged per inner key, `delta` wins per inner
    /// key. Marks compose so that merging a batch first and applying it once
    /// gives the same list contents as applying each delta in turn.
    pub fn merge(&mut self, delta: Record) {
        let Record {
            id,
            simple_fields,
            list_fields,
            map_fields,
            append_lists,
        } = delta;

        if self.id.is_empty() {
            self.id = id;
        }

        for (key, value) in simple_fields {
            self.list_fields.remove(&key);
            self.map_fields.remove(&key);
            self.append_lists.remove(&key);
            self.simple_fields.insert(key, value);
        }

        for (key, values) in list_fields {
            // A key that changes category starts from scratch.
            let displaced =
                self.simple_fields.remove(&key).is_some() | self.map_fields.remove(&key).is_some();
            let appending = append_lists.contains(&key) && !displaced;

            match self.list_fields.get_mut(&key) {
                Some(existing) if appending => existing.extend(values),
                _ => {
                    if appending {
                        self.append_lists.insert(key.clone());
                    } else {
                        self.append_lists.remove(&key);
                    }
                    self.list_fields.insert(key, values);
                }
            }
        }

        for (key, entries) in map_fields {
            self.simple_fields.remove(&key);
            if self.list_fields.remove(&key).is_some() {
                self.append_lists.remove(&key);
            }
            self.map_fields.entry(key).or_default().extend(entries);
        }
    }

    /// Consuming form of [`Record::merge`].
    pub fn merged(mut self, delta: Record) -> Record {
        self.merge(delta);
        self
    }

    fn evict(&mut self, key: &str) -> bool {
        let simple = self.simple_fields.remove(key).is_some();
        let list = self.list_fields.remove(key).is_some();
        let map = self.map_fields.remove(key).is_some();
        if list {
            self.append_lists.remove(key);
        }
        simple || list || map
    }
}

/// Merge a batch of partial records in order into a single partial record.
pub fn coalesce(batch: impl IntoIterator<Item = Record>) -> Record {
    let mut iter = batch.into_iter();
    let mut combined = iter.next().unwrap_or_default();
    for delta in iter {
        combined.merge(delta);
    }
    combined
}
