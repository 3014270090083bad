// Device twin: desired properties owned by the service, reported properties
// owned by the device. This module is the only place that touches the wire form.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::TwinError;

pub const CODE_VERSION_KEY: &str = "CodeVersion";
pub const FIRMWARE_KEY: &str = "Firmware";
pub const MESSAGE_KEY: &str = "Message";

const VERSION_FIELD: &str = "$version";
const METADATA_FIELD: &str = "$metadata";
const LAST_UPDATED_FIELD: &str = "$lastUpdated";

/// String keyed property bag with last-write-wins semantics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyMap {
    entries: Map<String, Value>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert if absent, else overwrite. Returns whether the stored value changed.
    pub fn set_or_insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> bool {
        let key = key.into();
        let value = value.into();
        if self.entries.get(&key) == Some(&value) {
            return false;
        }
        self.entries.insert(key, value);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.entries.iter()
    }

    /// Merge a partial update. `null` deletes a key, nested objects merge
    /// recursively. Returns the top level keys whose value changed.
    fn merge(&mut self, patch: &Map<String, Value>) -> BTreeSet<String> {
        let mut changed = BTreeSet::new();
        for (key, incoming) in patch.iter().filter(|(k, _)| !k.starts_with('$')) {
            let before = self.entries.get(key).cloned();
            match incoming {
                Value::Null => {
                    self.entries.remove(key);
                }
                Value::Object(fields) => match self.entries.get_mut(key) {
                    Some(Value::Object(existing)) => merge_object(existing, fields),
                    _ => {
                        let mut fresh = Map::new();
                        merge_object(&mut fresh, fields);
                        self.entries.insert(key.clone(), Value::Object(fresh));
                    }
                },
                other => {
                    self.entries.insert(key.clone(), other.clone());
                }
            }
            if self.entries.get(key) != before.as_ref() {
                changed.insert(key.clone());
            }
        }
        changed
    }

    fn from_wire(section: &Map<String, Value>) -> Self {
        let entries = section
            .iter()
            .filter(|(k, _)| !k.starts_with('$'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self { entries }
    }

    fn to_wire(&self) -> Value {
        Value::Object(self.entries.clone())
    }
}

fn merge_object(target: &mut Map<String, Value>, patch: &Map<String, Value>) {
    for (key, incoming) in patch {
        match incoming {
            Value::Null => {
                target.remove(key);
            }
            Value::Object(fields) => match target.get_mut(key) {
                Some(Value::Object(existing)) => merge_object(existing, fields),
                _ => {
                    let mut fresh = Map::new();
                    merge_object(&mut fresh, fields);
                    target.insert(key.clone(), Value::Object(fresh));
                }
            },
            other => {
                target.insert(key.clone(), other.clone());
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinDocument {
    pub desired: PropertyMap,
    pub reported: PropertyMap,
    /// `$version` of the desired side
    pub version: i64,
    /// `$lastUpdated` per desired key
    pub metadata: BTreeMap<String, String>,
}

impl TwinDocument {
    /// Parse a full twin, either `{"properties":{"desired":..,"reported":..}}`
    /// or the bare `{"desired":..,"reported":..}` form.
    pub fn from_json(raw: &str) -> Result<Self, TwinError> {
        let value: Value = serde_json::from_str(raw)?;
        let root = value.as_object().ok_or(TwinError::NotAnObject)?;
        let properties = match root.get("properties") {
            Some(Value::Object(props)) => props,
            Some(_) => return Err(TwinError::NotAnObject),
            None => root,
        };

        let empty = Map::new();
        let desired = section(properties, "desired")?.unwrap_or(&empty);
        let reported = section(properties, "reported")?.unwrap_or(&empty);

        Ok(Self {
            desired: PropertyMap::from_wire(desired),
            reported: PropertyMap::from_wire(reported),
            version: desired.get(VERSION_FIELD).and_then(Value::as_i64).unwrap_or(0),
            metadata: read_metadata(desired),
        })
    }
}

fn section<'a>(properties: &'a Map<String, Value>, name: &str) -> Result<Option<&'a Map<String, Value>>, TwinError> {
    match properties.get(name) {
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(Value::Null) | None => Ok(None),
        Some(_) => Err(TwinError::NotAnObject),
    }
}

fn read_metadata(section: &Map<String, Value>) -> BTreeMap<String, String> {
    section
        .get(METADATA_FIELD)
        .and_then(Value::as_object)
        .map(|meta| {
            meta.iter()
                .filter(|(k, _)| !k.starts_with('$'))
                .filter_map(|(k, v)| {
                    let ts = v.get(LAST_UPDATED_FIELD)?.as_str()?;
                    Some((k.clone(), ts.to_string()))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Desired keys that changed with one patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredChangeSet {
    pub keys: BTreeSet<String>,
    /// `$version` carried by the patch, if any
    pub version: Option<i64>,
}

impl DesiredChangeSet {
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.contains(key)
    }
}

#[derive(Debug, Default)]
pub struct TwinStore {
    document: TwinDocument,
    // reported changed since the last accepted flush
    dirty: bool,
}

impl TwinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self) -> &TwinDocument {
        &self.document
    }

    pub fn desired(&self) -> &PropertyMap {
        &self.document.desired
    }

    pub fn reported(&self) -> &PropertyMap {
        &self.document.reported
    }

    /// Replace the whole local document with the service's copy.
    pub fn apply_snapshot(&mut self, raw: &str) -> Result<&TwinDocument, TwinError> {
        self.document = TwinDocument::from_json(raw)?;
        self.dirty = false;
        log::debug!(
            "Twin snapshot applied: desired v{} ({} keys), {} reported keys",
            self.document.version,
            self.document.desired.len(),
            self.document.reported.len()
        );
        Ok(&self.document)
    }

    /// Merge a desired-property patch.
    pub fn apply_patch(&mut self, raw: &str) -> Result<DesiredChangeSet, TwinError> {
        let value: Value = serde_json::from_str(raw)?;
        let patch = value.as_object().ok_or(TwinError::NotAnObject)?;

        let version = patch.get(VERSION_FIELD).and_then(Value::as_i64);
        if let Some(v) = version {
            self.document.version = v;
        }
        for (key, ts) in read_metadata(patch) {
            self.document.metadata.insert(key, ts);
        }

        let keys = self.document.desired.merge(patch);
        for key in &keys {
            if !self.document.desired.contains(key) {
                self.document.metadata.remove(key);
            }
        }
        if !keys.is_empty() {
            log::debug!("Desired properties changed: {:?}", keys);
        }
        Ok(DesiredChangeSet { keys, version })
    }

    pub fn set_reported(&mut self, key: &str, value: impl Into<Value>) {
        if self.document.reported.set_or_insert(key, value) {
            self.dirty = true;
        }
    }

    /// Send the full reported map through `send`. Nothing goes on the wire
    /// when the map is unchanged since the last accepted flush.
    pub fn flush_reported<F>(&mut self, send: F) -> Result<(), TwinError>
    where
        F: FnOnce(&str) -> Result<(), TwinError>,
    {
        if !self.dirty {
            log::debug!("Reported properties unchanged, flush skipped");
            return Ok(());
        }
        let payload = self.document.reported.to_wire().to_string();
        send(&payload)?;
        self.dirty = false;
        Ok(())
    }

    pub fn code_version(&self) -> Option<i64> {
        self.document.desired.get(CODE_VERSION_KEY).and_then(Value::as_i64)
    }

    pub fn firmware_url(&self) -> Option<&str> {
        self.document.desired.get(FIRMWARE_KEY).and_then(Value::as_str)
    }
}
