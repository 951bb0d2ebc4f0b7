//! Per-object metadata record
//!
//! Each object owns one flat tag dictionary. The dictionary is namespaced
//! by key prefix:
//!
//! | Tag                           | Meaning                                   |
//! |-------------------------------|-------------------------------------------|
//! | `de.<el>`                     | last modification time of element         |
//! | `de-created.<el>`             | first write time of element (set once)    |
//! | `de-exists.<el>`              | `true` while the element exists           |
//! | `de-size.<el>`                | payload length, embedded elements only    |
//! | `de-file.<el>`                | present when the payload is a file        |
//! | `objatt.<key>`                | object attribute value                    |
//! | `objatt-ts.<key>`             | object attribute timestamp                |
//! | `elatt.<escaped el>.<key>`    | element attribute value                   |
//! | `elatt-ts.<escaped el>.<key>` | element attribute timestamp               |
//! | `objmodified`                 | newest mutation time of the object        |
//! | `elDb`                        | object has been moved to tiered storage   |
//!
//! Element placement is never read from the raw tags outside this module;
//! callers go through [`ElementLocation`].

use dostore_common::Timestamp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// Element attribute that pins an element to file storage
pub const FORCE_FILE_ATTRIBUTE: &str = "internal.elementFile";

/// Derived attribute: creation time
pub const DATE_CREATED_ATTRIBUTE: &str = "internal.created";

/// Derived attribute: modification time
pub const DATE_MODIFIED_ATTRIBUTE: &str = "internal.modified";

/// Derived attribute: payload size
pub const SIZE_ATTRIBUTE: &str = "internal.size";

const MIGRATED_TAG: &str = "elDb";
const MODIFIED_TAG: &str = "objmodified";
const ELEMENT_TS_PREFIX: &str = "de.";
const ELEMENT_CREATED_PREFIX: &str = "de-created.";
const ELEMENT_EXISTS_PREFIX: &str = "de-exists.";
const ELEMENT_SIZE_PREFIX: &str = "de-size.";
const ELEMENT_FILE_PREFIX: &str = "de-file.";

/// Where an element's payload physically lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ElementLocation {
    /// A file in the object's hashed directory
    File,
    /// A record in the embedded element store
    Embedded { size: u64 },
}

/// Whether an object still needs its small files moved into the
/// embedded element store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MigrationState {
    Unmigrated,
    Migrated,
}

/// Escape an element ID for use inside attribute tag names
#[must_use]
pub fn escape_element_id(element_id: &str) -> String {
    let mut out = String::with_capacity(element_id.len() + 10);
    for ch in element_id.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '.' => out.push_str("%2E"),
            other => out.push(other),
        }
    }
    out
}

/// Tag holding an attribute value
#[must_use]
pub fn attribute_value_key(element_id: Option<&str>, key: &str) -> String {
    match element_id {
        None => format!("objatt.{key}"),
        Some(el) => format!("elatt.{}.{key}", escape_element_id(el)),
    }
}

/// Tag holding an attribute timestamp
#[must_use]
pub fn attribute_timestamp_key(element_id: Option<&str>, key: &str) -> String {
    match element_id {
        None => format!("objatt-ts.{key}"),
        Some(el) => format!("elatt-ts.{}.{key}", escape_element_id(el)),
    }
}

/// Metadata of one object: existence window plus the tag dictionary
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// Object ID with its original casing
    pub id: String,
    /// Most recent creation time (0 = never created)
    pub date_created: Timestamp,
    /// Most recent deletion time (0 = never deleted)
    pub date_deleted: Timestamp,
    tags: BTreeMap<String, String>,
}

impl ObjectMetadata {
    /// Empty record for an object the store has never seen
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Record with a fully specified tag dictionary
    #[must_use]
    pub fn with_tags(
        id: impl Into<String>,
        date_created: Timestamp,
        date_deleted: Timestamp,
        tags: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            date_created,
            date_deleted,
            tags,
        }
    }

    /// An object exists while its latest creation is newer than its latest
    /// deletion
    #[must_use]
    pub fn exists(&self) -> bool {
        self.date_created > self.date_deleted
    }

    // ---- Raw tags ----

    #[must_use]
    pub fn tag(&self, name: &str) -> Option<&str> {
        self.tags.get(name).map(String::as_str)
    }

    pub fn set_tag(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.tags.insert(name.into(), value.into());
    }

    pub fn remove_tag(&mut self, name: &str) -> Option<String> {
        self.tags.remove(name)
    }

    #[must_use]
    pub fn tags(&self) -> &BTreeMap<String, String> {
        &self.tags
    }

    /// Parse a numeric tag, logging (and ignoring) corrupt values
    fn timestamp_tag(&self, name: &str) -> Option<Timestamp> {
        let raw = self.tag(name)?;
        match raw.parse() {
            Ok(ts) => Some(ts),
            Err(_) => {
                error!("Invalid timestamp in tag '{}' of {}: {}", name, self.id, raw);
                None
            }
        }
    }

    // ---- Migration marker ----

    #[must_use]
    pub fn migration_state(&self) -> MigrationState {
        if self.tags.contains_key(MIGRATED_TAG) {
            MigrationState::Migrated
        } else {
            MigrationState::Unmigrated
        }
    }

    pub fn mark_migrated(&mut self) {
        self.set_tag(MIGRATED_TAG, "");
    }

    // ---- Modification time ----

    #[must_use]
    pub fn modified(&self) -> Option<Timestamp> {
        self.timestamp_tag(MODIFIED_TAG)
    }

    /// Advance the object modification time; never moves it backwards
    pub fn update_modification(&mut self, timestamp: Timestamp) {
        if self.modified().is_none_or(|old| timestamp > old) {
            self.set_tag(MODIFIED_TAG, timestamp.to_string());
        }
    }

    // ---- Elements ----

    #[must_use]
    pub fn element_exists(&self, element_id: &str) -> bool {
        self.tag(&format!("{ELEMENT_EXISTS_PREFIX}{element_id}")) == Some("true")
    }

    pub fn set_element_exists(&mut self, element_id: &str, exists: bool) {
        let name = format!("{ELEMENT_EXISTS_PREFIX}{element_id}");
        if exists {
            self.set_tag(name, "true");
        } else {
            self.remove_tag(&name);
        }
    }

    /// IDs of all existing elements
    #[must_use]
    pub fn elements(&self) -> Vec<String> {
        self.tags
            .iter()
            .filter(|(_, v)| v.as_str() == "true")
            .filter_map(|(k, _)| k.strip_prefix(ELEMENT_EXISTS_PREFIX))
            .map(str::to_string)
            .collect()
    }

    /// Last modification time of an element, kept after deletion so that
    /// replayed writes can be ordered against it
    #[must_use]
    pub fn element_timestamp(&self, element_id: &str) -> Option<Timestamp> {
        self.timestamp_tag(&format!("{ELEMENT_TS_PREFIX}{element_id}"))
    }

    pub fn set_element_timestamp(&mut self, element_id: &str, timestamp: Timestamp) {
        self.set_tag(format!("{ELEMENT_TS_PREFIX}{element_id}"), timestamp.to_string());
    }

    /// Elements whose modification timestamp is older than `before`
    #[must_use]
    pub fn elements_modified_before(&self, before: Timestamp) -> Vec<String> {
        self.tags
            .keys()
            .filter_map(|k| k.strip_prefix(ELEMENT_TS_PREFIX))
            .filter(|el| self.element_timestamp(el).is_some_and(|ts| ts < before))
            .map(str::to_string)
            .collect()
    }

    #[must_use]
    pub fn element_created(&self, element_id: &str) -> Option<Timestamp> {
        self.timestamp_tag(&format!("{ELEMENT_CREATED_PREFIX}{element_id}"))
    }

    /// Record the first-write time of an element unless already recorded
    pub fn init_element_created(&mut self, element_id: &str, timestamp: Timestamp) {
        let name = format!("{ELEMENT_CREATED_PREFIX}{element_id}");
        if !self.tags.contains_key(&name) {
            self.set_tag(name, timestamp.to_string());
        }
    }

    /// Where the element payload lives, if a payload was ever recorded
    #[must_use]
    pub fn element_location(&self, element_id: &str) -> Option<ElementLocation> {
        if self
            .tags
            .contains_key(&format!("{ELEMENT_FILE_PREFIX}{element_id}"))
        {
            return Some(ElementLocation::File);
        }
        self.timestamp_tag(&format!("{ELEMENT_SIZE_PREFIX}{element_id}"))
            .map(|size| ElementLocation::Embedded { size })
    }

    pub fn set_element_location(&mut self, element_id: &str, location: ElementLocation) {
        let file = format!("{ELEMENT_FILE_PREFIX}{element_id}");
        let size = format!("{ELEMENT_SIZE_PREFIX}{element_id}");
        match location {
            ElementLocation::File => {
                self.set_tag(file, "");
                self.remove_tag(&size);
            }
            ElementLocation::Embedded { size: len } => {
                self.remove_tag(&file);
                self.set_tag(size, len.to_string());
            }
        }
    }

    pub fn clear_element_location(&mut self, element_id: &str) {
        self.remove_tag(&format!("{ELEMENT_FILE_PREFIX}{element_id}"));
        self.remove_tag(&format!("{ELEMENT_SIZE_PREFIX}{element_id}"));
    }

    /// Drop every trace of an element except its creation time. Returns the
    /// placement it had, if any.
    pub fn forget_element(&mut self, element_id: &str) -> Option<ElementLocation> {
        let location = self.element_location(element_id);
        self.remove_tag(&format!("{ELEMENT_TS_PREFIX}{element_id}"));
        self.set_element_exists(element_id, false);
        self.clear_element_location(element_id);
        location
    }

    /// Drop existence and placement tags of every element. Returns whether
    /// any element was file-backed.
    pub fn clear_all_elements(&mut self) -> bool {
        let mut had_files = false;
        self.tags.retain(|k, _| {
            if k.starts_with(ELEMENT_FILE_PREFIX) {
                had_files = true;
                return false;
            }
            !(k.starts_with(ELEMENT_EXISTS_PREFIX) || k.starts_with(ELEMENT_SIZE_PREFIX))
        });
        had_files
    }

    /// Drop every element modification time, keeping creation times
    pub fn clear_element_timestamps(&mut self) {
        self.tags.retain(|k, _| !k.starts_with(ELEMENT_TS_PREFIX));
    }

    /// Drop placement tags only, keeping existence and timestamps
    pub fn clear_all_locations(&mut self) {
        self.tags.retain(|k, _| {
            !(k.starts_with(ELEMENT_FILE_PREFIX) || k.starts_with(ELEMENT_SIZE_PREFIX))
        });
    }

    /// Whether the element is pinned to file storage
    #[must_use]
    pub fn force_file(&self, element_id: &str) -> bool {
        self.tag(&attribute_value_key(Some(element_id), FORCE_FILE_ATTRIBUTE))
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    // ---- Attributes ----

    #[must_use]
    pub fn attribute_timestamp(&self, element_id: Option<&str>, key: &str) -> Option<Timestamp> {
        self.timestamp_tag(&attribute_timestamp_key(element_id, key))
    }

    /// Explicit attributes of the object (`None`) or an element
    #[must_use]
    pub fn attributes(&self, element_id: Option<&str>) -> BTreeMap<String, String> {
        let prefix = attribute_value_key(element_id, "");
        self.tags
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, v)| (k[prefix.len()..].to_string(), v.clone()))
            .collect()
    }

    /// Apply an attribute write if it is not older than the stored one.
    /// Returns whether the write was applied.
    pub fn apply_attribute(
        &mut self,
        element_id: Option<&str>,
        key: &str,
        value: Option<&str>,
        timestamp: Timestamp,
    ) -> bool {
        let stored = self.attribute_timestamp(element_id, key).unwrap_or(0);
        if stored > timestamp {
            return false;
        }
        self.set_tag(attribute_timestamp_key(element_id, key), timestamp.to_string());
        let value_key = attribute_value_key(element_id, key);
        match value {
            Some(v) => self.set_tag(value_key, v),
            None => {
                self.remove_tag(&value_key);
            }
        }
        true
    }

    /// Remove attribute values (of the object when `element_id` is `None`,
    /// otherwise of that element) whose timestamp precedes `boundary`, and
    /// advance their timestamps to the boundary so that older replays of
    /// those attributes stay rejected.
    pub fn prune_attributes_before(&mut self, element_id: Option<&str>, boundary: Timestamp) {
        let ts_prefix = attribute_timestamp_key(element_id, "");
        let val_prefix = attribute_value_key(element_id, "");

        let stale: Vec<String> = self
            .tags
            .range(ts_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&ts_prefix))
            .filter(|(k, v)| match v.parse::<Timestamp>() {
                Ok(ts) => ts < boundary,
                Err(_) => {
                    error!("Invalid attribute timestamp in tag '{}' of {}: {}", k, self.id, v);
                    false
                }
            })
            .map(|(k, _)| k[ts_prefix.len()..].to_string())
            .collect();

        for key in stale {
            self.remove_tag(&format!("{val_prefix}{key}"));
            self.set_tag(format!("{ts_prefix}{key}"), boundary.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existence_window() {
        let mut md = ObjectMetadata::new("x");
        assert!(!md.exists());

        md.date_created = 100;
        assert!(md.exists());

        md.date_deleted = 150;
        assert!(!md.exists());

        md.date_created = 150;
        assert!(!md.exists());

        md.date_created = 151;
        assert!(md.exists());
    }

    #[test]
    fn test_element_location_roundtrip() {
        let mut md = ObjectMetadata::new("x");
        assert_eq!(md.element_location("content"), None);

        md.set_element_location("content", ElementLocation::Embedded { size: 500 });
        assert_eq!(
            md.element_location("content"),
            Some(ElementLocation::Embedded { size: 500 })
        );
        assert_eq!(md.tag("de-size.content"), Some("500"));

        md.set_element_location("content", ElementLocation::File);
        assert_eq!(md.element_location("content"), Some(ElementLocation::File));
        assert_eq!(md.tag("de-size.content"), None);
        assert_eq!(md.tag("de-file.content"), Some(""));

        md.clear_element_location("content");
        assert_eq!(md.element_location("content"), None);
    }

    #[test]
    fn test_elements_listing() {
        let mut md = ObjectMetadata::new("x");
        md.set_element_exists("a", true);
        md.set_element_exists("b", true);
        md.set_element_exists("c", true);
        md.set_element_exists("b", false);
        md.set_element_location("a", ElementLocation::File);
        assert_eq!(md.elements(), vec!["a".to_string(), "c".to_string()]);

        assert!(md.clear_all_elements());
        assert!(md.elements().is_empty());
        assert_eq!(md.element_location("a"), None);
    }

    #[test]
    fn test_attribute_last_writer_wins() {
        let mut md = ObjectMetadata::new("x");
        assert!(md.apply_attribute(None, "k", Some("v1"), 100));
        assert!(!md.apply_attribute(None, "k", Some("v2"), 50));
        assert_eq!(md.attributes(None).get("k").map(String::as_str), Some("v1"));

        // Equal timestamps are accepted
        assert!(md.apply_attribute(None, "k", Some("v3"), 100));
        assert!(md.apply_attribute(None, "k", Some("v4"), 150));
        assert_eq!(md.attributes(None).get("k").map(String::as_str), Some("v4"));

        // Deletion keeps a tombstone timestamp
        assert!(md.apply_attribute(None, "k", None, 200));
        assert!(md.attributes(None).is_empty());
        assert!(!md.apply_attribute(None, "k", Some("late"), 199));
        assert_eq!(md.attribute_timestamp(None, "k"), Some(200));
    }

    #[test]
    fn test_element_attribute_namespacing() {
        let mut md = ObjectMetadata::new("x");
        md.apply_attribute(Some("a.b"), "type", Some("text"), 1);
        md.apply_attribute(Some("a"), "type", Some("other"), 1);
        md.apply_attribute(None, "type", Some("object"), 1);

        assert_eq!(md.tag("elatt.a%2Eb.type"), Some("text"));
        assert_eq!(
            md.attributes(Some("a.b")).get("type").map(String::as_str),
            Some("text")
        );
        assert_eq!(md.attributes(Some("a")).len(), 1);
        assert_eq!(md.attributes(None).len(), 1);
    }

    #[test]
    fn test_prune_attributes_before() {
        let mut md = ObjectMetadata::new("x");
        md.apply_attribute(None, "old", Some("1"), 10);
        md.apply_attribute(None, "new", Some("2"), 30);
        md.apply_attribute(Some("el"), "old", Some("3"), 10);

        md.prune_attributes_before(None, 20);

        let atts = md.attributes(None);
        assert!(!atts.contains_key("old"));
        assert_eq!(atts.get("new").map(String::as_str), Some("2"));
        assert_eq!(md.attribute_timestamp(None, "old"), Some(20));
        // element attributes are untouched by object-level pruning
        assert_eq!(md.attributes(Some("el")).len(), 1);
    }

    #[test]
    fn test_modification_is_monotonic() {
        let mut md = ObjectMetadata::new("x");
        md.update_modification(100);
        md.update_modification(50);
        assert_eq!(md.modified(), Some(100));
        md.update_modification(101);
        assert_eq!(md.modified(), Some(101));
    }

    #[test]
    fn test_migration_marker() {
        let mut md = ObjectMetadata::new("x");
        assert_eq!(md.migration_state(), MigrationState::Unmigrated);
        md.mark_migrated();
        assert_eq!(md.migration_state(), MigrationState::Migrated);
    }

    #[test]
    fn test_force_file_flag() {
        let mut md = ObjectMetadata::new("x");
        assert!(!md.force_file("big"));
        md.apply_attribute(Some("big"), FORCE_FILE_ATTRIBUTE, Some("TRUE"), 1);
        assert!(md.force_file("big"));
    }

    #[test]
    fn test_forget_element() {
        let mut md = ObjectMetadata::new("x");
        md.set_element_timestamp("el", 10);
        md.init_element_created("el", 10);
        md.set_element_exists("el", true);
        md.set_element_location("el", ElementLocation::Embedded { size: 3 });

        assert_eq!(
            md.forget_element("el"),
            Some(ElementLocation::Embedded { size: 3 })
        );
        assert!(!md.element_exists("el"));
        assert_eq!(md.element_timestamp("el"), None);
        assert_eq!(md.element_created("el"), Some(10));
        assert_eq!(md.forget_element("el"), None);
    }

    #[test]
    fn test_clear_element_timestamps() {
        let mut md = ObjectMetadata::new("x");
        md.set_element_timestamp("el", 110);
        md.init_element_created("el", 100);
        md.set_element_exists("el", true);

        md.clear_element_timestamps();
        assert_eq!(md.element_timestamp("el"), None);
        assert_eq!(md.element_created("el"), Some(100));
        assert!(md.element_exists("el"));
    }

    #[test]
    fn test_elements_modified_before() {
        let mut md = ObjectMetadata::new("x");
        md.set_element_timestamp("early", 10);
        md.set_element_timestamp("late", 30);
        assert_eq!(md.elements_modified_before(20), vec!["early".to_string()]);
    }
}
