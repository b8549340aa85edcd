//! Page-local mirror of the enabled-script store

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::Rc;

use ext_storage::valid_script_ids;
use serde_json::{Map, Value};
use tracing::warn;

use crate::{PageError, PageStorage};

/// Page-local storage key holding the JSON mirror
pub const PAGE_CACHE_KEY: &str = "AntiDebug_Breaker";

/// Fast, possibly stale copy of the store: one JSON object mapping hostname
/// to script ids, kept under [`PAGE_CACHE_KEY`]. Unreadable contents count
/// as empty.
#[derive(Clone)]
pub struct PageLocalCache {
    storage: Rc<dyn PageStorage>,
}

impl PageLocalCache {
    pub fn new(storage: Rc<dyn PageStorage>) -> Self {
        Self { storage }
    }

    fn read_all(&self) -> Map<String, Value> {
        let Some(raw) = self.storage.get_item(PAGE_CACHE_KEY) else {
            return Map::new();
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!("Page cache is not a JSON object; ignoring it");
                Map::new()
            }
            Err(e) => {
                warn!(error = %e, "Failed to read page cache");
                Map::new()
            }
        }
    }

    /// Cached ids for a hostname
    pub fn read(&self, hostname: &str) -> Vec<String> {
        self.read_all()
            .get(hostname)
            .map(valid_script_ids)
            .unwrap_or_default()
    }

    /// Replace the cached ids for a hostname, keeping other hostnames.
    /// Failures are logged; returns whether the write landed.
    pub fn write(&self, hostname: &str, scripts: &[String]) -> bool {
        let mut all = self.read_all();
        all.insert(hostname.to_string(), Value::from(scripts.to_vec()));

        let serialized = match serde_json::to_string(&Value::Object(all)) {
            Ok(serialized) => serialized,
            Err(e) => {
                warn!(error = %e, "Failed to update page cache");
                return false;
            }
        };

        match self.storage.set_item(PAGE_CACHE_KEY, &serialized) {
            Ok(()) => true,
            Err(e) => {
                warn!(hostname, error = %e, "Failed to update page cache");
                false
            }
        }
    }
}

/// `localStorage` stand-in
#[derive(Default)]
pub struct MemoryPageStorage {
    items: RefCell<BTreeMap<String, String>>,
    read_only: Cell<bool>,
}

impl MemoryPageStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a full or disabled storage area
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.set(read_only);
    }
}

impl PageStorage for MemoryPageStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.borrow().get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), PageError> {
        if self.read_only.get() {
            return Err(PageError::storage_write("QuotaExceededError"));
        }
        self.items
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (Rc<MemoryPageStorage>, PageLocalCache) {
        let storage = Rc::new(MemoryPageStorage::new());
        let cache = PageLocalCache::new(storage.clone());
        (storage, cache)
    }

    #[test]
    fn test_round_trip() {
        let (_storage, cache) = cache();
        let scripts = vec!["x".to_string(), "y".to_string()];

        assert!(cache.write("example.com", &scripts));
        assert_eq!(cache.read("example.com"), scripts);
    }

    #[test]
    fn test_write_keeps_other_hostnames() {
        let (storage, cache) = cache();
        cache.write("a.example", &["1".to_string()]);
        cache.write("b.example", &["2".to_string()]);

        assert_eq!(cache.read("a.example"), vec!["1"]);
        assert_eq!(cache.read("b.example"), vec!["2"]);

        let raw: Value = serde_json::from_str(&storage.get_item(PAGE_CACHE_KEY).unwrap()).unwrap();
        assert_eq!(raw["b.example"], serde_json::json!(["2"]));
    }

    #[test]
    fn test_corrupt_cache_reads_empty_and_is_replaced() {
        let (storage, cache) = cache();
        storage.set_item(PAGE_CACHE_KEY, "{not json").unwrap();

        assert!(cache.read("example.com").is_empty());
        assert!(cache.write("example.com", &["a".to_string()]));
        assert_eq!(cache.read("example.com"), vec!["a"]);
    }

    #[test]
    fn test_non_object_cache_reads_empty() {
        let (storage, cache) = cache();
        storage.set_item(PAGE_CACHE_KEY, "[1,2,3]").unwrap();
        assert!(cache.read("example.com").is_empty());
    }

    #[test]
    fn test_write_failure_is_reported() {
        let (storage, cache) = cache();
        storage.set_read_only(true);
        assert!(!cache.write("example.com", &["a".to_string()]));
        assert!(cache.read("example.com").is_empty());
    }
}
