//! In-memory activation cache.
//!
//! Activation loads a service's per-tag subsets from its artifact files,
//! builds the weighted dictionaries, and pins both here. Index builds and
//! recommendation queries read only from this cache; a service that is not
//! cached is not active.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::config::ActivationConfig;
use crate::models::{PrcSettings, TagSubset};
use crate::scorer::Dictionary;

/// Loaded state of one tag inside an active service.
pub struct TagRuntime {
    pub subset: TagSubset,
    pub dictionary: Dictionary,
}

/// Everything an active service keeps in memory.
pub struct ServiceRuntime {
    pub settings: PrcSettings,
    pub tags: HashMap<String, TagRuntime>,
}

#[derive(Default)]
pub struct ActivationCache {
    services: RwLock<HashMap<String, Arc<ServiceRuntime>>>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, service_id: &str, runtime: ServiceRuntime) {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service_id.to_string(), Arc::new(runtime));
    }

    pub fn remove(&self, service_id: &str) {
        self.services
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service_id);
    }

    pub fn get(&self, service_id: &str) -> Option<Arc<ServiceRuntime>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_id)
            .cloned()
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(service_id)
    }
}

/// Estimated in-memory footprint of loading `artifact_bytes` of subsets,
/// after the configured safety multiplier.
pub fn estimated_footprint(artifact_bytes: u64, config: &ActivationConfig) -> u64 {
    (artifact_bytes as f64 * config.memory_multiplier) as u64
}

/// Bytes of memory available for an activation. Uses the configured override
/// when set, otherwise `MemAvailable` from /proc/meminfo. When neither can be
/// determined the guard is effectively disabled.
pub fn available_memory(config: &ActivationConfig) -> u64 {
    if let Some(bytes) = config.available_memory_override {
        return bytes;
    }
    match mem_available_bytes() {
        Some(bytes) => bytes,
        None => {
            tracing::warn!("could not determine available memory, skipping activation guard");
            u64::MAX
        }
    }
}

fn mem_available_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TagWordStats;

    fn runtime() -> ServiceRuntime {
        let mut subset = TagSubset::default();
        subset.words.insert(
            "rust".into(),
            TagWordStats {
                corpus_count: 10,
                tag_count: 5,
            },
        );
        let mut tags = HashMap::new();
        tags.insert(
            "t1".to_string(),
            TagRuntime {
                subset,
                dictionary: Dictionary::new(),
            },
        );
        ServiceRuntime {
            settings: PrcSettings {
                tag_ids: vec!["t1".into()],
                fields: vec!["body".into()],
                n_gram: 1,
                compression: 0.0,
            },
            tags,
        }
    }

    #[test]
    fn insert_get_remove() {
        let cache = ActivationCache::new();
        assert!(!cache.contains("svc"));

        cache.insert("svc", runtime());
        assert!(cache.contains("svc"));
        let rt = cache.get("svc").unwrap();
        assert!(rt.tags.contains_key("t1"));

        cache.remove("svc");
        assert!(cache.get("svc").is_none());
    }

    #[test]
    fn footprint_applies_multiplier() {
        let config = ActivationConfig {
            memory_multiplier: 3.0,
            available_memory_override: Some(1024),
        };
        assert_eq!(estimated_footprint(100, &config), 300);
        assert_eq!(available_memory(&config), 1024);
    }
}
