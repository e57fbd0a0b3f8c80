//! Resource cache for discovered cloud resources
//!
//! Provider collaborators record what they discover here so that metric
//! queries only need to be issued for resources that are known to exist.

use crate::models::Provider;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// A discovered cloud resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResource {
    pub id: String,
    pub provider: Provider,
    pub region: String,
    /// Service the resource belongs to, e.g. `ec2` or `compute`
    pub service: String,
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vcpu: u32,
    /// Purchase model, e.g. `spot` or `on-demand`
    #[serde(default)]
    pub lifecycle: String,
}

#[derive(Debug, Clone)]
struct Entry {
    resource: CachedResource,
    inserted_at: Instant,
}

/// Keyed store of discovered resources with optional expiry
pub struct ResourceCache {
    /// Map of resource id -> entry
    entries: DashMap<String, Entry>,
    /// Entries older than this are treated as absent
    expiry: Option<Duration>,
}

impl ResourceCache {
    /// Create a cache whose entries never expire
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            expiry: None,
        }
    }

    /// Create a cache whose entries expire after `expiry`
    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            expiry: Some(expiry),
        }
    }

    fn is_live(&self, entry: &Entry) -> bool {
        match self.expiry {
            Some(expiry) => entry.inserted_at.elapsed() < expiry,
            None => true,
        }
    }

    /// Insert or refresh a resource
    pub fn insert(&self, resource: CachedResource) {
        debug!(resource_id = %resource.id, provider = %resource.provider, "Caching resource");
        self.entries.insert(
            resource.id.clone(),
            Entry {
                resource,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Get a live resource by id
    pub fn get(&self, id: &str) -> Option<CachedResource> {
        self.entries
            .get(id)
            .filter(|e| self.is_live(e.value()))
            .map(|e| e.resource.clone())
    }

    /// Remove a resource
    pub fn remove(&self, id: &str) -> Option<CachedResource> {
        self.entries.remove(id).map(|(_, e)| e.resource)
    }

    /// List all live resources
    pub fn list(&self) -> Vec<CachedResource> {
        self.entries
            .iter()
            .filter(|e| self.is_live(e.value()))
            .map(|e| e.resource.clone())
            .collect()
    }

    /// List live resources for one provider
    pub fn list_provider(&self, provider: Provider) -> Vec<CachedResource> {
        self.list()
            .into_iter()
            .filter(|r| r.provider == provider)
            .collect()
    }

    /// Number of stored entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries, returning the evicted resources
    pub fn evict_expired(&self) -> Vec<CachedResource> {
        let Some(expiry) = self.expiry else {
            return Vec::new();
        };
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().inserted_at.elapsed() >= expiry)
            .map(|e| e.key().clone())
            .collect();
        let evicted: Vec<CachedResource> = expired
            .iter()
            .filter_map(|id| {
                self.entries
                    .remove_if(id, |_, e| e.inserted_at.elapsed() >= expiry)
                    .map(|(_, e)| e.resource)
            })
            .collect();
        if !evicted.is_empty() {
            debug!(evicted = evicted.len(), "Evicted expired resources");
        }
        evicted
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

impl Default for ResourceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn resource(id: &str, provider: Provider) -> CachedResource {
        CachedResource {
            id: id.to_string(),
            provider,
            region: "europe-west1".to_string(),
            service: "compute".to_string(),
            kind: "n2-standard-4".to_string(),
            name: format!("vm-{}", id),
            vcpu: 4,
            lifecycle: String::new(),
        }
    }

    #[test]
    fn test_insert_and_get() {
        let cache = ResourceCache::new();
        cache.insert(resource("a", Provider::Gcp));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").unwrap().name, "vm-a");
        assert!(cache.get("missing").is_none());
    }

    #[test]
    fn test_insert_replaces_existing() {
        let cache = ResourceCache::new();
        cache.insert(resource("a", Provider::Gcp));
        let mut updated = resource("a", Provider::Gcp);
        updated.kind = "e2-small".to_string();
        cache.insert(updated);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("a").unwrap().kind, "e2-small");
    }

    #[test]
    fn test_list_provider_filters() {
        let cache = ResourceCache::new();
        cache.insert(resource("a", Provider::Gcp));
        cache.insert(resource("b", Provider::Aws));

        let gcp = cache.list_provider(Provider::Gcp);
        assert_eq!(gcp.len(), 1);
        assert_eq!(gcp[0].id, "a");
    }

    #[test]
    fn test_expired_entries_hidden_and_evicted() {
        let cache = ResourceCache::with_expiry(Duration::from_millis(0));
        cache.insert(resource("a", Provider::Gcp));

        assert!(cache.get("a").is_none());
        assert!(cache.list().is_empty());
        let evicted = cache.evict_expired();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, "a");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_evict_without_expiry_keeps_entries() {
        let cache = ResourceCache::new();
        cache.insert(resource("a", Provider::Gcp));

        assert!(cache.evict_expired().is_empty());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = ResourceCache::new();
        cache.insert(resource("a", Provider::Gcp));
        cache.insert(resource("b", Provider::Gcp));

        assert_eq!(cache.remove("a").unwrap().id, "a");
        assert!(cache.remove("a").is_none());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_inserts() {
        let cache = Arc::new(ResourceCache::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        cache.insert(resource(&format!("{}-{}", t, i), Provider::Aws));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 800);
    }
}
