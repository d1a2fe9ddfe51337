//! Executor Registry (C6): the in-memory set of active executors, looked up by
//! `(path, method)` through a bounded-capacity cache that shadows a linear scan
//! over the authoritative map.
//!
//! Grounded on the teacher's `RuleTable` (`rule_engine/src/rule_table.rs`):
//! an `Arc<RwLock<...>>`-guarded authoritative store plus a separately-locked
//! cache. Reads stay lock-free on the cache hit path and briefly read-locked on
//! the slow path; writes (`import_all`) hold the write lock only for the
//! duration of a map diff.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use deepmock_engine::Executor;
use parking_lot::{Mutex, RwLock};

/// Default bounded capacity of the path+method lookup cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

fn cache_key(method: &str, path: &str) -> String {
    let mut key = String::with_capacity(method.len() + path.len() + 1);
    key.push_str(method);
    key.push('-');
    key.push_str(path);
    key
}

/// A bounded `(method, path) -> executor id` cache. Approximates an Adaptive
/// Replacement Cache with a simple LRU eviction policy: no corpus dependency
/// implements literal ARC, and the registry's correctness never depends on
/// which entries get evicted (the cache is a pure performance shadow —
/// property 3 in the specification's testable invariants). `order` is kept
/// most-recently-used at the back; both a cache hit and an insert move the
/// key there.
struct LookupCache {
    capacity: usize,
    entries: HashMap<String, String>,
    order: VecDeque<String>,
}

impl LookupCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn touch(&mut self, key: &str) {
        if let Some(position) = self.order.iter().position(|k| k == key) {
            let key = self.order.remove(position).expect("position just found");
            self.order.push_back(key);
        }
    }

    fn get(&mut self, key: &str) -> Option<String> {
        let id = self.entries.get(key).cloned();
        if id.is_some() {
            self.touch(key);
        }
        id
    }

    fn insert(&mut self, key: String, id: String) {
        if self.entries.contains_key(&key) {
            self.touch(&key);
        } else {
            if self.entries.len() >= self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.entries.remove(&evicted);
                }
            }
            self.order.push_back(key.clone());
        }
        self.entries.insert(key, id);
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(position) = self.order.iter().position(|k| k == key) {
            self.order.remove(position);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Outcome of an `import_all` sweep, surfaced for reconciliation logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub removed: usize,
}

/// The live set of executors serving mock traffic.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<Executor>>>,
    cache: Mutex<LookupCache>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::with_cache_capacity(DEFAULT_CACHE_CAPACITY)
    }

    pub fn with_cache_capacity(capacity: usize) -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
            cache: Mutex::new(LookupCache::new(capacity)),
        }
    }

    /// Locate the executor serving `(method, path)`, consulting the cache
    /// first and falling back to a linear scan on a miss or stale hit.
    pub fn find(&self, method: &str, path: &str) -> Option<Arc<Executor>> {
        let key = cache_key(method, path);

        if let Some(id) = self.cache.lock().get(&key) {
            let executors = self.executors.read();
            if let Some(executor) = executors.get(&id) {
                return Some(Arc::clone(executor));
            }
            // Stale cache entry: the executor it pointed at is gone. Evict and
            // fall through to the linear scan below.
            drop(executors);
            self.cache.lock().remove(&key);
        }

        let executors = self.executors.read();
        for executor in executors.values() {
            if executor.matches(method, path) {
                self.cache.lock().insert(key, executor.id.clone());
                return Some(Arc::clone(executor));
            }
        }
        None
    }

    /// Atomically reconcile the registry against `incoming`: insert new
    /// executors, replace ones whose version changed, leave unchanged ones
    /// alone, and remove everything not present in `incoming`. Cache entries
    /// pointing at removed ids self-heal on their next `find` (the stale-entry
    /// path above).
    pub fn import_all(&self, incoming: Vec<Executor>) -> ImportStats {
        let mut stats = ImportStats::default();
        let mut executors = self.executors.write();

        let mut to_delete: std::collections::HashSet<String> = executors.keys().cloned().collect();

        for executor in incoming {
            to_delete.remove(&executor.id);
            match executors.get(&executor.id) {
                Some(existing) if existing.version == executor.version => {
                    stats.unchanged += 1;
                }
                Some(_) => {
                    stats.replaced += 1;
                    executors.insert(executor.id.clone(), Arc::new(executor));
                }
                None => {
                    stats.inserted += 1;
                    executors.insert(executor.id.clone(), Arc::new(executor));
                }
            }
        }

        for id in &to_delete {
            executors.remove(id);
        }
        stats.removed = to_delete.len();

        stats
    }

    /// Wipe both the authoritative map and the cache. Used for hard reset and
    /// test isolation.
    pub fn purge(&self) {
        self.executors.write().clear();
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.executors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current set of executor ids, for testing property 6
    /// (`ImportAll(S)` makes the registry's id set equal `{e.id | e in S}`).
    pub fn ids(&self) -> std::collections::HashSet<String> {
        self.executors.read().keys().cloned().collect()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepmock_engine::compile_rule;
    use deepmock_engine::wire::{Regulation, Rule, Template};

    fn rule(path: &str, method: &str, version: i64) -> Rule {
        Rule {
            id: None,
            path: path.to_string(),
            method: method.to_string(),
            variable: None,
            weight: None,
            responses: vec![Regulation {
                is_default: true,
                filter: None,
                response: Template {
                    body: Some("ok".to_string()),
                    ..Default::default()
                },
            }],
            version,
        }
    }

    #[test]
    fn find_matches_cache_disabled_semantics() {
        let registry = ExecutorRegistry::new();
        let executor = compile_rule(&rule("/ping", "GET", 1)).unwrap();
        registry.import_all(vec![executor]);

        assert!(registry.find("GET", "/ping").is_some());
        // Second lookup exercises the cache-hit path; same result either way.
        assert!(registry.find("GET", "/ping").is_some());
        assert!(registry.find("GET", "/missing").is_none());
    }

    #[test]
    fn import_all_is_idempotent() {
        let registry = ExecutorRegistry::new();
        let executor = compile_rule(&rule("/ping", "GET", 1)).unwrap();
        let id = executor.id.clone();

        let first = registry.import_all(vec![executor]);
        assert_eq!(first.inserted, 1);

        let executor_again = compile_rule(&rule("/ping", "GET", 1)).unwrap();
        let second = registry.import_all(vec![executor_again]);
        assert_eq!(second.unchanged, 1);
        assert_eq!(second.replaced, 0);

        assert_eq!(registry.ids(), std::collections::HashSet::from([id]));
    }

    #[test]
    fn import_all_replaces_on_version_bump_and_removes_missing() {
        let registry = ExecutorRegistry::new();
        let v1 = compile_rule(&rule("/ping", "GET", 1)).unwrap();
        registry.import_all(vec![v1]);

        let v2 = compile_rule(&rule("/ping", "GET", 2)).unwrap();
        let stats = registry.import_all(vec![v2]);
        assert_eq!(stats.replaced, 1);

        let stats = registry.import_all(vec![]);
        assert_eq!(stats.removed, 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn stale_cache_entry_self_heals() {
        let registry = ExecutorRegistry::new();
        let executor = compile_rule(&rule("/ping", "GET", 1)).unwrap();
        registry.import_all(vec![executor]);
        assert!(registry.find("GET", "/ping").is_some());

        registry.import_all(vec![]);
        assert!(registry.find("GET", "/ping").is_none());
    }

    #[test]
    fn purge_clears_map_and_cache() {
        let registry = ExecutorRegistry::new();
        let executor = compile_rule(&rule("/ping", "GET", 1)).unwrap();
        registry.import_all(vec![executor]);
        registry.purge();
        assert!(registry.is_empty());
        assert!(registry.find("GET", "/ping").is_none());
    }

    #[test]
    fn bounded_cache_evicts_oldest_entry() {
        let registry = ExecutorRegistry::with_cache_capacity(1);
        let a = compile_rule(&rule("/a", "GET", 1)).unwrap();
        let b = compile_rule(&rule("/b", "GET", 1)).unwrap();
        registry.import_all(vec![a, b]);

        assert!(registry.find("GET", "/a").is_some());
        assert!(registry.find("GET", "/b").is_some());
        // Cache capacity is 1; both lookups above still resolve correctly via
        // the linear-scan fallback regardless of which one got evicted.
        assert!(registry.find("GET", "/a").is_some());
    }

    #[test]
    fn lookup_cache_evicts_least_recently_used_not_least_recently_inserted() {
        let mut cache = LookupCache::new(2);
        cache.insert("a".to_string(), "id-a".to_string());
        cache.insert("b".to_string(), "id-b".to_string());
        // Touch "a" so it is more recently used than "b".
        assert_eq!(cache.get("a"), Some("id-a".to_string()));
        // Inserting a third key must evict "b" (least recently used), not "a"
        // (least recently inserted).
        cache.insert("c".to_string(), "id-c".to_string());
        assert_eq!(cache.get("a"), Some("id-a".to_string()));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some("id-c".to_string()));
    }
}
