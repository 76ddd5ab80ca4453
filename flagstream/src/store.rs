//! Versioned, thread-safe replica of flag and segment definitions.
//!
//! Mutations are version-gated: `init` replaces the whole replica only for a
//! strictly newer dataset version, `upsert` applies only when the incoming
//! version is strictly newer than the stored entity's timestamp.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::errors::StoreError;
use crate::types::Entity;

/// Kind of stored entity. Name and short tag are fixed per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    FeatureFlags,
    Segments,
    /// Internal category used by store tests and diagnostics.
    DataTest,
}

impl Category {
    pub const ALL: [Category; 3] = [
        Category::FeatureFlags,
        Category::Segments,
        Category::DataTest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Category::FeatureFlags => "featureFlags",
            Category::Segments => "segments",
            Category::DataTest => "datatest",
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Category::FeatureFlags => "ff",
            Category::Segments => "seg",
            Category::DataTest => "test",
        }
    }
}

/// A full dataset keyed by category, as produced by a full sync.
pub type AllData = HashMap<Category, HashMap<String, Arc<Entity>>>;

/// Storage interface for the categorized, versioned replica.
///
/// Implementations must permit concurrent readers. `init` and `upsert`
/// return `Ok(true)` only when the mutation was actually applied; version-
/// gated no-ops return `Ok(false)`.
pub trait DataStore: Send + Sync {
    /// Entity for `key`, or `None` when absent or archived.
    fn get(&self, category: Category, key: &str) -> Option<Arc<Entity>>;

    /// All non-archived entities of a category.
    fn get_all(&self, category: Category) -> HashMap<String, Arc<Entity>>;

    /// Replace the whole replica with `all_data` at `version`.
    fn init(&self, all_data: AllData, version: i64) -> Result<bool, StoreError>;

    /// Update or insert one entity at `version`.
    fn upsert(
        &self,
        category: Category,
        key: &str,
        entity: Arc<Entity>,
        version: i64,
    ) -> Result<bool, StoreError>;

    /// True once a first init or upsert has been applied; never reverts.
    fn initialized(&self) -> bool;

    /// Highest dataset version accepted so far.
    fn latest_version(&self) -> i64;

    /// Release any resources held by the store.
    fn stop(&self) {}
}

#[derive(Debug, Default)]
struct StoreInner {
    items: HashMap<Category, HashMap<String, Arc<Entity>>>,
    version: i64,
    initialized: bool,
}

/// The built-in in-memory store.
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    inner: RwLock<StoreInner>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataStore for MemoryDataStore {
    fn get(&self, category: Category, key: &str) -> Option<Arc<Entity>> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .items
            .get(&category)
            .and_then(|items| items.get(key))
            .filter(|entity| !entity.is_archived)
            .cloned()
    }

    fn get_all(&self, category: Category) -> HashMap<String, Arc<Entity>> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner
            .items
            .get(&category)
            .map(|items| {
                items
                    .iter()
                    .filter(|(_, entity)| !entity.is_archived)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn init(&self, all_data: AllData, version: i64) -> Result<bool, StoreError> {
        if all_data.is_empty() {
            return Ok(false);
        }
        let mut inner = self.inner.write().expect("store lock poisoned");
        if version <= inner.version {
            return Ok(false);
        }
        inner.items = all_data;
        inner.version = version;
        inner.initialized = true;
        Ok(true)
    }

    fn upsert(
        &self,
        category: Category,
        key: &str,
        entity: Arc<Entity>,
        version: i64,
    ) -> Result<bool, StoreError> {
        if key.is_empty() {
            return Ok(false);
        }
        let mut inner = self.inner.write().expect("store lock poisoned");
        let existing = inner.items.get(&category).and_then(|items| items.get(key));
        // Gating is per key: the incoming version competes with the stored
        // entity's timestamp, not with the global dataset version.
        if let Some(existing) = existing
            && existing.timestamp >= version
        {
            return Ok(false);
        }
        inner
            .items
            .entry(category)
            .or_default()
            .insert(key.to_string(), entity);
        inner.version = inner.version.max(version);
        inner.initialized = true;
        Ok(true)
    }

    fn initialized(&self) -> bool {
        self.inner.read().expect("store lock poisoned").initialized
    }

    fn latest_version(&self) -> i64 {
        self.inner.read().expect("store lock poisoned").version
    }
}

/// A store that holds nothing and accepts nothing; evaluations against it
/// always fall back to default values.
#[derive(Debug, Default)]
pub struct NullDataStore;

impl DataStore for NullDataStore {
    fn get(&self, _category: Category, _key: &str) -> Option<Arc<Entity>> {
        None
    }

    fn get_all(&self, _category: Category) -> HashMap<String, Arc<Entity>> {
        HashMap::new()
    }

    fn init(&self, _all_data: AllData, _version: i64) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn upsert(
        &self,
        _category: Category,
        _key: &str,
        _entity: Arc<Entity>,
        _version: i64,
    ) -> Result<bool, StoreError> {
        Ok(false)
    }

    fn initialized(&self) -> bool {
        true
    }

    fn latest_version(&self) -> i64 {
        0
    }
}
