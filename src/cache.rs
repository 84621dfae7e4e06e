use chrono::NaiveDate;
use dashmap::DashMap;
use log::debug;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub instrument_id: String,
    pub strategy_id: String,
    pub as_of: NaiveDate,
}

impl CacheKey {
    pub fn new(instrument_id: &str, strategy_id: &str, as_of: NaiveDate) -> Self {
        Self {
            instrument_id: instrument_id.to_string(),
            strategy_id: strategy_id.to_string(),
            as_of,
        }
    }
}

#[derive(Debug)]
pub struct CacheEntry<V> {
    /// Trading day the entry was computed on; it expires the day after.
    pub stored_on: NaiveDate,
    pub value: V,
}

/// Shared result cache with daily invalidation.
///
/// Entries are immutable once stored. A write swaps the whole `Arc`, so a
/// reader holding an older entry keeps a complete, if stale, value.
pub struct ResultCache<V> {
    entries: Arc<DashMap<CacheKey, Arc<CacheEntry<V>>>>,
}

impl<V> Clone for ResultCache<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V> Default for ResultCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ResultCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, key: &CacheKey, today: NaiveDate) -> Option<Arc<CacheEntry<V>>> {
        // Clone the Arc out first; holding a shard guard across `remove` would deadlock.
        let entry = self.entries.get(key).map(|found| Arc::clone(found.value()))?;
        if entry.stored_on < today {
            self.entries
                .remove_if(key, |_, current| current.stored_on < today);
            debug!(
                "Cache entry {}/{} from {} expired",
                key.instrument_id, key.strategy_id, entry.stored_on
            );
            return None;
        }
        Some(entry)
    }

    pub fn insert(&self, key: CacheKey, value: V, today: NaiveDate) -> Arc<CacheEntry<V>> {
        let entry = Arc::new(CacheEntry {
            stored_on: today,
            value,
        });
        self.entries.insert(key, Arc::clone(&entry));
        entry
    }

    /// Return the cached entry for today or compute, store and return a fresh one.
    /// Errors are returned to the caller and never cached.
    pub fn get_or_try_insert_with<E, F>(
        &self,
        key: CacheKey,
        today: NaiveDate,
        compute: F,
    ) -> Result<Arc<CacheEntry<V>>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(entry) = self.get(&key, today) {
            return Ok(entry);
        }
        let value = compute()?;
        Ok(self.insert(key, value, today))
    }

    /// Drop every entry stored before `today`; returns how many were removed.
    pub fn purge_stale(&self, today: NaiveDate) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.stored_on >= today);
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}
