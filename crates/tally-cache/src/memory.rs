use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use jiff::civil::Date;
use parking_lot::Mutex;
use tally_core::error::Result;
use tally_core::{
    keyspace, AccessFact, AccessRecorder, DailyAggregate, DistributedLock, FactReader, LockToken,
    ShortCode, StatisticsStore, StoreError,
};
use tracing::{debug, trace, warn};

use crate::redis::RedisStoreConfig;

#[derive(Debug, Clone)]
enum Slot {
    Value(String),
    Members(BTreeSet<String>),
    Aggregate(DailyAggregate),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(slot: Slot, ttl: Option<Duration>) -> Self {
        Self {
            slot,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| Instant::now() >= expires_at)
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::InvalidData(format!("key '{key}' holds a value of another type"))
}

/// Recorded facts between two sweeps of expired entries.
const PURGE_INTERVAL: usize = 1024;

/// In-memory counterpart of [`RedisStatsStore`](crate::RedisStatsStore).
///
/// Keys follow the same layout. An expired entry is dropped when it is read,
/// and every [`PURGE_INTERVAL`] recorded facts the whole map is swept, since
/// fact keys are never read back. Clones share the same underlying map, so
/// several workers can be simulated against one store.
#[derive(Debug, Clone)]
pub struct InMemoryStatsStore {
    entries: Arc<DashMap<String, Entry>>,
    recorded: Arc<AtomicUsize>,
    retention: Duration,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::with_config(&RedisStoreConfig::default())
    }

    pub fn with_config(config: &RedisStoreConfig) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            recorded: Arc::new(AtomicUsize::new(0)),
            retention: config.retention,
        }
    }

    /// Writes a plain string value, e.g. to seed a cached statistics entry.
    pub fn insert_value(&self, key: impl Into<String>, value: impl Into<String>, ttl: Option<Duration>) {
        self.entries
            .insert(key.into(), Entry::new(Slot::Value(value.into()), ttl));
    }

    /// Returns the plain string value under `key`, if live.
    pub fn value(&self, key: &str) -> Option<String> {
        self.read(key, |slot| match slot {
            Slot::Value(value) => Some(value.clone()),
            _ => None,
        })
        .flatten()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read(key, |_| ()).is_some()
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let live = !entry.is_expired();
            if !live {
                removed += 1;
            }
            live
        });
        if removed > 0 {
            trace!(removed, "Purged expired entries");
        }
        removed
    }

    /// Runs `f` on the live slot under `key`, evicting it if it has expired.
    fn read<T>(&self, key: &str, f: impl FnOnce(&Slot) -> T) -> Option<T> {
        let entry = self.entries.get(key)?;
        if !entry.is_expired() {
            return Some(f(&entry.slot));
        }
        drop(entry);
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        None
    }

    fn set_if_absent(&self, key: String, slot: Slot, ttl: Duration) -> bool {
        match self.entries.entry(key) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_expired() {
                    occupied.insert(Entry::new(slot, Some(ttl)));
                    true
                } else {
                    false
                }
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(Entry::new(slot, Some(ttl)));
                true
            }
        }
    }

    fn incr(&self, key: &str, ttl: Duration) -> Result<u64> {
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Slot::Value("0".to_string()), None));
        if entry.is_expired() {
            *entry = Entry::new(Slot::Value("0".to_string()), None);
        }

        let current = match &entry.slot {
            Slot::Value(value) => value.parse::<u64>().map_err(|e| {
                StoreError::InvalidData(format!("key '{key}' is not a counter: {e}"))
            })?,
            _ => return Err(wrong_type(key)),
        };

        let next = current + 1;
        *entry = Entry::new(Slot::Value(next.to_string()), Some(ttl));
        Ok(next)
    }

    fn add_member(&self, key: &str, member: &str, ttl: Duration) -> Result<()> {
        let mut entry = self
            .entries
            .entry(key.to_owned())
            .or_insert_with(|| Entry::new(Slot::Members(BTreeSet::new()), None));
        if entry.is_expired() {
            *entry = Entry::new(Slot::Members(BTreeSet::new()), None);
        }

        match &mut entry.slot {
            Slot::Members(members) => {
                members.insert(member.to_owned());
            }
            _ => return Err(wrong_type(key)),
        }
        entry.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    fn members(&self, key: &str) -> Result<BTreeSet<ShortCode>> {
        match self.read(key, |slot| match slot {
            Slot::Members(members) => Some(members.clone()),
            _ => None,
        }) {
            None => Ok(BTreeSet::new()),
            Some(None) => Err(wrong_type(key)),
            Some(Some(members)) => Ok(members.into_iter().map(ShortCode::new_unchecked).collect()),
        }
    }
}

impl Default for InMemoryStatsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccessRecorder for InMemoryStatsStore {
    async fn record(&self, fact: &AccessFact) -> Result<bool> {
        let fact_key = keyspace::fact_key(&fact.code, fact.date, fact.timestamp);
        let created = self.set_if_absent(fact_key, Slot::Value("1".to_string()), self.retention);
        if !created {
            debug!(code = %fact.code, "Access fact already recorded");
            return Ok(false);
        }

        self.incr(
            &keyspace::access_count_key(&fact.code, fact.date),
            self.retention,
        )?;
        self.add_member(
            &keyspace::code_index_key(fact.date),
            fact.code.as_str(),
            self.retention,
        )?;
        trace!(code = %fact.code, date = %fact.date, "Recorded access fact in memory");

        if (self.recorded.fetch_add(1, Ordering::Relaxed) + 1) % PURGE_INTERVAL == 0 {
            self.purge_expired();
        }
        Ok(true)
    }
}

#[async_trait]
impl FactReader for InMemoryStatsStore {
    async fn list_codes_for_date(&self, date: Date) -> Result<BTreeSet<ShortCode>> {
        self.members(&keyspace::code_index_key(date))
    }

    async fn count_facts(&self, code: &ShortCode, date: Date) -> Result<u64> {
        let key = keyspace::access_count_key(code, date);
        let Some(value) = self.value(&key) else {
            return Ok(0);
        };

        match value.parse::<u64>() {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!(code = %code, key = %key, value = %value, error = %e, "Invalid access count, treating as zero");
                Ok(0)
            }
        }
    }
}

#[async_trait]
impl StatisticsStore for InMemoryStatsStore {
    async fn is_processed(&self, code: &ShortCode, date: Date) -> Result<bool> {
        Ok(self.contains_key(&keyspace::processed_marker_key(code, date)))
    }

    async fn try_mark_processing(
        &self,
        code: &ShortCode,
        date: Date,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        let token = LockToken::generate(owner);
        let acquired = self.set_if_absent(
            keyspace::processing_marker_key(code, date),
            Slot::Value(token.as_str().to_owned()),
            ttl,
        );
        Ok(acquired.then_some(token))
    }

    async fn clear_processing(
        &self,
        code: &ShortCode,
        date: Date,
        token: &LockToken,
    ) -> Result<bool> {
        let removed = self
            .entries
            .remove_if(&keyspace::processing_marker_key(code, date), |_, entry| {
                !entry.is_expired()
                    && matches!(&entry.slot, Slot::Value(value) if value == token.as_str())
            });
        Ok(removed.is_some())
    }

    async fn save_daily_aggregate(&self, aggregate: &DailyAggregate, ttl: Duration) -> Result<()> {
        self.entries.insert(
            keyspace::daily_aggregate_key(&aggregate.code, aggregate.date),
            Entry::new(Slot::Aggregate(aggregate.clone()), Some(ttl)),
        );
        self.add_member(
            &keyspace::daily_codes_key(aggregate.date),
            aggregate.code.as_str(),
            ttl,
        )
    }

    async fn daily_aggregate(&self, code: &ShortCode, date: Date) -> Result<Option<DailyAggregate>> {
        let key = keyspace::daily_aggregate_key(code, date);
        match self.read(&key, |slot| match slot {
            Slot::Aggregate(aggregate) => Some(aggregate.clone()),
            _ => None,
        }) {
            None => Ok(None),
            Some(None) => Err(wrong_type(&key)),
            Some(aggregate) => Ok(aggregate),
        }
    }

    async fn list_aggregated_codes(&self, date: Date) -> Result<BTreeSet<ShortCode>> {
        self.members(&keyspace::daily_codes_key(date))
    }

    async fn mark_processed(&self, code: &ShortCode, date: Date, ttl: Duration) -> Result<()> {
        self.insert_value(keyspace::processed_marker_key(code, date), "true", Some(ttl));
        Ok(())
    }

    async fn invalidate_stats_cache(&self, code: &ShortCode) -> Result<usize> {
        let prefix = keyspace::stats_cache_prefix(code);
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix))
            .map(|entry| entry.key().clone())
            .collect();

        let removed = keys
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count();
        debug!(code = %code, removed, "Invalidated cached statistics");
        Ok(removed)
    }
}

/// In-process [`DistributedLock`] for tests and single-node runs.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLock {
    held: Arc<Mutex<HashMap<String, (LockToken, Instant)>>>,
}

impl InMemoryLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn try_acquire(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<LockToken>> {
        if key.trim().is_empty() || ttl.is_zero() {
            warn!(key = %key, ?ttl, "Refusing to acquire lock with a blank key or zero TTL");
            return Ok(None);
        }

        let now = Instant::now();
        let mut held = self.held.lock();
        if held.get(key).is_some_and(|(_, expires_at)| now < *expires_at) {
            return Ok(None);
        }

        let token = LockToken::generate(owner);
        held.insert(key.to_owned(), (token.clone(), now + ttl));
        Ok(Some(token))
    }

    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let now = Instant::now();
        let mut held = self.held.lock();
        let owned = held
            .get(key)
            .is_some_and(|(current, expires_at)| current == token && now < *expires_at);
        if owned {
            held.remove(key);
        }
        Ok(owned)
    }

    async fn holder(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        Ok(self
            .held
            .lock()
            .get(key)
            .filter(|(_, expires_at)| now < *expires_at)
            .map(|(token, _)| token.as_str().to_owned()))
    }
}
