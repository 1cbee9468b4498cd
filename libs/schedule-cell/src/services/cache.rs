use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::models::{Slot, WeeklySchedule};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheView {
    WeeklySchedule,
    Slots { from: NaiveDate, to: Option<NaiveDate> },
}

/// Entries are scoped by tenant first, then doctor-branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub tenant_id: String,
    pub doctor_branch_id: i64,
    pub view: CacheView,
}

impl CacheKey {
    pub fn weekly_schedule(tenant_id: &str, doctor_branch_id: i64) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            doctor_branch_id,
            view: CacheView::WeeklySchedule,
        }
    }

    pub fn slots(tenant_id: &str, doctor_branch_id: i64, from: NaiveDate, to: Option<NaiveDate>) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            doctor_branch_id,
            view: CacheView::Slots { from, to },
        }
    }
}

#[derive(Debug, Clone)]
pub enum CachedValue {
    WeeklySchedule(Vec<WeeklySchedule>),
    Slots(Vec<Slot>),
}

struct CacheEntry {
    value: CachedValue,
    stored_at: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
    pub ttl_seconds: u64,
}

/// Snapshot of a doctor-branch's invalidation epoch, taken before a store read.
/// A value loaded under an older epoch is not cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTicket {
    doctor_branch_id: i64,
    epoch: (u64, u64),
}

#[derive(Default)]
struct CacheTables {
    entries: HashMap<CacheKey, CacheEntry>,
    epochs: HashMap<i64, u64>,
    global_epoch: u64,
}

impl CacheTables {
    fn epoch(&self, doctor_branch_id: i64) -> (u64, u64) {
        (
            self.global_epoch,
            self.epochs.get(&doctor_branch_id).copied().unwrap_or_default(),
        )
    }
}

/// Read-through cache for template and slot reads. Every write path
/// invalidates the affected doctor-branch across all tenants.
pub struct ScheduleCache {
    ttl: Duration,
    tables: RwLock<CacheTables>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ScheduleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            tables: RwLock::new(CacheTables::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let tables = self.tables.read().await;
        match tables.entries.get(key) {
            Some(entry) if entry.stored_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub async fn ticket(&self, doctor_branch_id: i64) -> CacheTicket {
        CacheTicket {
            doctor_branch_id,
            epoch: self.tables.read().await.epoch(doctor_branch_id),
        }
    }

    /// Stores `value` unless the doctor-branch was invalidated since `ticket` was taken.
    pub async fn put(&self, key: CacheKey, value: CachedValue, ticket: CacheTicket) {
        if self.ttl.is_zero() || key.doctor_branch_id != ticket.doctor_branch_id {
            return;
        }
        let mut tables = self.tables.write().await;
        if tables.epoch(ticket.doctor_branch_id) != ticket.epoch {
            debug!("Skipped caching stale read of doctor-branch {}", ticket.doctor_branch_id);
            return;
        }
        let ttl = self.ttl;
        tables.entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        tables.entries.insert(
            key,
            CacheEntry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    pub async fn get_weekly_schedule(&self, key: &CacheKey) -> Option<Vec<WeeklySchedule>> {
        match self.get(key).await {
            Some(CachedValue::WeeklySchedule(schedules)) => Some(schedules),
            _ => None,
        }
    }

    pub async fn get_slots(&self, key: &CacheKey) -> Option<Vec<Slot>> {
        match self.get(key).await {
            Some(CachedValue::Slots(slots)) => Some(slots),
            _ => None,
        }
    }

    pub async fn invalidate_doctor_branch(&self, doctor_branch_id: i64) {
        let mut tables = self.tables.write().await;
        *tables.epochs.entry(doctor_branch_id).or_default() += 1;
        let before = tables.entries.len();
        tables.entries.retain(|key, _| key.doctor_branch_id != doctor_branch_id);
        debug!(
            "Invalidated {} cache entries for doctor-branch {}",
            before - tables.entries.len(),
            doctor_branch_id
        );
    }

    pub async fn invalidate_all(&self) {
        let mut tables = self.tables.write().await;
        tables.global_epoch += 1;
        tables.entries.clear();
    }

    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        CacheStats {
            hits,
            misses,
            entries: self.tables.read().await.entries.len(),
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
            ttl_seconds: self.ttl.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hit_after_put_and_miss_after_invalidate() {
        let cache = ScheduleCache::new(Duration::from_secs(60));
        let key = CacheKey::weekly_schedule("default", 5);

        assert!(cache.get_weekly_schedule(&key).await.is_none());
        let ticket = cache.ticket(5).await;
        cache.put(key.clone(), CachedValue::WeeklySchedule(vec![]), ticket).await;
        assert_eq!(cache.get_weekly_schedule(&key).await, Some(vec![]));

        cache.invalidate_doctor_branch(5).await;
        assert!(cache.get_weekly_schedule(&key).await.is_none());

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn tenants_do_not_share_entries() {
        let cache = ScheduleCache::new(Duration::from_secs(60));
        let ticket = cache.ticket(5).await;
        cache
            .put(CacheKey::weekly_schedule("north", 5), CachedValue::WeeklySchedule(vec![]), ticket)
            .await;

        assert!(cache
            .get_weekly_schedule(&CacheKey::weekly_schedule("south", 5))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn zero_ttl_disables_caching() {
        let cache = ScheduleCache::new(Duration::ZERO);
        let key = CacheKey::weekly_schedule("default", 1);
        let ticket = cache.ticket(1).await;
        cache.put(key.clone(), CachedValue::WeeklySchedule(vec![]), ticket).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn read_loaded_before_invalidation_is_not_cached() {
        let cache = ScheduleCache::new(Duration::from_secs(60));
        let key = CacheKey::weekly_schedule("default", 5);

        let ticket = cache.ticket(5).await;
        cache.invalidate_doctor_branch(5).await;
        cache.put(key.clone(), CachedValue::WeeklySchedule(vec![]), ticket).await;
        assert!(cache.get(&key).await.is_none());

        let stale_everywhere = cache.ticket(5).await;
        cache.invalidate_all().await;
        cache.put(key.clone(), CachedValue::WeeklySchedule(vec![]), stale_everywhere).await;
        assert!(cache.get(&key).await.is_none());

        // Other doctor-branches keep caching.
        let other = CacheKey::weekly_schedule("default", 6);
        let ticket = cache.ticket(6).await;
        cache.invalidate_doctor_branch(5).await;
        cache.put(other.clone(), CachedValue::WeeklySchedule(vec![]), ticket).await;
        assert!(cache.get(&other).await.is_some());
    }
}
