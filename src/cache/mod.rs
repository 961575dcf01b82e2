//! Four-tier in-memory cache of test records.
//!
//! Running is unbounded. Recent, Requested, and Searched are bounded; when
//! one is full, inserting a new key evicts the entry touched longest ago.
//! A test id lives in at most one tier. All tier maps sit behind a single
//! mutex so migration and eviction are atomic with respect to readers.

mod record;

pub use self::record::{last_touched, SharedRecord, TestRecord};

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

use crate::config::CacheConfig;
use crate::status::TestStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheTier {
    Running,
    Recent,
    Requested,
    Searched,
}

impl CacheTier {
    pub const ALL: [CacheTier; 4] = [
        CacheTier::Running,
        CacheTier::Recent,
        CacheTier::Requested,
        CacheTier::Searched,
    ];

    /// Tier an updated record belongs in, given its status.
    pub fn for_update(status: TestStatus) -> Self {
        if status.is_terminal() {
            CacheTier::Recent
        } else if status.is_active() {
            CacheTier::Running
        } else {
            CacheTier::Requested
        }
    }

    /// Tier a record hydrated by a query belongs in.
    pub fn for_query(status: TestStatus) -> Self {
        if status.is_active() {
            CacheTier::Running
        } else {
            CacheTier::Requested
        }
    }
}

impl fmt::Display for CacheTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheTier::Running => "running",
            CacheTier::Recent => "recent",
            CacheTier::Requested => "requested",
            CacheTier::Searched => "searched",
        };
        f.write_str(s)
    }
}

/// Per-tier capacity. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLimits {
    pub max_recent: usize,
    pub max_requested: usize,
    pub max_searched: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            max_recent: 10,
            max_requested: 10,
            max_searched: 1000,
        }
    }
}

impl From<&CacheConfig> for CacheLimits {
    fn from(cfg: &CacheConfig) -> Self {
        Self {
            max_recent: cfg.max_recent,
            max_requested: cfg.max_requested,
            max_searched: cfg.max_searched,
        }
    }
}

impl CacheLimits {
    pub fn for_tier(&self, tier: CacheTier) -> Option<usize> {
        match tier {
            CacheTier::Running => None,
            CacheTier::Recent => Some(self.max_recent),
            CacheTier::Requested => Some(self.max_requested),
            CacheTier::Searched => Some(self.max_searched),
        }
    }
}

#[derive(Default)]
struct Tiers {
    running: HashMap<String, SharedRecord>,
    recent: HashMap<String, SharedRecord>,
    requested: HashMap<String, SharedRecord>,
    searched: HashMap<String, SharedRecord>,
}

impl Tiers {
    fn map(&self, tier: CacheTier) -> &HashMap<String, SharedRecord> {
        match tier {
            CacheTier::Running => &self.running,
            CacheTier::Recent => &self.recent,
            CacheTier::Requested => &self.requested,
            CacheTier::Searched => &self.searched,
        }
    }

    fn map_mut(&mut self, tier: CacheTier) -> &mut HashMap<String, SharedRecord> {
        match tier {
            CacheTier::Running => &mut self.running,
            CacheTier::Recent => &mut self.recent,
            CacheTier::Requested => &mut self.requested,
            CacheTier::Searched => &mut self.searched,
        }
    }

    fn find(&self, test_id: &str) -> Option<(SharedRecord, CacheTier)> {
        CacheTier::ALL
            .into_iter()
            .find_map(|tier| self.map(tier).get(test_id).map(|r| (r.clone(), tier)))
    }
}

/// Remove the least recently touched entry from `map`. An entry that was
/// never touched goes first without scanning further.
fn evict_oldest(map: &mut HashMap<String, SharedRecord>, tier: CacheTier) {
    let mut oldest: Option<(&String, i64)> = None;
    for (test_id, record) in map.iter() {
        let touched = last_touched(&record.read());
        if touched == 0 {
            oldest = Some((test_id, 0));
            break;
        }
        if oldest.map_or(true, |(_, t)| touched < t) {
            oldest = Some((test_id, touched));
        }
    }
    if let Some((test_id, touched)) = oldest {
        let test_id = test_id.clone();
        debug!(test_id = %test_id, %tier, last_touched = touched, "evicting cached test");
        map.remove(&test_id);
    }
}

pub struct TestCache {
    tiers: Mutex<Tiers>,
    limits: CacheLimits,
}

impl Default for TestCache {
    fn default() -> Self {
        Self::new(CacheLimits::default())
    }
}

impl TestCache {
    pub fn new(limits: CacheLimits) -> Self {
        Self {
            tiers: Mutex::new(Tiers::default()),
            limits,
        }
    }

    pub fn limits(&self) -> CacheLimits {
        self.limits
    }

    pub fn get(&self, test_id: &str) -> Option<(SharedRecord, CacheTier)> {
        self.tiers.lock().find(test_id)
    }

    /// Place `record` in `target`, migrating it out of any other tier.
    ///
    /// If the record already lives in another tier and the target is
    /// Searched, the existing placement wins and nothing changes. Returns the
    /// tier the record ends up in, or `None` if the target tier has zero
    /// capacity.
    pub fn upsert(&self, record: SharedRecord, target: CacheTier) -> Option<CacheTier> {
        let test_id = record.read().test_id.clone();
        let mut tiers = self.tiers.lock();

        if let Some((_, current)) = tiers.find(&test_id) {
            if current != target {
                if target == CacheTier::Searched {
                    return Some(current);
                }
                tiers.map_mut(current).remove(&test_id);
                debug!(test_id = %test_id, from = %current, to = %target, "moving cached test");
            }
        }
        self.place(&mut tiers, test_id, record, target)
    }

    /// Return the cached handle for `test_id`, or build one with `make` and
    /// insert it into `target`. Lookup and insertion happen under one lock,
    /// so concurrent callers always end up sharing the same handle.
    ///
    /// The flag is true when `make` ran. A record built for a zero-capacity
    /// tier is returned but not cached.
    pub fn get_or_insert_with<F>(&self, test_id: &str, target: CacheTier, make: F) -> (SharedRecord, bool)
    where
        F: FnOnce() -> SharedRecord,
    {
        let mut tiers = self.tiers.lock();
        if let Some((existing, _)) = tiers.find(test_id) {
            return (existing, false);
        }
        let record = make();
        self.place(&mut tiers, test_id.to_string(), record.clone(), target);
        (record, true)
    }

    /// Insert into `target` (the key is in no other tier), evicting as needed.
    fn place(&self, tiers: &mut Tiers, test_id: String, record: SharedRecord, target: CacheTier) -> Option<CacheTier> {
        let map = tiers.map_mut(target);
        if let Some(max) = self.limits.for_tier(target) {
            if max == 0 {
                return None;
            }
            if !map.contains_key(&test_id) {
                while map.len() >= max {
                    evict_oldest(map, target);
                }
            }
        }
        map.insert(test_id, record);

        if cfg!(debug_assertions) {
            if let Err(violation) = Self::check(tiers, &self.limits) {
                panic!("test cache invariant violated: {}", violation);
            }
        }
        Some(target)
    }

    pub fn remove(&self, test_id: &str) -> Option<SharedRecord> {
        let mut tiers = self.tiers.lock();
        CacheTier::ALL
            .into_iter()
            .find_map(|tier| tiers.map_mut(tier).remove(test_id))
    }

    pub fn len(&self, tier: CacheTier) -> usize {
        self.tiers.lock().map(tier).len()
    }

    pub fn is_empty(&self) -> bool {
        let tiers = self.tiers.lock();
        CacheTier::ALL.into_iter().all(|tier| tiers.map(tier).is_empty())
    }

    /// Snapshot of one tier's records.
    pub fn records(&self, tier: CacheTier) -> Vec<SharedRecord> {
        self.tiers.lock().map(tier).values().cloned().collect()
    }

    /// Single-tier occupancy and capacity bounds.
    pub fn check_invariants(&self) -> Result<(), String> {
        Self::check(&self.tiers.lock(), &self.limits)
    }

    fn check(tiers: &Tiers, limits: &CacheLimits) -> Result<(), String> {
        let mut seen: HashMap<&str, CacheTier> = HashMap::new();
        for tier in CacheTier::ALL {
            let map = tiers.map(tier);
            if let Some(max) = limits.for_tier(tier) {
                if map.len() > max {
                    return Err(format!("{} tier holds {} entries, max {}", tier, map.len(), max));
                }
            }
            for test_id in map.keys() {
                if let Some(other) = seen.insert(test_id.as_str(), tier) {
                    return Err(format!("{} is in both {} and {}", test_id, other, tier));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::TestIdentity;
    use chrono::{DateTime, TimeZone, Utc};

    fn rec(n: u32) -> SharedRecord {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(n as i64);
        let id = TestIdentity::from_config_filename("cache.yaml", ts).unwrap();
        TestRecord::new(&id, TestStatus::Unknown).into_shared()
    }

    fn at(ms: i64) -> Option<DateTime<Utc>> {
        Some(Utc.timestamp_millis_opt(ms).unwrap())
    }

    fn id_of(r: &SharedRecord) -> String {
        r.read().test_id.clone()
    }

    fn small() -> TestCache {
        TestCache::new(CacheLimits {
            max_recent: 3,
            max_requested: 3,
            max_searched: 5,
        })
    }

    #[test]
    fn test_get_reports_tier() {
        let cache = small();
        let r = rec(1);
        cache.upsert(r.clone(), CacheTier::Running);
        let (found, tier) = cache.get(&id_of(&r)).unwrap();
        assert_eq!(tier, CacheTier::Running);
        assert!(std::sync::Arc::ptr_eq(&found, &r));
        assert!(cache.get("nope20240101T000000000").is_none());
    }

    #[test]
    fn test_upsert_migrates_between_tiers() {
        let cache = small();
        let r = rec(1);
        cache.upsert(r.clone(), CacheTier::Running);
        cache.upsert(r.clone(), CacheTier::Recent);
        assert_eq!(cache.len(CacheTier::Running), 0);
        assert_eq!(cache.get(&id_of(&r)).unwrap().1, CacheTier::Recent);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_searched_does_not_displace_authoritative_tier() {
        let cache = small();
        let r = rec(1);
        cache.upsert(r.clone(), CacheTier::Requested);
        assert_eq!(cache.upsert(r.clone(), CacheTier::Searched), Some(CacheTier::Requested));
        assert_eq!(cache.len(CacheTier::Searched), 0);
        assert_eq!(cache.get(&id_of(&r)).unwrap().1, CacheTier::Requested);
    }

    #[test]
    fn test_running_is_unbounded() {
        let cache = small();
        for n in 0..50 {
            cache.upsert(rec(n), CacheTier::Running);
        }
        assert_eq!(cache.len(CacheTier::Running), 50);
    }

    #[test]
    fn test_eviction_removes_least_recently_touched() {
        let cache = small();
        let records: Vec<_> = (0..3).map(rec).collect();
        records[0].write().last_requested = at(3_000);
        records[1].write().last_checked = at(1_000);
        records[1].write().last_updated = at(1_500);
        records[2].write().last_updated = at(2_000);
        for r in &records {
            cache.upsert(r.clone(), CacheTier::Recent);
        }

        let newcomer = rec(10);
        newcomer.write().last_updated = at(500);
        cache.upsert(newcomer.clone(), CacheTier::Recent);

        assert_eq!(cache.len(CacheTier::Recent), 3);
        assert!(cache.get(&id_of(&records[1])).is_none());
        assert!(cache.get(&id_of(&records[0])).is_some());
        assert!(cache.get(&id_of(&newcomer)).is_some());
    }

    #[test]
    fn test_never_touched_entry_is_evicted_first() {
        let cache = small();
        let records: Vec<_> = (0..3).map(rec).collect();
        records[0].write().last_requested = at(100);
        records[2].write().last_requested = at(200);
        for r in &records {
            cache.upsert(r.clone(), CacheTier::Requested);
        }
        cache.upsert(rec(20), CacheTier::Requested);
        assert!(cache.get(&id_of(&records[1])).is_none());
        assert!(cache.get(&id_of(&records[0])).is_some());
    }

    #[test]
    fn test_reinserting_existing_key_does_not_evict() {
        let cache = small();
        let records: Vec<_> = (0..3).map(rec).collect();
        for r in &records {
            cache.upsert(r.clone(), CacheTier::Recent);
        }
        cache.upsert(records[0].clone(), CacheTier::Recent);
        assert_eq!(cache.len(CacheTier::Recent), 3);
        for r in &records {
            assert!(cache.get(&id_of(r)).is_some());
        }
    }

    #[test]
    fn test_bounds_hold_after_random_sequence() {
        let cache = small();
        let tiers = [CacheTier::Recent, CacheTier::Requested, CacheTier::Searched, CacheTier::Running];
        let pool: Vec<_> = (0..12).map(rec).collect();
        for step in 0..200usize {
            let r = &pool[(step * 7) % pool.len()];
            r.write().last_requested = at(step as i64 + 1);
            cache.upsert(r.clone(), tiers[(step * 3) % tiers.len()]);
            cache.check_invariants().unwrap();
        }
        assert!(cache.len(CacheTier::Recent) <= 3);
        assert!(cache.len(CacheTier::Requested) <= 3);
        assert!(cache.len(CacheTier::Searched) <= 5);
    }

    #[test]
    fn test_zero_capacity_tier_stores_nothing() {
        let cache = TestCache::new(CacheLimits {
            max_recent: 0,
            max_requested: 1,
            max_searched: 1,
        });
        assert_eq!(cache.upsert(rec(1), CacheTier::Recent), None);
        assert_eq!(cache.len(CacheTier::Recent), 0);
    }

    #[test]
    fn test_concurrent_upserts_keep_invariants() {
        let cache = std::sync::Arc::new(small());
        let pool: std::sync::Arc<Vec<_>> = std::sync::Arc::new((0..8).map(rec).collect());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for i in 0..250usize {
                        let r = &pool[(i + t) % pool.len()];
                        r.write().last_updated = at((i * 4 + t) as i64 + 1);
                        cache.upsert(r.clone(), CacheTier::ALL[(i + t) % 4]);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        cache.check_invariants().unwrap();
    }

    #[test]
    fn test_get_or_insert_with_shares_existing_handle() {
        let cache = small();
        let first = rec(1);
        let id = id_of(&first);
        let (held, inserted) = cache.get_or_insert_with(&id, CacheTier::Requested, || first.clone());
        assert!(inserted);
        assert!(std::sync::Arc::ptr_eq(&held, &first));

        let (again, inserted) = cache.get_or_insert_with(&id, CacheTier::Running, || panic!("must not build"));
        assert!(!inserted);
        assert!(std::sync::Arc::ptr_eq(&again, &first));
        assert_eq!(cache.get(&id).unwrap().1, CacheTier::Requested);
    }

    #[test]
    fn test_concurrent_get_or_insert_builds_one_record() {
        let cache = std::sync::Arc::new(small());
        let id = id_of(&rec(7));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let id = id.clone();
                std::thread::spawn(move || cache.get_or_insert_with(&id, CacheTier::Requested, || rec(7)).0)
            })
            .collect();
        let held: Vec<SharedRecord> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let (cached, _) = cache.get(&id).unwrap();
        assert!(held.iter().all(|r| std::sync::Arc::ptr_eq(r, &cached)));
        cache.check_invariants().unwrap();
    }
}
