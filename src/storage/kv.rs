//! Key-value client abstraction for the TTL store.
//!
//! `KvClient` covers the handful of commands the TTL store needs: expiring
//! string values plus one sorted set used as a time index. Every call is an
//! atomic single-key operation. `MemoryKv` is the in-process engine; a
//! networked client implements the same trait.

use crate::utils::clock::Clock;
use crate::utils::error::StoreError;
use chrono::{DateTime, Duration, Utc};
use log::debug;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Commands used by the TTL store
pub trait KvClient: Send + Sync {
    /// Set `key` to `value`, expiring after `ttl`
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn del(&self, key: &str) -> Result<bool, StoreError>;

    /// Add or rescore a sorted-set member
    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;

    fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Members ranked by descending score, ranks `start..=stop`
    fn zrevrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError>;

    /// Members with `min <= score <= max`, ascending, with their scores
    fn zrangebyscore(&self, key: &str, min: f64, max: f64)
        -> Result<Vec<(String, f64)>, StoreError>;

    fn zcard(&self, key: &str) -> Result<usize, StoreError>;

    /// Drop every value past its expiry
    ///
    /// # Returns
    /// Number of values dropped
    fn evict_expired(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Default)]
struct KvState {
    values: HashMap<String, (String, DateTime<Utc>)>,
    sorted_sets: HashMap<String, HashMap<String, f64>>,
}

/// In-process key-value engine with expiring values
///
/// Expired values are evicted when read, or in bulk by `evict_expired`.
pub struct MemoryKv {
    state: Mutex<KvState>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(KvState::default()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    /// Number of values held, expired or not
    pub fn len(&self) -> usize {
        self.state.lock().map_or(0, |state| state.values.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Simulate losing (or regaining) the connection
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn state(&self) -> Result<MutexGuard<'_, KvState>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::BackendUnavailable(
                "key-value connection down".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| StoreError::BackendUnavailable("key-value state poisoned".to_string()))
    }

    fn sorted(set: &HashMap<String, f64>) -> Vec<(&String, f64)> {
        let mut members: Vec<(&String, f64)> = set.iter().map(|(m, s)| (m, *s)).collect();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        members
    }
}

impl KvClient for MemoryKv {
    fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut state = self.state()?;
        state
            .values
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let Some((value, expires_at)) = state.values.get(key) else {
            return Ok(None);
        };
        if *expires_at > now {
            return Ok(Some(value.clone()));
        }
        debug!("[profiler] Evicting expired key {}", key);
        state.values.remove(key);
        Ok(None)
    }

    fn del(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.state()?.values.remove(key).is_some())
    }

    fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        self.state()?
            .sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut state = self.state()?;
        Ok(state
            .sorted_sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member).is_some()))
    }

    fn zrevrange(&self, key: &str, start: usize, stop: usize) -> Result<Vec<String>, StoreError> {
        let state = self.state()?;
        let Some(set) = state.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        if stop < start {
            return Ok(Vec::new());
        }
        Ok(Self::sorted(set)
            .into_iter()
            .rev()
            .skip(start)
            .take(stop - start + 1)
            .map(|(member, _)| member.clone())
            .collect())
    }

    fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<Vec<(String, f64)>, StoreError> {
        let state = self.state()?;
        let Some(set) = state.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };
        Ok(Self::sorted(set)
            .into_iter()
            .filter(|(_, score)| *score >= min && *score <= max)
            .map(|(member, score)| (member.clone(), score))
            .collect())
    }

    fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        Ok(self.state()?.sorted_sets.get(key).map_or(0, HashMap::len))
    }

    fn evict_expired(&self) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.state()?;
        let before = state.values.len();
        state.values.retain(|_, (_, expires_at)| *expires_at > now);
        let evicted = before - state.values.len();
        if evicted > 0 {
            debug!("[profiler] Evicted {} expired keys", evicted);
        }
        Ok(evicted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::clock::ManualClock;
    use chrono::TimeZone;

    fn kv() -> (MemoryKv, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        (MemoryKv::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_values_expire() {
        let (kv, clock) = kv();
        kv.set_ex("k", "v", Duration::seconds(10)).unwrap();
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v"));

        clock.advance(Duration::seconds(10));
        assert_eq!(kv.get("k").unwrap(), None);
    }

    #[test]
    fn test_evict_expired_sweeps_unread_values() {
        let (kv, clock) = kv();
        kv.set_ex("short", "v", Duration::seconds(10)).unwrap();
        kv.set_ex("long", "v", Duration::seconds(60)).unwrap();

        clock.advance(Duration::seconds(30));
        assert_eq!(kv.len(), 2);
        assert_eq!(kv.evict_expired().unwrap(), 1);
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get("long").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_expiry_past_calendar_end_never_expires() {
        let (kv, clock) = kv();
        kv.set_ex("k", "v", Duration::MAX).unwrap();

        clock.advance(Duration::days(365 * 1000));
        assert_eq!(kv.evict_expired().unwrap(), 0);
        assert_eq!(kv.get("k").unwrap().as_deref(), Some("v"));
    }

    #[test]
    fn test_sorted_set_ranges() {
        let (kv, _clock) = kv();
        kv.zadd("idx", 3.0, "c").unwrap();
        kv.zadd("idx", 1.0, "a").unwrap();
        kv.zadd("idx", 2.0, "b").unwrap();
        kv.zadd("idx", 4.0, "a").unwrap();

        assert_eq!(kv.zcard("idx").unwrap(), 3);
        assert_eq!(kv.zrevrange("idx", 0, 1).unwrap(), vec!["a", "c"]);
        assert_eq!(kv.zrevrange("idx", 2, 10).unwrap(), vec!["b"]);
        assert_eq!(
            kv.zrangebyscore("idx", 2.0, 3.0).unwrap(),
            vec![("b".to_string(), 2.0), ("c".to_string(), 3.0)]
        );
        assert!(kv.zrem("idx", "b").unwrap());
        assert!(!kv.zrem("idx", "b").unwrap());
    }

    #[test]
    fn test_unavailable_errors() {
        let (kv, _clock) = kv();
        kv.set_available(false);
        assert!(matches!(
            kv.get("k"),
            Err(StoreError::BackendUnavailable(_))
        ));
        kv.set_available(true);
        assert!(kv.get("k").unwrap().is_none());
    }
}
