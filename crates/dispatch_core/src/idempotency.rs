//! Idempotent ride requests: a typed TTL cache keyed by rider and request
//! fingerprint.
//!
//! The key is the client-supplied idempotency key verbatim when present,
//! otherwise a SHA-256 fingerprint of (rider, pickup, destination, vehicle).
//! Writes are compare-and-set: the first writer wins and a losing writer
//! reads the winner's stored result. Entries expire after one hour.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::clock::{SharedClock, ONE_HOUR_MS};
use crate::model::{RiderId, VehicleType};

/// Cache key for one logical ride request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
    /// Client-supplied key, used verbatim (scoped per rider so one client
    /// cannot collide with another's key space).
    pub fn client(rider: &RiderId, key: &str) -> Self {
        Self(format!("{}:{}", rider.0, key))
    }

    /// Content fingerprint of the request.
    pub fn fingerprint(
        rider: &RiderId,
        pickup: &str,
        destination: &str,
        vehicle: VehicleType,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(rider.0.as_bytes());
        hasher.update([0]);
        hasher.update(pickup.as_bytes());
        hasher.update([0]);
        hasher.update(destination.as_bytes());
        hasher.update([0]);
        hasher.update(vehicle.as_str().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }
}

struct Entry<V> {
    value: V,
    stored_at_ms: i64,
}

/// In-process idempotency map with TTL and compare-and-set insertion.
pub struct IdempotencyCache<V> {
    entries: Mutex<LruCache<RequestKey, Entry<V>>>,
    ttl_ms: i64,
    clock: SharedClock,
}

impl<V: Clone> IdempotencyCache<V> {
    pub fn new(capacity: usize, ttl_ms: i64, clock: SharedClock) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("max(1) is non-zero");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl_ms,
            clock,
        }
    }

    /// One-hour TTL cache with a roomy default capacity.
    pub fn hourly(clock: SharedClock) -> Self {
        Self::new(10_000, ONE_HOUR_MS, clock)
    }

    /// Stored value for `key` if present and not expired.
    pub fn lookup(&self, key: &RequestKey) -> Option<V> {
        let now = self.clock.now_ms();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if now - entry.stored_at_ms < self.ttl_ms => Some(entry.value.clone()),
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    /// Compare-and-set insert. Returns the winning value: `value` when this
    /// writer won the slot, the earlier writer's value otherwise.
    pub fn store(&self, key: RequestKey, value: V) -> V {
        let now = self.clock.now_ms();
        let mut entries = self.lock();
        if let Some(existing) = entries.get(&key) {
            if now - existing.stored_at_ms < self.ttl_ms {
                return existing.value.clone();
            }
        }
        entries.put(
            key,
            Entry {
                value: value.clone(),
                stored_at_ms: now,
            },
        );
        value
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<RequestKey, Entry<V>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ManualClock;
    use std::sync::Arc;

    fn rider() -> RiderId {
        RiderId("r-1".into())
    }

    #[test]
    fn fingerprint_is_stable_and_rider_scoped() {
        let a = RequestKey::fingerprint(&rider(), "52.5,13.4", "52.6,13.5", VehicleType::Car);
        let b = RequestKey::fingerprint(&rider(), "52.5,13.4", "52.6,13.5", VehicleType::Car);
        assert_eq!(a, b);

        let other_rider =
            RequestKey::fingerprint(&RiderId("r-2".into()), "52.5,13.4", "52.6,13.5", VehicleType::Car);
        assert_ne!(a, other_rider);

        let other_vehicle =
            RequestKey::fingerprint(&rider(), "52.5,13.4", "52.6,13.5", VehicleType::Auto);
        assert_ne!(a, other_vehicle);
    }

    #[test]
    fn client_key_is_used_verbatim_per_rider() {
        let a = RequestKey::client(&rider(), "booking-77");
        let b = RequestKey::client(&rider(), "booking-77");
        let c = RequestKey::client(&RiderId("r-2".into()), "booking-77");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn first_writer_wins_cas() {
        let clock = Arc::new(ManualClock::at(1_000));
        let cache: IdempotencyCache<u32> = IdempotencyCache::hourly(clock);
        let key = RequestKey::client(&rider(), "k");
        assert_eq!(cache.store(key.clone(), 1), 1);
        // Losing writer reads the winner's result.
        assert_eq!(cache.store(key.clone(), 2), 1);
        assert_eq!(cache.lookup(&key), Some(1));
    }

    #[test]
    fn entries_expire_after_ttl() {
        let clock = Arc::new(ManualClock::at(0));
        let cache: IdempotencyCache<u32> = IdempotencyCache::new(16, ONE_HOUR_MS, clock.clone());
        let key = RequestKey::client(&rider(), "k");
        cache.store(key.clone(), 7);

        clock.advance(ONE_HOUR_MS - 1);
        assert_eq!(cache.lookup(&key), Some(7));

        clock.advance(2);
        assert_eq!(cache.lookup(&key), None);
        // The slot is free again for a new writer.
        assert_eq!(cache.store(key.clone(), 9), 9);
    }
}
