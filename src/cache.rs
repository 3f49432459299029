use std::sync::RwLock;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;
use rustc_hash::FxHashMap;

struct CacheEntry {
    msg: Message,
    expires_at: Instant,
}

struct Inner {
    entries: FxHashMap<String, CacheEntry>,
    max_size: usize,
    ttl: Duration,
}

/// Bounded response cache keyed by the query key. Lookups take the shared
/// lock and hand out deep copies with the caller's transaction id; expired
/// entries are treated as misses and reaped lazily. A `max_size` of zero
/// disables storing entirely.
pub struct ResponseCache {
    inner: RwLock<Inner>,
}

impl ResponseCache {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                entries: FxHashMap::default(),
                max_size,
                ttl,
            }),
        }
    }

    pub fn lookup(&self, key: &str, client_tx_id: u16) -> Option<Message> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let entry = inner.entries.get(key)?;
        if Instant::now() >= entry.expires_at {
            return None;
        }
        let mut msg = entry.msg.clone();
        msg.set_id(client_tx_id);
        Some(msg)
    }

    pub fn store(&self, key: &str, msg: &Message) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.max_size == 0 {
            return;
        }
        if !inner.entries.contains_key(key) && inner.entries.len() >= inner.max_size {
            evict_one(&mut inner.entries);
        }
        let expires_at = Instant::now() + inner.ttl;
        inner.entries.insert(
            key.to_string(),
            CacheEntry {
                msg: msg.clone(),
                expires_at,
            },
        );
    }

    /// Applied on reload; shrinks the map if the new bound is tighter.
    pub fn configure(&self, max_size: usize, ttl: Duration) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.max_size = max_size;
        inner.ttl = ttl;
        while inner.entries.len() > inner.max_size {
            evict_one(&mut inner.entries);
        }
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.entries.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Prefer an expired entry; otherwise the victim is whichever entry map
/// iteration yields first. Callers must not rely on the choice.
fn evict_one(entries: &mut FxHashMap<String, CacheEntry>) {
    let now = Instant::now();
    let victim = entries
        .iter()
        .find(|(_, entry)| entry.expires_at <= now)
        .map(|(key, _)| key.clone())
        .or_else(|| entries.keys().next().cloned());
    if let Some(key) = victim {
        entries.remove(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, RData, Record};
    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn response(id: u16, owner: &str, ip: Ipv4Addr) -> Message {
        let mut msg = Message::new();
        msg.set_id(id);
        msg.add_answer(Record::from_rdata(
            Name::from_str(owner).unwrap(),
            300,
            RData::A(A(ip)),
        ));
        msg
    }

    #[test]
    fn round_trip_rewrites_transaction_id() {
        let cache = ResponseCache::new(16, Duration::from_secs(60));
        let stored = response(0x1111, "example.com.", Ipv4Addr::new(1, 2, 3, 4));
        cache.store("example.com|1|1", &stored);

        let hit = cache.lookup("example.com|1|1", 0x2222).expect("hit");
        assert_eq!(hit.id(), 0x2222);
        assert_eq!(hit.answers(), stored.answers());
    }

    #[test]
    fn miss_on_unknown_key() {
        let cache = ResponseCache::new(16, Duration::from_secs(60));
        assert!(cache.lookup("nope|1|1", 1).is_none());
    }

    #[test]
    fn expired_entries_are_misses() {
        let cache = ResponseCache::new(16, Duration::from_millis(20));
        let msg = response(1, "example.com.", Ipv4Addr::new(1, 2, 3, 4));
        cache.store("k|1|1", &msg);
        assert!(cache.lookup("k|1|1", 1).is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.lookup("k|1|1", 1).is_none());
    }

    #[test]
    fn entry_count_never_exceeds_max() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        for i in 0..10u16 {
            let msg = response(i, "example.com.", Ipv4Addr::new(1, 2, 3, 4));
            cache.store(&format!("key-{i}"), &msg);
            assert!(cache.len() <= 2);
        }
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn store_overwrites_existing_key_without_eviction() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        let msg = response(1, "example.com.", Ipv4Addr::new(1, 2, 3, 4));
        cache.store("a", &msg);
        cache.store("b", &msg);
        cache.store("a", &msg);
        assert_eq!(cache.len(), 2);
        assert!(cache.lookup("a", 9).is_some());
        assert!(cache.lookup("b", 9).is_some());
    }

    #[test]
    fn zero_capacity_disables_storing() {
        let cache = ResponseCache::new(0, Duration::from_secs(60));
        let msg = response(1, "example.com.", Ipv4Addr::new(1, 2, 3, 4));
        cache.store("a", &msg);
        assert!(cache.is_empty());
        assert!(cache.lookup("a", 1).is_none());
    }

    #[test]
    fn configure_shrinks_to_new_bound() {
        let cache = ResponseCache::new(8, Duration::from_secs(60));
        let msg = response(1, "example.com.", Ipv4Addr::new(1, 2, 3, 4));
        for i in 0..8 {
            cache.store(&format!("key-{i}"), &msg);
        }
        cache.configure(3, Duration::from_secs(60));
        assert!(cache.len() <= 3);
    }

    #[test]
    fn stored_message_is_a_deep_copy() {
        let cache = ResponseCache::new(4, Duration::from_secs(60));
        let mut msg = response(1, "example.com.", Ipv4Addr::new(1, 2, 3, 4));
        cache.store("a", &msg);
        // Mutating the original after store must not affect the cached copy.
        msg.take_answers();
        let hit = cache.lookup("a", 1).expect("hit");
        assert_eq!(hit.answers().len(), 1);
    }
}
