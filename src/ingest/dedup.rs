use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

/// Short-lived memory of recently ingested record keys
///
/// Pollers deliver at least once, so a retried call carries content that was
/// already counted. Keys are remembered for `ttl` and the set never holds more
/// than `capacity` keys; the oldest are forgotten first.
#[derive(Debug)]
pub struct SeenSet {
    ttl: Duration,
    capacity: usize,
    /// Insertion order, used for expiry
    order: VecDeque<(DateTime<Utc>, String)>,
    /// Key to the time it was inserted; holds exactly the keys in `order`
    seen: HashMap<String, DateTime<Utc>>,
}

impl SeenSet {
    /// Create a seen-set
    ///
    /// # Arguments
    ///
    /// * `ttl` - How long a key is remembered
    /// * `capacity` - Maximum number of keys held at once
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            order: VecDeque::new(),
            seen: HashMap::new(),
        }
    }

    /// Remember `key` at `now`
    ///
    /// # Returns
    ///
    /// `true` if the key was not already remembered, `false` for a duplicate
    pub fn insert_at(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        self.expire(now);
        if self.seen.contains_key(key) {
            return false;
        }

        self.order.push_back((now, key.to_string()));
        self.seen.insert(key.to_string(), now);
        while self.seen.len() > self.capacity {
            self.pop_oldest();
        }
        true
    }

    pub fn insert(&mut self, key: &str) -> bool {
        self.insert_at(key, Utc::now())
    }

    /// Forget a key so the same content can be ingested again
    pub fn forget(&mut self, key: &str) {
        if self.seen.remove(key).is_some() {
            self.order.retain(|(_, k)| k != key);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.ttl;
        while let Some((inserted, _)) = self.order.front() {
            if *inserted > cutoff {
                break;
            }
            self.pop_oldest();
        }
    }

    fn pop_oldest(&mut self) {
        if let Some((_, key)) = self.order.pop_front() {
            self.seen.remove(&key);
        }
    }
}
