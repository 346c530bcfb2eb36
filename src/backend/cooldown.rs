//! Login suppression after provisioning
//!
//! A terminal that just enrolled a fingerprint tends to report the same finger as
//! a login moments later. Uids added through ADD_USER are held here for a while and
//! their logins ignored.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct CooldownTable {
    window: Duration,
    records: Mutex<HashMap<u32, Instant>>,
}

impl CooldownTable {
    pub fn new(window: Duration) -> Self {
        Self { window, records: Mutex::new(HashMap::new()) }
    }

    pub fn add(&self, uid: u32, now: Instant) {
        self.records.lock().insert(uid, now);
    }

    /// Whether `uid` is still inside its window. Expired records are purged.
    pub fn is_cooling(&self, uid: u32, now: Instant) -> bool {
        let mut records = self.records.lock();
        records.retain(|_, added| now.saturating_duration_since(*added) < self.window);
        records.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}
