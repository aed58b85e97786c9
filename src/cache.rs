use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// In-process key/value store with per-entry TTL. Holds ephemeral artifacts
/// only (OTP hashes, cooldown markers); nothing here survives a restart.
#[derive(Default)]
pub struct Cache {
    entries: DashMap<String, Entry>,
}

#[derive(Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

impl Cache {
    pub fn new() -> Arc<Self> {
        Arc::new(Cache::default())
    }

    pub fn put(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Single-use read: the entry is removed whether or not it expired.
    pub fn take(&self, key: &str) -> Option<String> {
        let (_, entry) = self.entries.remove(key)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.value)
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn sweep(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                cache.sweep();
            }
        });
    }
}
