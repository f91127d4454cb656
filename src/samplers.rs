//! Sampler option records.
//!
//! Exporters announce their sampling parameters through option records.
//! Those records are cached here and used to decorate later data records
//! that reference the same sampler id.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Identity of a sampler announcement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SamplerKey {
    pub host: Option<String>,
    pub domain: u32,
    pub sampler_id: u64,
}

/// Sampling parameters carried by a sampler option record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampler {
    pub mode: u64,
    pub random_interval: u64,
}

/// Time-expiring cache of sampler announcements, same mechanics as the
/// template registry: swept on every write, filtered on read.
pub struct SamplerTable {
    ttl: Duration,
    inner: Mutex<HashMap<SamplerKey, (Sampler, Instant)>>,
}

impl SamplerTable {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: SamplerKey, sampler: Sampler) {
        self.insert_at(Instant::now(), key, sampler)
    }

    pub(crate) fn insert_at(&self, now: Instant, key: SamplerKey, sampler: Sampler) {
        let mut guard = self.inner.lock().unwrap();
        guard.retain(|_, (_, expires_at)| *expires_at > now);
        guard.insert(key, (sampler, now + self.ttl));
    }

    pub fn get(&self, key: &SamplerKey) -> Option<Sampler> {
        self.get_at(Instant::now(), key)
    }

    pub(crate) fn get_at(&self, now: Instant, key: &SamplerKey) -> Option<Sampler> {
        let guard = self.inner.lock().unwrap();
        guard
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(sampler, _)| *sampler)
    }
}
