//! Bounded TTL cache for rendered prompt plans.
//!
//! Keys combine the library fingerprint and the request hash, so any
//! catalog or request change misses naturally. A cached plan is only
//! served when it was built for the same target token budget; a changed
//! budget forces a re-render.

use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::PromptPlan;

struct CachedPlan {
    plan: PromptPlan,
    built_at: Instant,
    built_for_target: u32,
}

pub struct PlanCache {
    entries: DashMap<String, CachedPlan>,
    capacity: usize,
    ttl: Duration,
}

impl PlanCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Fetch a live entry built for `current_target` tokens.
    pub fn get(&self, key: &str, current_target: u32) -> Option<PromptPlan> {
        let entry = self.entries.get(key)?;
        if Instant::now().saturating_duration_since(entry.built_at) >= self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        if entry.built_for_target != current_target {
            return None;
        }
        Some(entry.plan.clone())
    }

    pub fn insert(&self, key: &str, plan: PromptPlan, built_for_target: u32) {
        self.evict_for_capacity();
        self.entries.insert(
            key.to_string(),
            CachedPlan {
                plan,
                built_at: Instant::now(),
                built_for_target,
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop expired entries; if still at capacity, drop the oldest.
    fn evict_for_capacity(&self) {
        if self.entries.len() < self.capacity {
            return;
        }
        let now = Instant::now();
        self.entries
            .retain(|_, cached| now.saturating_duration_since(cached.built_at) < self.ttl);
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.built_at)
                .map(|e| e.key().clone());
            match oldest {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}
