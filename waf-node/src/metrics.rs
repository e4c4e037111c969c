use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Aggregate counters for the firewall.
///
/// Rule hits take many small concurrent increments and live in a lock-free
/// map of atomics; the snapshot-style counters share one mutex. A snapshot
/// is not atomic across the two groups.
#[derive(Debug, Default)]
pub struct WafMetrics {
    /// Per-rule hit counters
    rule_hits: DashMap<String, AtomicU64>,
    /// Mutex-guarded snapshot counters
    core: Mutex<CoreCounters>,
}

#[derive(Debug, Default)]
struct CoreCounters {
    total_requests: u64,
    blocked_requests: u64,
    allowed_requests: u64,
    rule_hits_by_phase: HashMap<u8, u64>,
    geoip_stats: HashMap<String, u64>,
}

/// Point-in-time view served by the metrics endpoint
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub allowed_requests: u64,
    pub rule_hits: HashMap<String, u64>,
    pub rule_hits_by_phase: HashMap<u8, u64>,
    pub geoip_stats: HashMap<String, u64>,
}

impl WafMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn core(&self) -> std::sync::MutexGuard<'_, CoreCounters> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn record_request(&self) {
        self.core().total_requests += 1;
    }

    pub fn record_blocked(&self) {
        self.core().blocked_requests += 1;
    }

    pub fn record_allowed(&self) {
        self.core().allowed_requests += 1;
    }

    /// Bump the per-rule counter and the per-phase counter for one match.
    pub fn record_rule_hit(&self, rule_id: &str, phase: u8) {
        self.rule_hits
            .entry(rule_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let mut core = self.core();
        *core.rule_hits_by_phase.entry(phase).or_insert(0) += 1;
    }

    /// Bump the per-country counter; called on every lookup regardless of
    /// the filter outcome.
    pub fn record_country(&self, country: &str) {
        let mut core = self.core();
        *core.geoip_stats.entry(country.to_string()).or_insert(0) += 1;
    }

    pub fn rule_hit_count(&self, rule_id: &str) -> u64 {
        self.rule_hits
            .get(rule_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let core = self.core();
        MetricsSnapshot {
            total_requests: core.total_requests,
            blocked_requests: core.blocked_requests,
            allowed_requests: core.allowed_requests,
            rule_hits: self
                .rule_hits
                .iter()
                .map(|e| (e.key().clone(), e.value().load(Ordering::Relaxed)))
                .collect(),
            rule_hits_by_phase: core.rule_hits_by_phase.clone(),
            geoip_stats: core.geoip_stats.clone(),
        }
    }
}
