//! Process-wide counter registries.
//!
//! Statistics, analytics and blacklist counters are shared by every site
//! and by the proxy front-end. Increments are atomic; no ordering between
//! requests is guaranteed or needed.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};

/// Process-wide registry singleton.
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

/// Concurrent counters: flat statistics, namespaced analytics, per-IP
/// blacklist.
pub struct Registry {
    statistics: DashMap<String, u64>,
    analytics: DashMap<String, DashMap<String, u64>>,
    blacklist: DashMap<String, u64>,
    started_at: i64,
}

impl Registry {
    fn new() -> Self {
        Self {
            statistics: DashMap::new(),
            analytics: DashMap::new(),
            blacklist: DashMap::new(),
            started_at: chrono::Utc::now().timestamp(),
        }
    }

    /// Increment a flat statistic (`served`, `probes`, `errors`, …).
    pub fn bump_stat(&self, name: &str) {
        *self.statistics.entry(name.to_string()).or_insert(0) += 1;
    }

    /// Increment a counter in an analytics namespace (`ip`, `page`, `user`).
    pub fn bump_analytics(&self, namespace: &str, key: &str) {
        *self
            .analytics
            .entry(namespace.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    /// Increment the per-IP blacklist counter.
    pub fn bump_blacklist(&self, ip: &str) {
        *self.blacklist.entry(ip.to_string()).or_insert(0) += 1;
    }

    pub fn stat(&self, name: &str) -> u64 {
        self.statistics.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn started_at(&self) -> i64 {
        self.started_at
    }

    /// Snapshot of all statistics, plus process start time.
    pub fn statistics_snapshot(&self) -> Value {
        let mut out = Map::new();
        out.insert("start".into(), json!(self.started_at));
        for entry in self.statistics.iter() {
            out.insert(entry.key().clone(), json!(*entry.value()));
        }
        Value::Object(out)
    }

    pub fn analytics_snapshot(&self) -> Value {
        let mut out = Map::new();
        for ns in self.analytics.iter() {
            let mut inner = Map::new();
            for entry in ns.value().iter() {
                inner.insert(entry.key().clone(), json!(*entry.value()));
            }
            out.insert(ns.key().clone(), Value::Object(inner));
        }
        Value::Object(out)
    }

    pub fn blacklist_snapshot(&self) -> Value {
        let mut out = Map::new();
        for entry in self.blacklist.iter() {
            out.insert(entry.key().clone(), json!(*entry.value()));
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let reg = Registry::new();
        reg.bump_stat("served");
        reg.bump_stat("served");
        reg.bump_stat("errors");
        assert_eq!(reg.stat("served"), 2);
        assert_eq!(reg.stat("errors"), 1);
        assert_eq!(reg.stat("missing"), 0);
    }

    #[test]
    fn analytics_are_namespaced() {
        let reg = Registry::new();
        reg.bump_analytics("ip", "10.0.0.1");
        reg.bump_analytics("ip", "10.0.0.1");
        reg.bump_analytics("page", "/index.html");

        let snap = reg.analytics_snapshot();
        assert_eq!(snap["ip"]["10.0.0.1"], 2);
        assert_eq!(snap["page"]["/index.html"], 1);
    }

    #[test]
    fn statistics_snapshot_includes_start() {
        let reg = Registry::new();
        reg.bump_stat("probes");
        let snap = reg.statistics_snapshot();
        assert!(snap["start"].as_i64().unwrap() > 0);
        assert_eq!(snap["probes"], 1);
    }
}
