//! Dashboard query facade: composes aggregator outputs behind a
//! short-lived cache that absorbs dashboard polling.

use astro_core::config::DashboardConfig;
use astro_core::error::{AstroError, AstroResult};
use astro_core::types::{
    ABTestResult, CohortFilter, CohortPeriod, FunnelDefinition, FunnelSnapshot, RetentionReport,
    TimeWindow,
};
use astro_experiments::ResultAggregator;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::time::Instant;
use tracing::debug;

use crate::funnel::FunnelAnalyzer;
use crate::retention::RetentionAnalyzer;

#[derive(Clone)]
enum CachedValue {
    AbTest(ABTestResult),
    Funnel(FunnelSnapshot),
    Retention(RetentionReport),
}

struct CacheEntry {
    value: CachedValue,
    inserted_at: Instant,
}

/// TTL cache for expensive aggregate queries. Entries expire by TTL
/// only; there is no invalidation on new events.
pub struct QueryCache {
    store: DashMap<String, CacheEntry>,
    ttl: std::time::Duration,
    max_entries: usize,
}

impl QueryCache {
    pub fn new(ttl_secs: u64, max_entries: usize) -> Self {
        Self {
            store: DashMap::with_capacity(max_entries),
            ttl: std::time::Duration::from_secs(ttl_secs),
            max_entries,
        }
    }

    fn get(&self, key: &str) -> Option<CachedValue> {
        let entry = self.store.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry);
            self.store.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    fn put(&self, key: String, value: CachedValue) {
        // Simple eviction: if over capacity, skip insert (expired entries
        // free slots on read or via evict_expired).
        if self.store.len() >= self.max_entries && !self.store.contains_key(&key) {
            return;
        }
        self.store.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Remove expired entries. Call periodically from a background task.
    pub fn evict_expired(&self) -> usize {
        let before = self.store.len();
        self.store
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
        before - self.store.len()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Read-only facade consumed by the presentation layer.
pub struct DashboardService {
    results: ResultAggregator,
    funnels: FunnelAnalyzer,
    retention: RetentionAnalyzer,
    definitions: DashMap<String, FunnelDefinition>,
    cache: QueryCache,
    ttl_secs: u64,
    default_window_days: i64,
}

impl DashboardService {
    pub fn new(
        results: ResultAggregator,
        funnels: FunnelAnalyzer,
        retention: RetentionAnalyzer,
        config: &DashboardConfig,
    ) -> Self {
        Self {
            results,
            funnels,
            retention,
            definitions: DashMap::new(),
            cache: QueryCache::new(config.cache_ttl_secs, config.cache_max_entries),
            ttl_secs: config.cache_ttl_secs,
            default_window_days: config.default_window_days,
        }
    }

    pub fn register_funnel(&self, definition: FunnelDefinition) {
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn list_funnels(&self) -> Vec<FunnelDefinition> {
        self.definitions.iter().map(|d| d.value().clone()).collect()
    }

    pub fn get_ab_test_results(
        &self,
        experiment_key: &str,
        window: Option<TimeWindow>,
    ) -> AstroResult<ABTestResult> {
        let window = self.resolve_window(window);
        let key = format!(
            "abtest:{experiment_key}:{}",
            window_bucket(&window, self.ttl_secs)
        );

        if let Some(CachedValue::AbTest(cached)) = self.cache.get(&key) {
            metrics::counter!("dashboard.cache_hits").increment(1);
            return Ok(cached);
        }
        metrics::counter!("dashboard.cache_misses").increment(1);
        debug!(experiment_key, "A/B result cache miss, recomputing");

        let result = self.results.compute_result(experiment_key, &window)?;
        self.cache.put(key, CachedValue::AbTest(result.clone()));
        Ok(result)
    }

    pub fn get_funnel_snapshot(
        &self,
        name: &str,
        cohort: Option<CohortFilter>,
        window: Option<TimeWindow>,
    ) -> AstroResult<FunnelSnapshot> {
        let definition = self
            .definitions
            .get(name)
            .map(|d| d.clone())
            .ok_or_else(|| AstroError::FunnelNotFound(name.to_string()))?;
        let cohort = cohort.unwrap_or_default();
        let window = self.resolve_window(window);
        let key = format!(
            "funnel:{name}:{}:{}",
            serde_json::to_string(&cohort)?,
            window_bucket(&window, self.ttl_secs),
        );

        if let Some(CachedValue::Funnel(cached)) = self.cache.get(&key) {
            metrics::counter!("dashboard.cache_hits").increment(1);
            return Ok(cached);
        }
        metrics::counter!("dashboard.cache_misses").increment(1);
        debug!(funnel = name, "Funnel snapshot cache miss, recomputing");

        let snapshot = self.funnels.compute_funnel(&definition, &cohort, &window)?;
        self.cache.put(key, CachedValue::Funnel(snapshot.clone()));
        Ok(snapshot)
    }

    pub fn get_retention_report(
        &self,
        period: CohortPeriod,
        num_periods: u32,
        window: Option<TimeWindow>,
    ) -> AstroResult<RetentionReport> {
        let window = self.resolve_window(window);
        let key = format!(
            "retention:{}:{num_periods}:{}",
            serde_json::to_string(&period)?,
            window_bucket(&window, self.ttl_secs),
        );

        if let Some(CachedValue::Retention(cached)) = self.cache.get(&key) {
            metrics::counter!("dashboard.cache_hits").increment(1);
            return Ok(cached);
        }
        metrics::counter!("dashboard.cache_misses").increment(1);

        let report = self
            .retention
            .compute_retention(period, num_periods, &window)?;
        self.cache.put(key, CachedValue::Retention(report.clone()));
        Ok(report)
    }

    /// Default to a trailing window whose end is aligned to the cache
    /// TTL, so repeated polls inside one TTL share a cache bucket.
    fn resolve_window(&self, window: Option<TimeWindow>) -> TimeWindow {
        window.unwrap_or_else(|| {
            let ttl = self.ttl_secs.max(1) as i64;
            let now_ts = Utc::now().timestamp();
            let aligned = now_ts - now_ts.rem_euclid(ttl);
            let end = DateTime::from_timestamp(aligned, 0).unwrap_or_else(Utc::now);
            TimeWindow::new(end - Duration::days(self.default_window_days), end)
        })
    }
}

fn window_bucket(window: &TimeWindow, ttl_secs: u64) -> String {
    let ttl = ttl_secs.max(1) as i64;
    format!(
        "{}:{}",
        window.start.timestamp() / ttl,
        window.end.timestamp() / ttl
    )
}
