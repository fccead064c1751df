use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// The kind of value a [`Datapoint`] carries. `Gauge` values are shipped
/// as-is; `Counter` values are converted to a per-second rate by
/// [`CounterCache`] before shipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatapointKind {
    Gauge,
    Counter,
}

/// An immutable sample produced by a sampler. `name` is a dotted metric
/// path; `ts` is an optional override of the tick timestamp (used by
/// samplers, like cron job events, that know the real event time).
#[derive(Debug, Clone)]
pub struct Datapoint {
    pub name: String,
    pub kind: DatapointKind,
    pub raw_value: f64,
    pub ts: Option<i64>,
}

impl Datapoint {
    pub fn gauge(name: impl Into<String>, raw_value: f64) -> Self {
        Self {
            name: name.into(),
            kind: DatapointKind::Gauge,
            raw_value,
            ts: None,
        }
    }

    pub fn counter(name: impl Into<String>, raw_value: f64) -> Self {
        Self {
            name: name.into(),
            kind: DatapointKind::Counter,
            raw_value,
            ts: None,
        }
    }

    pub fn with_ts(mut self, ts: i64) -> Self {
        self.ts = Some(ts);
        self
    }
}

pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

struct CounterCacheInner {
    entries: HashMap<String, (f64, i64)>,
    next_sweep: i64,
    ttl_secs: i64,
    sweep_interval_secs: i64,
}

/// Process-wide mapping from metric name to `(last_raw_value, last_ts)`,
/// converting monotonically increasing counters into per-second rates.
/// Shared across all samplers; see spec §3 for the eviction policy.
pub struct CounterCache {
    inner: Mutex<CounterCacheInner>,
}

impl CounterCache {
    pub fn new(ttl_secs: u64, sweep_divisor: u64) -> Self {
        let ttl_secs = ttl_secs as i64;
        let sweep_divisor = sweep_divisor.max(1) as i64;
        Self {
            inner: Mutex::new(CounterCacheInner {
                entries: HashMap::new(),
                next_sweep: 0,
                ttl_secs,
                sweep_interval_secs: ttl_secs / sweep_divisor,
            }),
        }
    }

    /// Resolve a datapoint to a shipped `(name, value, ts)` tuple, or
    /// `None` if nothing should be emitted this round (first counter
    /// observation, counter reset/overflow, or a non-finite result).
    pub fn resolve(&self, dp: &Datapoint, fallback_ts: Option<i64>) -> Option<(String, f64, i64)> {
        let ts = dp.ts.or(fallback_ts).unwrap_or_else(now_epoch);
        match dp.kind {
            DatapointKind::Gauge => {
                if dp.raw_value.is_finite() {
                    Some((dp.name.clone(), dp.raw_value, ts))
                } else {
                    None
                }
            }
            DatapointKind::Counter => {
                let mut inner = self.inner.lock().unwrap();
                maybe_sweep(&mut inner, ts);
                let prev = inner.entries.insert(dp.name.clone(), (dp.raw_value, ts));
                match prev {
                    None => {
                        log::debug!("initializing counter bucket: {}", dp.name);
                        None
                    }
                    Some((v0, ts0)) => {
                        let dt = (ts - ts0) as f64;
                        let value = (dp.raw_value - v0) / dt;
                        if value < 0.0 {
                            log::debug!(
                                "counter overflow (negative delta) for {}: {} -> {}",
                                dp.name,
                                v0,
                                dp.raw_value
                            );
                            None
                        } else if !value.is_finite() {
                            None
                        } else {
                            Some((dp.name.clone(), value, ts))
                        }
                    }
                }
            }
        }
    }
}

fn maybe_sweep(inner: &mut CounterCacheInner, ts: i64) {
    if ts < inner.next_sweep {
        return;
    }
    let ttl = inner.ttl_secs;
    inner.entries.retain(|_, &mut (_, last_ts)| !(ts - ttl > last_ts));
    inner.next_sweep = ts + inner.sweep_interval_secs;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_passes_through() {
        let cache = CounterCache::new(12 * 3600, 4);
        let dp = Datapoint::gauge("cpu", 42.0);
        assert_eq!(cache.resolve(&dp, Some(100)), Some(("cpu".to_string(), 42.0, 100)));
    }

    #[test]
    fn counter_first_observation_emits_nothing() {
        let cache = CounterCache::new(12 * 3600, 4);
        let dp = Datapoint::counter("cpu", 100.0).with_ts(10);
        assert_eq!(cache.resolve(&dp, None), None);
    }

    #[test]
    fn counter_rate_scenario() {
        // spec.md §8 scenario 1
        let cache = CounterCache::new(12 * 3600, 4);
        assert_eq!(cache.resolve(&Datapoint::counter("cpu", 100.0).with_ts(10), None), None);
        assert_eq!(
            cache.resolve(&Datapoint::counter("cpu", 400.0).with_ts(11), None),
            Some(("cpu".to_string(), 300.0, 11))
        );
    }

    #[test]
    fn counter_overflow_scenario() {
        // spec.md §8 scenario 2
        let cache = CounterCache::new(12 * 3600, 4);
        assert_eq!(cache.resolve(&Datapoint::counter("cpu", 100.0).with_ts(10), None), None);
        assert_eq!(cache.resolve(&Datapoint::counter("cpu", 50.0).with_ts(11), None), None);
        // cache state is (50, 11): the next observation measures the delta from there
        assert_eq!(
            cache.resolve(&Datapoint::counter("cpu", 60.0).with_ts(12), None),
            Some(("cpu".to_string(), 10.0, 12))
        );
    }

    #[test]
    fn eviction_drops_stale_entries() {
        let cache = CounterCache::new(10, 4);
        cache.resolve(&Datapoint::counter("old", 1.0).with_ts(0), None);
        // past the ttl: eviction sweep should drop "old" before inserting "new"
        cache.resolve(&Datapoint::counter("new", 1.0).with_ts(100), None);
        let inner = cache.inner.lock().unwrap();
        assert!(!inner.entries.contains_key("old"));
        assert!(inner.entries.contains_key("new"));
    }

    #[test]
    fn fallback_ts_used_when_datapoint_has_none() {
        let cache = CounterCache::new(12 * 3600, 4);
        let dp = Datapoint::gauge("mem", 7.0);
        assert_eq!(cache.resolve(&dp, Some(55)), Some(("mem".to_string(), 7.0, 55)));
    }
}
