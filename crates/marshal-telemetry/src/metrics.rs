use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

/// In-memory counter. Monotonically increasing.
struct Counter {
    value: AtomicU64,
}

/// In-memory gauge stored as f64 bits so it can hold negative values.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn set(&self, v: f64) {
        self.value.store(v.to_bits() as i64, Ordering::Relaxed);
    }
    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed) as u64)
    }
}

/// Histogram kept as raw samples; summarized on snapshot.
struct Histogram {
    samples: Mutex<Vec<f64>>,
}

/// Percentile summary of one histogram.
#[derive(Clone, Debug, Serialize)]
pub struct HistogramSummary {
    pub count: usize,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
}

/// Point-in-time export of every registered metric.
#[derive(Clone, Debug, Default, Serialize)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, f64>,
    pub histograms: HashMap<String, HistogramSummary>,
}

/// Process-wide metrics registry. Cheap to clone and share.
#[derive(Clone, Default)]
pub struct MetricsRecorder {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    counters: RwLock<HashMap<String, Arc<Counter>>>,
    gauges: RwLock<HashMap<String, Arc<Gauge>>>,
    histograms: RwLock<HashMap<String, Arc<Histogram>>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, name: &str, by: u64) {
        let counter = {
            let counters = self.inner.counters.read();
            counters.get(name).cloned()
        };
        let counter = counter.unwrap_or_else(|| {
            let mut counters = self.inner.counters.write();
            counters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Counter { value: AtomicU64::new(0) }))
                .clone()
        });
        counter.value.fetch_add(by, Ordering::Relaxed);
    }

    pub fn gauge(&self, name: &str, value: f64) {
        let gauge = {
            let gauges = self.inner.gauges.read();
            gauges.get(name).cloned()
        };
        let gauge = gauge.unwrap_or_else(|| {
            let mut gauges = self.inner.gauges.write();
            gauges
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Gauge { value: AtomicI64::new(0) }))
                .clone()
        });
        gauge.set(value);
    }

    pub fn observe(&self, name: &str, value: f64) {
        let histogram = {
            let histograms = self.inner.histograms.read();
            histograms.get(name).cloned()
        };
        let histogram = histogram.unwrap_or_else(|| {
            let mut histograms = self.inner.histograms.write();
            histograms
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Histogram { samples: Mutex::new(Vec::new()) }))
                .clone()
        });
        histogram.samples.lock().push(value);
    }

    pub fn counter_value(&self, name: &str) -> u64 {
        self.inner
            .counters
            .read()
            .get(name)
            .map(|c| c.value.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .inner
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.value.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .inner
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect();
        let histograms = self
            .inner
            .histograms
            .read()
            .iter()
            .filter_map(|(k, v)| summarize(&v.samples.lock()).map(|s| (k.clone(), s)))
            .collect();
        MetricsSnapshot { counters, gauges, histograms }
    }
}

fn summarize(samples: &[f64]) -> Option<HistogramSummary> {
    if samples.is_empty() {
        return None;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let count = sorted.len();
    let sum: f64 = sorted.iter().sum();
    let pct = |p: f64| sorted[((count as f64 * p) as usize).min(count - 1)];
    Some(HistogramSummary {
        count,
        min: sorted[0],
        max: sorted[count - 1],
        mean: sum / count as f64,
        p50: pct(0.50),
        p95: pct(0.95),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let m = MetricsRecorder::new();
        m.increment("commands_total", 1);
        m.increment("commands_total", 2);
        assert_eq!(m.counter_value("commands_total"), 3);
        assert_eq!(m.counter_value("missing"), 0);
    }

    #[test]
    fn gauge_overwrites() {
        let m = MetricsRecorder::new();
        m.gauge("nodes_online", 3.0);
        m.gauge("nodes_online", 2.0);
        let snap = m.snapshot();
        assert_eq!(snap.gauges["nodes_online"], 2.0);
    }

    #[test]
    fn gauge_holds_negative() {
        let m = MetricsRecorder::new();
        m.gauge("drift", -1.5);
        assert_eq!(m.snapshot().gauges["drift"], -1.5);
    }

    #[test]
    fn histogram_summary() {
        let m = MetricsRecorder::new();
        for v in [1.0, 2.0, 3.0, 4.0, 100.0] {
            m.observe("dispatch_ms", v);
        }
        let snap = m.snapshot();
        let h = &snap.histograms["dispatch_ms"];
        assert_eq!(h.count, 5);
        assert_eq!(h.min, 1.0);
        assert_eq!(h.max, 100.0);
        assert_eq!(h.mean, 22.0);
        assert_eq!(h.p50, 3.0);
    }

    #[test]
    fn empty_histogram_excluded_from_snapshot() {
        let m = MetricsRecorder::new();
        let snap = m.snapshot();
        assert!(snap.histograms.is_empty());
    }

    #[test]
    fn concurrent_counter_updates() {
        let m = MetricsRecorder::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let m = m.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        m.increment("spins", 1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.counter_value("spins"), 8000);
    }
}
