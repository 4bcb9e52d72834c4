//! In-process bridge from the `metrics` facade to a scrapeable snapshot.
//!
//! Counters, gauges and histogram summaries land in a process-wide
//! registry; `render` serializes it in Prometheus text format for the
//! `/metrics` endpoint. No sampling, no buckets: histograms surface as
//! count and sum, which is enough for rates and averages.

use dashmap::DashMap;
use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Recorder,
    SharedString, Unit,
};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static REGISTRY: Lazy<TelemetryRegistry> = Lazy::new(TelemetryRegistry::default);

/// Install the snapshot recorder as the global `metrics` sink. Safe to
/// call more than once; the first install wins.
pub fn install() {
    let _ = metrics::set_boxed_recorder(Box::new(SnapshotRecorder));
}

/// Render every known series in Prometheus text format, sorted for
/// stable output.
pub fn render() -> String {
    REGISTRY.render()
}

/// (metric family, rendered label set) pair identifying one series.
type SeriesKey = (String, String);

fn series_key(key: &Key) -> SeriesKey {
    let family = key.name().replace('.', "_");
    let mut labels: Vec<String> = key
        .labels()
        .map(|label| format!("{}=\"{}\"", label.key(), label.value()))
        .collect();
    labels.sort();
    let labels = if labels.is_empty() {
        String::new()
    } else {
        format!("{{{}}}", labels.join(","))
    };
    (family, labels)
}

/// Add onto an f64 stored as raw bits in an atomic.
fn add_f64(cell: &AtomicU64, value: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(current) + value).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => break,
            Err(actual) => current = actual,
        }
    }
}

#[derive(Default)]
struct CounterCell(AtomicU64);

impl CounterFn for CounterCell {
    fn increment(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn absolute(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }
}

#[derive(Default)]
struct GaugeCell(AtomicU64);

impl GaugeFn for GaugeCell {
    fn increment(&self, value: f64) {
        add_f64(&self.0, value);
    }

    fn decrement(&self, value: f64) {
        add_f64(&self.0, -value);
    }

    fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Relaxed);
    }
}

#[derive(Default)]
struct HistogramCell {
    count: AtomicU64,
    sum: AtomicU64,
}

impl HistogramFn for HistogramCell {
    fn record(&self, value: f64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        add_f64(&self.sum, value);
    }
}

#[derive(Default)]
struct TelemetryRegistry {
    counters: DashMap<SeriesKey, Arc<CounterCell>>,
    gauges: DashMap<SeriesKey, Arc<GaugeCell>>,
    histograms: DashMap<SeriesKey, Arc<HistogramCell>>,
}

impl TelemetryRegistry {
    fn counter(&self, key: &Key) -> Arc<CounterCell> {
        self.counters
            .entry(series_key(key))
            .or_insert_with(|| Arc::new(CounterCell::default()))
            .clone()
    }

    fn gauge(&self, key: &Key) -> Arc<GaugeCell> {
        self.gauges
            .entry(series_key(key))
            .or_insert_with(|| Arc::new(GaugeCell::default()))
            .clone()
    }

    fn histogram(&self, key: &Key) -> Arc<HistogramCell> {
        self.histograms
            .entry(series_key(key))
            .or_insert_with(|| Arc::new(HistogramCell::default()))
            .clone()
    }

    fn render(&self) -> String {
        let mut out = String::new();

        let mut counters: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
        for entry in self.counters.iter() {
            let (family, labels) = entry.key().clone();
            counters
                .entry(family)
                .or_default()
                .push((labels, entry.value().0.load(Ordering::Relaxed)));
        }
        for (family, mut series) in counters {
            out.push_str(&format!("# TYPE {} counter\n", family));
            series.sort();
            for (labels, value) in series {
                out.push_str(&format!("{}{} {}\n", family, labels, value));
            }
        }

        let mut gauges: BTreeMap<String, Vec<(String, f64)>> = BTreeMap::new();
        for entry in self.gauges.iter() {
            let (family, labels) = entry.key().clone();
            gauges
                .entry(family)
                .or_default()
                .push((labels, f64::from_bits(entry.value().0.load(Ordering::Relaxed))));
        }
        for (family, mut series) in gauges {
            out.push_str(&format!("# TYPE {} gauge\n", family));
            series.sort_by(|a, b| a.0.cmp(&b.0));
            for (labels, value) in series {
                out.push_str(&format!("{}{} {}\n", family, labels, value));
            }
        }

        let mut histograms: BTreeMap<String, Vec<(String, u64, f64)>> = BTreeMap::new();
        for entry in self.histograms.iter() {
            let (family, labels) = entry.key().clone();
            let cell = entry.value();
            histograms.entry(family).or_default().push((
                labels,
                cell.count.load(Ordering::Relaxed),
                f64::from_bits(cell.sum.load(Ordering::Relaxed)),
            ));
        }
        for (family, mut series) in histograms {
            out.push_str(&format!("# TYPE {} summary\n", family));
            series.sort_by(|a, b| a.0.cmp(&b.0));
            for (labels, count, sum) in series {
                out.push_str(&format!("{}_count{} {}\n", family, labels, count));
                out.push_str(&format!("{}_sum{} {}\n", family, labels, sum));
            }
        }

        out
    }
}

struct SnapshotRecorder;

impl Recorder for SnapshotRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key) -> Counter {
        Counter::from_arc(REGISTRY.counter(key))
    }

    fn register_gauge(&self, key: &Key) -> Gauge {
        Gauge::from_arc(REGISTRY.gauge(key))
    }

    fn register_histogram(&self, key: &Key) -> Histogram {
        Histogram::from_arc(REGISTRY.histogram(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::{counter, gauge, histogram};

    #[test]
    fn counters_show_up_in_the_snapshot() {
        install();
        counter!("telemetry_test.hits", 3);
        counter!("telemetry_test.hits", 2);
        let snapshot = render();
        assert!(snapshot.contains("# TYPE telemetry_test_hits counter"));
        assert!(snapshot.contains("telemetry_test_hits 5"));
    }

    #[test]
    fn labels_render_sorted_inside_braces() {
        install();
        counter!("telemetry_test.labeled", 1, "b" => "2", "a" => "1");
        let snapshot = render();
        assert!(snapshot.contains("telemetry_test_labeled{a=\"1\",b=\"2\"} 1"));
    }

    #[test]
    fn gauges_track_the_last_set_value() {
        install();
        gauge!("telemetry_test.level", 4.0);
        gauge!("telemetry_test.level", 7.5);
        let snapshot = render();
        assert!(snapshot.contains("telemetry_test_level 7.5"));
    }

    #[test]
    fn histograms_surface_count_and_sum() {
        install();
        histogram!("telemetry_test.latency", 0.5);
        histogram!("telemetry_test.latency", 1.5);
        let snapshot = render();
        assert!(snapshot.contains("telemetry_test_latency_count 2"));
        assert!(snapshot.contains("telemetry_test_latency_sum 2"));
    }
}
