//! Minimal run-time metrics sink.
//!
//! No exporter is bundled. The recorder keeps the latest value of every
//! metric in a `DashMap` (readable through [`snapshot`]) and, when the host
//! registered one, forwards each update to a raw C callback.

use dashmap::DashMap;
use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata, Recorder,
    SharedString, Unit,
};
use once_cell::sync::{Lazy, OnceCell};
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Signature for external collectors.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();
static VALUES: Lazy<DashMap<String, Arc<Slot>>> = Lazy::new(DashMap::new);

/// Register a callback from C/other languages. Only the first one sticks.
#[no_mangle]
pub unsafe extern "C" fn fastplane_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
}

/// `name{k=v,...}` with labels in key order.
fn render(key: &Key) -> String {
    let mut out = key.name().to_string();
    let labels: Vec<String> = key
        .labels()
        .map(|l| format!("{}={}", l.key(), l.value()))
        .collect();
    if !labels.is_empty() {
        out.push('{');
        out.push_str(&labels.join(","));
        out.push('}');
    }
    out
}

struct Slot {
    name: CString,
    value: AtomicU64,
}

impl Slot {
    fn publish(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
        if let Some(cb) = CALLBACK.get() {
            unsafe { cb(self.name.as_ptr(), value as c_ulonglong) };
        }
    }
}

fn slot(key: &Key) -> Arc<Slot> {
    let name = render(key);
    VALUES
        .entry(name.clone())
        .or_insert_with(|| {
            Arc::new(Slot {
                // metric names are static identifiers; an interior NUL only
                // loses the C side of the report
                name: CString::new(name).unwrap_or_default(),
                value: AtomicU64::new(0),
            })
        })
        .value()
        .clone()
}

struct SlotCounter(Arc<Slot>);
struct SlotGauge(Arc<Slot>);
struct SlotHistogram(Arc<Slot>);

impl CounterFn for SlotCounter {
    fn increment(&self, value: u64) {
        let total = self.0.value.fetch_add(value, Ordering::Relaxed) + value;
        self.0.publish(total);
    }

    fn absolute(&self, value: u64) {
        self.0.publish(value);
    }
}

impl GaugeFn for SlotGauge {
    fn set(&self, value: f64) {
        self.0.publish(value.max(0.0) as u64);
    }

    fn increment(&self, value: f64) {
        let cur = self.0.value.load(Ordering::Relaxed) as f64;
        self.0.publish((cur + value).max(0.0) as u64);
    }

    fn decrement(&self, value: f64) {
        let cur = self.0.value.load(Ordering::Relaxed) as f64;
        self.0.publish((cur - value).max(0.0) as u64);
    }
}

impl HistogramFn for SlotHistogram {
    /// Histograms report their latest sample.
    fn record(&self, value: f64) {
        self.0.publish(value.max(0.0) as u64);
    }
}

struct SnapshotRecorder;

impl Recorder for SnapshotRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        Counter::from_arc(Arc::new(SlotCounter(slot(key))))
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        Gauge::from_arc(Arc::new(SlotGauge(slot(key))))
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        Histogram::from_arc(Arc::new(SlotHistogram(slot(key))))
    }
}

/// Install exactly **once**; called whenever a dataplane is opened.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        if metrics::set_global_recorder(SnapshotRecorder).is_err() {
            log::warn!("[TELEMETRY] another metrics recorder is already installed");
        }
    });
}

/// Every metric seen so far, sorted by rendered name.
pub fn snapshot() -> Vec<(String, u64)> {
    let mut out: Vec<(String, u64)> = VALUES
        .iter()
        .map(|e| (e.key().clone(), e.value().value.load(Ordering::Relaxed)))
        .collect();
    out.sort();
    out
}

pub fn value(name: &str) -> Option<u64> {
    VALUES.get(name).map(|s| s.value().value.load(Ordering::Relaxed))
}
