//! Minimal run-time metrics sink.
//!
//! No exporter is bundled; the host process registers a raw callback that
//! receives NUL-terminated metric names and their values.

use dashmap::DashMap;
use metrics::{Counter, Gauge, Histogram, Key, KeyName, Recorder, SharedString, Unit};
use once_cell::sync::{Lazy, OnceCell};
use std::ffi::CString;
use std::os::raw::{c_char, c_ulonglong};
use std::sync::Arc;

/// Signature for external collectors.
pub type StatsCallback = unsafe extern "C" fn(name: *const c_char, value: c_ulonglong);

static CALLBACK: OnceCell<StatsCallback> = OnceCell::new();

// metric names outlive every sample, so each is converted once
static NAMES: Lazy<DashMap<String, Arc<CString>>> = Lazy::new(DashMap::new);

/// Register a callback from C/other languages. Only the first one sticks.
#[no_mangle]
pub unsafe extern "C" fn shmroute_register_stats_callback(cb: StatsCallback) {
    let _ = CALLBACK.set(cb);
}

fn c_name(key: &Key) -> Option<Arc<CString>> {
    let name = key.name();
    if let Some(c) = NAMES.get(name) {
        return Some(Arc::clone(&c));
    }
    let c = Arc::new(CString::new(name).ok()?);
    NAMES.insert(name.to_owned(), Arc::clone(&c));
    Some(c)
}

/// One metric handle; forwards every sample to the callback if registered.
#[derive(Clone)]
struct FfiMetric {
    name: Option<Arc<CString>>,
}

impl FfiMetric {
    fn new(key: &Key) -> Arc<Self> {
        Arc::new(Self { name: c_name(key) })
    }

    fn emit(&self, value: u64) {
        if let (Some(cb), Some(name)) = (CALLBACK.get(), self.name.as_ref()) {
            unsafe { cb(name.as_ptr(), value as c_ulonglong) };
        }
    }
}

/// Forwarding recorder.
struct FfiRecorder;

impl Recorder for FfiRecorder {
    fn describe_counter(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_gauge(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}
    fn describe_histogram(&self, _key: KeyName, _unit: Option<Unit>, _description: SharedString) {}

    fn register_counter(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Counter {
        Counter::from_arc(FfiMetric::new(key))
    }
    fn register_gauge(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Gauge {
        Gauge::from_arc(FfiMetric::new(key))
    }
    fn register_histogram(&self, key: &Key, _metadata: &metrics::Metadata<'_>) -> Histogram {
        Histogram::from_arc(FfiMetric::new(key))
    }
}

impl metrics::CounterFn for FfiMetric {
    fn increment(&self, value: u64) {
        self.emit(value);
    }
    fn absolute(&self, value: u64) {
        self.emit(value);
    }
}

impl metrics::GaugeFn for FfiMetric {
    fn set(&self, value: f64) {
        self.emit(value as u64);
    }
    fn increment(&self, value: f64) {
        self.emit(value as u64);
    }
    fn decrement(&self, value: f64) {
        self.emit(value as u64);
    }
}

impl metrics::HistogramFn for FfiMetric {
    fn record(&self, value: f64) {
        self.emit(value as u64);
    }
}

/// Install exactly **once** – called from crate root.
pub fn init() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = metrics::set_global_recorder(FfiRecorder);
    });
}
