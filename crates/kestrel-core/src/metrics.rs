//! Pipeline counters, exported as a flat dotted-key map.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

/// Single atomic counter.
#[derive(Default)]
pub struct Counter(AtomicI64);

impl Counter {
    pub fn add(&self, n: i64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn dec(&self) {
        self.add(-1);
    }

    pub fn value(&self) -> i64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counter map keyed by an arbitrary string, e.g. an error message or a
/// process identifier.
#[derive(Default)]
pub struct KeyedCounter(Mutex<HashMap<String, i64>>);

impl KeyedCounter {
    pub fn add(&self, key: &str, n: i64) {
        *self
            .0
            .lock()
            .expect("keyed counter poisoned")
            .entry(key.to_string())
            .or_insert(0) += n;
    }

    pub fn value_of(&self, key: &str) -> i64 {
        self.0
            .lock()
            .expect("keyed counter poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.0
            .lock()
            .expect("keyed counter poisoned")
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricValue {
    Counter(i64),
    Map(BTreeMap<String, i64>),
}

/// All pipeline counters. One instance is shared across the consumer,
/// the processors and the snapshotter.
#[derive(Default)]
pub struct Metrics {
    /// Events that failed processing, keyed by error message.
    pub kevents_failures: KeyedCounter,
    pub kevents_enqueued: Counter,
    pub excluded_kevents: Counter,
    pub excluded_procs: Counter,
    pub upstream_cancellations: Counter,
    pub kbuffers_read: Counter,
    /// Errors dropped on error-channel overflow.
    pub errors_dropped: Counter,
    pub processor_failures: Counter,
    pub handle_deferred_matches: Counter,
    pub handle_pending_evictions: Counter,
    pub handle_wait_timeouts: Counter,
    /// Snapshot misses, keyed by pid.
    pub process_lookup_failures: KeyedCounter,
    pub process_reaped: Counter,
    pub process_count: Counter,
    pub thread_count: Counter,
    pub module_count: Counter,
    pub peb_read_errors: Counter,
}

impl Metrics {
    pub fn export(&self) -> BTreeMap<String, MetricValue> {
        let mut out = BTreeMap::new();
        out.insert(
            "kstream.kevents.failures".to_string(),
            MetricValue::Map(self.kevents_failures.snapshot()),
        );
        let counters = [
            ("kstream.kevents.enqueued", &self.kevents_enqueued),
            ("kstream.excluded.kevents", &self.excluded_kevents),
            ("kstream.excluded.procs", &self.excluded_procs),
            ("kstream.upstream.cancellations", &self.upstream_cancellations),
            ("kstream.kbuffers.read", &self.kbuffers_read),
            ("kstream.errors.dropped", &self.errors_dropped),
            ("kevent.processor.failures", &self.processor_failures),
            ("handle.deferred.matches", &self.handle_deferred_matches),
            ("handle.pending.evictions", &self.handle_pending_evictions),
            ("handle.wait.timeouts", &self.handle_wait_timeouts),
            ("process.reaped", &self.process_reaped),
            ("process.count", &self.process_count),
            ("process.thread.count", &self.thread_count),
            ("process.module.count", &self.module_count),
            ("process.peb.read.errors", &self.peb_read_errors),
        ];
        for (key, counter) in counters {
            out.insert(key.to_string(), MetricValue::Counter(counter.value()));
        }
        out.insert(
            "process.lookup.failure.count".to_string(),
            MetricValue::Map(self.process_lookup_failures.snapshot()),
        );
        out
    }
}
