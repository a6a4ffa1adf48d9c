//! The enriched kernel event.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use etw_common::params::{ParamName, Params};
use etw_common::record::EventRecord;
use serde::{Deserialize, Serialize};

use crate::kind::{Category, EventKind};
use crate::process::ProcessRecord;

/// One decoded, enriched record representing a kernel-observed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence number stamped before the event enters the
    /// processor chain.
    pub seq: u64,
    pub kind: EventKind,
    pub category: Category,
    pub timestamp: SystemTime,
    /// Process that produced the event.
    pub pid: u32,
    /// Thread that produced the event.
    pub tid: u32,
    pub cpu: u16,
    /// Snapshot record of the producing process, attached during
    /// enrichment.
    #[serde(skip)]
    pub ps: Option<Arc<ProcessRecord>>,
    pub params: Params,
    rundown_processed: bool,
    #[serde(skip)]
    buffer: Option<Bytes>,
}

impl Event {
    /// Decodes a raw record, stamping it with the given sequence number.
    /// Records whose wire identifier falls outside the closed kind set
    /// yield nothing.
    pub fn decode(seq: u64, record: &EventRecord) -> Option<Event> {
        let kind = EventKind::from_wire(record.header.wire_id)?;
        Some(Event {
            seq,
            kind,
            category: kind.category(),
            timestamp: record.header.timestamp,
            pid: record.header.pid,
            tid: record.header.tid,
            cpu: record.header.cpu,
            ps: None,
            params: record.params.clone(),
            rundown_processed: false,
            buffer: Some(record.buffer.clone()),
        })
    }

    /// Builds a bare event. Used on the replay path and in tests.
    pub fn new(kind: EventKind, pid: u32, tid: u32, timestamp: SystemTime) -> Event {
        Event {
            seq: 0,
            kind,
            category: kind.category(),
            timestamp,
            pid,
            tid,
            cpu: 0,
            ps: None,
            params: Params::new(),
            rundown_processed: false,
            buffer: None,
        }
    }

    pub fn is_state(&self) -> bool {
        self.kind.is_state()
    }

    pub fn is_rundown(&self) -> bool {
        self.kind.is_rundown()
    }

    pub fn is_create_process(&self) -> bool {
        self.kind.is_create_process()
    }

    pub fn is_terminate_process(&self) -> bool {
        self.kind.is_terminate_process()
    }

    pub fn is_terminate_thread(&self) -> bool {
        self.kind.is_terminate_thread()
    }

    /// True when this rundown described state the snapshot already held,
    /// making the event a duplicate of an earlier session snapshot.
    pub fn is_rundown_processed(&self) -> bool {
        self.rundown_processed
    }

    pub fn mark_rundown_processed(&mut self) {
        self.rundown_processed = true;
    }

    /// Returns the pooled raw-record buffer to its owner. Dropped events
    /// must call this before being discarded.
    pub fn release(&mut self) {
        self.buffer = None;
    }

    fn image(&self) -> String {
        if let Some(ps) = &self.ps {
            if !ps.name.is_empty() {
                return ps.name.clone();
            }
        }
        self.params.string_of(ParamName::ProcessName)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = DateTime::<Utc>::from(self.timestamp).format("%Y-%m-%dT%TZ");
        let image = self.image();
        write!(
            f,
            "[{time} EVENT {image} ({})] [{}] {}",
            self.pid, self.kind, self.params
        )
    }
}

#[cfg(test)]
mod tests {
    use etw_common::params::ParamValue;
    use etw_common::record::RecordHeader;

    use super::*;

    fn record(wire_id: u16) -> EventRecord {
        let mut params = Params::new();
        params.append(ParamName::ProcessId, ParamValue::U32(624));
        EventRecord::new(
            RecordHeader {
                wire_id,
                timestamp: SystemTime::now(),
                pid: 4,
                tid: 8,
                cpu: 1,
            },
            params,
        )
        .with_buffer(Bytes::from_static(b"raw"))
    }

    #[test]
    fn decode_known_wire_id() {
        let event = Event::decode(7, &record(EventKind::CreateProcess.wire_id())).unwrap();
        assert_eq!(event.seq, 7);
        assert_eq!(event.kind, EventKind::CreateProcess);
        assert_eq!(event.category, Category::Process);
        assert_eq!(event.pid, 4);
        assert_eq!(event.params.pid().unwrap(), 624);
    }

    #[test]
    fn decode_unknown_wire_id_yields_nothing() {
        assert!(Event::decode(1, &record(4242)).is_none());
    }

    #[test]
    fn release_drops_the_pooled_buffer() {
        let mut event = Event::decode(1, &record(1)).unwrap();
        assert!(event.buffer.is_some());
        event.release();
        assert!(event.buffer.is_none());
    }
}
