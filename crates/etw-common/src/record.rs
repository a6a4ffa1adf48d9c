//! Raw event records as handed over by the tracing wrapper.

use std::time::SystemTime;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::params::Params;

/// Fixed header preceding every record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Wire identifier of the event type.
    pub wire_id: u16,
    pub timestamp: SystemTime,
    /// Process that produced the record.
    pub pid: u32,
    /// Thread that produced the record.
    pub tid: u32,
    /// Logical core on which the record was generated.
    pub cpu: u16,
}

/// One decoded record from a trace session buffer.
///
/// Property decoding happens inside the OS wrapper; by the time a record
/// reaches the per-record callback its parameters are already typed. The
/// raw payload still rides along in `buffer`: it is pooled upstream, and
/// clones are reference counted, so dropping the last clone returns the
/// allocation to its pool.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub header: RecordHeader,
    pub params: Params,
    pub buffer: Bytes,
}

impl EventRecord {
    pub fn new(header: RecordHeader, params: Params) -> Self {
        Self {
            header,
            params,
            buffer: Bytes::new(),
        }
    }

    pub fn with_buffer(mut self, buffer: Bytes) -> Self {
        self.buffer = buffer;
        self
    }
}
