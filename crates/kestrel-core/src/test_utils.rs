//! In-memory collaborator stand-ins shared by the pipeline tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::event::Event;
use crate::kind::EventKind;
use crate::pdk::{
    DevMapper, Filter, HandleCreateCallback, HandleDestroyCallback, HandleSnapshotter, PdkError,
    PeReader,
};
use crate::process::{HandleInfo, PeMetadata};

/// Handle snapshotter that records the traffic it sees and hands out
/// pre-seeded per-process handle lists.
#[derive(Default)]
pub struct RecordingHandleSnapshotter {
    handles: Mutex<HashMap<u32, Vec<HandleInfo>>>,
    written: Mutex<Vec<Event>>,
    removed: Mutex<Vec<Event>>,
    create_callbacks: Mutex<Vec<HandleCreateCallback>>,
    destroy_callbacks: Mutex<Vec<HandleDestroyCallback>>,
}

impl RecordingHandleSnapshotter {
    pub fn seed(&self, pid: u32, handles: Vec<HandleInfo>) {
        self.handles.lock().unwrap().insert(pid, handles);
    }

    pub fn written(&self) -> Vec<Event> {
        self.written.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<Event> {
        self.removed.lock().unwrap().clone()
    }

    /// Fires the registered create callbacks as an asynchronous handle
    /// event would.
    pub fn emit_created(&self, pid: u32, handle: HandleInfo) {
        for cb in self.create_callbacks.lock().unwrap().iter() {
            cb(pid, handle.clone());
        }
    }

    pub fn emit_destroyed(&self, pid: u32, raw: u64) {
        for cb in self.destroy_callbacks.lock().unwrap().iter() {
            cb(pid, raw);
        }
    }
}

impl HandleSnapshotter for RecordingHandleSnapshotter {
    fn find_handles(&self, pid: u32) -> Result<Vec<HandleInfo>, PdkError> {
        Ok(self
            .handles
            .lock()
            .unwrap()
            .get(&pid)
            .cloned()
            .unwrap_or_default())
    }

    fn register_create_callback(&self, cb: HandleCreateCallback) {
        self.create_callbacks.lock().unwrap().push(cb);
    }

    fn register_destroy_callback(&self, cb: HandleDestroyCallback) {
        self.destroy_callbacks.lock().unwrap().push(cb);
    }

    fn write(&self, event: &Event) -> Result<(), PdkError> {
        self.written.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn remove(&self, event: &Event) -> Result<(), PdkError> {
        self.removed.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Device mapper translating a fixed set of device prefixes.
pub struct MapDevMapper {
    prefixes: Vec<(String, String)>,
}

impl MapDevMapper {
    pub fn new(prefixes: &[(&str, &str)]) -> Self {
        Self {
            prefixes: prefixes
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }
}

impl DevMapper for MapDevMapper {
    fn convert(&self, name: &str) -> String {
        for (from, to) in &self.prefixes {
            if let Some(rest) = name.strip_prefix(from.as_str()) {
                return format!("{to}{rest}");
            }
        }
        name.to_string()
    }
}

/// PE reader returning a fixed result for every known path.
#[derive(Default)]
pub struct FixedPeReader {
    metadata: Mutex<HashMap<String, PeMetadata>>,
}

impl FixedPeReader {
    pub fn seed(&self, path: &str, metadata: PeMetadata) {
        self.metadata
            .lock()
            .unwrap()
            .insert(path.to_string(), metadata);
    }
}

impl PeReader for FixedPeReader {
    fn read(&self, path: &str) -> Result<PeMetadata, PdkError> {
        self.metadata
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| PdkError::Other(format!("no executable at {path}")))
    }
}

/// Filter rejecting a fixed set of event kinds.
pub struct RejectKindsFilter(pub Vec<EventKind>);

impl Filter for RejectKindsFilter {
    fn run(&self, event: &Event) -> bool {
        !self.0.contains(&event.kind)
    }
}
