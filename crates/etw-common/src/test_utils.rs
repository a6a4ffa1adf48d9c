//! In-memory stand-ins for the OS contracts.
//!
//! The synthetic trace session drives the very same function-pointer
//! trampoline the real tracer would, so pipeline tests exercise the
//! callback path end to end.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::os::{
    AccessProfile, BasicInfo, DriverEnum, DriverInfo, DuplicatedHandle, HandleApi, ObjectNameApi,
    OsError, Peb, ProcessApi, ProcessHandle,
};
use crate::record::EventRecord;
use crate::trace::{TraceApi, TraceCallbacks, TraceError, TraceHandle};

struct SessionState {
    callbacks: TraceCallbacks,
    tx: Option<Sender<EventRecord>>,
    rx: Option<Receiver<EventRecord>>,
    cancelled: Arc<AtomicBool>,
}

/// Synthetic trace sessions fed from the test body.
///
/// `process` blocks on a record queue exactly like the real trace loop
/// blocks on the session buffers; `close` stops the session, which makes
/// the loop surface [`TraceError::Cancelled`].
#[derive(Default)]
pub struct TestTraceApi {
    sessions: Mutex<HashMap<u64, SessionState>>,
    names: Mutex<HashMap<String, u64>>,
    next_handle: AtomicU64,
    fail_open: Mutex<HashSet<String>>,
}

impl TestTraceApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes any subsequent open of the named session fail.
    pub fn fail_open(&self, session: &str) {
        self.fail_open.lock().unwrap().insert(session.to_string());
    }

    /// Queues a record on the named session. The blocked processing loop
    /// picks it up and runs it through the registered callbacks.
    pub fn feed(&self, session: &str, record: EventRecord) {
        let id = *self
            .names
            .lock()
            .unwrap()
            .get(session)
            .expect("session not open");
        let sessions = self.sessions.lock().unwrap();
        let state = sessions.get(&id).expect("session not open");
        state
            .tx
            .as_ref()
            .expect("session already closed")
            .send(record)
            .expect("processing loop gone");
    }

    /// Ends the named session without cancelling it, draining the loop
    /// to a clean stop.
    pub fn finish(&self, session: &str) {
        let id = *self.names.lock().unwrap().get(session).expect("not open");
        if let Some(state) = self.sessions.lock().unwrap().get_mut(&id) {
            state.tx = None;
        }
    }
}

impl TraceApi for TestTraceApi {
    fn open(&self, session: &str, callbacks: TraceCallbacks) -> Result<TraceHandle, TraceError> {
        if self.fail_open.lock().unwrap().contains(session) {
            return Err(TraceError::Open {
                session: session.to_string(),
                source: OsError::AccessDenied,
            });
        }
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = channel();
        self.sessions.lock().unwrap().insert(
            id,
            SessionState {
                callbacks,
                tx: Some(tx),
                rx: Some(rx),
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );
        self.names.lock().unwrap().insert(session.to_string(), id);
        Ok(TraceHandle(id))
    }

    fn process(&self, handle: TraceHandle) -> Result<(), TraceError> {
        let (rx, callbacks, cancelled) = {
            let mut sessions = self.sessions.lock().unwrap();
            let state = sessions.get_mut(&handle.0).ok_or(TraceError::InvalidHandle)?;
            (
                state.rx.take().ok_or(TraceError::InvalidHandle)?,
                state.callbacks,
                state.cancelled.clone(),
            )
        };
        while let Ok(record) = rx.recv() {
            callbacks.dispatch_buffer(1);
            callbacks.dispatch_record(&record);
        }
        if cancelled.load(Ordering::SeqCst) {
            Err(TraceError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn close(&self, handle: TraceHandle) -> Result<(), TraceError> {
        let mut sessions = self.sessions.lock().unwrap();
        let state = sessions.get_mut(&handle.0).ok_or(TraceError::InvalidHandle)?;
        state.cancelled.store(true, Ordering::SeqCst);
        state.tx = None;
        Ok(())
    }
}

/// One fake OS process.
#[derive(Debug, Clone)]
pub struct FakeProcess {
    pub image: String,
    pub ppid: u32,
    pub start_time: Option<SystemTime>,
    pub running: bool,
    /// Protected processes reject the broad access profile.
    pub protected: bool,
    pub peb: Option<Peb>,
}

impl Default for FakeProcess {
    fn default() -> Self {
        Self {
            image: String::new(),
            ppid: 0,
            start_time: None,
            running: true,
            protected: false,
            peb: None,
        }
    }
}

#[derive(Default)]
pub struct TestProcessApi {
    procs: Arc<Mutex<HashMap<u32, FakeProcess>>>,
}

impl TestProcessApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, pid: u32, process: FakeProcess) {
        self.procs.lock().unwrap().insert(pid, process);
    }

    pub fn remove(&self, pid: u32) {
        self.procs.lock().unwrap().remove(&pid);
    }

    pub fn set_running(&self, pid: u32, running: bool) {
        if let Some(p) = self.procs.lock().unwrap().get_mut(&pid) {
            p.running = running;
        }
    }
}

struct TestProcessHandle {
    pid: u32,
    procs: Arc<Mutex<HashMap<u32, FakeProcess>>>,
}

impl TestProcessHandle {
    fn with<T>(&self, f: impl FnOnce(&FakeProcess) -> Result<T, OsError>) -> Result<T, OsError> {
        let procs = self.procs.lock().unwrap();
        match procs.get(&self.pid) {
            Some(p) => f(p),
            None => Err(OsError::NotFound),
        }
    }
}

impl ProcessHandle for TestProcessHandle {
    fn full_image_name(&self) -> Result<String, OsError> {
        self.with(|p| Ok(p.image.clone()))
    }

    fn basic_info(&self) -> Result<BasicInfo, OsError> {
        self.with(|p| Ok(BasicInfo { ppid: p.ppid }))
    }

    fn start_time(&self) -> Result<SystemTime, OsError> {
        self.with(|p| {
            p.start_time.ok_or(OsError::Api {
                call: "GetProcessTimes",
                code: 0x57,
            })
        })
    }

    fn read_peb(&self) -> Result<Peb, OsError> {
        self.with(|p| p.peb.clone().ok_or(OsError::AccessDenied))
    }

    fn is_running(&self) -> bool {
        self.procs
            .lock()
            .unwrap()
            .get(&self.pid)
            .map(|p| p.running)
            .unwrap_or(false)
    }
}

impl ProcessApi for TestProcessApi {
    fn open(&self, pid: u32, access: AccessProfile) -> Result<Box<dyn ProcessHandle>, OsError> {
        let procs = self.procs.lock().unwrap();
        let process = procs.get(&pid).ok_or(OsError::NotFound)?;
        if process.protected && access == AccessProfile::QueryInfo {
            return Err(OsError::AccessDenied);
        }
        Ok(Box::new(TestProcessHandle {
            pid,
            procs: self.procs.clone(),
        }))
    }
}

/// Handle duplication keyed by the raw handle identifier.
#[derive(Default)]
pub struct TestHandleApi {
    types: Mutex<HashMap<u32, String>>,
}

impl TestHandleApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_type(&self, handle_id: u32, type_name: &str) {
        self.types
            .lock()
            .unwrap()
            .insert(handle_id, type_name.to_string());
    }
}

struct TestDuplicatedHandle {
    type_name: String,
}

impl DuplicatedHandle for TestDuplicatedHandle {
    fn query_type(&self) -> Result<String, OsError> {
        Ok(self.type_name.clone())
    }
}

impl HandleApi for TestHandleApi {
    fn duplicate(
        &self,
        handle_id: u32,
        _owner_pid: u32,
    ) -> Result<Box<dyn DuplicatedHandle>, OsError> {
        let types = self.types.lock().unwrap();
        let type_name = types.get(&handle_id).cloned().ok_or(OsError::NotFound)?;
        Ok(Box::new(TestDuplicatedHandle { type_name }))
    }
}

/// Object-name store with optional hanging handles to exercise the
/// deadlock-safe resolver.
#[derive(Default)]
pub struct TestObjectNameApi {
    names: Mutex<HashMap<u64, String>>,
    hang: Mutex<HashSet<u64>>,
}

impl TestObjectNameApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_name(&self, raw_handle: u64, name: &str) {
        self.names
            .lock()
            .unwrap()
            .insert(raw_handle, name.to_string());
    }

    /// Makes queries for the given handle block forever.
    pub fn hang_on(&self, raw_handle: u64) {
        self.hang.lock().unwrap().insert(raw_handle);
    }
}

impl ObjectNameApi for TestObjectNameApi {
    fn query_object_name(&self, raw_handle: u64) -> Result<String, OsError> {
        if self.hang.lock().unwrap().contains(&raw_handle) {
            loop {
                std::thread::park();
            }
        }
        self.names
            .lock()
            .unwrap()
            .get(&raw_handle)
            .cloned()
            .ok_or(OsError::NotFound)
    }
}

#[derive(Default)]
pub struct TestDriverEnum {
    drivers: Mutex<Vec<DriverInfo>>,
}

impl TestDriverEnum {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, filename: &str) {
        self.drivers.lock().unwrap().push(DriverInfo {
            filename: filename.to_string(),
        });
    }
}

impl DriverEnum for TestDriverEnum {
    fn enum_drivers(&self) -> Vec<DriverInfo> {
        self.drivers.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;
    use std::sync::atomic::AtomicU32;

    use super::*;
    use crate::params::Params;
    use crate::record::RecordHeader;

    static RECORDS_SEEN: AtomicU32 = AtomicU32::new(0);

    unsafe extern "system" fn count_buffers(_ctx: *mut c_void, _n: u32) -> u32 {
        crate::trace::CALLBACK_CONTINUE
    }

    unsafe extern "system" fn count_records(_ctx: *mut c_void, _record: *const EventRecord) -> u32 {
        RECORDS_SEEN.fetch_add(1, Ordering::SeqCst);
        crate::trace::CALLBACK_CONTINUE
    }

    fn record() -> EventRecord {
        EventRecord::new(
            RecordHeader {
                wire_id: 1,
                timestamp: SystemTime::now(),
                pid: 7,
                tid: 7,
                cpu: 0,
            },
            Params::new(),
        )
    }

    #[test]
    fn synthetic_session_drives_the_trampoline() {
        let api = TestTraceApi::new();
        let callbacks = TraceCallbacks {
            context: std::ptr::null_mut(),
            on_buffer: count_buffers,
            on_record: count_records,
        };
        let handle = api.open("test-session", callbacks).unwrap();
        api.feed("test-session", record());
        api.feed("test-session", record());
        api.close(handle).unwrap();
        let err = api.process(handle).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(RECORDS_SEEN.load(Ordering::SeqCst), 2);
    }
}
