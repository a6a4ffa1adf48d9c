//! Trace-session contract and the C-ABI callback trampoline.
//!
//! The OS invokes the buffer and record callbacks from threads it owns,
//! so the registration surface is a plain function-pointer pair plus an
//! opaque context pointer. Consumers route their shared state through
//! the context; the pointed-at value must be `Sync` and must outlive the
//! session (the consumer leaks one `Arc` reference per registration).

use std::ffi::c_void;

use thiserror::Error;

use crate::os::OsError;
use crate::record::EventRecord;

/// Callback return value instructing the tracer to keep delivering.
pub const CALLBACK_CONTINUE: u32 = 1;

pub type BufferCallbackFn = unsafe extern "system" fn(context: *mut c_void, buffers_read: u32) -> u32;
pub type RecordCallbackFn =
    unsafe extern "system" fn(context: *mut c_void, record: *const EventRecord) -> u32;

/// Function-pointer trampoline registered on a trace session.
#[derive(Clone, Copy)]
pub struct TraceCallbacks {
    pub context: *mut c_void,
    pub on_buffer: BufferCallbackFn,
    pub on_record: RecordCallbackFn,
}

// The context points at Sync state by contract and the function pointers
// carry no captures.
unsafe impl Send for TraceCallbacks {}
unsafe impl Sync for TraceCallbacks {}

impl TraceCallbacks {
    /// Invokes the buffer-statistics callback the way the tracer would.
    pub fn dispatch_buffer(&self, buffers_read: u32) -> u32 {
        unsafe { (self.on_buffer)(self.context, buffers_read) }
    }

    /// Invokes the per-record callback the way the tracer would. The
    /// record is only borrowed for the duration of the call.
    pub fn dispatch_record(&self, record: &EventRecord) -> u32 {
        unsafe { (self.on_record)(self.context, record as *const EventRecord) }
    }
}

/// Opaque identifier of an open trace session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceHandle(pub u64);

impl TraceHandle {
    pub const INVALID: TraceHandle = TraceHandle(u64::MAX);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("unable to open trace session {session}: {source}")]
    Open {
        session: String,
        #[source]
        source: OsError,
    },
    /// The session was stopped underneath the processing loop. This is
    /// the normal shutdown signal, not a failure.
    #[error("trace processing cancelled")]
    Cancelled,
    #[error("trace processing failed for session {session}: {source}")]
    Processing {
        session: String,
        #[source]
        source: OsError,
    },
    #[error("unable to close trace handle: {0}")]
    Close(#[source] OsError),
    #[error("invalid trace handle")]
    InvalidHandle,
}

impl TraceError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TraceError::Cancelled)
    }
}

/// Contract of the OS tracing wrapper.
pub trait TraceApi: Send + Sync + 'static {
    /// Opens the named logger session in real-time mode and registers
    /// the callback trampoline on it.
    fn open(&self, session: &str, callbacks: TraceCallbacks) -> Result<TraceHandle, TraceError>;

    /// Drives the session's buffer ring. Blocks the calling thread for
    /// the lifetime of the session and returns [`TraceError::Cancelled`]
    /// when the session is stopped.
    fn process(&self, handle: TraceHandle) -> Result<(), TraceError>;

    fn close(&self, handle: TraceHandle) -> Result<(), TraceError>;
}
