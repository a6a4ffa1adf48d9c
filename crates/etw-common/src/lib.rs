//! Wire-level record model and OS contracts shared by the event pipeline.
//!
//! The concrete wrappers around the event-tracing and process APIs live
//! outside this workspace. This crate pins down the shapes they must
//! provide: the decoded [`record::EventRecord`] delivered to the trace
//! callbacks, the [`trace::TraceApi`] session contract together with the
//! C-ABI callback trampoline, and the process/handle query contracts in
//! [`os`]. In-memory stand-ins for all of them live in [`test_utils`].

pub mod os;
pub mod params;
pub mod record;
pub mod test_utils;
pub mod trace;

pub use os::{AccessProfile, OsError};
pub use params::{ParamError, ParamName, ParamValue, Params};
pub use record::{EventRecord, RecordHeader};
pub use trace::{TraceCallbacks, TraceError, TraceHandle};
