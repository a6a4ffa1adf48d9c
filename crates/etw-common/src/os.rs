//! Process and handle query contracts.

use std::time::SystemTime;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OsError {
    #[error("object not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("{call} failed with status {code:#x}")]
    Api { call: &'static str, code: u32 },
}

/// Access-right profiles used when opening a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessProfile {
    /// Query information plus virtual-memory read, enough to reach the
    /// process environment block.
    QueryInfo,
    /// Limited information only. Protected processes reject the broader
    /// profile but still grant this one.
    Limited,
}

/// Process environment block projection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Peb {
    pub cmdline: String,
    pub cwd: String,
    pub envs: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicInfo {
    pub ppid: u32,
}

/// An open process handle. Dropping it closes the underlying handle.
pub trait ProcessHandle: Send {
    fn full_image_name(&self) -> Result<String, OsError>;
    fn basic_info(&self) -> Result<BasicInfo, OsError>;
    fn start_time(&self) -> Result<SystemTime, OsError>;
    fn read_peb(&self) -> Result<Peb, OsError>;
    fn is_running(&self) -> bool;
}

pub trait ProcessApi: Send + Sync + 'static {
    fn open(&self, pid: u32, access: AccessProfile) -> Result<Box<dyn ProcessHandle>, OsError>;
}

/// A handle duplicated out of another process with all-access rights.
/// Dropping it closes the duplicate.
pub trait DuplicatedHandle: Send {
    fn query_type(&self) -> Result<String, OsError>;
}

pub trait HandleApi: Send + Sync + 'static {
    fn duplicate(&self, handle_id: u32, owner_pid: u32)
        -> Result<Box<dyn DuplicatedHandle>, OsError>;
}

/// Object-name query. Certain object types make this call deadlock
/// inside the kernel, which is why it is only ever issued from the
/// resolver's dedicated worker thread.
pub trait ObjectNameApi: Send + Sync + 'static {
    fn query_object_name(&self, raw_handle: u64) -> Result<String, OsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverInfo {
    pub filename: String,
}

pub trait DriverEnum: Send + Sync + 'static {
    fn enum_drivers(&self) -> Vec<DriverInfo>;
}
