//! The closed set of event types the pipeline understands.

use serde::{Deserialize, Serialize};

/// Coarse grouping of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
pub enum Category {
    Process,
    Thread,
    Image,
    File,
    Registry,
    Net,
    Handle,
    Other,
}

/// Event type tag. Wire identifiers outside this set decode to nothing
/// and never enter the pipeline.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum EventKind {
    CreateProcess,
    TerminateProcess,
    ProcessRundown,
    OpenProcess,
    CreateThread,
    TerminateThread,
    ThreadRundown,
    OpenThread,
    LoadImage,
    UnloadImage,
    ImageRundown,
    CreateFile,
    CloseFile,
    ReadFile,
    WriteFile,
    DeleteFile,
    FileRundown,
    RegOpenKey,
    RegCreateKey,
    RegSetValue,
    RegQueryValue,
    RegDeleteKey,
    Send,
    Recv,
    Connect,
    Disconnect,
    Accept,
    CreateHandle,
    CloseHandle,
    HandleRundown,
}

/// Wire identifier table. Identifiers are grouped per category so the
/// decoder stays a plain match in both directions.
const WIRE_TABLE: &[(u16, EventKind)] = &[
    (1, EventKind::CreateProcess),
    (2, EventKind::TerminateProcess),
    (3, EventKind::ProcessRundown),
    (4, EventKind::OpenProcess),
    (10, EventKind::CreateThread),
    (11, EventKind::TerminateThread),
    (12, EventKind::ThreadRundown),
    (13, EventKind::OpenThread),
    (20, EventKind::LoadImage),
    (21, EventKind::UnloadImage),
    (22, EventKind::ImageRundown),
    (30, EventKind::CreateFile),
    (31, EventKind::CloseFile),
    (32, EventKind::ReadFile),
    (33, EventKind::WriteFile),
    (34, EventKind::DeleteFile),
    (35, EventKind::FileRundown),
    (40, EventKind::RegOpenKey),
    (41, EventKind::RegCreateKey),
    (42, EventKind::RegSetValue),
    (43, EventKind::RegQueryValue),
    (44, EventKind::RegDeleteKey),
    (50, EventKind::Send),
    (51, EventKind::Recv),
    (52, EventKind::Connect),
    (53, EventKind::Disconnect),
    (54, EventKind::Accept),
    (60, EventKind::CreateHandle),
    (61, EventKind::CloseHandle),
    (62, EventKind::HandleRundown),
];

impl EventKind {
    pub fn from_wire(id: u16) -> Option<EventKind> {
        WIRE_TABLE
            .iter()
            .find(|(wire, _)| *wire == id)
            .map(|(_, kind)| *kind)
    }

    pub fn wire_id(self) -> u16 {
        WIRE_TABLE
            .iter()
            .find(|(_, kind)| *kind == self)
            .map(|(wire, _)| *wire)
            .expect("every kind has a wire identifier")
    }

    pub fn category(self) -> Category {
        use EventKind::*;
        match self {
            CreateProcess | TerminateProcess | ProcessRundown | OpenProcess => Category::Process,
            CreateThread | TerminateThread | ThreadRundown | OpenThread => Category::Thread,
            LoadImage | UnloadImage | ImageRundown => Category::Image,
            CreateFile | CloseFile | ReadFile | WriteFile | DeleteFile | FileRundown => {
                Category::File
            }
            RegOpenKey | RegCreateKey | RegSetValue | RegQueryValue | RegDeleteKey => {
                Category::Registry
            }
            Send | Recv | Connect | Disconnect | Accept => Category::Net,
            CreateHandle | CloseHandle | HandleRundown => Category::Handle,
        }
    }

    /// Rundown events are emitted at session start to describe state
    /// that already exists.
    pub fn is_rundown(self) -> bool {
        matches!(
            self,
            EventKind::ProcessRundown
                | EventKind::ThreadRundown
                | EventKind::ImageRundown
                | EventKind::FileRundown
                | EventKind::HandleRundown
        )
    }

    /// State events exist solely to seed internal state. They are kept
    /// in the output only while a capture is being written.
    pub fn is_state(self) -> bool {
        self.is_rundown()
    }

    pub fn is_create_process(self) -> bool {
        self == EventKind::CreateProcess
    }

    pub fn is_terminate_process(self) -> bool {
        self == EventKind::TerminateProcess
    }

    pub fn is_terminate_thread(self) -> bool {
        self == EventKind::TerminateThread
    }
}
