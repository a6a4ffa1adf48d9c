//! Contracts of the external collaborators the pipeline leans on.
//!
//! Each of these is implemented outside the core: the handle
//! snapshotter, the object-type store, the device-name mapper, the
//! executable parser and the filter expression engine. The core only
//! depends on the shapes below.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::event::Event;
use crate::process::{HandleInfo, PeMetadata};

/// Well-known object type names.
pub mod otypes {
    pub const KEY: &str = "Key";
    pub const FILE: &str = "File";
    pub const DRIVER: &str = "Driver";
    pub const MUTANT: &str = "Mutant";
    pub const SECTION: &str = "Section";
    pub const ALPC_PORT: &str = "ALPC Port";
}

#[derive(Debug, Error)]
pub enum PdkError {
    #[error(transparent)]
    Param(#[from] etw_common::params::ParamError),
    #[error("{0}")]
    Other(String),
}

/// Compiled filter expression. Events it rejects never reach the output.
pub trait Filter: Send + Sync {
    fn run(&self, event: &Event) -> bool;
}

pub type HandleCreateCallback = Box<dyn Fn(u32, HandleInfo) + Send + Sync>;
pub type HandleDestroyCallback = Box<dyn Fn(u32, u64) + Send + Sync>;

/// Owner of the system-wide handle model.
pub trait HandleSnapshotter: Send + Sync {
    fn find_handles(&self, pid: u32) -> Result<Vec<HandleInfo>, PdkError>;
    fn register_create_callback(&self, cb: HandleCreateCallback);
    fn register_destroy_callback(&self, cb: HandleDestroyCallback);
    fn write(&self, event: &Event) -> Result<(), PdkError>;
    fn remove(&self, event: &Event) -> Result<(), PdkError>;
}

/// Store mapping object type identifiers to their names.
pub trait ObjectTypeStore: Send + Sync {
    fn find_by_id(&self, id: u8) -> Option<String>;
    fn register_type(&self, id: u8, name: &str);
}

/// Plain in-memory type store. The production store persists across
/// sessions; this one covers everything the core itself needs.
#[derive(Default)]
pub struct InMemoryObjectTypeStore {
    types: RwLock<HashMap<u8, String>>,
}

impl ObjectTypeStore for InMemoryObjectTypeStore {
    fn find_by_id(&self, id: u8) -> Option<String> {
        self.types.read().expect("type store poisoned").get(&id).cloned()
    }

    fn register_type(&self, id: u8, name: &str) {
        self.types
            .write()
            .expect("type store poisoned")
            .insert(id, name.to_string());
    }
}

/// Maps kernel device names to user-facing drive paths.
pub trait DevMapper: Send + Sync {
    fn convert(&self, name: &str) -> String;
}

/// Portable-executable metadata reader. Failures are non-fatal.
pub trait PeReader: Send + Sync {
    fn read(&self, path: &str) -> Result<PeMetadata, PdkError>;
}
