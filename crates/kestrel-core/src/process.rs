//! Live process-state types owned by the snapshotter.

use std::collections::BTreeMap;
use std::sync::{RwLock, Weak};
use std::time::SystemTime;

use etw_common::params::{ParamName, Params};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadInfo {
    pub tid: u32,
    pub ustack_base: u64,
    pub ustack_limit: u64,
    pub kstack_base: u64,
    pub kstack_limit: u64,
    pub io_prio: u8,
    pub base_prio: u8,
    pub page_prio: u8,
    pub entrypoint: u64,
}

impl ThreadInfo {
    /// Builds thread info from event parameters, defaulting fields the
    /// record did not carry.
    pub fn from_params(params: &Params) -> ThreadInfo {
        ThreadInfo {
            tid: params.tid().unwrap_or_default(),
            ustack_base: params.get_hex(ParamName::UstackBase).unwrap_or_default(),
            ustack_limit: params.get_hex(ParamName::UstackLimit).unwrap_or_default(),
            kstack_base: params.get_hex(ParamName::KstackBase).unwrap_or_default(),
            kstack_limit: params.get_hex(ParamName::KstackLimit).unwrap_or_default(),
            io_prio: params.get_u8(ParamName::IoPrio).unwrap_or_default(),
            base_prio: params.get_u8(ParamName::BasePrio).unwrap_or_default(),
            page_prio: params.get_u8(ParamName::PagePrio).unwrap_or_default(),
            entrypoint: params.get_hex(ParamName::StartAddress).unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub size: u32,
    pub checksum: u32,
    pub base_address: u64,
    pub default_base_address: u64,
}

impl ModuleInfo {
    pub fn from_params(params: &Params) -> ModuleInfo {
        ModuleInfo {
            name: params
                .get_str(ParamName::ImageFilename)
                .unwrap_or_default()
                .to_string(),
            size: params.get_u32(ParamName::ImageSize).unwrap_or_default(),
            checksum: params.get_u32(ParamName::ImageChecksum).unwrap_or_default(),
            base_address: params.get_hex(ParamName::ImageBase).unwrap_or_default(),
            default_base_address: params
                .get_hex(ParamName::ImageDefaultBase)
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HandleInfo {
    /// Raw OS handle value.
    pub raw: u64,
    pub type_id: u8,
    /// Object type name, resolved lazily.
    pub type_name: String,
    /// Object name; may stay empty until the event is paired.
    pub name: String,
    pub pid: u32,
}

/// Parsed portable-executable metadata. Reading it is best effort.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeMetadata {
    pub sections: u16,
    pub symbols: u32,
    pub image_base: u64,
    pub entry_point: u64,
    pub link_time: Option<SystemTime>,
}

/// Authoritative in-memory model of one live process.
///
/// Identity fields are fixed at construction. The thread, module and
/// handle sets mutate under interior locks for the lifetime of the
/// record. The parent back-reference is weak: a child never keeps its
/// parent record alive.
#[derive(Debug, Default)]
pub struct ProcessRecord {
    pub pid: u32,
    pub ppid: u32,
    /// Image name, e.g. `svchost.exe`.
    pub name: String,
    /// Full executable path.
    pub exe: String,
    /// Normalized command line.
    pub cmdline: String,
    pub sid: String,
    pub session_id: u8,
    pub pe: Option<PeMetadata>,
    pub cwd: Option<String>,
    pub envs: Vec<(String, String)>,
    parent: RwLock<Weak<ProcessRecord>>,
    threads: RwLock<BTreeMap<u32, ThreadInfo>>,
    modules: RwLock<Vec<ModuleInfo>>,
    handles: RwLock<Vec<HandleInfo>>,
}

impl ProcessRecord {
    pub fn new(
        pid: u32,
        ppid: u32,
        name: String,
        cmdline: String,
        exe: String,
        sid: String,
        session_id: u8,
    ) -> ProcessRecord {
        ProcessRecord {
            pid,
            ppid,
            name,
            exe,
            cmdline,
            sid,
            session_id,
            ..Default::default()
        }
    }

    pub fn parent(&self) -> Option<std::sync::Arc<ProcessRecord>> {
        self.parent.read().expect("parent lock poisoned").upgrade()
    }

    pub fn set_parent(&self, parent: Weak<ProcessRecord>) {
        *self.parent.write().expect("parent lock poisoned") = parent;
    }

    pub fn clear_parent(&self) {
        self.set_parent(Weak::new());
    }

    pub fn add_thread(&self, thread: ThreadInfo) {
        self.threads
            .write()
            .expect("thread lock poisoned")
            .insert(thread.tid, thread);
    }

    pub fn remove_thread(&self, tid: u32) -> bool {
        self.threads
            .write()
            .expect("thread lock poisoned")
            .remove(&tid)
            .is_some()
    }

    pub fn has_thread(&self, tid: u32) -> bool {
        self.threads
            .read()
            .expect("thread lock poisoned")
            .contains_key(&tid)
    }

    pub fn threads(&self) -> Vec<ThreadInfo> {
        self.threads
            .read()
            .expect("thread lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Appends a module. Repeated loads of the same image legitimately
    /// produce repeated entries.
    pub fn add_module(&self, module: ModuleInfo) {
        self.modules
            .write()
            .expect("module lock poisoned")
            .push(module);
    }

    /// Removes exactly one module matching the given name.
    pub fn remove_module(&self, name: &str) -> bool {
        let mut modules = self.modules.write().expect("module lock poisoned");
        match modules.iter().position(|m| m.name == name) {
            Some(idx) => {
                modules.remove(idx);
                true
            }
            None => false,
        }
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules
            .read()
            .expect("module lock poisoned")
            .iter()
            .any(|m| m.name == name)
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        self.modules.read().expect("module lock poisoned").clone()
    }

    pub fn add_handle(&self, handle: HandleInfo) {
        self.handles
            .write()
            .expect("handle lock poisoned")
            .push(handle);
    }

    pub fn remove_handle(&self, raw: u64) -> bool {
        let mut handles = self.handles.write().expect("handle lock poisoned");
        match handles.iter().position(|h| h.raw == raw) {
            Some(idx) => {
                handles.remove(idx);
                true
            }
            None => false,
        }
    }

    /// Replaces the whole handle set, used when the record is seeded
    /// from a handle enumeration.
    pub fn set_handles(&self, new: Vec<HandleInfo>) {
        *self.handles.write().expect("handle lock poisoned") = new;
    }

    pub fn handles(&self) -> Vec<HandleInfo> {
        self.handles.read().expect("handle lock poisoned").clone()
    }
}
