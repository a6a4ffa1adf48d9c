use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use etw_common::os::{AccessProfile, ProcessApi};
use etw_common::params::{ParamError, ParamName};
use kestrel_core::config::KstreamConfig;
use kestrel_core::event::Event;
use kestrel_core::kind::EventKind;
use kestrel_core::metrics::Metrics;
use kestrel_core::pdk::{HandleSnapshotter, PeReader};
use kestrel_core::process::{ModuleInfo, ProcessRecord, ThreadInfo};
use thiserror::Error;
use tokio::sync::watch;

/// Parent pid placeholder for records whose parent could not be
/// determined.
pub const INVALID_PID: u32 = u32::MAX;

#[derive(Debug, Error)]
pub enum PsError {
    #[error(transparent)]
    Param(#[from] ParamError),
}

/// Thread-safe owner of all live [`ProcessRecord`]s.
///
/// Two construction modes exist: live, which consults the OS to enrich
/// records and runs a background reaper, and replay, which is populated
/// purely from capture events and never touches the OS.
pub struct ProcessSnapshotter {
    procs: RwLock<HashMap<u32, Arc<ProcessRecord>>>,
    hsnap: Arc<dyn HandleSnapshotter>,
    process_api: Arc<dyn ProcessApi>,
    pe: Arc<dyn PeReader>,
    metrics: Arc<Metrics>,
    capture: bool,
    quit: Option<watch::Sender<()>>,
}

impl ProcessSnapshotter {
    /// Live snapshotter. Spawns the dead-process reaper, so a tokio
    /// runtime must be entered.
    pub fn new(
        hsnap: Arc<dyn HandleSnapshotter>,
        process_api: Arc<dyn ProcessApi>,
        pe: Arc<dyn PeReader>,
        config: &KstreamConfig,
        metrics: Arc<Metrics>,
    ) -> Arc<ProcessSnapshotter> {
        let (tx, rx) = watch::channel(());
        let snap = Arc::new(ProcessSnapshotter {
            procs: RwLock::new(HashMap::new()),
            hsnap,
            process_api,
            pe,
            metrics,
            capture: false,
            quit: Some(tx),
        });
        snap.register_handle_callbacks();
        Self::spawn_reaper(&snap, config.reap_interval(), rx);
        snap
    }

    /// Replay snapshotter, restored from a capture. Never consults the
    /// OS and runs no reaper.
    pub fn new_from_capture(
        hsnap: Arc<dyn HandleSnapshotter>,
        process_api: Arc<dyn ProcessApi>,
        pe: Arc<dyn PeReader>,
        metrics: Arc<Metrics>,
    ) -> Arc<ProcessSnapshotter> {
        let snap = Arc::new(ProcessSnapshotter {
            procs: RwLock::new(HashMap::new()),
            hsnap,
            process_api,
            pe,
            metrics,
            capture: true,
            quit: None,
        });
        snap.register_handle_callbacks();
        snap
    }

    /// Initializes a record from a CreateProcess or ProcessRundown event
    /// and inserts it. The freshest record is attached to the event: for
    /// CreateProcess that is the creator's record looked up by the
    /// event's originating pid, otherwise the new record itself.
    pub fn write(&self, event: &mut Event) -> Result<(), PsError> {
        let pid = event.params.pid()?;
        let ppid = event.params.ppid()?;
        let proc = Arc::new(self.init_proc(pid, ppid, event));
        let mut procs = self.procs.write().expect("process index poisoned");
        if event.is_rundown() && procs.contains_key(&pid) {
            event.mark_rundown_processed();
        }
        if let Some(parent) = procs.get(&ppid) {
            proc.set_parent(Arc::downgrade(parent));
        }
        procs.insert(pid, proc.clone());
        self.metrics.process_count.inc();
        event.ps = if event.is_create_process() {
            procs.get(&event.pid).cloned()
        } else {
            Some(proc)
        };
        Ok(())
    }

    /// Replay path: adopts the state embedded in capture events instead
    /// of consulting the OS.
    pub fn write_from_capture(&self, event: &mut Event) -> Result<(), PsError> {
        match event.kind {
            EventKind::CreateProcess | EventKind::ProcessRundown => {
                let Some(embedded) = event.ps.clone() else {
                    return Ok(());
                };
                let pid = event.params.pid()?;
                let ppid = event.params.ppid()?;
                let record = if event.kind == EventKind::ProcessRundown {
                    // rundown claiming to be its own parent is bogus
                    if embedded.pid == embedded.ppid {
                        return Ok(());
                    }
                    embedded
                } else {
                    Arc::new(ProcessRecord::new(
                        pid,
                        ppid,
                        event.params.string_of(ParamName::ProcessName),
                        event.params.string_of(ParamName::Cmdline),
                        event.params.string_of(ParamName::Exe),
                        event.params.string_of(ParamName::UserSid),
                        event.params.get_u32(ParamName::SessionId).unwrap_or_default() as u8,
                    ))
                };
                let mut procs = self.procs.write().expect("process index poisoned");
                if let Some(parent) = procs.get(&ppid) {
                    record.set_parent(Arc::downgrade(parent));
                }
                procs.insert(pid, record);
            }
            EventKind::CreateThread | EventKind::ThreadRundown => {
                let pid = event.params.pid()?;
                let procs = self.procs.write().expect("process index poisoned");
                if let Some(proc) = procs.get(&pid) {
                    proc.add_thread(ThreadInfo::from_params(&event.params));
                    self.metrics.thread_count.inc();
                }
            }
            EventKind::LoadImage | EventKind::ImageRundown => {
                let pid = event.params.pid()?;
                let procs = self.procs.write().expect("process index poisoned");
                if let Some(proc) = procs.get(&pid) {
                    proc.add_module(ModuleInfo::from_params(&event.params));
                    self.metrics.module_count.inc();
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Adds a thread to its owning process. Unknown pids are a no-op.
    pub fn add_thread(&self, event: &mut Event) -> Result<(), PsError> {
        let pid = event.params.pid()?;
        let procs = self.procs.write().expect("process index poisoned");
        let Some(proc) = procs.get(&pid) else {
            return Ok(());
        };
        let thread = ThreadInfo::from_params(&event.params);
        if event.is_rundown() && proc.has_thread(thread.tid) {
            // duplicate session snapshot
            event.mark_rundown_processed();
            return Ok(());
        }
        proc.add_thread(thread);
        self.metrics.thread_count.inc();
        Ok(())
    }

    /// Adds a module to its owning process. Repeated loads produce
    /// repeated entries; only duplicate rundowns are skipped.
    pub fn add_module(&self, event: &mut Event) -> Result<(), PsError> {
        let pid = event.params.pid()?;
        let procs = self.procs.write().expect("process index poisoned");
        let Some(proc) = procs.get(&pid) else {
            return Ok(());
        };
        let module = ModuleInfo::from_params(&event.params);
        if event.is_rundown() && proc.has_module(&module.name) {
            event.mark_rundown_processed();
            return Ok(());
        }
        proc.add_module(module);
        self.metrics.module_count.inc();
        Ok(())
    }

    pub fn remove_thread(&self, pid: u32, tid: u32) {
        let procs = self.procs.write().expect("process index poisoned");
        if let Some(proc) = procs.get(&pid) {
            if proc.remove_thread(tid) {
                self.metrics.thread_count.dec();
            }
        }
    }

    pub fn remove_module(&self, pid: u32, name: &str) {
        let procs = self.procs.write().expect("process index poisoned");
        if let Some(proc) = procs.get(&pid) {
            if proc.remove_module(name) {
                self.metrics.module_count.dec();
            }
        }
    }

    /// Deletes the record of a terminated process and clears the parent
    /// pointer of every record that referenced it.
    pub fn remove(&self, event: &Event) -> Result<(), PsError> {
        let pid = event.params.pid()?;
        let mut procs = self.procs.write().expect("process index poisoned");
        procs.remove(&pid);
        self.metrics.process_count.dec();
        for proc in procs.values() {
            if proc.ppid == pid {
                proc.clear_parent();
            }
        }
        Ok(())
    }

    /// Fast lookup by pid. On a miss in live mode the record is
    /// synthesized from what the OS still reveals about the process; in
    /// replay mode a miss stays a miss.
    pub fn find(&self, pid: u32) -> Option<Arc<ProcessRecord>> {
        if let Some(proc) = self
            .procs
            .read()
            .expect("process index poisoned")
            .get(&pid)
        {
            return Some(proc.clone());
        }
        if self.capture {
            return None;
        }
        self.metrics
            .process_lookup_failures
            .add(&pid.to_string(), 1);
        Some(self.lookup(pid))
    }

    pub fn size(&self) -> usize {
        self.procs.read().expect("process index poisoned").len()
    }

    /// Stops the reaper. Records stay queryable until drop.
    pub fn close(&self) {
        if let Some(quit) = &self.quit {
            let _ = quit.send(());
        }
    }

    fn init_proc(&self, pid: u32, ppid: u32, event: &Event) -> ProcessRecord {
        let mut proc = ProcessRecord::new(
            pid,
            ppid,
            event.params.string_of(ParamName::ProcessName),
            event.params.string_of(ParamName::Cmdline),
            event.params.string_of(ParamName::Exe),
            event.params.string_of(ParamName::UserSid),
            event.params.get_u32(ParamName::SessionId).unwrap_or_default() as u8,
        );
        match self.pe.read(&proc.exe) {
            Ok(pe) => proc.pe = Some(pe),
            Err(err) => log::debug!("no PE metadata for {}: {err}", proc.exe),
        }
        match self.hsnap.find_handles(pid) {
            Ok(handles) => proc.set_handles(handles),
            Err(err) => log::debug!("handle enumeration failed for {pid}: {err}"),
        }
        // PEB read gives us environment variables and the working
        // directory. Failure keeps the record usable.
        if let Ok(handle) = self.process_api.open(pid, AccessProfile::QueryInfo) {
            match handle.read_peb() {
                Ok(peb) => {
                    proc.envs = peb.envs;
                    if !peb.cwd.is_empty() {
                        proc.cwd = Some(peb.cwd);
                    }
                }
                Err(err) => {
                    self.metrics.peb_read_errors.inc();
                    log::debug!("PEB read failed for {pid}: {err}");
                }
            }
        }
        proc
    }

    /// Best-effort reconstruction of a process the snapshot has no event
    /// history for. Only a fully-populated record is inserted into the
    /// index; partial results are handed out but not retained.
    fn lookup(&self, pid: u32) -> Arc<ProcessRecord> {
        let mut proc = ProcessRecord::new(
            pid,
            INVALID_PID,
            String::new(),
            String::new(),
            String::new(),
            String::new(),
            0,
        );
        let (handle, limited) = match self.process_api.open(pid, AccessProfile::QueryInfo) {
            Ok(handle) => (handle, false),
            // protected processes reject the broad profile but still
            // reveal their image name through the limited one
            Err(_) => match self.process_api.open(pid, AccessProfile::Limited) {
                Ok(handle) => (handle, true),
                Err(_) => return Arc::new(proc),
            },
        };
        if let Ok(image) = handle.full_image_name() {
            proc.name = basename(&image).to_string();
            proc.exe = image;
        }
        if let Ok(pe) = self.pe.read(&proc.exe) {
            proc.pe = Some(pe);
        }
        if let Ok(info) = handle.basic_info() {
            proc.ppid = info.ppid;
        }
        if let Ok(handles) = self.hsnap.find_handles(pid) {
            proc.set_handles(handles);
        }
        if limited {
            return Arc::new(proc);
        }
        match handle.read_peb() {
            Ok(peb) => {
                proc.envs = peb.envs;
                proc.cmdline = peb.cmdline;
                if !peb.cwd.is_empty() {
                    proc.cwd = Some(peb.cwd);
                }
            }
            Err(_) => {
                self.metrics.peb_read_errors.inc();
                return Arc::new(proc);
            }
        }
        let record = Arc::new(proc);
        let mut procs = self.procs.write().expect("process index poisoned");
        procs.insert(pid, record.clone());
        record
    }

    fn register_handle_callbacks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.hsnap.register_create_callback(Box::new(move |pid, handle| {
            if let Some(snap) = weak.upgrade() {
                let procs = snap.procs.write().expect("process index poisoned");
                if let Some(proc) = procs.get(&pid) {
                    proc.add_handle(handle);
                }
            }
        }));
        let weak = Arc::downgrade(self);
        self.hsnap.register_destroy_callback(Box::new(move |pid, raw| {
            if let Some(snap) = weak.upgrade() {
                let procs = snap.procs.write().expect("process index poisoned");
                if let Some(proc) = procs.get(&pid) {
                    proc.remove_handle(raw);
                }
            }
        }));
    }

    fn spawn_reaper(snap: &Arc<Self>, period: Duration, mut quit: watch::Receiver<()>) {
        let weak = Arc::downgrade(snap);
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut tick = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = quit.changed() => break,
                    _ = tick.tick() => match weak.upgrade() {
                        Some(snap) => snap.reap(),
                        None => break,
                    },
                }
            }
        });
    }

    /// Culls records of processes the OS no longer reports running. This
    /// catches processes whose terminate event was lost.
    fn reap(&self) {
        let mut procs = self.procs.write().expect("process index poisoned");
        let before = procs.len();
        log::debug!("scanning for dead processes across {before} records");
        let api = &self.process_api;
        procs.retain(|pid, _| match api.open(*pid, AccessProfile::Limited) {
            Ok(handle) => handle.is_running(),
            Err(_) => true,
        });
        let reaped = before - procs.len();
        if reaped > 0 {
            self.metrics.process_reaped.add(reaped as i64);
            log::debug!("{reaped} dead process(es) reaped");
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}
