//! Process, thread and image event processor.
//!
//! Runs first in the chain so every downstream stage can read the
//! enriched process fields.

use std::sync::Arc;
use std::time::SystemTime;

use etw_common::os::{AccessProfile, OsError, ProcessApi};
use etw_common::params::{ParamName, ParamValue};
use kestrel_core::event::Event;
use kestrel_core::kind::EventKind;
use kestrel_ps::ProcessSnapshotter;

use crate::cmdline::Cmdline;
use crate::processors::{Processor, ProcessorOutput};

pub struct PsProcessor {
    snap: Arc<ProcessSnapshotter>,
    process_api: Arc<dyn ProcessApi>,
}

impl PsProcessor {
    pub fn new(snap: Arc<ProcessSnapshotter>, process_api: Arc<dyn ProcessApi>) -> PsProcessor {
        PsProcessor { snap, process_api }
    }

    fn enrich(&self, event: &mut Event) -> Result<(), crate::processors::ProcessorError> {
        let cmdline = Cmdline::new(event.params.string_of(ParamName::Cmdline))
            // get rid of quotes around the executable path
            .clean_exe()
            // expand all variations of the SystemRoot variable
            .expand_system_root()
            // some system processes are reported without a path
            .complete_sys_proc(&event.params.string_of(ParamName::ProcessName));

        event
            .params
            .append(ParamName::Exe, ParamValue::FilePath(cmdline.exeline()));
        event
            .params
            .append(ParamName::Cmdline, ParamValue::Utf16Str(cmdline.to_string()));

        if event.is_terminate_process() {
            return Ok(());
        }

        let pid = event.params.pid()?;
        let started = self
            .start_time(pid)
            .unwrap_or(event.timestamp);
        event
            .params
            .append(ParamName::StartTime, ParamValue::Time(started));
        Ok(())
    }

    fn start_time(&self, pid: u32) -> Result<SystemTime, OsError> {
        let handle = self.process_api.open(pid, AccessProfile::Limited)?;
        handle.start_time()
    }
}

impl Processor for PsProcessor {
    fn name(&self) -> &'static str {
        "ps"
    }

    fn process(&self, mut event: Event) -> ProcessorOutput {
        match event.kind {
            EventKind::CreateProcess | EventKind::TerminateProcess | EventKind::ProcessRundown => {
                if let Err(err) = self.enrich(&mut event) {
                    return ProcessorOutput::Failed(event, err);
                }
                let result = if event.is_terminate_process() {
                    self.snap.remove(&event)
                } else {
                    self.snap.write(&mut event)
                };
                match result {
                    Ok(()) => ProcessorOutput::Done(event),
                    Err(err) => ProcessorOutput::Failed(event, err.into()),
                }
            }
            EventKind::CreateThread | EventKind::ThreadRundown => {
                match self.snap.add_thread(&mut event) {
                    Ok(()) => ProcessorOutput::Done(event),
                    Err(err) => ProcessorOutput::Failed(event, err.into()),
                }
            }
            EventKind::TerminateThread => {
                let (pid, tid) = match (event.params.pid(), event.params.tid()) {
                    (Ok(pid), Ok(tid)) => (pid, tid),
                    (Err(err), _) | (_, Err(err)) => {
                        return ProcessorOutput::Failed(event, err.into())
                    }
                };
                self.snap.remove_thread(pid, tid);
                ProcessorOutput::Done(event)
            }
            EventKind::LoadImage | EventKind::ImageRundown => {
                match self.snap.add_module(&mut event) {
                    Ok(()) => ProcessorOutput::Done(event),
                    Err(err) => ProcessorOutput::Failed(event, err.into()),
                }
            }
            EventKind::UnloadImage => {
                let pid = match event.params.pid() {
                    Ok(pid) => pid,
                    Err(err) => return ProcessorOutput::Failed(event, err.into()),
                };
                let name = event.params.string_of(ParamName::ImageFilename);
                self.snap.remove_module(pid, &name);
                ProcessorOutput::Done(event)
            }
            EventKind::OpenProcess | EventKind::OpenThread => {
                // augment the audit observation with the identity of
                // the target process
                let pid = match event.params.pid() {
                    Ok(pid) => pid,
                    Err(err) => return ProcessorOutput::Failed(event, err.into()),
                };
                if let Some(proc) = self.snap.find(pid) {
                    event
                        .params
                        .append(ParamName::Exe, ParamValue::FilePath(proc.exe.clone()));
                    event.params.append(
                        ParamName::ProcessName,
                        ParamValue::AnsiStr(proc.name.clone()),
                    );
                }
                ProcessorOutput::Done(event)
            }
            _ => ProcessorOutput::Next(event),
        }
    }
}
