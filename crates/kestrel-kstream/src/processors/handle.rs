//! Handle event processor: object-type resolution, per-type name
//! canonicalization and pairing of half-formed create events with their
//! close counterparts.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etw_common::os::{DriverEnum, HandleApi};
use etw_common::params::{ParamName, ParamValue};
use kestrel_core::event::Event;
use kestrel_core::kind::EventKind;
use kestrel_core::metrics::Metrics;
use kestrel_core::pdk::{otypes, DevMapper, HandleSnapshotter, ObjectTypeStore};

use crate::keys;
use crate::processors::{Processor, ProcessorError, ProcessorOutput};
use crate::resolver::HandleNameResolver;

/// Create events waiting for the close event that carries their name,
/// keyed by the kernel object pointer. Bounded: when full, the oldest
/// entry is evicted and counted.
struct PendingTable {
    map: HashMap<u64, Event>,
    order: VecDeque<u64>,
    cap: usize,
}

impl PendingTable {
    fn new(cap: usize) -> PendingTable {
        PendingTable {
            map: HashMap::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Inserts an entry, returning how many old entries were evicted to
    /// make room.
    fn insert(&mut self, object: u64, event: Event) -> i64 {
        let mut evicted = 0;
        if !self.map.contains_key(&object) {
            while self.map.len() >= self.cap {
                // the queue may hold keys already drained by a match
                match self.order.pop_front() {
                    Some(stale) => {
                        if self.map.remove(&stale).is_some() {
                            evicted += 1;
                        }
                    }
                    None => break,
                }
            }
        }
        if self.map.insert(object, event).is_none() {
            self.order.push_back(object);
        }
        evicted
    }

    fn remove(&mut self, object: u64) -> Option<Event> {
        self.map.remove(&object)
    }
}

pub struct HandleProcessor {
    hsnap: Arc<dyn HandleSnapshotter>,
    type_store: Arc<dyn ObjectTypeStore>,
    dev_mapper: Arc<dyn DevMapper>,
    handle_api: Arc<dyn HandleApi>,
    drivers: Arc<dyn DriverEnum>,
    resolver: HandleNameResolver,
    wait_timeout: Duration,
    pending: Mutex<PendingTable>,
    metrics: Arc<Metrics>,
}

impl HandleProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        hsnap: Arc<dyn HandleSnapshotter>,
        type_store: Arc<dyn ObjectTypeStore>,
        dev_mapper: Arc<dyn DevMapper>,
        handle_api: Arc<dyn HandleApi>,
        drivers: Arc<dyn DriverEnum>,
        resolver: HandleNameResolver,
        wait_timeout: Duration,
        pending_cap: usize,
        metrics: Arc<Metrics>,
    ) -> HandleProcessor {
        HandleProcessor {
            hsnap,
            type_store,
            dev_mapper,
            handle_api,
            drivers,
            resolver,
            wait_timeout,
            pending: Mutex::new(PendingTable::new(pending_cap)),
            metrics,
        }
    }

    fn process_handle(&self, mut event: Event) -> ProcessorOutput {
        macro_rules! param {
            ($expr:expr) => {
                match $expr {
                    Ok(value) => value,
                    Err(err) => return ProcessorOutput::Failed(event, err.into()),
                }
            };
        }

        let handle_id = param!(event.params.get_u32(ParamName::HandleId));
        let type_id = param!(event.params.get_u16(ParamName::HandleObjectTypeId)) as u8;
        let object = param!(event.params.get_hex(ParamName::HandleObject));

        // map the type identifier to its name, querying the OS when the
        // store has no answer yet
        let type_name = match self.type_store.find_by_id(type_id) {
            Some(name) => name,
            None => match self.query_type(handle_id, event.pid) {
                Ok(name) => {
                    self.type_store.register_type(type_id, &name);
                    name
                }
                Err(err) => return ProcessorOutput::Failed(event, err),
            },
        };
        event.params.append(
            ParamName::HandleObjectTypeName,
            ParamValue::AnsiStr(type_name.clone()),
        );
        event.params.remove(ParamName::HandleObjectTypeId);

        let mut name = param!(event
            .params
            .get_str(ParamName::HandleObjectName)
            .map(str::to_string));

        // rundowns enumerate pre-existing handles whose names were never
        // delivered; the query can deadlock, hence the guarded resolver
        if event.kind == EventKind::HandleRundown && name.is_empty() {
            match self
                .resolver
                .resolve_with_timeout(u64::from(handle_id), self.wait_timeout)
            {
                Ok(resolved) => name = resolved,
                Err(err) => log::debug!("name resolution for handle {handle_id:#x}: {err}"),
            }
        }

        match type_name.as_str() {
            otypes::KEY => name = keys::format(&name),
            otypes::FILE => name = self.dev_mapper.convert(&name),
            otypes::DRIVER => {
                let driver_name = format!("{}.sys", name.trim_start_matches("\\Driver\\"));
                for driver in self.drivers.enum_drivers() {
                    if basename(&driver.filename).eq_ignore_ascii_case(&driver_name) {
                        event.params.append(
                            ParamName::ImageFilename,
                            ParamValue::FilePath(driver.filename.clone()),
                        );
                    }
                }
            }
            _ => {}
        }
        if let Err(err) = event
            .params
            .set(ParamName::HandleObjectName, ParamValue::Utf16Str(name.clone()))
        {
            return ProcessorOutput::Failed(event, err.into());
        }

        if event.kind == EventKind::CreateHandle {
            // some objects surface their name only on the close event;
            // withhold the create until its counterpart arrives
            if name.is_empty() {
                let evicted = self
                    .pending
                    .lock()
                    .expect("pending table poisoned")
                    .insert(object, event);
                if evicted > 0 {
                    self.metrics.handle_pending_evictions.add(evicted);
                }
                return ProcessorOutput::Withheld;
            }
            return match self.hsnap.write(&event) {
                Ok(()) => ProcessorOutput::Done(event),
                Err(err) => ProcessorOutput::Failed(event, err.into()),
            };
        }

        if event.kind == EventKind::CloseHandle {
            let held = self
                .pending
                .lock()
                .expect("pending table poisoned")
                .remove(object);
            if let Some(mut create) = held {
                // complete the held create with the name the close
                // event carried and publish it instead
                create
                    .params
                    .append(ParamName::HandleObjectName, ParamValue::Utf16Str(name));
                if type_name == otypes::DRIVER {
                    if let Ok(filename) = event.params.get_str(ParamName::ImageFilename) {
                        create.params.append(
                            ParamName::ImageFilename,
                            ParamValue::FilePath(filename.to_string()),
                        );
                    }
                }
                self.metrics.handle_deferred_matches.inc();
                if let Err(err) = self.hsnap.write(&create) {
                    return ProcessorOutput::Failed(event, err.into());
                }
                if let Err(err) = self.hsnap.remove(&event) {
                    return ProcessorOutput::Failed(event, err.into());
                }
                return ProcessorOutput::Done(create);
            }
            return match self.hsnap.remove(&event) {
                Ok(()) => ProcessorOutput::Done(event),
                Err(err) => ProcessorOutput::Failed(event, err.into()),
            };
        }

        // handle rundowns seed the snapshot
        match self.hsnap.write(&event) {
            Ok(()) => ProcessorOutput::Done(event),
            Err(err) => ProcessorOutput::Failed(event, err.into()),
        }
    }

    fn query_type(&self, handle_id: u32, pid: u32) -> Result<String, ProcessorError> {
        let duplicate = self.handle_api.duplicate(handle_id, pid)?;
        let type_name = duplicate.query_type()?;
        Ok(type_name)
    }
}

impl Processor for HandleProcessor {
    fn name(&self) -> &'static str {
        "handle"
    }

    fn process(&self, event: Event) -> ProcessorOutput {
        if event.category != kestrel_core::kind::Category::Handle {
            return ProcessorOutput::Next(event);
        }
        self.process_handle(event)
    }
}

fn basename(path: &str) -> &str {
    path.rsplit(['\\', '/']).next().unwrap_or(path)
}
