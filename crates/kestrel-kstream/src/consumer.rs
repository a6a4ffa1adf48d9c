//! Trace-session consumer: opens the configured logger sessions,
//! receives raw records on OS-owned callback threads, drives them
//! through the processor chain and publishes the survivors.

use std::ffi::c_void;
use std::sync::{Arc, Mutex, RwLock};

use etw_common::record::EventRecord;
use etw_common::trace::{
    TraceApi, TraceCallbacks, TraceError, TraceHandle, CALLBACK_CONTINUE,
};
use etw_common::os::{DriverEnum, HandleApi, ObjectNameApi, ProcessApi};
use kestrel_core::config::KstreamConfig;
use kestrel_core::event::Event;
use kestrel_core::metrics::Metrics;
use kestrel_core::pdk::{DevMapper, Filter, HandleSnapshotter, ObjectTypeStore};
use kestrel_core::sequencer::{Sequencer, SequencerError};
use kestrel_ps::ProcessSnapshotter;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::processors::{Chain, ChainOutput, HandleProcessor, ProcessorError, PsProcessor};
use crate::resolver::HandleNameResolver;

/// Output channel depth. A full channel blocks the callback thread,
/// which applies natural backpressure on the session buffers.
const EVENTS_CHANNEL_CAP: usize = 500;
/// Error channel depth. Overflowing errors are dropped and counted.
const ERRORS_CHANNEL_CAP: usize = 1000;

pub type EventCallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;
/// Per-event sink invoked on the delivering thread. When installed, the
/// output channel is bypassed.
pub type EventCallback = Box<dyn Fn(Event) -> Result<(), EventCallbackError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum KstreamError {
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
    #[error(transparent)]
    Sequencer(#[from] SequencerError),
    #[error("event callback failed: {0}")]
    Callback(#[source] EventCallbackError),
    #[error("event output channel closed")]
    ChannelClosed,
}

/// Concrete OS wrappers the consumer and its processors call into.
pub struct OsContext {
    pub trace_api: Arc<dyn TraceApi>,
    pub process_api: Arc<dyn ProcessApi>,
    pub handle_api: Arc<dyn HandleApi>,
    pub object_name_api: Arc<dyn ObjectNameApi>,
    pub drivers: Arc<dyn DriverEnum>,
}

/// Shared state reachable from the OS callbacks through the context
/// pointer of the trampoline.
struct CallbackCtx {
    sequencer: Arc<Sequencer>,
    chain: Chain,
    psnap: Arc<ProcessSnapshotter>,
    config: KstreamConfig,
    capture: bool,
    own_pid: u32,
    filter: RwLock<Option<Box<dyn Filter>>>,
    event_callback: RwLock<Option<EventCallback>>,
    events_tx: mpsc::Sender<Event>,
    errors_tx: mpsc::Sender<KstreamError>,
    metrics: Arc<Metrics>,
}

impl CallbackCtx {
    fn process_record(&self, record: &EventRecord) -> Result<(), KstreamError> {
        let Some(event) = Event::decode(self.sequencer.get(), record) else {
            return Ok(());
        };
        match self.chain.run(event) {
            ChainOutput::Cancelled => {
                self.metrics.upstream_cancellations.inc();
                Ok(())
            }
            ChainOutput::Failed(mut event, err) => {
                event.release();
                Err(KstreamError::Processor(err))
            }
            ChainOutput::Ok(event) => self.publish(event),
        }
    }

    fn publish(&self, mut event: Event) -> Result<(), KstreamError> {
        // capture-mode events already carry their record; everything
        // else picks it up from the snapshot
        let proc = self.psnap.find(event.pid);
        if event.ps.is_none() {
            event.ps = proc.clone();
        }
        if self.config.excludes_image(proc.as_deref()) {
            event.release();
            self.metrics.excluded_procs.inc();
            return Ok(());
        }
        if self.is_dropped(&event) {
            event.release();
            return Ok(());
        }
        if !event.is_state() {
            self.sequencer.increment();
        }
        {
            let callback = self.event_callback.read().expect("callback lock poisoned");
            if let Some(cb) = callback.as_ref() {
                return cb(event).map_err(KstreamError::Callback);
            }
        }
        self.events_tx
            .blocking_send(event)
            .map_err(|_| KstreamError::ChannelClosed)?;
        self.metrics.kevents_enqueued.inc();
        Ok(())
    }

    /// Publish ladder, in order: state events survive only while a
    /// capture is written, duplicated rundowns go, self-generated
    /// traffic goes, excluded kinds go, and whatever the expression
    /// filter rejects goes.
    fn is_dropped(&self, event: &Event) -> bool {
        if event.is_state() && !self.capture {
            return true;
        }
        if event.is_rundown() && event.is_rundown_processed() {
            return true;
        }
        if event.pid == self.own_pid {
            return true;
        }
        if self.config.excludes_kind(event.kind) {
            self.metrics.excluded_kevents.inc();
            return true;
        }
        if let Some(filter) = self.filter.read().expect("filter lock poisoned").as_ref() {
            return !filter.run(event);
        }
        false
    }

    fn publish_error(&self, err: KstreamError) {
        if self.errors_tx.try_send(err).is_err() {
            self.metrics.errors_dropped.inc();
            log::warn!("error channel full, dropping error");
        }
    }
}

unsafe extern "system" fn buffer_stats_callback(context: *mut c_void, buffers_read: u32) -> u32 {
    let ctx = &*(context as *const CallbackCtx);
    ctx.metrics.kbuffers_read.add(i64::from(buffers_read));
    CALLBACK_CONTINUE
}

unsafe extern "system" fn process_record_callback(
    context: *mut c_void,
    record: *const EventRecord,
) -> u32 {
    let ctx = &*(context as *const CallbackCtx);
    let record = &*record;
    if let Err(err) = ctx.process_record(record) {
        ctx.metrics.kevents_failures.add(&err.to_string(), 1);
        ctx.publish_error(err);
    }
    CALLBACK_CONTINUE
}

/// Kernel event stream consumer.
pub struct KstreamConsumer {
    trace_api: Arc<dyn TraceApi>,
    ctx: Arc<CallbackCtx>,
    handles: Mutex<Vec<(String, TraceHandle)>>,
    events_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    errors_rx: Mutex<Option<mpsc::Receiver<KstreamError>>>,
}

impl KstreamConsumer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        os: OsContext,
        psnap: Arc<ProcessSnapshotter>,
        hsnap: Arc<dyn HandleSnapshotter>,
        type_store: Arc<dyn ObjectTypeStore>,
        dev_mapper: Arc<dyn DevMapper>,
        sequencer: Arc<Sequencer>,
        config: KstreamConfig,
        metrics: Arc<Metrics>,
    ) -> KstreamConsumer {
        let resolver = HandleNameResolver::new(os.object_name_api.clone(), metrics.clone());
        // the process processor runs first so downstream stages see the
        // enriched process fields; the handle processor closes the chain
        let chain = Chain::new(
            vec![
                Box::new(PsProcessor::new(psnap.clone(), os.process_api.clone())),
                Box::new(HandleProcessor::new(
                    hsnap,
                    type_store,
                    dev_mapper,
                    os.handle_api.clone(),
                    os.drivers.clone(),
                    resolver,
                    config.handle_wait_timeout(),
                    config.pending_handles_cap,
                    metrics.clone(),
                )),
            ],
            metrics.clone(),
        );
        let (events_tx, events_rx) = mpsc::channel(EVENTS_CHANNEL_CAP);
        let (errors_tx, errors_rx) = mpsc::channel(ERRORS_CHANNEL_CAP);
        let capture = config.capture();
        let ctx = Arc::new(CallbackCtx {
            sequencer,
            chain,
            psnap,
            config,
            capture,
            own_pid: std::process::id(),
            filter: RwLock::new(None),
            event_callback: RwLock::new(None),
            events_tx,
            errors_tx,
            metrics,
        });
        KstreamConsumer {
            trace_api: os.trace_api,
            ctx,
            handles: Mutex::new(Vec::new()),
            events_rx: Mutex::new(Some(events_rx)),
            errors_rx: Mutex::new(Some(errors_rx)),
        }
    }

    /// Opens every configured trace session and starts processing it.
    /// Failing to open the kernel-logger session fails the call;
    /// auxiliary sessions are logged and skipped.
    pub fn open_kstream(&self) -> Result<(), KstreamError> {
        for session in &self.ctx.config.sessions {
            match self.open_session(&session.name) {
                Ok(()) => {}
                Err(err) if session.is_kernel_logger() => return Err(err),
                Err(err) => log::warn!("unable to open {} trace: {err}", session.name),
            }
        }
        Ok(())
    }

    fn open_session(&self, name: &str) -> Result<(), KstreamError> {
        // the OS keeps invoking the callbacks for the session lifetime,
        // so one context reference is deliberately leaked per
        // registration
        let context = Arc::into_raw(self.ctx.clone()) as *mut c_void;
        let callbacks = TraceCallbacks {
            context,
            on_buffer: buffer_stats_callback,
            on_record: process_record_callback,
        };
        let handle = self.trace_api.open(name, callbacks)?;
        self.handles
            .lock()
            .expect("handle list poisoned")
            .push((name.to_string(), handle));

        // the processing call blocks its thread for the session
        // lifetime, so it runs off the caller
        let api = self.trace_api.clone();
        let ctx = self.ctx.clone();
        let session = name.to_string();
        tokio::task::spawn_blocking(move || {
            log::info!("starting trace processing for [{session}]");
            let result = api.process(handle);
            log::info!("stopping trace processing for [{session}]");
            match result {
                Ok(()) => {
                    log::info!("trace processing successfully stopped for [{session}]")
                }
                Err(err) if err.is_cancelled() => {
                    if handle.is_valid() {
                        if let Err(err) = api.close(handle) {
                            ctx.publish_error(err.into());
                        }
                    }
                }
                Err(err) => ctx.publish_error(err.into()),
            }
        });
        Ok(())
    }

    /// Closes all open trace sessions, flushes the sequencer and closes
    /// the processor chain. Individual close failures never abort the
    /// shutdown.
    pub fn close_kstream(&self) -> Result<(), KstreamError> {
        for (name, handle) in self.handles.lock().expect("handle list poisoned").drain(..) {
            if let Err(err) = self.trace_api.close(handle) {
                log::warn!("closing trace for [{name}]: {err}");
            }
        }
        if let Err(err) = self.ctx.sequencer.store() {
            log::warn!("{err}");
        }
        if let Err(err) = self.ctx.sequencer.close() {
            log::warn!("{err}");
        }
        self.ctx.chain.close();
        Ok(())
    }

    /// Installs or clears the expression filter. Takes effect on the
    /// next record.
    pub fn set_filter(&self, filter: Option<Box<dyn Filter>>) {
        *self.ctx.filter.write().expect("filter lock poisoned") = filter;
    }

    /// Installs the per-event sink, bypassing the output channel.
    pub fn set_event_callback(&self, callback: EventCallback) {
        *self
            .ctx
            .event_callback
            .write()
            .expect("callback lock poisoned") = Some(callback);
    }

    /// Takes the enriched-event channel. Single consumer.
    pub fn events(&self) -> mpsc::Receiver<Event> {
        self.events_rx
            .lock()
            .expect("events receiver poisoned")
            .take()
            .expect("events receiver already taken")
    }

    /// Takes the background-error channel. Single consumer.
    pub fn errors(&self) -> mpsc::Receiver<KstreamError> {
        self.errors_rx
            .lock()
            .expect("errors receiver poisoned")
            .take()
            .expect("errors receiver already taken")
    }
}
