//! Deadlock-safe handle-name resolution.
//!
//! Some object types make the kernel name query hang forever, which
//! would stall an OS callback thread. The query therefore runs on one
//! dedicated worker thread, rendezvousing with the caller over a channel
//! pair. When the worker misses the deadline the caller tears the
//! rendezvous down and clears the worker slot: the stuck worker either
//! unblocks into a failed send and exits, or stays parked inside the
//! hung kernel call, and the next resolution spawns a fresh worker.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use etw_common::os::ObjectNameApi;
use kestrel_core::metrics::Metrics;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("couldn't resolve handle name due to timeout")]
    Timeout,
    #[error("cannot create handle query thread: {0}")]
    Spawn(#[from] std::io::Error),
}

struct Worker {
    tx: Sender<u64>,
    rx: Receiver<String>,
}

pub struct HandleNameResolver {
    api: Arc<dyn ObjectNameApi>,
    /// Single outstanding query at a time; the lock also serializes
    /// callers, which are required not to re-enter.
    worker: Mutex<Option<Worker>>,
    metrics: Arc<Metrics>,
}

impl HandleNameResolver {
    pub fn new(api: Arc<dyn ObjectNameApi>, metrics: Arc<Metrics>) -> HandleNameResolver {
        HandleNameResolver {
            api,
            worker: Mutex::new(None),
            metrics,
        }
    }

    /// Resolves the object name behind a raw handle, giving up after
    /// `timeout` and leaving the name empty.
    pub fn resolve_with_timeout(
        &self,
        raw_handle: u64,
        timeout: Duration,
    ) -> Result<String, ResolverError> {
        let mut slot = self.worker.lock().expect("resolver lock poisoned");
        if slot.is_none() {
            *slot = Some(self.spawn_worker()?);
        }
        let worker = slot.as_ref().expect("worker just placed");
        if worker.tx.send(raw_handle).is_err() {
            // worker died earlier, start over with a fresh one
            *slot = Some(self.spawn_worker()?);
            let worker = slot.as_ref().expect("worker just placed");
            worker
                .tx
                .send(raw_handle)
                .expect("fresh worker cannot be gone");
        }
        let worker = slot.as_ref().expect("worker present");
        match worker.rx.recv_timeout(timeout) {
            Ok(name) => Ok(name),
            Err(RecvTimeoutError::Timeout) => {
                self.metrics.handle_wait_timeouts.inc();
                *slot = None;
                Err(ResolverError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                *slot = None;
                Ok(String::new())
            }
        }
    }

    fn spawn_worker(&self) -> Result<Worker, ResolverError> {
        let (tx_query, rx_query) = channel::<u64>();
        let (tx_name, rx_name) = channel::<String>();
        let api = self.api.clone();
        std::thread::Builder::new()
            .name("handle-name-query".to_string())
            .spawn(move || {
                while let Ok(raw_handle) = rx_query.recv() {
                    let name = api.query_object_name(raw_handle).unwrap_or_default();
                    if tx_name.send(name).is_err() {
                        // the caller gave up on us
                        break;
                    }
                }
            })?;
        Ok(Worker {
            tx: tx_query,
            rx: rx_name,
        })
    }
}
