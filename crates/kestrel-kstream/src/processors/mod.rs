//! Fixed-order event processor chain.

mod handle;
mod ps;

use std::fmt;
use std::sync::Arc;

use kestrel_core::event::Event;
use kestrel_core::metrics::Metrics;
use thiserror::Error;

pub use handle::HandleProcessor;
pub use ps::PsProcessor;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error(transparent)]
    Param(#[from] etw_common::params::ParamError),
    #[error(transparent)]
    Os(#[from] etw_common::os::OsError),
    #[error(transparent)]
    Snapshot(#[from] kestrel_ps::PsError),
    #[error(transparent)]
    Pdk(#[from] kestrel_core::pdk::PdkError),
    #[error("{processor} processor failed: {source}")]
    Stage {
        processor: &'static str,
        #[source]
        source: Box<ProcessorError>,
    },
    #[error("{0}")]
    Multi(MultiError),
}

/// Errors collected across the chain, merged into one.
#[derive(Debug)]
pub struct MultiError(pub Vec<ProcessorError>);

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, err) in self.0.iter().enumerate() {
            if index != 0 {
                write!(f, "; ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Outcome of one processor stage.
pub enum ProcessorOutput {
    /// Hand the event to the next processor.
    Next(Event),
    /// Stop the walk and publish this event. Stages that fully own
    /// their category terminate the walk this way.
    Done(Event),
    /// The event was consumed and is being withheld; the caller drops
    /// it silently.
    Withheld,
    /// The stage failed. The chain records the error and keeps walking
    /// with the returned event.
    Failed(Event, ProcessorError),
}

pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;
    fn process(&self, event: Event) -> ProcessorOutput;
    fn close(&self) {}
}

/// Result of a full chain walk.
pub enum ChainOutput {
    Ok(Event),
    /// A stage withheld the event (cancel upstream). Not an error.
    Cancelled,
    /// One or more stages failed. The event still carries the
    /// best-effort enrichment of the stages that succeeded.
    Failed(Event, ProcessorError),
}

/// Walks processors in registration order. Stage failures are collected
/// and merged; only a withheld event short-circuits the walk.
pub struct Chain {
    processors: Vec<Box<dyn Processor>>,
    metrics: Arc<Metrics>,
}

impl Chain {
    pub fn new(processors: Vec<Box<dyn Processor>>, metrics: Arc<Metrics>) -> Chain {
        Chain {
            processors,
            metrics,
        }
    }

    pub fn run(&self, event: Event) -> ChainOutput {
        let mut errs = Vec::new();
        let mut current = event;
        for processor in &self.processors {
            match processor.process(current) {
                ProcessorOutput::Next(event) => current = event,
                // a stage that stops the walk returns its event with no
                // error, even when an earlier stage failed
                ProcessorOutput::Done(event) => return ChainOutput::Ok(event),
                ProcessorOutput::Withheld => return ChainOutput::Cancelled,
                ProcessorOutput::Failed(event, err) => {
                    self.metrics.processor_failures.inc();
                    errs.push(ProcessorError::Stage {
                        processor: processor.name(),
                        source: Box::new(err),
                    });
                    current = event;
                }
            }
        }
        match errs.len() {
            0 => ChainOutput::Ok(current),
            1 => ChainOutput::Failed(current, errs.pop().expect("one error present")),
            _ => ChainOutput::Failed(current, ProcessorError::Multi(MultiError(errs))),
        }
    }

    /// Closes processors in reverse registration order, pressing on past
    /// individual failures.
    pub fn close(&self) {
        for processor in self.processors.iter().rev() {
            processor.close();
        }
    }
}
