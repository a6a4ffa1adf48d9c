//! Domain model of the kernel-event pipeline: the enriched [`event::Event`],
//! its closed [`kind::EventKind`] set, the monotonic [`sequencer::Sequencer`],
//! the live process-state types in [`process`], the collaborator contracts
//! in [`pdk`], configuration and the metrics registry.

pub mod config;
pub mod event;
pub mod kind;
pub mod metrics;
pub mod pdk;
pub mod process;
pub mod sequencer;
pub mod test_utils;

pub use config::{KstreamConfig, SessionKind, TraceSessionConfig, KERNEL_LOGGER_SESSION};
pub use event::Event;
pub use kind::{Category, EventKind};
pub use metrics::{MetricValue, Metrics};
pub use process::{HandleInfo, ModuleInfo, PeMetadata, ProcessRecord, ThreadInfo};
pub use sequencer::{Sequencer, SequencerError, SequencerStore};
