//! Trace-session consumer and the processor chain that enriches every
//! event before it is published.

pub mod cmdline;
pub mod consumer;
pub mod keys;
pub mod processors;
pub mod resolver;

pub use consumer::{EventCallback, KstreamConsumer, KstreamError, OsContext};
pub use processors::{Chain, ChainOutput, Processor, ProcessorError, ProcessorOutput};
pub use resolver::{HandleNameResolver, ResolverError};
