//! Pipeline configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::kind::EventKind;
use crate::process::ProcessRecord;

/// Name of the mandatory kernel-logger session.
pub const KERNEL_LOGGER_SESSION: &str = "NT Kernel Logger";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionKind {
    /// The session carrying the core kernel providers. Failing to open
    /// it fails the whole subscription.
    KernelLogger,
    /// Additional sessions; open failures are logged and skipped.
    Auxiliary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSessionConfig {
    pub name: String,
    pub kind: SessionKind,
}

impl TraceSessionConfig {
    pub fn kernel_logger() -> TraceSessionConfig {
        TraceSessionConfig {
            name: KERNEL_LOGGER_SESSION.to_string(),
            kind: SessionKind::KernelLogger,
        }
    }

    pub fn auxiliary(name: &str) -> TraceSessionConfig {
        TraceSessionConfig {
            name: name.to_string(),
            kind: SessionKind::Auxiliary,
        }
    }

    pub fn is_kernel_logger(&self) -> bool {
        self.kind == SessionKind::KernelLogger
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KstreamConfig {
    pub sessions: Vec<TraceSessionConfig>,
    /// Image names whose events are dropped, compared case-insensitively.
    pub exclude_images: Vec<String>,
    /// Event kinds that never reach the output.
    pub exclude_kevents: Vec<EventKind>,
    /// Capture mode is on exactly when a capture file is configured.
    pub capture_file: Option<PathBuf>,
    /// Upper bound for a single deadlock-safe object-name query.
    pub handle_wait_timeout_ms: u64,
    /// Ceiling of the pending create-handle table.
    pub pending_handles_cap: usize,
    /// Dead-process reaper period.
    pub reap_interval_secs: u64,
}

impl Default for KstreamConfig {
    fn default() -> Self {
        Self {
            sessions: vec![TraceSessionConfig::kernel_logger()],
            exclude_images: Vec::new(),
            exclude_kevents: Vec::new(),
            capture_file: None,
            handle_wait_timeout_ms: 500,
            pending_handles_cap: 1000,
            reap_interval_secs: 120,
        }
    }
}

impl KstreamConfig {
    pub fn capture(&self) -> bool {
        self.capture_file.is_some()
    }

    pub fn excludes_image(&self, ps: Option<&ProcessRecord>) -> bool {
        match ps {
            Some(ps) => self
                .exclude_images
                .iter()
                .any(|image| image.eq_ignore_ascii_case(&ps.name)),
            None => false,
        }
    }

    pub fn excludes_kind(&self, kind: EventKind) -> bool {
        self.exclude_kevents.contains(&kind)
    }

    pub fn handle_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.handle_wait_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_exclusion_is_case_insensitive() {
        let config = KstreamConfig {
            exclude_images: vec!["SvcHost.exe".to_string()],
            ..Default::default()
        };
        let ps = ProcessRecord::new(
            100,
            4,
            "svchost.exe".into(),
            String::new(),
            String::new(),
            String::new(),
            0,
        );
        assert!(config.excludes_image(Some(&ps)));
        assert!(!config.excludes_image(None));
    }

    #[test]
    fn default_carries_the_kernel_logger_session() {
        let config = KstreamConfig::default();
        assert_eq!(config.sessions.len(), 1);
        assert!(config.sessions[0].is_kernel_logger());
        assert!(!config.capture());
    }
}
