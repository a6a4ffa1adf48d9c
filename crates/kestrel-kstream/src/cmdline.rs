//! Command-line normalization for process events.

use std::fmt;

use lazy_static::lazy_static;
use regex::{NoExpand, Regex};

lazy_static! {
    static ref SYSTEM_ROOT_RE: Regex =
        Regex::new(r"(?i)%systemroot%|%windir%|\\systemroot").unwrap();
    static ref SYSTEM_ROOT: String =
        std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
}

/// System processes that are reported without a path in their command
/// line. Their executable lives under `System32`.
const SYSTEM_PROCS: &[&str] = &[
    "csrss.exe",
    "dwm.exe",
    "lsass.exe",
    "services.exe",
    "smss.exe",
    "spoolsv.exe",
    "svchost.exe",
    "taskhostw.exe",
    "wininit.exe",
    "winlogon.exe",
];

pub fn system_root() -> &'static str {
    SYSTEM_ROOT.as_str()
}

/// Builder-style command-line normalizer.
pub struct Cmdline {
    cmdline: String,
    exe: Option<String>,
}

impl Cmdline {
    pub fn new(raw: impl Into<String>) -> Cmdline {
        Cmdline {
            cmdline: raw.into(),
            exe: None,
        }
    }

    /// Strips the quotes surrounding the executable token.
    pub fn clean_exe(mut self) -> Self {
        if let Some(rest) = self.cmdline.strip_prefix('"') {
            if let Some(end) = rest.find('"') {
                self.cmdline = format!("{}{}", &rest[..end], &rest[end + 1..]);
            }
        }
        self
    }

    /// Expands every variation of the SystemRoot environment variable.
    pub fn expand_system_root(mut self) -> Self {
        if SYSTEM_ROOT_RE.is_match(&self.cmdline) {
            self.cmdline = SYSTEM_ROOT_RE
                .replace_all(&self.cmdline, NoExpand(SYSTEM_ROOT.as_str()))
                .into_owned();
        }
        self
    }

    /// Synthesizes the full executable path for well-known system
    /// processes whose command line lacks one.
    pub fn complete_sys_proc(mut self, image: &str) -> Self {
        if self.exe_token().contains('\\') {
            return self;
        }
        if SYSTEM_PROCS.iter().any(|p| p.eq_ignore_ascii_case(image)) {
            self.exe = Some(format!("{}\\System32\\{}", SYSTEM_ROOT.as_str(), image));
        }
        self
    }

    /// The resolved executable path.
    pub fn exeline(&self) -> String {
        match &self.exe {
            Some(exe) => exe.clone(),
            None => self.exe_token().to_string(),
        }
    }

    /// The executable token of the command line. Paths with embedded
    /// spaces are handled by cutting after the extension.
    fn exe_token(&self) -> &str {
        let s = self.cmdline.trim_start();
        if let Some(pos) = s.to_ascii_lowercase().find(".exe") {
            return &s[..pos + 4];
        }
        s.split_whitespace().next().unwrap_or(s)
    }
}

impl fmt::Display for Cmdline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cmdline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_quotes_around_the_executable() {
        let cmdline = Cmdline::new("\"svchost.exe\" -k netsvcs").clean_exe();
        assert_eq!(cmdline.to_string(), "svchost.exe -k netsvcs");
    }

    #[test]
    fn quoted_paths_with_spaces_survive_cleaning() {
        let cmdline = Cmdline::new("\"C:\\Program Files\\app\\run.exe\" --flag").clean_exe();
        assert_eq!(cmdline.to_string(), "C:\\Program Files\\app\\run.exe --flag");
        assert_eq!(cmdline.exeline(), "C:\\Program Files\\app\\run.exe");
    }

    #[test]
    fn expands_system_root_variants() {
        let root = system_root();
        for raw in [
            "%SystemRoot%\\System32\\smss.exe",
            "%systemroot%\\System32\\smss.exe",
            "\\SystemRoot\\System32\\smss.exe",
            "%WINDIR%\\System32\\smss.exe",
        ] {
            let cmdline = Cmdline::new(raw).expand_system_root();
            assert_eq!(cmdline.to_string(), format!("{root}\\System32\\smss.exe"));
        }
    }

    #[test]
    fn completes_well_known_system_processes() {
        let cmdline = Cmdline::new("svchost.exe -k netsvcs")
            .clean_exe()
            .expand_system_root()
            .complete_sys_proc("svchost.exe");
        assert_eq!(
            cmdline.exeline(),
            format!("{}\\System32\\svchost.exe", system_root())
        );
        // the command line itself stays untouched
        assert_eq!(cmdline.to_string(), "svchost.exe -k netsvcs");
    }

    #[test]
    fn unknown_images_keep_their_token() {
        let cmdline = Cmdline::new("oddball.exe --serve").complete_sys_proc("oddball.exe");
        assert_eq!(cmdline.exeline(), "oddball.exe");
    }

    #[test]
    fn pathful_command_lines_are_not_completed() {
        let cmdline =
            Cmdline::new("C:\\Windows\\System32\\svchost.exe -k netsvcs").complete_sys_proc("svchost.exe");
        assert_eq!(cmdline.exeline(), "C:\\Windows\\System32\\svchost.exe");
    }
}
