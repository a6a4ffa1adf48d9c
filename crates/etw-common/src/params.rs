//! Typed event parameters.
//!
//! Every decoded record carries a bag of well-known parameters. The bag
//! keeps insertion order and guarantees that a parameter identifier
//! appears at most once: appending an already-present identifier
//! replaces the previous value.

use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of well-known parameter identifiers.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum ParamName {
    ProcessId,
    ParentId,
    ProcessName,
    Cmdline,
    Exe,
    UserSid,
    SessionId,
    StartTime,
    ThreadId,
    UstackBase,
    UstackLimit,
    KstackBase,
    KstackLimit,
    IoPrio,
    BasePrio,
    PagePrio,
    StartAddress,
    ImageFilename,
    ImageSize,
    ImageChecksum,
    ImageBase,
    ImageDefaultBase,
    HandleId,
    HandleObject,
    HandleObjectName,
    HandleObjectTypeId,
    HandleObjectTypeName,
    FileName,
    KeyName,
    NetDaddr,
    NetDport,
}

/// Tagged union over the value types a parameter can carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    /// 32-bit value rendered in hexadecimal.
    Hex32(u32),
    /// 64-bit value rendered in hexadecimal, typically a kernel pointer.
    Hex64(u64),
    AnsiStr(String),
    Utf16Str(String),
    FilePath(String),
    Time(SystemTime),
    /// Raw security identifier bytes.
    Sid(Vec<u8>),
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::U8(v) => write!(f, "{v}"),
            ParamValue::U16(v) => write!(f, "{v}"),
            ParamValue::U32(v) => write!(f, "{v}"),
            ParamValue::U64(v) => write!(f, "{v}"),
            ParamValue::Hex32(v) => write!(f, "{v:#x}"),
            ParamValue::Hex64(v) => write!(f, "{v:#x}"),
            ParamValue::AnsiStr(s) | ParamValue::Utf16Str(s) | ParamValue::FilePath(s) => {
                write!(f, "{s}")
            }
            ParamValue::Time(t) => match t.duration_since(SystemTime::UNIX_EPOCH) {
                Ok(d) => write!(f, "{}", d.as_secs()),
                Err(_) => write!(f, "0"),
            },
            ParamValue::Sid(raw) => match sid_string(raw) {
                Some(s) => write!(f, "{s}"),
                None => write!(f, "S-?"),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("parameter {0} is not present")]
    NotFound(ParamName),
    #[error("parameter {0} carries an unexpected value type")]
    TypeMismatch(ParamName),
}

/// Insertion-ordered parameter bag with unique identifiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Params(Vec<(ParamName, ParamValue)>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a parameter, replacing any previous value bound to the
    /// same identifier.
    pub fn append(&mut self, name: ParamName, value: ParamValue) {
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => *v = value,
            None => self.0.push((name, value)),
        }
    }

    /// Overwrites an existing parameter. Unlike [`Params::append`] the
    /// parameter must already be present.
    pub fn set(&mut self, name: ParamName, value: ParamValue) -> Result<(), ParamError> {
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some((_, v)) => {
                *v = value;
                Ok(())
            }
            None => Err(ParamError::NotFound(name)),
        }
    }

    pub fn remove(&mut self, name: ParamName) -> Option<ParamValue> {
        let idx = self.0.iter().position(|(n, _)| *n == name)?;
        Some(self.0.remove(idx).1)
    }

    pub fn get(&self, name: ParamName) -> Option<&ParamValue> {
        self.0.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: ParamName) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ParamName, ParamValue)> {
        self.0.iter()
    }

    fn require(&self, name: ParamName) -> Result<&ParamValue, ParamError> {
        self.get(name).ok_or(ParamError::NotFound(name))
    }

    pub fn get_u8(&self, name: ParamName) -> Result<u8, ParamError> {
        match self.require(name)? {
            ParamValue::U8(v) => Ok(*v),
            _ => Err(ParamError::TypeMismatch(name)),
        }
    }

    pub fn get_u16(&self, name: ParamName) -> Result<u16, ParamError> {
        match self.require(name)? {
            ParamValue::U16(v) => Ok(*v),
            ParamValue::U8(v) => Ok(u16::from(*v)),
            _ => Err(ParamError::TypeMismatch(name)),
        }
    }

    pub fn get_u32(&self, name: ParamName) -> Result<u32, ParamError> {
        match self.require(name)? {
            ParamValue::U32(v) | ParamValue::Hex32(v) => Ok(*v),
            ParamValue::U16(v) => Ok(u32::from(*v)),
            ParamValue::U8(v) => Ok(u32::from(*v)),
            _ => Err(ParamError::TypeMismatch(name)),
        }
    }

    pub fn get_u64(&self, name: ParamName) -> Result<u64, ParamError> {
        match self.require(name)? {
            ParamValue::U64(v) | ParamValue::Hex64(v) => Ok(*v),
            ParamValue::U32(v) | ParamValue::Hex32(v) => Ok(u64::from(*v)),
            _ => Err(ParamError::TypeMismatch(name)),
        }
    }

    /// Reads a hex-tagged parameter regardless of its width.
    pub fn get_hex(&self, name: ParamName) -> Result<u64, ParamError> {
        match self.require(name)? {
            ParamValue::Hex64(v) => Ok(*v),
            ParamValue::Hex32(v) => Ok(u64::from(*v)),
            _ => Err(ParamError::TypeMismatch(name)),
        }
    }

    pub fn get_str(&self, name: ParamName) -> Result<&str, ParamError> {
        match self.require(name)? {
            ParamValue::AnsiStr(s) | ParamValue::Utf16Str(s) | ParamValue::FilePath(s) => Ok(s),
            _ => Err(ParamError::TypeMismatch(name)),
        }
    }

    pub fn get_time(&self, name: ParamName) -> Result<SystemTime, ParamError> {
        match self.require(name)? {
            ParamValue::Time(t) => Ok(*t),
            _ => Err(ParamError::TypeMismatch(name)),
        }
    }

    /// Renders any parameter as a string, yielding an empty string when
    /// the parameter is absent.
    pub fn string_of(&self, name: ParamName) -> String {
        self.get(name).map(|v| v.to_string()).unwrap_or_default()
    }

    pub fn pid(&self) -> Result<u32, ParamError> {
        self.get_u32(ParamName::ProcessId)
    }

    pub fn ppid(&self) -> Result<u32, ParamError> {
        self.get_u32(ParamName::ParentId)
    }

    pub fn tid(&self) -> Result<u32, ParamError> {
        self.get_u32(ParamName::ThreadId)
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (index, (name, value)) in self.0.iter().enumerate() {
            if index != 0 {
                write!(f, ",")?;
            }
            write!(f, " {name}: {value}")?;
        }
        write!(f, " }}")
    }
}

/// Decodes raw security-identifier bytes into the `S-1-...` textual form.
///
/// Layout: revision byte, sub-authority count byte, 48-bit big-endian
/// identifier authority, then little-endian 32-bit sub-authorities.
pub fn sid_string(raw: &[u8]) -> Option<String> {
    if raw.len() < 8 {
        return None;
    }
    let revision = raw[0];
    let count = raw[1] as usize;
    if raw.len() < 8 + count * 4 {
        return None;
    }
    let mut authority: u64 = 0;
    for b in &raw[2..8] {
        authority = (authority << 8) | u64::from(*b);
    }
    let mut out = format!("S-{revision}-{authority}");
    for i in 0..count {
        let off = 8 + i * 4;
        let sub = u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        out.push_str(&format!("-{sub}"));
    }
    Some(out)
}
