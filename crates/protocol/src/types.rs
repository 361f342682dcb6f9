//! Core identity and status types used across the wire.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Multi-user session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u32);

impl SessionId {
    /// The first (control) session, created at boot.
    pub const CONTROL: SessionId = SessionId(0);

    /// Returns true for the control session.
    pub fn is_control(self) -> bool {
        self == Self::CONTROL
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque resource handle (process, thread, channel).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Process and thread identity pair returned by process creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ClientId {
    pub process: u32,
    pub thread: u32,
}

impl ClientId {
    pub fn new(process: u32, thread: u32) -> Self {
        Self { process, thread }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.process, self.thread)
    }
}

/// Execution environment an image or a subsystem server belongs to.
///
/// Codes follow the image header subsystem field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubsystemKind {
    #[default]
    Unknown,
    /// Native images; a process of this kind is itself a subsystem server.
    Native,
    WindowsGui,
    WindowsCui,
    Os2,
    Posix,
}

impl SubsystemKind {
    pub fn code(self) -> u16 {
        match self {
            SubsystemKind::Unknown => 0,
            SubsystemKind::Native => 1,
            SubsystemKind::WindowsGui => 2,
            SubsystemKind::WindowsCui => 3,
            SubsystemKind::Os2 => 5,
            SubsystemKind::Posix => 7,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            1 => SubsystemKind::Native,
            2 => SubsystemKind::WindowsGui,
            3 => SubsystemKind::WindowsCui,
            5 => SubsystemKind::Os2,
            7 => SubsystemKind::Posix,
            _ => SubsystemKind::Unknown,
        }
    }
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubsystemKind::Unknown => "unknown",
            SubsystemKind::Native => "native",
            SubsystemKind::WindowsGui => "windows-gui",
            SubsystemKind::WindowsCui => "windows-cui",
            SubsystemKind::Os2 => "os2",
            SubsystemKind::Posix => "posix",
        };
        f.write_str(name)
    }
}

/// Completion status carried in reply envelopes and reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u32", into = "u32")]
pub enum Status {
    Success,
    Unsuccessful,
    ObjectNameNotFound,
    ObjectNameCollision,
    NoMemory,
    PortDisconnected,
    /// The target session was deleted while an operation waited on it.
    DeletePending,
    Timeout,
    ResumeFailed,
    AccessDenied,
    InvalidParameter,
    Cancelled,
    Other(u32),
}

impl Status {
    pub fn code(self) -> u32 {
        match self {
            Status::Success => 0x0000_0000,
            Status::Timeout => 0x0000_0102,
            Status::Unsuccessful => 0xC000_0001,
            Status::InvalidParameter => 0xC000_000D,
            Status::NoMemory => 0xC000_0017,
            Status::AccessDenied => 0xC000_0022,
            Status::ObjectNameNotFound => 0xC000_0034,
            Status::ObjectNameCollision => 0xC000_0035,
            Status::PortDisconnected => 0xC000_0037,
            Status::DeletePending => 0xC000_0056,
            Status::ResumeFailed => 0xC000_0120,
            Status::Cancelled => 0xC000_0121,
            Status::Other(code) => code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0x0000_0000 => Status::Success,
            0x0000_0102 => Status::Timeout,
            0xC000_0001 => Status::Unsuccessful,
            0xC000_000D => Status::InvalidParameter,
            0xC000_0017 => Status::NoMemory,
            0xC000_0022 => Status::AccessDenied,
            0xC000_0034 => Status::ObjectNameNotFound,
            0xC000_0035 => Status::ObjectNameCollision,
            0xC000_0037 => Status::PortDisconnected,
            0xC000_0056 => Status::DeletePending,
            0xC000_0120 => Status::ResumeFailed,
            0xC000_0121 => Status::Cancelled,
            other => Status::Other(other),
        }
    }

    pub fn is_success(self) -> bool {
        self == Status::Success
    }
}

impl From<u32> for Status {
    fn from(code: u32) -> Self {
        Status::from_code(code)
    }
}

impl From<Status> for u32 {
    fn from(status: Status) -> Self {
        status.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Other(code) => write!(f, "status {code:#010x}"),
            other => write!(f, "{other:?} ({:#010x})", other.code()),
        }
    }
}

bitflags! {
    /// Process and subsystem creation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadFlags: u32 {
        /// The image path could not be resolved.
        const INVALID_PATH = 0x0000_0001;
        /// Create the process suspended and hand it back to the caller.
        const DEFERRED = 0x0000_0002;
        /// Do not wait for the launched process to exit.
        const ASYNC = 0x0000_0004;
        /// Load with debugger correlation.
        const DEBUG = 0x0000_0008;
        /// The image is a required subsystem server.
        const SUBSYSTEM = 0x0000_0010;
        /// The image is the POSIX personality server.
        const POSIX = 0x0000_0100;
        /// The image is the OS/2 personality server.
        const OS2 = 0x0000_0200;
        /// Run the boot-time disk checker.
        const AUTOCHECK = 0x0000_1000;
    }
}

/// Everything process creation hands back about a new process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInformation {
    pub process: Handle,
    pub thread: Handle,
    pub client_id: ClientId,
    /// Subsystem kind of the launched image.
    pub kind: SubsystemKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_status_codes_survive_conversion() {
        let status = Status::from_code(0xC000_0135);
        assert_eq!(status, Status::Other(0xC000_0135));
        assert_eq!(status.code(), 0xC000_0135);
        assert!(!status.is_success());
    }

    #[test]
    fn status_serializes_as_code() {
        let json = serde_json::to_string(&Status::DeletePending).unwrap();
        assert_eq!(json, "3221225558");
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Status::DeletePending);
    }

    #[test]
    fn subsystem_kind_names_are_kebab_case() {
        let kind: SubsystemKind = serde_json::from_str("\"windows-gui\"").unwrap();
        assert_eq!(kind, SubsystemKind::WindowsGui);
        assert_eq!(kind.to_string(), "windows-gui");
        assert_eq!(SubsystemKind::from_code(kind.code()), kind);
        assert_eq!(SubsystemKind::from_code(42), SubsystemKind::Unknown);
    }

    #[test]
    fn control_session_is_zero() {
        assert!(SessionId(0).is_control());
        assert!(!SessionId(3).is_control());
    }
}
