//! Subsystem API messages sent from the session manager to a subsystem's
//! callback channel.
//!
//! Only the two calls the session manager originates are modeled. Each call
//! is a synchronous request/reply exchange; the reply reuses the request's
//! api number and message id and carries a [`Status`] in its header.

use serde::{Deserialize, Serialize};

use crate::types::{ClientId, LoadFlags, ProcessInformation, SessionId, Status};

/// Subsystem API numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SbApi {
    CreateSession,
    CreateProcess,
}

impl SbApi {
    pub fn number(self) -> u32 {
        match self {
            SbApi::CreateSession => 0,
            SbApi::CreateProcess => 3,
        }
    }

    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            0 => Some(SbApi::CreateSession),
            3 => Some(SbApi::CreateProcess),
            _ => None,
        }
    }
}

/// Ask a subsystem to create a process on the session manager's behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProcessRequest {
    pub image: String,
    pub directory: String,
    pub command_line: String,
    /// Raw [`LoadFlags`] bits.
    pub flags: u32,
}

impl CreateProcessRequest {
    pub fn load_flags(&self) -> LoadFlags {
        LoadFlags::from_bits_truncate(self.flags)
    }
}

/// Reply to [`CreateProcessRequest`].
///
/// Only fully populated when the request asked for deferred start; otherwise
/// the process is already running and the fields are best effort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProcessReply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInformation>,
}

/// Debugger correlation ids attached to a session creation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub debug_ui_client_id: ClientId,
}

/// Ask a subsystem to create an execution session for a new process.
///
/// The process and thread handles are already duplicated into the target
/// subsystem; the target owns them once the request is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    /// Session-local id allocated by the session manager.
    pub session_id: u32,
    pub mu_session_id: SessionId,
    pub process: ProcessInformation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugInfo>,
}

/// Reply to [`CreateSessionRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionReply {
    pub session_id: u32,
}

/// Payload union of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    CreateProcess(CreateProcessRequest),
    CreateProcessReply(CreateProcessReply),
    CreateSession(CreateSessionRequest),
    CreateSessionReply(CreateSessionReply),
}

impl Payload {
    pub fn api(&self) -> SbApi {
        match self {
            Payload::CreateProcess(_) | Payload::CreateProcessReply(_) => SbApi::CreateProcess,
            Payload::CreateSession(_) | Payload::CreateSessionReply(_) => SbApi::CreateSession,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(
            self,
            Payload::CreateProcessReply(_) | Payload::CreateSessionReply(_)
        )
    }
}

/// Length and correlation fields at the start of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Header plus payload length in bytes.
    pub total_length: u32,
    /// Payload length in bytes.
    pub data_length: u32,
    pub message_id: u32,
}

/// A complete subsystem API message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub message_id: u32,
    pub status: Status,
    pub payload: Payload,
}

impl Frame {
    /// Build a request frame; requests always carry `Success`.
    pub fn request(message_id: u32, payload: Payload) -> Self {
        Self {
            message_id,
            status: Status::Success,
            payload,
        }
    }

    /// Build a reply frame answering `message_id`.
    pub fn reply(message_id: u32, status: Status, payload: Payload) -> Self {
        Self {
            message_id,
            status,
            payload,
        }
    }

    pub fn api(&self) -> SbApi {
        self.payload.api()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_numbers_are_stable() {
        assert_eq!(SbApi::from_number(SbApi::CreateSession.number()), Some(SbApi::CreateSession));
        assert_eq!(SbApi::from_number(SbApi::CreateProcess.number()), Some(SbApi::CreateProcess));
        assert_eq!(SbApi::from_number(1), None);
    }

    #[test]
    fn request_flags_drop_unknown_bits() {
        let request = CreateProcessRequest {
            image: "psxss.exe".into(),
            directory: "\\".into(),
            command_line: String::new(),
            flags: LoadFlags::DEFERRED.bits() | 0x8000_0000,
        };
        assert_eq!(request.load_flags(), LoadFlags::DEFERRED);
    }
}
