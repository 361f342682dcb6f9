//! Frame encoding.
//!
//! Layout (little endian):
//!
//! ```text
//! offset  size  field
//! 0       4     total length (header + payload)
//! 4       4     payload length
//! 8       4     message id
//! 12      4     api number, high bit set on replies
//! 16      4     status code
//! 20      n     JSON payload
//! ```

use thiserror::Error;

use crate::messages::{
    CreateProcessReply, CreateProcessRequest, CreateSessionReply, CreateSessionRequest, Frame,
    MessageHeader, Payload, SbApi,
};
use crate::types::Status;

/// Size of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 20;

const REPLY_BIT: u32 = 0x8000_0000;

/// Errors raised while encoding or decoding a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame truncated: {len} bytes, need at least {HEADER_LEN}")]
    Truncated { len: usize },

    #[error("frame length mismatch: header says {declared} bytes, buffer has {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload length {data_length} does not fit total length {total_length}")]
    BadDataLength { total_length: u32, data_length: u32 },

    #[error("unknown api number {0}")]
    UnknownApi(u32),

    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Serialize a frame to bytes.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, FrameError> {
    let data = match &frame.payload {
        Payload::CreateProcess(request) => serde_json::to_vec(request)?,
        Payload::CreateProcessReply(reply) => serde_json::to_vec(reply)?,
        Payload::CreateSession(request) => serde_json::to_vec(request)?,
        Payload::CreateSessionReply(reply) => serde_json::to_vec(reply)?,
    };

    let total = HEADER_LEN + data.len();
    let total_length = u32::try_from(total).map_err(|_| FrameError::TooLarge(total))?;
    let header = MessageHeader {
        total_length,
        data_length: data.len() as u32,
        message_id: frame.message_id,
    };

    let mut api = frame.api().number();
    if frame.payload.is_reply() {
        api |= REPLY_BIT;
    }

    let mut bytes = Vec::with_capacity(total);
    bytes.extend_from_slice(&header.total_length.to_le_bytes());
    bytes.extend_from_slice(&header.data_length.to_le_bytes());
    bytes.extend_from_slice(&header.message_id.to_le_bytes());
    bytes.extend_from_slice(&api.to_le_bytes());
    bytes.extend_from_slice(&frame.status.code().to_le_bytes());
    bytes.extend_from_slice(&data);
    Ok(bytes)
}

/// Parse the fixed header of a frame without touching the payload.
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, FrameError> {
    if bytes.len() < HEADER_LEN {
        return Err(FrameError::Truncated { len: bytes.len() });
    }

    let header = MessageHeader {
        total_length: read_u32(bytes, 0),
        data_length: read_u32(bytes, 4),
        message_id: read_u32(bytes, 8),
    };

    if header.total_length as usize != bytes.len() {
        return Err(FrameError::LengthMismatch {
            declared: header.total_length as usize,
            actual: bytes.len(),
        });
    }
    if header.data_length as usize + HEADER_LEN != header.total_length as usize {
        return Err(FrameError::BadDataLength {
            total_length: header.total_length,
            data_length: header.data_length,
        });
    }

    Ok(header)
}

/// Parse a complete frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
    let header = decode_header(bytes)?;
    let raw_api = read_u32(bytes, 12);
    let status = Status::from_code(read_u32(bytes, 16));
    let data = &bytes[HEADER_LEN..];

    let is_reply = raw_api & REPLY_BIT != 0;
    let number = raw_api & !REPLY_BIT;
    let api = SbApi::from_number(number).ok_or(FrameError::UnknownApi(number))?;

    let payload = match (api, is_reply) {
        (SbApi::CreateProcess, false) => {
            Payload::CreateProcess(serde_json::from_slice::<CreateProcessRequest>(data)?)
        }
        (SbApi::CreateProcess, true) => {
            Payload::CreateProcessReply(serde_json::from_slice::<CreateProcessReply>(data)?)
        }
        (SbApi::CreateSession, false) => {
            Payload::CreateSession(serde_json::from_slice::<CreateSessionRequest>(data)?)
        }
        (SbApi::CreateSession, true) => {
            Payload::CreateSessionReply(serde_json::from_slice::<CreateSessionReply>(data)?)
        }
    };

    Ok(Frame {
        message_id: header.message_id,
        status,
        payload,
    })
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClientId, Handle, LoadFlags, ProcessInformation, SessionId, SubsystemKind};

    fn session_request() -> Frame {
        Frame::request(
            7,
            Payload::CreateSession(CreateSessionRequest {
                session_id: 1,
                mu_session_id: SessionId(2),
                process: ProcessInformation {
                    process: Handle(0x40),
                    thread: Handle(0x44),
                    client_id: ClientId::new(300, 304),
                    kind: SubsystemKind::Posix,
                },
                debug: None,
            }),
        )
    }

    #[test]
    fn header_lengths_describe_the_buffer() {
        let bytes = encode(&session_request()).unwrap();
        let header = decode_header(&bytes).unwrap();
        assert_eq!(header.total_length as usize, bytes.len());
        assert_eq!(header.data_length as usize, bytes.len() - HEADER_LEN);
        assert_eq!(header.message_id, 7);
        assert_eq!(decode(&bytes).unwrap(), session_request());
    }

    #[test]
    fn reply_status_travels_in_the_header() {
        let reply = Frame::reply(
            9,
            Status::AccessDenied,
            Payload::CreateProcessReply(CreateProcessReply { process: None }),
        );
        let decoded = decode(&encode(&reply).unwrap()).unwrap();
        assert_eq!(decoded.status, Status::AccessDenied);
        assert!(decoded.payload.is_reply());
        assert_eq!(decoded.api(), SbApi::CreateProcess);
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let err = decode(&[0u8; 12]).unwrap_err();
        assert!(matches!(err, FrameError::Truncated { len: 12 }));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode(&session_request()).unwrap();
        bytes.push(0);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    #[test]
    fn inconsistent_data_length_is_rejected() {
        let mut bytes = encode(&session_request()).unwrap();
        bytes[4] = bytes[4].wrapping_add(1);
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::BadDataLength { .. }));
    }

    #[test]
    fn unknown_api_is_rejected() {
        let mut bytes = encode(&session_request()).unwrap();
        bytes[12..16].copy_from_slice(&2u32.to_le_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::UnknownApi(2)));
    }

    #[test]
    fn payload_of_the_wrong_shape_is_rejected() {
        let request = Frame::request(
            1,
            Payload::CreateProcess(CreateProcessRequest {
                image: "os2ss.exe".into(),
                directory: "\\".into(),
                command_line: String::new(),
                flags: LoadFlags::DEFERRED.bits(),
            }),
        );
        let mut bytes = encode(&request).unwrap();
        // Relabel a create-process request as a create-session request.
        bytes[12..16].copy_from_slice(&SbApi::CreateSession.number().to_le_bytes());
        let err = decode(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::Payload(_)));
    }
}
