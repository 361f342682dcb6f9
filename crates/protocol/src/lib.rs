//! Wire types for the session manager subsystem API.
//!
//! This crate contains the data exchanged between the session manager and the
//! environment subsystem servers it starts:
//!
//! - **Identity types**: sessions, handles, client ids, subsystem kinds
//! - **Status codes**: the single status value every operation reports
//! - **Messages**: the two subsystem-API requests (create process, create session)
//! - **Framing**: a fixed header followed by a JSON payload
//!
//! Types in this crate are pure data. Behavior lives in `smss-runtime`.

pub mod codec;
pub mod messages;
pub mod types;

pub use codec::{FrameError, HEADER_LEN, decode, decode_header, encode};
pub use messages::*;
pub use types::*;
