//! Subsystem API client stubs.
//!
//! Builds the two requests the session manager sends to a subsystem's
//! callback channel, performs the synchronous call through the
//! [`ChannelTransport`] and decodes the reply. No locking, no registry state.
//!
//! # Message flow
//!
//! 1. Caller invokes [`SubsystemClient::create_process`] or
//!    [`SubsystemClient::create_session`] with the target channel
//! 2. The client stamps the frame with the next message id and encodes it
//! 3. The transport blocks the calling task until the peer replies
//! 4. The reply must echo the message id and api number; its header status
//!    decides between the decoded payload and [`Error::PeerRejected`]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use smss_protocol::{
    CreateProcessReply, CreateProcessRequest, CreateSessionReply, CreateSessionRequest, DebugInfo,
    Frame, Handle, LoadFlags, Payload, ProcessInformation, SbApi, SessionId, decode, encode,
};

use crate::error::{Error, Result};
use crate::host::ChannelTransport;

/// Client for a subsystem's callback channel.
pub struct SubsystemClient {
    transport: Arc<dyn ChannelTransport>,
    last_id: AtomicU32,
}

impl SubsystemClient {
    pub fn new(transport: Arc<dyn ChannelTransport>) -> Self {
        Self {
            transport,
            last_id: AtomicU32::new(0),
        }
    }

    /// Ask the subsystem behind `channel` to create a process.
    ///
    /// The returned information is complete only when `flags` requests a
    /// deferred start; otherwise the peer already started the process and
    /// the reply may be empty.
    pub async fn create_process(
        &self,
        channel: Handle,
        image: &str,
        directory: &str,
        command_line: &str,
        flags: LoadFlags,
    ) -> Result<Option<ProcessInformation>> {
        let request = Payload::CreateProcess(CreateProcessRequest {
            image: image.to_string(),
            directory: directory.to_string(),
            command_line: command_line.to_string(),
            flags: flags.bits(),
        });

        match self.call(channel, request).await? {
            Payload::CreateProcessReply(CreateProcessReply { process }) => {
                if process.is_none() && flags.contains(LoadFlags::DEFERRED) {
                    return Err(Error::Protocol(
                        "deferred create-process reply carried no process".to_string(),
                    ));
                }
                Ok(process)
            }
            other => Err(unexpected_reply(SbApi::CreateProcess, &other)),
        }
    }

    /// Ask the subsystem behind `channel` to open an execution session for a
    /// process whose handles were already duplicated into it.
    ///
    /// Returns the session-local id on success.
    pub async fn create_session(
        &self,
        channel: Handle,
        session_id: u32,
        mu_session_id: SessionId,
        process: ProcessInformation,
        debug: Option<DebugInfo>,
    ) -> Result<u32> {
        let request = Payload::CreateSession(CreateSessionRequest {
            session_id,
            mu_session_id,
            process,
            debug,
        });

        match self.call(channel, request).await? {
            Payload::CreateSessionReply(CreateSessionReply { session_id }) => Ok(session_id),
            other => Err(unexpected_reply(SbApi::CreateSession, &other)),
        }
    }

    async fn call(&self, channel: Handle, payload: Payload) -> Result<Payload> {
        let id = self.last_id.fetch_add(1, Ordering::SeqCst);
        let api = payload.api();
        let bytes = encode(&Frame::request(id, payload))?;

        tracing::debug!(target = "smss", id, ?api, %channel, "sending subsystem request");

        let reply_bytes = self
            .transport
            .call(channel, bytes)
            .await
            .map_err(|e| Error::TransportFailure(e.to_string()))?;
        let reply = decode(&reply_bytes)?;

        if reply.message_id != id {
            return Err(Error::Protocol(format!(
                "reply id {} does not answer request {}",
                reply.message_id, id
            )));
        }
        if reply.api() != api || !reply.payload.is_reply() {
            return Err(Error::Protocol(format!(
                "expected {:?} reply, got {:?}",
                api,
                reply.api()
            )));
        }
        if !reply.status.is_success() {
            tracing::debug!(
                target = "smss",
                id,
                status = %reply.status,
                "subsystem rejected request"
            );
            return Err(Error::PeerRejected(reply.status));
        }

        Ok(reply.payload)
    }
}

fn unexpected_reply(api: SbApi, payload: &Payload) -> Error {
    Error::Protocol(format!("expected {api:?} reply, got {payload:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::TransportError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use smss_protocol::{ClientId, Status, SubsystemKind};

    /// Answers every request with a reply produced by `respond`.
    struct ScriptedTransport {
        respond: Box<dyn Fn(Frame) -> std::result::Result<Frame, TransportError> + Send + Sync>,
        seen: Mutex<Vec<Frame>>,
    }

    impl ScriptedTransport {
        fn new(
            respond: impl Fn(Frame) -> std::result::Result<Frame, TransportError>
            + Send
            + Sync
            + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                respond: Box::new(respond),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ChannelTransport for ScriptedTransport {
        async fn call(
            &self,
            _channel: Handle,
            request: Vec<u8>,
        ) -> std::result::Result<Vec<u8>, TransportError> {
            let frame = decode(&request).expect("client sent a valid frame");
            self.seen.lock().push(frame.clone());
            let reply = (self.respond)(frame)?;
            Ok(encode(&reply).unwrap())
        }
    }

    fn info() -> ProcessInformation {
        ProcessInformation {
            process: Handle(0x100),
            thread: Handle(0x104),
            client_id: ClientId::new(400, 404),
            kind: SubsystemKind::Native,
        }
    }

    #[tokio::test]
    async fn deferred_create_process_returns_reply_information() {
        let transport = ScriptedTransport::new(|frame| {
            Ok(Frame::reply(
                frame.message_id,
                Status::Success,
                Payload::CreateProcessReply(CreateProcessReply { process: Some(info()) }),
            ))
        });
        let client = SubsystemClient::new(transport.clone());

        let process = client
            .create_process(Handle(1), "psxss.exe", "\\", "psxss", LoadFlags::DEFERRED)
            .await
            .unwrap();
        assert_eq!(process, Some(info()));

        let seen = transport.seen.lock();
        match &seen[0].payload {
            Payload::CreateProcess(request) => {
                assert_eq!(request.image, "psxss.exe");
                assert!(request.load_flags().contains(LoadFlags::DEFERRED));
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[tokio::test]
    async fn message_ids_increase_per_call() {
        let transport = ScriptedTransport::new(|frame| {
            Ok(Frame::reply(
                frame.message_id,
                Status::Success,
                Payload::CreateSessionReply(CreateSessionReply { session_id: 3 }),
            ))
        });
        let client = SubsystemClient::new(transport.clone());
        for _ in 0..3 {
            client
                .create_session(Handle(1), 3, SessionId(1), info(), None)
                .await
                .unwrap();
        }
        let ids: Vec<u32> = transport.seen.lock().iter().map(|f| f.message_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn transport_failure_is_distinct_from_peer_rejection() {
        let broken = ScriptedTransport::new(|_| Err(TransportError::Disconnected(Handle(1))));
        let err = SubsystemClient::new(broken)
            .create_session(Handle(1), 1, SessionId(1), info(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportFailure(_)));
        assert_eq!(err.status(), Status::PortDisconnected);

        let rejecting = ScriptedTransport::new(|frame| {
            Ok(Frame::reply(
                frame.message_id,
                Status::AccessDenied,
                Payload::CreateSessionReply(CreateSessionReply { session_id: 0 }),
            ))
        });
        let err = SubsystemClient::new(rejecting)
            .create_session(Handle(1), 1, SessionId(1), info(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PeerRejected(Status::AccessDenied)));
    }

    #[tokio::test]
    async fn mismatched_reply_id_is_a_protocol_error() {
        let transport = ScriptedTransport::new(|frame| {
            Ok(Frame::reply(
                frame.message_id + 10,
                Status::Success,
                Payload::CreateSessionReply(CreateSessionReply { session_id: 1 }),
            ))
        });
        let err = SubsystemClient::new(transport)
            .create_session(Handle(1), 1, SessionId(1), info(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn reply_for_the_other_api_is_a_protocol_error() {
        let transport = ScriptedTransport::new(|frame| {
            Ok(Frame::reply(
                frame.message_id,
                Status::Success,
                Payload::CreateSessionReply(CreateSessionReply { session_id: 1 }),
            ))
        });
        let err = SubsystemClient::new(transport)
            .create_process(Handle(1), "os2ss.exe", "\\", "", LoadFlags::DEFERRED)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn empty_deferred_reply_is_rejected() {
        let transport = ScriptedTransport::new(|frame| {
            Ok(Frame::reply(
                frame.message_id,
                Status::Success,
                Payload::CreateProcessReply(CreateProcessReply { process: None }),
            ))
        });
        let client = SubsystemClient::new(transport);
        let err = client
            .create_process(Handle(1), "os2ss.exe", "\\", "", LoadFlags::DEFERRED)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));

        // Without deferred start an empty reply is fine: the peer already ran it.
        let started = client
            .create_process(Handle(1), "os2ss.exe", "\\", "", LoadFlags::empty())
            .await
            .unwrap();
        assert!(started.is_none());
    }
}
