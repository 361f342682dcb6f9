//! In-memory host for dry runs and tests.
//!
//! [`SimulatedHost`] implements every collaborator trait. Processes are rows in
//! a table, handles are counters, and subsystem servers answer the frames sent
//! to their callback channels the way a peer subsystem would. Every call is
//! recorded so tests can assert on what the orchestrator did.
//!
//! A server announces itself when its thread is resumed, by running the
//! connect handshake against the registry given to
//! [`SimulatedHost::attach_registry`].

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smss_protocol::{
    ClientId, CreateProcessReply, CreateSessionReply, CreateSessionRequest, Frame, Handle,
    LoadFlags, Payload, ProcessInformation, SessionId, Status, SubsystemKind, decode, encode,
};

use crate::connect::{SubsystemAnnouncement, accept_subsystem};
use crate::error::{Error, Result};
use crate::host::{
    BootEnvironment, ChannelTransport, PrivilegeHost, PrivilegeToken, ProcessHost, SessionOracle,
    SpawnRequest, TransportError,
};
use crate::registry::SubsystemRegistry;

/// One image known to the simulated file system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimImage {
    /// Full path, or a bare file name matching the image in any directory.
    pub path: String,
    /// Kind the image header resolves to.
    pub kind: SubsystemKind,
    /// Kind the process announces itself as once resumed. Images that never
    /// announce are ordinary programs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub announces: Option<SubsystemKind>,
    /// Delay before the announcement, in milliseconds.
    #[serde(default)]
    pub announce_delay_ms: u64,
    #[serde(default)]
    pub resume_fails: bool,
}

impl SimImage {
    pub fn new(path: impl Into<String>, kind: SubsystemKind) -> Self {
        Self {
            path: path.into(),
            kind,
            announces: None,
            announce_delay_ms: 0,
            resume_fails: false,
        }
    }

    pub fn announcing(mut self, kind: SubsystemKind) -> Self {
        self.announces = Some(kind);
        self
    }

    pub fn announce_after(mut self, delay: Duration) -> Self {
        self.announce_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn failing_resume(mut self) -> Self {
        self.resume_fails = true;
        self
    }

    fn matches(&self, image: &str) -> bool {
        if self.path.contains('\\') {
            self.path.eq_ignore_ascii_case(image)
        } else {
            image
                .rsplit('\\')
                .next()
                .is_some_and(|name| name.eq_ignore_ascii_case(&self.path))
        }
    }
}

/// Behavior of the simulated host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimulationConfig {
    pub images: Vec<SimImage>,
    /// Live sessions besides the control session, which always exists.
    pub sessions: Vec<SessionId>,
    /// Servers of these kinds have broken callback channels.
    pub unreachable_servers: Vec<SubsystemKind>,
    /// Status with which servers reject session creation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_rejection: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debugger: Option<String>,
    pub privilege_denied: bool,
    /// Handle duplications beyond this many fail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duplicate_limit: Option<usize>,
}

/// A process created on the simulated host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimProcess {
    pub image: String,
    pub command_line: String,
    pub session: SessionId,
    pub client_id: ClientId,
    pub process: Handle,
    pub thread: Handle,
    pub kind: SubsystemKind,
    pub flags: LoadFlags,
    /// Client id of the server that created it through its callback channel.
    pub brokered_by: Option<ClientId>,
    pub resumed: bool,
    pub waited: bool,
    pub terminated: Option<Status>,
}

/// Privilege, session-space and boot calls, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    PublishBootPaths,
    AcquirePrivilege(String),
    ReleasePrivilege(String),
    AttachSessionSpace(SessionId),
    DetachSessionSpace(SessionId),
    InstallKernelDisplay(String),
}

#[derive(Debug, Clone, Copy)]
struct ChannelOwner {
    session: SessionId,
    kind: SubsystemKind,
    server: ClientId,
}

struct SimState {
    next_handle: u64,
    next_pid: u32,
    next_token: u64,
    processes: Vec<SimProcess>,
    channels: HashMap<Handle, ChannelOwner>,
    duplicates: Vec<(Handle, Handle, Handle)>,
    closed: Vec<Handle>,
    sessions: HashSet<SessionId>,
    tokens: HashMap<PrivilegeToken, String>,
    calls: Vec<HostCall>,
    session_requests: Vec<CreateSessionRequest>,
    registry: Weak<SubsystemRegistry>,
}

impl SimState {
    fn handle(&mut self) -> Handle {
        self.next_handle += 4;
        Handle(self.next_handle)
    }

    fn process_by_thread(&mut self, thread: Handle) -> Option<&mut SimProcess> {
        self.processes.iter_mut().find(|p| p.thread == thread)
    }

    fn process_by_handle(&mut self, process: Handle) -> Option<&mut SimProcess> {
        self.processes.iter_mut().find(|p| p.process == process)
    }
}

/// Simulated process, channel, session, privilege and boot host.
///
/// Clones share state.
#[derive(Clone)]
pub struct SimulatedHost {
    config: Arc<SimulationConfig>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedHost {
    pub fn new(config: SimulationConfig) -> Self {
        let sessions = config.sessions.iter().copied().chain([SessionId::CONTROL]).collect();
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(SimState {
                next_handle: 0x1000,
                next_pid: 0x100,
                next_token: 0,
                processes: Vec::new(),
                channels: HashMap::new(),
                duplicates: Vec::new(),
                closed: Vec::new(),
                sessions,
                tokens: HashMap::new(),
                calls: Vec::new(),
                session_requests: Vec::new(),
                registry: Weak::new(),
            })),
        }
    }

    /// Registry that announcing servers connect to.
    pub fn attach_registry(&self, registry: &Arc<SubsystemRegistry>) {
        self.state.lock().registry = Arc::downgrade(registry);
    }

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn add_session(&self, session: SessionId) {
        self.state.lock().sessions.insert(session);
    }

    /// Make a session disappear, as if torn down by someone else.
    pub fn end_session(&self, session: SessionId) {
        self.state.lock().sessions.remove(&session);
    }

    pub fn processes(&self) -> Vec<SimProcess> {
        self.state.lock().processes.clone()
    }

    pub fn process(&self, client_id: ClientId) -> Option<SimProcess> {
        self.state
            .lock()
            .processes
            .iter()
            .find(|p| p.client_id == client_id)
            .cloned()
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().processes.len()
    }

    /// Closed handles in close order.
    pub fn closed_handles(&self) -> Vec<Handle> {
        self.state.lock().closed.clone()
    }

    /// (source, target process, duplicate) triples.
    pub fn duplicated_handles(&self) -> Vec<(Handle, Handle, Handle)> {
        self.state.lock().duplicates.clone()
    }

    pub fn host_calls(&self) -> Vec<HostCall> {
        self.state.lock().calls.clone()
    }

    /// Session-creation requests received by any server.
    pub fn session_requests(&self) -> Vec<CreateSessionRequest> {
        self.state.lock().session_requests.clone()
    }

    fn image(&self, image: &str) -> Option<&SimImage> {
        self.config.images.iter().find(|candidate| candidate.matches(image))
    }

    fn spawn(
        &self,
        request: &SpawnRequest,
        brokered_by: Option<ClientId>,
    ) -> Result<ProcessInformation> {
        let Some(image) = self.image(&request.image) else {
            return Err(Error::Process {
                status: Status::ObjectNameNotFound,
                message: format!("image '{}' not found", request.image),
            });
        };

        let mut state = self.state.lock();
        state.next_pid += 4;
        let pid = state.next_pid;
        let process = state.handle();
        let thread = state.handle();
        let info = ProcessInformation {
            process,
            thread,
            client_id: ClientId::new(pid, pid + 4),
            kind: image.kind,
        };
        state.processes.push(SimProcess {
            image: request.image.clone(),
            command_line: request.command_line.clone(),
            session: request.session,
            client_id: info.client_id,
            process,
            thread,
            kind: image.kind,
            flags: request.flags,
            brokered_by,
            resumed: false,
            waited: false,
            terminated: None,
        });
        Ok(info)
    }

    fn announce(&self, announcement: SubsystemAnnouncement) {
        let Some(registry) = self.state.lock().registry.upgrade() else {
            tracing::debug!(
                target = "smss::sim",
                client_id = %announcement.client_id,
                "no registry to announce to"
            );
            return;
        };
        // Rejections are logged by the handshake itself.
        let _ = accept_subsystem(&registry, self, &announcement);
    }

    fn serve(
        &self,
        owner: ChannelOwner,
        frame: Frame,
    ) -> std::result::Result<Frame, TransportError> {
        let id = frame.message_id;
        match frame.payload {
            Payload::CreateProcess(request) => {
                let flags = request.load_flags();
                let spawn = SpawnRequest {
                    image: request.image,
                    directory: request.directory,
                    command_line: request.command_line,
                    session: owner.session,
                    flags,
                };
                let reply = match self.spawn(&spawn, Some(owner.server)) {
                    Ok(info) if flags.contains(LoadFlags::DEFERRED) => Frame::reply(
                        id,
                        Status::Success,
                        Payload::CreateProcessReply(CreateProcessReply { process: Some(info) }),
                    ),
                    Ok(info) => {
                        if let Err(err) = self.resume_thread(info.thread) {
                            tracing::debug!(
                                target = "smss::sim",
                                error = %err,
                                "brokered resume failed"
                            );
                        }
                        Frame::reply(
                            id,
                            Status::Success,
                            Payload::CreateProcessReply(CreateProcessReply { process: None }),
                        )
                    }
                    Err(err) => Frame::reply(
                        id,
                        err.status(),
                        Payload::CreateProcessReply(CreateProcessReply { process: None }),
                    ),
                };
                Ok(reply)
            }
            Payload::CreateSession(request) => {
                let session_id = request.session_id;
                self.state.lock().session_requests.push(request);
                let status = self.config.session_rejection.unwrap_or(Status::Success);
                Ok(Frame::reply(
                    id,
                    status,
                    Payload::CreateSessionReply(CreateSessionReply { session_id }),
                ))
            }
            other => Err(TransportError::Broken(format!(
                "server cannot answer {:?} reply",
                other.api()
            ))),
        }
    }
}

#[async_trait]
impl ProcessHost for SimulatedHost {
    fn image_exists(&self, image: &str) -> bool {
        self.image(image).is_some()
    }

    async fn create_process(&self, request: &SpawnRequest) -> Result<ProcessInformation> {
        self.spawn(request, None)
    }

    fn resume_thread(&self, thread: Handle) -> Result<()> {
        let (image, session, client_id) = {
            let mut state = self.state.lock();
            let process = state.process_by_thread(thread).ok_or_else(|| Error::Process {
                status: Status::InvalidParameter,
                message: format!("no thread {thread}"),
            })?;
            (process.image.clone(), process.session, process.client_id)
        };

        let Some(config) = self.image(&image).cloned() else {
            return Err(Error::Process {
                status: Status::ObjectNameNotFound,
                message: format!("image '{image}' vanished"),
            });
        };
        if config.resume_fails {
            return Err(Error::Process {
                status: Status::Unsuccessful,
                message: format!("thread {thread} of '{image}' cannot run"),
            });
        }

        let announcement = {
            let mut state = self.state.lock();
            if let Some(process) = state.process_by_thread(thread) {
                process.resumed = true;
            }
            config.announces.map(|kind| {
                let channel = state.handle();
                state.channels.insert(
                    channel,
                    ChannelOwner {
                        session,
                        kind,
                        server: client_id,
                    },
                );
                SubsystemAnnouncement {
                    session,
                    client_id,
                    kind,
                    channel,
                }
            })
        };

        if let Some(announcement) = announcement {
            let delayed = config.announce_delay_ms > 0;
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) if delayed => {
                    let host = self.clone();
                    let delay = Duration::from_millis(config.announce_delay_ms);
                    runtime.spawn(async move {
                        tokio::time::sleep(delay).await;
                        host.announce(announcement);
                    });
                }
                _ => self.announce(announcement),
            }
        }
        Ok(())
    }

    fn terminate_process(&self, process: Handle, exit_status: Status) {
        if let Some(process) = self.state.lock().process_by_handle(process) {
            process.terminated = Some(exit_status);
        }
    }

    fn duplicate_handle_into(&self, source: Handle, target_process: Handle) -> Result<Handle> {
        let mut state = self.state.lock();
        let known = state
            .processes
            .iter()
            .any(|p| p.process == source || p.thread == source);
        let exhausted = self
            .config
            .duplicate_limit
            .is_some_and(|limit| state.duplicates.len() >= limit);
        if exhausted || !known || !state.processes.iter().any(|p| p.process == target_process) {
            return Err(Error::Process {
                status: Status::InvalidParameter,
                message: format!("cannot duplicate {source} into {target_process}"),
            });
        }
        let duplicate = state.handle();
        state.duplicates.push((source, target_process, duplicate));
        Ok(duplicate)
    }

    fn close_handle(&self, handle: Handle) {
        let mut state = self.state.lock();
        if state.closed.contains(&handle) {
            tracing::warn!(target = "smss::sim", %handle, "handle closed twice");
        }
        state.channels.remove(&handle);
        state.closed.push(handle);
    }

    async fn wait_for_exit(&self, process: Handle) -> Result<Status> {
        let mut state = self.state.lock();
        let process = state.process_by_handle(process).ok_or_else(|| Error::Process {
            status: Status::InvalidParameter,
            message: format!("no process {process}"),
        })?;
        process.waited = true;
        Ok(process.terminated.unwrap_or(Status::Success))
    }
}

#[async_trait]
impl ChannelTransport for SimulatedHost {
    async fn call(
        &self,
        channel: Handle,
        request: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, TransportError> {
        let owner = self
            .state
            .lock()
            .channels
            .get(&channel)
            .copied()
            .ok_or(TransportError::Disconnected(channel))?;
        if self.config.unreachable_servers.contains(&owner.kind) {
            return Err(TransportError::Broken(format!("{} server unreachable", owner.kind)));
        }

        let frame = decode(&request).map_err(|e| TransportError::Broken(e.to_string()))?;
        let reply = self.serve(owner, frame)?;
        encode(&reply).map_err(|e| TransportError::Broken(e.to_string()))
    }
}

impl SessionOracle for SimulatedHost {
    fn session_exists(&self, session: SessionId) -> bool {
        self.state.lock().sessions.contains(&session)
    }
}

impl PrivilegeHost for SimulatedHost {
    fn acquire_privilege(&self, name: &str) -> Result<PrivilegeToken> {
        if self.config.privilege_denied {
            return Err(Error::Privilege(format!("{name} not held")));
        }
        let mut state = self.state.lock();
        state.next_token += 1;
        let token = PrivilegeToken(state.next_token);
        state.tokens.insert(token, name.to_string());
        state.calls.push(HostCall::AcquirePrivilege(name.to_string()));
        Ok(token)
    }

    fn release_privilege(&self, token: PrivilegeToken) {
        let mut state = self.state.lock();
        if let Some(name) = state.tokens.remove(&token) {
            state.calls.push(HostCall::ReleasePrivilege(name));
        }
    }

    fn attach_session_space(&self, session: SessionId) -> Result<()> {
        let mut state = self.state.lock();
        if !state.sessions.contains(&session) {
            return Err(Error::Privilege(format!("session {session} has no session space")));
        }
        state.calls.push(HostCall::AttachSessionSpace(session));
        Ok(())
    }

    fn detach_session_space(&self, session: SessionId) -> Result<()> {
        self.state.lock().calls.push(HostCall::DetachSessionSpace(session));
        Ok(())
    }

    fn install_kernel_display(&self, image: &str) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(HostCall::InstallKernelDisplay(image.to_string()));
        Ok(())
    }
}

impl BootEnvironment for SimulatedHost {
    fn publish_boot_paths(&self) -> Result<()> {
        self.state.lock().calls.push(HostCall::PublishBootPaths);
        Ok(())
    }

    fn debugger_command(&self) -> Option<String> {
        self.config.debugger.clone()
    }
}
