//! Collaborator seams.
//!
//! The orchestrator never touches processes, channels, sessions or privileges
//! directly. Each concern is a trait implemented by the embedding system (or by
//! [`crate::sim::SimulatedHost`] in tests and dry runs):
//!
//! - [`ProcessHost`]: process/thread primitives and handle management
//! - [`ChannelTransport`]: synchronous send-and-wait call on a callback channel
//! - [`SessionOracle`]: "does session N still exist?"
//! - [`PrivilegeHost`]: named privileges and kernel session space
//! - [`BootEnvironment`]: boot partition publication and debugger lookup

use std::sync::Arc;

use async_trait::async_trait;
use smss_protocol::{Handle, LoadFlags, ProcessInformation, SessionId, Status};
use thiserror::Error;

use crate::error::Result;

/// Privilege needed to attach session space and install kernel components.
pub const LOAD_DRIVER_PRIVILEGE: &str = "SeLoadDriverPrivilege";

/// Arguments to the process-creation primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub image: String,
    pub directory: String,
    pub command_line: String,
    pub session: SessionId,
    pub flags: LoadFlags,
}

/// Process and thread primitives.
#[async_trait]
pub trait ProcessHost: Send + Sync {
    /// Returns true if `image` resolves to a loadable file.
    fn image_exists(&self, image: &str) -> bool;

    /// Create a process with its initial thread suspended.
    async fn create_process(&self, request: &SpawnRequest) -> Result<ProcessInformation>;

    /// Resume a suspended thread.
    fn resume_thread(&self, thread: Handle) -> Result<()>;

    /// Terminate a process with the given exit status.
    fn terminate_process(&self, process: Handle, exit_status: Status);

    /// Duplicate `source` into the address space of `target_process`.
    ///
    /// The duplicate belongs to the target process.
    fn duplicate_handle_into(&self, source: Handle, target_process: Handle) -> Result<Handle>;

    /// Close a handle owned by this process.
    fn close_handle(&self, handle: Handle);

    /// Wait for a process to exit and return its exit status.
    async fn wait_for_exit(&self, process: Handle) -> Result<Status>;
}

/// Transport-level failure of a channel call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The peer closed its end of the channel.
    #[error("channel {0} disconnected")]
    Disconnected(Handle),

    /// Any other failure to deliver the request or collect the reply.
    #[error("{0}")]
    Broken(String),
}

/// Synchronous request/reply call on a callback channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Send `request` and wait for the peer's reply bytes.
    async fn call(
        &self,
        channel: Handle,
        request: Vec<u8>,
    ) -> std::result::Result<Vec<u8>, TransportError>;
}

/// Session existence oracle.
pub trait SessionOracle: Send + Sync {
    fn session_exists(&self, session: SessionId) -> bool;
}

/// Token returned by [`PrivilegeHost::acquire_privilege`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrivilegeToken(pub u64);

/// Privileges and kernel session space.
pub trait PrivilegeHost: Send + Sync {
    fn acquire_privilege(&self, name: &str) -> Result<PrivilegeToken>;

    fn release_privilege(&self, token: PrivilegeToken);

    fn attach_session_space(&self, session: SessionId) -> Result<()>;

    fn detach_session_space(&self, session: SessionId) -> Result<()>;

    /// Install the kernel display component into the attached session space.
    fn install_kernel_display(&self, image: &str) -> Result<()>;
}

/// Boot-time environment queries used by the session sequencer.
pub trait BootEnvironment: Send + Sync {
    /// Publish boot partition path information for later boot steps.
    fn publish_boot_paths(&self) -> Result<()>;

    /// Debugger command line to prefix the default initial command with.
    fn debugger_command(&self) -> Option<String>;
}

/// The full set of collaborators an orchestrator needs.
#[derive(Clone)]
pub struct HostServices {
    pub processes: Arc<dyn ProcessHost>,
    pub transport: Arc<dyn ChannelTransport>,
    pub sessions: Arc<dyn SessionOracle>,
    pub privileges: Arc<dyn PrivilegeHost>,
    pub boot: Arc<dyn BootEnvironment>,
}

impl HostServices {
    /// Use one object for every collaborator role.
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: ProcessHost
            + ChannelTransport
            + SessionOracle
            + PrivilegeHost
            + BootEnvironment
            + 'static,
    {
        Self {
            processes: host.clone(),
            transport: host.clone(),
            sessions: host.clone(),
            privileges: host.clone(),
            boot: host,
        }
    }
}

/// Holds a privilege for the lifetime of the scope.
pub struct PrivilegeScope<'a> {
    host: &'a dyn PrivilegeHost,
    token: Option<PrivilegeToken>,
}

impl<'a> PrivilegeScope<'a> {
    pub fn acquire(host: &'a dyn PrivilegeHost, name: &str) -> Result<Self> {
        let token = host.acquire_privilege(name)?;
        tracing::debug!(target = "smss", privilege = name, "privilege acquired");
        Ok(Self {
            host,
            token: Some(token),
        })
    }
}

impl Drop for PrivilegeScope<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.host.release_privilege(token);
        }
    }
}
