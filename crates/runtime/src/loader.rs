//! Subsystem loader.
//!
//! [`SubsystemLoader::load_subsystem`] brings up the server that must run an
//! image in a session, or reuses the one already running. The steps are:
//!
//! 1. Reject images the host could not resolve
//! 2. Wait out slots of the session still initializing, reuse a live
//!    single-instance server, or reserve a fresh slot
//! 3. Create the process suspended, directly or through the broker
//!    subsystem's callback channel
//! 4. Native images are servers themselves; any other image gets an execution
//!    session from its governing subsystem
//! 5. Resume the thread and wait for the server to connect
//!
//! Every resource taken by steps 3-5 is released by [`CreationAttempt`],
//! whichever step failed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use smss_protocol::{
    ClientId, DebugInfo, LoadFlags, ProcessInformation, SessionId, Status, SubsystemKind,
};

use crate::client::SubsystemClient;
use crate::config::LoaderOptions;
use crate::error::{Error, Result};
use crate::host::{HostServices, LOAD_DRIVER_PRIVILEGE, PrivilegeScope, SpawnRequest};
use crate::kinds::KindTable;
use crate::registry::{
    HeldRecord, RecordKind, RecordSnapshot, Reservation, SubsystemRecord, SubsystemRegistry,
};

/// Arguments of [`SubsystemLoader::load_subsystem`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub image: String,
    pub directory: String,
    pub command_line: String,
    pub session: SessionId,
    pub flags: LoadFlags,
}

/// Successful load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    /// Client id of the server process. `None` only when a reused server
    /// never recorded one.
    pub client_id: Option<ClientId>,
    /// An already running single-instance server satisfied the request.
    pub reused: bool,
}

/// Orchestrates subsystem server creation.
pub struct SubsystemLoader {
    registry: Arc<SubsystemRegistry>,
    host: HostServices,
    client: SubsystemClient,
    kinds: KindTable,
    options: LoaderOptions,
    attached_session: Mutex<Option<SessionId>>,
    next_session_local: AtomicU32,
}

impl SubsystemLoader {
    pub fn new(
        registry: Arc<SubsystemRegistry>,
        host: HostServices,
        kinds: KindTable,
        options: LoaderOptions,
    ) -> Self {
        let client = SubsystemClient::new(Arc::clone(&host.transport));
        Self {
            registry,
            host,
            client,
            kinds,
            options,
            attached_session: Mutex::new(None),
            next_session_local: AtomicU32::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<SubsystemRegistry> {
        &self.registry
    }

    pub fn host(&self) -> &HostServices {
        &self.host
    }

    pub fn kinds(&self) -> &KindTable {
        &self.kinds
    }

    /// Start (or reuse) the subsystem server for `request.image` in
    /// `request.session`.
    pub async fn load_subsystem(&self, request: &LoadRequest) -> Result<LoadOutcome> {
        if request.flags.contains(LoadFlags::INVALID_PATH) {
            return Err(Error::NotFound(request.image.clone()));
        }

        let single_instance = self.kinds.single_instance(request.flags);
        let slot = loop {
            match self.registry.reserve_slot(request.session, single_instance)? {
                Reservation::Wait(pending) => {
                    let pending = HeldRecord::new(&self.registry, pending);
                    tracing::debug!(
                        target = "smss",
                        session = %request.session,
                        record = pending.id(),
                        "waiting for initializing subsystem"
                    );
                    pending.ready().wait().await;
                }
                Reservation::Existing(existing) => {
                    let client_id = self.registry.snapshot(&existing).and_then(|s| s.client_id);
                    self.registry.dereference(existing);
                    tracing::debug!(
                        target = "smss",
                        session = %request.session,
                        image = %request.image,
                        "single-instance subsystem already running"
                    );
                    return Ok(LoadOutcome {
                        client_id,
                        reused: true,
                    });
                }
                Reservation::Reserved(slot) => break slot,
            }
        };

        let mut attempt = CreationAttempt::new(self, request, slot);
        let result = attempt.run().await;
        attempt.conclude(result.as_ref().err());

        match result {
            Ok(client_id) => {
                tracing::info!(
                    target = "smss",
                    session = %request.session,
                    image = %request.image,
                    client_id = %client_id,
                    "subsystem started"
                );
                Ok(LoadOutcome {
                    client_id: Some(client_id),
                    reused: false,
                })
            }
            Err(err) => {
                tracing::warn!(
                    target = "smss",
                    session = %request.session,
                    image = %request.image,
                    status = %err.status(),
                    error = %err,
                    "subsystem start failed"
                );
                Err(err)
            }
        }
    }

    /// Drop every record of a torn-down session. Loads waiting on one of its
    /// slots wake up and find the session gone.
    pub fn teardown_session(&self, session: SessionId) -> usize {
        let removed = self.registry.remove_session(session);
        let mut attached = self.attached_session.lock();
        if *attached == Some(session) {
            *attached = None;
        }
        tracing::info!(target = "smss", session = %session, removed, "session torn down");
        removed
    }

    /// Remember that the session space of `session` is attached, so a failed
    /// load in that session detaches it.
    pub fn note_session_attached(&self, session: SessionId) {
        *self.attached_session.lock() = Some(session);
    }

    pub fn attached_session(&self) -> Option<SessionId> {
        *self.attached_session.lock()
    }

    /// The control session's published primary subsystem.
    pub fn primary_subsystem(&self) -> Option<RecordSnapshot> {
        self.registry.primary()
    }

    fn lookup_confirmed(
        &self,
        session: SessionId,
        kind: SubsystemKind,
    ) -> Result<Arc<SubsystemRecord>> {
        self.registry
            .lookup_by_kind_and_session(session, RecordKind::Confirmed(kind))
            .ok_or_else(|| Error::NotFound(format!("no {kind} subsystem in session {session}")))
    }

    fn debug_info(&self, flags: LoadFlags) -> Option<DebugInfo> {
        if !flags.contains(LoadFlags::DEBUG) {
            return None;
        }
        self.options
            .debug_ui_client_id
            .map(|debug_ui_client_id| DebugInfo { debug_ui_client_id })
    }
}

/// Resources of one in-flight server creation.
///
/// Holds a counted reference to the reserved slot. [`conclude`] releases
/// everything exactly once; dropping an unconcluded attempt (the load future
/// was cancelled) rolls it back.
///
/// [`conclude`]: CreationAttempt::conclude
struct CreationAttempt<'a> {
    loader: &'a SubsystemLoader,
    request: &'a LoadRequest,
    slot: Option<Arc<SubsystemRecord>>,
    broker: Option<Arc<SubsystemRecord>>,
    process: Option<ProcessInformation>,
}

impl<'a> CreationAttempt<'a> {
    fn new(
        loader: &'a SubsystemLoader,
        request: &'a LoadRequest,
        slot: Arc<SubsystemRecord>,
    ) -> Self {
        Self {
            loader,
            request,
            slot: Some(slot),
            broker: None,
            process: None,
        }
    }

    fn slot(&self) -> Result<&Arc<SubsystemRecord>> {
        self.slot.as_ref().ok_or(Error::Cancelled)
    }

    async fn run(&mut self) -> Result<ClientId> {
        let loader = self.loader;
        let request = self.request;
        let session = request.session;
        let flags = request.flags | LoadFlags::DEFERRED;

        let info = match loader.kinds.broker_for(request.flags) {
            Some(broker_kind) => {
                let broker = loader.lookup_confirmed(session, broker_kind)?;
                let channel = loader.registry.channel_of(&broker);
                self.broker = Some(broker);
                let channel = channel.ok_or_else(|| {
                    Error::NotFound(format!("{broker_kind} subsystem has no callback channel"))
                })?;
                loader
                    .client
                    .create_process(
                        channel,
                        &request.image,
                        &request.directory,
                        &request.command_line,
                        flags,
                    )
                    .await?
                    .ok_or_else(|| Error::Protocol("broker returned no process".to_string()))?
            }
            None => {
                loader
                    .host
                    .processes
                    .create_process(&SpawnRequest {
                        image: request.image.clone(),
                        directory: request.directory.clone(),
                        command_line: request.command_line.clone(),
                        session,
                        flags,
                    })
                    .await?
            }
        };

        self.process = Some(info);
        loader.registry.populate(self.slot()?, info.process, info.client_id);

        if info.kind == SubsystemKind::Native {
            // Servers started by a broker are never the primary.
            if session.is_control() && self.broker.is_none() {
                loader.registry.publish_primary(self.slot()?);
            }
        } else {
            self.open_execution_session(info).await?;
        }

        loader
            .host
            .processes
            .resume_thread(info.thread)
            .map_err(|err| Error::ResumeFailed(err.to_string()))?;

        self.wait_until_ready().await?;
        Ok(info.client_id)
    }

    /// Hand a non-native process to the subsystem that governs its kind.
    async fn open_execution_session(&mut self, info: ProcessInformation) -> Result<()> {
        let loader = self.loader;
        let session = self.request.session;
        let governing =
            HeldRecord::new(&loader.registry, loader.lookup_confirmed(session, info.kind)?);

        let (target, channel) = match (
            loader.registry.process_of(&governing),
            loader.registry.channel_of(&governing),
        ) {
            (Some(target), Some(channel)) => (target, channel),
            _ => {
                return Err(Error::NotFound(format!(
                    "{} subsystem in session {session} is not connected",
                    info.kind
                )));
            }
        };

        let processes = &loader.host.processes;
        let process = processes.duplicate_handle_into(info.process, target)?;
        let thread = match processes.duplicate_handle_into(info.thread, target) {
            Ok(thread) => thread,
            Err(err) => {
                processes.close_handle(process);
                return Err(err);
            }
        };
        let duplicated = ProcessInformation {
            process,
            thread,
            ..info
        };

        let session_local = loader.next_session_local.fetch_add(1, Ordering::Relaxed);
        let assigned = loader
            .client
            .create_session(
                channel,
                session_local,
                session,
                duplicated,
                loader.debug_info(self.request.flags),
            )
            .await?;
        tracing::debug!(
            target = "smss",
            session = %session,
            client_id = %info.client_id,
            session_local = assigned,
            "execution session created"
        );
        Ok(())
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let loader = self.loader;
        let session = self.request.session;
        let slot = self.slot()?;

        if session.is_control() {
            slot.ready().wait().await;
        } else {
            let limit = loader.options.ready_timeout();
            let waited = tokio::time::timeout(limit, slot.ready().wait()).await;
            if !loader.host.sessions.session_exists(session) {
                return Err(Error::SessionDeleted(session));
            }
            if waited.is_err() {
                return Err(Error::Timeout {
                    session,
                    waited_ms: duration_ms(limit),
                });
            }
        }

        if loader.registry.snapshot(slot).is_none_or(|s| s.terminating) {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Release every resource of the attempt. `failure` is the error the
    /// attempt ended with, if any.
    fn conclude(mut self, failure: Option<&Error>) {
        self.release(failure);
    }

    fn release(&mut self, failure: Option<&Error>) {
        let Some(slot) = self.slot.take() else {
            return;
        };
        let loader = self.loader;
        let processes = &loader.host.processes;

        if let Some(error) = failure {
            if !error.is_session_deleted() {
                self.roll_back(error);
            }
        }

        if let Some(info) = self.process {
            processes.close_handle(info.thread);
        }
        if let Some(broker) = self.broker.take() {
            loader.registry.dereference(broker);
        }

        if failure.is_some() {
            if loader.registry.remove(&slot) {
                loader.registry.dereference(Arc::clone(&slot));
            }
            slot.ready().set();
        }
        loader.registry.dereference(slot);
    }

    fn roll_back(&self, error: &Error) {
        let loader = self.loader;
        let session = self.request.session;

        let hosted = loader.kinds.is_hosted(self.request.flags);
        let mut attached = loader.attached_session.lock();
        if *attached == Some(session) && !hosted {
            match PrivilegeScope::acquire(loader.host.privileges.as_ref(), LOAD_DRIVER_PRIVILEGE) {
                Ok(_privilege) => {
                    if let Err(err) = loader.host.privileges.detach_session_space(session) {
                        tracing::warn!(
                            target = "smss",
                            session = %session,
                            error = %err,
                            "session space detach failed"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        target = "smss",
                        session = %session,
                        error = %err,
                        "cannot detach session space"
                    );
                }
            }
            *attached = None;
        }
        drop(attached);

        if let Some(info) = self.process {
            let exit_status = match error.status() {
                Status::Success => Status::Unsuccessful,
                status => status,
            };
            loader.host.processes.terminate_process(info.process, exit_status);
        }
    }
}

impl Drop for CreationAttempt<'_> {
    fn drop(&mut self) {
        if self.slot.is_some() {
            tracing::debug!(
                target = "smss",
                session = %self.request.session,
                image = %self.request.image,
                "subsystem start abandoned"
            );
            self.release(Some(&Error::Cancelled));
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimImage, SimulatedHost, SimulationConfig};

    fn loader(images: Vec<SimImage>) -> (SimulatedHost, SubsystemLoader) {
        let host = SimulatedHost::new(SimulationConfig {
            images,
            ..SimulationConfig::default()
        });
        let services = HostServices::from_host(Arc::new(host.clone()));
        let registry = Arc::new(SubsystemRegistry::new(Arc::clone(&services.processes)));
        host.attach_registry(&registry);
        let loader = SubsystemLoader::new(
            registry,
            services,
            KindTable::default(),
            LoaderOptions::default(),
        );
        (host, loader)
    }

    fn request(image: &str, session: u32, flags: LoadFlags) -> LoadRequest {
        LoadRequest {
            image: image.to_string(),
            directory: "\\".to_string(),
            command_line: image.to_string(),
            session: SessionId(session),
            flags,
        }
    }

    #[tokio::test]
    async fn unreachable_image_is_rejected_before_any_registry_work() {
        let (host, loader) = loader(Vec::new());
        let err = loader
            .load_subsystem(&request("gone.exe", 0, LoadFlags::INVALID_PATH | LoadFlags::SUBSYSTEM))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(loader.registry().allocated(), 0);
        assert_eq!(host.created_count(), 0);
    }

    #[tokio::test]
    async fn resume_failure_terminates_and_removes_slot() {
        let (host, loader) = loader(vec![
            SimImage::new("csrss.exe", SubsystemKind::Native)
                .announcing(SubsystemKind::WindowsGui)
                .failing_resume(),
        ]);
        let err = loader
            .load_subsystem(&request("csrss.exe", 0, LoadFlags::SUBSYSTEM))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ResumeFailed(_)));
        assert_eq!(err.status(), Status::ResumeFailed);

        let process = &host.processes()[0];
        assert_eq!(process.terminated, Some(Status::ResumeFailed));
        let mut closed = host.closed_handles();
        closed.sort();
        assert_eq!(closed, vec![process.process, process.thread]);
        assert_eq!(loader.registry().allocated(), 0);
        assert!(loader.primary_subsystem().is_none());
    }

    #[tokio::test]
    async fn failed_load_detaches_session_space_it_attached() {
        let (host, loader) = loader(vec![
            SimImage::new("csrss.exe", SubsystemKind::Native).failing_resume(),
        ]);
        host.add_session(SessionId(2));
        loader.note_session_attached(SessionId(2));

        loader
            .load_subsystem(&request("csrss.exe", 2, LoadFlags::SUBSYSTEM))
            .await
            .unwrap_err();

        assert!(host
            .host_calls()
            .contains(&crate::sim::HostCall::DetachSessionSpace(SessionId(2))));
        assert_eq!(loader.attached_session(), None);
    }

    #[tokio::test]
    async fn cancelled_load_rolls_back_its_slot() {
        let (host, loader) = loader(vec![SimImage::new("csrss.exe", SubsystemKind::Native)]);
        // The image never announces, so the control-session wait never ends.
        let request = request("csrss.exe", 0, LoadFlags::SUBSYSTEM);
        let load = loader.load_subsystem(&request);
        let outcome = tokio::time::timeout(Duration::from_millis(10), load).await;
        assert!(outcome.is_err());

        assert_eq!(loader.registry().allocated(), 0);
        assert!(host.processes()[0].terminated.is_some());
    }
}
