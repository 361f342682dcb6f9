//! Subsystem registry.
//!
//! One record per running (or starting) subsystem server per session. Records
//! are reference counted explicitly: every successful lookup takes a reference
//! that the caller must hand back with [`SubsystemRegistry::dereference`]. A
//! record's handles are closed exactly once, when its count reaches zero after
//! it was marked terminating.
//!
//! A slot is inserted *before* its server process exists so that concurrent
//! loaders find it and wait on its [`ReadyEvent`] instead of starting a second
//! server.
//!
//! All record state lives behind the single registry lock. The lock is only
//! held for list walking and counter updates, never across an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use smss_protocol::{ClientId, Handle, SessionId, SubsystemKind};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::host::ProcessHost;

/// Manual-reset event signaled when a slot's server is ready (or abandoned).
pub struct ReadyEvent {
    tx: watch::Sender<bool>,
}

impl ReadyEvent {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the event is set. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|set| *set).await;
    }
}

impl fmt::Debug for ReadyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadyEvent").field("set", &self.is_set()).finish()
    }
}

/// Kind of a record: unknown until its server announces itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub enum RecordKind {
    Uninitialized,
    Confirmed(SubsystemKind),
}

impl From<RecordKind> for String {
    fn from(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Uninitialized => "uninitialized".to_string(),
            RecordKind::Confirmed(kind) => kind.to_string(),
        }
    }
}

/// Shared identity of a registry record.
///
/// Mutable state (kind, counts, handles) is owned by the registry and read
/// through [`SubsystemRegistry::snapshot`].
#[derive(Debug)]
pub struct SubsystemRecord {
    id: u64,
    session_id: SessionId,
    ready: ReadyEvent,
}

impl SubsystemRecord {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn ready(&self) -> &ReadyEvent {
        &self.ready
    }
}

/// Point-in-time copy of a record's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordSnapshot {
    pub id: u64,
    pub session_id: SessionId,
    pub kind: RecordKind,
    pub ref_count: u32,
    pub terminating: bool,
    pub linked: bool,
    pub ready: bool,
    pub client_id: Option<ClientId>,
    pub process: Option<Handle>,
    pub channel: Option<Handle>,
}

/// Outcome of [`SubsystemRegistry::reserve_slot`]. Every variant carries a
/// referenced record.
#[derive(Debug)]
pub enum Reservation {
    /// Another slot of this session is still initializing; wait on it.
    Wait(Arc<SubsystemRecord>),
    /// A live server of the requested single-instance kind already exists.
    Existing(Arc<SubsystemRecord>),
    /// A fresh slot was created and linked. It holds the registry's
    /// ownership reference plus the caller's.
    Reserved(Arc<SubsystemRecord>),
}

/// A counted reference that is handed back when dropped.
///
/// Keeps references taken before an `.await` from leaking when the awaiting
/// future is cancelled.
pub struct HeldRecord<'a> {
    registry: &'a SubsystemRegistry,
    record: Arc<SubsystemRecord>,
}

impl<'a> HeldRecord<'a> {
    pub fn new(registry: &'a SubsystemRegistry, record: Arc<SubsystemRecord>) -> Self {
        Self { registry, record }
    }
}

impl std::ops::Deref for HeldRecord<'_> {
    type Target = SubsystemRecord;

    fn deref(&self) -> &SubsystemRecord {
        &self.record
    }
}

impl Drop for HeldRecord<'_> {
    fn drop(&mut self) {
        self.registry.dereference(Arc::clone(&self.record));
    }
}

struct Entry {
    record: Arc<SubsystemRecord>,
    kind: RecordKind,
    ref_count: u32,
    terminating: bool,
    linked: bool,
    client_id: Option<ClientId>,
    process: Option<Handle>,
    channel: Option<Handle>,
}

impl Entry {
    fn live(&self) -> bool {
        self.linked && !self.terminating
    }

    fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            id: self.record.id,
            session_id: self.record.session_id,
            kind: self.kind,
            ref_count: self.ref_count,
            terminating: self.terminating,
            linked: self.linked,
            ready: self.record.ready.is_set(),
            client_id: self.client_id,
            process: self.process,
            channel: self.channel,
        }
    }
}

#[derive(Default)]
struct RegistryState {
    entries: HashMap<u64, Entry>,
    /// Linked records in insertion order.
    order: Vec<u64>,
    primary: Option<u64>,
    next_id: u64,
}

impl RegistryState {
    fn create(
        &mut self,
        session_id: SessionId,
        capacity: Option<usize>,
    ) -> Result<Arc<SubsystemRecord>> {
        if capacity.is_some_and(|max| self.entries.len() >= max) {
            return Err(Error::OutOfMemory);
        }

        self.next_id += 1;
        let record = Arc::new(SubsystemRecord {
            id: self.next_id,
            session_id,
            ready: ReadyEvent::new(),
        });
        self.entries.insert(
            record.id,
            Entry {
                record: Arc::clone(&record),
                kind: RecordKind::Uninitialized,
                ref_count: 1,
                terminating: false,
                linked: false,
                client_id: None,
                process: None,
                channel: None,
            },
        );
        Ok(record)
    }

    fn link(&mut self, id: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            if !entry.linked {
                entry.linked = true;
                self.order.push(id);
            }
        }
    }

    fn find(&self, mut pred: impl FnMut(&Entry) -> bool) -> Option<u64> {
        self.order
            .iter()
            .copied()
            .find(|id| self.entries.get(id).is_some_and(|entry| entry.live() && pred(entry)))
    }

    fn reference(&mut self, id: u64) -> Option<Arc<SubsystemRecord>> {
        let entry = self.entries.get_mut(&id)?;
        entry.ref_count += 1;
        Some(Arc::clone(&entry.record))
    }

    /// Unlink and mark terminating. Returns true if the record was linked.
    fn unlink(&mut self, id: u64) -> bool {
        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.terminating = true;
        if !entry.linked {
            return false;
        }
        entry.linked = false;
        self.order.retain(|linked| *linked != id);
        if self.primary == Some(id) {
            self.primary = None;
        }
        true
    }

    /// Drop one reference; returns the handles to close if the record died.
    fn release(&mut self, id: u64) -> Vec<Handle> {
        let Some(entry) = self.entries.get_mut(&id) else {
            tracing::warn!(target = "smss", record = id, "dereference of freed subsystem record");
            return Vec::new();
        };
        if entry.ref_count == 0 {
            tracing::warn!(
                target = "smss",
                record = id,
                "subsystem record reference count underflow"
            );
            return Vec::new();
        }

        entry.ref_count -= 1;
        if entry.ref_count > 0 || !entry.terminating {
            return Vec::new();
        }

        let Some(entry) = self.entries.remove(&id) else {
            return Vec::new();
        };
        tracing::debug!(
            target = "smss",
            record = id,
            session = %entry.record.session_id,
            "subsystem record freed"
        );
        entry.process.into_iter().chain(entry.channel).collect()
    }
}

/// Registry of subsystem records, keyed by (session, kind).
pub struct SubsystemRegistry {
    state: Mutex<RegistryState>,
    processes: Arc<dyn ProcessHost>,
    capacity: Option<usize>,
}

impl SubsystemRegistry {
    /// Create a registry that closes released handles through `processes`.
    pub fn new(processes: Arc<dyn ProcessHost>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            processes,
            capacity: None,
        }
    }

    /// Limit the number of records (live or still referenced). Allocation
    /// beyond the limit fails with [`Error::OutOfMemory`].
    pub fn with_capacity_limit(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Allocate an uninitialized record with one reference. Not yet linked.
    pub fn create(&self, session_id: SessionId) -> Result<Arc<SubsystemRecord>> {
        let record = self.state.lock().create(session_id, self.capacity)?;
        tracing::debug!(
            target = "smss",
            record = record.id,
            session = %session_id,
            "subsystem record created"
        );
        Ok(record)
    }

    /// Link a record so lookups can find it.
    pub fn insert(&self, record: &SubsystemRecord) {
        self.state.lock().link(record.id);
    }

    /// Unlink a record and mark it terminating.
    ///
    /// Returns true if this call unlinked it; that caller now owes the
    /// dereference for the registry's ownership reference.
    pub fn remove(&self, record: &SubsystemRecord) -> bool {
        self.state.lock().unlink(record.id)
    }

    /// Find a live record of `session` with the given kind and reference it.
    ///
    /// `RecordKind::Uninitialized` finds a slot whose server has not announced
    /// itself yet.
    pub fn lookup_by_kind_and_session(
        &self,
        session_id: SessionId,
        kind: RecordKind,
    ) -> Option<Arc<SubsystemRecord>> {
        let mut state = self.state.lock();
        let id = state.find(|entry| entry.record.session_id == session_id && entry.kind == kind)?;
        state.reference(id)
    }

    /// Find a live record by the client id of its server process and reference it.
    pub fn lookup_by_client_id(&self, client_id: ClientId) -> Option<Arc<SubsystemRecord>> {
        let mut state = self.state.lock();
        let id = state.find(|entry| entry.client_id == Some(client_id))?;
        state.reference(id)
    }

    /// Drop one reference. Closes the record's handles if this was the last
    /// reference of a terminating record.
    pub fn dereference(&self, record: Arc<SubsystemRecord>) {
        let handles = self.state.lock().release(record.id);
        for handle in handles {
            self.processes.close_handle(handle);
        }
    }

    /// Evaluate the drain, reuse and reserve steps of a load in one critical
    /// section, so at most one caller per session passes the reservation
    /// point at a time.
    pub fn reserve_slot(
        &self,
        session_id: SessionId,
        single_instance: Option<SubsystemKind>,
    ) -> Result<Reservation> {
        let mut state = self.state.lock();

        if let Some(id) = state.find(|entry| {
            entry.record.session_id == session_id && entry.kind == RecordKind::Uninitialized
        }) {
            if let Some(record) = state.reference(id) {
                return Ok(Reservation::Wait(record));
            }
        }

        if let Some(kind) = single_instance {
            if let Some(id) = state.find(|entry| {
                entry.record.session_id == session_id && entry.kind == RecordKind::Confirmed(kind)
            }) {
                if let Some(record) = state.reference(id) {
                    return Ok(Reservation::Existing(record));
                }
            }
        }

        let record = state.create(session_id, self.capacity)?;
        state.link(record.id);
        state.reference(record.id);
        Ok(Reservation::Reserved(record))
    }

    /// Record the server process behind a reserved slot. The slot takes
    /// ownership of `process`.
    pub fn populate(&self, record: &SubsystemRecord, process: Handle, client_id: ClientId) {
        if let Some(entry) = self.state.lock().entries.get_mut(&record.id) {
            entry.process = Some(process);
            entry.client_id = Some(client_id);
        }
    }

    /// Set the concrete kind and callback channel of a starting slot, found
    /// through [`Self::lookup_by_client_id`]. Does not signal the ready event.
    pub(crate) fn confirm(
        &self,
        record: &SubsystemRecord,
        kind: SubsystemKind,
        channel: Handle,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let session_id = record.session_id;

        match state.entries.get(&record.id) {
            Some(entry) if entry.live() && entry.kind == RecordKind::Uninitialized => {}
            Some(entry) if entry.live() => {
                return Err(Error::AlreadyConnected(format!(
                    "record {} already announced itself",
                    record.id
                )));
            }
            _ => {
                return Err(Error::NotFound(format!(
                    "subsystem record {} is no longer starting",
                    record.id
                )));
            }
        }
        if state
            .find(|entry| {
                entry.record.session_id == session_id && entry.kind == RecordKind::Confirmed(kind)
            })
            .is_some()
        {
            return Err(Error::AlreadyConnected(format!(
                "a {kind} subsystem already runs in session {session_id}"
            )));
        }

        if let Some(entry) = state.entries.get_mut(&record.id) {
            entry.kind = RecordKind::Confirmed(kind);
            entry.channel = Some(channel);
        }
        Ok(())
    }

    /// Publish a record as the control session's primary subsystem.
    pub fn publish_primary(&self, record: &SubsystemRecord) {
        let mut state = self.state.lock();
        if state.entries.get(&record.id).is_some_and(Entry::live) {
            state.primary = Some(record.id);
        }
    }

    /// The published primary subsystem, if still live.
    pub fn primary(&self) -> Option<RecordSnapshot> {
        let state = self.state.lock();
        state
            .primary
            .and_then(|id| state.entries.get(&id))
            .map(Entry::snapshot)
    }

    /// Unlink every record of a session, signal their ready events and drop
    /// the registry's ownership references. Returns how many were unlinked.
    pub fn remove_session(&self, session_id: SessionId) -> usize {
        let (records, handles) = {
            let mut state = self.state.lock();
            let ids: Vec<u64> = state
                .order
                .iter()
                .copied()
                .filter(|id| {
                    state
                        .entries
                        .get(id)
                        .is_some_and(|entry| entry.record.session_id == session_id)
                })
                .collect();

            let mut records = Vec::with_capacity(ids.len());
            let mut handles = Vec::new();
            for id in ids {
                if let Some(entry) = state.entries.get(&id) {
                    records.push(Arc::clone(&entry.record));
                }
                if state.unlink(id) {
                    handles.extend(state.release(id));
                }
            }
            (records, handles)
        };

        for record in &records {
            record.ready.set();
        }
        for handle in handles {
            self.processes.close_handle(handle);
        }
        records.len()
    }

    /// Callback channel of a confirmed record.
    pub fn channel_of(&self, record: &SubsystemRecord) -> Option<Handle> {
        self.state.lock().entries.get(&record.id).and_then(|entry| entry.channel)
    }

    /// Process handle of a populated record.
    pub fn process_of(&self, record: &SubsystemRecord) -> Option<Handle> {
        self.state.lock().entries.get(&record.id).and_then(|entry| entry.process)
    }

    /// Copy of a record's state, or `None` once it has been freed.
    pub fn snapshot(&self, record: &SubsystemRecord) -> Option<RecordSnapshot> {
        self.state.lock().entries.get(&record.id).map(Entry::snapshot)
    }

    /// Snapshots of all linked records in insertion order.
    pub fn records(&self) -> Vec<RecordSnapshot> {
        let state = self.state.lock();
        state
            .order
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(Entry::snapshot)
            .collect()
    }

    /// Number of records still allocated, linked or not.
    pub fn allocated(&self) -> usize {
        self.state.lock().entries.len()
    }
}
