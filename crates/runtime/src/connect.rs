//! Subsystem connect handshake.
//!
//! A server started by the loader announces itself once it is up. The
//! announcement names the server's process identity, the kind of environment
//! it implements and the callback channel it listens on. Accepting it turns
//! the reserved slot into a confirmed record and releases every caller
//! waiting on the slot's ready event.

use serde::{Deserialize, Serialize};
use smss_protocol::{ClientId, Handle, SessionId, SubsystemKind};

use crate::error::{Error, Result};
use crate::host::ProcessHost;
use crate::registry::{HeldRecord, SubsystemRegistry};

/// A starting server's connect message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubsystemAnnouncement {
    pub session: SessionId,
    pub client_id: ClientId,
    pub kind: SubsystemKind,
    pub channel: Handle,
}

/// Bind an announcing server to its reserved slot and signal the slot ready.
///
/// Unknown client ids fail with `NotFound`; a duplicate announcement, or a
/// second live server of the same kind in the session, fails with
/// `AlreadyConnected`. On failure the announced channel is closed.
pub fn accept_subsystem(
    registry: &SubsystemRegistry,
    processes: &dyn ProcessHost,
    announcement: &SubsystemAnnouncement,
) -> Result<()> {
    let SubsystemAnnouncement {
        session,
        client_id,
        kind,
        channel,
    } = *announcement;

    let confirmed = registry
        .lookup_by_client_id(client_id)
        .map(|record| HeldRecord::new(registry, record))
        .filter(|record| record.session_id() == session)
        .ok_or_else(|| Error::NotFound(format!("no starting subsystem with client id {client_id}")))
        .and_then(|record| registry.confirm(&record, kind, channel).map(|()| record));

    match confirmed {
        Ok(record) => {
            record.ready().set();
            tracing::info!(
                target = "smss",
                session = %session,
                client_id = %client_id,
                kind = %kind,
                record = record.id(),
                "subsystem connected"
            );
            Ok(())
        }
        Err(err) => {
            tracing::warn!(
                target = "smss",
                session = %session,
                client_id = %client_id,
                kind = %kind,
                error = %err,
                "rejected subsystem connection"
            );
            processes.close_handle(channel);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RecordKind;
    use crate::sim::{SimulatedHost, SimulationConfig};
    use std::sync::Arc;

    #[test]
    fn accepted_announcement_confirms_slot_and_signals_ready() {
        let host = Arc::new(SimulatedHost::new(SimulationConfig::default()));
        let registry = SubsystemRegistry::new(host.clone());
        let slot = registry.create(SessionId(1)).unwrap();
        registry.insert(&slot);
        registry.populate(&slot, Handle(0x10), ClientId::new(16, 20));

        let announcement = SubsystemAnnouncement {
            session: SessionId(1),
            client_id: ClientId::new(16, 20),
            kind: SubsystemKind::WindowsGui,
            channel: Handle(0x11),
        };
        accept_subsystem(&registry, host.as_ref(), &announcement).unwrap();

        assert!(slot.ready().is_set());
        let snapshot = registry.snapshot(&slot).unwrap();
        assert_eq!(snapshot.kind, RecordKind::Confirmed(SubsystemKind::WindowsGui));
        assert_eq!(snapshot.channel, Some(Handle(0x11)));

        let again = SubsystemAnnouncement {
            channel: Handle(0x12),
            ..announcement
        };
        let err = accept_subsystem(&registry, host.as_ref(), &again).unwrap_err();
        assert!(matches!(err, Error::AlreadyConnected(_)));
        assert_eq!(host.closed_handles(), vec![Handle(0x12)]);
        assert_eq!(registry.snapshot(&slot).unwrap().channel, Some(Handle(0x11)));
    }

    #[test]
    fn unknown_client_is_rejected_and_channel_closed() {
        let host = Arc::new(SimulatedHost::new(SimulationConfig::default()));
        let registry = SubsystemRegistry::new(host.clone());
        let announcement = SubsystemAnnouncement {
            session: SessionId(0),
            client_id: ClientId::new(1, 2),
            kind: SubsystemKind::Posix,
            channel: Handle(0x77),
        };
        let err = accept_subsystem(&registry, host.as_ref(), &announcement).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(host.closed_handles(), vec![Handle(0x77)]);
    }
}
