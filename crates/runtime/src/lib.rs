//! Session manager runtime - subsystem registry, loader and session startup
//!
//! This crate holds the orchestration core of an NT-style session manager:
//!
//! - **Registry**: reference-counted subsystem server records per session
//! - **Client**: the create-process / create-session calls sent to a server's
//!   callback channel
//! - **Loader**: lazy, race-free server creation with rollback on failure
//! - **Sequencer**: the fixed startup sequence of a new session
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐
//! │   Sequencer   │  directives, kernel display, initial command
//! └───────┬───────┘
//!         │ load_subsystem
//! ┌───────▼───────┐      ┌──────────┐
//! │    Loader     │─────▶│  Client  │  framed request/reply
//! └───────┬───────┘      └────┬─────┘
//!         │                   │
//! ┌───────▼───────┐      ┌────▼─────────────┐
//! │   Registry    │◀─────│ ChannelTransport │  host collaborators
//! └───────────────┘      └──────────────────┘
//! ```
//!
//! Processes, channels, sessions and privileges belong to the embedding
//! system and are reached through the traits in [`host`]. [`sim`] implements
//! all of them in memory.

pub mod client;
pub mod config;
pub mod connect;
pub mod error;
pub mod host;
pub mod kinds;
pub mod launcher;
pub mod loader;
pub mod registry;
pub mod sequencer;
pub mod sim;

// Re-export key types at crate root
pub use client::SubsystemClient;
pub use config::{Directive, LoaderOptions, SequencerOptions, SessionConfig, SmssConfig};
pub use connect::{SubsystemAnnouncement, accept_subsystem};
pub use error::{Error, Result};
pub use host::{
    BootEnvironment, ChannelTransport, HostServices, PrivilegeHost, PrivilegeScope, PrivilegeToken,
    ProcessHost, SessionOracle, SpawnRequest, TransportError,
};
pub use kinds::{KindPolicy, KindTable};
pub use launcher::{CommandLauncher, ParsedCommand};
pub use loader::{LoadOutcome, LoadRequest, SubsystemLoader};
pub use registry::{
    HeldRecord, ReadyEvent, RecordKind, RecordSnapshot, Reservation, SubsystemRecord,
    SubsystemRegistry,
};
pub use sequencer::{SessionSequencer, SessionStartup, StartedSubsystem};
pub use sim::{SimImage, SimulatedHost, SimulationConfig};
