//! Shared wiring for the runtime integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use smss::{
    HostServices, KindTable, LoadRequest, LoaderOptions, SimImage, SimulatedHost, SimulationConfig,
    SubsystemLoader, SubsystemRegistry,
};
use smss_protocol::{LoadFlags, SessionId, SubsystemKind};

pub struct Harness {
    pub host: SimulatedHost,
    pub loader: Arc<SubsystemLoader>,
}

impl Harness {
    pub fn new(config: SimulationConfig) -> Self {
        Self::with_options(config, LoaderOptions::default())
    }

    pub fn with_options(config: SimulationConfig, options: LoaderOptions) -> Self {
        Self::build(config, options, None)
    }

    /// A harness whose registry holds at most `capacity` records.
    pub fn with_capacity_limit(config: SimulationConfig, capacity: usize) -> Self {
        Self::build(config, LoaderOptions::default(), Some(capacity))
    }

    fn build(config: SimulationConfig, options: LoaderOptions, capacity: Option<usize>) -> Self {
        let host = SimulatedHost::new(config);
        let services = HostServices::from_host(Arc::new(host.clone()));
        let mut registry = SubsystemRegistry::new(Arc::clone(&services.processes));
        if let Some(capacity) = capacity {
            registry = registry.with_capacity_limit(capacity);
        }
        let registry = Arc::new(registry);
        host.attach_registry(&registry);
        let loader = Arc::new(SubsystemLoader::new(
            registry,
            services,
            KindTable::default(),
            options,
        ));
        Self { host, loader }
    }

    pub fn registry(&self) -> &SubsystemRegistry {
        self.loader.registry()
    }

    /// Start the GUI-capable server of `session`.
    pub async fn start_windows(&self, session: u32) {
        self.loader
            .load_subsystem(&request("csrss.exe", session, LoadFlags::SUBSYSTEM))
            .await
            .expect("windows subsystem starts");
    }
}

pub fn request(image: &str, session: u32, flags: LoadFlags) -> LoadRequest {
    LoadRequest {
        image: format!("C:\\Windows\\system32\\{image}"),
        directory: "C:\\Windows\\system32".to_string(),
        command_line: image.to_string(),
        session: SessionId(session),
        flags,
    }
}

/// The GUI-capable primary server: a native image announcing the GUI kind.
pub fn windows_server() -> SimImage {
    SimImage::new("csrss.exe", SubsystemKind::Native).announcing(SubsystemKind::WindowsGui)
}

/// A POSIX personality server, announcing itself after `delay`.
pub fn posix_server(delay: Duration) -> SimImage {
    SimImage::new("psxss.exe", SubsystemKind::Native)
        .announcing(SubsystemKind::Posix)
        .announce_after(delay)
}

pub fn config(images: Vec<SimImage>, sessions: &[u32]) -> SimulationConfig {
    SimulationConfig {
        images,
        sessions: sessions.iter().copied().map(SessionId).collect(),
        ..SimulationConfig::default()
    }
}
