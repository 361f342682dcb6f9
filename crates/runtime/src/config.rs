//! Boot configuration.
//!
//! The whole configuration is one JSON document. Every section and field is
//! optional; missing parts take the defaults below.
//!
//! ```json
//! {
//!   "loader": { "readyTimeoutMs": 60000 },
//!   "sequencer": { "systemRoot": "C:\\Windows" },
//!   "session": {
//!     "subsystems": [{ "name": "Windows", "value": "csrss.exe" }],
//!     "runCommands": [{ "name": "initialcommand", "value": "winlogon.exe" }]
//!   }
//! }
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use smss_protocol::ClientId;

use crate::error::{Error, Result};
use crate::kinds::KindTable;
use crate::sim::SimulationConfig;

const DEFAULT_READY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_GRACE_MS: u64 = 200;

/// Options of the subsystem loader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoaderOptions {
    /// Bound on the wait for a new server to connect, outside session 0.
    pub ready_timeout_ms: u64,
    /// Debugger UI passed along with debug-flagged loads.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_ui_client_id: Option<ClientId>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            debug_ui_client_id: None,
        }
    }
}

impl LoaderOptions {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }
}

/// Options of the session sequencer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SequencerOptions {
    pub system_root: String,
    pub default_initial_command: String,
    /// Pause after picking an explicitly configured initial command.
    pub initial_command_grace_ms: u64,
    /// Subsystem directive that installs the kernel display component.
    pub kernel_display_directive: String,
    pub kernel_display_image: String,
    /// Required-subsystem directive that loads with debugging.
    pub debug_directive: String,
    /// Run directive naming the initial command.
    pub initial_command_directive: String,
}

impl Default for SequencerOptions {
    fn default() -> Self {
        Self {
            system_root: "C:\\Windows".to_string(),
            default_initial_command: "winlogon.exe".to_string(),
            initial_command_grace_ms: DEFAULT_GRACE_MS,
            kernel_display_directive: "Kmode".to_string(),
            kernel_display_image: "\\SystemRoot\\System32\\win32k.sys".to_string(),
            debug_directive: "debug".to_string(),
            initial_command_directive: "initialcommand".to_string(),
        }
    }
}

impl SequencerOptions {
    pub fn initial_command_grace(&self) -> Duration {
        Duration::from_millis(self.initial_command_grace_ms)
    }
}

/// One `(name, value)` configuration directive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Directive {
    pub name: String,
    pub value: String,
}

impl Directive {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Ordered directive lists replayed for every new session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    pub setup_commands: Vec<Directive>,
    pub subsystems: Vec<Directive>,
    pub required_subsystems: Vec<Directive>,
    pub run_commands: Vec<Directive>,
}

/// The complete configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SmssConfig {
    pub loader: LoaderOptions,
    pub sequencer: SequencerOptions,
    pub session: SessionConfig,
    pub kinds: KindTable,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulation: Option<SimulationConfig>,
}

impl SmssConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content).map_err(|err| match err {
            Error::Json(e) => Error::Config(format!("{}: {e}", path.display())),
            other => other,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.sequencer.system_root.trim().is_empty() {
            return Err(Error::Config("sequencer.systemRoot must not be empty".to_string()));
        }
        if self.sequencer.default_initial_command.trim().is_empty() {
            return Err(Error::Config(
                "sequencer.defaultInitialCommand must not be empty".to_string(),
            ));
        }
        let session = &self.session;
        for directive in session
            .setup_commands
            .iter()
            .chain(&session.subsystems)
            .chain(&session.required_subsystems)
            .chain(&session.run_commands)
        {
            if directive.name.trim().is_empty() {
                return Err(Error::Config(format!(
                    "directive with value '{}' has no name",
                    directive.value
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smss_protocol::{LoadFlags, SubsystemKind};
    use std::io::Write;

    #[test]
    fn empty_document_takes_defaults() {
        let config = SmssConfig::from_json("{}").unwrap();
        assert_eq!(config.loader.ready_timeout(), Duration::from_secs(60));
        assert_eq!(config.sequencer.initial_command_grace(), Duration::from_millis(200));
        assert_eq!(config.sequencer.default_initial_command, "winlogon.exe");
        assert_eq!(config.kinds, KindTable::default());
        assert!(config.simulation.is_none());
    }

    #[test]
    fn load_reads_camel_case_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "loader": {{
                    "readyTimeoutMs": 5000,
                    "debugUiClientId": {{"process": 9, "thread": 10}}
                }},
                "sequencer": {{"initialCommandGraceMs": 0}},
                "session": {{
                    "subsystems": [{{"name": "Kmode", "value": "win32k.sys"}}],
                    "requiredSubsystems": [{{"name": "debug", "value": "csrss.exe"}}]
                }},
                "kinds": [{{"kind": "posix", "flag": "posix", "singleInstance": true}}],
                "simulation": {{"images": [{{"path": "csrss.exe", "kind": "native"}}]}}
            }}"#
        )
        .unwrap();

        let config = SmssConfig::load(file.path()).unwrap();
        assert_eq!(config.loader.ready_timeout_ms, 5000);
        assert_eq!(config.loader.debug_ui_client_id, Some(ClientId::new(9, 10)));
        assert_eq!(config.sequencer.initial_command_grace_ms, 0);
        assert_eq!(config.sequencer.kernel_display_directive, "Kmode");
        assert!(config.session.subsystems[0].is("kmode"));
        assert!(config.session.required_subsystems[0].is("DEBUG"));
        assert_eq!(config.kinds.broker_for(LoadFlags::POSIX), None);
        let simulation = config.simulation.unwrap();
        assert_eq!(simulation.images[0].kind, SubsystemKind::Native);
    }

    #[test]
    fn malformed_file_is_a_config_error_naming_the_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"loader\": 3}}").unwrap();
        let err = SmssConfig::load(file.path()).unwrap_err();
        match err {
            Error::Config(message) => assert!(message.contains(&file.path().display().to_string())),
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[test]
    fn nameless_directive_is_rejected() {
        let json = r#"{"session": {"runCommands": [{"name": " ", "value": "x"}]}}"#;
        let err = SmssConfig::from_json(json).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
