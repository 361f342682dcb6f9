//! Per-session startup sequence.
//!
//! Replays the configured directives for a new session in a fixed order:
//! boot paths, setup commands, subsystems (including the kernel display
//! step), required subsystems, the initial command and finally the remaining
//! run commands. Subsystem failures abort the sequence; command failures are
//! logged and skipped.

use std::sync::Arc;

use serde::Serialize;
use smss_protocol::{ClientId, LoadFlags, SessionId};

use crate::config::{Directive, SequencerOptions, SessionConfig};
use crate::error::{Error, Result};
use crate::host::{LOAD_DRIVER_PRIVILEGE, PrivilegeScope};
use crate::launcher::{CommandLauncher, ParsedCommand};
use crate::loader::{LoadRequest, SubsystemLoader};

/// A subsystem directive that was satisfied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedSubsystem {
    pub directive: String,
    pub image: String,
    pub client_id: Option<ClientId>,
    pub reused: bool,
}

/// Result of [`SessionSequencer::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartup {
    pub session: SessionId,
    pub kernel_display: bool,
    pub subsystems: Vec<StartedSubsystem>,
    /// Command line of the session's initial command.
    pub initial_command: String,
    /// Names of fire-and-forget directives that failed.
    pub failed_commands: Vec<String>,
}

/// Runs the startup directives of new sessions.
pub struct SessionSequencer {
    loader: Arc<SubsystemLoader>,
    launcher: CommandLauncher,
    session: SessionConfig,
    options: SequencerOptions,
}

impl SessionSequencer {
    pub fn new(
        loader: Arc<SubsystemLoader>,
        session: SessionConfig,
        options: SequencerOptions,
    ) -> Self {
        let launcher = CommandLauncher::new(
            Arc::clone(&loader.host().processes),
            options.system_root.clone(),
        );
        Self {
            loader,
            launcher,
            session,
            options,
        }
    }

    pub fn loader(&self) -> &Arc<SubsystemLoader> {
        &self.loader
    }

    pub fn launcher(&self) -> &CommandLauncher {
        &self.launcher
    }

    /// Bring up `session`. Returns the initial command to start.
    pub async fn run(&self, session: SessionId) -> Result<SessionStartup> {
        tracing::info!(target = "smss", session = %session, "starting session");
        let mut startup = SessionStartup {
            session,
            kernel_display: false,
            subsystems: Vec::new(),
            initial_command: String::new(),
            failed_commands: Vec::new(),
        };

        if let Err(err) = self.loader.host().boot.publish_boot_paths() {
            tracing::warn!(target = "smss", error = %err, "boot paths not published");
        }

        for directive in &self.session.setup_commands {
            self.run_command(directive, session, &mut startup).await;
        }

        for directive in &self.session.subsystems {
            if directive.is(&self.options.kernel_display_directive) {
                self.install_kernel_display(directive, session)?;
                startup.kernel_display = true;
            } else {
                let started = self.load(directive, session, LoadFlags::SUBSYSTEM).await?;
                startup.subsystems.push(started);
            }
        }

        for directive in &self.session.required_subsystems {
            let mut flags = LoadFlags::SUBSYSTEM;
            if directive.is(&self.options.debug_directive) {
                flags |= LoadFlags::DEBUG;
            }
            let started = self.load(directive, session, flags).await?;
            startup.subsystems.push(started);
        }

        startup.initial_command = self.initial_command().await;

        for directive in &self.session.run_commands {
            if directive.is(&self.options.initial_command_directive) {
                continue;
            }
            self.run_command(directive, session, &mut startup).await;
        }

        tracing::info!(
            target = "smss",
            session = %session,
            subsystems = startup.subsystems.len(),
            failed_commands = startup.failed_commands.len(),
            initial_command = %startup.initial_command,
            "session started"
        );
        Ok(startup)
    }

    /// Launch the initial command without waiting for it.
    pub async fn start_initial_command(
        &self,
        session: SessionId,
        command: &str,
    ) -> Result<ClientId> {
        let mut parsed = self.launcher.parse(command)?;
        parsed.flags |= LoadFlags::ASYNC;
        let client_id = self.launcher.execute(&parsed, session).await?;
        tracing::info!(
            target = "smss",
            session = %session,
            image = %parsed.image,
            client_id = %client_id,
            "initial command started"
        );
        Ok(client_id)
    }

    async fn load(
        &self,
        directive: &Directive,
        session: SessionId,
        flags: LoadFlags,
    ) -> Result<StartedSubsystem> {
        let parsed = self.launcher.parse(&directive.value)?;
        let mut flags = flags;
        if let Some(kind_flag) = self.loader.kinds().flag_named(&directive.name) {
            flags |= kind_flag;
        }

        let outcome = self
            .loader
            .load_subsystem(&load_request(parsed.clone(), session, flags))
            .await?;
        Ok(StartedSubsystem {
            directive: directive.name.clone(),
            image: parsed.image,
            client_id: outcome.client_id,
            reused: outcome.reused,
        })
    }

    fn install_kernel_display(&self, directive: &Directive, session: SessionId) -> Result<()> {
        let host = self.loader.host();
        let privileges = host.privileges.as_ref();
        let _privilege = PrivilegeScope::acquire(privileges, LOAD_DRIVER_PRIVILEGE)?;

        if !host.sessions.session_exists(session) {
            return Err(Error::SessionDeleted(session));
        }
        privileges.attach_session_space(session)?;
        self.loader.note_session_attached(session);

        let image = match directive.value.trim() {
            "" => self.options.kernel_display_image.as_str(),
            image => image,
        };
        privileges.install_kernel_display(image)?;
        tracing::info!(target = "smss", session = %session, image, "kernel display installed");
        Ok(())
    }

    async fn initial_command(&self) -> String {
        let explicit = self
            .session
            .run_commands
            .iter()
            .find(|directive| directive.is(&self.options.initial_command_directive));

        if let Some(directive) = explicit {
            let grace = self.options.initial_command_grace();
            if !grace.is_zero() {
                tokio::time::sleep(grace).await;
            }
            return directive.value.clone();
        }

        let default = self.options.default_initial_command.clone();
        match self.loader.host().boot.debugger_command() {
            Some(debugger) => format!("{} {default}", debugger.trim_end()),
            None => default,
        }
    }

    async fn run_command(
        &self,
        directive: &Directive,
        session: SessionId,
        startup: &mut SessionStartup,
    ) {
        let result = match self.launcher.parse(&directive.value) {
            Ok(parsed) => self.launcher.execute(&parsed, session).await.map(|_| ()),
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            tracing::warn!(
                target = "smss",
                session = %session,
                directive = %directive.name,
                status = %err.status(),
                error = %err,
                "command failed"
            );
            startup.failed_commands.push(directive.name.clone());
        }
    }
}

fn load_request(parsed: ParsedCommand, session: SessionId, flags: LoadFlags) -> LoadRequest {
    LoadRequest {
        image: parsed.image,
        directory: parsed.directory,
        command_line: parsed.command_line,
        session,
        flags: parsed.flags | flags,
    }
}
