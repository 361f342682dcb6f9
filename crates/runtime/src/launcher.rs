//! Command parsing and plain image execution.
//!
//! Configuration directives carry command lines such as
//! `async %SystemRoot%\system32\csrss.exe ObjectDirectory=\Windows`. They are
//! parsed into an image, a working directory, the full command line and load
//! flags, then either launched here or routed to the subsystem loader.

use std::sync::Arc;

use smss_protocol::{ClientId, LoadFlags, ProcessInformation, SessionId, Status};

use crate::error::{Error, Result};
use crate::host::{ProcessHost, SpawnRequest};

/// A parsed configuration command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub image: String,
    pub directory: String,
    pub command_line: String,
    pub flags: LoadFlags,
}

/// Parses commands and launches plain images through the process primitive.
#[derive(Clone)]
pub struct CommandLauncher {
    processes: Arc<dyn ProcessHost>,
    system_root: String,
}

impl CommandLauncher {
    pub fn new(processes: Arc<dyn ProcessHost>, system_root: impl Into<String>) -> Self {
        Self {
            processes,
            system_root: system_root.into(),
        }
    }

    pub fn system_root(&self) -> &str {
        &self.system_root
    }

    /// Parse a directive value. An image the host cannot find is flagged
    /// [`LoadFlags::INVALID_PATH`] rather than rejected.
    pub fn parse(&self, command: &str) -> Result<ParsedCommand> {
        let mut flags = LoadFlags::empty();
        let mut rest = command.trim();

        loop {
            let (word, tail) = split_first(rest);
            let flag = match word.to_ascii_lowercase().as_str() {
                "debug" => LoadFlags::DEBUG,
                "async" => LoadFlags::ASYNC,
                "autocheck" => LoadFlags::AUTOCHECK,
                _ => break,
            };
            flags |= flag;
            rest = tail;
        }

        let expanded = expand_system_root(rest, &self.system_root);
        let (name, _) = split_first(&expanded);
        if name.is_empty() {
            return Err(Error::Config(format!("command '{command}' names no image")));
        }

        let image = self.resolve_image(name);
        let directory = match image.rfind('\\') {
            Some(0) => "\\".to_string(),
            Some(pos) => image[..pos].to_string(),
            None => self.system_root.clone(),
        };

        if !self.processes.image_exists(&image) {
            flags |= LoadFlags::INVALID_PATH;
        }

        Ok(ParsedCommand {
            image,
            directory,
            command_line: expanded.trim().to_string(),
            flags,
        })
    }

    fn resolve_image(&self, name: &str) -> String {
        let mut image = if name.contains('\\') {
            name.to_string()
        } else {
            format!("{}\\system32\\{}", self.system_root.trim_end_matches('\\'), name)
        };

        let file_name = image.rsplit('\\').next().unwrap_or_default();
        if !file_name.contains('.') {
            image.push_str(".exe");
        }
        image
    }

    /// Launch a parsed command as an ordinary process in `session`.
    pub async fn execute(&self, command: &ParsedCommand, session: SessionId) -> Result<ClientId> {
        if command.flags.contains(LoadFlags::INVALID_PATH) {
            return Err(Error::NotFound(command.image.clone()));
        }

        let info = execute_image(
            self.processes.as_ref(),
            &SpawnRequest {
                image: command.image.clone(),
                directory: command.directory.clone(),
                command_line: command.command_line.clone(),
                session,
                flags: command.flags,
            },
        )
        .await?;
        Ok(info.client_id)
    }
}

/// Create a process and, unless `DEFERRED` is set, run it.
///
/// With `DEFERRED` the process comes back suspended and the caller owns both
/// handles. Otherwise the thread is resumed, the process awaited unless
/// `ASYNC` is set, and both handles are closed here.
pub async fn execute_image(
    processes: &dyn ProcessHost,
    request: &SpawnRequest,
) -> Result<ProcessInformation> {
    let info = processes.create_process(request).await?;
    tracing::debug!(
        target = "smss",
        image = %request.image,
        session = %request.session,
        client_id = %info.client_id,
        kind = %info.kind,
        "process created"
    );

    if request.flags.contains(LoadFlags::DEFERRED) {
        return Ok(info);
    }

    if let Err(err) = processes.resume_thread(info.thread) {
        processes.terminate_process(info.process, Status::ResumeFailed);
        processes.close_handle(info.thread);
        processes.close_handle(info.process);
        return Err(Error::ResumeFailed(err.to_string()));
    }

    let waited = if request.flags.contains(LoadFlags::ASYNC) {
        Ok(())
    } else {
        processes.wait_for_exit(info.process).await.map(|status| {
            tracing::debug!(target = "smss", image = %request.image, %status, "process exited");
        })
    };

    processes.close_handle(info.thread);
    processes.close_handle(info.process);
    waited.map(|()| info)
}

fn split_first(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    match input.find(char::is_whitespace) {
        Some(pos) => (&input[..pos], input[pos..].trim_start()),
        None => (input, ""),
    }
}

fn expand_system_root(input: &str, system_root: &str) -> String {
    const VARIABLE: &str = "%systemroot%";
    let root = system_root.trim_end_matches('\\');
    let lower = input.to_ascii_lowercase();

    let mut out = String::with_capacity(input.len());
    let mut cursor = 0;
    while let Some(found) = lower[cursor..].find(VARIABLE) {
        let start = cursor + found;
        out.push_str(&input[cursor..start]);
        out.push_str(root);
        cursor = start + VARIABLE.len();
    }
    out.push_str(&input[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimImage, SimulatedHost, SimulationConfig};
    use smss_protocol::SubsystemKind;

    fn launcher(images: &[&str]) -> (Arc<SimulatedHost>, CommandLauncher) {
        let config = SimulationConfig {
            images: images
                .iter()
                .map(|name| SimImage::new(*name, SubsystemKind::WindowsCui))
                .collect(),
            ..SimulationConfig::default()
        };
        let host = Arc::new(SimulatedHost::new(config));
        let launcher = CommandLauncher::new(host.clone(), "C:\\Windows");
        (host, launcher)
    }

    #[test]
    fn keywords_become_flags_and_system_root_expands() {
        let (_host, launcher) = launcher(&["C:\\Windows\\system32\\csrss.exe"]);
        let parsed = launcher
            .parse("debug ASYNC %SystemRoot%\\system32\\csrss.exe ObjectDirectory=\\Windows")
            .unwrap();

        assert_eq!(parsed.image, "C:\\Windows\\system32\\csrss.exe");
        assert_eq!(parsed.directory, "C:\\Windows\\system32");
        assert_eq!(
            parsed.command_line,
            "C:\\Windows\\system32\\csrss.exe ObjectDirectory=\\Windows"
        );
        assert_eq!(parsed.flags, LoadFlags::DEBUG | LoadFlags::ASYNC);
    }

    #[test]
    fn bare_names_resolve_under_system32_with_default_extension() {
        let (_host, launcher) = launcher(&["C:\\Windows\\system32\\autochk.exe"]);
        let parsed = launcher.parse("autocheck autochk *").unwrap();
        assert_eq!(parsed.image, "C:\\Windows\\system32\\autochk.exe");
        assert_eq!(parsed.command_line, "autochk *");
        assert_eq!(parsed.flags, LoadFlags::AUTOCHECK);
    }

    #[test]
    fn missing_image_is_flagged_not_rejected() {
        let (_host, launcher) = launcher(&[]);
        let parsed = launcher.parse("nothere.exe -x").unwrap();
        assert!(parsed.flags.contains(LoadFlags::INVALID_PATH));
        assert!(launcher.parse("   ").is_err());
        assert!(launcher.parse("async").is_err());
    }

    #[tokio::test]
    async fn execute_runs_waits_and_closes_handles() {
        let (host, launcher) = launcher(&["C:\\Windows\\system32\\setup.exe"]);
        let parsed = launcher.parse("setup.exe /q").unwrap();
        let client_id = launcher.execute(&parsed, SessionId(0)).await.unwrap();

        let process = host.process(client_id).expect("process recorded");
        assert!(process.resumed);
        assert!(process.waited);
        assert_eq!(host.closed_handles().len(), 2);
    }

    #[tokio::test]
    async fn execute_refuses_unresolved_images() {
        let (host, launcher) = launcher(&[]);
        let parsed = launcher.parse("ghost.exe").unwrap();
        let err = launcher.execute(&parsed, SessionId(0)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(host.created_count(), 0);
    }
}
