use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::Serialize;
use smss::{
    HostServices, RecordSnapshot, SessionSequencer, SessionStartup, SimulatedHost, SmssConfig,
    SubsystemLoader, SubsystemRegistry,
};
use smss_protocol::{ClientId, SessionId, Status};
use tracing::{info, warn};

use crate::cli::Commands;
use crate::error::{CliError, Result};

pub async fn dispatch(command: Commands) -> Result<()> {
    match command {
        Commands::Boot { config, session } => boot(&config, session.map(SessionId)).await,
        Commands::Check { file } => check(&file),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionReport {
    session: SessionId,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    startup: Option<SessionStartup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    initial_process: Option<ClientId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BootReport {
    sessions: Vec<SessionReport>,
    records: Vec<RecordSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    primary: Option<RecordSnapshot>,
}

fn load_config(path: &Path) -> Result<SmssConfig> {
    SmssConfig::load(path).map_err(|source| CliError::Config {
        path: path.to_path_buf(),
        source,
    })
}

async fn boot(path: &Path, extra_session: Option<SessionId>) -> Result<()> {
    let config = load_config(path)?;
    let simulation = config.simulation.clone().unwrap_or_else(|| {
        warn!(target = "smss", "configuration has no simulation section; every image is missing");
        Default::default()
    });

    let host = SimulatedHost::new(simulation);
    if let Some(session) = extra_session {
        host.add_session(session);
    }
    let services = HostServices::from_host(Arc::new(host.clone()));
    let registry = Arc::new(SubsystemRegistry::new(Arc::clone(&services.processes)));
    host.attach_registry(&registry);

    let loader = Arc::new(SubsystemLoader::new(
        Arc::clone(&registry),
        services,
        config.kinds.clone(),
        config.loader.clone(),
    ));
    let sequencer = SessionSequencer::new(loader, config.session.clone(), config.sequencer.clone());

    let (control, mut failure) = start_session(&sequencer, SessionId::CONTROL).await;
    let mut sessions = vec![control];
    if let Some(session) = extra_session {
        if failure.is_none() {
            let (report, error) = start_session(&sequencer, session).await;
            sessions.push(report);
            failure = error;
        }
    }

    let report = BootReport {
        sessions,
        records: registry.records(),
        primary: registry.primary(),
    };
    let rendered = serde_json::to_string_pretty(&report).context("cannot render boot report")?;
    println!("{rendered}");

    match failure {
        Some((session, source)) => Err(CliError::Session { session, source }),
        None => Ok(()),
    }
}

async fn start_session(
    sequencer: &SessionSequencer,
    session: SessionId,
) -> (SessionReport, Option<(SessionId, smss::Error)>) {
    let started = async {
        let startup = sequencer.run(session).await?;
        let initial = sequencer
            .start_initial_command(session, &startup.initial_command)
            .await?;
        Ok::<_, smss::Error>((startup, initial))
    }
    .await;

    match started {
        Ok((startup, initial)) => {
            info!(target = "smss", session = %session, client_id = %initial, "session ready");
            let report = SessionReport {
                session,
                status: Status::Success,
                startup: Some(startup),
                initial_process: Some(initial),
                error: None,
            };
            (report, None)
        }
        Err(err) => {
            warn!(target = "smss", session = %session, error = %err, "session start failed");
            let report = SessionReport {
                session,
                status: err.status(),
                startup: None,
                initial_process: None,
                error: Some(err.to_string()),
            };
            (report, Some((session, err)))
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport {
    setup_commands: usize,
    subsystems: usize,
    required_subsystems: usize,
    run_commands: usize,
    kind_policies: usize,
    simulated_images: usize,
}

fn check(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let session = &config.session;
    let report = CheckReport {
        setup_commands: session.setup_commands.len(),
        subsystems: session.subsystems.len(),
        required_subsystems: session.required_subsystems.len(),
        run_commands: session.run_commands.len(),
        kind_policies: config.kinds.policies().len(),
        simulated_images: config.simulation.as_ref().map_or(0, |s| s.images.len()),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
