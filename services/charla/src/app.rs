//! Terminal front end for one voice session.

use crate::config::Config;
use anyhow::{Context, Result, bail};
use charla_core::{
    broker::HttpSessionBroker,
    jokes,
    peer::{HttpSdpExchange, PeerController},
    session::{SessionManager, SessionPhase, SessionState},
    tools::ToolDispatcher,
};
use charla_native_audio::CpalMediaEndpoint;
use charla_webrtc::{PCMU_SAMPLE_RATE, WebRtcConfig, WebRtcConnector};
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::watch,
};
use tracing::{info, instrument, warn};

/// Builds a session manager wired to WebRTC and the default audio devices.
pub fn build_manager(config: &Config) -> Result<SessionManager> {
    let client = reqwest::Client::builder()
        .build()
        .context("Failed to build HTTP client")?;

    let broker = HttpSessionBroker::new(client.clone(), config.broker_url.clone())
        .with_default_negotiation_url(config.negotiation_url.clone())
        .with_default_model(config.model.clone());
    let connector = WebRtcConnector::new(WebRtcConfig {
        ice_servers: config.ice_servers.clone(),
    });
    let controller = PeerController::new(
        Arc::new(connector),
        Arc::new(HttpSdpExchange::new(client)),
    );

    Ok(SessionManager::new(
        Arc::new(broker),
        Arc::new(CpalMediaEndpoint::new(PCMU_SAMPLE_RATE)),
        controller,
        jokes::registry(),
    ))
}

/// Prints the OpenAI-style function definitions of `dispatcher`.
pub fn print_tool_definitions(dispatcher: &ToolDispatcher) -> Result<()> {
    let definitions = serde_json::to_string_pretty(&dispatcher.definitions())
        .context("Failed to serialize tool definitions")?;
    println!("{}", definitions);
    Ok(())
}

/// Runs one session until it stops, fails, stdin closes or Ctrl+C is pressed.
#[instrument(name = "talk", skip_all, fields(broker = %config.broker_url))]
pub async fn run_talk(config: &Config) -> Result<()> {
    let mut manager = build_manager(config)?;

    let stop = manager.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C. Stopping session...");
            stop.request_stop();
        }
    });
    let reporter = tokio::spawn(report_status(manager.subscribe()));

    manager.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            event = manager.next_event() => match event {
                Some(event) => manager.apply(event).await,
                None => break,
            },
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if !text.is_empty() {
                        manager.send_text(text).await;
                    }
                }
                Ok(None) => {
                    info!("Stdin closed. Stopping session...");
                    stdin_open = false;
                    manager.stop().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin; text input disabled.");
                    stdin_open = false;
                }
            },
        }
    }

    let final_state = manager.state().clone();
    // Dropping the manager closes the status channel and ends the reporter.
    drop(manager);
    let _ = reporter.await;

    match (final_state.phase, final_state.error) {
        (SessionPhase::Failed, Some(error)) => bail!("Session failed: {}", error),
        _ => {
            info!("Session finished.");
            Ok(())
        }
    }
}

async fn report_status(mut status: watch::Receiver<SessionState>) {
    let mut last = status.borrow_and_update().clone();
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        for line in describe_changes(&last, &current) {
            println!("{}", line);
        }
        last = current;
    }
}

/// Lines to print for the differences between two status snapshots.
pub fn describe_changes(before: &SessionState, after: &SessionState) -> Vec<String> {
    let mut lines = Vec::new();
    if before.phase != after.phase {
        lines.push(match after.phase {
            SessionPhase::Idle => "Inactivo.".to_string(),
            SessionPhase::Connecting => "Conectando...".to_string(),
            SessionPhase::Connected => "Conectado. Habla o escribe un mensaje.".to_string(),
            SessionPhase::Failed => format!(
                "Error: {}",
                after.error.as_deref().unwrap_or("la sesión falló")
            ),
            SessionPhase::Stopped => "Sesión finalizada.".to_string(),
        });
    }
    if after.last_transcript != before.last_transcript && !after.last_transcript.is_empty() {
        lines.push(format!("Tú dijiste: {}", after.last_transcript));
    }
    if after.last_response != before.last_response && !after.last_response.is_empty() {
        lines.push(format!("LLM dice: {}", after.last_response));
    }
    lines
}
