pub mod config;
pub mod error;
pub mod protocol;
pub mod scripting;

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use config::{Cli, HostConfig};
use error::{ScriptError, ScriptResult};
use protocol::{ChannelOutbound, EndpointRegistry, InboundFrame, OutboundMessage};
use scripting::{spawn_worker, HostHandle, LogPresenter};

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match HostConfig::from_cli(&cli) {
        Ok(config) => config,
        Err(e) => {
            log::error!("[startup] {e}");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("[startup] failed to build Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(serve(config));
    // The stdin reader may still be parked in a blocking read.
    runtime.shutdown_background();
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

// ── Host wiring ──────────────────────────────────────────────────────────────
//
// The script host runs on its own OS thread. Everything here is a stand-in
// for the real protocol and tray collaborators: outbound messages are logged,
// inbound ones arrive as JSON lines on stdin.

async fn serve(config: HostConfig) -> ScriptResult<()> {
    let endpoints = EndpointRegistry::default();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let outbound = Arc::new(ChannelOutbound::new(endpoints.clone(), out_tx));
    let refresh_interval = config.refresh_interval;

    let (handle, join) = spawn_worker(config, outbound, Arc::new(LogPresenter))?;

    let transport = tokio::spawn(log_outbound(out_rx));
    let reader = tokio::spawn(read_stdin(handle.clone(), endpoints));
    let refresher = {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            // The first tick completes immediately; startup already built the menu.
            interval.tick().await;
            loop {
                interval.tick().await;
                if !handle.update_menu("refresh") {
                    break;
                }
            }
        })
    };

    let mut worker = tokio::task::spawn_blocking(move || join.join());
    let joined = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt received; shutting down");
            handle.shutdown_async().await;
            (&mut worker).await
        }
        joined = &mut worker => {
            log::warn!("script host exited on its own");
            joined
        }
    };

    reader.abort();
    refresher.abort();
    transport.abort();

    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => Err(ScriptError::HostFatal("script host panicked".into())),
        Err(e) => Err(ScriptError::host_fatal(e)),
    }
}

async fn log_outbound(mut rx: mpsc::UnboundedReceiver<OutboundMessage>) {
    while let Some(message) = rx.recv().await {
        log::info!(target: "osc", "-> {message}");
    }
}

async fn read_stdin(handle: HostHandle, endpoints: EndpointRegistry) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => dispatch_frame(&handle, &endpoints, &line),
            Ok(None) => {
                log::debug!("stdin closed; no more inbound messages");
                break;
            }
            Err(e) => {
                log::warn!("stdin read failed: {e}");
                break;
            }
        }
    }
}

fn dispatch_frame(handle: &HostHandle, endpoints: &EndpointRegistry, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<InboundFrame>(line) {
        Ok(InboundFrame::Message { address, values }) => {
            handle.deliver(InboundFrame::into_message(address, values));
        }
        Ok(InboundFrame::Endpoints { endpoints: defs }) => {
            log::info!("{} endpoint definition(s) received", defs.len());
            endpoints.extend(defs);
            handle.endpoints_discovered();
        }
        Ok(InboundFrame::Click { click }) => {
            handle.menu_clicked(click);
        }
        Err(e) => log::warn!("ignoring input line: {e}"),
    }
}
