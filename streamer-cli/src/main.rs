mod cli;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use streamer::config::{
    BitrateConfig, load_bitrate_config, load_input_config, load_pipeline_config, validate_all,
};
use streamer::logging::init_logging;
use streamer::probe::Prober;
use streamer::{Controller, ControllerOptions, Error, NodeStatus, Toolchain};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cli::Args;

/// How a run ended without a front-end error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Interrupted,
    Failed,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _guard = match init_logging(&args.logging()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: failed to initialize logging: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&args).await {
        Ok(Outcome::Finished) => {
            info!("Pipeline finished");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Interrupted) => {
            info!("Pipeline interrupted");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Failed) => ExitCode::FAILURE,
        Err(e) => {
            report_error(&e, args.json_errors);
            ExitCode::FAILURE
        }
    }
}

fn report_error(e: &anyhow::Error, json: bool) {
    if !json {
        error!("{e:#}");
        eprintln!("Error: {e:#}");
        return;
    }

    let lib_error = e.downcast_ref::<Error>();
    let field = match lib_error {
        Some(Error::Config(config)) => Some(config.field().to_string()),
        _ => None,
    };
    let error_json = serde_json::json!({
        "status": "error",
        "kind": lib_error.map(Error::kind),
        "config_kind": lib_error.and_then(Error::config_kind),
        "component": lib_error.and_then(Error::component),
        "field": field,
        "message": format!("{e:#}"),
    });
    println!("{error_json}");
}

/// Cancels `token` on Ctrl-C, or SIGTERM on unix.
fn watch_signals(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(e) => {
                    warn!(error = %e, "Cannot listen for SIGTERM");
                    if tokio::signal::ctrl_c().await.is_ok() {
                        token.cancel();
                    }
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }

        info!("Interrupt received, stopping");
        token.cancel();
    });
}

async fn run(args: &Args) -> anyhow::Result<Outcome> {
    let mut input = load_input_config(&args.input_config).await?;
    let pipeline = load_pipeline_config(&args.pipeline_config).await?;
    let bitrates = match &args.bitrate_config {
        Some(path) => load_bitrate_config(path).await?,
        None => BitrateConfig::default(),
    };
    validate_all(&input, &pipeline, &bitrates).map_err(Error::from)?;

    let toolchain = Toolchain::from_env();
    if !args.no_autodetect {
        Prober::new(&toolchain.ffprobe)
            .resolve_all(&mut input, &bitrates)
            .await?;
    }

    let mut controller = Controller::new(ControllerOptions {
        toolchain,
        stop_timeout: args.stop_timeout(),
        log_dir: args.log_dir.clone().unwrap_or_else(|| PathBuf::from(".")),
        check_dependencies: !args.skip_deps_check,
        ..Default::default()
    });
    let interrupt = controller.interrupt_token();
    watch_signals(interrupt.clone());

    match controller
        .start(&input, &pipeline, &bitrates, &args.output)
        .await
    {
        Ok(()) => {}
        // start() already rolled back whatever it had launched.
        Err(Error::Interrupted) => return Ok(Outcome::Interrupted),
        Err(e) => {
            controller.stop().await;
            return Err(e).context("Failed to start pipeline");
        }
    }
    for node in controller.nodes() {
        debug!(node = %node.label, kind = %node.kind, state = ?node.state, "Node");
    }
    info!(output = %args.output, "Pipeline started, polling every {:?}", args.poll_interval());

    let mut ticker = tokio::time::interval(args.poll_interval());
    let outcome = loop {
        tokio::select! {
            _ = interrupt.cancelled() => break Outcome::Interrupted,
            _ = ticker.tick() => match controller.check_status() {
                NodeStatus::Running => {}
                NodeStatus::Finished => break Outcome::Finished,
                NodeStatus::Errored => {
                    error!("Pipeline failed");
                    break Outcome::Failed;
                }
            },
        }
    };

    controller.stop().await;
    Ok(outcome)
}
