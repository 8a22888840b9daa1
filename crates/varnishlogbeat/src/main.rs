// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod logger;
mod stdout_sink;

use std::future::Future;
use std::process::ExitCode;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;
use varnishlog::config::Config;
use varnishlog::Controller;

use crate::stdout_sink::StdoutSink;

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} | ERROR | {e}", logger::PREFIX);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("{} | ERROR | Failed to set up logging: {e}", logger::PREFIX);
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let shutdown = match shutdown_signal() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            error!("Failed to install signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    let controller = Controller::new(config, StdoutSink::stdout());
    let handle = controller.handle();
    let mut run = tokio::spawn(controller.run());

    let result = tokio::select! {
        result = &mut run => result,
        signal = shutdown => {
            info!("Received {signal}, stopping");
            handle.stop();
            run.await
        }
    };

    match result {
        Ok(Ok(summary)) => {
            debug!("Pipeline summary: {summary:?}");
            ExitCode::SUCCESS
        }
        // Already logged by the controller.
        Ok(Err(e)) => {
            debug!("Pipeline ended with error: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Pipeline task failed: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: &str) -> Result<(), Box<dyn std::error::Error>> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(log_level)?)
        .with_writer(std::io::stderr)
        .event_format(logger::Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

// Registered before the pipeline starts: a signal sent right after the
// running line must not hit the default handler.
#[cfg(unix)]
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    Ok(async move {
        tokio::select! {
            _ = terminate.recv() => "SIGTERM",
            _ = interrupt.recv() => "SIGINT",
        }
    })
}

#[cfg(not(unix))]
fn shutdown_signal() -> std::io::Result<impl Future<Output = &'static str>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL-C: {e}");
        }
        "CTRL-C"
    })
}
