//! # M2M Agent - Main Entry Point
//!
//! Boots logging, loads the on-disk configuration, and runs the manager
//! (supervisor + terminals + port forwards) until a shutdown signal arrives.
//!
//! ## Architecture Overview
//!
//! 1. Parse arguments.
//! 2. Initialize logging: a terse colorized summary on stdout, an optional
//!    detailed secondary log (file or stderr).
//! 3. Load `AgentConfig` from disk (a missing file is not an error).
//! 4. Build the `Manager` and start its supervisor task.
//! 5. Wait for Ctrl-C or SIGTERM, then close the manager and exit.

use anyhow::Result;
use clap::Parser;
use m2m_agent::{AgentConfig, Args, ColorizedFormatter, Manager};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::from(1)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let args = Args::parse();

    // Configure logging level based on verbosity flags.
    // - default: INFO
    // -v: DEBUG
    // -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Configure the detailed log layer (file or stderr). The guard must be
    // kept alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if args.log_file == "stderr" {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let log_path = std::path::Path::new(&args.log_file);
        let log_dir = log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let log_filename = log_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new(m2m_agent::defaults::LOG_FILE_NAME));
        let file_appender = tracing_appender::rolling::daily(log_dir, log_filename);
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Terse colorized summary to stdout.
    let stdout_log = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .event_format(ColorizedFormatter)
        .with_filter(log_level);

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    // Keep the logging guard alive for the duration of the program. If we
    // don't assign it to a variable, it gets dropped immediately, and file
    // logging stops working.
    let _log_guard = guard;

    info!("starting m2m agent");

    let mut config = AgentConfig::load(&args.config)?;
    if let Some(url) = args.url {
        config.m2m.url = url;
    }

    if !config.m2m.enabled {
        info!("m2m is disabled in configuration, exiting");
        return Ok(ExitCode::SUCCESS);
    }

    let rpc = Arc::new(m2m_agent::rpc::LoggingRpcClient);
    let input_router = Arc::new(m2m_agent::rpc::LoggingInputDeviceRouter);
    let manager = Manager::new(&config, rpc, input_router);

    let supervisor_handle = manager.run();

    let shutdown = shutdown_signal();
    let exit_code;
    tokio::select! {
        _ = shutdown => {
            info!("shutdown signal received");
            exit_code = ExitCode::SUCCESS;
        }
        result = supervisor_handle => {
            match result {
                Ok(()) => exit_code = ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "supervisor task panicked");
                    exit_code = ExitCode::from(2);
                }
            }
        }
    }

    manager.close().await;
    info!("m2m agent stopped");
    Ok(exit_code)
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
