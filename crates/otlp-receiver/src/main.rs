// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use otlp_log_pipeline::{Config, ReceiverServices};

const DEFAULT_LOG_LEVEL: &str = "info";

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = Config::from_env();
    let log_level = config
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());

    let env_filter = format!("h2=off,hyper=off,tonic=off,tower=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading config: {e}");
            return ExitCode::FAILURE;
        }
    };

    let handle = match ReceiverServices::new(config).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start OTLP receiver: {e}");
            return ExitCode::FAILURE;
        }
    };

    wait_for_shutdown_signal().await;

    match handle.shutdown().await {
        Ok(stats) => {
            info!(
                "Final stats: pci_redactions={} body_truncations={}",
                stats.pci_redactions, stats.body_truncations
            );
            info!(
                "Transform duration: mean {:?}, max {}us",
                stats.mean_transform_duration(),
                stats.max_transform_duration_micros
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Error during shutdown: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {e}");
            wait_for_ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        () = wait_for_ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    wait_for_ctrl_c().await;
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received SIGINT"),
        Err(e) => {
            error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    }
}
