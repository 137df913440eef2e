// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::allowlist::Allowlist;
use crate::allowlist_watcher::{AllowlistWatcher, Fingerprint};
use crate::config::Config;
use crate::error::ServicesError;
use crate::output::{JsonWriter, JsonWriterConfig};
use crate::pipeline::{Pipeline, StatsSnapshot};
use crate::receiver::{self, ListenerMode, ReceiverState};
use crate::routing::Router;
use crate::transform::{TransformConfig, TransformRules};

/// Handle to the running receiver.
///
/// Dropping the handle leaves everything running; call [`ServicesHandle::shutdown`] to
/// stop in order and flush the output.
#[derive(Debug)]
pub struct ServicesHandle {
    grpc_addr: SocketAddr,
    http_addr: SocketAddr,
    pipeline: Arc<Pipeline>,
    listener_cancel: CancellationToken,
    listeners: Vec<JoinHandle<io::Result<()>>>,
    watcher_cancel: CancellationToken,
    watcher: Option<JoinHandle<()>>,
}

impl ServicesHandle {
    /// Bound gRPC address. Equal to [`Self::http_addr`] when multiplexing.
    pub fn grpc_addr(&self) -> SocketAddr {
        self.grpc_addr
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    /// Stops accepting connections and drains open ones, stops the allowlist watcher,
    /// then flushes and closes the output file. Returns the final counters.
    pub async fn shutdown(self) -> Result<StatsSnapshot, ServicesError> {
        info!("Shutting down OTLP receiver");

        self.listener_cancel.cancel();
        for listener in self.listeners {
            match listener.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Listener exited with error: {e}"),
                Err(e) => error!("Listener task failed: {e}"),
            }
        }
        debug!("Listeners stopped");

        self.watcher_cancel.cancel();
        if let Some(watcher) = self.watcher {
            if let Err(e) = watcher.await {
                error!("Allowlist watcher task failed: {e}");
            }
        }

        if let Some(writer) = self.pipeline.writer() {
            writer.close().await?;
        }

        let stats = self.pipeline.stats().snapshot();
        info!(
            "OTLP receiver stopped: received={} transformed={} dropped={}",
            stats.received,
            stats.transformed,
            stats.dropped_sampled + stats.dropped_filtered
        );
        debug!(
            "Dropped by sampling: {}, by allowlist: {}",
            stats.dropped_sampled, stats.dropped_filtered
        );
        info!(
            "Logs by severity: {:?}, logs by index: {:?}",
            stats.logs_by_severity, stats.logs_by_index
        );
        Ok(stats)
    }
}

/// Wires configuration into a running receiver.
#[derive(Debug)]
pub struct ReceiverServices {
    config: Config,
    reload_tx: Option<mpsc::UnboundedSender<usize>>,
}

impl ReceiverServices {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            reload_tx: None,
        }
    }

    /// Receives the entry count after every successful allowlist reload.
    pub fn with_allowlist_reload_notifier(
        mut self,
        reload_tx: mpsc::UnboundedSender<usize>,
    ) -> Self {
        self.reload_tx = Some(reload_tx);
        self
    }

    /// Loads every rule source, binds the listeners and starts serving. Any failure
    /// here is fatal and nothing is left running.
    pub async fn start(self) -> Result<ServicesHandle, ServicesError> {
        let config = self.config;
        config.validate()?;

        let transform = match &config.transform_config_file {
            Some(path) => {
                info!("Loading transform config from {}", path.display());
                TransformConfig::from_file(path)?
            }
            None => TransformConfig::new(TransformRules::default())?,
        };
        let router = match &config.routing_rules_file {
            Some(path) => {
                info!("Loading routing rules from {}", path.display());
                Router::from_file(path)?
            }
            None => Router::with_defaults()?,
        };
        let mut allowlist_baseline = None;
        let allowlist = match &config.allowlist_path {
            Some(path) => {
                allowlist_baseline = Fingerprint::of(path);
                let allowlist = Allowlist::load_from_file(path)?;
                info!(
                    "Loaded allowlist {} ({} apps)",
                    path.display(),
                    allowlist.len()
                );
                Arc::new(allowlist)
            }
            None => {
                info!("No allowlist configured, accepting all applications");
                Arc::new(Allowlist::default())
            }
        };

        let grpc_listener = if config.multiplex {
            None
        } else {
            Some(bind(&config, config.grpc_port).await?)
        };
        let (http_listener, http_bound) = bind(&config, config.http_port).await?;

        let mut pipeline = Pipeline::new(transform, router)
            .with_sampling(config.sampling)
            .with_allowlist(Arc::clone(&allowlist));
        if let Some(path) = &config.output_file {
            let writer = JsonWriter::open(JsonWriterConfig {
                path: path.clone(),
                buffer_size: config.output_buffer_size,
                flush_interval: config.output_flush_interval,
                max_file_size: config.output_max_file_size,
            })?;
            info!("Writing processed logs to {}", path.display());
            pipeline = pipeline.with_writer(Arc::new(writer));
        }
        let pipeline = Arc::new(pipeline);

        let watcher_cancel = CancellationToken::new();
        let watcher = config.allowlist_path.as_ref().map(|path| {
            let mut watcher = AllowlistWatcher::new(
                allowlist,
                path.clone(),
                config.allowlist_poll_interval,
                watcher_cancel.clone(),
            )
            .with_baseline(allowlist_baseline);
            if let Some(reload_tx) = self.reload_tx {
                watcher = watcher.with_reload_notifier(reload_tx);
            }
            tokio::spawn(watcher.run())
        });

        let state = Arc::new(ReceiverState::new(
            Arc::clone(&pipeline),
            config.max_request_content_length,
        ));
        let listener_cancel = CancellationToken::new();
        let mut listeners = Vec::new();
        let mut grpc_addr = http_bound;

        if let Some((listener, addr)) = grpc_listener {
            info!("OTLP gRPC receiver listening on {addr}");
            grpc_addr = addr;
            listeners.push(spawn_listener(
                listener,
                ListenerMode::Grpc,
                &state,
                &listener_cancel,
                &config,
            ));
        }
        let mode = if config.multiplex {
            info!("OTLP gRPC and HTTP receivers multiplexed on {http_bound}");
            ListenerMode::Multiplexed
        } else {
            info!("OTLP HTTP receiver listening on {http_bound}");
            ListenerMode::Http
        };
        listeners.push(spawn_listener(
            http_listener,
            mode,
            &state,
            &listener_cancel,
            &config,
        ));

        if config.sampling.rate > 1 {
            info!(
                "Sampling 1 in {} records (debug only: {})",
                config.sampling.rate, config.sampling.debug_only
            );
        }

        Ok(ServicesHandle {
            grpc_addr,
            http_addr: http_bound,
            pipeline,
            listener_cancel,
            listeners,
            watcher_cancel,
            watcher,
        })
    }
}

async fn bind(config: &Config, port: u16) -> Result<(TcpListener, SocketAddr), ServicesError> {
    let addr = SocketAddr::new(config.host, port);
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| ServicesError::Bind { addr, source })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| ServicesError::Bind { addr, source })?;
    Ok((listener, local_addr))
}

fn spawn_listener(
    listener: TcpListener,
    mode: ListenerMode,
    state: &Arc<ReceiverState>,
    cancel: &CancellationToken,
    config: &Config,
) -> JoinHandle<io::Result<()>> {
    tokio::spawn(receiver::serve_tcp(
        listener,
        mode,
        Arc::clone(state),
        cancel.clone(),
        config.shutdown_timeout,
    ))
}
