// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! OTLP front-ends. Each listener runs its own accept loop; connections are served on
//! spawned tasks and drained when the listener is cancelled.

pub mod grpc;
pub mod http;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use opentelemetry_proto::tonic::collector::logs::v1::{
    logs_service_server::LogsServiceServer, ExportLogsServiceRequest,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::pipeline::Pipeline;
use crate::record::{LogRecord, Resource, Scope};
use grpc::LogsReceiver;

/// Every HTTP/2 connection, and so every gRPC call, starts with this preface.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const SNIFF_TIMEOUT: Duration = Duration::from_secs(5);
const SNIFF_RETRY_INTERVAL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Grpc,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    Grpc,
    Http,
    /// One socket, protocol chosen per connection from its first bytes.
    Multiplexed,
}

/// Classifies a connection from the bytes read so far. `None` means the bytes are a
/// strict prefix of the HTTP/2 preface and more are needed.
pub fn classify_preface(bytes: &[u8]) -> Option<Protocol> {
    if bytes.len() >= HTTP2_PREFACE.len() {
        if bytes.starts_with(HTTP2_PREFACE) {
            Some(Protocol::Grpc)
        } else {
            Some(Protocol::Http)
        }
    } else if HTTP2_PREFACE.starts_with(bytes) {
        None
    } else {
        Some(Protocol::Http)
    }
}

/// Peeks at the start of `stream` without consuming anything.
pub async fn sniff_protocol(stream: &TcpStream) -> io::Result<Protocol> {
    let mut buf = [0u8; HTTP2_PREFACE.len()];
    let sniff = async {
        loop {
            let read = stream.peek(&mut buf).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before sending a request",
                ));
            }
            if let Some(protocol) = classify_preface(&buf[..read]) {
                return Ok(protocol);
            }
            sleep(SNIFF_RETRY_INTERVAL).await;
        }
    };
    timeout(SNIFF_TIMEOUT, sniff).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            "timed out waiting for the first request bytes",
        )
    })?
}

/// Feeds every record of an export request through the pipeline, returning how many
/// records the request carried.
pub fn ingest(pipeline: &Pipeline, request: ExportLogsServiceRequest) -> usize {
    let mut count = 0;
    for resource_logs in request.resource_logs {
        let resource = resource_logs.resource.map(Resource::from).unwrap_or_default();
        for scope_logs in resource_logs.scope_logs {
            let scope = scope_logs.scope.map(Scope::from).unwrap_or_default();
            for record in scope_logs.log_records {
                pipeline.stats().record_received();
                pipeline.process(&resource, &scope, LogRecord::from(record));
                count += 1;
            }
        }
    }
    count
}

/// State shared by every connection of every listener.
#[derive(Clone)]
pub struct ReceiverState {
    pipeline: Arc<Pipeline>,
    grpc: LogsServiceServer<LogsReceiver>,
    max_content_length: usize,
}

impl ReceiverState {
    pub fn new(pipeline: Arc<Pipeline>, max_content_length: usize) -> Self {
        Self {
            grpc: grpc::logs_service(Arc::clone(&pipeline), max_content_length),
            pipeline,
            max_content_length,
        }
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }
}

/// Accepts connections until `cancel` fires, then stops accepting and gives open
/// connections up to `drain_timeout` to finish their in-flight requests.
pub async fn serve_tcp(
    listener: TcpListener,
    mode: ListenerMode,
    state: Arc<ReceiverState>,
    cancel: CancellationToken,
    drain_timeout: Duration,
) -> io::Result<()> {
    let mut joinset = JoinSet::new();

    loop {
        let conn = tokio::select! {
            () = cancel.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    return Err(e);
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        joinset.spawn(serve_connection(
            conn,
            mode,
            Arc::clone(&state),
            cancel.clone(),
        ));
    }

    drop(listener);
    drain_connections(joinset, drain_timeout).await;
    Ok(())
}

async fn drain_connections(mut joinset: JoinSet<()>, drain_timeout: Duration) {
    if joinset.is_empty() {
        return;
    }
    debug!("Draining {} open connections", joinset.len());

    let drained = timeout(drain_timeout, async {
        while let Some(finished) = joinset.join_next().await {
            if let Err(e) = finished {
                if e.is_panic() {
                    error!("Connection handler panicked: {:?}", e);
                }
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(
            "Timed out after {drain_timeout:?} draining connections, aborting {} still open",
            joinset.len()
        );
        joinset.abort_all();
    }
}

async fn serve_connection(
    conn: TcpStream,
    mode: ListenerMode,
    state: Arc<ReceiverState>,
    cancel: CancellationToken,
) {
    let protocol = match mode {
        ListenerMode::Grpc => Protocol::Grpc,
        ListenerMode::Http => Protocol::Http,
        ListenerMode::Multiplexed => match sniff_protocol(&conn).await {
            Ok(protocol) => protocol,
            Err(e) => {
                debug!("Dropping connection before protocol detection: {e}");
                return;
            }
        },
    };
    let io = TokioIo::new(conn);

    match protocol {
        Protocol::Grpc => {
            let service = TowerToHyperService::new(state.grpc.clone());
            let conn = http2::Builder::new(TokioExecutor::new()).serve_connection(io, service);
            tokio::pin!(conn);
            let result = tokio::select! {
                res = conn.as_mut() => res,
                () = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                error!("gRPC connection error: {e}");
            }
        }
        Protocol::Http => {
            let pipeline = Arc::clone(&state.pipeline);
            let max_content_length = state.max_content_length;
            let service = service_fn(move |req| {
                http::handle_request(Arc::clone(&pipeline), max_content_length, req)
            });
            let conn = http1::Builder::new().serve_connection(io, service);
            tokio::pin!(conn);
            let result = tokio::select! {
                res = conn.as_mut() => res,
                () = cancel.cancelled() => {
                    conn.as_mut().graceful_shutdown();
                    conn.await
                }
            };
            if let Err(e) = result {
                error!("Connection error: {e}");
            }
        }
    }
}
