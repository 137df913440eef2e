// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty, Full};
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use opentelemetry_proto::tonic::{
    collector::logs::v1::ExportLogsServiceRequest,
    common::v1::{any_value, AnyValue, KeyValue},
    logs::v1::{LogRecord, ResourceLogs, ScopeLogs},
    resource::v1::Resource,
};
use otlp_log_pipeline::Config;
use prost::Message;
use tokio::time::timeout;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
const GRPC_EXPORT_PATH: &str = "/opentelemetry.proto.collector.logs.v1.LogsService/Export";

/// Config bound to ephemeral localhost ports, writing into `dir`.
pub fn local_config(dir: &Path) -> Config {
    Config {
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        grpc_port: 0,
        http_port: 0,
        output_file: Some(output_path(dir)),
        output_flush_interval: Duration::from_secs(60),
        shutdown_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn output_path(dir: &Path) -> PathBuf {
    dir.join("processed.jsonl")
}

fn string_value(value: &str) -> Option<AnyValue> {
    Some(AnyValue {
        value: Some(any_value::Value::StringValue(value.to_string())),
    })
}

pub fn log_record(severity_number: i32, body: &str, attributes: &[(&str, &str)]) -> LogRecord {
    LogRecord {
        time_unix_nano: 1_700_000_000_123_456_789,
        severity_number,
        body: string_value(body),
        attributes: attributes
            .iter()
            .map(|(key, value)| KeyValue {
                key: key.to_string(),
                value: string_value(value),
            })
            .collect(),
        ..Default::default()
    }
}

/// One resource (`service.name=integration-test`) with one scope holding `records`.
pub fn export_request(records: Vec<LogRecord>) -> ExportLogsServiceRequest {
    ExportLogsServiceRequest {
        resource_logs: vec![ResourceLogs {
            resource: Some(Resource {
                attributes: vec![KeyValue {
                    key: "service.name".to_string(),
                    value: string_value("integration-test"),
                }],
                ..Default::default()
            }),
            scope_logs: vec![ScopeLogs {
                log_records: records,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// Send an HTTP/1.1 request over TCP and return the response
pub async fn send_tcp_request(
    addr: SocketAddr,
    uri: &str,
    method: &str,
    body: Option<Vec<u8>>,
) -> Result<Response<hyper::body::Incoming>, Box<dyn std::error::Error>> {
    let stream = timeout(REQUEST_TIMEOUT, tokio::net::TcpStream::connect(addr)).await??;

    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request_builder = Request::builder()
        .uri(uri)
        .method(method)
        .header("Host", addr.to_string())
        .header("Content-Type", "application/x-protobuf");

    let response = match body {
        Some(body_data) => {
            let request = request_builder
                .header("Content-Length", body_data.len().to_string())
                .body(Full::new(Bytes::from(body_data)).boxed())?;
            timeout(REQUEST_TIMEOUT, sender.send_request(request)).await??
        }
        None => {
            let request = request_builder
                .header("Content-Length", "0")
                .body(Empty::<Bytes>::new().boxed())?;
            timeout(REQUEST_TIMEOUT, sender.send_request(request)).await??
        }
    };

    Ok(response)
}

/// Sends one length-prefixed gRPC message to the logs Export method over HTTP/2.
/// Returns the `grpc-status` from the headers or, failing that, the trailers.
pub async fn send_grpc_frame(
    addr: SocketAddr,
    message: &[u8],
) -> Result<Option<HeaderValue>, Box<dyn std::error::Error>> {
    let stream = timeout(REQUEST_TIMEOUT, tokio::net::TcpStream::connect(addr)).await??;
    let (mut sender, conn) =
        hyper::client::conn::http2::handshake(TokioExecutor::new(), TokioIo::new(stream))
            .await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let length = u32::try_from(message.len())?;
    let mut frame = vec![0u8];
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(message);

    let request = Request::builder()
        .method("POST")
        .uri(format!("http://{addr}{GRPC_EXPORT_PATH}"))
        .header("content-type", "application/grpc")
        .header("te", "trailers")
        .body(Full::new(Bytes::from(frame)))?;
    let response = timeout(REQUEST_TIMEOUT, sender.send_request(request)).await??;

    let status = response.headers().get("grpc-status").cloned();
    let body = timeout(REQUEST_TIMEOUT, response.into_body().collect()).await??;
    Ok(status.or_else(|| {
        body.trailers()
            .and_then(|trailers| trailers.get("grpc-status"))
            .cloned()
    }))
}

pub async fn post_logs(
    addr: SocketAddr,
    request: &ExportLogsServiceRequest,
) -> (StatusCode, Bytes) {
    let response = send_tcp_request(addr, "/v1/logs", "POST", Some(request.encode_to_vec()))
        .await
        .expect("request failed");
    let status = response.status();
    (status, read_body(response).await)
}

pub async fn read_body(response: Response<hyper::body::Incoming>) -> Bytes {
    response
        .into_body()
        .collect()
        .await
        .expect("failed to read body")
        .to_bytes()
}

/// Parses every line of an NDJSON file.
pub fn read_ndjson(path: &Path) -> Vec<serde_json::Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|line| serde_json::from_str(line).expect("invalid JSON line"))
        .collect()
}
