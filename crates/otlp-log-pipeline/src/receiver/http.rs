// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::{http, Method, Request, StatusCode};
use opentelemetry_proto::tonic::collector::logs::v1::{
    ExportLogsServiceRequest, ExportLogsServiceResponse,
};
use prost::Message;
use serde::Serialize;
use tracing::debug;

use crate::http_utils::{
    create_json_response, create_protobuf_response, log_and_create_http_response,
    verify_request_content_length, HttpResponse,
};
use crate::pipeline::{Pipeline, StatsSnapshot};
use crate::receiver::ingest;

pub const LOGS_ENDPOINT_PATH: &str = "/v1/logs";
pub const HEALTH_ENDPOINT_PATH: &str = "/health";

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(flatten)]
    stats: StatsSnapshot,
}

/// Routes one OTLP/HTTP request.
pub async fn handle_request<B>(
    pipeline: Arc<Pipeline>,
    max_content_length: usize,
    req: Request<B>,
) -> http::Result<HttpResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    match (req.method(), req.uri().path()) {
        (&Method::POST, LOGS_ENDPOINT_PATH) => {
            handle_logs(&pipeline, max_content_length, req).await
        }
        (_, LOGS_ENDPOINT_PATH) => log_and_create_http_response(
            &format!("{} not allowed on {LOGS_ENDPOINT_PATH}", req.method()),
            StatusCode::METHOD_NOT_ALLOWED,
        ),
        (&Method::GET, HEALTH_ENDPOINT_PATH) => create_json_response(
            &HealthResponse {
                status: "ok",
                stats: pipeline.stats().snapshot(),
            },
            StatusCode::OK,
        ),
        _ => log_and_create_http_response(
            &format!("Not found: {}", req.uri().path()),
            StatusCode::NOT_FOUND,
        ),
    }
}

async fn handle_logs<B>(
    pipeline: &Pipeline,
    max_content_length: usize,
    req: Request<B>,
) -> http::Result<HttpResponse>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    if let Some(response) =
        verify_request_content_length(req.headers(), max_content_length, "Error processing logs")
    {
        return response;
    }

    let body = match Limited::new(req.into_body(), max_content_length)
        .collect()
        .await
    {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.is::<LengthLimitError>() => {
            return log_and_create_http_response(
                "Error processing logs: Payload too large",
                StatusCode::PAYLOAD_TOO_LARGE,
            );
        }
        Err(e) => {
            return log_and_create_http_response(
                &format!("Error processing logs: Failed to read body: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let request = match ExportLogsServiceRequest::decode(body) {
        Ok(request) => request,
        Err(e) => {
            return log_and_create_http_response(
                &format!("Error processing logs: Failed to parse OTLP request: {e}"),
                StatusCode::BAD_REQUEST,
            );
        }
    };

    let count = ingest(pipeline, request);
    debug!("HTTP export processed {count} records");
    create_protobuf_response(
        ExportLogsServiceResponse::default().encode_to_vec(),
        StatusCode::OK,
    )
}
